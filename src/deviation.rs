use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

// Captures the artist, the category and the trailing numeric ID of a
// deviation page URL. The host is not pinned: mirrors and staging
// domains serve the same path scheme.
static DEVIATION_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://[^/]+/([A-Za-z0-9\-]+)/([a-z\-]+)/(?:.+-)?(\d+)$").unwrap()
});

#[derive(Debug, Error)]
pub enum DeviationError {
    #[error("{0:?}: invalid deviation URL")]
    InvalidUrl(String),
}

/// A single deviation, identified from its page URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deviation {
    pub artist: String,
    pub category: String,
    pub id: u64,
}

impl Deviation {
    /// Parse a deviation page URL into its identity.
    pub fn from_url(url: &str) -> Result<Self, DeviationError> {
        let caps = DEVIATION_URL_RE
            .captures(url)
            .ok_or_else(|| DeviationError::InvalidUrl(url.to_string()))?;

        let id = caps[3]
            .parse()
            .map_err(|_| DeviationError::InvalidUrl(url.to_string()))?;

        Ok(Self {
            artist: caps[1].to_string(),
            category: caps[2].to_string(),
            id,
        })
    }

    /// The type ID the comments API expects for this deviation.
    ///
    /// Only art and journal pages are recognized for the time being;
    /// anything else maps to zero.
    pub fn type_id(&self) -> u64 {
        match self.category.as_str() {
            "art" | "journal" => 1,
            _ => 0,
        }
    }
}
