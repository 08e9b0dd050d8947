use std::collections::HashMap;

use crate::comment::Comment;

/// Run-scoped lookup table of fetched comments, keyed by comment ID.
///
/// Comment IDs are globally unique, so if the same ID somehow shows up
/// twice the last write wins.
#[derive(Debug, Default)]
pub struct Cache {
    entries: HashMap<u64, Comment>,
}

impl Cache {
    pub fn from_comments<I>(comments: I) -> Self
    where
        I: IntoIterator<Item = Comment>,
    {
        Self {
            entries: comments
                .into_iter()
                .map(|comment| (comment.id, comment))
                .collect(),
        }
    }

    pub fn find(&self, comment_id: u64) -> Option<&Comment> {
        self.entries.get(&comment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comment::tests::draft_comment;
    use crate::comment::Comment;

    fn comment(id: u64, words: u32) -> Comment {
        Comment::parse(draft_comment(id, 123, 1, "2026-01-04T13:11:11-0800", "x", words))
            .unwrap()
    }

    #[test]
    fn comments_are_found_by_id() {
        let cache = Cache::from_comments([comment(1, 10), comment(2, 20)]);

        assert_eq!(cache.find(1).map(|c| c.words), Some(10));
        assert_eq!(cache.find(2).map(|c| c.words), Some(20));
        assert!(cache.find(3).is_none());
    }

    #[test]
    fn duplicate_ids_keep_the_last_comment() {
        let cache = Cache::from_comments([comment(1, 10), comment(1, 99)]);

        assert_eq!(cache.find(1).map(|c| c.words), Some(99));
    }
}
