use std::borrow::Cow;
use std::collections::HashSet;
use std::io::{BufRead, Write};

use thiserror::Error;

/// Column order of the persisted report.
const HEADER: [&str; 6] = [
    "crit_posted_at",
    "crit_edited_at",
    "crit_author",
    "crit_words",
    "crit_url",
    "block_url",
];

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed report header: {0}")]
    MalformedHeader(String),

    #[error("malformed report row at line {line}: {reason}")]
    MalformedRow { line: usize, reason: String },
}

/// A single row of the critique report.
///
/// `crit_url` is the natural key. A word count of zero marks a
/// critique that could not be resolved, usually because it was deleted
/// or hidden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub crit_posted_at: Option<String>,
    pub crit_edited_at: Option<String>,
    pub crit_author: Option<String>,
    pub crit_words: u32,
    pub crit_url: String,
    pub block_url: String,
}

impl Row {
    /// A fresh, unresolved row carrying only its URL identity.
    pub fn new(crit_url: String, block_url: String) -> Self {
        Self {
            crit_posted_at: None,
            crit_edited_at: None,
            crit_author: None,
            crit_words: 0,
            crit_url,
            block_url,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.crit_words > 0
    }
}

/// The report row store: an ordered list of rows with URL-keyed
/// lookup, CSV persistence and idempotent merging.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Database {
    pub rows: Vec<Row>,
}

impl Database {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// Write the report as headered CSV. Returns the number of lines
    /// written, header included.
    pub fn dump<W: Write>(&self, out: &mut W) -> Result<usize, DatabaseError> {
        writeln!(out, "{}", HEADER.join(","))?;

        for row in &self.rows {
            let words = row.crit_words.to_string();
            let fields = [
                row.crit_posted_at.as_deref().unwrap_or(""),
                row.crit_edited_at.as_deref().unwrap_or(""),
                row.crit_author.as_deref().unwrap_or(""),
                words.as_str(),
                row.crit_url.as_str(),
                row.block_url.as_str(),
            ];
            let line = fields
                .iter()
                .map(|field| escape(field))
                .collect::<Vec<_>>()
                .join(",");
            writeln!(out, "{line}")?;
        }

        Ok(self.rows.len() + 1)
    }

    /// Reconstruct a report from headered CSV. Columns are looked up
    /// by name, so their order does not matter.
    pub fn load<R: BufRead>(input: R) -> Result<Self, DatabaseError> {
        let mut lines = input.lines();
        let header = lines
            .next()
            .ok_or_else(|| DatabaseError::MalformedHeader("empty file".into()))??;
        let columns =
            split_record(&header).map_err(DatabaseError::MalformedHeader)?;

        let column = |name: &str| {
            columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| DatabaseError::MalformedHeader(format!("missing column {name:?}")))
        };
        let posted_at = column("crit_posted_at")?;
        let edited_at = column("crit_edited_at")?;
        let author = column("crit_author")?;
        let words = column("crit_words")?;
        let crit_url = column("crit_url")?;
        let block_url = column("block_url")?;

        let mut rows = Vec::new();
        for (n, line) in lines.enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }

            let malformed = |reason: String| DatabaseError::MalformedRow {
                line: n + 2,
                reason,
            };
            let fields = split_record(&line).map_err(malformed)?;
            if fields.len() != columns.len() {
                return Err(malformed(format!(
                    "expected {} fields, found {}",
                    columns.len(),
                    fields.len()
                )));
            }

            let optional = |i: usize| {
                let value = &fields[i];
                (!value.is_empty()).then(|| value.clone())
            };
            let required = |i: usize| {
                let value = &fields[i];
                if value.is_empty() {
                    Err(malformed(format!("empty {:?}", columns[i])))
                } else {
                    Ok(value.clone())
                }
            };

            rows.push(Row {
                crit_posted_at: optional(posted_at),
                crit_edited_at: optional(edited_at),
                crit_author: optional(author),
                crit_words: fields[words]
                    .parse()
                    .map_err(|_| malformed(format!("bad word count {:?}", fields[words])))?,
                crit_url: required(crit_url)?,
                block_url: required(block_url)?,
            });
        }

        Ok(Self { rows })
    }

    /// Drop rows with an already-seen critique URL, keeping the first
    /// occurrence in the original order.
    pub fn deduplicate(&mut self) {
        let mut seen = HashSet::new();
        self.rows.retain(|row| seen.insert(row.crit_url.clone()));
    }

    /// Merge a freshly built row in, keyed by critique URL.
    ///
    /// A resolved incoming row replaces whatever is stored under its
    /// URL; an unresolved one never clobbers an existing row. Unknown
    /// URLs append. Re-running the pipeline is therefore idempotent.
    pub fn merge_row(&mut self, row: Row) {
        match self
            .rows
            .iter_mut()
            .find(|stored| stored.crit_url == row.crit_url)
        {
            Some(stored) => {
                if row.is_resolved() {
                    *stored = row;
                }
            }
            None => self.rows.push(row),
        }
    }

    pub fn merge(&mut self, fresh: Database) {
        for row in fresh.rows {
            self.merge_row(row);
        }
    }

    pub fn total_critiques(&self) -> usize {
        self.rows.len()
    }

    pub fn valid_critiques(&self) -> usize {
        self.rows.iter().filter(|row| row.is_resolved()).count()
    }

    pub fn deleted_critiques(&self) -> usize {
        self.total_critiques() - self.valid_critiques()
    }
}

fn escape(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

fn split_record(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
        } else {
            match c {
                ',' => fields.push(std::mem::take(&mut field)),
                '"' if field.is_empty() => in_quotes = true,
                '"' => return Err("stray quote in unquoted field".into()),
                _ => field.push(c),
            }
        }
    }

    if in_quotes {
        return Err("unterminated quoted field".into());
    }
    fields.push(field);

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::{BufReader, Cursor};

    fn resolved_row(url: &str) -> Row {
        Row {
            crit_posted_at: Some("2026-01-04T13:11:11-0800".into()),
            crit_edited_at: None,
            crit_author: Some("somebody".into()),
            crit_words: 250,
            crit_url: url.into(),
            block_url: "https://www.deviantart.com/comments/1/99/1".into(),
        }
    }

    fn stub_row(url: &str) -> Row {
        Row::new(
            url.into(),
            "https://www.deviantart.com/comments/1/99/1".into(),
        )
    }

    #[test]
    fn dump_reports_rows_plus_header() {
        let data = Database::new(vec![
            resolved_row("https://www.deviantart.com/comments/1/10/100"),
            stub_row("https://www.deviantart.com/comments/1/10/101"),
        ]);

        let mut out = Vec::new();
        let written = data.dump(&mut out).unwrap();

        assert_eq!(written, 3);
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with(
            "crit_posted_at,crit_edited_at,crit_author,crit_words,crit_url,block_url\n"
        ));
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn dump_then_load_round_trips() {
        let data = Database::new(vec![
            resolved_row("https://www.deviantart.com/comments/1/10/100"),
            stub_row("https://www.deviantart.com/comments/1/10/101"),
        ]);

        let mut out = Vec::new();
        data.dump(&mut out).unwrap();
        let loaded = Database::load(Cursor::new(out)).unwrap();

        assert_eq!(loaded, data);
    }

    #[test]
    fn fields_with_separators_round_trip() {
        let mut row = resolved_row("https://www.deviantart.com/comments/1/10/100");
        row.crit_author = Some(r#"a,b "quoted" c"#.into());
        let data = Database::new(vec![row]);

        let mut out = Vec::new();
        data.dump(&mut out).unwrap();
        let loaded = Database::load(Cursor::new(out)).unwrap();

        assert_eq!(loaded, data);
    }

    #[test]
    fn load_is_keyed_by_header_not_position() {
        let text = "crit_url,block_url,crit_words,crit_author,crit_posted_at,crit_edited_at\n\
            https://a/comments/1/2/3,https://a/comments/1/9/9,42,alice,2026-01-04T13:11:11-0800,\n";

        let loaded = Database::load(Cursor::new(text)).unwrap();

        assert_eq!(loaded.rows.len(), 1);
        let row = &loaded.rows[0];
        assert_eq!(row.crit_words, 42);
        assert_eq!(row.crit_author.as_deref(), Some("alice"));
        assert_eq!(row.crit_edited_at, None);
        assert_eq!(row.crit_url, "https://a/comments/1/2/3");
    }

    #[test]
    fn malformed_reports_fail_to_load() {
        let missing_column = "crit_posted_at,crit_edited_at,crit_author,crit_words,crit_url\n";
        let bad_words =
            "crit_posted_at,crit_edited_at,crit_author,crit_words,crit_url,block_url\n\
            ,,,many,https://a/comments/1/2/3,https://a/comments/1/9/9\n";
        let short_row =
            "crit_posted_at,crit_edited_at,crit_author,crit_words,crit_url,block_url\n\
            ,,0,https://a/comments/1/2/3\n";

        assert!(matches!(
            Database::load(Cursor::new(missing_column)),
            Err(DatabaseError::MalformedHeader(_))
        ));
        assert!(matches!(
            Database::load(Cursor::new(bad_words)),
            Err(DatabaseError::MalformedRow { line: 2, .. })
        ));
        assert!(matches!(
            Database::load(Cursor::new(short_row)),
            Err(DatabaseError::MalformedRow { line: 2, .. })
        ));
        assert!(matches!(
            Database::load(Cursor::new("")),
            Err(DatabaseError::MalformedHeader(_))
        ));
    }

    #[test]
    fn deduplicate_keeps_the_first_occurrence() {
        let first = resolved_row("https://a/comments/1/2/3");
        let mut data = Database::new(vec![
            first.clone(),
            stub_row("https://a/comments/1/2/3"),
            stub_row("https://a/comments/1/2/4"),
            stub_row("https://a/comments/1/2/4"),
        ]);

        data.deduplicate();

        assert_eq!(data.rows.len(), 2);
        assert_eq!(data.rows[0], first);
        let urls: HashSet<_> = data.rows.iter().map(|r| r.crit_url.clone()).collect();
        assert_eq!(urls.len(), data.rows.len());
    }

    #[test]
    fn totals_add_up() {
        let data = Database::new(vec![
            resolved_row("https://a/comments/1/2/3"),
            stub_row("https://a/comments/1/2/4"),
            stub_row("https://a/comments/1/2/5"),
        ]);

        assert_eq!(data.total_critiques(), 3);
        assert_eq!(data.valid_critiques(), 1);
        assert_eq!(data.deleted_critiques(), 2);
        assert_eq!(
            data.total_critiques(),
            data.valid_critiques() + data.deleted_critiques()
        );
    }

    #[test]
    fn stubs_never_clobber_resolved_rows() {
        let resolved = resolved_row("https://a/comments/1/2/3");
        let mut data = Database::new(vec![resolved.clone()]);

        data.merge_row(stub_row("https://a/comments/1/2/3"));

        assert_eq!(data.rows, vec![resolved]);
    }

    #[test]
    fn resolutions_replace_stubs_in_place() {
        let mut data = Database::new(vec![
            stub_row("https://a/comments/1/2/3"),
            stub_row("https://a/comments/1/2/4"),
        ]);

        let resolved = resolved_row("https://a/comments/1/2/3");
        data.merge_row(resolved.clone());

        assert_eq!(data.rows[0], resolved);
        assert_eq!(data.rows.len(), 2);
    }

    #[test]
    fn unknown_urls_append_on_merge() {
        let mut data = Database::new(vec![stub_row("https://a/comments/1/2/3")]);

        data.merge(Database::new(vec![stub_row("https://a/comments/1/2/4")]));

        assert_eq!(data.rows.len(), 2);
    }

    #[test]
    fn reports_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("critmas.csv");
        let data = Database::new(vec![resolved_row("https://a/comments/1/2/3")]);

        let mut file = File::create(&path).unwrap();
        data.dump(&mut file).unwrap();
        drop(file);

        let loaded = Database::load(BufReader::new(File::open(&path).unwrap())).unwrap();
        assert_eq!(loaded, data);
    }
}
