use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinSet;
use tracing::warn;

use crate::cache::Cache;
use crate::cli::Args;
use crate::client::Client;
use crate::comment::{self, Comment, CommentUrl};
use crate::database::{Database, Row};
use crate::deviation::Deviation;

/// A journal comment ("block") together with the deduplicated critique
/// links found in its body, in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub block_url: CommentUrl,
    pub crit_urls: Vec<CommentUrl>,
}

/// Keep only the journal comments that contain critique links.
pub fn identify_critique_batches(comments: &[Comment]) -> Vec<Batch> {
    comments
        .iter()
        .filter_map(|comment| {
            let crit_urls = comment::extract_comment_urls(&comment.body);
            (!crit_urls.is_empty()).then(|| Batch {
                block_url: comment.url(),
                crit_urls,
            })
        })
        .collect()
}

/// The unique deviations referenced by critique links, minus the
/// journal itself and minus links in `skip`, as item ID → type ID.
pub fn unique_targets(
    batches: &[Batch],
    journal_id: u64,
    skip: &HashSet<String>,
) -> BTreeMap<u64, u64> {
    let mut targets = BTreeMap::new();

    for batch in batches {
        for url in &batch.crit_urls {
            if url.item_id == journal_id || skip.contains(&url.to_string()) {
                continue;
            }
            targets.entry(url.item_id).or_insert(url.type_id);
        }
    }

    targets
}

fn enrich_row(row: &mut Row, entry: &Comment) {
    row.crit_posted_at = Some(
        entry
            .posted_at
            .format(comment::TIMESTAMP_FORMAT)
            .to_string(),
    );
    row.crit_edited_at = entry
        .edited_at
        .map(|at| at.format(comment::TIMESTAMP_FORMAT).to_string());
    row.crit_author = Some(entry.author.clone());
    row.crit_words = entry.words;
}

/// Build report rows for every critique link, enriched from the cache
/// where the critique was found. Links that missed the cache stay as
/// URL-only stubs; the critique was likely deleted or hidden.
pub fn populate_database(batches: &[Batch], cache: &Cache) -> Database {
    let mut rows = Vec::new();

    for batch in batches {
        for url in &batch.crit_urls {
            let mut row = Row::new(url.to_string(), batch.block_url.to_string());

            if let Some(entry) = cache.find(url.comment_id) {
                enrich_row(&mut row, entry);
            }

            rows.push(row);
        }
    }

    Database::new(rows)
}

/// Load a previous report, treating a missing or unreadable file as an
/// empty starting state.
pub fn load_report(path: &Path) -> Database {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("could not read {}: {err}; starting fresh", path.display());
            }
            return Database::default();
        }
    };

    match Database::load(BufReader::new(file)) {
        Ok(data) => data,
        Err(err) => {
            warn!("{}: {err}; starting fresh", path.display());
            Database::default()
        }
    }
}

fn spinner(msg: &'static str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_message(msg);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Concurrently fetch the recent comments of every target deviation.
///
/// One task per deviation; pages within a task stay sequential because
/// of the pagination cursor. The first failing task aborts all of its
/// siblings: a partial cache would silently under-report critiques
/// during reconciliation.
async fn fetch_target_comments(
    targets: BTreeMap<u64, u64>,
    start_date: DateTime<FixedOffset>,
    client: &Client,
) -> Result<Vec<Comment>> {
    let pb = ProgressBar::new(targets.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {pos}/{len} deviations")?
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    let mut tasks = JoinSet::new();
    for (item_id, type_id) in targets {
        let client = client.clone();
        tasks.spawn(async move {
            comment::fetch_comments_until(item_id, type_id, &client, |c| {
                c.posted_at >= start_date
            })
            .await
        });
    }

    let mut comments = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(fetched)) => {
                comments.extend(fetched);
                pb.inc(1);
            }
            Ok(Err(err)) => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                pb.finish_and_clear();
                return Err(err.into());
            }
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                pb.finish_and_clear();
                return Err(anyhow!("comment fetch task failed: {err}"));
            }
        }
    }

    pb.finish_and_clear();
    Ok(comments)
}

/// Run the whole pipeline: walk the journal thread, fan out over the
/// referenced deviations, and reconcile the results into the report.
pub async fn run(
    args: &Args,
    start_date: DateTime<FixedOffset>,
    client: &Client,
) -> Result<Database> {
    let journal = Deviation::from_url(&args.journal)?;

    let pb = spinner("Fetching journal comments...");
    let journal_comments =
        comment::fetch_comments_until(journal.id, journal.type_id(), client, |_| true).await?;
    pb.finish_and_clear();

    let batches = identify_critique_batches(&journal_comments);
    let mut report = load_report(&args.report);

    let skip: HashSet<String> = if args.recheck {
        HashSet::new()
    } else {
        report
            .rows
            .iter()
            .filter(|row| row.is_resolved())
            .map(|row| row.crit_url.clone())
            .collect()
    };

    let targets = unique_targets(&batches, journal.id, &skip);
    let fetched = fetch_target_comments(targets, start_date, client).await?;
    let cache = Cache::from_comments(fetched);

    report.merge(populate_database(&batches, &cache));
    report.deduplicate();

    if args.recheck {
        recheck_unresolved(&mut report, client).await?;
    }

    Ok(report)
}

/// Point-lookup every row still unresolved after reconciliation.
///
/// The date-bounded fan-out never sees critiques posted before the
/// start date, so rechecking walks their threads directly. A critique
/// that is genuinely gone keeps its stub row.
async fn recheck_unresolved(report: &mut Database, client: &Client) -> Result<()> {
    let unresolved: Vec<CommentUrl> = report
        .rows
        .iter()
        .filter(|row| !row.is_resolved())
        .filter_map(|row| row.crit_url.parse().ok())
        .collect();
    if unresolved.is_empty() {
        return Ok(());
    }

    let pb = ProgressBar::new(unresolved.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {pos}/{len} rechecked")?
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    for url in unresolved {
        match comment::resolve_comment(&url, client).await {
            Ok(entry) => {
                let key = url.to_string();
                if let Some(row) = report.rows.iter_mut().find(|row| row.crit_url == key) {
                    enrich_row(row, &entry);
                }
            }
            Err(comment::CommentError::NotFound { .. }) => {}
            Err(err) => {
                pb.finish_and_clear();
                return Err(err.into());
            }
        }
        pb.inc(1);
    }

    pb.finish_and_clear();
    Ok(())
}
