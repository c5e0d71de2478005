//! Bulk loading of voting records.
//!
//! A dataset is one JSON document with `blocks`, `legislators`, `issues` and
//! `votes` arrays (see [`Dataset`]). Everything is written in a single
//! transaction: either the whole file lands or nothing does. Rows are upserted
//! by id, so reloading a corrected file is safe.
//!
//! Before any vote is written, its issue and legislator are resolved against
//! the database (including rows inserted earlier in the same load), so a bad
//! reference fails with an error naming the row instead of a bare foreign-key
//! violation.

use anyhow::Context;
use chrono::{Datelike, NaiveDate, NaiveTime};
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::models::{Dataset, Issue};

const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%Y-%m-%d"];

#[derive(Debug, Default, Clone, Serialize)]
pub struct LoadReport {
    pub blocks: usize,
    pub legislators: usize,
    pub issues: usize,
    pub votes: usize,
}

pub async fn load_file(pool: &SqlitePool, path: &Path) -> anyhow::Result<LoadReport> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset: {}", path.display()))?;
    let dataset: Dataset = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse dataset: {}", path.display()))?;
    Ok(load_dataset(pool, &dataset).await?)
}

pub async fn load_dataset(pool: &SqlitePool, dataset: &Dataset) -> Result<LoadReport> {
    let mut tx = pool.begin().await?;
    let mut report = LoadReport::default();

    for block in &dataset.blocks {
        let name = required(&block.name, "name", "blocks", block.id)?;
        sqlx::query(
            "INSERT INTO blocks (id, chamber, name, description, active) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                chamber = excluded.chamber, name = excluded.name,
                description = excluded.description, active = excluded.active",
        )
        .bind(block.id)
        .bind(block.chamber.as_str())
        .bind(name)
        .bind(optional(&block.description))
        .bind(block.active)
        .execute(&mut *tx)
        .await?;
        report.blocks += 1;
    }

    let blocks = chambers_by_id(&mut tx, "blocks").await?;
    for legislator in &dataset.legislators {
        let name = required(&legislator.name, "name", "legislators", legislator.id)?;
        let district = required(&legislator.district, "district", "legislators", legislator.id)?;
        if let Some(block_id) = legislator.block_id {
            if !blocks.contains_key(&block_id) {
                return Err(Error::Ingest(format!(
                    "legislators row {} references unknown block {}",
                    legislator.id, block_id
                )));
            }
        }
        sqlx::query(
            "INSERT INTO legislators (id, chamber, name, district, block_id, gender, image_url)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                chamber = excluded.chamber, name = excluded.name, district = excluded.district,
                block_id = excluded.block_id, gender = excluded.gender, image_url = excluded.image_url",
        )
        .bind(legislator.id)
        .bind(legislator.chamber.as_str())
        .bind(name)
        .bind(district)
        .bind(legislator.block_id)
        .bind(optional(&legislator.gender))
        .bind(optional(&legislator.image_url))
        .execute(&mut *tx)
        .await?;
        report.legislators += 1;
    }

    for issue in &dataset.issues {
        insert_issue(&mut tx, issue).await?;
        report.issues += 1;
    }

    let legislators = chambers_by_id(&mut tx, "legislators").await?;
    let issues = chambers_by_id(&mut tx, "issues").await?;
    for vote in &dataset.votes {
        let issue_chamber = issues.get(&vote.issue_id).ok_or_else(|| {
            Error::Ingest(format!(
                "vote by legislator {} references unknown issue {}",
                vote.legislator_id, vote.issue_id
            ))
        })?;
        let legislator_chamber = legislators.get(&vote.legislator_id).ok_or_else(|| {
            Error::Ingest(format!(
                "vote on issue {} references unknown legislator {}",
                vote.issue_id, vote.legislator_id
            ))
        })?;
        if issue_chamber != legislator_chamber {
            return Err(Error::Ingest(format!(
                "vote on issue {} ({}) by legislator {} ({}) crosses chambers",
                vote.issue_id, issue_chamber, vote.legislator_id, legislator_chamber
            )));
        }
        if let Some(block_id) = vote.block_id {
            if !blocks.contains_key(&block_id) {
                return Err(Error::Ingest(format!(
                    "vote on issue {} references unknown block {}",
                    vote.issue_id, block_id
                )));
            }
        }

        sqlx::query(
            "INSERT INTO votes (issue_id, legislator_id, block_id, choice) VALUES (?, ?, ?, ?)
             ON CONFLICT(issue_id, legislator_id) DO UPDATE SET
                block_id = excluded.block_id, choice = excluded.choice",
        )
        .bind(vote.issue_id)
        .bind(vote.legislator_id)
        .bind(vote.block_id)
        .bind(vote.choice.as_str())
        .execute(&mut *tx)
        .await?;
        report.votes += 1;
    }

    tx.commit().await?;
    tracing::info!(
        blocks = report.blocks,
        legislators = report.legislators,
        issues = report.issues,
        votes = report.votes,
        "dataset loaded"
    );
    Ok(report)
}

async fn insert_issue(tx: &mut Transaction<'_, Sqlite>, issue: &Issue) -> Result<()> {
    let session = required(&issue.session, "session", "issues", issue.id)?;
    let summary = required(&issue.summary, "summary", "issues", issue.id)?;
    let voted_on = parse_date(&issue.voted_on).ok_or_else(|| {
        Error::Ingest(format!(
            "issues row {}: unrecognized date '{}' (expected DD/MM/YYYY or YYYY-MM-DD)",
            issue.id, issue.voted_on
        ))
    })?;
    let voted_at = match optional(&issue.voted_at) {
        Some(t) => Some(
            NaiveTime::parse_from_str(t, "%H:%M:%S")
                .map_err(|_| {
                    Error::Ingest(format!(
                        "issues row {}: unrecognized time '{}' (expected HH:MM:SS)",
                        issue.id, t
                    ))
                })?
                .format("%H:%M:%S")
                .to_string(),
        ),
        None => None,
    };

    sqlx::query(
        "INSERT INTO issues (id, chamber, session, summary, title, voted_on, year, voted_at,
                             base, majority, result, president,
                             present, absent, abstentions, affirmative, negative)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            chamber = excluded.chamber, session = excluded.session, summary = excluded.summary,
            title = excluded.title, voted_on = excluded.voted_on, year = excluded.year,
            voted_at = excluded.voted_at, base = excluded.base, majority = excluded.majority,
            result = excluded.result, president = excluded.president, present = excluded.present,
            absent = excluded.absent, abstentions = excluded.abstentions,
            affirmative = excluded.affirmative, negative = excluded.negative",
    )
    .bind(issue.id)
    .bind(issue.chamber.as_str())
    .bind(session)
    .bind(summary)
    .bind(optional(&issue.title))
    .bind(voted_on.format("%Y-%m-%d").to_string())
    .bind(voted_on.year())
    .bind(voted_at)
    .bind(optional(&issue.base))
    .bind(optional(&issue.majority))
    .bind(optional(&issue.result))
    .bind(optional(&issue.president))
    .bind(issue.present)
    .bind(issue.absent)
    .bind(issue.abstentions)
    .bind(issue.affirmative)
    .bind(issue.negative)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// `id → chamber` for every row currently visible in `table`.
async fn chambers_by_id(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
) -> Result<HashMap<i64, String>> {
    let rows: Vec<(i64, String)> = sqlx::query_as(&format!("SELECT id, chamber FROM {}", table))
        .fetch_all(&mut **tx)
        .await?;
    Ok(rows.into_iter().collect())
}

/// Parse a source date in any accepted format.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
}

fn required<'a>(value: &'a str, field: &str, table: &str, id: i64) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::Ingest(format!(
            "{} row {}: missing required field '{}'",
            table, id, field
        )));
    }
    Ok(trimmed)
}

fn optional(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn pool() -> (TempDir, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("test.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::migrate(&pool).await.unwrap();
        (tmp, pool)
    }

    fn dataset(votes: &str) -> Dataset {
        serde_json::from_str(&format!(
            r#"{{
                "blocks": [{{"id": 1, "chamber": "deputies", "name": "Frente", "description": "  "}}],
                "legislators": [
                    {{"id": 10, "chamber": "deputies", "name": "Ana Pérez", "district": "Salta", "block_id": 1}},
                    {{"id": 20, "chamber": "senators", "name": "Luis Gómez", "district": "Jujuy"}}
                ],
                "issues": [
                    {{"id": 100, "chamber": "deputies", "session": "5", "summary": "Presupuesto",
                      "voted_on": "17/11/2022", "voted_at": "23:05:00", "affirmative": 1}}
                ],
                "votes": {}
            }}"#,
            votes
        ))
        .unwrap()
    }

    #[test]
    fn test_parse_date_formats() {
        assert_eq!(parse_date("17/11/2022"), NaiveDate::from_ymd_opt(2022, 11, 17));
        assert_eq!(parse_date("2022-11-17"), NaiveDate::from_ymd_opt(2022, 11, 17));
        assert_eq!(parse_date("Nov 17 2022"), None);
    }

    #[tokio::test]
    async fn test_load_normalizes_and_derives_year() {
        let (_tmp, pool) = pool().await;
        let report = load_dataset(
            &pool,
            &dataset(r#"[{"issue_id": 100, "legislator_id": 10, "block_id": 1, "choice": "AFIRMATIVO"}]"#),
        )
        .await
        .unwrap();
        assert_eq!(report.votes, 1);

        let (voted_on, year): (String, i64) =
            sqlx::query_as("SELECT voted_on, year FROM issues WHERE id = 100")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(voted_on, "2022-11-17");
        assert_eq!(year, 2022);

        let (description,): (Option<String>,) =
            sqlx::query_as("SELECT description FROM blocks WHERE id = 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(description.is_none());

        let (choice,): (String,) = sqlx::query_as("SELECT choice FROM votes")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(choice, "affirmative");
    }

    #[tokio::test]
    async fn test_reload_upserts() {
        let (_tmp, pool) = pool().await;
        let votes = r#"[{"issue_id": 100, "legislator_id": 10, "choice": 0}]"#;
        load_dataset(&pool, &dataset(votes)).await.unwrap();
        load_dataset(
            &pool,
            &dataset(r#"[{"issue_id": 100, "legislator_id": 10, "choice": 1}]"#),
        )
        .await
        .unwrap();

        let rows: Vec<(String,)> = sqlx::query_as("SELECT choice FROM votes")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(rows, vec![("negative".to_string(),)]);
    }

    #[tokio::test]
    async fn test_dangling_vote_rolls_back_everything() {
        let (_tmp, pool) = pool().await;
        let err = load_dataset(
            &pool,
            &dataset(r#"[{"issue_id": 999, "legislator_id": 10, "choice": 0}]"#),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("unknown issue 999"), "{}", err);

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM legislators")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_cross_chamber_vote_rejected() {
        let (_tmp, pool) = pool().await;
        let err = load_dataset(
            &pool,
            &dataset(r#"[{"issue_id": 100, "legislator_id": 20, "choice": 0}]"#),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Ingest(ref m) if m.contains("crosses chambers")));
    }

    #[tokio::test]
    async fn test_bad_date_rejected() {
        let (_tmp, pool) = pool().await;
        let mut data = dataset("[]");
        data.issues[0].voted_on = "sometime".to_string();
        let err = load_dataset(&pool, &data).await.unwrap_err();
        assert!(err.to_string().contains("sometime"));
    }
}
