use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the relational schema and the semantic index tables.
///
/// Every statement is idempotent.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS blocks (
            id INTEGER PRIMARY KEY,
            chamber TEXT NOT NULL CHECK (chamber IN ('deputies', 'senators')),
            name TEXT NOT NULL,
            description TEXT,
            active INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS legislators (
            id INTEGER PRIMARY KEY,
            chamber TEXT NOT NULL CHECK (chamber IN ('deputies', 'senators')),
            name TEXT NOT NULL,
            district TEXT NOT NULL,
            block_id INTEGER,
            gender TEXT,
            image_url TEXT,
            FOREIGN KEY (block_id) REFERENCES blocks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS issues (
            id INTEGER PRIMARY KEY,
            chamber TEXT NOT NULL CHECK (chamber IN ('deputies', 'senators')),
            session TEXT NOT NULL,
            summary TEXT NOT NULL,
            title TEXT,
            voted_on TEXT NOT NULL,
            year INTEGER NOT NULL,
            voted_at TEXT,
            base TEXT,
            majority TEXT,
            result TEXT,
            president TEXT,
            present INTEGER NOT NULL DEFAULT 0,
            absent INTEGER NOT NULL DEFAULT 0,
            abstentions INTEGER NOT NULL DEFAULT 0,
            affirmative INTEGER NOT NULL DEFAULT 0,
            negative INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS votes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            issue_id INTEGER NOT NULL,
            legislator_id INTEGER NOT NULL,
            block_id INTEGER,
            choice TEXT NOT NULL CHECK (choice IN ('affirmative', 'negative', 'abstention', 'absent', 'president')),
            UNIQUE(issue_id, legislator_id),
            FOREIGN KEY (issue_id) REFERENCES issues(id),
            FOREIGN KEY (legislator_id) REFERENCES legislators(id),
            FOREIGN KEY (block_id) REFERENCES blocks(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Semantic index: a collection name points at one generation of records.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            dims INTEGER NOT NULL,
            distance TEXT NOT NULL,
            generation TEXT NOT NULL,
            record_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS semantic_records (
            id INTEGER PRIMARY KEY,
            generation TEXT NOT NULL,
            key TEXT NOT NULL,
            text TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB NOT NULL,
            UNIQUE (generation, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Keyword index over record text, kept in step by triggers.
    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='semantic_records_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE semantic_records_fts USING fts5(
                text,
                content='semantic_records',
                content_rowid='id'
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS semantic_records_ai AFTER INSERT ON semantic_records BEGIN
            INSERT INTO semantic_records_fts(rowid, text) VALUES (new.id, new.text);
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS semantic_records_ad AFTER DELETE ON semantic_records BEGIN
            INSERT INTO semantic_records_fts(semantic_records_fts, rowid, text)
            VALUES ('delete', old.id, old.text);
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS semantic_records_au AFTER UPDATE ON semantic_records BEGIN
            INSERT INTO semantic_records_fts(semantic_records_fts, rowid, text)
            VALUES ('delete', old.id, old.text);
            INSERT INTO semantic_records_fts(rowid, text) VALUES (new.id, new.text);
        END
        "#,
    )
    .execute(pool)
    .await?;

    // One row per collection being rebuilt, shared by every process on this file.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rebuild_leases (
            name TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            acquired_at INTEGER NOT NULL,
            renewed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_legislators_chamber ON legislators(chamber)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_issues_chamber_date ON issues(chamber, voted_on)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_votes_issue ON votes(issue_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_votes_legislator ON votes(legislator_id)")
        .execute(pool)
        .await?;

    tracing::debug!("schema migrations applied");
    Ok(())
}
