//! Consistency synchronizer.
//!
//! Keeps semantic collections derived from the relational store. Each
//! collection is a [`CollectionView`]: a projection of one table, filtered by
//! chamber, into text that gets embedded.
//!
//! # Rebuild
//!
//! ```text
//! lease(name) → prune orphans → read view rows → embed in batches (lease renewed)
//!      → stage fresh generation → commit (count check, pointer swap, old generation deleted)
//! ```
//!
//! The lease lives in SQLite, so a CLI rebuild and a running server exclude
//! each other. Any failure discards the staged generation; the collection
//! keeps serving its previous contents. A rebuild future dropped mid-way
//! leaves an orphaned staged generation, invisible to search and pruned by
//! the next rebuild.

use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::embedding::{embed_query, Embedder};
use crate::error::{Error, Result};
use crate::index::{CollectionInfo, Distance, HybridParams, SearchHit, SearchMode, SemanticIndex};
use crate::models::{external_key, parse_external_key, Chamber, SemanticRecord, RELATIONAL_TABLES};

// ============ Views ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    Legislators,
    Blocks,
    Issues,
}

impl ViewKind {
    pub const ALL: [ViewKind; 3] = [ViewKind::Legislators, ViewKind::Blocks, ViewKind::Issues];

    pub fn table(&self) -> &'static str {
        match self {
            ViewKind::Legislators => "legislators",
            ViewKind::Blocks => "blocks",
            ViewKind::Issues => "issues",
        }
    }
}

/// A named semantic collection and the relational rows it is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionView {
    pub name: String,
    pub kind: ViewKind,
    pub chamber: Chamber,
}

impl CollectionView {
    pub fn new(kind: ViewKind, chamber: Chamber) -> Self {
        Self {
            name: format!("{}-{}", kind.table(), chamber),
            kind,
            chamber,
        }
    }

    /// Every view, one per table and chamber.
    pub fn all() -> Vec<CollectionView> {
        ViewKind::ALL
            .iter()
            .flat_map(|kind| Chamber::ALL.iter().map(|chamber| CollectionView::new(*kind, *chamber)))
            .collect()
    }

    pub fn parse(name: &str) -> Option<CollectionView> {
        Self::all().into_iter().find(|v| v.name == name)
    }

    /// Current rows of the view as `(key, text, metadata)`, ordered by id.
    pub async fn load(&self, pool: &SqlitePool) -> Result<Vec<(String, String, serde_json::Value)>> {
        let chamber = self.chamber.as_str();
        let table = self.kind.table();
        let rows = match self.kind {
            ViewKind::Legislators => {
                let rows: Vec<(i64, String, String, Option<String>)> = sqlx::query_as(
                    "SELECT l.id, l.name, l.district, b.name
                     FROM legislators l LEFT JOIN blocks b ON b.id = l.block_id
                     WHERE l.chamber = ? ORDER BY l.id",
                )
                .bind(chamber)
                .fetch_all(pool)
                .await?;
                rows.into_iter()
                    .map(|(id, name, district, block)| {
                        let text = legislator_text(&name, &district, block.as_deref());
                        let meta = serde_json::json!({
                            "id": id,
                            "name": name,
                            "district": district,
                            "block": block,
                            "chamber": chamber,
                        });
                        (external_key(table, id), text, meta)
                    })
                    .collect()
            }
            ViewKind::Blocks => {
                let rows: Vec<(i64, String, Option<String>, bool)> = sqlx::query_as(
                    "SELECT id, name, description, active FROM blocks WHERE chamber = ? ORDER BY id",
                )
                .bind(chamber)
                .fetch_all(pool)
                .await?;
                rows.into_iter()
                    .map(|(id, name, description, active)| {
                        let text = match description.as_deref() {
                            Some(d) if !d.trim().is_empty() => format!("{}: {}", name, d.trim()),
                            _ => name.clone(),
                        };
                        let meta = serde_json::json!({
                            "id": id,
                            "name": name,
                            "active": active,
                            "chamber": chamber,
                        });
                        (external_key(table, id), text, meta)
                    })
                    .collect()
            }
            ViewKind::Issues => {
                let rows: Vec<IssueViewRow> = sqlx::query_as(
                    "SELECT id, session, summary, title, voted_on, year, result,
                            affirmative, negative, abstentions, absent
                     FROM issues WHERE chamber = ? ORDER BY id",
                )
                .bind(chamber)
                .fetch_all(pool)
                .await?;
                rows.into_iter()
                    .map(|row| {
                        let meta = serde_json::json!({
                            "id": row.id,
                            "session": row.session,
                            "voted_on": row.voted_on,
                            "year": row.year,
                            "result": row.result,
                            "chamber": chamber,
                        });
                        (external_key(table, row.id), issue_text(&row), meta)
                    })
                    .collect()
            }
        };
        Ok(rows)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct IssueViewRow {
    id: i64,
    session: String,
    summary: String,
    title: Option<String>,
    voted_on: String,
    year: i64,
    result: Option<String>,
    affirmative: i64,
    negative: i64,
    abstentions: i64,
    absent: i64,
}

fn legislator_text(name: &str, district: &str, block: Option<&str>) -> String {
    match block {
        Some(block) => format!("{} ({}), {}", name, district, block),
        None => format!("{} ({})", name, district),
    }
}

fn issue_text(row: &IssueViewRow) -> String {
    let mut text = match row.title.as_deref() {
        Some(title) if !title.trim().is_empty() => format!("{} - {}", row.summary, title.trim()),
        _ => row.summary.clone(),
    };
    text.push_str(&format!(
        ". {} affirmative, {} negative, {} abstentions, {} absent",
        row.affirmative, row.negative, row.abstentions, row.absent
    ));
    if let Some(result) = row.result.as_deref() {
        text.push_str(&format!(", result: {}", result));
    }
    text
}

// ============ Leases ============

/// Exclusive rebuild leases on collection names, stored in the
/// `rebuild_leases` table so they hold across processes sharing the file.
///
/// A lease not renewed within `ttl` is considered abandoned (its holder
/// crashed) and may be taken over.
#[derive(Debug, Clone)]
pub struct LeaseTable {
    pool: SqlitePool,
    ttl: Duration,
}

impl LeaseTable {
    pub fn new(pool: SqlitePool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    /// Take the lease on `name`, or fail fast if a live holder has it.
    pub async fn try_acquire(&self, name: &str) -> Result<Lease> {
        let holder = format!("{}:{}", std::process::id(), Uuid::new_v4());
        let now = chrono::Utc::now().timestamp();
        let stale_before = now - self.ttl.as_secs() as i64;

        let taken = sqlx::query(
            "INSERT INTO rebuild_leases (name, holder, acquired_at, renewed_at) VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                renewed_at = excluded.renewed_at
             WHERE rebuild_leases.renewed_at < ?4",
        )
        .bind(name)
        .bind(&holder)
        .bind(now)
        .bind(stale_before)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if taken == 0 {
            return Err(Error::RebuildInProgress(name.to_string()));
        }
        tracing::debug!(collection = name, holder = %holder, "rebuild lease acquired");
        Ok(Lease {
            pool: self.pool.clone(),
            name: name.to_string(),
            holder,
            released: false,
        })
    }

    /// Whether a live (unexpired) lease on `name` exists.
    pub async fn is_held(&self, name: &str) -> Result<bool> {
        let stale_before = chrono::Utc::now().timestamp() - self.ttl.as_secs() as i64;
        let held: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM rebuild_leases WHERE name = ? AND renewed_at >= ?",
        )
        .bind(name)
        .bind(stale_before)
        .fetch_one(&self.pool)
        .await?;
        Ok(held)
    }
}

/// A held rebuild lease. Call [`release`](Lease::release); dropping it
/// unreleased (a cancelled rebuild) releases it in the background.
#[derive(Debug)]
pub struct Lease {
    pool: SqlitePool,
    name: String,
    holder: String,
    released: bool,
}

impl Lease {
    /// Extend the lease. Fails with [`Error::RebuildInProgress`] if it was
    /// taken over after expiring.
    pub async fn renew(&self) -> Result<()> {
        let renewed = sqlx::query(
            "UPDATE rebuild_leases SET renewed_at = ? WHERE name = ? AND holder = ?",
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(&self.name)
        .bind(&self.holder)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if renewed == 0 {
            return Err(Error::RebuildInProgress(self.name.clone()));
        }
        Ok(())
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        release_lease(&self.pool, &self.name, &self.holder).await
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(collection = %self.name, "rebuild lease left to expire");
            return;
        };
        let pool = self.pool.clone();
        let name = std::mem::take(&mut self.name);
        let holder = std::mem::take(&mut self.holder);
        handle.spawn(async move {
            if let Err(e) = release_lease(&pool, &name, &holder).await {
                tracing::warn!(collection = %name, error = %e, "failed to release rebuild lease");
            }
        });
    }
}

async fn release_lease(pool: &SqlitePool, name: &str, holder: &str) -> Result<()> {
    sqlx::query("DELETE FROM rebuild_leases WHERE name = ? AND holder = ?")
        .bind(name)
        .bind(holder)
        .execute(pool)
        .await?;
    Ok(())
}

// ============ Synchronizer ============

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub collection: String,
    pub records: i64,
    pub dims: usize,
    pub distance: Distance,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub collection: String,
    pub records: usize,
    /// Keys whose relational row no longer exists.
    pub dangling: Vec<String>,
    /// Relational rows of the view with no record (stale collection).
    pub missing: Vec<String>,
    pub consistent: bool,
}

#[derive(Clone)]
pub struct Synchronizer {
    pool: SqlitePool,
    index: SemanticIndex,
    embedder: Arc<dyn Embedder>,
    leases: LeaseTable,
    distance: Distance,
    batch_size: usize,
    hybrid: HybridParams,
}

/// Lease lifetime when none is configured.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(600);

impl Synchronizer {
    pub fn new(
        pool: SqlitePool,
        index: SemanticIndex,
        embedder: Arc<dyn Embedder>,
        distance: Distance,
        batch_size: usize,
    ) -> Self {
        Self {
            leases: LeaseTable::new(pool.clone(), DEFAULT_LEASE_TTL),
            pool,
            index,
            embedder,
            distance,
            batch_size: batch_size.max(1),
            hybrid: HybridParams::default(),
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.leases = LeaseTable::new(self.pool.clone(), ttl);
        self
    }

    pub fn with_hybrid(mut self, hybrid: HybridParams) -> Self {
        self.hybrid = hybrid;
        self
    }

    pub fn index(&self) -> &SemanticIndex {
        &self.index
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    /// Rebuild one collection from its view.
    pub async fn rebuild(&self, name: &str) -> Result<RebuildReport> {
        let view = CollectionView::parse(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))?;
        let lease = self.leases.try_acquire(name).await?;
        let result = self.rebuild_leased(&view, &lease).await;
        if let Err(e) = lease.release().await {
            tracing::warn!(collection = name, error = %e, "failed to release rebuild lease");
        }
        result
    }

    async fn rebuild_leased(&self, view: &CollectionView, lease: &Lease) -> Result<RebuildReport> {
        let name = view.name.as_str();
        let started = Instant::now();

        if self.embedder.dims() == 0 {
            return Err(Error::EmbeddingProvider {
                collection: name.to_string(),
                message: format!(
                    "embedding provider '{}' cannot produce vectors",
                    self.embedder.model_name()
                ),
            });
        }

        self.index.prune(name).await?;

        let distance = match self.index.collection_info(name).await {
            Ok(existing) => existing.distance,
            Err(Error::CollectionNotFound(_)) => self.distance,
            Err(e) => return Err(e),
        };

        let rows = view.load(&self.pool).await?;
        tracing::info!(collection = name, rows = rows.len(), "rebuilding collection");

        let mut staged = None;
        match self.build(view, rows, distance, lease, &mut staged).await {
            Ok(info) => {
                let report = RebuildReport {
                    collection: info.name,
                    records: info.record_count,
                    dims: info.dims,
                    distance: info.distance,
                    elapsed_ms: started.elapsed().as_millis(),
                };
                tracing::info!(
                    collection = name,
                    records = report.records,
                    elapsed_ms = report.elapsed_ms as u64,
                    "rebuild committed"
                );
                Ok(report)
            }
            Err(e) => {
                if let Some(generation) = staged {
                    if let Err(discard_err) = self.index.discard_generation(&generation).await {
                        tracing::warn!(collection = name, error = %discard_err, "failed to discard staged generation");
                    }
                }
                tracing::warn!(collection = name, error = %e, "rebuild failed; previous contents kept");
                Err(e)
            }
        }
    }

    async fn build(
        &self,
        view: &CollectionView,
        rows: Vec<(String, String, serde_json::Value)>,
        distance: Distance,
        lease: &Lease,
        staged: &mut Option<String>,
    ) -> Result<CollectionInfo> {
        let name = view.name.as_str();
        let dims = self.embedder.dims();
        let expected = rows.len();

        for batch in rows.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|(_, text, _)| text.clone()).collect();
            let vectors = self
                .embedder
                .embed(&texts)
                .await
                .map_err(|e| Error::EmbeddingProvider {
                    collection: name.to_string(),
                    message: e.to_string(),
                })?;
            if vectors.len() != batch.len() {
                return Err(Error::EmbeddingProvider {
                    collection: name.to_string(),
                    message: format!(
                        "expected {} vectors, provider returned {}",
                        batch.len(),
                        vectors.len()
                    ),
                });
            }

            let records: Vec<SemanticRecord> = batch
                .iter()
                .zip(vectors)
                .map(|((key, text, metadata), vector)| SemanticRecord {
                    key: key.clone(),
                    text: text.clone(),
                    metadata: metadata.clone(),
                    vector,
                })
                .collect();

            match staged.as_deref() {
                Some(generation) => {
                    self.index
                        .extend_generation(name, generation, dims, &records)
                        .await?
                }
                None => *staged = Some(self.index.stage_generation(name, dims, &records).await?),
            }
            lease.renew().await?;
        }

        let generation = match staged.clone() {
            Some(generation) => generation,
            None => {
                let generation = self.index.stage_generation(name, dims, &[]).await?;
                *staged = Some(generation.clone());
                generation
            }
        };

        self.index
            .commit_generation(name, &generation, dims, distance, expected)
            .await
    }

    /// Rebuild every view in order, stopping at the first failure.
    pub async fn rebuild_all(&self) -> Result<Vec<RebuildReport>> {
        let mut reports = Vec::new();
        for view in CollectionView::all() {
            reports.push(self.rebuild(&view.name).await?);
        }
        Ok(reports)
    }

    /// Compare a collection's keys with the relational rows they point at.
    pub async fn check(&self, name: &str) -> Result<ConsistencyReport> {
        let keys = self.index.keys(name).await?;
        let mut existing: HashMap<&'static str, HashSet<i64>> = HashMap::new();
        for &table in RELATIONAL_TABLES {
            let ids: Vec<(i64,)> = sqlx::query_as(&format!("SELECT id FROM {}", table))
                .fetch_all(&self.pool)
                .await?;
            existing.insert(table, ids.into_iter().map(|(id,)| id).collect());
        }

        let dangling: Vec<String> = keys
            .iter()
            .filter(|key| {
                !parse_external_key(key)
                    .and_then(|(table, id)| existing.get(table).map(|ids| ids.contains(&id)))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        let missing = match CollectionView::parse(name) {
            Some(view) => {
                let present: BTreeSet<&String> = keys.iter().collect();
                view.load(&self.pool)
                    .await?
                    .into_iter()
                    .map(|(key, _, _)| key)
                    .filter(|key| !present.contains(key))
                    .collect()
            }
            None => Vec::new(),
        };

        Ok(ConsistencyReport {
            collection: name.to_string(),
            records: keys.len(),
            consistent: dangling.is_empty() && missing.is_empty(),
            dangling,
            missing,
        })
    }

    /// Like [`check`](Self::check), but dangling keys are an error.
    pub async fn verify(&self, name: &str) -> Result<ConsistencyReport> {
        let report = self.check(name).await?;
        if !report.dangling.is_empty() {
            return Err(Error::ConsistencyViolation {
                collection: name.to_string(),
                dangling: report.dangling,
            });
        }
        Ok(report)
    }

    /// Search the collection for `text`, embedding it unless `mode` is
    /// keyword-only.
    pub async fn search(
        &self,
        name: &str,
        text: &str,
        top_k: usize,
        mode: SearchMode,
    ) -> Result<Vec<SearchHit>> {
        // Fail on unknown collections before paying for an embedding call.
        self.index.collection_info(name).await?;
        if !mode.needs_vector() {
            return self.index.keyword_search(name, text, top_k).await;
        }

        let vector = embed_query(self.embedder.as_ref(), text)
            .await
            .map_err(|e| Error::EmbeddingProvider {
                collection: name.to_string(),
                message: e.to_string(),
            })?;
        match mode {
            SearchMode::Dense => self.index.search(name, &vector, top_k).await,
            _ => {
                self.index
                    .hybrid_search(name, &vector, text, top_k, self.hybrid)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::HashEmbedder;
    use crate::{db, migrate};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Succeeds for the first `ok_calls` calls, then fails.
    struct FlakyEmbedder {
        inner: HashEmbedder,
        ok_calls: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn model_name(&self) -> &str {
            "flaky"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.ok_calls {
                anyhow::bail!("provider unavailable");
            }
            self.inner.embed(texts).await
        }
    }

    /// Hash embeddings, slowly.
    struct SlowEmbedder {
        inner: HashEmbedder,
    }

    impl SlowEmbedder {
        fn new(dims: usize) -> Self {
            Self {
                inner: HashEmbedder::new(dims),
            }
        }
    }

    #[async_trait]
    impl Embedder for SlowEmbedder {
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dims(&self) -> usize {
            self.inner.dims()
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_millis(40)).await;
            self.inner.embed(texts).await
        }
    }

    async fn setup() -> (TempDir, SqlitePool) {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_db_path(tmp.path().join("test.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::migrate(&pool).await.unwrap();

        for (id, summary, title) in [
            (1, "Presupuesto nacional 2024", Some("Ley de presupuesto")),
            (2, "Homenaje a deportistas", None),
            (3, "Reforma del código penal", Some("Penas para delitos ambientales")),
        ] {
            sqlx::query(
                "INSERT INTO issues (id, chamber, session, summary, title, voted_on, year, affirmative, negative)
                 VALUES (?, 'deputies', '1', ?, ?, '2024-05-02', 2024, 130, 100)",
            )
            .bind(id)
            .bind(summary)
            .bind(title)
            .execute(&pool)
            .await
            .unwrap();
        }
        sqlx::query(
            "INSERT INTO issues (id, chamber, session, summary, voted_on, year)
             VALUES (10, 'senators', '1', 'Acuerdo de pliegos', '2024-05-03', 2024)",
        )
        .execute(&pool)
        .await
        .unwrap();
        (tmp, pool)
    }

    fn synchronizer(pool: &SqlitePool, embedder: Arc<dyn Embedder>, batch_size: usize) -> Synchronizer {
        Synchronizer::new(
            pool.clone(),
            SemanticIndex::new(pool.clone()),
            embedder,
            Distance::Cosine,
            batch_size,
        )
    }

    #[test]
    fn test_views() {
        let names: Vec<String> = CollectionView::all().into_iter().map(|v| v.name).collect();
        assert_eq!(names.len(), 6);
        assert!(names.contains(&"issues-deputies".to_string()));
        assert!(names.contains(&"legislators-senators".to_string()));
        assert_eq!(
            CollectionView::parse("blocks-senators").unwrap().kind,
            ViewKind::Blocks
        );
        assert!(CollectionView::parse("votes-deputies").is_none());
    }

    #[tokio::test]
    async fn test_rebuild_then_search_finds_record() {
        let (_tmp, pool) = setup().await;
        let sync = synchronizer(&pool, Arc::new(HashEmbedder::new(128)), 2);

        let report = sync.rebuild("issues-deputies").await.unwrap();
        assert_eq!(report.records, 3);
        assert_eq!(report.dims, 128);

        let hits = sync
            .search("issues-deputies", "ley de presupuesto", 3, SearchMode::Hybrid)
            .await
            .unwrap();
        assert_eq!(hits[0].record.key, "issues:1");
        assert!(hits[0].record.text.starts_with("Presupuesto nacional 2024 - Ley de presupuesto"));
        assert_eq!(hits[0].record.metadata["year"], 2024);

        // Chamber filter: the senators issue is not in the deputies collection.
        let keys = sync.index().keys("issues-deputies").await.unwrap();
        assert!(!keys.contains(&"issues:10".to_string()));
    }

    #[tokio::test]
    async fn test_rebuild_replaces_previous_generation() {
        let (_tmp, pool) = setup().await;
        let sync = synchronizer(&pool, Arc::new(HashEmbedder::new(32)), 64);
        sync.rebuild("issues-deputies").await.unwrap();

        sqlx::query("DELETE FROM issues WHERE id = 2").execute(&pool).await.unwrap();
        let report = sync.rebuild("issues-deputies").await.unwrap();
        assert_eq!(report.records, 2);

        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM semantic_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_failed_rebuild_keeps_prior_state() {
        let (_tmp, pool) = setup().await;
        let good = synchronizer(&pool, Arc::new(HashEmbedder::new(16)), 1);
        good.rebuild("issues-deputies").await.unwrap();
        let before = good.index().keys("issues-deputies").await.unwrap();

        sqlx::query("DELETE FROM issues WHERE id = 3").execute(&pool).await.unwrap();

        // First batch embeds and stages, the second fails.
        let flaky = synchronizer(
            &pool,
            Arc::new(FlakyEmbedder {
                inner: HashEmbedder::new(16),
                ok_calls: 1,
                calls: AtomicUsize::new(0),
            }),
            1,
        );
        let err = flaky.rebuild("issues-deputies").await.unwrap_err();
        assert!(matches!(err, Error::EmbeddingProvider { .. }));

        assert_eq!(good.index().keys("issues-deputies").await.unwrap(), before);
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM semantic_records")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(total, before.len() as i64);
        assert!(!flaky.leases().is_held("issues-deputies").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_rebuild_fails_fast() {
        let (_tmp, pool) = setup().await;
        let sync = synchronizer(&pool, Arc::new(HashEmbedder::new(16)), 8);

        let lease = sync.leases().try_acquire("issues-deputies").await.unwrap();
        let err = sync.rebuild("issues-deputies").await.unwrap_err();
        assert!(matches!(err, Error::RebuildInProgress(ref n) if n == "issues-deputies"));

        // Other collections are unaffected.
        sync.rebuild("issues-senators").await.unwrap();

        lease.release().await.unwrap();
        sync.rebuild("issues-deputies").await.unwrap();
    }

    #[tokio::test]
    async fn test_simultaneous_rebuilds_one_wins() {
        let (_tmp, pool) = setup().await;
        let sync = synchronizer(&pool, Arc::new(SlowEmbedder::new(16)), 1);

        let (a, b) = tokio::join!(sync.rebuild("issues-deputies"), sync.rebuild("issues-deputies"));
        let (ok, err) = match (a, b) {
            (Ok(report), Err(e)) | (Err(e), Ok(report)) => (report, e),
            other => panic!("expected one success and one failure, got {:?}", other),
        };
        assert_eq!(ok.records, 3);
        assert!(matches!(err, Error::RebuildInProgress(_)));
        assert_eq!(sync.index().keys("issues-deputies").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rebuild_excluded_across_instances() {
        let (tmp, pool) = setup().await;
        // A second pool on the same file stands in for another process.
        let other_pool = db::connect(&Config::with_db_path(tmp.path().join("test.sqlite")))
            .await
            .unwrap();

        let slow = synchronizer(&pool, Arc::new(SlowEmbedder::new(16)), 1);
        let fast = synchronizer(&other_pool, Arc::new(HashEmbedder::new(16)), 8);

        let running = {
            let slow = slow.clone();
            tokio::spawn(async move { slow.rebuild("issues-deputies").await })
        };
        while !fast.leases().is_held("issues-deputies").await.unwrap() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let err = fast.rebuild("issues-deputies").await.unwrap_err();
        assert!(matches!(err, Error::RebuildInProgress(_)));

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.records, 3);
        assert_eq!(
            fast.index().keys("issues-deputies").await.unwrap(),
            vec!["issues:1", "issues:2", "issues:3"]
        );
        assert!(!fast.leases().is_held("issues-deputies").await.unwrap());
        fast.rebuild("issues-deputies").await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_lease_is_taken_over() {
        let (_tmp, pool) = setup().await;
        let sync = synchronizer(&pool, Arc::new(HashEmbedder::new(16)), 8)
            .with_lease_ttl(Duration::from_secs(60));

        sqlx::query(
            "INSERT INTO rebuild_leases (name, holder, acquired_at, renewed_at) VALUES ('issues-deputies', 'crashed', 0, 0)",
        )
        .execute(&pool)
        .await
        .unwrap();
        assert!(!sync.leases().is_held("issues-deputies").await.unwrap());
        sync.rebuild("issues-deputies").await.unwrap();

        // A holder whose lease was taken over cannot renew it.
        let lease = sync.leases().try_acquire("issues-deputies").await.unwrap();
        sqlx::query("UPDATE rebuild_leases SET holder = 'someone-else'")
            .execute(&pool)
            .await
            .unwrap();
        assert!(matches!(
            lease.renew().await,
            Err(Error::RebuildInProgress(_))
        ));
    }

    #[tokio::test]
    async fn test_check_detects_dangling_and_missing() {
        let (_tmp, pool) = setup().await;
        let sync = synchronizer(&pool, Arc::new(HashEmbedder::new(16)), 8);
        sync.rebuild("issues-deputies").await.unwrap();

        let report = sync.verify("issues-deputies").await.unwrap();
        assert!(report.consistent);
        assert_eq!(report.records, 3);

        sqlx::query("DELETE FROM issues WHERE id = 2").execute(&pool).await.unwrap();
        sqlx::query(
            "INSERT INTO issues (id, chamber, session, summary, voted_on, year)
             VALUES (4, 'deputies', '2', 'Nueva', '2024-06-01', 2024)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let report = sync.check("issues-deputies").await.unwrap();
        assert!(!report.consistent);
        assert_eq!(report.dangling, vec!["issues:2"]);
        assert_eq!(report.missing, vec!["issues:4"]);

        match sync.verify("issues-deputies").await.unwrap_err() {
            Error::ConsistencyViolation { collection, dangling } => {
                assert_eq!(collection, "issues-deputies");
                assert_eq!(dangling, vec!["issues:2"]);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        sync.rebuild("issues-deputies").await.unwrap();
        assert!(sync.check("issues-deputies").await.unwrap().consistent);
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let (_tmp, pool) = setup().await;
        let sync = synchronizer(&pool, Arc::new(HashEmbedder::new(16)), 8);
        assert!(matches!(
            sync.rebuild("votes-everyone").await,
            Err(Error::CollectionNotFound(_))
        ));
        assert!(matches!(
            sync.search("issues-deputies", "x", 5, SearchMode::Dense).await,
            Err(Error::CollectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_embedder_rejected() {
        let (_tmp, pool) = setup().await;
        let sync = synchronizer(&pool, Arc::new(crate::embedding::DisabledEmbedder), 8);
        assert!(matches!(
            sync.rebuild("issues-deputies").await,
            Err(Error::EmbeddingProvider { .. })
        ));
        assert!(!sync.leases().is_held("issues-deputies").await.unwrap());
    }

    #[test]
    fn test_issue_text() {
        let row = IssueViewRow {
            id: 1,
            session: "3".into(),
            summary: "Presupuesto".into(),
            title: Some("Ley 27.701".into()),
            voted_on: "2022-11-17".into(),
            year: 2022,
            result: Some("AFIRMATIVO".into()),
            affirmative: 180,
            negative: 22,
            abstentions: 1,
            absent: 54,
        };
        assert_eq!(
            issue_text(&row),
            "Presupuesto - Ley 27.701. 180 affirmative, 22 negative, 1 abstentions, 54 absent, result: AFIRMATIVO"
        );
        assert_eq!(legislator_text("Ana", "Salta", None), "Ana (Salta)");
    }
}
