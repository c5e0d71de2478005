//! Semantic index manager.
//!
//! Named vector collections stored in the same SQLite file as the relational
//! data. A collection row points at one *generation* of records; search only
//! ever sees the pointed-to generation. The synchronizer builds a new
//! generation off to the side and swaps the pointer in a single transaction
//! ([`SemanticIndex::commit_generation`]), so readers never observe a
//! half-built collection.
//!
//! Similarity is brute force over the generation's vectors. Record text is
//! also indexed by an FTS5 table, so a collection can be searched by BM25
//! keyword rank ([`SearchMode::Keyword`]) or by both fused
//! ([`SearchMode::Hybrid`]).

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{Error, Result};
use crate::models::SemanticRecord;

/// Vector distance metric of a collection. Higher scores are always better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    #[default]
    Cosine,
    Dot,
    /// Scored as `1 / (1 + d)` where `d` is the Euclidean distance.
    Euclid,
}

impl Distance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Distance::Cosine => "cosine",
            Distance::Dot => "dot",
            Distance::Euclid => "euclid",
        }
    }

    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Distance::Cosine => cosine_similarity(a, b),
            Distance::Dot => a.iter().zip(b).map(|(x, y)| x * y).sum(),
            Distance::Euclid => {
                let d = a
                    .iter()
                    .zip(b)
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt();
                1.0 / (1.0 + d)
            }
        }
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Distance {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Distance::Cosine),
            "dot" => Ok(Distance::Dot),
            "euclid" | "euclidean" => Ok(Distance::Euclid),
            other => Err(format!(
                "unknown distance '{}'; expected cosine, dot, or euclid",
                other
            )),
        }
    }
}

/// How a query is matched against a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Dense vectors fused with BM25 keyword rank.
    #[default]
    Hybrid,
    Dense,
    Keyword,
}

impl SearchMode {
    pub const NAMES: [&'static str; 3] = ["hybrid", "dense", "keyword"];

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Hybrid => "hybrid",
            SearchMode::Dense => "dense",
            SearchMode::Keyword => "keyword",
        }
    }

    /// Whether the query text must be embedded.
    pub fn needs_vector(&self) -> bool {
        !matches!(self, SearchMode::Keyword)
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hybrid" => Ok(SearchMode::Hybrid),
            "dense" | "semantic" => Ok(SearchMode::Dense),
            "keyword" => Ok(SearchMode::Keyword),
            other => Err(format!(
                "unknown search type '{}'; expected hybrid, dense, or keyword",
                other
            )),
        }
    }
}

/// Fusion settings for [`SearchMode::Hybrid`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridParams {
    /// Weight of the dense score; `1 - alpha` goes to the keyword score.
    pub alpha: f32,
    /// Candidates taken from each channel before fusion.
    pub candidate_k: usize,
}

impl Default for HybridParams {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            candidate_k: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub dims: usize,
    pub distance: Distance,
    pub record_count: i64,
    #[serde(skip)]
    pub generation: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub record: SemanticRecord,
    pub score: f32,
}

type CollectionRow = (String, i64, String, String, i64, i64, i64);

impl From<CollectionRow> for CollectionInfo {
    fn from(row: CollectionRow) -> Self {
        let (name, dims, distance, generation, record_count, created_at, updated_at) = row;
        Self {
            name,
            dims: dims.max(0) as usize,
            distance: distance.parse().unwrap_or_default(),
            record_count,
            generation,
            created_at,
            updated_at,
        }
    }
}

const SELECT_COLLECTION: &str = "SELECT name, dims, distance, generation, record_count, created_at, updated_at FROM collections";

#[derive(Debug, Clone)]
pub struct SemanticIndex {
    pool: SqlitePool,
}

impl SemanticIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create an empty collection.
    ///
    /// Without `force`, an existing name fails with [`Error::CollectionExists`]
    /// and its contents are untouched. With `force`, the existing collection
    /// and its records are replaced.
    pub async fn create_collection(
        &self,
        name: &str,
        dims: usize,
        distance: Distance,
        force: bool,
    ) -> Result<CollectionInfo> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<CollectionRow> =
            sqlx::query_as(&format!("{} WHERE name = ?", SELECT_COLLECTION))
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(row) = existing {
            let info = CollectionInfo::from(row);
            if !force {
                return Err(Error::CollectionExists {
                    name: info.name,
                    dims: info.dims,
                    distance: info.distance.to_string(),
                });
            }
            sqlx::query("DELETE FROM semantic_records WHERE generation = ?")
                .bind(&info.generation)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM collections WHERE name = ?")
                .bind(name)
                .execute(&mut *tx)
                .await?;
            tracing::info!(collection = name, "dropped existing collection (forced)");
        }

        let now = chrono::Utc::now().timestamp();
        let generation = new_generation(name);
        sqlx::query(
            "INSERT INTO collections (name, dims, distance, generation, record_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(name)
        .bind(dims as i64)
        .bind(distance.as_str())
        .bind(&generation)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(collection = name, dims, distance = %distance, "created collection");

        Ok(CollectionInfo {
            name: name.to_string(),
            dims,
            distance,
            record_count: 0,
            generation,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn drop_collection(&self, name: &str) -> Result<()> {
        let info = self.collection_info(name).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM semantic_records WHERE generation = ?")
            .bind(&info.generation)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(collection = name, "dropped collection");
        Ok(())
    }

    pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let rows: Vec<CollectionRow> =
            sqlx::query_as(&format!("{} ORDER BY name", SELECT_COLLECTION))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(CollectionInfo::from).collect())
    }

    pub async fn collection_info(&self, name: &str) -> Result<CollectionInfo> {
        let row: Option<CollectionRow> =
            sqlx::query_as(&format!("{} WHERE name = ?", SELECT_COLLECTION))
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        row.map(CollectionInfo::from)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Insert or replace records (by key) in the collection's live generation.
    pub async fn upsert(&self, name: &str, records: &[SemanticRecord]) -> Result<usize> {
        let info = self.collection_info(name).await?;
        check_dims(name, info.dims, records)?;

        let mut tx = self.pool.begin().await?;
        insert_records(&mut tx, &info.generation, records).await?;
        sqlx::query(
            "UPDATE collections SET
                record_count = (SELECT COUNT(*) FROM semantic_records WHERE generation = ?),
                updated_at = ?
             WHERE name = ?",
        )
        .bind(&info.generation)
        .bind(chrono::Utc::now().timestamp())
        .bind(name)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(records.len())
    }

    /// The `top_k` records closest to `vector`, highest score first.
    pub async fn search(&self, name: &str, vector: &[f32], top_k: usize) -> Result<Vec<SearchHit>> {
        let info = self.collection_info(name).await?;
        let mut hits = self.dense_candidates(&info, vector).await?;
        hits.truncate(top_k);
        Ok(hits)
    }

    /// The `top_k` records whose text best matches `text` by BM25 rank.
    ///
    /// Words of `text` are matched individually; punctuation is ignored.
    pub async fn keyword_search(&self, name: &str, text: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let info = self.collection_info(name).await?;
        self.keyword_candidates(&info, text, top_k).await
    }

    /// Dense and keyword candidates, min-max normalized per channel and fused
    /// as `alpha * dense + (1 - alpha) * keyword`.
    pub async fn hybrid_search(
        &self,
        name: &str,
        vector: &[f32],
        text: &str,
        top_k: usize,
        params: HybridParams,
    ) -> Result<Vec<SearchHit>> {
        let info = self.collection_info(name).await?;
        let candidate_k = params.candidate_k.max(top_k);

        let mut dense = self.dense_candidates(&info, vector).await?;
        dense.truncate(candidate_k);
        let keyword = self.keyword_candidates(&info, text, candidate_k).await?;

        let alpha = params.alpha.clamp(0.0, 1.0);
        let dense_norm = normalize_scores(&dense);
        let keyword_norm = normalize_scores(&keyword);

        let mut merged: HashMap<String, SearchHit> = HashMap::new();
        for hit in dense.into_iter().chain(keyword) {
            merged.entry(hit.record.key.clone()).or_insert(hit);
        }

        let mut hits: Vec<SearchHit> = merged
            .into_values()
            .map(|mut hit| {
                let v = dense_norm.get(&hit.record.key).copied().unwrap_or(0.0);
                let k = keyword_norm.get(&hit.record.key).copied().unwrap_or(0.0);
                hit.score = alpha * v + (1.0 - alpha) * k;
                hit
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    /// Every record of the live generation scored against `vector`, best first.
    async fn dense_candidates(&self, info: &CollectionInfo, vector: &[f32]) -> Result<Vec<SearchHit>> {
        if vector.len() != info.dims {
            return Err(Error::DimensionMismatch {
                collection: info.name.clone(),
                expected: info.dims,
                actual: vector.len(),
            });
        }

        let rows: Vec<(String, String, String, Vec<u8>)> = sqlx::query_as(
            "SELECT key, text, metadata_json, embedding FROM semantic_records WHERE generation = ?",
        )
        .bind(&info.generation)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<SearchHit> = rows
            .into_iter()
            .map(|(key, text, metadata_json, blob)| {
                let stored = blob_to_vec(&blob);
                let score = info.distance.score(vector, &stored);
                SearchHit {
                    record: stored_record(key, text, &metadata_json, stored),
                    score,
                }
            })
            .collect();
        sort_hits(&mut hits);
        Ok(hits)
    }

    async fn keyword_candidates(
        &self,
        info: &CollectionInfo,
        text: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let Some(query) = fts_query(text) else {
            return Ok(Vec::new());
        };

        let rows: Vec<(String, String, String, Vec<u8>, f64)> = sqlx::query_as(
            r#"
            SELECT r.key, r.text, r.metadata_json, r.embedding,
                   bm25(semantic_records_fts) AS rank
            FROM semantic_records_fts
            JOIN semantic_records r ON r.id = semantic_records_fts.rowid
            WHERE semantic_records_fts MATCH ? AND r.generation = ?
            ORDER BY rank, r.key
            LIMIT ?
            "#,
        )
        .bind(&query)
        .bind(&info.generation)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(key, text, metadata_json, blob, rank)| SearchHit {
                record: stored_record(key, text, &metadata_json, blob_to_vec(&blob)),
                // FTS5 rank is negative BM25; negate so higher = better
                score: -rank as f32,
            })
            .collect())
    }

    /// External keys of every record in the collection's live generation.
    pub async fn keys(&self, name: &str) -> Result<Vec<String>> {
        let info = self.collection_info(name).await?;
        let keys: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM semantic_records WHERE generation = ? ORDER BY key")
                .bind(&info.generation)
                .fetch_all(&self.pool)
                .await?;
        Ok(keys.into_iter().map(|(k,)| k).collect())
    }

    // ============ Generations ============

    /// Allocate an invisible generation for `name` and write `records` into it.
    pub(crate) async fn stage_generation(
        &self,
        name: &str,
        dims: usize,
        records: &[SemanticRecord],
    ) -> Result<String> {
        check_dims(name, dims, records)?;
        let generation = new_generation(name);
        let mut tx = self.pool.begin().await?;
        insert_records(&mut tx, &generation, records).await?;
        tx.commit().await?;
        Ok(generation)
    }

    /// Append more records to a staged generation.
    pub(crate) async fn extend_generation(
        &self,
        name: &str,
        generation: &str,
        dims: usize,
        records: &[SemanticRecord],
    ) -> Result<()> {
        check_dims(name, dims, records)?;
        let mut tx = self.pool.begin().await?;
        insert_records(&mut tx, generation, records).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Point `name` at `generation` and delete the generation it replaces,
    /// in one transaction. Creates the collection if it does not exist.
    ///
    /// Fails with [`Error::IncompleteGeneration`] unless the generation holds
    /// exactly `expected` records; the collection is then left untouched.
    pub(crate) async fn commit_generation(
        &self,
        name: &str,
        generation: &str,
        dims: usize,
        distance: Distance,
        expected: usize,
    ) -> Result<CollectionInfo> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let (record_count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM semantic_records WHERE generation = ?")
                .bind(generation)
                .fetch_one(&mut *tx)
                .await?;
        if record_count != expected as i64 {
            return Err(Error::IncompleteGeneration {
                collection: name.to_string(),
                expected,
                staged: record_count,
            });
        }

        let previous: Option<(String, i64)> =
            sqlx::query_as("SELECT generation, created_at FROM collections WHERE name = ?")
                .bind(name)
                .fetch_optional(&mut *tx)
                .await?;

        let created_at = match &previous {
            Some((old_generation, created_at)) => {
                sqlx::query(
                    "UPDATE collections SET dims = ?, distance = ?, generation = ?, record_count = ?, updated_at = ?
                     WHERE name = ?",
                )
                .bind(dims as i64)
                .bind(distance.as_str())
                .bind(generation)
                .bind(record_count)
                .bind(now)
                .bind(name)
                .execute(&mut *tx)
                .await?;
                sqlx::query("DELETE FROM semantic_records WHERE generation = ?")
                    .bind(old_generation)
                    .execute(&mut *tx)
                    .await?;
                *created_at
            }
            None => {
                sqlx::query(
                    "INSERT INTO collections (name, dims, distance, generation, record_count, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(name)
                .bind(dims as i64)
                .bind(distance.as_str())
                .bind(generation)
                .bind(record_count)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                now
            }
        };

        tx.commit().await?;

        Ok(CollectionInfo {
            name: name.to_string(),
            dims,
            distance,
            record_count,
            generation: generation.to_string(),
            created_at,
            updated_at: now,
        })
    }

    /// Delete a staged generation that will never be committed.
    pub(crate) async fn discard_generation(&self, generation: &str) -> Result<()> {
        sqlx::query("DELETE FROM semantic_records WHERE generation = ?")
            .bind(generation)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete generations of `name` that the collection does not point at.
    ///
    /// Only safe while holding the rebuild lease for `name`.
    pub(crate) async fn prune(&self, name: &str) -> Result<u64> {
        let prefix = generation_prefix(name);
        let result = sqlx::query(
            "DELETE FROM semantic_records
             WHERE substr(generation, 1, length(?1)) = ?1
               AND generation NOT IN (SELECT generation FROM collections WHERE name = ?2)",
        )
        .bind(&prefix)
        .bind(name)
        .execute(&self.pool)
        .await?;
        let pruned = result.rows_affected();
        if pruned > 0 {
            tracing::info!(collection = name, pruned, "removed orphaned staged records");
        }
        Ok(pruned)
    }
}

fn generation_prefix(name: &str) -> String {
    format!("{}#", name)
}

fn new_generation(name: &str) -> String {
    format!("{}{}", generation_prefix(name), Uuid::new_v4())
}

fn check_dims(collection: &str, dims: usize, records: &[SemanticRecord]) -> Result<()> {
    if let Some(bad) = records.iter().find(|r| r.vector.len() != dims) {
        return Err(Error::DimensionMismatch {
            collection: collection.to_string(),
            expected: dims,
            actual: bad.vector.len(),
        });
    }
    Ok(())
}

fn stored_record(key: String, text: String, metadata_json: &str, vector: Vec<f32>) -> SemanticRecord {
    SemanticRecord {
        key,
        text,
        metadata: serde_json::from_str(metadata_json).unwrap_or(serde_json::Value::Null),
        vector,
    }
}

/// Highest score first; ties broken by key so results are deterministic.
fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.record.key.cmp(&b.record.key))
    });
}

/// Min-max normalize scores to [0, 1], keyed by record key.
/// A single candidate, or all-equal scores, normalize to 1.
fn normalize_scores(hits: &[SearchHit]) -> HashMap<String, f32> {
    let s_min = hits.iter().map(|h| h.score).fold(f32::INFINITY, f32::min);
    let s_max = hits.iter().map(|h| h.score).fold(f32::NEG_INFINITY, f32::max);
    hits.iter()
        .map(|h| {
            let norm = if (s_max - s_min).abs() < f32::EPSILON {
                1.0
            } else {
                (h.score - s_min) / (s_max - s_min)
            };
            (h.record.key.clone(), norm)
        })
        .collect()
}

/// FTS5 MATCH expression for free text: each word quoted, any may match.
fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| format!("\"{}\"", w))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

async fn insert_records(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    generation: &str,
    records: &[SemanticRecord],
) -> Result<()> {
    for record in records {
        sqlx::query(
            "INSERT INTO semantic_records (generation, key, text, metadata_json, embedding)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(generation, key) DO UPDATE SET
                text = excluded.text,
                metadata_json = excluded.metadata_json,
                embedding = excluded.embedding",
        )
        .bind(generation)
        .bind(&record.key)
        .bind(&record.text)
        .bind(record.metadata.to_string())
        .bind(vec_to_blob(&record.vector))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}
