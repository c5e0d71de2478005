//! Core data models for parliamentary voting records.
//!
//! These types mirror the relational schema created by [`crate::migrate`]
//! and the derived [`SemanticRecord`]s owned by the semantic index.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Tables of the relational schema, in dependency order.
pub const RELATIONAL_TABLES: &[&str] = &["blocks", "legislators", "issues", "votes"];

/// A result row: column name → JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Legislative chamber a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chamber {
    #[serde(alias = "diputados")]
    Deputies,
    #[serde(alias = "senadores")]
    Senators,
}

impl Chamber {
    pub const ALL: [Chamber; 2] = [Chamber::Deputies, Chamber::Senators];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chamber::Deputies => "deputies",
            Chamber::Senators => "senators",
        }
    }
}

impl fmt::Display for Chamber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chamber {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deputies" | "diputados" => Ok(Chamber::Deputies),
            "senators" | "senadores" => Ok(Chamber::Senators),
            other => Err(format!("unknown chamber: {}", other)),
        }
    }
}

/// A legislator's recorded choice on one issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "serde_json::Value")]
pub enum VoteChoice {
    Affirmative,
    Negative,
    Abstention,
    Absent,
    /// The presiding officer, who does not vote.
    President,
}

impl VoteChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteChoice::Affirmative => "affirmative",
            VoteChoice::Negative => "negative",
            VoteChoice::Abstention => "abstention",
            VoteChoice::Absent => "absent",
            VoteChoice::President => "president",
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(VoteChoice::Affirmative),
            1 => Some(VoteChoice::Negative),
            2 => Some(VoteChoice::Abstention),
            3 => Some(VoteChoice::Absent),
            4 => Some(VoteChoice::President),
            _ => None,
        }
    }
}

impl fmt::Display for VoteChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteChoice {
    type Err = String;

    /// Accepts numeric codes (`0`–`4`), Spanish source labels, and English names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase();
        if let Ok(code) = normalized.parse::<i64>() {
            return VoteChoice::from_code(code).ok_or_else(|| format!("invalid vote code: {}", code));
        }
        match normalized.as_str() {
            "AFIRMATIVO" | "AFFIRMATIVE" => Ok(VoteChoice::Affirmative),
            "NEGATIVO" | "NEGATIVE" => Ok(VoteChoice::Negative),
            "ABSTENCION" | "ABSTENCIÓN" | "ABSTENTION" => Ok(VoteChoice::Abstention),
            "AUSENTE" | "ABSENT" => Ok(VoteChoice::Absent),
            "PRESIDENTE" | "PRESIDENT" => Ok(VoteChoice::President),
            _ => Err(format!("invalid vote value: {}", s)),
        }
    }
}

impl TryFrom<serde_json::Value> for VoteChoice {
    type Error = String;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        match value {
            serde_json::Value::Number(n) => n
                .as_i64()
                .and_then(VoteChoice::from_code)
                .ok_or_else(|| format!("invalid vote code: {}", n)),
            serde_json::Value::String(s) => s.parse(),
            other => Err(format!("invalid vote value: {}", other)),
        }
    }
}

/// A political block (party grouping) within one chamber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub id: i64,
    pub chamber: Chamber,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Legislator {
    pub id: i64,
    pub chamber: Chamber,
    pub name: String,
    pub district: String,
    #[serde(default)]
    pub block_id: Option<i64>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// A voted-upon parliamentary matter with its recorded tally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub id: i64,
    pub chamber: Chamber,
    pub session: String,
    pub summary: String,
    #[serde(default)]
    pub title: Option<String>,
    /// `YYYY-MM-DD` or `DD/MM/YYYY`; normalized on ingestion.
    pub voted_on: String,
    #[serde(default)]
    pub voted_at: Option<String>,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default)]
    pub majority: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub president: Option<String>,
    #[serde(default)]
    pub present: i64,
    #[serde(default)]
    pub absent: i64,
    #[serde(default)]
    pub abstentions: i64,
    #[serde(default)]
    pub affirmative: i64,
    #[serde(default)]
    pub negative: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub issue_id: i64,
    pub legislator_id: i64,
    #[serde(default)]
    pub block_id: Option<i64>,
    pub choice: VoteChoice,
}

/// A full bulk-load payload, as delivered by the ingestion collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub legislators: Vec<Legislator>,
    #[serde(default)]
    pub issues: Vec<Issue>,
    #[serde(default)]
    pub votes: Vec<Vote>,
}

/// A denormalized projection of relational rows into text plus a vector.
///
/// `key` has the form `"<table>:<id>"` and must resolve to an existing row.
#[derive(Debug, Clone, Serialize)]
pub struct SemanticRecord {
    pub key: String,
    pub text: String,
    pub metadata: serde_json::Value,
    #[serde(skip)]
    pub vector: Vec<f32>,
}

/// Build the external key for a relational row.
pub fn external_key(table: &str, id: i64) -> String {
    format!("{}:{}", table, id)
}

/// Split an external key back into `(table, id)`.
pub fn parse_external_key(key: &str) -> Option<(&str, i64)> {
    let (table, id) = key.split_once(':')?;
    Some((table, id.parse().ok()?))
}
