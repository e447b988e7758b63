use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Which way a sync run moves records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Import,
    Export,
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Import => "import",
            SyncDirection::Export => "export",
            SyncDirection::Bidirectional => "bidirectional",
        }
    }

    pub fn includes_export(&self) -> bool {
        matches!(self, SyncDirection::Export | SyncDirection::Bidirectional)
    }
}

impl std::str::FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "import" => Ok(SyncDirection::Import),
            "export" => Ok(SyncDirection::Export),
            "bidirectional" => Ok(SyncDirection::Bidirectional),
            other => Err(format!("unknown sync direction: {other}")),
        }
    }
}

/// Local mirror of one external CRM record.
///
/// Uniqueness: (platform, external_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmContact {
    pub id: Uuid,
    pub platform: String,
    pub external_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub title: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
    /// Extra platform fields that don't map onto named columns.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    /// Encrypted enrichment blob (base64 ciphertext). Merged as a union
    /// during conflict resolution.
    pub enrichment: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Encrypted access credentials for one (tenant, platform) pair.
/// Ciphertexts only; plaintext exists just-in-time in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmCredential {
    pub tenant_id: String,
    pub platform: String,
    /// base64(nonce || aes-256-gcm ciphertext)
    pub ciphertext: String,
    pub updated_at: DateTime<Utc>,
}

/// Terminal status of one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Completed,
    RateLimited,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Completed => "completed",
            SyncStatus::RateLimited => "rate_limited",
            SyncStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(SyncStatus::Running),
            "completed" => Ok(SyncStatus::Completed),
            "rate_limited" => Ok(SyncStatus::RateLimited),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(format!("unknown sync status: {other}")),
        }
    }
}

/// Non-fatal problem recorded during a sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncError {
    /// A critical field differed between winner and loser; flagged for a
    /// human rather than silently overwritten.
    ConflictManualReview {
        external_id: String,
        field: String,
        old: String,
        new: String,
    },
    /// One unit exhausted retries and went to the dead-letter stream.
    UnitFailed { external_id: String, error: String },
    /// A whole page could not be fetched.
    PageFailed { cursor: Option<String>, error: String },
}

/// Outcome of one sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub run_id: Uuid,
    pub platform: String,
    pub direction: SyncDirection,
    pub status: SyncStatus,
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
    pub errors: Vec<SyncError>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SyncResult {
    pub fn begin(platform: &str, direction: SyncDirection) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            platform: platform.to_string(),
            direction,
            status: SyncStatus::Running,
            processed: 0,
            created: 0,
            updated: 0,
            failed: 0,
            errors: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// A sync unit that exhausted retries, parked for operator review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub platform: String,
    pub record: Value,
    pub error: String,
    pub created_at: DateTime<Utc>,
}
