use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Qualification outcome bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
    Unqualified,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
            Tier::Unqualified => "unqualified",
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "hot" => Ok(Tier::Hot),
            "warm" => Ok(Tier::Warm),
            "cold" => Ok(Tier::Cold),
            "unqualified" => Ok(Tier::Unqualified),
            other => Err(format!("unknown tier: {other}")),
        }
    }
}

/// Company descriptor attached to a lead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Company {
    pub name: String,
    pub website: Option<String>,
    /// Size bucket, e.g. "50-200".
    pub size: Option<String>,
    pub industry: Option<String>,
}

/// Contact descriptor attached to a lead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub title: Option<String>,
    pub phone: Option<String>,
    pub profile_url: Option<String>,
}

/// Result of running the qualification agent against a lead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Qualification {
    /// 0-100. The repository rejects values outside this range.
    pub score: u8,
    pub tier: Tier,
    pub rationale: String,
    /// Wall-clock latency of the qualifying provider call.
    pub latency_ms: u64,
    pub qualified_at: DateTime<Utc>,
}

/// A sales lead flowing through the agent pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub company: Company,
    pub contact: Contact,
    pub qualification: Option<Qualification>,
    /// Free-form data filled in by later pipeline stages
    /// (e.g. discovered ATL contacts, growth signals).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub additional_data: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(company: Company, contact: Contact) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            company,
            contact,
            qualification: None,
            additional_data: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }
}
