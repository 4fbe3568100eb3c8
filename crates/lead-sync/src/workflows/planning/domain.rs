use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generates the opaque identifiers used for every record the pipeline creates.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeadId(pub String);

impl LeadId {
    pub fn generate() -> Self {
        Self(new_id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn generate() -> Self {
        Self(new_id())
    }
}

/// CRM credentials and routing identifiers for one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmCredentials {
    pub api_key: String,
    pub location_id: String,
    pub pipeline_id: String,
    pub stage_id: String,
}

/// A subscribing business whose CRM receives qualifying leads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAccount {
    pub id: ClientId,
    pub company_name: String,
    pub contact_email: String,
    pub crm: CrmCredentials,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Interest criteria for a client, plus the checkpoint of its last completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCriteria {
    pub client_id: ClientId,
    pub postcode: String,
    pub radius_km: f64,
    #[serde(default)]
    pub application_types: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Preferred run day, 0 = Sunday. Informational only.
    #[serde(default)]
    pub schedule_day: u8,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl SyncCriteria {
    /// Case-insensitive substring match of any keyword against description and address.
    /// An empty keyword list accepts everything.
    pub fn matches_keywords(&self, description: &str, address: &str) -> bool {
        if self.keywords.is_empty() {
            return true;
        }

        let content = format!("{description} {address}").to_lowercase();
        self.keywords
            .iter()
            .any(|keyword| content.contains(&keyword.to_lowercase()))
    }
}

/// One planning application delivered (or attempted) to one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub client_id: ClientId,
    pub external_reference: String,
    pub address: String,
    pub postcode: String,
    pub description: String,
    pub application_type: String,
    pub authority_name: Option<String>,
    pub agent_name: Option<String>,
    pub agent_address: Option<String>,
    pub source_url: String,
    pub crm_contact_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl Lead {
    pub fn is_synced(&self) -> bool {
        self.synced_at.is_some()
    }
}

/// Append-only log entry for one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: RunId,
    pub client_id: ClientId,
    pub run_at: DateTime<Utc>,
    pub leads_found: usize,
    pub leads_new: usize,
    pub leads_sent: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncRun {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}
