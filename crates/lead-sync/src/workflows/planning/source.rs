//! Planning-application source: paginated candidate search and per-application
//! detail lookups against the PlanIt JSON API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::domain::SyncCriteria;

/// Records requested per page.
pub const PAGE_SIZE: usize = 300;

/// Raw candidate as returned by the search endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlanningCandidate {
    #[serde(rename = "app_ref", default, deserialize_with = "text")]
    pub external_reference: String,
    #[serde(default, deserialize_with = "text")]
    pub address: String,
    #[serde(default, deserialize_with = "optional_text")]
    pub postcode: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub pc_district: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub description: String,
    #[serde(rename = "applic", default, deserialize_with = "text")]
    pub application_type: String,
    #[serde(default, deserialize_with = "optional_text")]
    pub authority: Option<String>,
    #[serde(default, deserialize_with = "text")]
    pub url: String,
    #[serde(default, deserialize_with = "optional_text")]
    pub doc_id: Option<String>,
}

impl PlanningCandidate {
    /// Postcode, falling back to the postcode district, then to "N/A".
    pub fn resolved_postcode(&self) -> String {
        self.postcode
            .clone()
            .or_else(|| self.pc_district.clone())
            .unwrap_or_else(|| "N/A".to_string())
    }
}

/// Agent/contact enrichment for one application.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationDetail {
    pub agent_name: Option<String>,
    pub agent_address: Option<String>,
}

/// Outcome of a detail lookup that reached the upstream service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetailLookup {
    Found(ApplicationDetail),
    NotFound,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("invalid planning source url: {0}")]
    InvalidUrl(String),
    #[error("planning source request failed: {0}")]
    Transport(String),
    #[error("planning source returned status {0}")]
    Status(u16),
    #[error("planning source returned malformed data: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Candidate search for one client's criteria.
#[async_trait]
pub trait ApplicationSource: Send + Sync {
    /// Transport and HTTP failures end pagination early and yield the pages
    /// already collected; an `Err` means the search could not start at all.
    async fn fetch_candidates(
        &self,
        criteria: &SyncCriteria,
        lookback_days: i64,
    ) -> Result<Vec<PlanningCandidate>, SourceError>;
}

/// Best-effort enrichment lookup.
#[async_trait]
pub trait DetailSource: Send + Sync {
    async fn fetch_detail(&self, detail_id: &str) -> Result<DetailLookup, SourceError>;
}

/// Pacing and limits for candidate pagination.
#[derive(Debug, Clone)]
pub struct PaginationSettings {
    pub page_delay: Duration,
    pub rate_limit_wait: Duration,
    pub max_records: usize,
    /// Consecutive rate-limit responses tolerated for a single page.
    pub max_rate_limit_retries: u32,
}

impl Default for PaginationSettings {
    fn default() -> Self {
        Self {
            page_delay: Duration::from_millis(500),
            rate_limit_wait: Duration::from_secs(5),
            max_records: 5000,
            max_rate_limit_retries: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApplicsPage {
    #[serde(default)]
    records: Option<Vec<PlanningCandidate>>,
    #[serde(default)]
    count: Option<usize>,
    #[serde(default)]
    to: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct DetailBody {
    #[serde(default)]
    agent: Option<AgentBody>,
}

#[derive(Debug, Deserialize)]
struct AgentBody {
    #[serde(default, deserialize_with = "optional_text")]
    name: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    address: Option<String>,
}

/// HTTP client for the PlanIt API.
#[derive(Debug, Clone)]
pub struct PlanItClient {
    client: Client,
    base_url: String,
    pagination: PaginationSettings,
}

impl PlanItClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            pagination: PaginationSettings::default(),
        }
    }

    pub fn with_pagination(mut self, pagination: PaginationSettings) -> Self {
        self.pagination = pagination;
        self
    }

    fn search_url(&self) -> Result<Url, SourceError> {
        let raw = format!("{}/api/applics/json", self.base_url);
        Url::parse(&raw).map_err(|err| SourceError::InvalidUrl(format!("{raw}: {err}")))
    }

    fn detail_url(&self, detail_id: &str) -> Result<Url, SourceError> {
        let raw = format!("{}/planapplic/{}/json", self.base_url, detail_id);
        Url::parse(&raw).map_err(|err| SourceError::InvalidUrl(format!("{raw}: {err}")))
    }
}

fn search_query(criteria: &SyncCriteria, page: u32, lookback_days: i64) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("pg_sz", PAGE_SIZE.to_string()),
        ("page", page.to_string()),
        ("postcode", criteria.postcode.clone()),
        ("radius", criteria.radius_km.to_string()),
        ("recent", lookback_days.to_string()),
        ("compress", "on".to_string()),
    ];
    if !criteria.application_types.is_empty() {
        query.push(("applic", criteria.application_types.join(",")));
    }
    query
}

/// Server-advised wait from a `Retry-After` header given in whole seconds.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl ApplicationSource for PlanItClient {
    #[instrument(level = "info", skip(self, criteria), fields(postcode = %criteria.postcode))]
    async fn fetch_candidates(
        &self,
        criteria: &SyncCriteria,
        lookback_days: i64,
    ) -> Result<Vec<PlanningCandidate>, SourceError> {
        let url = self.search_url()?;
        let mut collected: Vec<PlanningCandidate> = Vec::new();
        let mut page: u32 = 1;
        let mut rate_limited: u32 = 0;

        loop {
            let request = self
                .client
                .get(url.clone())
                .query(&search_query(criteria, page, lookback_days));

            let response = match request.send().await {
                Ok(response) => response,
                Err(err) => {
                    warn!(page, error = %err, "planning search failed; keeping partial results");
                    break;
                }
            };

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                rate_limited += 1;
                if rate_limited > self.pagination.max_rate_limit_retries {
                    warn!(page, attempts = rate_limited, "planning search still rate limited; keeping partial results");
                    break;
                }
                let wait = retry_after(response.headers()).unwrap_or(self.pagination.rate_limit_wait);
                info!(page, wait_ms = wait.as_millis() as u64, "planning search rate limited; retrying page");
                tokio::time::sleep(wait).await;
                continue;
            }
            rate_limited = 0;

            if !status.is_success() {
                warn!(page, status = status.as_u16(), "planning search rejected; keeping partial results");
                break;
            }

            let body: ApplicsPage = match response.json().await {
                Ok(body) => body,
                Err(err) => {
                    warn!(page, error = %err, "planning search returned unreadable page; keeping partial results");
                    break;
                }
            };

            let records = body.records.unwrap_or_default();
            let returned = records.len();
            collected.extend(records);
            debug!(page, returned, total = collected.len(), "planning search page received");

            if collected.len() >= self.pagination.max_records {
                collected.truncate(self.pagination.max_records);
                warn!(cap = self.pagination.max_records, "planning search hit record cap");
                break;
            }

            let reached = body.to.unwrap_or(0).max(collected.len());
            let exhausted = body.count.is_some_and(|count| reached >= count);
            if returned == 0 || exhausted {
                break;
            }

            page += 1;
            tokio::time::sleep(self.pagination.page_delay).await;
        }

        Ok(collected)
    }
}

#[async_trait]
impl DetailSource for PlanItClient {
    async fn fetch_detail(&self, detail_id: &str) -> Result<DetailLookup, SourceError> {
        let url = self.detail_url(detail_id)?;
        let response = self
            .client
            .get(url)
            .query(&[("compress", "on")])
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(DetailLookup::NotFound),
            status if !status.is_success() => Err(SourceError::Status(status.as_u16())),
            _ => {
                let body: DetailBody = response.json().await?;
                let detail = body
                    .agent
                    .map(|agent| ApplicationDetail {
                        agent_name: agent.name,
                        agent_address: agent.address,
                    })
                    .unwrap_or_default();
                Ok(DetailLookup::Found(detail))
            }
        }
    }
}

fn text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(optional_text(deserializer)?.unwrap_or_default())
}

/// Accepts strings or numbers; null and blank strings become `None`.
fn optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(raw)) if !raw.trim().is_empty() => Some(raw),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}
