//! Outbound delivery of leads into a client's CRM as contacts.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use super::domain::{ClientAccount, Lead};

/// Display name used when enrichment found no agent.
pub const FALLBACK_CONTACT_NAME: &str = "Planning Application";
/// Tag marking every contact created by this pipeline.
pub const SOURCE_TAG: &str = "planit";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("CRM delivery failed: {message}")]
pub struct DeliveryError {
    pub status: Option<u16>,
    pub message: String,
}

impl DeliveryError {
    fn transport(err: reqwest::Error) -> Self {
        Self {
            status: None,
            message: err.to_string(),
        }
    }
}

/// CRM boundary used by the orchestrator.
#[async_trait]
pub trait CrmGateway: Send + Sync {
    /// Creates a contact for the lead and returns its CRM id.
    async fn deliver(
        &self,
        client: &ClientAccount,
        lead: &Lead,
        now: DateTime<Utc>,
    ) -> Result<String, DeliveryError>;

    /// Credential and reachability check. Never fails; any problem is `false`.
    async fn test_connection(&self, client: &ClientAccount) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomField {
    pub key: &'static str,
    pub value: String,
}

/// Contact body sent to `POST /contacts/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactPayload {
    pub name: String,
    pub address1: String,
    pub postal_code: String,
    pub location_id: String,
    pub pipeline_id: String,
    pub stage_id: String,
    pub tags: Vec<String>,
    pub custom_fields: Vec<CustomField>,
}

impl ContactPayload {
    pub fn build(client: &ClientAccount, lead: &Lead, now: DateTime<Utc>) -> Self {
        let name = lead
            .agent_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(FALLBACK_CONTACT_NAME)
            .to_string();

        Self {
            name,
            address1: lead.address.clone(),
            postal_code: lead.postcode.clone(),
            location_id: client.crm.location_id.clone(),
            pipeline_id: client.crm.pipeline_id.clone(),
            stage_id: client.crm.stage_id.clone(),
            tags: vec![
                SOURCE_TAG.to_string(),
                application_type_tag(&lead.application_type),
                iso_week_tag(now.date_naive()),
            ],
            custom_fields: vec![
                CustomField {
                    key: "planning_reference",
                    value: lead.external_reference.clone(),
                },
                CustomField {
                    key: "authority",
                    value: lead.authority_name.clone().unwrap_or_default(),
                },
                CustomField {
                    key: "application_type",
                    value: lead.application_type.clone(),
                },
                CustomField {
                    key: "source_url",
                    value: lead.source_url.clone(),
                },
            ],
        }
    }
}

/// Lower-cased application type with each whitespace run replaced by a hyphen.
pub fn application_type_tag(application_type: &str) -> String {
    let mut slug = String::with_capacity(application_type.len());
    let mut in_space = false;
    for c in application_type.chars() {
        if c.is_whitespace() {
            if !in_space {
                slug.push('-');
            }
            in_space = true;
        } else {
            slug.extend(c.to_lowercase());
            in_space = false;
        }
    }
    slug
}

/// ISO-8601 `"{week-year}/{week}"`; the year is the one owning that week's Thursday.
pub fn iso_week_tag(date: NaiveDate) -> String {
    let week = date.iso_week();
    format!("{}/{}", week.year(), week.week())
}

#[derive(Debug, Deserialize)]
struct ContactResponse {
    contact: ContactBody,
}

#[derive(Debug, Deserialize)]
struct ContactBody {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<serde_json::Value>,
}

/// HTTP client for the LeadConnector contacts API.
#[derive(Debug, Clone)]
pub struct LeadConnectorClient {
    client: Client,
    base_url: String,
    api_version: String,
}

impl LeadConnectorClient {
    pub fn new(client: Client, base_url: impl Into<String>, api_version: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_version: api_version.into(),
        }
    }

    fn authorized(&self, request: RequestBuilder, client: &ClientAccount) -> RequestBuilder {
        request
            .bearer_auth(&client.crm.api_key)
            .header("Version", &self.api_version)
    }
}

#[async_trait]
impl CrmGateway for LeadConnectorClient {
    #[instrument(level = "debug", skip_all, fields(client_id = %client.id, reference = %lead.external_reference))]
    async fn deliver(
        &self,
        client: &ClientAccount,
        lead: &Lead,
        now: DateTime<Utc>,
    ) -> Result<String, DeliveryError> {
        let payload = ContactPayload::build(client, lead, now);
        let url = format!("{}/contacts/", self.base_url);

        let response = self
            .authorized(self.client.post(url), client)
            .json(&payload)
            .send()
            .await
            .map_err(DeliveryError::transport)?;

        let status = response.status();
        if !status.is_success() {
            let fallback = status
                .canonical_reason()
                .map(str::to_string)
                .unwrap_or_else(|| status.to_string());
            let message = match response.json::<ErrorBody>().await {
                Ok(ErrorBody {
                    message: Some(serde_json::Value::String(message)),
                }) if !message.is_empty() => message,
                Ok(ErrorBody {
                    message: Some(serde_json::Value::Array(items)),
                }) if !items.is_empty() => items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string).unwrap_or_else(|| item.to_string()))
                    .collect::<Vec<_>>()
                    .join("; "),
                _ => fallback,
            };
            return Err(DeliveryError {
                status: Some(status.as_u16()),
                message,
            });
        }

        let body: ContactResponse = response.json().await.map_err(DeliveryError::transport)?;
        Ok(body.contact.id)
    }

    async fn test_connection(&self, client: &ClientAccount) -> bool {
        let url = format!("{}/locations/{}", self.base_url, client.crm.location_id);
        match self.authorized(self.client.get(url), client).send().await {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                warn!(client_id = %client.id, error = %err, "CRM connection check failed");
                false
            }
        }
    }
}
