use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use super::domain::{ClientAccount, ClientId, CrmCredentials, SyncCriteria};
use super::repository::{client_overviews, sync_stats, RepositoryError, SyncRepository};
use super::service::SyncService;

/// Admin payload creating or replacing a client and its criteria.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientUpsert {
    pub company_name: String,
    #[serde(default)]
    pub contact_email: String,
    pub crm: CrmCredentials,
    #[serde(default = "default_active")]
    pub active: bool,
    pub criteria: CriteriaInput,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CriteriaInput {
    pub postcode: String,
    pub radius_km: f64,
    #[serde(default)]
    pub application_types: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub schedule_day: u8,
}

fn default_active() -> bool {
    true
}

impl ClientUpsert {
    fn validate(&self) -> Result<(), String> {
        if self.company_name.trim().is_empty() {
            return Err("company_name must not be empty".to_string());
        }
        if self.criteria.postcode.trim().is_empty() {
            return Err("criteria.postcode must not be empty".to_string());
        }
        if !(self.criteria.radius_km.is_finite() && self.criteria.radius_km > 0.0) {
            return Err("criteria.radius_km must be a positive number".to_string());
        }
        if self.criteria.schedule_day > 6 {
            return Err("criteria.schedule_day must be between 0 (Sunday) and 6".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub client_id: Option<String>,
}

/// Router exposing the sync trigger and the read/write surface admins need.
pub fn sync_router<R>(service: Arc<SyncService<R>>) -> Router
where
    R: SyncRepository + 'static,
{
    Router::new()
        .route("/api/v1/clients", get(list_clients_handler::<R>))
        .route(
            "/api/v1/clients/:client_id",
            put(upsert_client_handler::<R>).delete(delete_client_handler::<R>),
        )
        .route("/api/v1/clients/:client_id/sync", post(sync_handler::<R>))
        .route(
            "/api/v1/clients/:client_id/test-connection",
            post(test_connection_handler::<R>),
        )
        .route("/api/v1/clients/:client_id/leads", get(leads_handler::<R>))
        .route("/api/v1/runs", get(runs_handler::<R>))
        .route("/api/v1/stats", get(stats_handler::<R>))
        .with_state(service)
}

fn repository_failure(error: RepositoryError) -> Response {
    let status = match error {
        RepositoryError::NotFound => StatusCode::NOT_FOUND,
        RepositoryError::Conflict => StatusCode::CONFLICT,
        RepositoryError::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, axum::Json(json!({ "error": error.to_string() }))).into_response()
}

fn client_not_found(client_id: &ClientId) -> Response {
    let payload = json!({
        "client_id": client_id,
        "error": "client not found",
    });
    (StatusCode::NOT_FOUND, axum::Json(payload)).into_response()
}

fn upsert_client<R>(
    repository: &R,
    id: ClientId,
    payload: ClientUpsert,
) -> Result<(bool, ClientAccount, Option<SyncCriteria>), RepositoryError>
where
    R: SyncRepository + ?Sized,
{
    let existing = repository.get_client(&id)?;

    let client = ClientAccount {
        id: id.clone(),
        company_name: payload.company_name,
        contact_email: payload.contact_email,
        crm: payload.crm,
        active: payload.active,
        created_at: existing
            .as_ref()
            .map(|client| client.created_at)
            .unwrap_or_else(Utc::now),
    };
    // The store keeps any existing checkpoint.
    let criteria = SyncCriteria {
        client_id: id.clone(),
        postcode: payload.criteria.postcode,
        radius_km: payload.criteria.radius_km,
        application_types: payload.criteria.application_types,
        keywords: payload.criteria.keywords,
        schedule_day: payload.criteria.schedule_day,
        last_run_at: None,
    };

    repository.save_client(client.clone())?;
    repository.save_criteria(criteria)?;
    let stored = repository.get_criteria(&id)?;
    Ok((existing.is_none(), client, stored))
}

pub(crate) async fn list_clients_handler<R>(State(service): State<Arc<SyncService<R>>>) -> Response
where
    R: SyncRepository + 'static,
{
    match client_overviews(service.repository().as_ref()) {
        Ok(overviews) => (StatusCode::OK, axum::Json(overviews)).into_response(),
        Err(error) => repository_failure(error),
    }
}

pub(crate) async fn upsert_client_handler<R>(
    State(service): State<Arc<SyncService<R>>>,
    Path(client_id): Path<String>,
    axum::Json(payload): axum::Json<ClientUpsert>,
) -> Response
where
    R: SyncRepository + 'static,
{
    if let Err(message) = payload.validate() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            axum::Json(json!({ "error": message })),
        )
            .into_response();
    }

    let id = ClientId(client_id);
    let result = upsert_client(service.repository().as_ref(), id, payload);

    match result {
        Ok((created, client, criteria)) => {
            let status = if created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            let payload = json!({
                "client": {
                    "id": client.id,
                    "company_name": client.company_name,
                    "contact_email": client.contact_email,
                    "active": client.active,
                    "created_at": client.created_at,
                },
                "criteria": criteria,
            });
            (status, axum::Json(payload)).into_response()
        }
        Err(error) => repository_failure(error),
    }
}

pub(crate) async fn delete_client_handler<R>(
    State(service): State<Arc<SyncService<R>>>,
    Path(client_id): Path<String>,
) -> Response
where
    R: SyncRepository + 'static,
{
    let id = ClientId(client_id);
    match service.repository().delete_client(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(RepositoryError::NotFound) => client_not_found(&id),
        Err(error) => repository_failure(error),
    }
}

pub(crate) async fn sync_handler<R>(
    State(service): State<Arc<SyncService<R>>>,
    Path(client_id): Path<String>,
) -> Response
where
    R: SyncRepository + 'static,
{
    let id = ClientId(client_id);
    match service.run_client_sync(&id).await {
        Some(run) => (StatusCode::OK, axum::Json(run)).into_response(),
        None => {
            let payload = json!({
                "client_id": id,
                "error": "client not found, inactive, or missing criteria",
            });
            (StatusCode::NOT_FOUND, axum::Json(payload)).into_response()
        }
    }
}

pub(crate) async fn test_connection_handler<R>(
    State(service): State<Arc<SyncService<R>>>,
    Path(client_id): Path<String>,
) -> Response
where
    R: SyncRepository + 'static,
{
    let id = ClientId(client_id);
    match service.test_connection(&id).await {
        Ok(Some(connected)) => {
            (StatusCode::OK, axum::Json(json!({ "connected": connected }))).into_response()
        }
        Ok(None) => client_not_found(&id),
        Err(error) => repository_failure(error),
    }
}

pub(crate) async fn leads_handler<R>(
    State(service): State<Arc<SyncService<R>>>,
    Path(client_id): Path<String>,
) -> Response
where
    R: SyncRepository + 'static,
{
    let id = ClientId(client_id);
    match service.repository().list_leads(Some(&id)) {
        Ok(leads) => (StatusCode::OK, axum::Json(leads)).into_response(),
        Err(error) => repository_failure(error),
    }
}

pub(crate) async fn runs_handler<R>(
    State(service): State<Arc<SyncService<R>>>,
    Query(query): Query<RunsQuery>,
) -> Response
where
    R: SyncRepository + 'static,
{
    let scope = query.client_id.map(ClientId);
    match service.repository().list_runs(scope.as_ref()) {
        Ok(runs) => (StatusCode::OK, axum::Json(runs)).into_response(),
        Err(error) => repository_failure(error),
    }
}

pub(crate) async fn stats_handler<R>(State(service): State<Arc<SyncService<R>>>) -> Response
where
    R: SyncRepository + 'static,
{
    match sync_stats(service.repository().as_ref()) {
        Ok(stats) => (StatusCode::OK, axum::Json(stats)).into_response(),
        Err(error) => repository_failure(error),
    }
}
