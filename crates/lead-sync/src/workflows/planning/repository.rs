use chrono::{DateTime, Utc};
use serde::Serialize;

use super::domain::{ClientAccount, ClientId, Lead, SyncCriteria, SyncRun};

/// Storage abstraction over clients, criteria, leads, and the run log.
///
/// Implementations must make each call atomic: leads and runs are append-only,
/// and `save_lead` rejects a second lead for the same client and external
/// reference with [`RepositoryError::Conflict`].
///
/// The checkpoint (`SyncCriteria::last_run_at`) is owned by the orchestrator and
/// only moves through [`SyncRepository::set_checkpoint`].
pub trait SyncRepository: Send + Sync {
    fn list_clients(&self) -> Result<Vec<ClientAccount>, RepositoryError>;
    fn get_client(&self, id: &ClientId) -> Result<Option<ClientAccount>, RepositoryError>;
    fn save_client(&self, client: ClientAccount) -> Result<(), RepositoryError>;
    /// Removes the client and its criteria. Leads and runs are kept.
    fn delete_client(&self, id: &ClientId) -> Result<(), RepositoryError>;
    fn get_criteria(&self, client_id: &ClientId) -> Result<Option<SyncCriteria>, RepositoryError>;
    /// Writes the targeting fields. An existing checkpoint is kept; the given
    /// `last_run_at` is only used when the criteria are new.
    fn save_criteria(&self, criteria: SyncCriteria) -> Result<(), RepositoryError>;
    /// Moves the checkpoint alone. Does nothing when the criteria are gone.
    fn set_checkpoint(&self, client_id: &ClientId, at: DateTime<Utc>) -> Result<(), RepositoryError>;
    /// Newest first, optionally scoped to one client.
    fn list_leads(&self, client_id: Option<&ClientId>) -> Result<Vec<Lead>, RepositoryError>;
    fn save_lead(&self, lead: Lead) -> Result<(), RepositoryError>;
    fn append_run(&self, run: SyncRun) -> Result<(), RepositoryError>;
    /// Newest first, optionally scoped to one client.
    fn list_runs(&self, client_id: Option<&ClientId>) -> Result<Vec<SyncRun>, RepositoryError>;
}

/// Error enumeration for repository failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Dashboard row summarising one client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientOverview {
    pub client_id: ClientId,
    pub company_name: String,
    pub active: bool,
    pub postcode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    pub latest_new_leads: usize,
}

/// Aggregate counters across every client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub clients: usize,
    pub active_clients: usize,
    pub leads: usize,
    pub synced_leads: usize,
    pub runs: usize,
    pub leads_extracted: usize,
}

pub fn client_overviews<R>(repository: &R) -> Result<Vec<ClientOverview>, RepositoryError>
where
    R: SyncRepository + ?Sized,
{
    let mut overviews = Vec::new();
    for client in repository.list_clients()? {
        let criteria = repository.get_criteria(&client.id)?;
        let latest_new_leads = repository
            .list_runs(Some(&client.id))?
            .first()
            .map(|run| run.leads_new)
            .unwrap_or(0);

        overviews.push(ClientOverview {
            company_name: client.company_name,
            active: client.active,
            postcode: criteria.as_ref().map(|c| c.postcode.clone()),
            last_run_at: criteria.and_then(|c| c.last_run_at),
            latest_new_leads,
            client_id: client.id,
        });
    }
    Ok(overviews)
}

pub fn sync_stats<R>(repository: &R) -> Result<SyncStats, RepositoryError>
where
    R: SyncRepository + ?Sized,
{
    let clients = repository.list_clients()?;
    let mut stats = SyncStats {
        clients: clients.len(),
        active_clients: clients.iter().filter(|client| client.active).count(),
        ..SyncStats::default()
    };

    let leads = repository.list_leads(None)?;
    stats.leads = leads.len();
    stats.synced_leads = leads.iter().filter(|lead| lead.is_synced()).count();

    let runs = repository.list_runs(None)?;
    stats.runs = runs.len();
    stats.leads_extracted = runs.iter().map(|run| run.leads_new).sum();

    Ok(stats)
}
