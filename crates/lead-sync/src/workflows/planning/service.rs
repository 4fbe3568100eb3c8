use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::delivery::CrmGateway;
use super::domain::{ClientAccount, ClientId, Lead, LeadId, RunId, SyncCriteria, SyncRun};
use super::repository::{RepositoryError, SyncRepository};
use super::source::{ApplicationSource, DetailLookup, DetailSource, PlanningCandidate, SourceError};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Source of the current time, replaceable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Pause after each delivery attempt.
    pub delivery_delay: Duration,
    /// Window used for clients that have never completed a run.
    pub default_lookback_days: i64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            delivery_delay: Duration::from_millis(500),
            default_lookback_days: 7,
        }
    }
}

/// Whole days between the checkpoint and `now`, rounded up, never below one.
pub fn lookback_days(
    last_run_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    default_days: i64,
) -> i64 {
    let since = last_run_at.unwrap_or_else(|| now - chrono::Duration::days(default_days));
    let elapsed = (now - since).num_seconds().max(0);
    let days = (elapsed + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY;
    days.max(1)
}

#[derive(Debug, thiserror::Error)]
enum RunFailure {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

#[derive(Debug, Default)]
struct RunTally {
    found: usize,
    created: usize,
    sent: usize,
    errors: Vec<String>,
}

/// Per-client sync pipeline: fetch, de-duplicate, filter, enrich, deliver, record.
pub struct SyncService<R> {
    repository: Arc<R>,
    source: Arc<dyn ApplicationSource>,
    details: Arc<dyn DetailSource>,
    crm: Arc<dyn CrmGateway>,
    clock: Arc<dyn Clock>,
    settings: SyncSettings,
    client_locks: Mutex<HashMap<ClientId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<R> SyncService<R>
where
    R: SyncRepository + 'static,
{
    pub fn new(
        repository: Arc<R>,
        source: Arc<dyn ApplicationSource>,
        details: Arc<dyn DetailSource>,
        crm: Arc<dyn CrmGateway>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            repository,
            source,
            details,
            crm,
            clock: Arc::new(SystemClock),
            settings,
            client_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repository
    }

    /// Runs the pipeline for one client.
    ///
    /// Returns `None` without side effects when the client is unknown, inactive,
    /// or has no criteria. Otherwise a [`SyncRun`] is always produced and
    /// appended to the run log; failures surface only in its error list.
    #[instrument(level = "info", skip_all, fields(client_id = %client_id))]
    pub async fn run_client_sync(&self, client_id: &ClientId) -> Option<SyncRun> {
        let lock = self.client_lock(client_id);
        let _guard = lock.lock().await;

        let started = Instant::now();
        let (client, criteria) = match self.load_client(client_id) {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return None,
            Err(err) => {
                warn!(error = %err, "unable to load client for sync");
                return None;
            }
        };

        let mut tally = RunTally::default();
        if let Err(err) = self.execute(&client, criteria, &mut tally).await {
            tally.errors.push(format!("Critical sync error: {err}"));
        }

        let run = SyncRun {
            id: RunId::generate(),
            client_id: client.id.clone(),
            run_at: self.clock.now(),
            leads_found: tally.found,
            leads_new: tally.created,
            leads_sent: tally.sent,
            errors: tally.errors,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        info!(
            found = run.leads_found,
            created = run.leads_new,
            sent = run.leads_sent,
            errors = run.errors.len(),
            duration_ms = run.duration_ms,
            "client sync finished"
        );

        if let Err(err) = self.repository.append_run(run.clone()) {
            warn!(error = %err, "failed to record sync run");
        }

        Some(run)
    }

    /// Runs every active client one after another.
    pub async fn run_all(&self) -> Result<Vec<SyncRun>, RepositoryError> {
        let clients = self.repository.list_clients()?;
        let mut runs = Vec::new();
        for client in clients.into_iter().filter(|client| client.active) {
            if let Some(run) = self.run_client_sync(&client.id).await {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    /// Checks the client's CRM credentials; `None` when the client is unknown.
    pub async fn test_connection(&self, client_id: &ClientId) -> Result<Option<bool>, RepositoryError> {
        match self.repository.get_client(client_id)? {
            Some(client) => Ok(Some(self.crm.test_connection(&client).await)),
            None => Ok(None),
        }
    }

    fn client_lock(&self, client_id: &ClientId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .client_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(client_id.clone()).or_default().clone()
    }

    fn load_client(
        &self,
        client_id: &ClientId,
    ) -> Result<Option<(ClientAccount, SyncCriteria)>, RepositoryError> {
        let Some(client) = self.repository.get_client(client_id)? else {
            return Ok(None);
        };
        if !client.active {
            return Ok(None);
        }
        let Some(criteria) = self.repository.get_criteria(client_id)? else {
            return Ok(None);
        };
        Ok(Some((client, criteria)))
    }

    async fn execute(
        &self,
        client: &ClientAccount,
        criteria: SyncCriteria,
        tally: &mut RunTally,
    ) -> Result<(), RunFailure> {
        let days = lookback_days(
            criteria.last_run_at,
            self.clock.now(),
            self.settings.default_lookback_days,
        );

        let candidates = self.source.fetch_candidates(&criteria, days).await?;
        tally.found = candidates.len();
        info!(lookback_days = days, found = tally.found, "candidates fetched");

        let mut known: HashSet<String> = self
            .repository
            .list_leads(Some(&client.id))?
            .into_iter()
            .map(|lead| lead.external_reference)
            .collect();

        for candidate in candidates {
            if candidate.external_reference.trim().is_empty() {
                debug!(url = %candidate.url, "skipping candidate without a reference");
                continue;
            }
            if known.contains(&candidate.external_reference) {
                continue;
            }
            if !criteria.matches_keywords(&candidate.description, &candidate.address) {
                continue;
            }

            tally.created += 1;
            known.insert(candidate.external_reference.clone());

            let detail_id = candidate.doc_id.clone();
            let mut lead = self.build_lead(client, candidate);
            if let Some(detail_id) = detail_id {
                self.enrich(&mut lead, &detail_id).await;
            }

            match self.crm.deliver(client, &lead, self.clock.now()).await {
                Ok(contact_id) => {
                    lead.crm_contact_id = Some(contact_id);
                    lead.synced_at = Some(self.clock.now());
                    tally.sent += 1;
                }
                Err(err) => {
                    warn!(reference = %lead.external_reference, error = %err, "lead delivery failed");
                    tally.errors.push(format!(
                        "CRM delivery failed for {}: {}",
                        lead.external_reference, err.message
                    ));
                }
            }
            self.repository.save_lead(lead)?;

            tokio::time::sleep(self.settings.delivery_delay).await;
        }

        self.repository.set_checkpoint(&client.id, self.clock.now())?;
        Ok(())
    }

    fn build_lead(&self, client: &ClientAccount, candidate: PlanningCandidate) -> Lead {
        let postcode = candidate.resolved_postcode();
        Lead {
            id: LeadId::generate(),
            client_id: client.id.clone(),
            external_reference: candidate.external_reference,
            address: candidate.address,
            postcode,
            description: candidate.description,
            application_type: candidate.application_type,
            authority_name: candidate.authority,
            agent_name: None,
            agent_address: None,
            source_url: candidate.url,
            crm_contact_id: None,
            created_at: self.clock.now(),
            synced_at: None,
        }
    }

    async fn enrich(&self, lead: &mut Lead, detail_id: &str) {
        if let Ok(DetailLookup::Found(detail)) = self.details.fetch_detail(detail_id).await {
            lead.agent_name = detail.agent_name;
            lead.agent_address = detail.agent_address;
        }
    }
}
