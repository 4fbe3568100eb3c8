use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::workflows::planning::delivery::{CrmGateway, DeliveryError};
use crate::workflows::planning::domain::{
    ClientAccount, ClientId, CrmCredentials, Lead, SyncCriteria, SyncRun,
};
use crate::workflows::planning::repository::{RepositoryError, SyncRepository};
use crate::workflows::planning::service::{Clock, SyncService, SyncSettings};
use crate::workflows::planning::source::{
    ApplicationDetail, ApplicationSource, DetailLookup, DetailSource, PlanningCandidate,
    SourceError,
};

pub(super) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 12, 29, 9, 30, 0).unwrap()
}

#[derive(Debug)]
pub(super) struct FixedClock(pub(super) DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

#[derive(Default)]
pub(super) struct MemoryRepository {
    clients: Mutex<HashMap<ClientId, ClientAccount>>,
    criteria: Mutex<HashMap<ClientId, SyncCriteria>>,
    leads: Mutex<Vec<Lead>>,
    runs: Mutex<Vec<SyncRun>>,
    pub(super) fail_lead_saves: Mutex<bool>,
}

impl MemoryRepository {
    pub(super) fn all_leads(&self) -> Vec<Lead> {
        self.leads.lock().expect("leads mutex").clone()
    }
}

impl SyncRepository for MemoryRepository {
    fn list_clients(&self) -> Result<Vec<ClientAccount>, RepositoryError> {
        let mut clients: Vec<_> = self.clients.lock().expect("clients mutex").values().cloned().collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(clients)
    }

    fn get_client(&self, id: &ClientId) -> Result<Option<ClientAccount>, RepositoryError> {
        Ok(self.clients.lock().expect("clients mutex").get(id).cloned())
    }

    fn save_client(&self, client: ClientAccount) -> Result<(), RepositoryError> {
        self.clients
            .lock()
            .expect("clients mutex")
            .insert(client.id.clone(), client);
        Ok(())
    }

    fn delete_client(&self, id: &ClientId) -> Result<(), RepositoryError> {
        self.criteria.lock().expect("criteria mutex").remove(id);
        match self.clients.lock().expect("clients mutex").remove(id) {
            Some(_) => Ok(()),
            None => Err(RepositoryError::NotFound),
        }
    }

    fn get_criteria(&self, client_id: &ClientId) -> Result<Option<SyncCriteria>, RepositoryError> {
        Ok(self.criteria.lock().expect("criteria mutex").get(client_id).cloned())
    }

    fn save_criteria(&self, mut criteria: SyncCriteria) -> Result<(), RepositoryError> {
        let mut guard = self.criteria.lock().expect("criteria mutex");
        if let Some(existing) = guard.get(&criteria.client_id) {
            criteria.last_run_at = existing.last_run_at;
        }
        guard.insert(criteria.client_id.clone(), criteria);
        Ok(())
    }

    fn set_checkpoint(&self, client_id: &ClientId, at: DateTime<Utc>) -> Result<(), RepositoryError> {
        if let Some(criteria) = self.criteria.lock().expect("criteria mutex").get_mut(client_id) {
            criteria.last_run_at = Some(at);
        }
        Ok(())
    }

    fn list_leads(&self, client_id: Option<&ClientId>) -> Result<Vec<Lead>, RepositoryError> {
        let guard = self.leads.lock().expect("leads mutex");
        Ok(guard
            .iter()
            .rev()
            .filter(|lead| client_id.map_or(true, |id| &lead.client_id == id))
            .cloned()
            .collect())
    }

    fn save_lead(&self, lead: Lead) -> Result<(), RepositoryError> {
        if *self.fail_lead_saves.lock().expect("flag mutex") {
            return Err(RepositoryError::Unavailable("disk full".to_string()));
        }
        let mut guard = self.leads.lock().expect("leads mutex");
        if guard.iter().any(|existing| {
            existing.client_id == lead.client_id
                && existing.external_reference == lead.external_reference
        }) {
            return Err(RepositoryError::Conflict);
        }
        guard.push(lead);
        Ok(())
    }

    fn append_run(&self, run: SyncRun) -> Result<(), RepositoryError> {
        self.runs.lock().expect("runs mutex").push(run);
        Ok(())
    }

    fn list_runs(&self, client_id: Option<&ClientId>) -> Result<Vec<SyncRun>, RepositoryError> {
        let guard = self.runs.lock().expect("runs mutex");
        Ok(guard
            .iter()
            .rev()
            .filter(|run| client_id.map_or(true, |id| &run.client_id == id))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub(super) struct FakeSource {
    candidates: Vec<PlanningCandidate>,
    fail: bool,
    pub(super) requests: Mutex<Vec<i64>>,
}

impl FakeSource {
    pub(super) fn with(candidates: Vec<PlanningCandidate>) -> Self {
        Self {
            candidates,
            ..Self::default()
        }
    }

    pub(super) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ApplicationSource for FakeSource {
    async fn fetch_candidates(
        &self,
        _criteria: &SyncCriteria,
        lookback_days: i64,
    ) -> Result<Vec<PlanningCandidate>, SourceError> {
        self.requests.lock().expect("requests mutex").push(lookback_days);
        if self.fail {
            return Err(SourceError::InvalidUrl("not a url".to_string()));
        }
        Ok(self.candidates.clone())
    }
}

#[derive(Default)]
pub(super) struct FakeDetails {
    agents: HashMap<String, (String, String)>,
    broken: HashSet<String>,
    pub(super) lookups: Mutex<Vec<String>>,
}

impl FakeDetails {
    pub(super) fn with_agent(mut self, doc_id: &str, name: &str, address: &str) -> Self {
        self.agents
            .insert(doc_id.to_string(), (name.to_string(), address.to_string()));
        self
    }

    pub(super) fn broken_for(mut self, doc_id: &str) -> Self {
        self.broken.insert(doc_id.to_string());
        self
    }
}

#[async_trait]
impl DetailSource for FakeDetails {
    async fn fetch_detail(&self, detail_id: &str) -> Result<DetailLookup, SourceError> {
        self.lookups
            .lock()
            .expect("lookups mutex")
            .push(detail_id.to_string());
        if self.broken.contains(detail_id) {
            return Err(SourceError::Status(500));
        }
        Ok(match self.agents.get(detail_id) {
            Some((name, address)) => DetailLookup::Found(ApplicationDetail {
                agent_name: Some(name.clone()),
                agent_address: Some(address.clone()),
            }),
            None => DetailLookup::NotFound,
        })
    }
}

#[derive(Default)]
pub(super) struct FakeCrm {
    rejected: HashSet<String>,
    pub(super) delivered: Mutex<Vec<(ClientId, String)>>,
    reachable: bool,
}

impl FakeCrm {
    pub(super) fn reachable() -> Self {
        Self {
            reachable: true,
            ..Self::default()
        }
    }

    pub(super) fn rejecting(reference: &str) -> Self {
        let mut crm = Self::default();
        crm.rejected.insert(reference.to_string());
        crm
    }
}

#[async_trait]
impl CrmGateway for FakeCrm {
    async fn deliver(
        &self,
        client: &ClientAccount,
        lead: &Lead,
        _now: DateTime<Utc>,
    ) -> Result<String, DeliveryError> {
        if self.rejected.contains(&lead.external_reference) {
            return Err(DeliveryError {
                status: Some(422),
                message: "Invalid contact".to_string(),
            });
        }
        let mut guard = self.delivered.lock().expect("delivered mutex");
        guard.push((client.id.clone(), lead.external_reference.clone()));
        Ok(format!("contact-{}", guard.len()))
    }

    async fn test_connection(&self, _client: &ClientAccount) -> bool {
        self.reachable
    }
}

pub(super) fn client(id: &str, active: bool) -> ClientAccount {
    ClientAccount {
        id: ClientId::from(id),
        company_name: format!("{id} Builders Ltd"),
        contact_email: format!("{id}@builders.test"),
        crm: CrmCredentials {
            api_key: format!("key-{id}"),
            location_id: format!("LOC_{id}"),
            pipeline_id: "PI_1".to_string(),
            stage_id: "ST_1".to_string(),
        },
        active,
        created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
    }
}

pub(super) fn criteria(id: &str, keywords: &[&str]) -> SyncCriteria {
    SyncCriteria {
        client_id: ClientId::from(id),
        postcode: "N1 9GU".to_string(),
        radius_km: 10.0,
        application_types: vec!["Householder".to_string()],
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        schedule_day: 3,
        last_run_at: None,
    }
}

pub(super) fn candidate(reference: &str, description: &str, address: &str) -> PlanningCandidate {
    PlanningCandidate {
        external_reference: reference.to_string(),
        address: address.to_string(),
        postcode: None,
        pc_district: Some("N1".to_string()),
        description: description.to_string(),
        application_type: "Householder".to_string(),
        authority: Some("Islington".to_string()),
        url: format!("https://planit.test/{reference}"),
        doc_id: Some(format!("doc-{reference}")),
    }
}

pub(super) fn seeded_repository(id: &str, keywords: &[&str]) -> Arc<MemoryRepository> {
    let repository = Arc::new(MemoryRepository::default());
    repository.save_client(client(id, true)).expect("client saves");
    repository
        .save_criteria(criteria(id, keywords))
        .expect("criteria saves");
    repository
}

pub(super) fn service(
    repository: Arc<MemoryRepository>,
    source: Arc<FakeSource>,
    details: Arc<FakeDetails>,
    crm: Arc<FakeCrm>,
) -> SyncService<MemoryRepository> {
    SyncService::new(
        repository,
        source,
        details,
        crm,
        SyncSettings {
            delivery_delay: Duration::ZERO,
            default_lookback_days: 7,
        },
    )
    .with_clock(Arc::new(FixedClock(now())))
}
