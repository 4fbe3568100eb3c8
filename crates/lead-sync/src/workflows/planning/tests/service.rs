use super::common::*;
use crate::workflows::planning::domain::{ClientId, SyncCriteria};
use crate::workflows::planning::repository::SyncRepository;
use crate::workflows::planning::service::{SyncService, SyncSettings};
use crate::workflows::planning::source::{ApplicationSource, PlanningCandidate, SourceError};
use async_trait::async_trait;
use chrono::Duration;
use std::sync::Arc;
use std::time::Instant;

/// Source that changes the store while the run is in flight.
struct EditingSource {
    repository: Arc<MemoryRepository>,
    edit: fn(&MemoryRepository),
    candidates: Vec<PlanningCandidate>,
}

#[async_trait]
impl ApplicationSource for EditingSource {
    async fn fetch_candidates(
        &self,
        _criteria: &SyncCriteria,
        _lookback_days: i64,
    ) -> Result<Vec<PlanningCandidate>, SourceError> {
        (self.edit)(&self.repository);
        Ok(self.candidates.clone())
    }
}

#[tokio::test]
async fn unknown_inactive_or_unconfigured_clients_are_no_ops() {
    let repository = seeded_repository("c1", &[]);
    repository.save_client(client("dormant", false)).expect("saves");
    repository
        .save_criteria(criteria("dormant", &[]))
        .expect("saves");
    repository.save_client(client("bare", true)).expect("saves");

    let source = Arc::new(FakeSource::with(vec![candidate("A", "Loft", "1 High St")]));
    let service = service(
        repository.clone(),
        source.clone(),
        Arc::new(FakeDetails::default()),
        Arc::new(FakeCrm::default()),
    );

    for id in ["missing", "dormant", "bare"] {
        assert!(service.run_client_sync(&ClientId::from(id)).await.is_none());
    }
    assert!(source.requests.lock().expect("requests").is_empty());
    assert!(repository.list_runs(None).expect("runs").is_empty());
    assert!(repository.all_leads().is_empty());
}

#[tokio::test]
async fn second_run_over_unchanged_source_creates_nothing() {
    let repository = seeded_repository("c1", &[]);
    let source = Arc::new(FakeSource::with(vec![
        candidate("A", "Rear extension", "1 High St"),
        candidate("B", "Loft conversion", "2 High St"),
    ]));
    let crm = Arc::new(FakeCrm::default());
    let service = service(
        repository.clone(),
        source,
        Arc::new(FakeDetails::default()),
        crm.clone(),
    );
    let id = ClientId::from("c1");

    let first = service.run_client_sync(&id).await.expect("first run");
    assert_eq!((first.leads_found, first.leads_new, first.leads_sent), (2, 2, 2));

    let second = service.run_client_sync(&id).await.expect("second run");
    assert_eq!((second.leads_found, second.leads_new, second.leads_sent), (2, 0, 0));
    assert!(second.errors.is_empty());
    assert_eq!(repository.all_leads().len(), 2);
    assert_eq!(crm.delivered.lock().expect("delivered").len(), 2);
    assert_eq!(repository.list_runs(Some(&id)).expect("runs").len(), 2);
}

#[tokio::test]
async fn duplicate_references_in_one_result_set_become_one_lead() {
    let repository = seeded_repository("c1", &[]);
    let source = Arc::new(FakeSource::with(vec![
        candidate("A", "Rear extension", "1 High St"),
        candidate("A", "Rear extension", "1 High St"),
    ]));
    let service = service(
        repository.clone(),
        source,
        Arc::new(FakeDetails::default()),
        Arc::new(FakeCrm::default()),
    );

    let run = service
        .run_client_sync(&ClientId::from("c1"))
        .await
        .expect("run");
    assert_eq!(run.leads_found, 2);
    assert_eq!(run.leads_new, 1);
    assert!(run.errors.is_empty());
    assert_eq!(repository.all_leads().len(), 1);
}

#[tokio::test]
async fn keyword_filter_skips_non_matching_candidates() {
    let repository = seeded_repository("c1", &["loft"]);
    let source = Arc::new(FakeSource::with(vec![
        candidate("A", "Single Storey Extension", "4 Mill Road"),
        candidate("B", "LOFT Conversion with dormer", "9 Mill Road"),
    ]));
    let details = Arc::new(FakeDetails::default());
    let service = service(repository.clone(), source, details.clone(), Arc::new(FakeCrm::default()));

    let run = service
        .run_client_sync(&ClientId::from("c1"))
        .await
        .expect("run");

    assert_eq!(run.leads_found, 2);
    assert_eq!(run.leads_new, 1);
    let leads = repository.all_leads();
    assert_eq!(leads.len(), 1);
    assert_eq!(leads[0].external_reference, "B");
    assert_eq!(
        *details.lookups.lock().expect("lookups"),
        vec!["doc-B".to_string()],
        "filtered candidates are never enriched"
    );
}

#[tokio::test]
async fn delivery_failure_is_isolated_and_lead_still_persisted() {
    let repository = seeded_repository("c1", &[]);
    let source = Arc::new(FakeSource::with(vec![
        candidate("PA/1", "Rear extension", "1 High St"),
        candidate("PA/2", "Garage conversion", "2 High St"),
    ]));
    let service = service(
        repository.clone(),
        source,
        Arc::new(FakeDetails::default()),
        Arc::new(FakeCrm::rejecting("PA/1")),
    );

    let run = service
        .run_client_sync(&ClientId::from("c1"))
        .await
        .expect("run");

    assert_eq!(run.leads_new, 2);
    assert_eq!(run.leads_sent, 1);
    assert_eq!(run.errors.len(), 1);
    assert!(run.errors[0].contains("PA/1"));
    assert!(run.errors[0].contains("Invalid contact"));

    let leads = repository.all_leads();
    assert_eq!(leads.len(), 2);
    let failed = leads
        .iter()
        .find(|lead| lead.external_reference == "PA/1")
        .expect("failed lead stored");
    assert!(failed.crm_contact_id.is_none());
    assert!(failed.synced_at.is_none());
    let delivered = leads
        .iter()
        .find(|lead| lead.external_reference == "PA/2")
        .expect("delivered lead stored");
    assert!(delivered.crm_contact_id.is_some());
    assert_eq!(delivered.synced_at, Some(now()));
}

#[tokio::test]
async fn failed_delivery_is_not_retried_on_later_runs() {
    let repository = seeded_repository("c1", &[]);
    let source = Arc::new(FakeSource::with(vec![candidate("PA/1", "Rear extension", "1 High St")]));
    let crm = Arc::new(FakeCrm::rejecting("PA/1"));
    let service = service(
        repository.clone(),
        source,
        Arc::new(FakeDetails::default()),
        crm,
    );
    let id = ClientId::from("c1");

    service.run_client_sync(&id).await.expect("first run");
    let second = service.run_client_sync(&id).await.expect("second run");

    assert_eq!(second.leads_new, 0);
    assert!(second.errors.is_empty());
}

#[tokio::test]
async fn enrichment_fills_agent_and_tolerates_missing_detail() {
    let repository = seeded_repository("c1", &[]);
    let source = Arc::new(FakeSource::with(vec![
        candidate("A", "Rear extension", "1 High St"),
        candidate("B", "Garage conversion", "2 High St"),
        candidate("C", "New porch", "3 High St"),
    ]));
    let details = Arc::new(
        FakeDetails::default()
            .with_agent("doc-A", "Arch Design Ltd", "1 Studio Way")
            .broken_for("doc-C"),
    );
    let service = service(repository.clone(), source, details, Arc::new(FakeCrm::default()));

    let run = service
        .run_client_sync(&ClientId::from("c1"))
        .await
        .expect("run");
    assert!(run.errors.is_empty());
    assert_eq!(run.leads_sent, 3);

    let leads = repository.all_leads();
    let by_ref = |reference: &str| {
        leads
            .iter()
            .find(|lead| lead.external_reference == reference)
            .expect("lead stored")
            .clone()
    };
    let a = by_ref("A");
    assert_eq!(a.agent_name.as_deref(), Some("Arch Design Ltd"));
    assert_eq!(a.agent_address.as_deref(), Some("1 Studio Way"));
    assert_eq!(a.postcode, "N1");
    assert_eq!(a.authority_name.as_deref(), Some("Islington"));
    assert!(by_ref("B").agent_name.is_none());
    assert!(by_ref("C").agent_name.is_none());
}

#[tokio::test]
async fn checkpoint_advances_even_with_delivery_errors() {
    let repository = seeded_repository("c1", &[]);
    let source = Arc::new(FakeSource::with(vec![candidate("PA/1", "Rear extension", "1 High St")]));
    let service = service(
        repository.clone(),
        source,
        Arc::new(FakeDetails::default()),
        Arc::new(FakeCrm::rejecting("PA/1")),
    );
    let id = ClientId::from("c1");

    let run = service.run_client_sync(&id).await.expect("run");
    assert_eq!(run.errors.len(), 1);

    let criteria = repository
        .get_criteria(&id)
        .expect("criteria loads")
        .expect("criteria present");
    assert_eq!(criteria.last_run_at, Some(now()));
    assert_eq!(run.run_at, now());
}

#[tokio::test]
async fn lookback_is_derived_from_checkpoint() {
    let repository = seeded_repository("c1", &[]);
    let id = ClientId::from("c1");
    repository
        .set_checkpoint(&id, now() - Duration::hours(50))
        .expect("checkpoint saves");

    let source = Arc::new(FakeSource::with(Vec::new()));
    let service = service(
        repository.clone(),
        source.clone(),
        Arc::new(FakeDetails::default()),
        Arc::new(FakeCrm::default()),
    );

    service.run_client_sync(&id).await.expect("first run");
    service.run_client_sync(&id).await.expect("second run");

    assert_eq!(*source.requests.lock().expect("requests"), vec![3, 1]);
}

#[tokio::test]
async fn source_failure_is_recorded_as_single_critical_error() {
    let repository = seeded_repository("c1", &[]);
    let service = service(
        repository.clone(),
        Arc::new(FakeSource::failing()),
        Arc::new(FakeDetails::default()),
        Arc::new(FakeCrm::default()),
    );
    let id = ClientId::from("c1");

    let run = service.run_client_sync(&id).await.expect("run still emitted");

    assert_eq!(run.leads_found, 0);
    assert_eq!(run.errors.len(), 1);
    assert!(run.errors[0].starts_with("Critical sync error"));
    assert_eq!(repository.list_runs(Some(&id)).expect("runs").len(), 1);
    let criteria = repository
        .get_criteria(&id)
        .expect("criteria loads")
        .expect("criteria present");
    assert!(criteria.last_run_at.is_none(), "checkpoint only moves on completion");
}

#[tokio::test]
async fn storage_failure_mid_run_stops_the_run_but_still_logs_it() {
    let repository = seeded_repository("c1", &[]);
    *repository.fail_lead_saves.lock().expect("flag") = true;
    let source = Arc::new(FakeSource::with(vec![
        candidate("A", "Rear extension", "1 High St"),
        candidate("B", "Garage conversion", "2 High St"),
    ]));
    let service = service(
        repository.clone(),
        source,
        Arc::new(FakeDetails::default()),
        Arc::new(FakeCrm::default()),
    );

    let run = service
        .run_client_sync(&ClientId::from("c1"))
        .await
        .expect("run");

    assert_eq!(run.leads_new, 1);
    assert_eq!(run.errors.len(), 1);
    assert!(run.errors[0].contains("disk full"));
}

#[tokio::test]
async fn run_all_visits_only_active_clients() {
    let repository = seeded_repository("c1", &[]);
    repository.save_client(client("c2", false)).expect("saves");
    repository.save_criteria(criteria("c2", &[])).expect("saves");
    repository.save_client(client("c3", true)).expect("saves");
    repository.save_criteria(criteria("c3", &[])).expect("saves");

    let source = Arc::new(FakeSource::with(vec![candidate("A", "Rear extension", "1 High St")]));
    let crm = Arc::new(FakeCrm::default());
    let service = service(
        repository.clone(),
        source,
        Arc::new(FakeDetails::default()),
        crm.clone(),
    );

    let runs = service.run_all().await.expect("runs");
    let clients: Vec<_> = runs.iter().map(|run| run.client_id.0.as_str()).collect();
    assert_eq!(clients, vec!["c1", "c3"]);

    let delivered = crm.delivered.lock().expect("delivered");
    assert_eq!(delivered.len(), 2, "same reference is a distinct lead per client");
}

#[tokio::test]
async fn test_connection_reports_unknown_clients() {
    let repository = seeded_repository("c1", &[]);
    let crm = Arc::new(FakeCrm::reachable());
    let service = service(
        repository,
        Arc::new(FakeSource::default()),
        Arc::new(FakeDetails::default()),
        crm,
    );

    assert_eq!(
        service
            .test_connection(&ClientId::from("c1"))
            .await
            .expect("connection check"),
        Some(true)
    );
    assert_eq!(
        service
            .test_connection(&ClientId::from("nobody"))
            .await
            .expect("connection check"),
        None
    );
}

#[tokio::test]
async fn criteria_edited_during_a_run_are_not_reverted() {
    let repository = seeded_repository("c1", &["loft"]);
    let source = Arc::new(EditingSource {
        repository: repository.clone(),
        edit: |repository| {
            repository
                .save_criteria(criteria("c1", &["kitchen"]))
                .expect("admin edit saves");
        },
        candidates: vec![candidate("A", "Loft conversion", "1 High St")],
    });
    let service = SyncService::new(
        repository.clone(),
        source,
        Arc::new(FakeDetails::default()),
        Arc::new(FakeCrm::default()),
        SyncSettings {
            delivery_delay: std::time::Duration::ZERO,
            default_lookback_days: 7,
        },
    )
    .with_clock(Arc::new(FixedClock(now())));
    let id = ClientId::from("c1");

    let run = service.run_client_sync(&id).await.expect("run");
    assert_eq!(run.leads_new, 1, "the run filters with the criteria it loaded");

    let stored = repository
        .get_criteria(&id)
        .expect("criteria loads")
        .expect("criteria present");
    assert_eq!(stored.keywords, vec!["kitchen".to_string()]);
    assert_eq!(stored.last_run_at, Some(now()));
}

#[tokio::test]
async fn client_deleted_during_a_run_stays_deleted() {
    let repository = seeded_repository("c1", &[]);
    let source = Arc::new(EditingSource {
        repository: repository.clone(),
        edit: |repository| {
            repository
                .delete_client(&ClientId::from("c1"))
                .expect("admin delete succeeds");
        },
        candidates: Vec::new(),
    });
    let service = SyncService::new(
        repository.clone(),
        source,
        Arc::new(FakeDetails::default()),
        Arc::new(FakeCrm::default()),
        SyncSettings {
            delivery_delay: std::time::Duration::ZERO,
            default_lookback_days: 7,
        },
    )
    .with_clock(Arc::new(FixedClock(now())));
    let id = ClientId::from("c1");

    let run = service.run_client_sync(&id).await.expect("run");
    assert!(run.errors.is_empty());
    assert!(repository.get_criteria(&id).expect("criteria loads").is_none());
}

#[tokio::test]
async fn delivery_pause_follows_every_attempt() {
    let repository = seeded_repository("c1", &[]);
    let source = Arc::new(FakeSource::with(vec![
        candidate("PA/1", "Rear extension", "1 High St"),
        candidate("PA/2", "Garage conversion", "2 High St"),
    ]));
    let delay = std::time::Duration::from_millis(100);
    let service = SyncService::new(
        repository,
        source,
        Arc::new(FakeDetails::default()),
        Arc::new(FakeCrm::rejecting("PA/1")),
        SyncSettings {
            delivery_delay: delay,
            default_lookback_days: 7,
        },
    )
    .with_clock(Arc::new(FixedClock(now())));

    let started = Instant::now();
    let run = service
        .run_client_sync(&ClientId::from("c1"))
        .await
        .expect("run");

    assert_eq!((run.leads_sent, run.errors.len()), (1, 1));
    assert!(started.elapsed() >= delay * 2);
}

#[tokio::test]
async fn candidates_without_reference_are_skipped() {
    let repository = seeded_repository("c1", &[]);
    let source = Arc::new(FakeSource::with(vec![
        candidate("", "Rear extension", "1 High St"),
        candidate("  ", "Side extension", "2 High St"),
        candidate("B", "Garage conversion", "3 High St"),
    ]));
    let crm = Arc::new(FakeCrm::default());
    let service = service(
        repository.clone(),
        source,
        Arc::new(FakeDetails::default()),
        crm.clone(),
    );

    let run = service
        .run_client_sync(&ClientId::from("c1"))
        .await
        .expect("run");

    assert_eq!(run.leads_found, 3);
    assert_eq!(run.leads_new, 1);
    let leads = repository.all_leads();
    assert_eq!(leads.len(), 1);
    assert_eq!(leads[0].external_reference, "B");
    assert_eq!(crm.delivered.lock().expect("delivered").len(), 1);
}
