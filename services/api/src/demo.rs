use chrono::Utc;
use clap::Args;
use lead_sync::workflows::planning::{
    ClientAccount, ClientId, CrmCredentials, RepositoryError, SyncCriteria, SyncRepository,
};
use std::path::PathBuf;

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// State database to seed. Defaults to the configured SYNC_STATE_PATH.
    #[arg(long)]
    pub(crate) state_path: Option<PathBuf>,
}

struct DemoClient {
    id: &'static str,
    company_name: &'static str,
    contact_email: &'static str,
    api_key: &'static str,
    location_id: &'static str,
    pipeline_id: &'static str,
    stage_id: &'static str,
    postcode: &'static str,
    radius_km: f64,
    application_types: &'static [&'static str],
    keywords: &'static [&'static str],
    schedule_day: u8,
}

const DEMO_CLIENTS: [DemoClient; 2] = [
    DemoClient {
        id: "c1",
        company_name: "Premium Extensions Ltd",
        contact_email: "hello@premiumextensions.com",
        api_key: "ghl_live_88293048",
        location_id: "LOC_8821",
        pipeline_id: "PI_992",
        stage_id: "ST_01",
        postcode: "SW1A 1AA",
        radius_km: 15.0,
        application_types: &["Extension", "Refurbishment"],
        keywords: &["kitchen", "double-storey"],
        schedule_day: 1,
    },
    DemoClient {
        id: "c2",
        company_name: "The Loft Specialists",
        contact_email: "info@loftspecialists.co.uk",
        api_key: "ghl_live_11233445",
        location_id: "LOC_4422",
        pipeline_id: "PI_773",
        stage_id: "ST_02",
        postcode: "N1 9GU",
        radius_km: 10.0,
        application_types: &["Loft"],
        keywords: &["conversion"],
        schedule_day: 3,
    },
];

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

/// Seeds the demo clients and their criteria when the store has no clients.
/// Returns how many clients were written.
pub(crate) fn seed_demo_clients<R>(repository: &R) -> Result<usize, RepositoryError>
where
    R: SyncRepository + ?Sized,
{
    if !repository.list_clients()?.is_empty() {
        return Ok(0);
    }

    let now = Utc::now();
    for demo in &DEMO_CLIENTS {
        let id = ClientId::from(demo.id);
        repository.save_client(ClientAccount {
            id: id.clone(),
            company_name: demo.company_name.to_string(),
            contact_email: demo.contact_email.to_string(),
            crm: CrmCredentials {
                api_key: demo.api_key.to_string(),
                location_id: demo.location_id.to_string(),
                pipeline_id: demo.pipeline_id.to_string(),
                stage_id: demo.stage_id.to_string(),
            },
            active: true,
            created_at: now,
        })?;
        repository.save_criteria(SyncCriteria {
            client_id: id,
            postcode: demo.postcode.to_string(),
            radius_km: demo.radius_km,
            application_types: strings(demo.application_types),
            keywords: strings(demo.keywords),
            schedule_day: demo.schedule_day,
            last_run_at: None,
        })?;
    }
    Ok(DEMO_CLIENTS.len())
}
