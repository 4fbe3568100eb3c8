use crate::cli::ServeArgs;
use crate::infra::{AppState, SqliteStore};
use crate::routes::with_sync_routes;
use axum::Extension;
use axum_prometheus::PrometheusMetricLayer;
use lead_sync::config::AppConfig;
use lead_sync::error::AppError;
use lead_sync::telemetry;
use lead_sync::workflows::planning::{
    LeadConnectorClient, PaginationSettings, PlanItClient, SyncService, SyncSettings,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

/// Wires the HTTP connectors and the given store into a sync service.
pub(crate) fn build_service(
    config: &AppConfig,
    store: SqliteStore,
) -> Result<Arc<SyncService<SqliteStore>>, AppError> {
    let http = reqwest::Client::builder()
        .timeout(config.upstream.http_timeout)
        .build()?;

    let planit = Arc::new(
        PlanItClient::new(http.clone(), config.upstream.planit_base_url.clone()).with_pagination(
            PaginationSettings {
                page_delay: config.sync.page_delay,
                rate_limit_wait: config.sync.rate_limit_wait,
                max_records: config.sync.max_records,
                ..PaginationSettings::default()
            },
        ),
    );
    let crm = Arc::new(LeadConnectorClient::new(
        http,
        config.upstream.crm_base_url.clone(),
        config.upstream.crm_api_version.clone(),
    ));

    Ok(Arc::new(SyncService::new(
        Arc::new(store),
        planit.clone(),
        planit,
        crm,
        SyncSettings {
            delivery_delay: config.sync.delivery_delay,
            default_lookback_days: config.sync.default_lookback_days,
        },
    )))
}

pub(crate) async fn run(mut args: ServeArgs) -> Result<(), AppError> {
    let mut config = AppConfig::load()?;

    if let Some(host) = args.host.take() {
        config.server.host = host;
    }
    if let Some(port) = args.port.take() {
        config.server.port = port;
    }

    telemetry::init(&config.telemetry)?;

    let (prometheus_layer, prometheus_handle) = PrometheusMetricLayer::pair();
    let readiness_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let app_state = AppState {
        readiness: readiness_flag.clone(),
        metrics: Arc::new(prometheus_handle),
    };

    let store = SqliteStore::open(&config.storage.state_path)?;
    info!(path = %store.path().display(), "state store opened");
    let sync_service = build_service(&config, store)?;

    let app = with_sync_routes(sync_service)
        .layer(Extension(app_state))
        .layer(prometheus_layer);

    let addr = config.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    readiness_flag.store(true, Ordering::Release);

    info!(?config.environment, %addr, "lead sync service ready");

    axum::serve(listener, app).await?;
    Ok(())
}
