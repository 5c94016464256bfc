use speedwatch_core::{IdentityCatalog, WindowSchedule};
use speedwatch_hub::config::load_config;
use speedwatch_hub::http::{router, system_clock, AppState};
use speedwatch_hub::logging::init_logging;
use speedwatch_hub::{HttpIdentityDetector, InFlightRegistry, ProcessSupervisor};
use speedwatch_storage::SpeedwatchStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = load_config();
    let log_guard = init_logging(config.debug, &config.log_dir);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let store = match SpeedwatchStore::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(event = "store_open_failed", path = %config.db_path.display(), error = %err);
            return;
        }
    };
    if let Some(path) = config.offices_path.as_ref() {
        if let Err(err) = store.seed_offices_from_file(path) {
            error!(event = "office_seed_failed", path = %path.display(), error = %err);
            return;
        }
    }

    let detector = match HttpIdentityDetector::new(&config.lookup_url, config.lookup_timeout) {
        Ok(detector) => Arc::new(detector),
        Err(err) => {
            error!(event = "lookup_client_failed", error = %err);
            return;
        }
    };

    let catalog = Arc::new(
        IdentityCatalog::default().with_shared_infrastructure(config.shared_infra_isp.clone()),
    );
    let shared_infra = catalog.shared_infrastructure().map(str::to_string);
    let state = AppState {
        offices: store.clone(),
        sink: store.clone(),
        catalog,
        schedule: Arc::new(WindowSchedule::default()),
        detector,
        supervisor: ProcessSupervisor::new(config.tool.timeout, config.tool.kill_grace),
        invocation: config.tool.invocation(),
        registry: InFlightRegistry::new(),
        api_token: config.api_token.clone(),
        clock: system_clock(),
    };
    let app = router(state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        tool = %config.tool.program,
        server_id = ?config.tool.server_id,
        shared_infra = ?shared_infra,
        log_file = ?log_guard.path(),
        auth = config.api_token.is_some()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "hub_error", error = %err);
    }
}
