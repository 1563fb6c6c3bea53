pub mod config;
pub mod dashboard;
pub mod db;
pub mod debounce;
pub mod errors;
pub mod live_query;
pub mod models;
pub mod multiplexer;
pub mod queries;
pub mod refresh;
pub mod registry;
pub mod server;
pub mod transport;
pub mod widgets;

use crate::config::{AppSettings, CONFIG_PATH_ENV};
use crate::dashboard::Dashboard;
use crate::db::Database;
use crate::errors::AppResult;
use crate::live_query::LiveQueryContext;
use crate::models::{
    Announcement, AttendanceRecord, DecideLeaveRequestPayload, LeaveRequestRecord, PostAnnouncementPayload,
    QueryRequest, QueryResponse, SubmitLeaveRequestPayload,
};
use crate::multiplexer::TableChangeMultiplexer;
use crate::queries::hr_registry;
use crate::refresh::RefreshBus;
use crate::registry::QueryRegistry;
use crate::transport::{ChangeTransport, LocalChangeFeed};
use crate::widgets::{PinnedWidgetStore, WidgetBackend};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

pub struct AppCore {
    settings: AppSettings,
    db: Arc<Database>,
    registry: Arc<QueryRegistry>,
    multiplexer: TableChangeMultiplexer,
    refresh: RefreshBus,
}

impl AppCore {
    // Must be called inside a tokio runtime; the multiplexer spawns its
    // debounce timers on it.
    pub fn new(settings: AppSettings) -> AppResult<Self> {
        settings.validate()?;
        let feed = LocalChangeFeed::new();
        let db = Arc::new(Database::new(&settings.database_path(), feed.clone())?);
        if settings.seed_demo_data && db.seed_demo_data()? {
            tracing::info!(path = %db.path().display(), "seeded demo personas");
        }

        let registry = Arc::new(hr_registry(Arc::clone(&db))?);
        let transport: Option<Arc<dyn ChangeTransport>> = if settings.realtime_enabled {
            Some(Arc::new(feed))
        } else {
            None
        };
        let multiplexer = TableChangeMultiplexer::new(transport, settings.change_debounce())?;

        Ok(Self {
            settings,
            db,
            registry,
            multiplexer,
            refresh: RefreshBus::new(),
        })
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn registry(&self) -> &Arc<QueryRegistry> {
        &self.registry
    }

    pub fn multiplexer(&self) -> &TableChangeMultiplexer {
        &self.multiplexer
    }

    pub fn refresh_bus(&self) -> &RefreshBus {
        &self.refresh
    }

    pub fn live_query_context(&self) -> LiveQueryContext {
        LiveQueryContext {
            client: self.registry.clone(),
            registry: Arc::clone(&self.registry),
            multiplexer: self.multiplexer.clone(),
            refresh: self.refresh.clone(),
        }
    }

    pub fn widget_store(&self, owner_id: &str) -> PinnedWidgetStore {
        let backend: Arc<dyn WidgetBackend> = self.db.clone();
        PinnedWidgetStore::new(owner_id, backend)
    }

    pub fn open_dashboard(&self, owner_id: &str) -> AppResult<Dashboard> {
        Dashboard::open(
            self.live_query_context(),
            self.widget_store(owner_id),
            self.settings.layout_debounce(),
        )
    }

    pub async fn resolve_query(&self, request: QueryRequest) -> AppResult<QueryResponse> {
        let started = std::time::Instant::now();
        let data = self.registry.resolve(&request.query_id, request.params).await?;
        tracing::debug!(
            query_id = %request.query_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "resolved query"
        );
        Ok(QueryResponse {
            data,
            query_id: request.query_id,
            timestamp: Utc::now(),
        })
    }

    pub fn submit_leave_request(&self, payload: &SubmitLeaveRequestPayload) -> AppResult<LeaveRequestRecord> {
        let record = self.db.submit_leave_request(payload)?;
        self.announce_data_updated("leave request submitted");
        Ok(record)
    }

    pub fn decide_leave_request(&self, payload: &DecideLeaveRequestPayload) -> AppResult<LeaveRequestRecord> {
        let record = self.db.decide_leave_request(payload)?;
        self.announce_data_updated("leave request decided");
        Ok(record)
    }

    pub fn record_attendance(&self, record: &AttendanceRecord) -> AppResult<AttendanceRecord> {
        let saved = self.db.record_attendance(record)?;
        self.announce_data_updated("attendance recorded");
        Ok(saved)
    }

    pub fn post_announcement(&self, payload: &PostAnnouncementPayload) -> AppResult<Announcement> {
        let announcement = self.db.post_announcement(payload)?;
        self.announce_data_updated("announcement posted");
        Ok(announcement)
    }

    fn announce_data_updated(&self, reason: &str) {
        let receivers = self.refresh.notify_data_updated();
        tracing::debug!(reason, receivers, "broadcast data-updated");
    }
}

fn init_tracing(log_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "hr-dashboard.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}

pub async fn run() -> anyhow::Result<()> {
    let config_path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
    let settings = AppSettings::load(config_path.as_deref())?;
    std::fs::create_dir_all(&settings.data_dir)?;
    init_tracing(&settings.log_dir()).map_err(anyhow::Error::msg)?;

    let core = Arc::new(AppCore::new(settings)?);
    let addr = core.settings().listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(
        addr = %addr,
        realtime = core.multiplexer().is_enabled(),
        "hr dashboard listening"
    );

    let app = server::router(Arc::clone(&core));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("hr dashboard stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::AppCore;
    use crate::config::AppSettings;
    use crate::models::{LeaveStatus, PostAnnouncementPayload, QueryRequest};
    use crate::refresh::RefreshSignal;
    use serde_json::json;

    fn settings(dir: &tempfile::TempDir) -> AppSettings {
        AppSettings {
            data_dir: dir.path().to_path_buf(),
            ..AppSettings::default()
        }
    }

    #[tokio::test]
    async fn core_seeds_once_and_serves_queries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = AppCore::new(settings(&dir)).expect("core");
        assert!(core.multiplexer().is_enabled());
        drop(core);

        let core = AppCore::new(settings(&dir)).expect("reopen core");
        let response = core
            .resolve_query(QueryRequest {
                query_id: "leaveRequests".to_string(),
                params: json!({ "employeeId": "ZP-1002", "status": "pending" }),
            })
            .await
            .expect("query");
        assert_eq!(response.query_id, "leaveRequests");
        let rows = response.data.as_array().expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], LeaveStatus::Pending.as_str());
    }

    #[tokio::test]
    async fn realtime_can_be_switched_off() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = AppCore::new(AppSettings {
            realtime_enabled: false,
            ..settings(&dir)
        })
        .expect("core");
        assert!(!core.multiplexer().is_enabled());
    }

    #[tokio::test]
    async fn hr_writes_broadcast_data_updated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = AppCore::new(settings(&dir)).expect("core");
        let mut signals = core.refresh_bus().subscribe();

        core.post_announcement(&PostAnnouncementPayload {
            author_id: "ZP-3001".to_string(),
            title: "Office closed Friday".to_string(),
            body: "Building maintenance.".to_string(),
            audience: None,
        })
        .expect("post");

        assert_eq!(signals.recv().await.expect("signal"), RefreshSignal::DataUpdated);
    }
}
