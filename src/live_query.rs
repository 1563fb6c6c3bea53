use crate::errors::{AppError, AppResult};
use crate::models::{LiveQueryPhase, LiveQueryState, ParamValue, QueryDescriptor};
use crate::multiplexer::{Subscription, TableChangeMultiplexer};
use crate::refresh::{RefreshBus, RefreshSignal};
use crate::registry::{QueryClient, QueryRegistry};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct LiveQueryContext {
    pub client: Arc<dyn QueryClient>,
    pub registry: Arc<QueryRegistry>,
    pub multiplexer: TableChangeMultiplexer,
    pub refresh: RefreshBus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchTrigger {
    Mount,
    TableChange,
    Focus,
    DataUpdated,
    Manual,
    ParamsChanged,
}

impl FetchTrigger {
    fn is_automatic(self) -> bool {
        matches!(self, Self::TableChange | Self::Focus | Self::DataUpdated)
    }
}

struct HookInner {
    descriptor: QueryDescriptor,
    tables: Vec<String>,
    seq: u64,
    mounted: bool,
    // Code of the last permanent error; automatic triggers skip until a manual retry.
    rejected_code: Option<&'static str>,
    subscription: Subscription,
}

struct HookShared {
    client: Arc<dyn QueryClient>,
    runtime: Handle,
    state: watch::Sender<LiveQueryState>,
    inner: Mutex<HookInner>,
}

impl HookShared {
    fn lock(&self) -> AppResult<MutexGuard<'_, HookInner>> {
        self.inner
            .lock()
            .map_err(|_| AppError::Internal("live query mutex poisoned".to_string()))
    }

    fn start_fetch(self: &Arc<Self>, trigger: FetchTrigger) {
        let (seq, descriptor) = {
            let mut inner = match self.lock() {
                Ok(inner) => inner,
                Err(error) => {
                    tracing::error!(error = %error, "skipping live query fetch");
                    return;
                }
            };
            if !inner.mounted {
                return;
            }
            if let Some(code) = inner.rejected_code.filter(|_| trigger.is_automatic()) {
                tracing::debug!(
                    query_id = %inner.descriptor.query_id,
                    code,
                    trigger = ?trigger,
                    "not retrying a rejected query automatically"
                );
                return;
            }
            inner.seq += 1;
            self.state.send_modify(|state| {
                state.phase = LiveQueryPhase::Loading;
                state.is_loading = true;
            });
            (inner.seq, inner.descriptor.clone())
        };

        tracing::trace!(query_id = %descriptor.query_id, seq, trigger = ?trigger, "starting live query fetch");
        let pending = self.client.fetch(&descriptor);
        let weak = Arc::downgrade(self);
        self.runtime.spawn(async move {
            let result = pending.await;
            if let Some(shared) = weak.upgrade() {
                shared.apply(seq, &descriptor, result);
            }
        });
    }

    fn apply(&self, seq: u64, descriptor: &QueryDescriptor, result: AppResult<serde_json::Value>) {
        let Ok(mut inner) = self.lock() else {
            return;
        };
        if !inner.mounted || inner.seq != seq {
            tracing::debug!(
                query_id = %descriptor.query_id,
                seq,
                latest = inner.seq,
                mounted = inner.mounted,
                "discarding stale live query result"
            );
            return;
        }

        inner.rejected_code = match &result {
            Err(error) if error.is_permanent() => Some(error.code()),
            _ => None,
        };
        match result {
            Ok(data) => self.state.send_modify(|state| {
                state.phase = LiveQueryPhase::Ready;
                state.data = Some(data);
                state.is_loading = false;
                state.error = None;
                state.error_code = None;
                state.updated_at = Some(Utc::now());
            }),
            Err(error) => {
                tracing::warn!(query_id = %descriptor.query_id, error = %error, "live query fetch failed");
                // Last good data stays visible next to the error.
                self.state.send_modify(|state| {
                    state.phase = LiveQueryPhase::Errored;
                    state.is_loading = false;
                    state.error = Some(error.to_string());
                    state.error_code = Some(error.code().to_string());
                });
            }
        }
    }
}

pub struct LiveQuery {
    shared: Arc<HookShared>,
    registry: Arc<QueryRegistry>,
    multiplexer: TableChangeMultiplexer,
    driver: Option<JoinHandle<()>>,
}

impl LiveQuery {
    pub fn mount(ctx: &LiveQueryContext, descriptor: QueryDescriptor) -> AppResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|error| AppError::Internal(format!("live query needs a tokio runtime: {}", error)))?;
        let tables = ctx.registry.tables_for(&descriptor.query_id);
        let (state, _) = watch::channel(LiveQueryState::default());
        let shared = Arc::new(HookShared {
            client: Arc::clone(&ctx.client),
            runtime: runtime.clone(),
            state,
            inner: Mutex::new(HookInner {
                descriptor,
                tables: tables.clone(),
                seq: 0,
                mounted: true,
                rejected_code: None,
                subscription: Subscription::noop(),
            }),
        });

        let subscription = subscribe_tables(&shared, &ctx.multiplexer, &tables)?;
        shared.lock()?.subscription = subscription;

        let driver = runtime.spawn(drive_refresh_signals(Arc::downgrade(&shared), ctx.refresh.subscribe()));
        shared.start_fetch(FetchTrigger::Mount);

        Ok(Self {
            shared,
            registry: Arc::clone(&ctx.registry),
            multiplexer: ctx.multiplexer.clone(),
            driver: Some(driver),
        })
    }

    pub fn refresh(&self) {
        self.shared.start_fetch(FetchTrigger::Manual);
    }

    pub fn state(&self) -> LiveQueryState {
        self.shared.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<LiveQueryState> {
        self.shared.state.subscribe()
    }

    pub fn descriptor(&self) -> AppResult<QueryDescriptor> {
        Ok(self.shared.lock()?.descriptor.clone())
    }

    pub fn tables(&self) -> AppResult<Vec<String>> {
        Ok(self.shared.lock()?.tables.clone())
    }

    pub fn is_mounted(&self) -> bool {
        self.shared.lock().map(|inner| inner.mounted).unwrap_or(false)
    }

    pub fn set_params(&mut self, params: BTreeMap<String, ParamValue>) -> AppResult<bool> {
        let query_id = self.shared.lock()?.descriptor.query_id.clone();
        self.set_descriptor(QueryDescriptor { query_id, params })
    }

    pub fn set_descriptor(&mut self, descriptor: QueryDescriptor) -> AppResult<bool> {
        let tables = self.registry.tables_for(&descriptor.query_id);
        let resubscribe = {
            let mut inner = self.shared.lock()?;
            if !inner.mounted || inner.descriptor == descriptor {
                return Ok(false);
            }
            inner.descriptor = descriptor;
            inner.rejected_code = None;
            inner.tables != tables
        };

        if resubscribe {
            // New listeners go in before the old ones leave so shared tables keep their channel.
            let subscription = subscribe_tables(&self.shared, &self.multiplexer, &tables)?;
            let previous = {
                let mut inner = self.shared.lock()?;
                inner.tables = tables;
                std::mem::replace(&mut inner.subscription, subscription)
            };
            drop(previous);
        }

        self.shared.start_fetch(FetchTrigger::ParamsChanged);
        Ok(true)
    }

    // Releases every subscription. Results still in flight are dropped when
    // they arrive.
    pub fn unmount(&mut self) {
        let subscription = match self.shared.inner.lock() {
            Ok(mut inner) => {
                inner.mounted = false;
                inner.seq += 1;
                Some(std::mem::replace(&mut inner.subscription, Subscription::noop()))
            }
            Err(_) => None,
        };
        drop(subscription);
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.unmount();
    }
}

fn subscribe_tables(
    shared: &Arc<HookShared>,
    multiplexer: &TableChangeMultiplexer,
    tables: &[String],
) -> AppResult<Subscription> {
    if tables.is_empty() {
        return Ok(Subscription::noop());
    }
    let weak = Arc::downgrade(shared);
    multiplexer.subscribe_many(
        tables,
        Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.start_fetch(FetchTrigger::TableChange);
            }
        }),
    )
}

async fn drive_refresh_signals(shared: Weak<HookShared>, mut signals: broadcast::Receiver<RefreshSignal>) {
    loop {
        let trigger = match signals.recv().await {
            Ok(RefreshSignal::Focus) => FetchTrigger::Focus,
            Ok(RefreshSignal::DataUpdated) => FetchTrigger::DataUpdated,
            // Missed signals collapse into a single refresh.
            Err(broadcast::error::RecvError::Lagged(_)) => FetchTrigger::DataUpdated,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.start_fetch(trigger);
    }
}

#[cfg(test)]
mod tests {
    use super::{LiveQuery, LiveQueryContext};
    use crate::errors::{AppError, AppResult};
    use crate::models::{LiveQueryPhase, ParamValue, QueryDescriptor};
    use crate::multiplexer::TableChangeMultiplexer;
    use crate::refresh::RefreshBus;
    use crate::registry::{FetchFuture, NoParams, QueryClient, QueryRegistry};
    use crate::transport::{ChangeEvent, ChangeKind, ChangeTransport, LocalChangeFeed};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;
    use tokio::time::Duration;

    #[derive(Default)]
    struct TestClient {
        calls: Mutex<Vec<QueryDescriptor>>,
        gated: AtomicBool,
        failing: AtomicBool,
        unknown: AtomicBool,
        gates: Mutex<Vec<oneshot::Sender<AppResult<serde_json::Value>>>>,
    }

    impl TestClient {
        fn call_count(&self) -> usize {
            self.calls.lock().expect("calls").len()
        }

        fn release(&self, index: usize, value: serde_json::Value) {
            let mut gates = self.gates.lock().expect("gates");
            let (dummy, _) = oneshot::channel();
            let gate = std::mem::replace(&mut gates[index], dummy);
            let _ = gate.send(Ok(value));
        }
    }

    impl QueryClient for TestClient {
        fn fetch(&self, descriptor: &QueryDescriptor) -> FetchFuture {
            let call = {
                let mut calls = self.calls.lock().expect("calls");
                calls.push(descriptor.clone());
                calls.len()
            };
            if self.gated.load(Ordering::SeqCst) {
                let (sender, receiver) = oneshot::channel();
                self.gates.lock().expect("gates").push(sender);
                return Box::pin(async move {
                    receiver
                        .await
                        .unwrap_or_else(|_| Err(AppError::Internal("gate dropped".to_string())))
                });
            }
            if self.unknown.load(Ordering::SeqCst) {
                let error = AppError::UnknownQuery(descriptor.query_id.clone());
                return Box::pin(async move { Err(error) });
            }
            if self.failing.load(Ordering::SeqCst) {
                return Box::pin(async { Err(AppError::Internal("database offline".to_string())) });
            }
            let params = descriptor.params_json();
            Box::pin(async move { Ok(json!({ "call": call, "params": params })) })
        }
    }

    struct Harness {
        client: Arc<TestClient>,
        feed: LocalChangeFeed,
        ctx: LiveQueryContext,
    }

    fn harness() -> Harness {
        let feed = LocalChangeFeed::new();
        let transport: Arc<dyn ChangeTransport> = Arc::new(feed.clone());
        harness_with(Some(transport), RefreshBus::new(), feed)
    }

    fn harness_with(transport: Option<Arc<dyn ChangeTransport>>, refresh: RefreshBus, feed: LocalChangeFeed) -> Harness {
        let mut registry = QueryRegistry::new();
        registry
            .register("leaveBalance", &["leave_balances"], |_: NoParams| async {
                Ok::<_, AppError>(json!(null))
            })
            .expect("leaveBalance");
        registry
            .register("pendingApprovals", &["leave_requests", "employees"], |_: NoParams| async {
                Ok::<_, AppError>(json!(null))
            })
            .expect("pendingApprovals");

        let multiplexer = TableChangeMultiplexer::new(transport, Duration::from_millis(300)).expect("multiplexer");
        let client = Arc::new(TestClient::default());
        let ctx = LiveQueryContext {
            client: client.clone(),
            registry: Arc::new(registry),
            multiplexer,
            refresh,
        };
        Harness { client, feed, ctx }
    }

    fn balance(employee_id: &str) -> QueryDescriptor {
        QueryDescriptor::new("leaveBalance").with_param("employeeId", employee_id)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mount_fetches_and_becomes_ready() {
        let h = harness();
        let query = LiveQuery::mount(&h.ctx, balance("ZP-1001")).expect("mount");
        assert!(query.state().is_loading);
        settle().await;

        let state = query.state();
        assert_eq!(state.phase, LiveQueryPhase::Ready);
        assert!(!state.is_loading);
        assert_eq!(state.data.expect("data")["params"]["employeeId"], "ZP-1001");
        assert_eq!(h.ctx.multiplexer.listener_count("leave_balances"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn table_change_refetches_after_the_quiet_period() {
        let h = harness();
        let _query = LiveQuery::mount(&h.ctx, balance("ZP-1001")).expect("mount");
        settle().await;
        assert_eq!(h.client.call_count(), 1);

        for _ in 0..5 {
            h.feed
                .publish(ChangeEvent::new("leave_balances", ChangeKind::Update, None));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.client.call_count(), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        settle().await;
        assert_eq!(h.client.call_count(), 2);

        h.feed
            .publish(ChangeEvent::new("attendance", ChangeKind::Insert, None));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.client.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn focus_and_data_updated_broadcasts_refetch() {
        let h = harness();
        let _query = LiveQuery::mount(&h.ctx, balance("ZP-1001")).expect("mount");
        settle().await;

        h.ctx.refresh.notify_focus();
        settle().await;
        assert_eq!(h.client.call_count(), 2);

        h.ctx.refresh.notify_data_updated();
        settle().await;
        assert_eq!(h.client.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_fetch_never_overwrites_newer_data() {
        let h = harness();
        h.client.gated.store(true, Ordering::SeqCst);
        let mut query = LiveQuery::mount(&h.ctx, balance("ZP-1001")).expect("mount");
        assert!(query.set_descriptor(balance("ZP-1002")).expect("set"));
        assert_eq!(h.client.call_count(), 2);

        h.client.release(1, json!("second"));
        settle().await;
        assert_eq!(query.state().data, Some(json!("second")));

        h.client.release(0, json!("first"));
        settle().await;
        let state = query.state();
        assert_eq!(state.data, Some(json!("second")));
        assert_eq!(state.phase, LiveQueryPhase::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn unmount_mid_fetch_ignores_the_result_and_releases_listeners() {
        let h = harness();
        h.client.gated.store(true, Ordering::SeqCst);
        let mut query = LiveQuery::mount(&h.ctx, balance("ZP-1001")).expect("mount");
        let watcher = query.watch();
        assert_eq!(h.feed.open_channels(), 1);

        query.unmount();
        assert!(!query.is_mounted());
        assert_eq!(h.ctx.multiplexer.total_listeners(), 0);
        assert_eq!(h.feed.open_channels(), 0);

        h.client.release(0, json!("late"));
        settle().await;
        assert_eq!(watcher.borrow().data, None);

        query.refresh();
        h.ctx.refresh.notify_focus();
        settle().await;
        assert_eq!(h.client.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_the_last_good_data() {
        let h = harness();
        let query = LiveQuery::mount(&h.ctx, balance("ZP-1001")).expect("mount");
        settle().await;
        let good = query.state().data.expect("initial data");

        h.client.failing.store(true, Ordering::SeqCst);
        query.refresh();
        settle().await;

        let state = query.state();
        assert_eq!(state.phase, LiveQueryPhase::Errored);
        assert_eq!(state.data, Some(good));
        assert_eq!(state.error_code.as_deref(), Some("INTERNAL"));

        h.client.failing.store(false, Ordering::SeqCst);
        query.refresh();
        settle().await;
        let recovered = query.state();
        assert_eq!(recovered.phase, LiveQueryPhase::Ready);
        assert!(recovered.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn equal_params_do_not_refetch_and_new_tables_resubscribe() {
        let h = harness();
        let mut query = LiveQuery::mount(&h.ctx, balance("ZP-1001")).expect("mount");
        settle().await;

        let mut same = BTreeMap::new();
        same.insert("employeeId".to_string(), ParamValue::from("ZP-1001"));
        assert!(!query.set_params(same).expect("same params"));
        assert_eq!(h.client.call_count(), 1);

        let approvals = QueryDescriptor::new("pendingApprovals").with_param("managerId", "ZP-2001");
        assert!(query.set_descriptor(approvals.clone()).expect("switch"));
        settle().await;
        assert_eq!(query.descriptor().expect("descriptor"), approvals);
        assert_eq!(query.tables().expect("tables"), vec!["leave_requests", "employees"]);
        assert_eq!(h.ctx.multiplexer.listener_count("leave_balances"), 0);
        assert_eq!(h.ctx.multiplexer.listener_count("employees"), 1);
        assert_eq!(h.client.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_hook_unsubscribes() {
        let h = harness();
        {
            let _a = LiveQuery::mount(&h.ctx, balance("ZP-1001")).expect("a");
            let _b = LiveQuery::mount(&h.ctx, balance("ZP-1002")).expect("b");
            assert_eq!(h.ctx.multiplexer.listener_count("leave_balances"), 2);
            assert_eq!(h.feed.channels_opened_total(), 1);
        }
        assert_eq!(h.ctx.multiplexer.total_listeners(), 0);
        assert_eq!(h.feed.open_channels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_query_waits_for_a_manual_retry() {
        let h = harness();
        h.client.unknown.store(true, Ordering::SeqCst);
        let query = LiveQuery::mount(&h.ctx, balance("ZP-1001")).expect("mount");
        settle().await;
        assert_eq!(query.state().error_code.as_deref(), Some("UNKNOWN_QUERY"));
        assert_eq!(h.client.call_count(), 1);

        for _ in 0..3 {
            h.ctx.refresh.notify_focus();
        }
        h.ctx.refresh.notify_data_updated();
        h.feed
            .publish(ChangeEvent::new("leave_balances", ChangeKind::Update, None));
        tokio::time::sleep(Duration::from_millis(400)).await;
        settle().await;
        assert_eq!(h.client.call_count(), 1);

        h.client.unknown.store(false, Ordering::SeqCst);
        query.refresh();
        settle().await;
        assert_eq!(h.client.call_count(), 2);
        assert_eq!(query.state().phase, LiveQueryPhase::Ready);

        h.ctx.refresh.notify_focus();
        settle().await;
        assert_eq!(h.client.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_still_refresh_on_focus() {
        let h = harness();
        h.client.failing.store(true, Ordering::SeqCst);
        let query = LiveQuery::mount(&h.ctx, balance("ZP-1001")).expect("mount");
        settle().await;
        assert_eq!(query.state().error_code.as_deref(), Some("INTERNAL"));

        h.ctx.refresh.notify_focus();
        settle().await;
        assert_eq!(h.client.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn without_a_transport_focus_still_refreshes() {
        let h = harness_with(None, RefreshBus::new(), LocalChangeFeed::new());
        let query = LiveQuery::mount(&h.ctx, balance("ZP-1001")).expect("mount");
        settle().await;
        assert_eq!(query.state().phase, LiveQueryPhase::Ready);
        assert!(!h.ctx.multiplexer.is_enabled());
        assert_eq!(h.ctx.multiplexer.total_listeners(), 0);

        h.ctx.refresh.notify_focus();
        settle().await;
        assert_eq!(h.client.call_count(), 2);

        h.ctx.refresh.notify_data_updated();
        settle().await;
        assert_eq!(h.client.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn lagged_signal_receiver_still_refreshes() {
        let feed = LocalChangeFeed::new();
        let transport: Arc<dyn ChangeTransport> = Arc::new(feed.clone());
        let h = harness_with(Some(transport), RefreshBus::with_capacity(2), feed);
        let _query = LiveQuery::mount(&h.ctx, balance("ZP-1001")).expect("mount");
        settle().await;
        assert_eq!(h.client.call_count(), 1);

        // Five signals into a two-slot channel: one refresh for the lag, then the two retained.
        for _ in 0..5 {
            h.ctx.refresh.notify_focus();
        }
        settle().await;
        assert_eq!(h.client.call_count(), 4);
    }
}
