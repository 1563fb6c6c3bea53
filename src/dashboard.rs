use crate::errors::{AppError, AppResult};
use crate::live_query::{LiveQuery, LiveQueryContext};
use crate::models::{GridLayout, LiveQueryState, PinnedWidget, QueryDescriptor, WidgetLayoutItem, WidgetView};
use crate::multiplexer::Subscription;
use crate::widgets::{LayoutSaveDebouncer, PinnedWidgetStore};
use std::collections::{BTreeMap, HashSet};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub mounted: usize,
    pub unmounted: usize,
    pub updated: usize,
}

pub struct Dashboard {
    ctx: LiveQueryContext,
    store: PinnedWidgetStore,
    mounts: BTreeMap<String, LiveQuery>,
    layouts: LayoutSaveDebouncer,
    _store_changes: Subscription,
}

impl Dashboard {
    pub fn open(ctx: LiveQueryContext, store: PinnedWidgetStore, layout_quiet: Duration) -> AppResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|error| AppError::Internal(format!("dashboard needs a tokio runtime: {}", error)))?;
        store.load()?;
        let store_changes = store.watch_changes(&ctx.multiplexer)?;
        let layouts = LayoutSaveDebouncer::new(runtime, store.clone(), layout_quiet);

        let mut dashboard = Self {
            ctx,
            store,
            mounts: BTreeMap::new(),
            layouts,
            _store_changes: store_changes,
        };
        let report = dashboard.reconcile()?;
        tracing::info!(
            owner_id = %dashboard.store.owner_id(),
            widgets = report.mounted,
            "dashboard opened"
        );
        Ok(dashboard)
    }

    pub fn store(&self) -> &PinnedWidgetStore {
        &self.store
    }

    pub fn store_updates(&self) -> watch::Receiver<u64> {
        self.store.subscribe_updates()
    }

    pub fn mounted_count(&self) -> usize {
        self.mounts.len()
    }

    pub fn reconcile(&mut self) -> AppResult<ReconcileReport> {
        let widgets = self.store.widgets()?;
        let mut report = ReconcileReport::default();
        let current: HashSet<&str> = widgets.iter().map(|widget| widget.id.as_str()).collect();

        let stale: Vec<String> = self
            .mounts
            .keys()
            .filter(|id| !current.contains(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            if let Some(mut query) = self.mounts.remove(&id) {
                query.unmount();
                report.unmounted += 1;
            }
        }

        for widget in &widgets {
            match self.mounts.get_mut(&widget.id) {
                Some(query) => {
                    if query.set_descriptor(widget.query_descriptor.clone())? {
                        report.updated += 1;
                    }
                }
                None => {
                    let query = LiveQuery::mount(&self.ctx, widget.query_descriptor.clone())?;
                    self.mounts.insert(widget.id.clone(), query);
                    report.mounted += 1;
                }
            }
        }

        if report != ReconcileReport::default() {
            tracing::debug!(
                owner_id = %self.store.owner_id(),
                mounted = report.mounted,
                unmounted = report.unmounted,
                updated = report.updated,
                "reconciled dashboard widgets"
            );
        }
        Ok(report)
    }

    pub fn views(&self) -> AppResult<Vec<WidgetView>> {
        let mut widgets: Vec<PinnedWidget> = self.store.widgets()?;
        widgets.sort_by_key(|widget| (widget.layout.y, widget.layout.x));
        Ok(widgets
            .into_iter()
            .map(|widget| {
                let state = self.mounts.get(&widget.id).map(LiveQuery::state).unwrap_or_default();
                WidgetView { widget, state }
            })
            .collect())
    }

    pub fn state_of(&self, widget_id: &str) -> Option<LiveQueryState> {
        self.mounts.get(widget_id).map(LiveQuery::state)
    }

    pub fn retry(&self, widget_id: &str) -> AppResult<()> {
        let query = self
            .mounts
            .get(widget_id)
            .ok_or_else(|| AppError::NotFound(format!("widget {}", widget_id)))?;
        query.refresh();
        Ok(())
    }

    pub fn refresh_all(&self) -> usize {
        self.ctx.refresh.notify_data_updated()
    }

    pub fn pin(&mut self, component_name: &str, descriptor: QueryDescriptor, title: &str) -> AppResult<PinnedWidget> {
        let widget = self.store.pin(component_name, descriptor, title, None)?;
        self.reconcile()?;
        Ok(widget)
    }

    pub fn unpin(&mut self, widget_id: &str) -> AppResult<bool> {
        let removed = self.store.unpin(widget_id)?;
        self.reconcile()?;
        Ok(removed)
    }

    pub fn on_layout_change(&self, layouts: &[WidgetLayoutItem]) -> AppResult<()> {
        self.layouts.on_layout_change(layouts)
    }

    pub fn move_widget(&self, widget_id: &str, layout: GridLayout) -> AppResult<()> {
        self.on_layout_change(&[WidgetLayoutItem {
            id: widget_id.to_string(),
            layout,
        }])
    }

    pub fn flush_layouts(&self) -> AppResult<usize> {
        self.layouts.flush()
    }

    pub fn close(mut self) -> AppResult<usize> {
        let flushed = self.layouts.flush();
        for (_, mut query) in std::mem::take(&mut self.mounts) {
            query.unmount();
        }
        flushed
    }
}
