use crate::db::tables;
use crate::debounce::Debouncer;
use crate::errors::{AppError, AppResult};
use crate::models::{GridLayout, PinWidgetPayload, PinnedWidget, QueryDescriptor, WidgetLayoutItem};
use crate::multiplexer::{Subscription, TableChangeMultiplexer};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Duration;

pub const DEFAULT_LAYOUT_DEBOUNCE: Duration = Duration::from_millis(800);

pub trait WidgetBackend: Send + Sync {
    fn list_widgets(&self, owner_id: &str) -> AppResult<Vec<PinnedWidget>>;
    fn pin_widget(&self, payload: &PinWidgetPayload) -> AppResult<PinnedWidget>;
    fn unpin_widget(&self, owner_id: &str, widget_id: &str) -> AppResult<bool>;
    fn rename_widget(&self, owner_id: &str, widget_id: &str, title: &str) -> AppResult<PinnedWidget>;
    fn save_widget_layouts(&self, owner_id: &str, layouts: &[WidgetLayoutItem]) -> AppResult<usize>;
    fn clear_widgets(&self, owner_id: &str) -> AppResult<u64>;
}

struct StoreInner {
    owner_id: String,
    backend: Arc<dyn WidgetBackend>,
    cache: RwLock<Vec<PinnedWidget>>,
    version: watch::Sender<u64>,
}

impl StoreInner {
    fn read(&self) -> AppResult<std::sync::RwLockReadGuard<'_, Vec<PinnedWidget>>> {
        self.cache
            .read()
            .map_err(|_| AppError::Internal("widget cache lock poisoned".to_string()))
    }

    fn write(&self) -> AppResult<std::sync::RwLockWriteGuard<'_, Vec<PinnedWidget>>> {
        self.cache
            .write()
            .map_err(|_| AppError::Internal("widget cache lock poisoned".to_string()))
    }

    fn bump(&self) {
        self.version.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn reload(&self) -> AppResult<Vec<PinnedWidget>> {
        let widgets = self.backend.list_widgets(&self.owner_id)?;
        *self.write()? = widgets.clone();
        self.bump();
        Ok(widgets)
    }
}

#[derive(Clone)]
pub struct PinnedWidgetStore {
    inner: Arc<StoreInner>,
}

impl PinnedWidgetStore {
    pub fn new(owner_id: impl Into<String>, backend: Arc<dyn WidgetBackend>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(StoreInner {
                owner_id: owner_id.into(),
                backend,
                cache: RwLock::new(Vec::new()),
                version,
            }),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    pub fn load(&self) -> AppResult<Vec<PinnedWidget>> {
        self.inner.reload()
    }

    pub fn widgets(&self) -> AppResult<Vec<PinnedWidget>> {
        Ok(self.inner.read()?.clone())
    }

    pub fn get(&self, widget_id: &str) -> AppResult<Option<PinnedWidget>> {
        Ok(self.inner.read()?.iter().find(|widget| widget.id == widget_id).cloned())
    }

    pub fn subscribe_updates(&self) -> watch::Receiver<u64> {
        self.inner.version.subscribe()
    }

    pub fn pin(
        &self,
        component_name: &str,
        query_descriptor: QueryDescriptor,
        title: &str,
        layout: Option<GridLayout>,
    ) -> AppResult<PinnedWidget> {
        let widget = self.inner.backend.pin_widget(&PinWidgetPayload {
            owner_id: self.inner.owner_id.clone(),
            component_name: component_name.to_string(),
            query_descriptor,
            title: title.to_string(),
            layout,
        })?;
        {
            let mut cache = self.inner.write()?;
            if !cache.iter().any(|existing| existing.id == widget.id) {
                cache.push(widget.clone());
            }
        }
        self.inner.bump();
        Ok(widget)
    }

    pub fn unpin(&self, widget_id: &str) -> AppResult<bool> {
        let removed = self.inner.backend.unpin_widget(&self.inner.owner_id, widget_id)?;
        self.inner.write()?.retain(|widget| widget.id != widget_id);
        self.inner.bump();
        Ok(removed)
    }

    pub fn rename(&self, widget_id: &str, title: &str) -> AppResult<PinnedWidget> {
        let renamed = self
            .inner
            .backend
            .rename_widget(&self.inner.owner_id, widget_id, title)?;
        if let Some(cached) = self.inner.write()?.iter_mut().find(|widget| widget.id == widget_id) {
            *cached = renamed.clone();
        }
        self.inner.bump();
        Ok(renamed)
    }

    pub fn batch_save_layouts(&self, layouts: &[WidgetLayoutItem]) -> AppResult<usize> {
        if layouts.is_empty() {
            return Ok(0);
        }
        let saved = self
            .inner
            .backend
            .save_widget_layouts(&self.inner.owner_id, layouts)?;
        {
            let mut cache = self.inner.write()?;
            for item in layouts {
                if let Some(cached) = cache.iter_mut().find(|widget| widget.id == item.id) {
                    cached.layout = item.layout;
                }
            }
        }
        self.inner.bump();
        Ok(saved)
    }

    pub fn clear_all(&self) -> AppResult<u64> {
        let removed = self.inner.backend.clear_widgets(&self.inner.owner_id)?;
        self.inner.write()?.clear();
        self.inner.bump();
        Ok(removed)
    }

    pub fn is_widget_pinned(&self, component_name: &str, descriptor: &QueryDescriptor) -> bool {
        self.find_widget_id(component_name, descriptor).is_some()
    }

    pub fn find_widget_id(&self, component_name: &str, descriptor: &QueryDescriptor) -> Option<String> {
        let cache = self.inner.read().ok()?;
        cache
            .iter()
            .find(|widget| widget.component_name == component_name && widget.query_descriptor == *descriptor)
            .map(|widget| widget.id.clone())
    }

    pub fn watch_changes(&self, multiplexer: &TableChangeMultiplexer) -> AppResult<Subscription> {
        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        multiplexer.subscribe(
            tables::PINNED_WIDGETS,
            Arc::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if let Err(error) = inner.reload() {
                    tracing::warn!(owner_id = %inner.owner_id, error = %error, "failed to reload pinned widgets");
                }
            }),
        )
    }
}

struct LayoutQueue {
    store: PinnedWidgetStore,
    pending: Mutex<BTreeMap<String, GridLayout>>,
}

impl LayoutQueue {
    fn take_batch(&self) -> AppResult<Vec<WidgetLayoutItem>> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| AppError::Internal("layout queue mutex poisoned".to_string()))?;
        Ok(std::mem::take(&mut *pending)
            .into_iter()
            .map(|(id, layout)| WidgetLayoutItem { id, layout })
            .collect())
    }

    fn write_batch(&self) -> AppResult<usize> {
        let batch = self.take_batch()?;
        if batch.is_empty() {
            return Ok(0);
        }
        tracing::debug!(owner_id = %self.store.owner_id(), widgets = batch.len(), "saving widget layouts");
        self.store.batch_save_layouts(&batch)
    }
}

pub struct LayoutSaveDebouncer {
    queue: Arc<LayoutQueue>,
    debouncer: Debouncer,
}

impl LayoutSaveDebouncer {
    pub fn new(runtime: Handle, store: PinnedWidgetStore, quiet: Duration) -> Self {
        let queue = Arc::new(LayoutQueue {
            store,
            pending: Mutex::new(BTreeMap::new()),
        });
        let weak = Arc::downgrade(&queue);
        let debouncer = Debouncer::new(
            runtime,
            quiet,
            Arc::new(move || {
                let Some(queue) = weak.upgrade() else {
                    return;
                };
                if let Err(error) = queue.write_batch() {
                    tracing::warn!(owner_id = %queue.store.owner_id(), error = %error, "failed to save widget layouts");
                }
            }),
        );
        Self { queue, debouncer }
    }

    pub fn on_layout_change(&self, layouts: &[WidgetLayoutItem]) -> AppResult<()> {
        if layouts.is_empty() {
            return Ok(());
        }
        {
            let mut pending = self
                .queue
                .pending
                .lock()
                .map_err(|_| AppError::Internal("layout queue mutex poisoned".to_string()))?;
            for item in layouts {
                pending.insert(item.id.clone(), item.layout);
            }
        }
        self.debouncer.trigger()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    pub fn flush(&self) -> AppResult<usize> {
        self.debouncer.cancel()?;
        self.queue.write_batch()
    }
}
