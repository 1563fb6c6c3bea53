use crate::debounce::Debouncer;
use crate::errors::{AppError, AppResult};
use crate::transport::{ChangeTransport, RawChangeHandler, TransportChannel};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use tokio::time::Duration;

pub const DEFAULT_CHANGE_DEBOUNCE: Duration = Duration::from_millis(300);

pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

struct ChannelEntry {
    listeners: Vec<(u64, ChangeListener)>,
    channel: Option<Box<dyn TransportChannel>>,
    debouncer: Debouncer,
}

struct MultiplexerShared {
    transport: Option<Arc<dyn ChangeTransport>>,
    quiet: Duration,
    runtime: Handle,
    channels: Mutex<HashMap<String, ChannelEntry>>,
    next_listener_id: AtomicU64,
}

impl MultiplexerShared {
    fn lock(&self) -> AppResult<MutexGuard<'_, HashMap<String, ChannelEntry>>> {
        self.channels
            .lock()
            .map_err(|_| AppError::Internal("multiplexer mutex poisoned".to_string()))
    }

    fn on_raw_event(&self, table: &str) {
        let channels = match self.lock() {
            Ok(channels) => channels,
            Err(error) => {
                tracing::error!(table = %table, error = %error, "dropping change event");
                return;
            }
        };
        if let Some(entry) = channels.get(table) {
            if let Err(error) = entry.debouncer.trigger() {
                tracing::error!(table = %table, error = %error, "failed to arm change debounce");
            }
        }
    }

    fn fan_out(&self, table: &str) {
        // Listeners may unsubscribe from inside their own callback, so iterate
        // over a snapshot with the lock released.
        let listeners: Vec<ChangeListener> = match self.lock() {
            Ok(channels) => channels
                .get(table)
                .map(|entry| entry.listeners.iter().map(|(_, listener)| Arc::clone(listener)).collect())
                .unwrap_or_default(),
            Err(error) => {
                tracing::error!(table = %table, error = %error, "skipping change fan-out");
                return;
            }
        };

        tracing::debug!(table = %table, listeners = listeners.len(), "fanning out table change");
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                tracing::error!(table = %table, "change listener panicked");
            }
        }
    }

    fn remove_listener(&self, table: &str, listener_id: u64) {
        let closing = {
            let mut channels = match self.lock() {
                Ok(channels) => channels,
                Err(error) => {
                    tracing::error!(table = %table, error = %error, "failed to remove change listener");
                    return;
                }
            };
            let Some(entry) = channels.get_mut(table) else {
                return;
            };
            entry.listeners.retain(|(id, _)| *id != listener_id);
            if !entry.listeners.is_empty() {
                return;
            }
            let Some(mut entry) = channels.remove(table) else {
                return;
            };
            if let Err(error) = entry.debouncer.cancel() {
                tracing::warn!(table = %table, error = %error, "failed to cancel change debounce");
            }
            entry.channel.take()
        };

        if let Some(channel) = closing {
            channel.close();
            tracing::debug!(table = %table, "closed change channel");
        }
    }
}

#[derive(Clone)]
pub struct TableChangeMultiplexer {
    shared: Arc<MultiplexerShared>,
}

impl TableChangeMultiplexer {
    // Builds a multiplexer on the current tokio runtime. A `None` transport
    // turns every subscription into a no-op.
    pub fn new(transport: Option<Arc<dyn ChangeTransport>>, quiet: Duration) -> AppResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|error| AppError::Internal(format!("multiplexer needs a tokio runtime: {}", error)))?;
        Ok(Self::with_runtime(runtime, transport, quiet))
    }

    pub fn with_runtime(runtime: Handle, transport: Option<Arc<dyn ChangeTransport>>, quiet: Duration) -> Self {
        if transport.is_none() {
            tracing::info!("change transport not configured; live queries fall back to focus and manual refresh");
        }
        Self {
            shared: Arc::new(MultiplexerShared {
                transport,
                quiet,
                runtime,
                channels: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.transport.is_some()
    }

    pub fn subscribe(&self, table: &str, listener: ChangeListener) -> AppResult<Subscription> {
        let mut subscription = Subscription::noop();
        if let Some(listener_id) = self.attach(table, listener)? {
            subscription.shared = Some(Arc::downgrade(&self.shared));
            subscription.entries.push((table.to_string(), listener_id));
        }
        Ok(subscription)
    }

    pub fn subscribe_many<S: AsRef<str>>(&self, tables: &[S], listener: ChangeListener) -> AppResult<Subscription> {
        let mut subscription = Subscription::noop();
        if !self.is_enabled() {
            return Ok(subscription);
        }
        subscription.shared = Some(Arc::downgrade(&self.shared));
        for table in tables {
            let table = table.as_ref();
            if subscription.entries.iter().any(|(existing, _)| existing == table) {
                continue;
            }
            // On error the partial subscription is dropped, releasing what was attached.
            if let Some(listener_id) = self.attach(table, Arc::clone(&listener))? {
                subscription.entries.push((table.to_string(), listener_id));
            }
        }
        Ok(subscription)
    }

    pub fn channel_count(&self) -> usize {
        self.shared.lock().map(|channels| channels.len()).unwrap_or(0)
    }

    pub fn listener_count(&self, table: &str) -> usize {
        self.shared
            .lock()
            .ok()
            .and_then(|channels| channels.get(table).map(|entry| entry.listeners.len()))
            .unwrap_or(0)
    }

    pub fn total_listeners(&self) -> usize {
        self.shared
            .lock()
            .map(|channels| channels.values().map(|entry| entry.listeners.len()).sum())
            .unwrap_or(0)
    }

    fn attach(&self, table: &str, listener: ChangeListener) -> AppResult<Option<u64>> {
        let Some(transport) = self.shared.transport.as_ref() else {
            return Ok(None);
        };

        let listener_id = self.shared.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let mut channels = self.shared.lock()?;
        if let Some(entry) = channels.get_mut(table) {
            entry.listeners.push((listener_id, listener));
            return Ok(Some(listener_id));
        }

        let weak = Arc::downgrade(&self.shared);
        let fan_out_table = table.to_string();
        let debouncer = Debouncer::new(
            self.shared.runtime.clone(),
            self.shared.quiet,
            Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.fan_out(&fan_out_table);
                }
            }),
        );

        let weak = Arc::downgrade(&self.shared);
        let raw_table = table.to_string();
        let handler: RawChangeHandler = Arc::new(move |_event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_raw_event(&raw_table);
            }
        });
        let channel = transport.open_channel(table, handler)?;
        tracing::debug!(table = %table, "opened change channel");

        channels.insert(
            table.to_string(),
            ChannelEntry {
                listeners: vec![(listener_id, listener)],
                channel: Some(channel),
                debouncer,
            },
        );
        Ok(Some(listener_id))
    }
}

pub struct Subscription {
    shared: Option<Weak<MultiplexerShared>>,
    entries: Vec<(String, u64)>,
}

impl Subscription {
    pub fn noop() -> Self {
        Self {
            shared: None,
            entries: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn tables(&self) -> Vec<&str> {
        self.entries.iter().map(|(table, _)| table.as_str()).collect()
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let entries = std::mem::take(&mut self.entries);
        let Some(shared) = self.shared.take().and_then(|weak| weak.upgrade()) else {
            return;
        };
        for (table, listener_id) in entries {
            shared.remove_listener(&table, listener_id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("entries", &self.entries).finish()
    }
}
