use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub row_id: Option<String>,
    pub committed_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, kind: ChangeKind, row_id: Option<String>) -> Self {
        Self {
            table: table.into(),
            kind,
            row_id,
            committed_at: Utc::now(),
        }
    }
}

pub type RawChangeHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

pub trait TransportChannel: Send {
    fn table(&self) -> &str;
    fn close(self: Box<Self>);
}

// Delivery is at-least-once with best-effort ordering; consumers re-fetch
// idempotently, so duplicates are harmless.
pub trait ChangeTransport: Send + Sync {
    fn open_channel(&self, table: &str, handler: RawChangeHandler) -> AppResult<Box<dyn TransportChannel>>;
}

#[derive(Default)]
struct FeedState {
    handlers: HashMap<u64, (String, RawChangeHandler)>,
}

#[derive(Clone, Default)]
pub struct LocalChangeFeed {
    state: Arc<Mutex<FeedState>>,
    next_id: Arc<AtomicU64>,
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl LocalChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: ChangeEvent) {
        let targets: Vec<RawChangeHandler> = match self.state.lock() {
            Ok(state) => state
                .handlers
                .values()
                .filter(|(table, _)| *table == event.table)
                .map(|(_, handler)| Arc::clone(handler))
                .collect(),
            Err(_) => {
                tracing::error!(table = %event.table, "change feed mutex poisoned, dropping event");
                return;
            }
        };
        tracing::trace!(table = %event.table, kind = ?event.kind, receivers = targets.len(), "publishing change");
        for handler in targets {
            handler(event.clone());
        }
    }

    pub fn publish_all<'a>(&self, tables: impl IntoIterator<Item = &'a str>, kind: ChangeKind, row_id: Option<&str>) {
        for table in tables {
            self.publish(ChangeEvent::new(table, kind, row_id.map(ToString::to_string)));
        }
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().map(|state| state.handlers.len()).unwrap_or(0)
    }

    pub fn channels_opened_total(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn channels_closed_total(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl ChangeTransport for LocalChangeFeed {
    fn open_channel(&self, table: &str, handler: RawChangeHandler) -> AppResult<Box<dyn TransportChannel>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut state = self
            .state
            .lock()
            .map_err(|_| AppError::Transport("change feed mutex poisoned".to_string()))?;
        state.handlers.insert(id, (table.to_string(), handler));
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LocalChannel {
            id,
            table: table.to_string(),
            feed: self.clone(),
        }))
    }
}

struct LocalChannel {
    id: u64,
    table: String,
    feed: LocalChangeFeed,
}

impl TransportChannel for LocalChannel {
    fn table(&self) -> &str {
        &self.table
    }

    fn close(self: Box<Self>) {
        if let Ok(mut state) = self.feed.state.lock() {
            if state.handlers.remove(&self.id).is_some() {
                self.feed.closed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}
