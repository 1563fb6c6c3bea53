use crate::errors::{AppError, AppResult};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

type DebouncedAction = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebouncePhase {
    Idle,
    Pending { deadline: Instant },
    Firing,
}

struct DebounceInner {
    phase: DebouncePhase,
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

pub struct Debouncer {
    quiet: Duration,
    runtime: Handle,
    inner: Arc<Mutex<DebounceInner>>,
    action: DebouncedAction,
}

impl Debouncer {
    pub fn new(runtime: Handle, quiet: Duration, action: DebouncedAction) -> Self {
        Self {
            quiet,
            runtime,
            inner: Arc::new(Mutex::new(DebounceInner {
                phase: DebouncePhase::Idle,
                epoch: 0,
                timer: None,
            })),
            action,
        }
    }

    pub fn phase(&self) -> AppResult<DebouncePhase> {
        let inner = self.lock()?;
        Ok(inner.phase)
    }

    pub fn trigger(&self) -> AppResult<()> {
        let mut inner = self.lock()?;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.epoch = inner.epoch.wrapping_add(1);
        let epoch = inner.epoch;
        let deadline = Instant::now() + self.quiet;
        inner.phase = DebouncePhase::Pending { deadline };

        let shared = Arc::clone(&self.inner);
        let action = Arc::clone(&self.action);
        inner.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fire(&shared, &action, epoch);
        }));
        Ok(())
    }

    pub fn cancel(&self) -> AppResult<()> {
        let mut inner = self.lock()?;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.epoch = inner.epoch.wrapping_add(1);
        inner.phase = DebouncePhase::Idle;
        Ok(())
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, DebounceInner>> {
        self.inner
            .lock()
            .map_err(|_| AppError::Internal("debouncer mutex poisoned".to_string()))
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
        }
    }
}

fn fire(shared: &Mutex<DebounceInner>, action: &DebouncedAction, epoch: u64) {
    {
        let Ok(mut inner) = shared.lock() else {
            return;
        };
        // A trigger or cancel that raced the timer owns the next firing.
        if inner.epoch != epoch || !matches!(inner.phase, DebouncePhase::Pending { .. }) {
            return;
        }
        inner.phase = DebouncePhase::Firing;
        inner.timer = None;
    }

    if catch_unwind(AssertUnwindSafe(|| action())).is_err() {
        tracing::error!("debounced action panicked");
    }

    if let Ok(mut inner) = shared.lock() {
        if inner.epoch == epoch && inner.phase == DebouncePhase::Firing {
            inner.phase = DebouncePhase::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DebouncePhase, Debouncer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Duration;

    fn counting_debouncer(quiet_ms: u64) -> (Debouncer, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let action_count = Arc::clone(&count);
        let debouncer = Debouncer::new(
            tokio::runtime::Handle::current(),
            Duration::from_millis(quiet_ms),
            Arc::new(move || {
                action_count.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (debouncer, count)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_one_action() {
        let (debouncer, count) = counting_debouncer(300);
        for _ in 0..10 {
            debouncer.trigger().expect("trigger");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(matches!(debouncer.phase().expect("phase"), DebouncePhase::Pending { .. }));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(debouncer.phase().expect("phase"), DebouncePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn separated_triggers_fire_separately() {
        let (debouncer, count) = counting_debouncer(100);
        debouncer.trigger().expect("trigger");
        tokio::time::sleep(Duration::from_millis(150)).await;
        debouncer.trigger().expect("trigger");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_the_pending_action() {
        let (debouncer, count) = counting_debouncer(100);
        debouncer.trigger().expect("trigger");
        debouncer.cancel().expect("cancel");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(debouncer.phase().expect("phase"), DebouncePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_action_returns_to_idle() {
        let debouncer = Debouncer::new(
            tokio::runtime::Handle::current(),
            Duration::from_millis(50),
            Arc::new(|| panic!("listener failure")),
        );
        debouncer.trigger().expect("trigger");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(debouncer.phase().expect("phase"), DebouncePhase::Idle);
    }
}
