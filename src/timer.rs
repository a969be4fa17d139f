use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tracing::{debug, trace};

/// Delayed and periodic callbacks for a single connection: handshake retries, request timeouts
///  and keep-alive pings.
///
/// Callbacks run as tasks on tokio's timer wheel rather than on dedicated threads. Every
///  scheduled callback is tracked by an id, so [Timer::stop] can cancel everything that is still
///  pending when the connection is torn down. Scheduling works from synchronous code as well, the
///  runtime is captured when the timer is created.
#[derive(Clone)]
pub struct Timer {
    name: Arc<str>,
    runtime: Handle,
    inner: Arc<Mutex<TimerInner>>,
}

#[derive(Default)]
struct TimerInner {
    next_id: u64,
    scheduled: FxHashMap<u64, AbortHandle>,
    stopped: bool,
}

/// Cancels a scheduled callback. Cancelling a callback that already ran, or one belonging to a
///  timer that was stopped or dropped, is a no-op.
#[derive(Debug, Clone)]
pub struct TimeoutHandle {
    id: u64,
    timer: Weak<Mutex<TimerInner>>,
}

impl TimeoutHandle {
    /// returns `true` if this call prevented the callback from running (for one-shot callbacks)
    ///  or from running again (for periodic callbacks)
    pub fn cancel(&self) -> bool {
        let Some(timer) = self.timer.upgrade() else {
            return false;
        };

        let removed = timer.lock().unwrap()
            .scheduled
            .remove(&self.id);

        match removed {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Timer {
    /// Must be called from within a tokio runtime
    pub fn new(name: &str) -> Timer {
        Timer {
            name: name.into(),
            runtime: Handle::current(),
            inner: Default::default(),
        }
    }

    /// Runs `task` once after `delay`. Fails if the timer was stopped.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> anyhow::Result<TimeoutHandle>
    where F: Future<Output = ()> + Send + 'static
    {
        let inner = self.inner.clone();
        self.register(move |id| async move {
            sleep(delay).await;

            // a callback owns its slot once it removed it, a concurrent cancel() finds nothing
            if inner.lock().unwrap().scheduled.remove(&id).is_none() {
                return;
            }
            task.await;
        })
    }

    /// Runs the future created by `task` every `delay`, the first time after `delay`. Runs do not
    ///  overlap: the delay is measured from the end of the previous run.
    pub fn schedule_with_fixed_delay<F, Fut>(&self, delay: Duration, task: F) -> anyhow::Result<TimeoutHandle>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let inner = self.inner.clone();
        self.register(move |id| async move {
            loop {
                sleep(delay).await;
                if !inner.lock().unwrap().scheduled.contains_key(&id) {
                    return;
                }
                task().await;
            }
        })
    }

    fn register<F, Fut>(&self, create_task: F) -> anyhow::Result<TimeoutHandle>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // the lock is held while spawning: the new task can not look up its own id before it
        //  is registered
        let mut inner = self.inner.lock().unwrap();
        if inner.stopped {
            bail!("timer {} was stopped", self.name);
        }

        let id = inner.next_id;
        inner.next_id += 1;

        let join_handle = self.runtime.spawn(create_task(id));
        inner.scheduled.insert(id, join_handle.abort_handle());
        trace!(name=%self.name, id, "scheduled timer callback");

        Ok(TimeoutHandle {
            id,
            timer: Arc::downgrade(&self.inner),
        })
    }

    /// Cancels all pending callbacks and rejects new ones. Returns `true` for the call that
    ///  actually stopped the timer, `false` for every subsequent call.
    pub fn stop(&self) -> bool {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            if inner.stopped {
                return false;
            }
            inner.stopped = true;
            std::mem::take(&mut inner.scheduled)
        };

        debug!(name=%self.name, num_pending=pending.len(), "stopping timer");
        for handle in pending.into_values() {
            handle.abort();
        }
        true
    }

    pub fn num_pending(&self) -> usize {
        self.inner.lock().unwrap().scheduled.len()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::sleep;
    use super::*;

    fn counting_task(counter: &Arc<AtomicU32>) -> impl Future<Output = ()> + Send + 'static {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_runs_once() {
        let timer = Timer::new("test");
        let counter = Arc::new(AtomicU32::new(0));

        timer.schedule(Duration::from_millis(100), counting_task(&counter)).unwrap();
        assert_eq!(timer.num_pending(), 1);

        sleep(Duration::from_millis(99)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(timer.num_pending(), 0);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let timer = Timer::new("test");
        let counter = Arc::new(AtomicU32::new(0));

        let handle = timer.schedule(Duration::from_millis(100), counting_task(&counter)).unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel());

        sleep(Duration::from_secs(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(timer.num_pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fired() {
        let timer = Timer::new("test");
        let counter = Arc::new(AtomicU32::new(0));

        let handle = timer.schedule(Duration::from_millis(100), counting_task(&counter)).unwrap();
        sleep(Duration::from_millis(200)).await;

        assert!(!handle.cancel());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay() {
        let timer = Timer::new("test");
        let counter = Arc::new(AtomicU32::new(0));

        let counter_clone = counter.clone();
        let handle = timer.schedule_with_fixed_delay(Duration::from_secs(1), move || counting_task(&counter_clone)).unwrap();

        sleep(Duration::from_millis(3500)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        assert!(handle.cancel());
        sleep(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop() {
        let timer = Timer::new("test");
        let counter = Arc::new(AtomicU32::new(0));

        let handle = timer.schedule(Duration::from_millis(100), counting_task(&counter)).unwrap();
        timer.schedule(Duration::from_millis(200), counting_task(&counter)).unwrap();

        assert!(timer.stop());
        assert!(!timer.stop());
        assert!(timer.schedule(Duration::from_millis(100), counting_task(&counter)).is_err());

        // tolerated after stop
        assert!(!handle.cancel());

        sleep(Duration::from_secs(1)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_outlives_timer() {
        let counter = Arc::new(AtomicU32::new(0));
        let handle = {
            let timer = Timer::new("test");
            timer.schedule(Duration::from_millis(100), counting_task(&counter)).unwrap()
        };
        sleep(Duration::from_secs(1)).await;
        assert!(!handle.cancel());
    }
}
