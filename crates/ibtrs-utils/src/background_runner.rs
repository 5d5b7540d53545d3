use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Spawns background tokio tasks with graceful shutdown support.
///
/// Shared by reference: sessions keep one runner for their heartbeat ticker
/// and reconnect worker and stop both from `close`.
pub struct BackgroundRunner {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundRunner {
    pub fn new(name: &'static str) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            name,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Spawn a task that receives the shutdown signal. Ignored after shutdown.
    pub fn spawn<F, Fut>(&self, f: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutdown() {
            return;
        }
        let rx = self.shutdown_tx.subscribe();
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(tokio::spawn(f(rx)));
    }

    /// Run `f` every `period`, first after one full period has elapsed.
    pub fn spawn_periodic<F, Fut>(&self, period: Duration, f: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = self.name;
        self.spawn(move |mut rx| async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => { f().await; }
                    _ = rx.changed() => { break; }
                }
            }
            tracing::trace!(runner = name, "periodic task stopped");
        });
    }

    /// Signal every task without waiting. Safe to call from one of the
    /// runner's own tasks.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.handles.lock().clear();
    }

    /// Signal every task and wait for them to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
        tracing::debug!(runner = self.name, "background tasks stopped");
    }
}
