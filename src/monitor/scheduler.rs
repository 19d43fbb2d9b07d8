//! Periodic tick driver.
//!
//! One background task invokes the controller at a fixed cadence. The task
//! awaits each tick before sleeping, so it can never overlap itself; a tick
//! arriving while an emergency handler holds the controller gate is skipped
//! by the controller, not queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::controller::Controller;

pub struct TickScheduler {
    controller: Arc<Controller>,
    interval: Duration,
    shutdown: Arc<Notify>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TickScheduler {
    pub fn new(controller: Arc<Controller>, interval: Duration) -> Self {
        Self {
            controller,
            interval,
            shutdown: Arc::new(Notify::new()),
            handle: std::sync::Mutex::new(None),
        }
    }

    /// Spawn the background worker. A second call is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }

        let controller = Arc::clone(&self.controller);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        *handle = Some(tokio::spawn(async move {
            info!(interval_sec = interval.as_secs(), "tick scheduler started");
            loop {
                if let Err(e) = controller.tick().await {
                    error!("tick aborted: {e}");
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.notified() => break,
                }
            }
            info!("tick scheduler stopped");
        }));
    }

    /// Stop the worker; an in-flight tick runs to completion first.
    pub async fn stop(&self) {
        // notify_one stores a permit, so a stop issued mid-tick still lands
        // when the worker reaches its select point.
        self.shutdown.notify_one();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Drive a single tick synchronously; used by tests and manual triggers.
    pub async fn run_once(&self) -> Result<(), crate::exchange::ExchangeError> {
        self.controller.tick().await
    }
}
