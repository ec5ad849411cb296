use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::engine::{Engine, HandleOutcome};
use crate::error::GateError;
use crate::notification::Notification;
use crate::storage::ObjectStore;
use crate::verdict::{Catalogue, Publisher, Verdict};

pub trait NotificationHandler: Send + Sync + 'static {
    fn handle(&self, notification: &Notification) -> Result<HandleOutcome, GateError>;

    fn sweep(&self, now: DateTime<Utc>) -> Vec<Verdict>;
}

impl<S, P, C> NotificationHandler for Engine<S, P, C>
where
    S: ObjectStore + 'static,
    P: Publisher + 'static,
    C: Catalogue + 'static,
{
    fn handle(&self, notification: &Notification) -> Result<HandleOutcome, GateError> {
        Engine::handle(self, notification)
    }

    fn sweep(&self, now: DateTime<Utc>) -> Vec<Verdict> {
        Engine::sweep(self, now)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub handled: usize,
    pub resolved: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct Counters {
    handled: AtomicUsize,
    resolved: AtomicUsize,
    failed: AtomicUsize,
}

/// Fixed set of threads consuming notifications from one queue.
pub struct WorkerPool {
    sender: Option<mpsc::Sender<Notification>>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn start<H: NotificationHandler>(handler: Arc<H>, workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Notification>();
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let workers = (0..workers.max(1))
            .map(|id| {
                let handler = handler.clone();
                let receiver = receiver.clone();
                let counters = counters.clone();
                thread::spawn(move || worker_loop(id, handler.as_ref(), &receiver, &counters))
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
            counters,
        }
    }

    pub fn submit(&self, notification: Notification) -> Result<(), GateError> {
        self.sender
            .as_ref()
            .ok_or(GateError::QueueClosed)?
            .send(notification)
            .map_err(|_| GateError::QueueClosed)
    }

    /// Stops accepting work, lets queued and in-flight notifications finish,
    /// then joins every worker.
    pub fn drain(mut self) -> DrainReport {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        DrainReport {
            handled: self.counters.handled.load(Ordering::SeqCst),
            resolved: self.counters.resolved.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }
}

fn worker_loop<H: NotificationHandler>(
    id: usize,
    handler: &H,
    receiver: &Mutex<mpsc::Receiver<Notification>>,
    counters: &Counters,
) {
    loop {
        let next = {
            let guard = match receiver.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.recv()
        };
        let Ok(notification) = next else {
            tracing::debug!(worker = id, "queue closed, worker exiting");
            return;
        };

        counters.handled.fetch_add(1, Ordering::SeqCst);
        match handler.handle(&notification) {
            Ok(HandleOutcome::Resolved(verdict)) => {
                counters.resolved.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(worker = id, artifact = %verdict.artifact, "artifact resolved");
            }
            Ok(_) => {}
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                if err.is_config() || matches!(err, GateError::KeyFormat { .. }) {
                    tracing::warn!(
                        worker = id,
                        bucket = %notification.bucket,
                        key = %notification.key,
                        error = %err,
                        "notification skipped"
                    );
                } else {
                    tracing::error!(
                        worker = id,
                        bucket = %notification.bucket,
                        key = %notification.key,
                        error = %err,
                        "notification failed"
                    );
                }
            }
        }
    }
}

/// Runs the staleness sweep on its own timer until stopped.
pub struct Sweeper {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub fn start<H: NotificationHandler>(handler: Arc<H>, interval: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let expired = handler.sweep(Utc::now());
                        if !expired.is_empty() {
                            tracing::info!(expired = expired.len(), "sweep expired artifacts");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        });
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("sweeper thread panicked");
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
