//! Bridge dispatch
//!
//! Acceptance enqueues a [`BridgeJob`] without waiting. A single worker task
//! drains the queue, calls adapters with bounded concurrency, reschedules
//! `Retry` outcomes on a backoff schedule and invalidates registrations on
//! `PermanentFailure`.

use super::{BridgeOutcome, BridgeRegistry, WakeHint};
use crate::config::BridgeConfig;
use crate::error::RelayError;
use crate::logging::uaid_hash;
use crate::models::{BridgeTarget, Uaid};
use crate::retry::RetryPolicy;
use crate::router::RouterDirectory;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeJob {
    pub uaid: Uaid,
    pub target: BridgeTarget,
    pub hint: WakeHint,
    /// Attempts already made.
    pub attempt: u32,
}

impl BridgeJob {
    pub fn new(uaid: Uaid, target: BridgeTarget, hint: WakeHint) -> Self {
        Self {
            uaid,
            target,
            hint,
            attempt: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    retried: AtomicU64,
    exhausted: AtomicU64,
    invalidated: AtomicU64,
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub retried: u64,
    pub exhausted: u64,
    pub invalidated: u64,
}

/// Producer half, cheap to clone.
#[derive(Debug, Clone)]
pub struct BridgeDispatcher {
    sender: mpsc::Sender<BridgeJob>,
    counters: Arc<Counters>,
}

/// Consumer half; run it with [`BridgeWorker::run`].
pub struct BridgeWorker {
    receiver: mpsc::Receiver<BridgeJob>,
    sender: mpsc::Sender<BridgeJob>,
    registry: BridgeRegistry,
    router: Arc<dyn RouterDirectory>,
    schedule: RetryPolicy,
    permits: Arc<Semaphore>,
    counters: Arc<Counters>,
}

impl BridgeDispatcher {
    pub fn new(
        config: &BridgeConfig,
        registry: BridgeRegistry,
        router: Arc<dyn RouterDirectory>,
    ) -> (Self, BridgeWorker) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker = BridgeWorker {
            receiver,
            sender: sender.clone(),
            registry,
            router,
            schedule: RetryPolicy::from_config(&config.retry()),
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            counters: counters.clone(),
        };
        (Self { sender, counters }, worker)
    }

    /// Queue a wake-up. Never waits; a full queue drops the job for good.
    /// The notification is already durable and reaches the client on its
    /// next connect.
    pub fn dispatch(&self, job: BridgeJob) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    uaid_hash = %uaid_hash(&job.uaid),
                    gateway = %job.target.gateway,
                    "Bridge queue full, dropping wake-up"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> BridgeStats {
        let c = &self.counters;
        BridgeStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            exhausted: c.exhausted.load(Ordering::Relaxed),
            invalidated: c.invalidated.load(Ordering::Relaxed),
        }
    }
}

impl BridgeWorker {
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(gateways = ?self.registry.gateways(), "Bridge dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Bridge dispatcher stopping");
                    break;
                }
                job = self.receiver.recv() => {
                    let Some(job) = job else { break };
                    // Shutdown must stay observable while every permit is busy.
                    let permit = tokio::select! {
                        _ = shutdown.recv() => {
                            info!("Bridge dispatcher stopping");
                            break;
                        }
                        permit = self.permits.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let ctx = JobContext {
                        registry: self.registry.clone(),
                        router: self.router.clone(),
                        schedule: self.schedule.clone(),
                        sender: self.sender.clone(),
                        counters: self.counters.clone(),
                    };
                    tokio::spawn(async move {
                        ctx.process(job).await;
                        drop(permit);
                    });
                }
            }
        }
    }
}

struct JobContext {
    registry: BridgeRegistry,
    router: Arc<dyn RouterDirectory>,
    schedule: RetryPolicy,
    sender: mpsc::Sender<BridgeJob>,
    counters: Arc<Counters>,
}

impl JobContext {
    async fn process(self, mut job: BridgeJob) {
        let Some(adapter) = self.registry.get(&job.target.gateway) else {
            error!(gateway = %job.target.gateway, "No bridge adapter registered for gateway");
            return;
        };

        job.attempt += 1;
        match adapter.notify_bridge(&job.uaid, &job.target, &job.hint).await {
            BridgeOutcome::Delivered => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(
                    uaid_hash = %uaid_hash(&job.uaid),
                    gateway = %job.target.gateway,
                    "Bridge wake-up delivered"
                );
            }
            BridgeOutcome::Retry { reason } => self.reschedule(job, reason),
            BridgeOutcome::PermanentFailure { reason } => {
                warn!(
                    uaid_hash = %uaid_hash(&job.uaid),
                    gateway = %job.target.gateway,
                    reason = %reason,
                    "Bridge target permanently failed, invalidating registration"
                );
                let router = self.router.clone();
                let result = self
                    .schedule
                    .execute("invalidate_bridge", || {
                        router.invalidate_bridge(&job.uaid, &job.target)
                    })
                    .await;
                match result {
                    Ok(_) => {
                        self.counters.invalidated.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => error!(error = %e, "Could not invalidate bridge registration"),
                }
            }
        }
    }

    fn reschedule(&self, job: BridgeJob, reason: String) {
        let unavailable = RelayError::BridgeUnavailable {
            gateway: job.target.gateway.clone(),
            reason,
        };
        if job.attempt >= self.schedule.max_attempts() {
            self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
            warn!(
                uaid_hash = %uaid_hash(&job.uaid),
                attempts = job.attempt,
                error = %unavailable,
                "Bridge retries exhausted; client will receive the backlog on reconnect"
            );
            return;
        }

        self.counters.retried.fetch_add(1, Ordering::Relaxed);
        let delay = self.schedule.delay_for(job.attempt);
        debug!(
            attempt = job.attempt,
            delay_ms = delay.as_millis() as u64,
            error = %unavailable,
            "Rescheduling bridge wake-up"
        );
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(job).await;
        });
    }
}
