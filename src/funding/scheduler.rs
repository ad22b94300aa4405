//! Single-Flight Scheduler
//!
//! The funding sweep must never overlap itself. [`SingleFlight`] holds a
//! one-permit semaphore: a run waits a bounded time for the permit and is
//! skipped (not queued) if it does not get it. The permit returns on
//! completion, including when the run panics.
//!
//! [`FundingScheduler`] fires a single-flighted sweep on every tick of a
//! fixed interval. Ticks are spawned, so a slow sweep makes later ticks
//! skip instead of piling up.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{Semaphore, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::error::FundingError;
use super::panic_message;
use super::worker::{FundingWorker, SweepReport};

/// Result of one single-flighted run
#[derive(Debug, PartialEq)]
pub enum Flight<T> {
    Completed(T),
    /// Another run held the slot for the whole wait window
    Skipped,
    Panicked(String),
}

pub struct SingleFlight {
    slot: Semaphore,
    wait: Duration,
}

impl SingleFlight {
    pub fn new(wait: Duration) -> Self {
        Self {
            slot: Semaphore::new(1),
            wait,
        }
    }

    /// Whether a run currently holds the slot
    pub fn in_flight(&self) -> bool {
        self.slot.available_permits() == 0
    }

    pub async fn run<F>(&self, work: F) -> Flight<F::Output>
    where
        F: Future,
    {
        let _permit = match tokio::time::timeout(self.wait, self.slot.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Flight::Skipped,
        };

        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(output) => Flight::Completed(output),
            Err(payload) => Flight::Panicked(panic_message(payload.as_ref())),
        }
    }
}

pub struct FundingScheduler {
    worker: Arc<FundingWorker>,
    single_flight: SingleFlight,
    interval: Duration,
}

impl FundingScheduler {
    pub fn new(
        worker: Arc<FundingWorker>,
        interval: Duration,
        single_flight_wait: Duration,
    ) -> Self {
        Self {
            worker,
            single_flight: SingleFlight::new(single_flight_wait),
            interval,
        }
    }

    /// Trigger one sweep unless one is already running
    pub async fn trigger(&self) -> Flight<Result<SweepReport, FundingError>> {
        let flight = self.single_flight.run(self.worker.sweep()).await;
        match &flight {
            Flight::Completed(Ok(_)) => {}
            Flight::Completed(Err(e)) => {
                error!(code = e.code(), error = %e, "Funding sweep failed");
            }
            Flight::Skipped => {
                warn!("Previous funding sweep still running, skipping this tick");
            }
            Flight::Panicked(msg) => {
                error!(panic = %msg, "Funding sweep panicked");
            }
        }
        flight
    }

    /// Tick until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            wait_ms = self.single_flight.wait.as_millis() as u64,
            "Funding scheduler started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    debug!("Funding tick");
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        scheduler.trigger().await;
                    });
                }
            }
        }

        info!("Funding scheduler stopped");
    }
}
