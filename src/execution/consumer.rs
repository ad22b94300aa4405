//! Queue consumer loop
//!
//! One message at a time: receive, process, then ack on success or nack
//! so the transport redelivers / dead-letters. Runs until the
//! subscription closes or shutdown is signalled; a message already being
//! processed is always finished first. A handler that panics has its
//! transaction rolled back on unwind; the message is nacked and the loop
//! keeps going.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::error::ReconError;
use crate::funding::panic_message;
use crate::queue::{Delivery, Subscription};

/// What happened to a successfully handled message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Natural key already stored; nothing changed
    Duplicate,
    /// Synthetic liveness probe
    SelfTest,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, payload: &[u8]) -> Result<Outcome, ReconError>;
}

/// Process and settle one delivery
pub async fn handle_delivery<H: MessageHandler + ?Sized>(handler: &H, delivery: Delivery) {
    let attempt = delivery.attempt();
    let result = AssertUnwindSafe(handler.process(delivery.payload()))
        .catch_unwind()
        .await;
    let settled = match result {
        Ok(Ok(_)) => delivery.ack().await,
        Ok(Err(e)) => {
            warn!(
                handler = handler.name(),
                attempt,
                code = e.code(),
                error = %e,
                "Message not processed, nacking"
            );
            delivery.nack().await
        }
        Err(panic) => {
            error!(
                handler = handler.name(),
                attempt,
                panic = %panic_message(panic.as_ref()),
                "Handler panicked, nacking"
            );
            delivery.nack().await
        }
    };

    if let Err(e) = settled {
        error!(handler = handler.name(), error = %e, "Failed to settle delivery");
    }
}

pub async fn consume<H, S>(handler: &H, mut subscription: S, mut shutdown: watch::Receiver<bool>)
where
    H: MessageHandler + ?Sized,
    S: Subscription,
{
    info!(
        handler = handler.name(),
        queue = subscription.queue(),
        "Consumer started"
    );

    loop {
        let delivery = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            next = subscription.next() => next,
        };

        match delivery {
            Some(d) => handle_delivery(handler, d).await,
            None => {
                warn!(handler = handler.name(), "Subscription closed");
                break;
            }
        }
    }

    info!(handler = handler.name(), "Consumer stopped");
}
