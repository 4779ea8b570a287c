//! Fan-out of inbound messages: one spawned task per message, no queueing and
//! no per-chat ordering. Two messages from the same chat may run concurrently
//! and persist in either completion order; the append-only history store keeps
//! that from corrupting anything.
//!
//! Cancellation is cooperative and checked exactly once, when a task starts.
//! A task that has passed that check always runs to completion.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::{Bridge, InboundMessage};

pub fn spawn_turn(
    bridge: Arc<Bridge>,
    inbound: InboundMessage,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if cancel.is_cancelled() {
            tracing::debug!(chat_id = inbound.chat_id, "Shutdown in progress, dropping message");
            return;
        }
        bridge.handle(inbound).await;
    })
}

/// Drains `updates` until it ends or `cancel` fires. Spawned tasks are not
/// awaited.
pub async fn run_dispatcher<S>(updates: S, bridge: Arc<Bridge>, cancel: CancellationToken)
where
    S: Stream<Item = InboundMessage>,
{
    futures::pin_mut!(updates);
    tracing::info!("Running bot service...");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Stopping dispatcher");
                break;
            }
            next = updates.next() => match next {
                Some(inbound) => {
                    spawn_turn(bridge.clone(), inbound, cancel.clone());
                }
                None => {
                    tracing::info!("Update stream closed");
                    break;
                }
            }
        }
    }
}
