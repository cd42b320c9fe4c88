//! Async event pump.
//!
//! Whatever owns the real socket pushes `TransportEvent`s into an mpsc
//! channel; `run` applies them to the connection one at a time until the
//! transport ends.

use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::transport::TransportEvent;

/// Feed transport events into `connection` until a close or error.
///
/// If the sending side of `events` goes away first, that counts as the
/// transport closing.
pub async fn run(connection: Connection, mut events: mpsc::Receiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let terminal = event.is_terminal();
        if let Err(e) = connection.handle_event(event) {
            // Already logged where it happened; discarded packets are not fatal.
            tracing::trace!(error = %e, "event discarded");
        }
        if terminal {
            return;
        }
    }
    tracing::debug!("transport event channel ended");
    let _ = connection.handle_event(TransportEvent::Close);
}

/// Spawn `run` on the current tokio runtime.
pub fn spawn(
    connection: Connection,
    events: mpsc::Receiver<TransportEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run(connection, events))
}
