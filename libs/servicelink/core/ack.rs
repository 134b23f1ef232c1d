//! Ack correlation for ack-requiring frames.
//!
//! JoinGroup, LeaveGroup and CloseConnection carry an ack id the service
//! echoes back on an `Ack` frame. Each id maps to a oneshot the sender awaits
//! with a timeout; a timed-out or duplicate ack is dropped quietly.

use crate::protocol::message::AckStatus;
use crate::traits::error::{Result, ServiceLinkError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

type AckOutcome = (AckStatus, Option<String>);

/// Pending-ack table shared between the writer side and the inbound dispatcher
pub struct AckTable {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<AckOutcome>>>,
    timeout: Duration,
}

impl AckTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            // Ack ids start at 1; 0 is never issued so it can mean "no ack"
            next_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Allocate an ack id and register a waiter for it
    pub fn register(&self) -> (u32, oneshot::Receiver<AckOutcome>) {
        let ack_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(ack_id, tx);
        (ack_id, rx)
    }

    /// Resolve a waiter from an inbound `Ack` frame.
    ///
    /// Returns `false` for an unknown id (late ack after timeout).
    pub fn complete(&self, ack_id: u32, status: AckStatus, message: Option<String>) -> bool {
        match self.pending.lock().remove(&ack_id) {
            Some(tx) => tx.send((status, message)).is_ok(),
            None => {
                debug!(ack_id, "ack for unknown or expired id, ignoring");
                false
            }
        }
    }

    /// Await the ack registered under `ack_id`
    pub async fn wait(&self, ack_id: u32, receiver: oneshot::Receiver<AckOutcome>) -> Result<()> {
        let outcome = tokio::time::timeout(self.timeout, receiver).await;
        match outcome {
            Ok(Ok((AckStatus::Ok, _))) => Ok(()),
            Ok(Ok((AckStatus::Error, message))) => Err(ServiceLinkError::Protocol(format!(
                "ack {} reported an error: {}",
                ack_id,
                message.unwrap_or_default()
            ))),
            Ok(Ok((AckStatus::Timeout, message))) => Err(ServiceLinkError::Timeout(format!(
                "service timed out handling ack {}: {}",
                ack_id,
                message.unwrap_or_default()
            ))),
            Ok(Err(_)) => Err(ServiceLinkError::ChannelClosed(format!(
                "ack {} waiter abandoned",
                ack_id
            ))),
            Err(_) => {
                self.pending.lock().remove(&ack_id);
                Err(ServiceLinkError::Timeout(format!(
                    "no ack {} within {:?}",
                    ack_id, self.timeout
                )))
            }
        }
    }

    /// Drop every waiter (connection-loss or shutdown path)
    pub fn fail_all(&self) {
        self.pending.lock().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ok_ack_resolves_waiter() {
        let table = AckTable::new(Duration::from_secs(1));
        let (ack_id, rx) = table.register();
        assert!(table.complete(ack_id, AckStatus::Ok, None));
        table.wait(ack_id, rx).await.unwrap();
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn error_ack_surfaces_service_message() {
        let table = AckTable::new(Duration::from_secs(1));
        let (ack_id, rx) = table.register();
        table.complete(ack_id, AckStatus::Error, Some("group limit reached".into()));
        let err = table.wait(ack_id, rx).await.unwrap_err();
        assert!(matches!(err, ServiceLinkError::Protocol(_)));
        assert!(err.to_string().contains("group limit reached"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_ack_times_out_and_expires_id() {
        let table = AckTable::new(Duration::from_millis(50));
        let (ack_id, rx) = table.register();
        let err = table.wait(ack_id, rx).await.unwrap_err();
        assert!(matches!(err, ServiceLinkError::Timeout(_)));
        // Late ack for the expired id is dropped
        assert!(!table.complete(ack_id, AckStatus::Ok, None));
    }

    #[test]
    fn ids_are_unique_and_never_zero() {
        let table = AckTable::new(Duration::from_secs(1));
        let (a, _rx_a) = table.register();
        let (b, _rx_b) = table.register();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }
}
