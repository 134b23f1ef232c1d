//! Client invocation / result correlation.
//!
//! Two roles share one manager:
//!
//! - **Caller**: this instance issued a server-to-client call and awaits a
//!   typed result. A pending entry holds a oneshot completer; the awaiting
//!   side resolves on completion, cancellation or timeout, exactly once.
//! - **Router**: this instance merely owns the target connection for a call
//!   that originated elsewhere. It tracks enough state to build a
//!   `ClientCompletion` frame addressed back to the origin, preserving the
//!   original wire payload bytes (the origin may speak a different hub
//!   protocol, so re-serializing would corrupt the result).

use crate::protocol::message::ServiceMessage;
use crate::traits::error::{Result, ServiceLinkError};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct PendingEntry {
    connection_id: String,
    return_protocol: String,
    instance_id: Option<String>,
    completer: oneshot::Sender<Result<Bytes>>,
}

struct RoutedEntry {
    connection_id: String,
    caller_server_id: String,
    #[allow(dead_code)]
    caller_instance_id: Option<String>,
}

/// A registered pending call, to be awaited via
/// [`InvocationManager::wait_completion`]
pub struct CompletionHandle {
    invocation_id: String,
    receiver: oneshot::Receiver<Result<Bytes>>,
}

impl CompletionHandle {
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }
}

/// Correlates server-issued calls with their eventual completions
pub struct InvocationManager {
    server_id: String,
    counter: AtomicU64,
    pending: Mutex<HashMap<String, PendingEntry>>,
    routed: Mutex<HashMap<String, RoutedEntry>>,
}

impl InvocationManager {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            counter: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            routed: Mutex::new(HashMap::new()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Fresh invocation id, unique for the lifetime of this process
    pub fn generate_invocation_id(&self, connection_id: &str) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}|{}|{}", self.server_id, connection_id, seq)
    }

    /// Register a pending caller-side invocation
    ///
    /// The returned handle must be passed to [`Self::wait_completion`]; a
    /// dropped handle is cleaned up when the completion (or a shutdown
    /// `fail_all`) arrives.
    pub fn add_invocation(
        &self,
        connection_id: impl Into<String>,
        invocation_id: impl Into<String>,
        return_protocol: impl Into<String>,
        instance_id: Option<String>,
    ) -> CompletionHandle {
        let invocation_id = invocation_id.into();
        let (completer, receiver) = oneshot::channel();
        let entry = PendingEntry {
            connection_id: connection_id.into(),
            return_protocol: return_protocol.into(),
            instance_id,
            completer,
        };
        let replaced = self.pending.lock().insert(invocation_id.clone(), entry);
        if replaced.is_some() {
            // Ids are process-unique, so this indicates a caller bug
            warn!(invocation_id = %invocation_id, "replaced an existing pending invocation");
        }
        CompletionHandle {
            invocation_id,
            receiver,
        }
    }

    /// Await a registered completion with cancellation and timeout.
    ///
    /// On every exit path the pending entry is gone: completion consumes it,
    /// cancellation and timeout remove it here. The caller observes exactly
    /// one outcome.
    pub async fn wait_completion(
        &self,
        handle: CompletionHandle,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Result<Bytes> {
        let CompletionHandle {
            invocation_id,
            receiver,
        } = handle;
        tokio::select! {
            outcome = receiver => match outcome {
                Ok(result) => result,
                Err(_) => Err(ServiceLinkError::ChannelClosed(format!(
                    "invocation {} abandoned",
                    invocation_id
                ))),
            },
            _ = token.cancelled() => {
                self.remove(&invocation_id);
                Err(ServiceLinkError::Canceled(format!(
                    "invocation {} canceled",
                    invocation_id
                )))
            }
            _ = tokio::time::sleep(timeout) => {
                self.remove(&invocation_id);
                Err(ServiceLinkError::Timeout(format!(
                    "invocation {} timed out after {:?}",
                    invocation_id, timeout
                )))
            }
        }
    }

    /// Resolve a pending caller-side invocation.
    ///
    /// Returns `false` for an unknown or already-resolved invocation id, or
    /// when the completion names a different connection than the pending
    /// entry — stale and duplicate completions are no-ops, never errors.
    pub fn try_complete_result(
        &self,
        connection_id: &str,
        invocation_id: &str,
        payload: Bytes,
    ) -> bool {
        let entry = {
            let mut pending = self.pending.lock();
            match pending.get(invocation_id) {
                Some(entry) if entry.connection_id == connection_id => {
                    pending.remove(invocation_id)
                }
                Some(_) => {
                    debug!(
                        invocation_id = %invocation_id,
                        connection_id = %connection_id,
                        "completion for a different connection, ignoring"
                    );
                    return false;
                }
                None => {
                    debug!(
                        invocation_id = %invocation_id,
                        "no pending invocation for completion, ignoring"
                    );
                    return false;
                }
            }
        };
        match entry {
            Some(entry) => entry.completer.send(Ok(payload)).is_ok(),
            None => false,
        }
    }

    /// Protocol name the caller expects the completion payload in
    pub fn return_protocol(&self, invocation_id: &str) -> Option<String> {
        self.pending
            .lock()
            .get(invocation_id)
            .map(|e| e.return_protocol.clone())
    }

    /// Record which remote instance actually serves the target connection
    ///
    /// Arrives when the call was issued before the mapping was known.
    pub fn add_service_mapping(&self, invocation_id: &str, instance_id: impl Into<String>) {
        if let Some(entry) = self.pending.lock().get_mut(invocation_id) {
            entry.instance_id = Some(instance_id.into());
        }
    }

    /// Instance id recorded for a pending invocation, if any
    pub fn instance_id(&self, invocation_id: &str) -> Option<String> {
        self.pending
            .lock()
            .get(invocation_id)
            .and_then(|e| e.instance_id.clone())
    }

    /// Remove a pending entry (cancellation/timeout path)
    pub fn remove(&self, invocation_id: &str) -> bool {
        self.pending.lock().remove(invocation_id).is_some()
    }

    /// Fault every pending invocation (connection-loss or shutdown path)
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<(String, PendingEntry)> = self.pending.lock().drain().collect();
        for (invocation_id, entry) in drained {
            debug!(invocation_id = %invocation_id, reason, "failing pending invocation");
            let _ = entry
                .completer
                .send(Err(ServiceLinkError::ConnectionClosed(reason.to_string())));
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    // ----- router role -------------------------------------------------

    /// Track a relayed invocation whose caller lives on another instance
    pub fn add_routed_invocation(
        &self,
        connection_id: impl Into<String>,
        invocation_id: impl Into<String>,
        caller_server_id: impl Into<String>,
        caller_instance_id: Option<String>,
    ) {
        self.routed.lock().insert(
            invocation_id.into(),
            RoutedEntry {
                connection_id: connection_id.into(),
                caller_server_id: caller_server_id.into(),
                caller_instance_id,
            },
        );
    }

    /// Build the completion frame to relay back to the originating instance.
    ///
    /// The payload is forwarded verbatim in its original wire encoding.
    /// Returns `None` when no routed entry matches (stale/duplicate).
    pub fn complete_routed(
        &self,
        invocation_id: &str,
        protocol: impl Into<String>,
        payload: Bytes,
    ) -> Option<ServiceMessage> {
        let entry = self.routed.lock().remove(invocation_id)?;
        Some(ServiceMessage::ClientCompletion {
            invocation_id: invocation_id.to_string(),
            connection_id: entry.connection_id,
            caller_server_id: entry.caller_server_id,
            protocol: protocol.into(),
            payload,
        })
    }

    pub fn routed_count(&self) -> usize {
        self.routed.lock().len()
    }
}
