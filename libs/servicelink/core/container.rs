//! Per-endpoint connection container.
//!
//! Keeps a fixed number of service connections to one endpoint alive.
//! Each slot has a supervisor task: when its connection dies the supervisor
//! rebuilds it under the configured backoff policy, bumping the slot's
//! generation so anything still holding the old serving tag sees it as
//! stale. Clients served by a retiring connection are migrated, never
//! renegotiated.

use super::ack::AckTable;
use super::config::{ContainerConfig, ShutdownMode};
use super::connection::{ConnectionSettings, ServiceConnection};
use super::dispatcher::{DispatchContext, MessageDispatcher};
use crate::endpoint::Endpoint;
use crate::invocation::InvocationManager;
use crate::protocol::message::{ServiceEnvelope, ServiceMessage};
use crate::registry::{ClientConnectionRegistry, ServingTag};
use crate::scope::CallScope;
use crate::traits::dispatch::HubDispatcher;
use crate::traits::error::{Result, ServiceLinkError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Initial,
    Starting,
    Connected,
    Reconnecting,
    Draining,
    Stopped,
}

/// Point-in-time view of one container, for logs and health endpoints
#[derive(Debug, Clone)]
pub struct ContainerSnapshot {
    pub endpoint: String,
    pub status: ContainerStatus,
    pub live_connections: usize,
    pub total_slots: usize,
    pub clients: usize,
}

struct Slot {
    connection: RwLock<Option<Arc<ServiceConnection>>>,
    generation: AtomicU64,
}

impl Slot {
    fn new() -> Self {
        Self {
            connection: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Connection in this slot, only while it is actually live
    fn live(&self) -> Option<Arc<ServiceConnection>> {
        self.connection
            .read()
            .clone()
            .filter(|conn| conn.is_connected())
    }
}

pub struct ServiceConnectionContainer {
    endpoint: Arc<Endpoint>,
    endpoint_index: usize,
    config: ContainerConfig,
    slots: Vec<Slot>,
    status: Mutex<ContainerStatus>,
    next_slot: AtomicUsize,
    dispatcher: Arc<MessageDispatcher>,
    accepting_opens: Arc<AtomicBool>,
    registry: Arc<ClientConnectionRegistry>,
    acks: Arc<AckTable>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ServiceConnectionContainer {
    pub fn new(
        endpoint: Arc<Endpoint>,
        endpoint_index: usize,
        config: ContainerConfig,
        registry: Arc<ClientConnectionRegistry>,
        invocations: Arc<InvocationManager>,
        hub: Arc<dyn HubDispatcher>,
    ) -> Arc<Self> {
        let acks = Arc::new(AckTable::new(config.ack_timeout));
        let dispatcher = Arc::new(MessageDispatcher::new(
            registry.clone(),
            invocations,
            hub,
            acks.clone(),
        ));
        let slots = (0..config.connection_count.max(1)).map(|_| Slot::new()).collect();
        Arc::new(Self {
            endpoint,
            endpoint_index,
            config,
            slots,
            status: Mutex::new(ContainerStatus::Initial),
            next_slot: AtomicUsize::new(0),
            dispatcher,
            accepting_opens: Arc::new(AtomicBool::new(true)),
            registry,
            acks,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    pub fn status(&self) -> ContainerStatus {
        *self.status.lock()
    }

    pub fn snapshot(&self) -> ContainerSnapshot {
        ContainerSnapshot {
            endpoint: self.endpoint.name().to_string(),
            status: self.status(),
            live_connections: self.live_connections(),
            total_slots: self.slots.len(),
            clients: self.registry.count_on_endpoint(self.endpoint_index),
        }
    }

    pub fn live_connections(&self) -> usize {
        self.slots.iter().filter(|slot| slot.live().is_some()).count()
    }

    /// Bring up every slot and start their supervisors.
    ///
    /// Partial success is success: slots that could not connect keep being
    /// retried by their supervisors. Only when no slot at all comes up does
    /// `start` fail, surfacing the first slot's (possibly aggregate) error.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        *self.status.lock() = ContainerStatus::Starting;
        info!(endpoint = %self.endpoint.name(), slots = self.slots.len(), "starting container");

        let mut first_error = None;
        let mut connected = 0usize;
        for slot_index in 0..self.slots.len() {
            match self.connect_slot(slot_index).await {
                Ok(connection) => {
                    self.install(slot_index, connection);
                    connected += 1;
                }
                Err(e) => {
                    warn!(
                        endpoint = %self.endpoint.name(),
                        slot = slot_index,
                        "slot failed to start: {}",
                        e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        if connected == 0 {
            *self.status.lock() = ContainerStatus::Stopped;
            return Err(first_error.unwrap_or(ServiceLinkError::ServiceNotConnected));
        }

        *self.status.lock() = ContainerStatus::Connected;
        self.endpoint.set_online(true);
        for slot_index in 0..self.slots.len() {
            let this = self.clone();
            self.tasks.spawn(async move { this.supervise(slot_index).await });
        }
        Ok(())
    }

    /// One connection attempt cycle under the backoff policy
    async fn connect_slot(&self, slot_index: usize) -> Result<Arc<ServiceConnection>> {
        let mut errors = Vec::new();
        let mut attempt = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ServiceLinkError::Canceled("container stopping".into()));
            }

            let generation = self.slots[slot_index].generation.load(Ordering::Acquire) + 1;
            let id = format!("{}-{}-{}", self.endpoint.name(), slot_index, generation);
            let ctx = DispatchContext {
                serving: ServingTag {
                    endpoint_index: self.endpoint_index,
                    slot: slot_index,
                    generation,
                },
                accepting_opens: self.accepting_opens.clone(),
            };
            match ServiceConnection::establish(
                id,
                self.endpoint.clone(),
                ConnectionSettings::from(&self.config),
                self.dispatcher.clone(),
                ctx,
            )
            .await
            {
                Ok(connection) => return Ok(connection),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    debug!(
                        endpoint = %self.endpoint.name(),
                        slot = slot_index,
                        attempt,
                        "connect attempt failed: {}",
                        e
                    );
                    errors.push(e.to_string());
                    match self.config.backoff.next_delay(attempt) {
                        Some(delay) => {
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = self.cancel.cancelled() => {
                                    return Err(ServiceLinkError::Canceled("container stopping".into()));
                                }
                            }
                            attempt += 1;
                        }
                        None => {
                            return Err(ServiceLinkError::ReconnectExhausted {
                                attempts: attempt + 1,
                                errors,
                            })
                        }
                    }
                }
            }
        }
    }

    /// Put a freshly established connection into its slot and bump the epoch
    fn install(&self, slot_index: usize, connection: Arc<ServiceConnection>) {
        let slot = &self.slots[slot_index];
        let old = slot.connection.write().replace(connection);
        slot.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(old) = old {
            old.stop();
        }
    }

    fn serving_tag(&self, slot_index: usize) -> ServingTag {
        ServingTag {
            endpoint_index: self.endpoint_index,
            slot: slot_index,
            generation: self.slots[slot_index].generation.load(Ordering::Acquire),
        }
    }

    /// Keeps one slot alive until the container drains or the backoff gives up
    async fn supervise(self: Arc<Self>, slot_index: usize) {
        loop {
            let current = self.slots[slot_index].connection.read().clone();
            if let Some(connection) = current.filter(|c| c.is_connected()) {
                tokio::select! {
                    _ = connection.closed() => {}
                    _ = self.cancel.cancelled() => return,
                }
            }
            if self.cancel.is_cancelled()
                || matches!(
                    self.status(),
                    ContainerStatus::Draining | ContainerStatus::Stopped
                )
            {
                return;
            }

            let old_tag = self.serving_tag(slot_index);
            {
                let mut status = self.status.lock();
                if *status == ContainerStatus::Connected {
                    *status = ContainerStatus::Reconnecting;
                }
            }
            info!(endpoint = %self.endpoint.name(), slot = slot_index, "connection lost, reconnecting");

            match self.connect_slot(slot_index).await {
                Ok(connection) => {
                    self.install(slot_index, connection);
                    let new_tag = self.serving_tag(slot_index);
                    self.migrate(old_tag, new_tag).await;
                    let mut status = self.status.lock();
                    if *status == ContainerStatus::Reconnecting {
                        *status = ContainerStatus::Connected;
                    }
                    drop(status);
                    self.endpoint.set_online(true);
                }
                Err(e) => {
                    warn!(
                        endpoint = %self.endpoint.name(),
                        slot = slot_index,
                        "giving up on slot: {}",
                        e
                    );
                    self.slots[slot_index].connection.write().take();
                    self.evacuate(old_tag).await;
                    if self.live_connections() == 0 {
                        self.endpoint.set_online(false);
                    }
                    return;
                }
            }
        }
    }

    /// Move every client on `from` to `to`; the clients never renegotiate
    async fn migrate(&self, from: ServingTag, to: ServingTag) {
        let clients = self.registry.on_connection(from);
        if clients.is_empty() {
            return;
        }
        let ids: Vec<String> = clients
            .iter()
            .map(|client| {
                client.set_serving(to);
                client.connection_id().to_string()
            })
            .collect();
        info!(
            endpoint = %self.endpoint.name(),
            count = ids.len(),
            from_slot = from.slot,
            to_slot = to.slot,
            "migrated clients"
        );
        self.dispatcher
            .hub()
            .on_clients_migrated(&ids, from.slot, to.slot)
            .await;
    }

    /// A slot died for good; hand its clients to any surviving slot
    async fn evacuate(&self, from: ServingTag) {
        let target = (0..self.slots.len())
            .filter(|&i| i != from.slot)
            .find(|&i| self.slots[i].live().is_some());
        match target {
            Some(slot_index) => self.migrate(from, self.serving_tag(slot_index)).await,
            None => {
                let stranded = self.registry.on_connection(from).len();
                if stranded > 0 {
                    warn!(
                        endpoint = %self.endpoint.name(),
                        count = stranded,
                        "no live slot to migrate clients to"
                    );
                }
            }
        }
    }

    /// Send a message through a live connection.
    ///
    /// Honors the scope's preferred slot when that slot is live, otherwise
    /// round-robins across live slots. Backpressure comes from the chosen
    /// connection's bounded queue.
    pub async fn write(&self, message: ServiceMessage, scope: &CallScope) -> Result<()> {
        let envelope = ServiceEnvelope::new(message).with_tracing_id(scope.tracing_id);

        if let Some(preferred) = scope.preferred_slot {
            if let Some(connection) = self.slots.get(preferred).and_then(|slot| slot.live()) {
                if scope.diagnostic_client {
                    debug!(connection = %connection.id(), "diagnostic write on preferred slot");
                }
                return connection.write(envelope).await;
            }
        }

        let count = self.slots.len();
        let start = self.next_slot.fetch_add(1, Ordering::Relaxed);
        for offset in 0..count {
            let slot_index = (start + offset) % count;
            if let Some(connection) = self.slots[slot_index].live() {
                return connection.write(envelope).await;
            }
        }
        Err(ServiceLinkError::ServiceNotConnected)
    }

    /// Send an ack-requiring message and await the service's confirmation
    pub async fn write_with_ack(
        &self,
        build: impl FnOnce(u32) -> ServiceMessage,
        scope: &CallScope,
    ) -> Result<()> {
        let (ack_id, receiver) = self.acks.register();
        self.write(build(ack_id), scope).await?;
        self.acks.wait(ack_id, receiver).await
    }

    /// Graceful shutdown.
    ///
    /// New opens are refused first; connected clients optionally get a drain
    /// notice, then the configured shutdown mode runs before the remaining
    /// clients are force-closed and the connections torn down.
    pub async fn stop(&self) {
        {
            let mut status = self.status.lock();
            if *status == ContainerStatus::Stopped {
                return;
            }
            *status = ContainerStatus::Draining;
        }
        self.accepting_opens.store(false, Ordering::Release);
        info!(endpoint = %self.endpoint.name(), "draining container");

        if let Some(notice) = &self.config.drain_notice {
            for client in self.registry.on_endpoint(self.endpoint_index) {
                let message = ServiceMessage::ConnectionData {
                    connection_id: client.connection_id().to_string(),
                    payload: notice.clone(),
                };
                if let Err(e) = self.write(message, &CallScope::new()).await {
                    debug!("drain notice failed: {}", e);
                }
            }
        }

        match self.config.shutdown.mode {
            ShutdownMode::Off => {}
            ShutdownMode::WaitForClients => {
                let deadline = tokio::time::Instant::now() + self.config.shutdown.timeout;
                while self.registry.count_on_endpoint(self.endpoint_index) > 0 {
                    if tokio::time::Instant::now() >= deadline {
                        warn!(
                            endpoint = %self.endpoint.name(),
                            remaining = self.registry.count_on_endpoint(self.endpoint_index),
                            "drain timeout reached with clients still connected"
                        );
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
            ShutdownMode::FixedTimeout => {
                tokio::time::sleep(self.config.shutdown.timeout).await;
            }
        }

        for client in self.registry.on_endpoint(self.endpoint_index) {
            let connection_id = client.connection_id().to_string();
            let message = ServiceMessage::CloseConnection {
                connection_id: connection_id.clone(),
                error: None,
                ack_id: None,
            };
            let _ = self.write(message, &CallScope::new()).await;
            self.registry.remove(&connection_id);
            client.close();
            if let Err(e) = self
                .dispatcher
                .hub()
                .on_client_disconnected(&connection_id, Some("server shutting down".into()))
                .await
            {
                debug!("disconnect callback failed: {}", e);
            }
        }

        self.cancel.cancel();
        for slot in &self.slots {
            if let Some(connection) = slot.connection.write().take() {
                connection.stop();
            }
        }
        self.acks.fail_all();
        self.tasks.close();
        self.tasks.wait().await;

        *self.status.lock() = ContainerStatus::Stopped;
        self.endpoint.set_online(false);
        info!(endpoint = %self.endpoint.name(), "container stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointType;
    use crate::traits::credential::StaticCredential;
    use crate::traits::dispatch::NoOpDispatcher;

    fn container() -> Arc<ServiceConnectionContainer> {
        let endpoint = Arc::new(Endpoint::new(
            "test",
            "https://relay.example.com",
            EndpointType::Primary,
            Arc::new(StaticCredential::new("key")),
        ));
        ServiceConnectionContainer::new(
            endpoint,
            0,
            ContainerConfig::default(),
            Arc::new(ClientConnectionRegistry::new()),
            Arc::new(InvocationManager::new("srv-a")),
            Arc::new(NoOpDispatcher),
        )
    }

    #[tokio::test]
    async fn write_without_live_connections_is_not_connected() {
        let container = container();
        let err = container
            .write(ServiceMessage::Ping, &CallScope::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceLinkError::ServiceNotConnected));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_reaches_stopped() {
        let container = container();
        assert_eq!(container.status(), ContainerStatus::Initial);
        container.stop().await;
        assert_eq!(container.status(), ContainerStatus::Stopped);
        assert!(!container.endpoint().is_online());
        container.stop().await;
        assert_eq!(container.status(), ContainerStatus::Stopped);
    }

    #[test]
    fn snapshot_reflects_slot_count() {
        let container = container();
        let snapshot = container.snapshot();
        assert_eq!(snapshot.total_slots, 2);
        assert_eq!(snapshot.live_connections, 0);
        assert_eq!(snapshot.clients, 0);
        assert_eq!(snapshot.status, ContainerStatus::Initial);
    }
}
