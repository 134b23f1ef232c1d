//! Gateway facade.
//!
//! [`RelayGateway`] is the application-facing surface: it owns one container
//! per endpoint plus the shared registry, invocation manager and router, and
//! turns high-level operations (broadcast, group management, server-to-client
//! invocation, negotiate) into service frames on the right connections.

use super::config::GatewayConfig;
use super::container::{ContainerSnapshot, ServiceConnectionContainer};
use crate::endpoint::Endpoint;
use crate::invocation::InvocationManager;
use crate::protocol::message::ServiceMessage;
use crate::registry::ClientConnectionRegistry;
use crate::routing::{EndpointRouter, NegotiateResponse, RouterChain};
use crate::scope::CallScope;
use crate::traits::dispatch::{HubDispatcher, NoOpDispatcher};
use crate::traits::error::{Result, ServiceLinkError};
use crate::traits::protocol::{HubProtocol, JsonHubProtocol};
use crate::traits::random::{RandomSource, ThreadRandom};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Point-in-time view of the whole gateway
#[derive(Debug, Clone)]
pub struct GatewaySnapshot {
    pub server_id: String,
    pub clients: usize,
    pub containers: Vec<ContainerSnapshot>,
}

pub struct RelayGatewayBuilder {
    config: GatewayConfig,
    endpoints: Vec<Arc<Endpoint>>,
    hub: Arc<dyn HubDispatcher>,
    protocol: Arc<dyn HubProtocol>,
    router: RouterChain,
    rng: Box<dyn RandomSource>,
}

impl RelayGatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            endpoints: Vec::new(),
            hub: Arc::new(NoOpDispatcher),
            protocol: Arc::new(JsonHubProtocol),
            router: RouterChain::new(),
            rng: Box::new(ThreadRandom),
        }
    }

    /// Add an endpoint parsed from a connection string
    pub fn with_connection_string(mut self, connection_string: &str) -> Result<Self> {
        self.endpoints
            .push(Arc::new(Endpoint::from_connection_string(connection_string)?));
        Ok(self)
    }

    pub fn with_endpoint(mut self, endpoint: Arc<Endpoint>) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn with_hub(mut self, hub: Arc<dyn HubDispatcher>) -> Self {
        self.hub = hub;
        self
    }

    pub fn with_protocol(mut self, protocol: Arc<dyn HubProtocol>) -> Self {
        self.protocol = protocol;
        self
    }

    /// Prepend-free: strategies apply in the order they are added
    pub fn with_routing_strategy(mut self, strategy: Box<dyn EndpointRouter>) -> Self {
        self.router = self.router.with_strategy(strategy);
        self
    }

    pub fn with_random_source(mut self, rng: Box<dyn RandomSource>) -> Self {
        self.rng = rng;
        self
    }

    pub fn build(self) -> Result<RelayGateway> {
        if self.endpoints.is_empty() {
            return Err(ServiceLinkError::Configuration(
                "at least one endpoint is required".into(),
            ));
        }

        let registry = Arc::new(ClientConnectionRegistry::new());
        let invocations = Arc::new(InvocationManager::new(self.config.server_id.clone()));
        let containers = self
            .endpoints
            .iter()
            .enumerate()
            .map(|(index, endpoint)| {
                ServiceConnectionContainer::new(
                    endpoint.clone(),
                    index,
                    self.config.container.clone(),
                    registry.clone(),
                    invocations.clone(),
                    self.hub.clone(),
                )
            })
            .collect();

        Ok(RelayGateway {
            config: self.config,
            endpoints: self.endpoints,
            containers,
            registry,
            invocations,
            router: self.router,
            protocol: self.protocol,
            rng: Mutex::new(self.rng),
            cancel: CancellationToken::new(),
        })
    }
}

pub struct RelayGateway {
    config: GatewayConfig,
    endpoints: Vec<Arc<Endpoint>>,
    containers: Vec<Arc<ServiceConnectionContainer>>,
    registry: Arc<ClientConnectionRegistry>,
    invocations: Arc<InvocationManager>,
    router: RouterChain,
    protocol: Arc<dyn HubProtocol>,
    rng: Mutex<Box<dyn RandomSource>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RelayGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayGateway")
            .field("server_id", &self.config.server_id)
            .field("endpoints", &self.endpoints.len())
            .field("clients", &self.registry.len())
            .finish()
    }
}

impl RelayGateway {
    pub fn builder(config: GatewayConfig) -> RelayGatewayBuilder {
        RelayGatewayBuilder::new(config)
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub fn registry(&self) -> &Arc<ClientConnectionRegistry> {
        &self.registry
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        GatewaySnapshot {
            server_id: self.config.server_id.clone(),
            clients: self.registry.len(),
            containers: self.containers.iter().map(|c| c.snapshot()).collect(),
        }
    }

    /// Bring every container up.
    ///
    /// Fails only when no endpoint at all could be reached; a partially
    /// started gateway keeps retrying the rest in the background.
    pub async fn start(&self) -> Result<()> {
        info!(server_id = %self.config.server_id, endpoints = self.endpoints.len(), "starting gateway");
        let mut first_error = None;
        let mut started = 0usize;
        for container in &self.containers {
            match container.start().await {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!(endpoint = %container.endpoint().name(), "container failed to start: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if started == 0 {
            return Err(first_error.unwrap_or(ServiceLinkError::ServiceNotConnected));
        }
        Ok(())
    }

    /// Gracefully stop every container and fault all pending work
    pub async fn shutdown(&self) {
        info!(server_id = %self.config.server_id, "shutting down gateway");
        self.cancel.cancel();
        self.invocations.fail_all("gateway shutting down");
        for container in &self.containers {
            container.stop().await;
        }
    }

    fn container_for(&self, endpoint: &Arc<Endpoint>) -> Option<&Arc<ServiceConnectionContainer>> {
        self.endpoints
            .iter()
            .position(|e| Arc::ptr_eq(e, endpoint))
            .map(|index| &self.containers[index])
    }

    /// Send one message to every selected endpoint; succeeds when at least
    /// one delivery succeeded.
    async fn fan_out(
        &self,
        message: ServiceMessage,
        selected: Vec<Arc<Endpoint>>,
        scope: &CallScope,
    ) -> Result<()> {
        if selected.is_empty() {
            return Err(ServiceLinkError::ServiceNotConnected);
        }
        let mut first_error = None;
        let mut delivered = 0usize;
        for endpoint in &selected {
            let Some(container) = self.container_for(endpoint) else {
                continue;
            };
            match container.write(message.clone(), scope).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    debug!(endpoint = %endpoint.name(), "delivery failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if delivered == 0 {
            return Err(first_error.unwrap_or(ServiceLinkError::ServiceNotConnected));
        }
        Ok(())
    }

    /// Broadcast a payload to every connected client except `excluded`
    pub async fn broadcast(
        &self,
        payload: Bytes,
        excluded: Vec<String>,
        scope: &CallScope,
    ) -> Result<()> {
        let selected = self.router.broadcast(&self.endpoints);
        self.fan_out(ServiceMessage::BroadcastData { excluded, payload }, selected, scope)
            .await
    }

    /// Send a payload to one specific client connection.
    ///
    /// When the connection is registered locally the message goes out on the
    /// physical connection serving it; otherwise it fans out per the router
    /// so another instance's client can still be reached.
    pub async fn send_to_connection(
        &self,
        connection_id: &str,
        payload: Bytes,
        scope: &CallScope,
    ) -> Result<()> {
        let message = ServiceMessage::ConnectionData {
            connection_id: connection_id.to_string(),
            payload,
        };
        if let Some(tag) = self.registry.serving_tag(connection_id) {
            let container = &self.containers[tag.endpoint_index];
            let pinned = scope.clone().with_preferred_slot(tag.slot);
            return container.write(message, &pinned).await;
        }
        let selected = self.router.connection(connection_id, &self.endpoints);
        self.fan_out(message, selected, scope).await
    }

    pub async fn send_to_user(&self, user_id: &str, payload: Bytes, scope: &CallScope) -> Result<()> {
        let selected = self.router.user(user_id, &self.endpoints);
        let message = ServiceMessage::UserData {
            user_id: user_id.to_string(),
            payload,
        };
        self.fan_out(message, selected, scope).await
    }

    pub async fn send_to_users(
        &self,
        user_ids: Vec<String>,
        payload: Bytes,
        scope: &CallScope,
    ) -> Result<()> {
        let selected = self.router.broadcast(&self.endpoints);
        self.fan_out(ServiceMessage::MultiUserData { user_ids, payload }, selected, scope)
            .await
    }

    pub async fn send_to_group(
        &self,
        group_name: &str,
        payload: Bytes,
        excluded: Vec<String>,
        scope: &CallScope,
    ) -> Result<()> {
        let selected = self.router.group(group_name, &self.endpoints);
        let message = ServiceMessage::GroupBroadcastData {
            group_name: group_name.to_string(),
            excluded,
            payload,
        };
        self.fan_out(message, selected, scope).await
    }

    pub async fn send_to_groups(
        &self,
        group_names: Vec<String>,
        payload: Bytes,
        scope: &CallScope,
    ) -> Result<()> {
        let selected = self.router.broadcast(&self.endpoints);
        self.fan_out(
            ServiceMessage::MultiGroupBroadcastData { group_names, payload },
            selected,
            scope,
        )
        .await
    }

    /// The container serving a connection, falling back to the router's pick
    fn container_serving(&self, connection_id: &str) -> Result<&Arc<ServiceConnectionContainer>> {
        if let Some(tag) = self.registry.serving_tag(connection_id) {
            return Ok(&self.containers[tag.endpoint_index]);
        }
        self.router
            .connection(connection_id, &self.endpoints)
            .first()
            .and_then(|endpoint| self.container_for(endpoint))
            .ok_or(ServiceLinkError::ServiceNotConnected)
    }

    /// Add a connection to a group; resolves once the service confirms
    pub async fn join_group(&self, connection_id: &str, group_name: &str, scope: &CallScope) -> Result<()> {
        let container = self.container_serving(connection_id)?;
        container
            .write_with_ack(
                |ack_id| ServiceMessage::JoinGroup {
                    connection_id: connection_id.to_string(),
                    group_name: group_name.to_string(),
                    ack_id: Some(ack_id),
                },
                scope,
            )
            .await?;
        if let Some(client) = self.registry.get(connection_id) {
            client.join_group(group_name);
        }
        Ok(())
    }

    /// Remove a connection from a group; resolves once the service confirms
    pub async fn leave_group(&self, connection_id: &str, group_name: &str, scope: &CallScope) -> Result<()> {
        let container = self.container_serving(connection_id)?;
        container
            .write_with_ack(
                |ack_id| ServiceMessage::LeaveGroup {
                    connection_id: connection_id.to_string(),
                    group_name: group_name.to_string(),
                    ack_id: Some(ack_id),
                },
                scope,
            )
            .await?;
        if let Some(client) = self.registry.get(connection_id) {
            client.leave_group(group_name);
        }
        Ok(())
    }

    /// Invoke a client and await its typed result.
    ///
    /// `make_payload` receives the generated invocation id and must produce
    /// the hub-protocol payload that carries it to the client. The completion
    /// payload is decoded with the gateway's hub protocol.
    pub async fn invoke<T, F>(&self, connection_id: &str, scope: &CallScope, make_payload: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnOnce(&str) -> Result<Bytes>,
    {
        let invocation_id = self.invocations.generate_invocation_id(connection_id);
        let handle = self.invocations.add_invocation(
            connection_id,
            invocation_id.clone(),
            self.protocol.name(),
            None,
        );

        let payload = match make_payload(&invocation_id) {
            Ok(payload) => payload,
            Err(e) => {
                self.invocations.remove(&invocation_id);
                return Err(e);
            }
        };
        if let Err(e) = self.send_to_connection(connection_id, payload, scope).await {
            self.invocations.remove(&invocation_id);
            return Err(e);
        }

        // A scope-level token cancels just this call; otherwise the
        // gateway-wide token applies.
        let cancel = scope.cancellation.as_ref().unwrap_or(&self.cancel);
        let raw = self
            .invocations
            .wait_completion(handle, cancel, self.config.invocation_timeout)
            .await?;
        let value = self.protocol.from_bytes(&raw)?;
        serde_json::from_value(value).map_err(|e| ServiceLinkError::Serialization(e.to_string()))
    }

    /// Pick an endpoint for a new client and mint its redirect response
    pub async fn negotiate(&self) -> Result<NegotiateResponse> {
        let picked = {
            let mut rng = self.rng.lock();
            self.router.negotiate(&self.endpoints, rng.as_mut())?
        };
        let url = picked.client_url();
        let access_token = picked.credential().access_token(&url).await?;
        Ok(NegotiateResponse { url, access_token })
    }
}
