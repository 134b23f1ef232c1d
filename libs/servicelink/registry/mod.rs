//! Client-connection registry.
//!
//! Maps a client's opaque connection-id to its local context and to the
//! physical service connection currently carrying its traffic. All operations
//! are O(1) and concurrent-safe; add is an idempotent overwrite (last writer
//! wins) and remove is idempotent.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identifies the physical service connection serving a client.
///
/// Carries a generation epoch instead of a reference so a retired connection
/// is detected by comparison and never used (the container bumps the slot's
/// generation every time it replaces the connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServingTag {
    /// Index of the owning endpoint within the gateway
    pub endpoint_index: usize,
    /// Connection slot within that endpoint's container
    pub slot: usize,
    /// Epoch of the physical connection occupying the slot
    pub generation: u64,
}

/// One end-user's logical connection, independent of the physical service
/// connection currently carrying it (migration may move it).
pub struct ClientConnectionContext {
    connection_id: String,
    user_id: Option<String>,
    claims: HashMap<String, String>,
    groups: RwLock<HashSet<String>>,
    open: AtomicBool,
    serving: RwLock<ServingTag>,
}

impl ClientConnectionContext {
    pub fn new(
        connection_id: impl Into<String>,
        user_id: Option<String>,
        claims: HashMap<String, String>,
        serving: ServingTag,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id,
            claims,
            groups: RwLock::new(HashSet::new()),
            open: AtomicBool::new(true),
            serving: RwLock::new(serving),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn claims(&self) -> &HashMap<String, String> {
        &self.claims
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Tag of the physical connection currently carrying this client
    pub fn serving(&self) -> ServingTag {
        *self.serving.read()
    }

    /// Reassign this client to another physical connection (migration)
    pub fn set_serving(&self, tag: ServingTag) {
        *self.serving.write() = tag;
    }

    pub fn join_group(&self, group: impl Into<String>) {
        self.groups.write().insert(group.into());
    }

    pub fn leave_group(&self, group: &str) {
        self.groups.write().remove(group);
    }

    pub fn groups(&self) -> Vec<String> {
        self.groups.read().iter().cloned().collect()
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.read().contains(group)
    }
}

/// Concurrent registry of client connection contexts
#[derive(Default)]
pub struct ClientConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<ClientConnectionContext>>>,
}

impl ClientConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a context, overwriting any existing entry for the same id.
    ///
    /// Returns the replaced context when one existed (last writer wins).
    pub fn add(&self, ctx: Arc<ClientConnectionContext>) -> Option<Arc<ClientConnectionContext>> {
        self.connections
            .write()
            .insert(ctx.connection_id().to_string(), ctx)
    }

    /// Remove a context by id.
    ///
    /// Returns `None` when the id was not present; never panics, so removal
    /// is safe to call twice.
    pub fn remove(&self, connection_id: &str) -> Option<Arc<ClientConnectionContext>> {
        self.connections.write().remove(connection_id)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<ClientConnectionContext>> {
        self.connections.read().get(connection_id).cloned()
    }

    /// Tag of the physical connection serving a client, if the client exists
    pub fn serving_tag(&self, connection_id: &str) -> Option<ServingTag> {
        self.connections
            .read()
            .get(connection_id)
            .map(|ctx| ctx.serving())
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// All contexts currently served through the given endpoint
    pub fn on_endpoint(&self, endpoint_index: usize) -> Vec<Arc<ClientConnectionContext>> {
        self.connections
            .read()
            .values()
            .filter(|ctx| ctx.serving().endpoint_index == endpoint_index)
            .cloned()
            .collect()
    }

    /// Number of clients currently served through the given endpoint
    pub fn count_on_endpoint(&self, endpoint_index: usize) -> usize {
        self.connections
            .read()
            .values()
            .filter(|ctx| ctx.serving().endpoint_index == endpoint_index)
            .count()
    }

    /// All contexts whose serving tag matches the given slot epoch exactly
    pub fn on_connection(&self, tag: ServingTag) -> Vec<Arc<ClientConnectionContext>> {
        self.connections
            .read()
            .values()
            .filter(|ctx| ctx.serving() == tag)
            .cloned()
            .collect()
    }

    pub fn connection_ids(&self) -> Vec<String> {
        self.connections.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(slot: usize) -> ServingTag {
        ServingTag {
            endpoint_index: 0,
            slot,
            generation: 1,
        }
    }

    fn ctx(id: &str, slot: usize) -> Arc<ClientConnectionContext> {
        Arc::new(ClientConnectionContext::new(
            id,
            None,
            HashMap::new(),
            tag(slot),
        ))
    }

    #[test]
    fn add_twice_leaves_exactly_one_entry() {
        let registry = ClientConnectionRegistry::new();
        assert!(registry.add(ctx("conn-1", 0)).is_none());
        let replaced = registry.add(ctx("conn-1", 1));
        assert!(replaced.is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("conn-1").unwrap().serving().slot, 1);
    }

    #[test]
    fn remove_missing_is_a_noop() {
        let registry = ClientConnectionRegistry::new();
        assert!(registry.remove("absent").is_none());
        registry.add(ctx("conn-1", 0));
        assert!(registry.remove("conn-1").is_some());
        assert!(registry.remove("conn-1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn serving_tag_detects_migration() {
        let registry = ClientConnectionRegistry::new();
        let context = ctx("conn-1", 0);
        registry.add(context.clone());
        assert_eq!(registry.serving_tag("conn-1"), Some(tag(0)));

        context.set_serving(ServingTag {
            endpoint_index: 0,
            slot: 2,
            generation: 9,
        });
        assert_eq!(registry.serving_tag("conn-1").unwrap().generation, 9);
        assert!(registry.on_connection(tag(0)).is_empty());
    }

    #[test]
    fn groups_track_membership() {
        let context = ctx("conn-1", 0);
        context.join_group("lobby");
        context.join_group("lobby");
        assert!(context.in_group("lobby"));
        assert_eq!(context.groups().len(), 1);
        context.leave_group("lobby");
        assert!(!context.in_group("lobby"));
    }
}
