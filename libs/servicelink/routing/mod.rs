//! Message router / endpoint selection.
//!
//! Outbound messages are routed to a subset of configured endpoints. The
//! default policy fans out to every online endpoint (multi-endpoint
//! redundancy); negotiate picks exactly one endpoint, weighted by remaining
//! capacity.
//!
//! Overrides compose as an ordered list of strategies: each strategy may
//! decline a decision by returning `None`, in which case the next strategy is
//! consulted, ending at the always-deciding default. This keeps the
//! "fall back to default" semantics explicit instead of hiding them in an
//! inheritance chain.

pub mod selector;

use crate::endpoint::Endpoint;
use crate::traits::error::Result;
use crate::traits::random::RandomSource;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A routing strategy. Every method may decline by returning `None`.
pub trait EndpointRouter: Send + Sync {
    /// Endpoints that should receive a broadcast
    fn select_broadcast(&self, endpoints: &[Arc<Endpoint>]) -> Option<Vec<Arc<Endpoint>>> {
        let _ = endpoints;
        None
    }

    /// Endpoints that should receive a message for one user
    fn select_user(
        &self,
        user_id: &str,
        endpoints: &[Arc<Endpoint>],
    ) -> Option<Vec<Arc<Endpoint>>> {
        let _ = (user_id, endpoints);
        None
    }

    /// Endpoints that should receive a message for one group
    fn select_group(
        &self,
        group_name: &str,
        endpoints: &[Arc<Endpoint>],
    ) -> Option<Vec<Arc<Endpoint>>> {
        let _ = (group_name, endpoints);
        None
    }

    /// Endpoints that should receive a message for one connection
    fn select_connection(
        &self,
        connection_id: &str,
        endpoints: &[Arc<Endpoint>],
    ) -> Option<Vec<Arc<Endpoint>>> {
        let _ = (connection_id, endpoints);
        None
    }

    /// The single endpoint a new client should connect to
    fn select_negotiate(
        &self,
        endpoints: &[Arc<Endpoint>],
        rng: &mut dyn RandomSource,
    ) -> Option<Result<Arc<Endpoint>>> {
        let _ = (endpoints, rng);
        None
    }
}

/// Terminal strategy: fan out to all online endpoints; weighted negotiate.
pub struct DefaultRouter;

impl EndpointRouter for DefaultRouter {
    fn select_broadcast(&self, endpoints: &[Arc<Endpoint>]) -> Option<Vec<Arc<Endpoint>>> {
        Some(selector::online(endpoints))
    }

    fn select_user(
        &self,
        _user_id: &str,
        endpoints: &[Arc<Endpoint>],
    ) -> Option<Vec<Arc<Endpoint>>> {
        Some(selector::online(endpoints))
    }

    fn select_group(
        &self,
        _group_name: &str,
        endpoints: &[Arc<Endpoint>],
    ) -> Option<Vec<Arc<Endpoint>>> {
        Some(selector::online(endpoints))
    }

    fn select_connection(
        &self,
        _connection_id: &str,
        endpoints: &[Arc<Endpoint>],
    ) -> Option<Vec<Arc<Endpoint>>> {
        Some(selector::online(endpoints))
    }

    fn select_negotiate(
        &self,
        endpoints: &[Arc<Endpoint>],
        rng: &mut dyn RandomSource,
    ) -> Option<Result<Arc<Endpoint>>> {
        Some(selector::pick_for_negotiate(endpoints, rng))
    }
}

/// Ordered strategy chain with an implicit [`DefaultRouter`] terminal
pub struct RouterChain {
    strategies: Vec<Box<dyn EndpointRouter>>,
    fallback: DefaultRouter,
}

impl Default for RouterChain {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
            fallback: DefaultRouter,
        }
    }

    /// Append a strategy; earlier strategies take precedence
    pub fn with_strategy(mut self, strategy: Box<dyn EndpointRouter>) -> Self {
        self.strategies.push(strategy);
        self
    }

    pub fn broadcast(&self, endpoints: &[Arc<Endpoint>]) -> Vec<Arc<Endpoint>> {
        for strategy in &self.strategies {
            if let Some(selection) = strategy.select_broadcast(endpoints) {
                return selection;
            }
        }
        self.fallback.select_broadcast(endpoints).unwrap_or_default()
    }

    pub fn user(&self, user_id: &str, endpoints: &[Arc<Endpoint>]) -> Vec<Arc<Endpoint>> {
        for strategy in &self.strategies {
            if let Some(selection) = strategy.select_user(user_id, endpoints) {
                return selection;
            }
        }
        self.fallback
            .select_user(user_id, endpoints)
            .unwrap_or_default()
    }

    pub fn group(&self, group_name: &str, endpoints: &[Arc<Endpoint>]) -> Vec<Arc<Endpoint>> {
        for strategy in &self.strategies {
            if let Some(selection) = strategy.select_group(group_name, endpoints) {
                return selection;
            }
        }
        self.fallback
            .select_group(group_name, endpoints)
            .unwrap_or_default()
    }

    pub fn connection(
        &self,
        connection_id: &str,
        endpoints: &[Arc<Endpoint>],
    ) -> Vec<Arc<Endpoint>> {
        for strategy in &self.strategies {
            if let Some(selection) = strategy.select_connection(connection_id, endpoints) {
                return selection;
            }
        }
        self.fallback
            .select_connection(connection_id, endpoints)
            .unwrap_or_default()
    }

    pub fn negotiate(
        &self,
        endpoints: &[Arc<Endpoint>],
        rng: &mut dyn RandomSource,
    ) -> Result<Arc<Endpoint>> {
        for strategy in &self.strategies {
            if let Some(selection) = strategy.select_negotiate(endpoints, rng) {
                return selection;
            }
        }
        self.fallback
            .select_negotiate(endpoints, rng)
            .expect("default router always decides")
    }
}

/// JSON payload returned to clients from a negotiate call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiateResponse {
    pub url: String,
    #[serde(rename = "accessToken")]
    pub access_token: String,
}
