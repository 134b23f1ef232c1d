//! Relay endpoint identity, health and capacity.
//!
//! An [`Endpoint`] is created from configuration at startup and keeps an
//! immutable identity (URL, credential, type, name) for its whole lifetime.
//! Only its health flag and capacity metrics mutate, driven by handshake
//! failures and service load reports.

use crate::traits::credential::{CredentialProvider, StaticCredential};
use crate::traits::error::{Result, ServiceLinkError};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Whether an endpoint is preferred for new client traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Primary,
    Secondary,
}

/// Capacity metrics reported by the relay service for one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointCapacity {
    pub client_count: u32,
    pub server_count: u32,
    pub max_capacity: u32,
}

impl EndpointCapacity {
    /// Fraction of remaining capacity in `[0, 1]`
    pub fn remaining_fraction(&self) -> f64 {
        if self.max_capacity == 0 {
            return 0.0;
        }
        let used = u64::from(self.client_count) + u64::from(self.server_count);
        let free = u64::from(self.max_capacity).saturating_sub(used);
        (free as f64 / f64::from(self.max_capacity)).clamp(0.0, 1.0)
    }
}

/// One relay service instance
pub struct Endpoint {
    name: String,
    url: String,
    endpoint_type: EndpointType,
    credential: Arc<dyn CredentialProvider>,
    online: AtomicBool,
    capacity: RwLock<Option<EndpointCapacity>>,
}

impl Endpoint {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        endpoint_type: EndpointType,
        credential: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            url: trim_trailing_slash(url.into()),
            endpoint_type,
            credential,
            online: AtomicBool::new(false),
            capacity: RwLock::new(None),
        }
    }

    /// Parse an endpoint from a connection string
    ///
    /// Format: `Endpoint=https://host;AccessKey=...;Type=secondary;Name=...`
    /// Keys are case-insensitive; `Type` defaults to primary and `Name`
    /// defaults to the endpoint host.
    ///
    /// The access key is handed to a [`StaticCredential`]; minting a real
    /// signed token from it is outside this crate's scope.
    pub fn from_connection_string(connection_string: &str) -> Result<Self> {
        let mut url = None;
        let mut access_key = None;
        let mut endpoint_type = EndpointType::Primary;
        let mut name = None;

        for part in connection_string.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=').ok_or_else(|| {
                ServiceLinkError::Configuration(format!(
                    "malformed connection string segment '{}'",
                    part
                ))
            })?;
            match key.trim().to_ascii_lowercase().as_str() {
                "endpoint" => url = Some(value.trim().to_string()),
                "accesskey" => access_key = Some(value.trim().to_string()),
                "type" => {
                    endpoint_type = match value.trim().to_ascii_lowercase().as_str() {
                        "primary" => EndpointType::Primary,
                        "secondary" => EndpointType::Secondary,
                        other => {
                            return Err(ServiceLinkError::Configuration(format!(
                                "unknown endpoint type '{}'",
                                other
                            )))
                        }
                    }
                }
                "name" => name = Some(value.trim().to_string()),
                // Unknown keys are ignored so configs can carry extra fields
                _ => {}
            }
        }

        let url = url.ok_or_else(|| {
            ServiceLinkError::Configuration("connection string is missing Endpoint=".into())
        })?;
        let access_key = access_key.ok_or_else(|| {
            ServiceLinkError::Configuration("connection string is missing AccessKey=".into())
        })?;
        let name = name.unwrap_or_else(|| host_of(&url).to_string());

        Ok(Self::new(
            name,
            url,
            endpoint_type,
            Arc::new(StaticCredential::new(access_key)),
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn endpoint_type(&self) -> EndpointType {
        self.endpoint_type
    }

    pub fn credential(&self) -> &Arc<dyn CredentialProvider> {
        &self.credential
    }

    /// WebSocket URL application servers connect to
    pub fn server_url(&self) -> String {
        format!("{}/server/", to_ws_scheme(&self.url))
    }

    /// WebSocket URL handed to end-user clients in negotiate responses
    pub fn client_url(&self) -> String {
        format!("{}/client/", to_ws_scheme(&self.url))
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Latest reported capacity metrics, if any
    pub fn capacity(&self) -> Option<EndpointCapacity> {
        *self.capacity.read()
    }

    pub fn update_capacity(&self, capacity: EndpointCapacity) {
        *self.capacity.write() = Some(capacity);
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("endpoint_type", &self.endpoint_type)
            .field("online", &self.is_online())
            .field("capacity", &self.capacity())
            .finish()
    }
}

fn trim_trailing_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

fn to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        url.to_string()
    }
}

fn host_of(url: &str) -> &str {
    let without_scheme = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    without_scheme
        .split(['/', ':'])
        .next()
        .unwrap_or(without_scheme)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_connection_string() {
        let endpoint = Endpoint::from_connection_string(
            "Endpoint=https://relay.example.com;AccessKey=abc123;Type=secondary;Name=east",
        )
        .unwrap();
        assert_eq!(endpoint.name(), "east");
        assert_eq!(endpoint.url(), "https://relay.example.com");
        assert_eq!(endpoint.endpoint_type(), EndpointType::Secondary);
        assert_eq!(endpoint.server_url(), "wss://relay.example.com/server/");
        assert_eq!(endpoint.client_url(), "wss://relay.example.com/client/");
        assert!(!endpoint.is_online());
    }

    #[test]
    fn defaults_type_and_name() {
        let endpoint = Endpoint::from_connection_string(
            "Endpoint=http://localhost:8080/;AccessKey=k",
        )
        .unwrap();
        assert_eq!(endpoint.endpoint_type(), EndpointType::Primary);
        assert_eq!(endpoint.name(), "localhost");
        assert_eq!(endpoint.server_url(), "ws://localhost:8080/server/");
    }

    #[test]
    fn missing_fields_are_configuration_errors() {
        assert!(Endpoint::from_connection_string("AccessKey=k").is_err());
        assert!(Endpoint::from_connection_string("Endpoint=https://x").is_err());
        assert!(
            Endpoint::from_connection_string("Endpoint=https://x;AccessKey=k;Type=tertiary")
                .is_err()
        );
    }

    #[test]
    fn remaining_fraction_bounds() {
        let full = EndpointCapacity {
            client_count: 90,
            server_count: 10,
            max_capacity: 100,
        };
        assert_eq!(full.remaining_fraction(), 0.0);

        let empty = EndpointCapacity {
            client_count: 0,
            server_count: 0,
            max_capacity: 100,
        };
        assert_eq!(empty.remaining_fraction(), 1.0);

        let over = EndpointCapacity {
            client_count: 150,
            server_count: 0,
            max_capacity: 100,
        };
        assert_eq!(over.remaining_fraction(), 0.0);
    }
}
