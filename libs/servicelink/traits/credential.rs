use crate::traits::error::Result;
use async_trait::async_trait;

/// Trait for providing the bearer credential attached to each connection
///
/// The gateway treats the token as an opaque signed credential; how it is
/// minted (symmetric key, AAD, ...) is outside this crate's scope.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Produce a bearer token scoped to the given audience URL
    ///
    /// Called once per connection attempt and once per negotiate response,
    /// so implementations may cache or re-mint as they see fit.
    async fn access_token(&self, audience: &str) -> Result<String>;
}

/// Credential provider backed by a pre-signed static token
pub struct StaticCredential {
    token: String,
}

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn access_token(&self, _audience: &str) -> Result<String> {
        Ok(self.token.clone())
    }
}
