//! Bearer credentials and the provider interface used to obtain them.
//!
//! The sync core never looks a credential up on its own. A single [`CredentialProvider`] is
//! injected when the [`crate::client::SyncClient`] is constructed and is asked for a fresh
//! credential on every connect, every reconnect and every REST fetch, so token rotation is the
//! provider's concern.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderValue;
/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};

use crate::Result;

/// Opaque bearer credential.
#[derive(Clone)]
pub struct Credential {
    token: SecretString,
}

impl Credential {
    #[must_use]
    pub fn bearer<S: Into<String>>(token: S) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }

    /// Returns the token.
    #[must_use]
    pub fn token(&self) -> &SecretString {
        &self.token
    }

    /// `Authorization` header value for this credential.
    pub(crate) fn header_value(&self) -> Result<HeaderValue> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.token.expose_secret()))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// Source of bearer credentials.
///
/// `Ok(None)` means no credential is currently available, which the transport treats as an
/// authentication failure without retrying.
#[async_trait]
pub trait CredentialProvider: Send + Sync + 'static {
    async fn credential(&self) -> Result<Option<Credential>>;
}

/// A provider that always hands out the same credential.
#[derive(Clone, Debug)]
pub struct StaticCredential(Option<Credential>);

impl StaticCredential {
    #[must_use]
    pub fn new(credential: Credential) -> Self {
        Self(Some(credential))
    }

    /// A provider with nothing to offer.
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn credential(&self) -> Result<Option<Credential>> {
        Ok(self.0.clone())
    }
}

/// Tries each provider in registration order and returns the first credential found.
///
/// This is the one place a resolution order lives. A provider that errors stops the chain,
/// it is not skipped.
#[derive(Clone, Default)]
pub struct CredentialChain {
    providers: Vec<Arc<dyn CredentialProvider>>,
}

impl CredentialChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with<P: CredentialProvider>(mut self, provider: P) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl CredentialProvider for CredentialChain {
    async fn credential(&self) -> Result<Option<Credential>> {
        for provider in &self.providers {
            if let Some(credential) = provider.credential().await? {
                return Ok(Some(credential));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    struct Failing;

    #[async_trait]
    impl CredentialProvider for Failing {
        async fn credential(&self) -> Result<Option<Credential>> {
            Err(crate::error::Error::authentication("keychain locked"))
        }
    }

    #[test]
    fn debug_output_is_redacted() {
        let credential = Credential::bearer("super-secret");

        assert!(!format!("{credential:?}").contains("super-secret"));
    }

    #[test]
    fn header_is_bearer_and_sensitive() {
        let value = Credential::bearer("abc").header_value().unwrap();

        assert_eq!(value.to_str().unwrap(), "Bearer abc");
        assert!(value.is_sensitive());
    }

    #[tokio::test]
    async fn chain_returns_first_available_credential() {
        let chain = CredentialChain::new()
            .with(StaticCredential::none())
            .with(StaticCredential::new(Credential::bearer("second")))
            .with(StaticCredential::new(Credential::bearer("third")));

        let credential = chain.credential().await.unwrap().unwrap();

        assert_eq!(credential.token().expose_secret(), "second");
    }

    #[tokio::test]
    async fn empty_chain_yields_nothing() {
        assert!(CredentialChain::new().credential().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn chain_stops_at_failing_provider() {
        let chain = CredentialChain::new()
            .with(Failing)
            .with(StaticCredential::new(Credential::bearer("unused")));

        let err = chain.credential().await.unwrap_err();

        assert_eq!(err.kind(), Kind::Authentication);
    }
}
