//! Org credentials shared between the request executor and the event feed.
//!
//! [`Credentials`] holds the org id, an optional API key, an optional
//! [`TokenRenewal`] hook and the current bearer token. The token is swapped
//! wholesale on every (re)authentication; readers always see either the old
//! token or the new one, never a partially written value.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;

use crate::error::{ApiError, Result};

/// Boxed future returned by [`TokenRenewal::renew`].
pub type RenewalFuture<'a> = BoxFuture<'a, Result<String>>;

/// Externally supplied token renewal.
///
/// When configured, the client never exchanges the API key itself: on a 401
/// (or when no token is held yet) it asks the hook for a fresh bearer token
/// and stores whatever the hook returns.
pub trait TokenRenewal: Send + Sync {
    /// Produce a new bearer token for `org_id`.
    fn renew(&self, org_id: &str) -> RenewalFuture<'_>;
}

/// A [`TokenRenewal`] backed by an async closure.
///
/// ```ignore
/// let hook = FnRenewal::new(|oid| async move { fetch_token_from_vault(&oid).await });
/// ```
pub struct FnRenewal<F>(F);

impl<F, Fut> FnRenewal<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F, Fut> TokenRenewal for FnRenewal<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    fn renew(&self, org_id: &str) -> RenewalFuture<'_> {
        Box::pin((self.0)(org_id.to_string()))
    }
}

/// Credential store for one org.
pub struct Credentials {
    org_id: String,
    api_key: Option<String>,
    renewal: Option<Arc<dyn TokenRenewal>>,
    token: RwLock<Option<Arc<str>>>,
}

impl Credentials {
    /// Credentials that authenticate with a static API key.
    pub fn with_api_key(org_id: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            api_key: Some(api_key.into()),
            renewal: None,
            token: RwLock::new(None),
        }
    }

    /// Credentials whose tokens come from an external renewal hook.
    pub fn with_renewal(org_id: impl Into<String>, renewal: Arc<dyn TokenRenewal>) -> Self {
        Self {
            org_id: org_id.into(),
            api_key: None,
            renewal: Some(renewal),
            token: RwLock::new(None),
        }
    }

    /// Bare credentials: org id only. Add a key, hook or token with the
    /// `and_*` builders.
    pub fn new(org_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            api_key: None,
            renewal: None,
            token: RwLock::new(None),
        }
    }

    pub fn and_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn and_renewal(mut self, renewal: Arc<dyn TokenRenewal>) -> Self {
        self.renewal = Some(renewal);
        self
    }

    /// Seed an initial bearer token (e.g. one minted by a login flow).
    pub fn and_token(self, token: impl Into<String>) -> Self {
        self.replace_token(Some(token.into()));
        self
    }

    /// Read credentials from `LC_OID`, `LC_API_KEY` and `LC_JWT`.
    ///
    /// `LC_OID` is required; at least one of the other two must be set.
    pub fn from_env() -> Result<Self> {
        let org_id = std::env::var("LC_OID")
            .map_err(|_| ApiError::Configuration("LC_OID not set".to_string()))?;
        let api_key = std::env::var("LC_API_KEY").ok().filter(|k| !k.is_empty());
        let jwt = std::env::var("LC_JWT").ok().filter(|t| !t.is_empty());
        if api_key.is_none() && jwt.is_none() {
            return Err(ApiError::Configuration(
                "neither LC_API_KEY nor LC_JWT is set".to_string(),
            ));
        }
        let mut creds = Self::new(org_id);
        if let Some(key) = api_key {
            creds = creds.and_api_key(key);
        }
        if let Some(jwt) = jwt {
            creds = creds.and_token(jwt);
        }
        Ok(creds)
    }

    pub fn org_id(&self) -> &str {
        &self.org_id
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn renewal(&self) -> Option<&Arc<dyn TokenRenewal>> {
        self.renewal.as_ref()
    }

    /// Current bearer token, if one is held.
    pub fn token(&self) -> Option<Arc<str>> {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swap in a new token, or clear it with `None`.
    pub fn replace_token(&self, token: Option<String>) {
        let mut slot = self.token.write().unwrap_or_else(|e| e.into_inner());
        *slot = token.map(Arc::from);
    }

    /// Whether any way of authenticating is available.
    pub fn can_authenticate(&self) -> bool {
        self.api_key.is_some() || self.renewal.is_some() || self.token().is_some()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("org_id", &self.org_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("renewal", &self.renewal.is_some())
            .field("token", &self.token().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_replaced_wholesale() {
        let creds = Credentials::with_api_key("oid", "key");
        assert!(creds.token().is_none());

        creds.replace_token(Some("first".into()));
        let held = creds.token().unwrap();
        creds.replace_token(Some("second".into()));

        // An earlier reader keeps its snapshot.
        assert_eq!(&*held, "first");
        assert_eq!(creds.token().as_deref(), Some("second"));

        creds.replace_token(None);
        assert!(creds.token().is_none());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let creds = Credentials::with_api_key("oid", "super-secret").and_token("jwt-value");
        let dbg = format!("{creds:?}");
        assert!(!dbg.contains("super-secret"));
        assert!(!dbg.contains("jwt-value"));
        assert!(dbg.contains("oid"));
    }

    #[test]
    fn can_authenticate_needs_key_hook_or_token() {
        assert!(!Credentials::new("oid").can_authenticate());
        assert!(Credentials::new("oid").and_token("t").can_authenticate());
        assert!(Credentials::new("oid").and_api_key("k").can_authenticate());

        let hook = FnRenewal::new(|_oid| async { Ok("t".to_string()) });
        assert!(Credentials::with_renewal("oid", Arc::new(hook)).can_authenticate());
    }

    #[tokio::test]
    async fn fn_renewal_receives_org_id() {
        let hook = FnRenewal::new(|oid: String| async move { Ok(format!("token-for-{oid}")) });
        let token = hook.renew("ORG1").await.unwrap();
        assert_eq!(token, "token-for-ORG1");
    }
}
