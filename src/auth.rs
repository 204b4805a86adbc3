//! Session and token collaborators the connection depends on.
//!
//! The connection never talks to cookies or the REST API directly: it reads the
//! current access token and performs refreshes through [`AuthTokenProvider`].
//! [`HttpTokenProvider`] is the production implementation, backed by a shared
//! [`TokenStore`] that REST code can read from as well.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use reqwest::Client as ReqwestClient;
/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::Result;
use crate::error::Error;

const REFRESH_PATH: &str = "auth/refresh/";

/// Who the realtime connection is opened for.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    pub user_id: Option<i64>,
    pub is_authenticated: bool,
}

impl SessionState {
    #[must_use]
    pub const fn authenticated(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            is_authenticated: true,
        }
    }

    #[must_use]
    pub const fn anonymous() -> Self {
        Self {
            user_id: None,
            is_authenticated: false,
        }
    }

    /// The user to connect as, when the session allows connecting at all.
    #[must_use]
    pub const fn connectable_user(&self) -> Option<i64> {
        if self.is_authenticated {
            self.user_id
        } else {
            None
        }
    }
}

/// Source of access tokens for the realtime connection.
#[async_trait]
pub trait AuthTokenProvider: Send + Sync + 'static {
    /// The access token to present on the next connection attempt.
    fn access_token(&self) -> Option<SecretString>;

    /// Exchange the refresh token for a new access token and persist it, so that
    /// the next [`Self::access_token`] call returns it.
    async fn refresh(&self) -> Result<SecretString>;

    /// Forget all stored tokens. Called when a refresh fails.
    fn clear(&self);
}

#[derive(Debug, Default)]
struct Tokens {
    access: Option<SecretString>,
    refresh: Option<SecretString>,
}

/// Shared access/refresh token store.
///
/// Cloning is cheap and every clone observes the same tokens.
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    tokens: Arc<RwLock<Tokens>>,
}

impl TokenStore {
    #[must_use]
    pub fn new(access: String, refresh: String) -> Self {
        Self {
            tokens: Arc::new(RwLock::new(Tokens {
                access: Some(SecretString::from(access)),
                refresh: Some(SecretString::from(refresh)),
            })),
        }
    }

    // A poisoned lock is recovered because Tokens has no inconsistent intermediate state.

    #[must_use]
    pub fn access_token(&self) -> Option<SecretString> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .access
            .clone()
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<SecretString> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .refresh
            .clone()
    }

    pub fn set_access_token(&self, access: SecretString) {
        self.tokens
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .access = Some(access);
    }

    pub fn clear(&self) {
        *self.tokens.write().unwrap_or_else(PoisonError::into_inner) = Tokens::default();
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access: String,
}

/// [`AuthTokenProvider`] that refreshes through `POST <api-base>/auth/refresh/`.
#[derive(Debug, Clone)]
pub struct HttpTokenProvider {
    client: ReqwestClient,
    refresh_url: Url,
    store: TokenStore,
}

impl HttpTokenProvider {
    /// `api_base` is the REST API root, e.g. `https://example.com/api/`.
    pub fn new(api_base: &str, store: TokenStore) -> Result<Self> {
        let mut base = Url::parse(api_base)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            client: ReqwestClient::new(),
            refresh_url: base.join(REFRESH_PATH)?,
            store,
        })
    }

    #[must_use]
    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    #[must_use]
    pub fn refresh_url(&self) -> &Url {
        &self.refresh_url
    }
}

#[async_trait]
impl AuthTokenProvider for HttpTokenProvider {
    fn access_token(&self) -> Option<SecretString> {
        self.store.access_token()
    }

    #[cfg_attr(
        feature = "tracing",
        tracing::instrument(level = "debug", skip(self), err)
    )]
    async fn refresh(&self) -> Result<SecretString> {
        let refresh = self
            .store
            .refresh_token()
            .ok_or_else(|| Error::auth_expired("no refresh token stored"))?;

        let response = self
            .client
            .post(self.refresh_url.clone())
            .json(&RefreshRequest {
                refresh: refresh.expose_secret(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::status(
                status,
                self.refresh_url.path().to_owned(),
                message,
            ));
        }

        let RefreshResponse { access } = response.json().await?;
        let access = SecretString::from(access);
        self.store.set_access_token(access.clone());

        Ok(access)
    }

    fn clear(&self) {
        self.store.clear();
    }
}
