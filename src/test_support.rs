//! Shared fixtures for unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::Result;
use crate::auth::{AuthTokenProvider, SecretString};
use crate::error::Error;
use crate::ws::ConnectionManager;
use crate::ws::config::Config;
use crate::ws::message::{WebSocketMessage, parse_frame};

/// Provider with a fixed access token whose refresh always fails.
pub(crate) struct StaticToken;

#[async_trait]
impl AuthTokenProvider for StaticToken {
    fn access_token(&self) -> Option<SecretString> {
        Some(SecretString::from("test-token".to_owned()))
    }

    async fn refresh(&self) -> Result<SecretString> {
        Err(Error::auth_expired("static token cannot be refreshed"))
    }

    fn clear(&self) {}
}

/// A manager that is never connected, for exercising dispatch and channels.
pub(crate) fn connection() -> ConnectionManager {
    ConnectionManager::new(Config::default(), Arc::new(StaticToken)).unwrap()
}

/// Parse `value` the way an inbound text frame would be.
pub(crate) fn frame(value: Value) -> WebSocketMessage {
    parse_frame(&value.to_string()).unwrap()
}
