//! Authenticator contract
//!
//! Runs once per `initialize`. The resulting [`AuthInfo`] is stored in the
//! session metadata and handed to the router with every later request.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{McpError, McpResult};

/// What the carrier knows about the caller
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// Token from an `Authorization: Bearer` header
    pub bearer_token: Option<String>,
    /// Request headers, names lowercased
    pub headers: HashMap<String, String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
            headers: HashMap::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Identity established by an [`Authenticator`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthInfo {
    pub subject: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl AuthInfo {
    pub fn anonymous() -> Self {
        Self {
            subject: "anonymous".to_string(),
            scopes: Vec::new(),
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Fails with `McpError::Authentication` when the caller cannot be identified
    async fn authenticate(&self, credentials: &Credentials) -> McpResult<AuthInfo>;
}

/// Accepts everyone as [`AuthInfo::anonymous`]
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn authenticate(&self, _credentials: &Credentials) -> McpResult<AuthInfo> {
        Ok(AuthInfo::anonymous())
    }
}

/// Fixed table of bearer tokens
#[derive(Debug, Default, Clone)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, AuthInfo>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, info: AuthInfo) -> Self {
        self.tokens.insert(token.into(), info);
        self
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> McpResult<AuthInfo> {
        let token = credentials
            .bearer_token
            .as_deref()
            .ok_or_else(|| McpError::Authentication("missing bearer token".to_string()))?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| McpError::Authentication("invalid bearer token".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn test_static_tokens() {
        let auth = StaticTokenAuthenticator::new().with_token(
            "secret",
            AuthInfo {
                subject: "alice".into(),
                scopes: vec!["tools".into()],
            },
        );

        let info = auth.authenticate(&Credentials::bearer("secret")).await.unwrap();
        assert_eq!(info.subject, "alice");
        assert!(info.has_scope("tools"));

        let err = auth.authenticate(&Credentials::bearer("nope")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);

        let err = auth.authenticate(&Credentials::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn test_allow_all() {
        let info = AllowAll.authenticate(&Credentials::default()).await.unwrap();
        assert_eq!(info, AuthInfo::anonymous());
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut credentials = Credentials::default();
        credentials.headers.insert("x-api-key".into(), "k".into());
        assert_eq!(credentials.header("X-Api-Key"), Some("k"));
    }
}
