//! Identity provider seam used by sessions and the HTTP surface.
use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{AppError, Result};

/// Who a session acts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Principal {
    User { subject: String },
    Demo,
}

impl Principal {
    #[must_use]
    pub fn mode(&self) -> &'static str {
        match self {
            Principal::User { .. } => "user",
            Principal::Demo => "demo",
        }
    }
}

pub trait IdentityProvider: Send + Sync {
    /// Resolves a bearer token, or fails with `Unauthenticated`.
    fn authenticate(&self, token: &str) -> Result<Principal>;
}

/// Fixed token table from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    tokens: BTreeMap<String, String>,
}

impl StaticTokenProvider {
    pub fn new(tokens: BTreeMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl IdentityProvider for StaticTokenProvider {
    fn authenticate(&self, token: &str) -> Result<Principal> {
        self.tokens
            .get(token.trim())
            .map(|subject| Principal::User {
                subject: subject.clone(),
            })
            .ok_or(AppError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_tokens() {
        let provider = StaticTokenProvider::new(BTreeMap::from([(
            "s3cret".to_string(),
            "alice".to_string(),
        )]));
        assert_eq!(
            provider.authenticate("s3cret").unwrap(),
            Principal::User {
                subject: "alice".into()
            }
        );
        assert!(matches!(
            provider.authenticate("wrong"),
            Err(AppError::Unauthenticated)
        ));
        assert!(StaticTokenProvider::default().authenticate("").is_err());
    }

    #[test]
    fn test_principal_serialization() {
        let json = serde_json::to_value(Principal::Demo).unwrap();
        assert_eq!(json, serde_json::json!({"mode": "demo"}));
    }
}
