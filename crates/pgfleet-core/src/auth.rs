// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent authentication.

use std::collections::HashMap;

use crate::error::{CoreError, Result};

/// Who a registration stream belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Instance the token is scoped to, or `*` for any instance.
    pub instance_scope: String,
}

/// Resolves a bearer token presented during registration.
pub trait AgentAuthenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<AgentIdentity>;
}

/// Token table loaded from configuration, `token=instance` pairs.
/// An instance of `*` makes the token valid for any instance name.
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    /// Parse `tok1=pg-1,tok2=*` into a token table.
    pub fn from_spec(spec: &str) -> Result<Self> {
        let mut tokens = HashMap::new();
        for pair in spec.split(',').filter(|p| !p.trim().is_empty()) {
            let Some((token, instance)) = pair.split_once('=') else {
                return Err(CoreError::ValidationError {
                    field: "agent_tokens".to_string(),
                    message: format!("expected token=instance, got '{}'", pair),
                });
            };
            let token = token.trim();
            let instance = instance.trim();
            if token.is_empty() || instance.is_empty() {
                return Err(CoreError::ValidationError {
                    field: "agent_tokens".to_string(),
                    message: "empty token or instance name".to_string(),
                });
            }
            tokens.insert(token.to_string(), instance.to_string());
        }
        Ok(Self { tokens })
    }

    /// Whether the identity may act for `instance`.
    pub fn authorize(identity: &AgentIdentity, instance: &str) -> Result<()> {
        if identity.instance_scope == "*" || identity.instance_scope == instance {
            return Ok(());
        }
        Err(CoreError::PermissionDenied {
            subject: identity.instance_scope.clone(),
            resource: format!("instance '{}'", instance),
        })
    }
}

impl AgentAuthenticator for StaticTokenAuthenticator {
    fn authenticate(&self, token: &str) -> Result<AgentIdentity> {
        match self.tokens.get(token) {
            Some(scope) => Ok(AgentIdentity {
                instance_scope: scope.clone(),
            }),
            None => Err(CoreError::Unauthenticated {
                reason: "unknown agent token".to_string(),
            }),
        }
    }
}
