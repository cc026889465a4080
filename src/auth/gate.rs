//! # Authentication Gate
//!
//! Resolves every `Authorization: Bearer X` credential to at most one
//! principal, in fixed order: admin key, then API key, then session token.
//! The order matters — a string that happens to collide across tiers is
//! always interpreted as the highest-privilege tier that accepts it.

use std::sync::Arc;

use super::api_keys::{ApiKeyManager, KeyRefusal};
use super::tokens::{TokenError, TokenManager, TokenPool};
use super::{all_permissions, sha256_hex, Principal};
use crate::error::{DeltaError, DeltaResult};

/// Bearer-credential resolver shared by the REST surface.
pub struct AuthGate {
    admin_key_hash: Option<String>,
    api_keys: Arc<ApiKeyManager>,
    tokens: Arc<TokenManager>,
}

impl AuthGate {
    /// `admin_key` is the raw operator-supplied string; only its SHA-256
    /// is retained.
    pub fn new(
        admin_key: Option<&str>,
        api_keys: Arc<ApiKeyManager>,
        tokens: Arc<TokenManager>,
    ) -> Self {
        Self {
            admin_key_hash: admin_key.map(sha256_hex),
            api_keys,
            tokens,
        }
    }

    /// Whether an admin key was configured at startup. Dev-mode login is
    /// only available when it was not.
    pub fn has_admin_key(&self) -> bool {
        self.admin_key_hash.is_some()
    }

    /// Resolve a bearer credential to a principal.
    pub fn resolve(&self, credential: &str) -> DeltaResult<Principal> {
        if credential.is_empty() {
            return Err(DeltaError::Unauthenticated);
        }

        // Tier 1: admin key.
        if let Some(hash) = &self.admin_key_hash {
            if sha256_hex(credential) == *hash {
                return Ok(Principal::admin());
            }
        }

        // Tier 2: API key.
        match self.api_keys.validate_key(credential) {
            Ok(record) => {
                return Ok(Principal {
                    client_id: format!("key:{}", record.name),
                    permissions: record.permissions,
                    is_admin: false,
                })
            }
            Err(KeyRefusal::Expired) => return Err(DeltaError::Expired),
            Err(KeyRefusal::Disabled | KeyRefusal::Unknown) => {}
        }

        // Tier 3: session token.
        match self.tokens.validate_in_pool(credential, TokenPool::Client) {
            Ok(record) => {
                let is_admin = record.permissions.contains(&super::Permission::Admin);
                Ok(Principal {
                    client_id: record.subject,
                    permissions: record.permissions,
                    is_admin,
                })
            }
            Err(TokenError::Expired) => Err(DeltaError::Expired),
            Err(TokenError::Unknown) => Err(DeltaError::Unauthenticated),
        }
    }

    /// Authenticate a login `{key}` body: admin key or API key only.
    /// Session tokens cannot mint further sessions.
    pub fn authenticate_key(&self, key: &str) -> DeltaResult<Principal> {
        if let Some(hash) = &self.admin_key_hash {
            if sha256_hex(key) == *hash {
                return Ok(Principal {
                    client_id: "admin".to_string(),
                    permissions: all_permissions(),
                    is_admin: true,
                });
            }
        }
        match self.api_keys.validate_key(key) {
            Ok(record) => Ok(Principal {
                client_id: format!("key:{}", record.name),
                permissions: record.permissions,
                is_admin: false,
            }),
            Err(KeyRefusal::Expired) => Err(DeltaError::Expired),
            Err(_) => Err(DeltaError::Unauthenticated),
        }
    }
}
