//! # Authentication & Authorization
//!
//! Three bearer-credential tiers, resolved in fixed priority order by the
//! [`gate::AuthGate`]:
//!
//! 1. **Admin key** — operator-supplied at startup, held only as a SHA-256
//!    hash; grants every permission.
//! 2. **API keys** — persistent RBAC credentials (`dk_…`), hashed at rest.
//! 3. **Session tokens** — short-lived credentials minted by the login
//!    endpoint and tracked by the [`tokens::TokenManager`].
//!
//! A resolved request carries a [`Principal`] with its effective
//! permission set; handlers enforce per-endpoint requirements against it.

pub mod api_keys;
pub mod gate;
pub mod tokens;

pub use api_keys::{ApiKeyManager, ApiKeyRecord, ApiKeySummary};
pub use gate::AuthGate;
pub use tokens::{TokenManager, TokenPool, TokenRecord};

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Grantable permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

/// Set of granted permissions; `Admin` implicitly grants `Read` and
/// `Write`.
pub type PermissionSet = HashSet<Permission>;

/// Whether `granted` satisfies `required`.
pub fn allows(granted: &PermissionSet, required: Permission) -> bool {
    if granted.contains(&required) {
        return true;
    }
    matches!(required, Permission::Read | Permission::Write) && granted.contains(&Permission::Admin)
}

/// The full permission set.
pub fn all_permissions() -> PermissionSet {
    [Permission::Read, Permission::Write, Permission::Admin]
        .into_iter()
        .collect()
}

/// Read + write, as granted to dev-mode sessions.
pub fn read_write() -> PermissionSet {
    [Permission::Read, Permission::Write].into_iter().collect()
}

/// Authenticated identity attached to a request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub client_id: String,
    pub permissions: PermissionSet,
    pub is_admin: bool,
}

impl Principal {
    pub fn admin() -> Self {
        Self {
            client_id: "admin".to_string(),
            permissions: all_permissions(),
            is_admin: true,
        }
    }

    pub fn allows(&self, required: Permission) -> bool {
        allows(&self.permissions, required)
    }
}

/// Hex-encoded SHA-256, used for admin-key and API-key digests.
pub fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}
