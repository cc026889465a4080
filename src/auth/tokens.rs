//! # Token Manager
//!
//! Two independent pools of opaque bearer tokens share one store: worker
//! tokens (issued during the subscribe handshake, short TTL) and client
//! session tokens (issued by the login endpoint, longer TTL). A token is
//! 32 random bytes encoded URL-safe; validation is lookup + not-revoked +
//! not-expired. A background sweeper removes expired records at a bounded
//! cadence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::PermissionSet;
use crate::error::DeltaError;

/// Longest interval between sweeper passes.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Token validation failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("unknown token")]
    Unknown,
    #[error("token expired")]
    Expired,
}

impl From<TokenError> for DeltaError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Unknown => DeltaError::Unauthenticated,
            TokenError::Expired => DeltaError::Expired,
        }
    }
}

/// Which pool a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPool {
    Worker,
    Client,
}

/// Stored facts about one issued token.
#[derive(Debug, Clone)]
pub struct TokenRecord {
    pub pool: TokenPool,
    /// Worker id or client id, depending on the pool.
    pub subject: String,
    pub permissions: PermissionSet,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Issues, validates, revokes, and sweeps bearer tokens.
pub struct TokenManager {
    records: RwLock<HashMap<String, TokenRecord>>,
    worker_ttl: Duration,
    client_ttl: Duration,
}

impl TokenManager {
    pub fn new(worker_ttl: Duration, client_ttl: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            worker_ttl,
            client_ttl,
        }
    }

    fn generate() -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    fn issue(&self, pool: TokenPool, subject: &str, permissions: PermissionSet) -> TokenRecord {
        let ttl = match pool {
            TokenPool::Worker => self.worker_ttl,
            TokenPool::Client => self.client_ttl,
        };
        let now = Utc::now();
        TokenRecord {
            pool,
            subject: subject.to_string(),
            permissions,
            issued_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
        }
    }

    /// Issue a worker token for a subscribed Processing Worker.
    pub fn issue_worker_token(&self, worker_id: &str) -> String {
        let record = self.issue(TokenPool::Worker, worker_id, PermissionSet::new());
        let token = Self::generate();
        self.records.write().insert(token.clone(), record);
        token
    }

    /// Issue a client session token carrying the granted permissions.
    /// Returns the token and its expiry.
    pub fn issue_client_token(
        &self,
        client_id: &str,
        permissions: PermissionSet,
    ) -> (String, DateTime<Utc>) {
        let record = self.issue(TokenPool::Client, client_id, permissions);
        let expires_at = record.expires_at;
        let token = Self::generate();
        self.records.write().insert(token.clone(), record);
        (token, expires_at)
    }

    /// Validate a token from either pool.
    pub fn validate(&self, token: &str) -> Result<TokenRecord, TokenError> {
        let records = self.records.read();
        let record = records.get(token).ok_or(TokenError::Unknown)?;
        if record.is_expired(Utc::now()) {
            return Err(TokenError::Expired);
        }
        Ok(record.clone())
    }

    /// Validate a token, additionally requiring the expected pool.
    pub fn validate_in_pool(&self, token: &str, pool: TokenPool) -> Result<TokenRecord, TokenError> {
        let record = self.validate(token)?;
        if record.pool != pool {
            return Err(TokenError::Unknown);
        }
        Ok(record)
    }

    /// Remove a token immediately.
    pub fn revoke(&self, token: &str) -> bool {
        self.records.write().remove(token).is_some()
    }

    /// Remove every expired record; returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, record| !record.is_expired(now));
        before - records.len()
    }

    /// Number of live records (expired-but-unswept included).
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn the background sweeper; runs until `cancel` fires.
    pub fn start_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self;
        let interval = manager
            .worker_ttl
            .min(manager.client_ttl)
            .checked_div(2)
            .unwrap_or(MAX_SWEEP_INTERVAL)
            .clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = manager.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "swept expired tokens");
                        }
                    }
                }
            }
        })
    }
}
