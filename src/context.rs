//! Request-scoped authentication context and MFA session state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::StoreError;

/// The user being authenticated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaUser {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub is_site_admin: bool,
}

impl MfaUser {
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            email: None,
            is_site_admin: false,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn site_admin(mut self) -> Self {
        self.is_site_admin = true;
        self
    }
}

/// Everything a single request knows about who is logging in
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user: MfaUser,
    pub session_id: String,
    pub ip: Option<IpAddr>,
    /// Path of the page being requested
    pub path: String,
    /// Set by pages that must never bounce to the MFA page
    pub prevent_redirect: bool,
}

impl AuthContext {
    pub fn new(user: MfaUser, session_id: impl Into<String>) -> Self {
        Self {
            user,
            session_id: session_id.into(),
            ip: None,
            path: "/".to_string(),
            prevent_redirect: false,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn ip_string(&self) -> Option<String> {
        self.ip.map(|ip| ip.to_string())
    }
}

/// Per-session MFA progress
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaSession {
    pub user_id: i64,
    pub authenticated: bool,
    pub authenticated_at: Option<i64>,
    /// Page to return to once MFA passes
    pub wants_url: Option<String>,
    pub redirect_referer: Option<String>,
    pub redirect_count: u32,
}

impl MfaSession {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }
}

/// Session persistence
#[async_trait]
pub trait SessionStore: Send + Sync + std::fmt::Debug {
    async fn load(&self, session_id: &str) -> Result<Option<MfaSession>, StoreError>;
    async fn save(&self, session_id: &str, session: &MfaSession) -> Result<(), StoreError>;
    async fn destroy(&self, session_id: &str) -> Result<bool, StoreError>;
    /// Log the user out everywhere
    async fn destroy_user_sessions(&self, user_id: i64) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, MfaSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<MfaSession>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned())
    }

    async fn save(&self, session_id: &str, session: &MfaSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id.to_string(), session.clone());
        Ok(())
    }

    async fn destroy(&self, session_id: &str) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions.remove(session_id).is_some())
    }

    async fn destroy_user_sessions(&self, user_id: i64) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| s.user_id != user_id);
        Ok((before - sessions.len()) as u64)
    }
}
