//! Credential/session collaborator
//!
//! The login workflow lives outside the host. The core only asks two things
//! of it through [`SessionProvider`]: is this connection logged in, and which
//! stable account identity does it carry. Ownership checks for replication
//! visibility are built on that identity.

use dashmap::DashMap;
use rand::RngCore;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::net::connection::ConnectionId;

/// Source of login state and account identity for connections
pub trait SessionProvider: Send + Sync {
    fn is_logged_in(&self, connection: ConnectionId) -> bool;

    /// Stable account identity for a logged-in connection
    fn identity(&self, connection: ConnectionId) -> Option<Uuid>;
}

/// Treats every connection as logged in under its own connection id
#[derive(Debug, Default, Clone, Copy)]
pub struct ConnectionIdentity;

impl SessionProvider for ConnectionIdentity {
    fn is_logged_in(&self, _connection: ConnectionId) -> bool {
        true
    }

    fn identity(&self, connection: ConnectionId) -> Option<Uuid> {
        Some(connection)
    }
}

/// Session token handed to a client after login
/// Uses CSPRNG for cryptographic security
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken([u8; 32]);

impl SessionToken {
    /// Generate a new cryptographically secure session token
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = slice.try_into().ok()?;
        Some(Self(bytes))
    }
}

/// Session data for a logged-in connection
#[derive(Debug, Clone)]
pub struct Session {
    pub account: Uuid,
    pub token: SessionToken,
    pub created_at: Instant,
    pub last_activity: Instant,
}

impl Session {
    pub fn new(account: Uuid) -> Self {
        let now = Instant::now();
        Self {
            account,
            token: SessionToken::generate(),
            created_at: now,
            last_activity: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }
}

/// In-memory session table keyed by connection
pub struct SessionManager {
    sessions: DashMap<ConnectionId, Session>,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            timeout,
        }
    }

    /// Bind an account to a connection, replacing any previous session
    pub fn login(&self, connection: ConnectionId, account: Uuid) -> SessionToken {
        let session = Session::new(account);
        let token = session.token.clone();
        self.sessions.insert(connection, session);
        token
    }

    pub fn logout(&self, connection: ConnectionId) -> Option<Session> {
        self.sessions.remove(&connection).map(|(_, session)| session)
    }

    /// Check a presented token against the connection's session
    pub fn validate(&self, connection: ConnectionId, token: &SessionToken) -> bool {
        self.sessions
            .get(&connection)
            .map(|session| &session.token == token && !session.is_expired(self.timeout))
            .unwrap_or(false)
    }

    pub fn touch(&self, connection: ConnectionId) -> bool {
        match self.sessions.get_mut(&connection) {
            Some(mut session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Clean up expired sessions
    pub fn cleanup_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(self.timeout));
        before - self.sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl SessionProvider for SessionManager {
    fn is_logged_in(&self, connection: ConnectionId) -> bool {
        self.sessions
            .get(&connection)
            .map(|session| !session.is_expired(self.timeout))
            .unwrap_or(false)
    }

    fn identity(&self, connection: ConnectionId) -> Option<Uuid> {
        self.sessions
            .get(&connection)
            .filter(|session| !session.is_expired(self.timeout))
            .map(|session| session.account)
    }
}
