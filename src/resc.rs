//! Resource module for the chat server.
//!
//! Core data structures for the session orchestrator:
//! - Per-connection client state machine and counters
//! - Pending authentication sessions (challenge + TTL)
//! - The client table with its username index
//! - In-memory rooms

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::auth::CHALLENGE_TTL;

/// Sliding rate-limit window.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);
/// Failed AUTH attempts before a connection is locked out.
pub const MAX_AUTH_FAILURES: u32 = 5;
/// How long a locked-out connection stays locked after its last failure.
pub const LOCKOUT_WINDOW: Duration = Duration::from_secs(5 * 60);

// ============================================================================
// CONNECTION STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Accepted, nothing sent yet.
    Connected,
    /// A valid HELLO was received and a challenge is outstanding.
    AuthPending,
    /// HELLO + AUTH completed; chat commands are allowed.
    Authenticated,
}

/// One outstanding challenge. Consumed by exactly one AUTH; expired
/// challenges always fail.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub username: String,
    pub challenge: String,
    pub issued_at: Instant,
}

impl AuthSession {
    pub fn new(username: &str, challenge: &str) -> Self {
        AuthSession {
            username: username.to_string(),
            challenge: challenge.to_string(),
            issued_at: Instant::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.issued_at.elapsed() > CHALLENGE_TTL
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// A connected client. The username is non-empty exactly when the state
/// has left Connected.
pub struct Client {
    pub id: u64,
    pub state: ClientState,
    pub username: String,
    pub address: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub auth_session: Option<AuthSession>,
    /// Outbound line queue drained by the connection's writer task.
    pub sender: mpsc::UnboundedSender<String>,
    pub window_start: Instant,
    pub window_count: u32,
    pub auth_failures: u32,
    pub last_failure: Option<Instant>,
}

impl Client {
    pub fn new(id: u64, address: String, sender: mpsc::UnboundedSender<String>) -> Self {
        let now = Utc::now();
        Client {
            id,
            state: ClientState::Connected,
            username: String::new(),
            address,
            connected_at: now,
            last_activity: now,
            auth_session: None,
            sender,
            window_start: Instant::now(),
            window_count: 0,
            auth_failures: 0,
            last_failure: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Sliding one-second window: a stale window restarts at count 1,
    /// otherwise the count grows and must stay within the limit.
    pub fn check_rate_limit(&mut self, limit: u32) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) > RATE_WINDOW {
            self.window_start = now;
            self.window_count = 1;
            true
        } else {
            self.window_count += 1;
            self.window_count <= limit
        }
    }

    pub fn record_auth_failure(&mut self) {
        self.auth_failures += 1;
        self.last_failure = Some(Instant::now());
    }

    pub fn clear_auth_failures(&mut self) {
        self.auth_failures = 0;
        self.last_failure = None;
    }

    /// Locked while the failure count has reached the cap and the last
    /// failure is still inside the lockout window. A window that has
    /// passed resets the counter.
    pub fn is_locked_out(&mut self) -> bool {
        if self.auth_failures < MAX_AUTH_FAILURES {
            return false;
        }
        match self.last_failure {
            Some(at) if at.elapsed() > LOCKOUT_WINDOW => {
                self.clear_auth_failures();
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

// ============================================================================
// CLIENT TABLE
// ============================================================================

/// All live connections, keyed by the stable id issued at accept, plus
/// the username index for authenticated clients. A username maps to an id
/// exactly while that client is Authenticated.
#[derive(Default)]
pub struct ClientTable {
    clients: HashMap<u64, Client>,
    by_username: HashMap<String, u64>,
}

impl ClientTable {
    pub fn insert(&mut self, client: Client) {
        self.clients.insert(client.id, client);
    }

    pub fn get(&self, id: u64) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// True while some client is Authenticated under this username.
    pub fn is_online(&self, username: &str) -> bool {
        self.by_username.contains_key(username)
    }

    pub fn id_of(&self, username: &str) -> Option<u64> {
        self.by_username.get(username).copied()
    }

    pub fn bind_username(&mut self, username: &str, id: u64) {
        self.by_username.insert(username.to_string(), id);
    }

    pub fn sender_for(&self, username: &str) -> Option<&mpsc::UnboundedSender<String>> {
        let id = self.by_username.get(username)?;
        Some(&self.clients.get(id)?.sender)
    }

    /// Remove a client, releasing its username binding if it owns one.
    pub fn remove(&mut self, id: u64) -> Option<Client> {
        let client = self.clients.remove(&id)?;
        if self.by_username.get(&client.username) == Some(&id) {
            self.by_username.remove(&client.username);
        }
        Some(client)
    }

    pub fn authenticated(&self) -> impl Iterator<Item = &Client> {
        self.clients
            .values()
            .filter(|c| c.state == ClientState::Authenticated)
    }
}

// ============================================================================
// ROOMS
// ============================================================================

/// A named multicast group. A room with zero members does not exist; the
/// manager deletes it on the last leave.
#[derive(Debug, Clone)]
pub struct Room {
    pub name: String,
    pub creator: String,
    pub members: HashSet<String>,
    pub topic: Option<String>,
}

impl Room {
    pub fn new(name: &str, creator: &str) -> Self {
        Room {
            name: name.to_string(),
            creator: creator.to_string(),
            members: HashSet::new(),
            topic: None,
        }
    }
}
