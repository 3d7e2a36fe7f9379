//! Async chat server module.
//!
//! TLS TCP server with support for:
//! - Challenge/response authentication (HELLO + AUTH)
//! - Token-gated registration
//! - Room membership with fan-out (JOIN/LEAVE/MSG)
//! - Directed private messages
//! - Per-connection rate limiting and auth-failure lockout

use crate::auth;
use crate::config::ServerConfig;
use crate::core::error::ChatError;
use crate::protocol::message::{self, Command, ErrorCode, Response};
use crate::registry::{TokenRegistry, UserRegistry};
use crate::resc::{AuthSession, Client, ClientState, ClientTable};
use crate::rooms::RoomManager;
use chrono::Local;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;

// ============================================================================
// SERVER LOGGING
// ============================================================================

#[derive(Clone, Copy)]
enum LogLevel {
    Info,
    Warn,
    Error,
    Auth,
    Room,
    Net,
}

impl LogLevel {
    fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Auth => "AUTH",
            LogLevel::Room => "ROOM",
            LogLevel::Net => "NET",
        }
    }
}

fn log(level: LogLevel, message: &str) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    println!("[{}] [{}] {}", timestamp, level.prefix(), message);
}

fn log_error(context: &str, error: &dyn std::fmt::Display) {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    eprintln!("[{}] [ERROR] {}: {}", timestamp, context, error);
}

// ============================================================================
// ASYNC CHAT SERVER
// ============================================================================

pub struct ChatServer {
    config: ServerConfig,
    users: UserRegistry,
    tokens: TokenRegistry,
    rooms: RoomManager,
    /// Connected clients plus the username index
    clients: Arc<RwLock<ClientTable>>,
    next_client_id: AtomicU64,
}

impl ChatServer {
    pub async fn new(config: ServerConfig) -> Result<Self, ChatError> {
        let users = UserRegistry::load(Path::new(&config.users_file)).await?;
        let tokens = TokenRegistry::load(Path::new(&config.tokens_file)).await?;
        log(
            LogLevel::Info,
            &format!(
                "Registries loaded: {} users, {} tokens",
                users.len().await,
                tokens.len().await
            ),
        );

        Ok(ChatServer {
            config,
            users,
            tokens,
            rooms: RoomManager::new(),
            clients: Arc::new(RwLock::new(ClientTable::default())),
            next_client_id: AtomicU64::new(1),
        })
    }

    /// Main entry point: load registries, bind and serve forever.
    pub async fn start(config: ServerConfig) -> Result<(), ChatError> {
        println!();
        println!("========================================");
        println!("      IronChat Server Starting");
        println!("========================================");
        println!();

        let server = Arc::new(ChatServer::new(config).await?);
        let acceptor = server.build_tls_acceptor()?;

        let address = format!("0.0.0.0:{}", server.config.port);
        let listener = TcpListener::bind(&address).await?;

        println!();
        log(LogLevel::Info, &format!("TLS server listening on {}", address));
        println!();
        println!("----------------------------------------");
        println!("  Server ready and accepting connections");
        println!("----------------------------------------");
        println!();

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if server.clients.read().await.len() >= server.config.max_connections {
                        log(
                            LogLevel::Warn,
                            &format!("Connection limit reached, rejecting {}", addr),
                        );
                        drop(stream);
                        continue;
                    }

                    let server = Arc::clone(&server);
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        let tls_stream = match acceptor.accept(stream).await {
                            Ok(tls_stream) => tls_stream,
                            Err(e) => {
                                log(
                                    LogLevel::Net,
                                    &format!("TLS handshake failed for {}: {}", addr, e),
                                );
                                return;
                            }
                        };
                        if let Err(e) =
                            server.handle_connection(tls_stream, addr.to_string()).await
                        {
                            log_error("Client session", &e);
                        }
                    });
                }
                Err(e) => {
                    log_error("Failed to accept connection", &e);
                }
            }
        }
    }

    /// Certificate material is read once at startup; missing or invalid
    /// files are fatal.
    fn build_tls_acceptor(&self) -> Result<TlsAcceptor, ChatError> {
        let cert_pem = std::fs::read(&self.config.cert_file)?;
        let key_pem = std::fs::read(&self.config.key_file)?;

        let certs: Vec<_> =
            rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;
        let key = rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or_else(|| {
            ChatError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "no private key found in key file",
            ))
        })?;

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(TlsAcceptor::from(Arc::new(tls_config)))
    }

    // ========================================================================
    // CLIENT CONNECTION HANDLER
    // ========================================================================

    /// Run one connection to completion. Generic over the stream so the
    /// session loop can be driven without TLS in tests.
    pub async fn handle_connection<S>(&self, stream: S, address: String) -> Result<(), ChatError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        log(
            LogLevel::Info,
            &format!("New connection from {} (client {})", address, id),
        );

        let (read_half, mut write_half) = tokio::io::split(stream);
        let reader = BufReader::new(read_half);
        let mut lines = reader.lines();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        {
            let mut clients = self.clients.write().await;
            clients.insert(Client::new(id, address.clone(), tx.clone()));
        }

        let write_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.flush().await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        // cleanup must run on every exit path, so handler errors break out
        // of the loop instead of returning
        let mut session_error = None;
        loop {
            let raw = match lines.next_line().await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    log(
                        LogLevel::Net,
                        &format!("Read error on {}: {}", address, e),
                    );
                    break;
                }
            };

            // the reader strips the LF; the wire line carried it
            if raw.len() + 1 > message::MAX_LINE_BYTES {
                self.send_line(&tx, &Response::error(ErrorCode::InvalidFormat, "Line too long"));
                continue;
            }
            let line = raw.strip_suffix('\r').unwrap_or(&raw);

            let allowed = {
                let mut clients = self.clients.write().await;
                match clients.get_mut(id) {
                    Some(client) => {
                        let ok = client.check_rate_limit(self.config.rate_limit);
                        if ok {
                            client.touch();
                        }
                        ok
                    }
                    None => break,
                }
            };
            if !allowed {
                self.send_line(&tx, &Response::error_code(ErrorCode::RateLimited));
                continue;
            }

            let command = message::parse(line);
            let is_quit = matches!(command, Command::Quit);
            if let Err(e) = self.dispatch(id, command, &tx).await {
                session_error = Some(e);
                break;
            }
            if is_quit && self.is_authenticated(id).await {
                break;
            }
        }

        self.disconnect(id).await;

        drop(tx);
        let _ = write_task.await;

        log(LogLevel::Info, &format!("Connection closed: {}", address));
        match session_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ========================================================================
    // COMMAND DISPATCH
    // ========================================================================

    async fn dispatch(
        &self,
        id: u64,
        command: Command,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Result<(), ChatError> {
        match command {
            Command::Hello { username } => self.handle_hello(id, &username, tx).await,
            Command::Auth { signature } => self.handle_auth(id, &signature, tx).await,
            Command::Register { username, pubkey, token } => {
                self.handle_register(&username, &pubkey, &token, tx).await
            }
            Command::Join { room } => self.handle_join(id, &room, tx).await,
            Command::Leave { room } => self.handle_leave(id, &room, tx).await,
            Command::Msg { room, body } => self.handle_msg(id, &room, &body, tx).await,
            Command::Privmsg { target, body } => {
                self.handle_privmsg(id, &target, &body, tx).await
            }
            Command::Who { room } => self.handle_who(id, &room, tx).await,
            Command::List => self.handle_list(id, tx).await,
            Command::Users => self.handle_users(id, tx).await,
            Command::Ping => {
                if self.require_authenticated(id, tx).await.is_some() {
                    self.send_line(tx, &Response::Pong);
                }
                Ok(())
            }
            Command::Quit => {
                if self.require_authenticated(id, tx).await.is_some() {
                    self.send_line(tx, &Response::ok("QUIT"));
                }
                Ok(())
            }
            Command::Unknown => {
                self.send_line(tx, &Response::error_code(ErrorCode::UnknownCommand));
                Ok(())
            }
        }
    }

    // ========================================================================
    // AUTH HANDLERS
    // ========================================================================

    async fn handle_hello(
        &self,
        id: u64,
        username: &str,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Result<(), ChatError> {
        {
            let clients = self.clients.read().await;
            let client = match clients.get(id) {
                Some(client) => client,
                None => return Ok(()),
            };
            if client.state != ClientState::Connected {
                self.send_line(
                    tx,
                    &Response::error(ErrorCode::InvalidFormat, "Already in auth process"),
                );
                return Ok(());
            }
            if clients.is_online(username) {
                log(
                    LogLevel::Auth,
                    &format!(
                        "HELLO for '{}' from {} rejected: already online",
                        username, client.address
                    ),
                );
                self.send_line(
                    tx,
                    &Response::error(ErrorCode::InvalidFormat, "User already online"),
                );
                return Ok(());
            }
        }

        if self.users.get_pubkey(username).await.is_none() {
            log(LogLevel::Auth, &format!("HELLO for unknown user '{}'", username));
            self.send_line(tx, &Response::error(ErrorCode::UserNotFound, username));
            return Ok(());
        }

        let challenge = auth::generate_challenge()?;

        let mut clients = self.clients.write().await;
        let client = match clients.get_mut(id) {
            Some(client) => client,
            None => return Ok(()),
        };
        client.username = username.to_string();
        client.state = ClientState::AuthPending;
        client.auth_session = Some(AuthSession::new(username, &challenge));
        log(
            LogLevel::Auth,
            &format!("Challenge issued to '{}' at {}", username, client.address),
        );
        self.send_line(tx, &Response::Challenge { nonce: challenge });
        Ok(())
    }

    async fn handle_auth(
        &self,
        id: u64,
        signature: &str,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Result<(), ChatError> {
        // state, lockout and expiry checks under the table lock
        let (username, challenge, address) = {
            let mut clients = self.clients.write().await;
            let client = match clients.get_mut(id) {
                Some(client) => client,
                None => return Ok(()),
            };
            if client.state != ClientState::AuthPending {
                self.send_line(
                    tx,
                    &Response::error(ErrorCode::InvalidFormat, "No auth in progress"),
                );
                return Ok(());
            }
            if client.is_locked_out() {
                log(
                    LogLevel::Auth,
                    &format!(
                        "AUTH for '{}' at {} rejected: locked out",
                        client.username, client.address
                    ),
                );
                self.send_line(tx, &Response::error_code(ErrorCode::RateLimited));
                return Ok(());
            }
            match client.auth_session.as_ref() {
                Some(session) if !session.is_expired() => (
                    session.username.clone(),
                    session.challenge.clone(),
                    client.address.clone(),
                ),
                _ => {
                    let (username, address) =
                        (client.username.clone(), client.address.clone());
                    Self::fail_auth(client);
                    log(
                        LogLevel::Auth,
                        &format!(
                            "AUTH failed for '{}' at {}: challenge expired",
                            username, address
                        ),
                    );
                    self.send_line(tx, &Response::error_code(ErrorCode::AuthFailed));
                    return Ok(());
                }
            }
        };

        // key lookup and digest check outside the table lock; a missing
        // key fails exactly like a bad signature
        let verified = match self.users.get_pubkey(&username).await {
            Some(pubkey) => auth::verify_signature(&pubkey, &challenge, signature),
            None => false,
        };

        let mut clients = self.clients.write().await;

        if verified && clients.is_online(&username) {
            // lost the race against another login for this username
            if let Some(client) = clients.get_mut(id) {
                client.state = ClientState::Connected;
                client.username.clear();
                client.auth_session = None;
            }
            log(
                LogLevel::Auth,
                &format!(
                    "AUTH for '{}' at {} rejected: already online",
                    username, address
                ),
            );
            self.send_line(
                tx,
                &Response::error(ErrorCode::InvalidFormat, "User already online"),
            );
            return Ok(());
        }

        {
            let client = match clients.get_mut(id) {
                Some(client) => client,
                None => return Ok(()),
            };
            if !verified {
                Self::fail_auth(client);
                log(
                    LogLevel::Auth,
                    &format!("AUTH failed for '{}' at {}: bad signature", username, address),
                );
                self.send_line(tx, &Response::error_code(ErrorCode::AuthFailed));
                return Ok(());
            }
            client.state = ClientState::Authenticated;
            client.auth_session = None;
            client.clear_auth_failures();
        }
        clients.bind_username(&username, id);
        log(
            LogLevel::Auth,
            &format!("User '{}' authenticated from {}", username, address),
        );

        let online = Response::Online { username: username.clone() }.format();
        for peer in clients.authenticated() {
            if peer.id != id {
                let _ = peer.sender.send(online.clone());
            }
        }
        self.send_line(tx, &Response::Welcome { username });
        Ok(())
    }

    /// Reset a failed authentication attempt back to Connected.
    fn fail_auth(client: &mut Client) {
        client.state = ClientState::Connected;
        client.username.clear();
        client.auth_session = None;
        client.record_auth_failure();
    }

    async fn handle_register(
        &self,
        username: &str,
        pubkey: &str,
        token: &str,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Result<(), ChatError> {
        if self.users.contains(username).await {
            self.send_line(tx, &Response::error(ErrorCode::UserExists, username));
            return Ok(());
        }
        if !self.tokens.validate(token).await? {
            log(
                LogLevel::Auth,
                &format!("REGISTER for '{}' with invalid token", username),
            );
            self.send_line(tx, &Response::error_code(ErrorCode::InvalidToken));
            return Ok(());
        }
        if !self.users.register(username, pubkey).await? {
            // raced another registration for the same name
            self.send_line(tx, &Response::error(ErrorCode::UserExists, username));
            return Ok(());
        }
        log(LogLevel::Auth, &format!("New user registered: '{}'", username));
        self.send_line(tx, &Response::ok(format!("REGISTER {}", username)));
        Ok(())
    }

    // ========================================================================
    // ROOM HANDLERS
    // ========================================================================

    async fn handle_join(
        &self,
        id: u64,
        room: &str,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Result<(), ChatError> {
        let username = match self.require_authenticated(id, tx).await {
            Some(username) => username,
            None => return Ok(()),
        };
        if !self.rooms.join(room, &username).await {
            self.send_line(tx, &Response::error(ErrorCode::AlreadyInRoom, room));
            return Ok(());
        }
        log(LogLevel::Room, &format!("'{}' joined {}", username, room));
        let notice = Response::Joined {
            room: room.to_string(),
            username: username.clone(),
        }
        .format();
        self.broadcast_room(room, &notice, &username).await;
        self.send_line(tx, &Response::ok(format!("JOIN {}", room)));
        Ok(())
    }

    async fn handle_leave(
        &self,
        id: u64,
        room: &str,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Result<(), ChatError> {
        let username = match self.require_authenticated(id, tx).await {
            Some(username) => username,
            None => return Ok(()),
        };
        if !self.rooms.exists(room).await {
            self.send_line(tx, &Response::error(ErrorCode::RoomNotFound, room));
            return Ok(());
        }
        if !self.rooms.is_in(room, &username).await {
            self.send_line(tx, &Response::error(ErrorCode::NotInRoom, room));
            return Ok(());
        }
        // the departing user is still a member here, so peers hear the
        // departure before the membership changes
        let notice = Response::Left {
            room: room.to_string(),
            username: username.clone(),
        }
        .format();
        self.broadcast_room(room, &notice, &username).await;
        self.rooms.leave(room, &username).await;
        log(LogLevel::Room, &format!("'{}' left {}", username, room));
        self.send_line(tx, &Response::ok(format!("LEAVE {}", room)));
        Ok(())
    }

    async fn handle_who(
        &self,
        id: u64,
        room: &str,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Result<(), ChatError> {
        if self.require_authenticated(id, tx).await.is_none() {
            return Ok(());
        }
        if !self.rooms.exists(room).await {
            self.send_line(tx, &Response::error(ErrorCode::RoomNotFound, room));
            return Ok(());
        }
        let users = self.rooms.members(room).await;
        self.send_line(tx, &Response::WhoList { room: room.to_string(), users });
        Ok(())
    }

    async fn handle_list(
        &self,
        id: u64,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Result<(), ChatError> {
        if self.require_authenticated(id, tx).await.is_none() {
            return Ok(());
        }
        let rooms = self.rooms.list().await;
        self.send_line(tx, &Response::RoomList { rooms });
        Ok(())
    }

    async fn handle_users(
        &self,
        id: u64,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Result<(), ChatError> {
        if self.require_authenticated(id, tx).await.is_none() {
            return Ok(());
        }
        let clients = self.clients.read().await;
        let mut users: Vec<String> =
            clients.authenticated().map(|c| c.username.clone()).collect();
        users.sort();
        self.send_line(tx, &Response::UserList { users });
        Ok(())
    }

    // ========================================================================
    // MESSAGING HANDLERS
    // ========================================================================

    async fn handle_msg(
        &self,
        id: u64,
        room: &str,
        body: &str,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Result<(), ChatError> {
        let username = match self.require_authenticated(id, tx).await {
            Some(username) => username,
            None => return Ok(()),
        };
        if !self.rooms.exists(room).await {
            self.send_line(tx, &Response::error(ErrorCode::RoomNotFound, room));
            return Ok(());
        }
        if !self.rooms.is_in(room, &username).await {
            self.send_line(tx, &Response::error(ErrorCode::NotInRoom, room));
            return Ok(());
        }
        let line = Response::Room {
            room: room.to_string(),
            sender: username.clone(),
            body: body.to_string(),
        }
        .format();
        self.broadcast_room(room, &line, &username).await;
        self.send_line(tx, &Response::ok("MSG"));
        Ok(())
    }

    async fn handle_privmsg(
        &self,
        id: u64,
        target: &str,
        body: &str,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Result<(), ChatError> {
        let username = match self.require_authenticated(id, tx).await {
            Some(username) => username,
            None => return Ok(()),
        };
        let clients = self.clients.read().await;
        match clients.sender_for(target) {
            Some(peer) => {
                let line = Response::Priv {
                    sender: username,
                    body: body.to_string(),
                }
                .format();
                let _ = peer.send(line);
                self.send_line(tx, &Response::ok("PRIVMSG"));
            }
            None => {
                self.send_line(tx, &Response::error(ErrorCode::UserNotFound, target));
            }
        }
        Ok(())
    }

    // ========================================================================
    // DISCONNECT CLEANUP
    // ========================================================================

    /// Runs exactly once per connection, from its own task. An
    /// authenticated client is swept out of every room (peers hear LEFT
    /// per room, then QUIT); others just vanish from the table.
    async fn disconnect(&self, id: u64) {
        let client = self.clients.write().await.remove(id);
        let client = match client {
            Some(client) => client,
            None => return,
        };
        if client.state != ClientState::Authenticated {
            return;
        }
        let username = client.username;

        let left_rooms = self.rooms.remove_user_from_all(&username).await;
        for room in &left_rooms {
            let notice = Response::Left {
                room: room.clone(),
                username: username.clone(),
            }
            .format();
            self.broadcast_room(room, &notice, &username).await;
        }

        let quit = Response::Quit { username: username.clone() }.format();
        self.broadcast_all(&quit, id).await;
        log(
            LogLevel::Auth,
            &format!("User '{}' disconnected ({} rooms swept)", username, left_rooms.len()),
        );
    }

    // ========================================================================
    // FAN-OUT
    // ========================================================================

    fn send_line(&self, tx: &mpsc::UnboundedSender<String>, response: &Response) {
        // a dead peer is handled by its own connection task
        let _ = tx.send(response.format());
    }

    /// Deliver a line to every member of a room except one user.
    /// Delivery is best effort and never fails the sender's command.
    async fn broadcast_room(&self, room: &str, line: &str, except: &str) {
        let members = self.rooms.members_except(room, except).await;
        let clients = self.clients.read().await;
        for member in members {
            if let Some(sender) = clients.sender_for(&member) {
                let _ = sender.send(line.to_string());
            }
        }
    }

    /// Deliver a line to every authenticated client except one.
    async fn broadcast_all(&self, line: &str, except: u64) {
        let clients = self.clients.read().await;
        for peer in clients.authenticated() {
            if peer.id != except {
                let _ = peer.sender.send(line.to_string());
            }
        }
    }

    // ========================================================================
    // UTILITY METHODS
    // ========================================================================

    /// Username of the authenticated client, or None after replying with
    /// NOT_AUTHENTICATED.
    async fn require_authenticated(
        &self,
        id: u64,
        tx: &mpsc::UnboundedSender<String>,
    ) -> Option<String> {
        let clients = self.clients.read().await;
        match clients.get(id) {
            Some(client) if client.state == ClientState::Authenticated => {
                Some(client.username.clone())
            }
            _ => {
                self.send_line(tx, &Response::error_code(ErrorCode::NotAuthenticated));
                None
            }
        }
    }

    async fn is_authenticated(&self, id: u64) -> bool {
        matches!(
            self.clients.read().await.get(id),
            Some(client) if client.state == ClientState::Authenticated
        )
    }
}
