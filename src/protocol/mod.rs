// Protocol layer for the Infinichat client
// This file holds the session client itself: the login state machine, the
// entity caches, and the dispatch of unsolicited server messages. Outbound
// command groups live in the submodules.

use log::{debug, error, info, warn};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, oneshot};

pub mod chat;
pub mod framing;
pub mod presence;
pub mod roster;

pub use framing::{FrameTransport, InboundMessage, Packet, ReplyCallback, ReplyResult, TransportEvent};

use crate::error::{ClientError, Result};
use crate::models::{Group, Reply, ResultCode, User, UserDescription, UserRelation};

/// Where the session currently stands. Session-scoped commands are only
/// valid in `LoggedIn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connected,
    LoggedIn,
}

/// Events raised by the session client. Fired to zero or more subscribers;
/// entity values are snapshots taken at notification time.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    UserDetails { added: Vec<User>, changed: Vec<User> },
    GroupDetails { added: Vec<Group>, changed: Vec<Group> },
    GroupMemberAdded { group: String, user: User },
    GroupMemberRemoved { group: String, user: User },
    UserChat { message: crate::models::ChatMessage },
    GroupChat { group: Group, message: crate::models::ChatMessage },
    UserTyping { user: User, starting: bool },
    GroupTyping { group: String, user: User, starting: bool },
    StreamError { error: Arc<io::Error> },
    /// The session-scoped caches were torn down (logout, disconnect, or a
    /// fatal stream error). Collaborators drop their derived state on this.
    SessionEnded,
}

struct SessionState {
    /// Bumped on every attach and teardown so a replaced transport's
    /// buffered events cannot touch a newer session.
    epoch: u64,
    phase: SessionPhase,
    me: Option<User>,
    users: HashMap<String, User>,
    groups: HashMap<String, Group>,
    friends: BTreeSet<String>,
}

struct ClientInner {
    transport: Mutex<Option<Arc<FrameTransport>>>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<ClientEvent>,
}

/// The session client. Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

impl ChatClient {
    pub fn new() -> ChatClient {
        let (events, _) = broadcast::channel(256);
        ChatClient {
            inner: Arc::new(ClientInner {
                transport: Mutex::new(None),
                state: Mutex::new(SessionState {
                    epoch: 0,
                    phase: SessionPhase::Disconnected,
                    me: None,
                    users: HashMap::new(),
                    groups: HashMap::new(),
                    friends: BTreeSet::new(),
                }),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Attaches a fresh transport over the given stream and starts the
    /// dispatch loop. An already-attached transport is logged and replaced.
    pub fn connect<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if self.inner.transport.lock().unwrap().is_some() {
            error!("connect called with a transport already attached; replacing it");
            self.teardown();
        }

        let transport = Arc::new(FrameTransport::new(stream));
        let events = transport.subscribe();
        *self.inner.transport.lock().unwrap() = Some(transport);

        let epoch = {
            let mut state = self.inner.state.lock().unwrap();
            state.epoch += 1;
            state.phase = SessionPhase::Connected;
            state.epoch
        };
        tokio::spawn(dispatch_loop(self.clone(), events, epoch));
        Ok(())
    }

    /// Authenticates against the attached transport. The password never
    /// leaves the client in the clear; a one-way hex digest is sent instead.
    /// On success the local "me" user is built from the server's description
    /// and a roster-changed event fires for self.
    pub async fn log_in(&self, username: &str, password: &str) -> Result<Reply> {
        let transport = self.transport()?;
        match self.phase() {
            SessionPhase::Connected => {}
            SessionPhase::Disconnected => return Err(ClientError::NotConnected),
            SessionPhase::LoggedIn => {
                warn!("log_in called while already logged in");
            }
        }

        let hashed = hex::encode(Sha256::digest(password.as_bytes()));
        let mut packet = transport.create_message("login");
        packet.insert("username".to_string(), json!(username));
        packet.insert("password".to_string(), json!(hashed));
        packet.insert("initial_status".to_string(), json!("Available"));

        info!("trying to log in as {}", username);
        let reply = self.request(&transport, packet).await?;
        if !reply.success() {
            info!("login failed: {} {}", reply.code, reply.message);
            return Ok(reply);
        }

        let description: UserDescription = reply
            .payload
            .as_ref()
            .and_then(|payload| payload.get("me"))
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| ClientError::Protocol(format!("login reply with a bad user description: {e}")))?
            .ok_or_else(|| ClientError::Protocol("login reply without a user description".to_string()))?;

        let me = {
            let mut state = self.inner.state.lock().unwrap();
            let mut me = User::ghost(&description.name);
            me.apply(&description, Some(&description.name));
            me.relation = UserRelation::Me;
            state.users.insert(me.name.clone(), me.clone());
            state.me = Some(me.clone());
            state.phase = SessionPhase::LoggedIn;
            me
        };
        info!("logged in as {} ({})", me.name, me.display_name);
        self.emit(ClientEvent::UserDetails { added: Vec::new(), changed: vec![me] });
        Ok(reply)
    }

    /// Sends a best-effort logout notice, then tears the session down
    /// locally without waiting for the server.
    pub async fn log_out(&self, reason: Option<&str>) -> Result<()> {
        let transport = self.inner.transport.lock().unwrap().clone();
        if let Some(transport) = transport {
            let mut packet = transport.create_message("logout");
            if let Some(reason) = reason {
                packet.insert("reason".to_string(), json!(reason));
            }
            if let Err(e) = transport.send_message(packet, None).await {
                debug!("logout notice not sent: {}", e);
            }
        }
        self.teardown();
        Ok(())
    }

    /// Drops the transport and clears all session state. Idempotent.
    pub fn disconnect(&self) {
        self.teardown();
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.state.lock().unwrap().phase
    }

    /// Snapshot of the logged-in user, if any.
    pub fn me(&self) -> Option<User> {
        self.inner.state.lock().unwrap().me.clone()
    }

    /// Snapshot of a cached user.
    pub fn user(&self, name: &str) -> Option<User> {
        self.inner.state.lock().unwrap().users.get(name).cloned()
    }

    /// Snapshot of a cached group.
    pub fn group(&self, name: &str) -> Option<Group> {
        self.inner.state.lock().unwrap().groups.get(name).cloned()
    }

    /// Snapshot of the friends subset, ordered by name.
    pub fn friends(&self) -> Vec<User> {
        let state = self.inner.state.lock().unwrap();
        state
            .friends
            .iter()
            .filter_map(|name| state.users.get(name).cloned())
            .collect()
    }

    /// Snapshot of every cached group.
    pub fn groups(&self) -> Vec<Group> {
        let state = self.inner.state.lock().unwrap();
        let mut groups: Vec<Group> = state.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    /// Snapshot of the groups the local account is a member of.
    pub fn joined_groups(&self) -> Vec<Group> {
        self.groups().into_iter().filter(|group| group.joined).collect()
    }

    fn transport(&self) -> Result<Arc<FrameTransport>> {
        self.inner.transport.lock().unwrap().clone().ok_or(ClientError::NotConnected)
    }

    /// Transport handle for a session-scoped command; callers that are not
    /// logged in are refused loudly.
    pub(crate) fn require_session(&self) -> Result<Arc<FrameTransport>> {
        if self.phase() != SessionPhase::LoggedIn {
            error!("session command issued before login");
            return Err(ClientError::NotLoggedIn);
        }
        self.transport()
    }

    /// One request/reply round trip. Transport-level outcomes come back as
    /// synthetic replies with client-local codes, so callers can tell
    /// "server said no" from "never heard back".
    pub(crate) async fn request(&self, transport: &FrameTransport, packet: Packet) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        let callback: ReplyCallback = Box::new(move |result, payload| {
            let reply = match result {
                ReplyResult::Success => Reply::from_payload(payload.unwrap_or(Value::Null)),
                ReplyResult::Expired => {
                    Reply::local(ResultCode::NoReply, "no reply before the request expired")
                }
                ReplyResult::Fail => {
                    Reply::local(ResultCode::NotSent, "the connection closed before a reply arrived")
                }
            };
            let _ = tx.send(reply);
        });
        if let Err(e) = transport.send_message(packet, Some(callback)).await {
            debug!("request send failed: {}", e);
        }
        rx.await.map_err(|_| ClientError::TransportClosed)
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.inner.events.send(event);
    }

    fn current_epoch(&self) -> u64 {
        self.inner.state.lock().unwrap().epoch
    }

    fn handle_message(&self, message: InboundMessage) {
        match message.name.as_str() {
            "detail.users" => self.handle_detail_users(&message.payload),
            "detail.groups" => self.handle_detail_groups(&message.payload),
            "chat.user" => self.handle_user_chat(&message.payload),
            "chat.group" => self.handle_group_chat(&message.payload),
            "typing.user" => self.handle_user_typing(&message.payload),
            "typing.group" => self.handle_group_typing(&message.payload),
            other => debug!("ignoring unhandled message \"{}\"", other),
        }
    }

    fn teardown(&self) {
        if let Some(transport) = self.inner.transport.lock().unwrap().take() {
            transport.stop();
        }
        let had_session = {
            let mut state = self.inner.state.lock().unwrap();
            let had = state.phase != SessionPhase::Disconnected;
            state.epoch += 1;
            state.phase = SessionPhase::Disconnected;
            state.me = None;
            state.users.clear();
            state.groups.clear();
            state.friends.clear();
            had
        };
        if had_session {
            self.emit(ClientEvent::SessionEnded);
        }
    }
}

impl Default for ChatClient {
    fn default() -> Self {
        ChatClient::new()
    }
}

/// Looks a user up by name, synthesizing a ghost entry for senders the
/// server has not detailed yet. Returns a snapshot.
fn get_or_ghost(state: &mut SessionState, name: &str) -> User {
    if let Some(user) = state.users.get(name) {
        return user.clone();
    }
    let ghost = User::ghost(name);
    state.users.insert(name.to_string(), ghost.clone());
    ghost
}

async fn dispatch_loop(client: ChatClient, mut events: broadcast::Receiver<TransportEvent>, epoch: u64) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Message(message)) => {
                if client.current_epoch() != epoch {
                    break;
                }
                client.handle_message(message);
            }
            Ok(TransportEvent::StreamError(error)) => {
                if client.current_epoch() != epoch {
                    break;
                }
                error!("stream error: {}", error);
                client.teardown();
                client.emit(ClientEvent::StreamError { error });
                break;
            }
            Err(broadcast::error::RecvError::Lagged(count)) => {
                error!("dispatch fell behind; {} inbound event(s) dropped", count);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
