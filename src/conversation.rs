// Conversation state for the Infinichat client
// A conversation scopes chat, typing, and roster traffic to one direct peer
// or one group, keeps the local chat log, and republishes events to its own
// subscribers.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use crate::error::{ClientError, Result};
use crate::models::{ChatMessage, Contact, FontOptions, User};
use crate::protocol::ChatClient;

/// A user taking part in a conversation, with conversation-local state.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user: User,
    pub is_typing: bool,
    pub last_message: Option<DateTime<Utc>>,
}

impl Participant {
    fn new(user: User) -> Participant {
        Participant { user, is_typing: false, last_message: None }
    }
}

/// Events scoped to one conversation.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    UserAdded(User),
    UserChanged(User),
    UserRemoved(User),
    NewMessage(ChatMessage),
    UserTyping { user: User, starting: bool },
    /// The last participant left (or the session ended); the conversation
    /// is terminal and no longer routable.
    Ended,
}

struct ConversationState {
    participants: Vec<Participant>,
    chat_log: Vec<ChatMessage>,
    has_new_messages: bool,
    ended: bool,
}

struct ConversationInner {
    contact: Contact,
    client: ChatClient,
    state: Mutex<ConversationState>,
    events: broadcast::Sender<ConversationEvent>,
}

/// One logical conversation. Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Conversation {
    inner: Arc<ConversationInner>,
}

impl Conversation {
    pub(crate) fn new(client: ChatClient, contact: Contact) -> Conversation {
        let participants = match &contact {
            Contact::User(user) => vec![Participant::new(user.clone())],
            Contact::Group(group) => group
                .members
                .iter()
                .map(|name| Participant::new(client.user(name).unwrap_or_else(|| User::ghost(name))))
                .collect(),
        };
        let (events, _) = broadcast::channel(64);
        Conversation {
            inner: Arc::new(ConversationInner {
                contact,
                client,
                state: Mutex::new(ConversationState {
                    participants,
                    chat_log: Vec::new(),
                    has_new_messages: false,
                    ended: false,
                }),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.inner.events.subscribe()
    }

    pub fn name(&self) -> &str {
        self.inner.contact.name()
    }

    /// The contact this conversation was opened with, as known at creation.
    pub fn contact(&self) -> &Contact {
        &self.inner.contact
    }

    /// A conversation with more than one participant chats via the group
    /// path; exactly one participant means a direct chat.
    pub fn is_group(&self) -> bool {
        self.inner.state.lock().unwrap().participants.len() > 1
    }

    pub fn is_ended(&self) -> bool {
        self.inner.state.lock().unwrap().ended
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.inner.state.lock().unwrap().participants.clone()
    }

    pub fn get_participant(&self, name: &str) -> Option<Participant> {
        self.inner
            .state
            .lock()
            .unwrap()
            .participants
            .iter()
            .find(|participant| participant.user.name == name)
            .cloned()
    }

    pub fn recent_messages(&self) -> Vec<ChatMessage> {
        self.inner.state.lock().unwrap().chat_log.clone()
    }

    pub fn has_new_messages(&self) -> bool {
        self.inner.state.lock().unwrap().has_new_messages
    }

    pub fn mark_read(&self) {
        self.inner.state.lock().unwrap().has_new_messages = false;
    }

    /// Sends a message to this conversation's peer and appends it to the
    /// local log immediately; the chat round trip is not awaited for the
    /// echo.
    pub async fn send_message(
        &self,
        text: &str,
        font: &FontOptions,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if self.is_ended() {
            return Err(ClientError::ConversationEnded);
        }
        let me = self.inner.client.me().ok_or(ClientError::NotLoggedIn)?;
        let timestamp = timestamp.unwrap_or_else(Utc::now);

        if self.is_group() {
            self.inner.client.chat_group(self.name(), font, text, Some(timestamp)).await?;
        } else {
            self.inner.client.chat_user(self.name(), font, text, Some(timestamp)).await?;
        }

        let mut state = self.inner.state.lock().unwrap();
        state.chat_log.push(ChatMessage {
            sender: me,
            font: font.clone(),
            text: text.to_string(),
            timestamp,
        });
        Ok(())
    }

    pub(crate) fn apply_chat(&self, message: ChatMessage) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.ended {
                return;
            }
            if let Some(participant) = state
                .participants
                .iter_mut()
                .find(|participant| participant.user.name == message.sender.name)
            {
                participant.last_message = Some(message.timestamp);
                participant.is_typing = false;
            }
            state.chat_log.push(message.clone());
            state.has_new_messages = true;
        }
        let _ = self.inner.events.send(ConversationEvent::NewMessage(message));
    }

    pub(crate) fn apply_user_added(&self, user: User) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.ended || state.participants.iter().any(|p| p.user.name == user.name) {
                return;
            }
            state.participants.push(Participant::new(user.clone()));
        }
        let _ = self.inner.events.send(ConversationEvent::UserAdded(user));
    }

    pub(crate) fn apply_user_changed(&self, user: User) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.ended {
                return;
            }
            match state.participants.iter_mut().find(|p| p.user.name == user.name) {
                Some(participant) => participant.user = user.clone(),
                None => return,
            }
        }
        let _ = self.inner.events.send(ConversationEvent::UserChanged(user));
    }

    /// Removes a participant. Returns true when the conversation emptied
    /// out and became terminal.
    pub(crate) fn apply_user_removed(&self, user: User) -> bool {
        let ended = {
            let mut state = self.inner.state.lock().unwrap();
            if state.ended {
                return true;
            }
            let before = state.participants.len();
            state.participants.retain(|p| p.user.name != user.name);
            if state.participants.len() == before {
                return false;
            }
            state.ended = state.participants.is_empty();
            state.ended
        };
        let _ = self.inner.events.send(ConversationEvent::UserRemoved(user));
        if ended {
            let _ = self.inner.events.send(ConversationEvent::Ended);
        }
        ended
    }

    pub(crate) fn apply_typing(&self, user: User, starting: bool) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.ended {
                return;
            }
            match state.participants.iter_mut().find(|p| p.user.name == user.name) {
                Some(participant) => participant.is_typing = starting,
                None => return,
            }
        }
        let _ = self.inner.events.send(ConversationEvent::UserTyping { user, starting });
    }

    /// Terminal teardown used when the whole session ends.
    pub(crate) fn force_end(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.ended {
                return;
            }
            state.ended = true;
        }
        let _ = self.inner.events.send(ConversationEvent::Ended);
    }
}
