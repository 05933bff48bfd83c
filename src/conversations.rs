// Conversation management for the Infinichat client
// Routes the session's flat event stream into per-conversation feeds,
// creating conversations on demand for contacts with live chat activity.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::conversation::Conversation;
use crate::models::{Contact, User};
use crate::protocol::{ChatClient, ClientEvent};

#[derive(Clone)]
pub enum ConversationManagerEvent {
    NewConversation(Conversation),
}

struct ManagerInner {
    client: ChatClient,
    conversations: Mutex<HashMap<String, Conversation>>,
    events: broadcast::Sender<ConversationManagerEvent>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(router) = self.router.lock().unwrap().take() {
            router.abort();
        }
    }
}

/// Presents a per-contact conversational view over the session client's
/// contact-scoped events. Cheap to clone.
#[derive(Clone)]
pub struct ConversationManager {
    inner: Arc<ManagerInner>,
}

impl ConversationManager {
    pub fn new(client: ChatClient) -> ConversationManager {
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(ManagerInner {
            client: client.clone(),
            conversations: Mutex::new(HashMap::new()),
            events,
            router: Mutex::new(None),
        });

        let handle = tokio::spawn(run_router(client.subscribe(), Arc::downgrade(&inner)));
        *inner.router.lock().unwrap() = Some(handle);

        ConversationManager { inner }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationManagerEvent> {
        self.inner.events.subscribe()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.inner.conversations.lock().unwrap().values().cloned().collect()
    }

    pub fn conversation(&self, name: &str) -> Option<Conversation> {
        self.inner.conversations.lock().unwrap().get(name).cloned()
    }

    /// Opens a conversation with the given contact, or returns the live one
    /// already indexed under that name; chat activity may have created it
    /// first.
    pub fn create_conversation(&self, contact: &Contact) -> Conversation {
        ensure(&self.inner, contact)
    }

    /// Drops the conversation from the index. The server is not notified.
    pub fn delete_conversation(&self, conversation: &Conversation) {
        self.inner.conversations.lock().unwrap().remove(conversation.name());
    }
}

fn ensure(inner: &Arc<ManagerInner>, contact: &Contact) -> Conversation {
    {
        let index = inner.conversations.lock().unwrap();
        if let Some(existing) = index.get(contact.name()) {
            if !existing.is_ended() {
                return existing.clone();
            }
        }
    }

    let conversation = Conversation::new(inner.client.clone(), contact.clone());
    {
        // Racing creators are possible (a caller opening a tab while chat
        // arrives); whoever loses the second check drops their allocation.
        let mut index = inner.conversations.lock().unwrap();
        if let Some(existing) = index.get(contact.name()) {
            if !existing.is_ended() {
                return existing.clone();
            }
        }
        index.insert(contact.name().to_string(), conversation.clone());
    }
    debug!("new conversation with {}", contact.name());
    let _ = inner
        .events
        .send(ConversationManagerEvent::NewConversation(conversation.clone()));
    conversation
}

async fn run_router(
    mut events: broadcast::Receiver<ClientEvent>,
    weak: Weak<ManagerInner>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(inner) = weak.upgrade() else { break };
                route(&inner, event);
            }
            Err(broadcast::error::RecvError::Lagged(count)) => {
                warn!("conversation router fell behind; {} event(s) dropped", count);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn route(inner: &Arc<ManagerInner>, event: ClientEvent) {
    match event {
        ClientEvent::UserChat { message } => {
            let contact = Contact::User(message.sender.clone());
            ensure(inner, &contact).apply_chat(message);
        }
        ClientEvent::GroupChat { group, message } => {
            let contact = Contact::Group(group);
            ensure(inner, &contact).apply_chat(message);
        }
        ClientEvent::UserTyping { user, starting } => {
            if let Some(conversation) = existing(inner, &user.name) {
                conversation.apply_typing(user, starting);
            }
        }
        ClientEvent::GroupTyping { group, user, starting } => {
            if let Some(conversation) = existing(inner, &group) {
                conversation.apply_typing(user, starting);
            }
        }
        ClientEvent::UserDetails { added: _, changed } => {
            for user in changed {
                relay_user_change(inner, user);
            }
        }
        ClientEvent::GroupDetails { added: _, changed } => {
            for group in changed {
                let Some(conversation) = existing(inner, &group.name) else { continue };
                sync_participants(inner, &conversation, &group.members);
            }
        }
        // Granular membership events serve subscribers that want them; the
        // routing here works from the aggregate diff instead.
        ClientEvent::GroupMemberAdded { .. } | ClientEvent::GroupMemberRemoved { .. } => {}
        ClientEvent::StreamError { .. } => {}
        ClientEvent::SessionEnded => {
            let drained: Vec<Conversation> = {
                let mut index = inner.conversations.lock().unwrap();
                index.drain().map(|(_, conversation)| conversation).collect()
            };
            for conversation in drained {
                conversation.force_end();
            }
        }
    }
}

fn existing(inner: &Arc<ManagerInner>, name: &str) -> Option<Conversation> {
    let index = inner.conversations.lock().unwrap();
    index.get(name).filter(|conversation| !conversation.is_ended()).cloned()
}

fn relay_user_change(inner: &Arc<ManagerInner>, user: User) {
    let conversations: Vec<Conversation> = inner.conversations.lock().unwrap().values().cloned().collect();
    for conversation in conversations {
        conversation.apply_user_changed(user.clone());
    }
}

/// Diffs a changed group's member set against the conversation's
/// participants and relays user-added/user-removed. An emptied conversation
/// is terminal and leaves the index.
fn sync_participants(inner: &Arc<ManagerInner>, conversation: &Conversation, members: &[String]) {
    let current: Vec<String> = conversation
        .participants()
        .iter()
        .map(|participant| participant.user.name.clone())
        .collect();

    for name in members {
        if !current.iter().any(|existing| existing == name) {
            let user = inner.client.user(name).unwrap_or_else(|| User::ghost(name));
            conversation.apply_user_added(user);
        }
    }
    for name in &current {
        if !members.contains(name) {
            let user = inner.client.user(name).unwrap_or_else(|| User::ghost(name));
            if conversation.apply_user_removed(user) {
                inner.conversations.lock().unwrap().remove(conversation.name());
            }
        }
    }
}
