// Chat messaging for the Infinichat client
// Outbound chat.user/chat.group commands plus the inbound chat and typing
// decoders. Message bodies travel base64-encoded; fonts use the compact
// family/#RRGGBB/style-letter wire form.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use log::warn;
use serde_json::{json, Value};

use crate::error::Result;
use crate::models::{ChatMessage, FontOptions};
use crate::protocol::{get_or_ghost, ChatClient, ClientEvent};

impl ChatClient {
    /// Sends a chat message to a single user. Fire-and-forget; the local
    /// echo is the conversation layer's job.
    pub async fn chat_user(
        &self,
        username: &str,
        font: &FontOptions,
        text: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.chat("user", username, font, text, timestamp).await
    }

    /// Sends a chat message to a group.
    pub async fn chat_group(
        &self,
        groupname: &str,
        font: &FontOptions,
        text: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.chat("group", groupname, font, text, timestamp).await
    }

    async fn chat(
        &self,
        target: &str,
        to: &str,
        font: &FontOptions,
        text: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let transport = self.require_session()?;
        let mut packet = transport.create_message(&format!("chat.{}", target));
        packet.insert("to".to_string(), json!(to));
        packet.insert("font".to_string(), font.to_wire());
        packet.insert("body".to_string(), json!(BASE64.encode(text.as_bytes())));
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        packet.insert("timestamp".to_string(), json!(timestamp.to_rfc3339()));
        transport.send_message(packet, None).await
    }

    pub(super) fn handle_user_chat(&self, payload: &Value) {
        let Some(message) = self.decode_chat(payload) else {
            return;
        };
        self.emit(ClientEvent::UserChat { message });
    }

    /// A chat message routed through a group the server never detailed is
    /// dropped; the server is authoritative and the client will not invent
    /// a group for it.
    pub(super) fn handle_group_chat(&self, payload: &Value) {
        let Some(via) = payload.get("via").and_then(Value::as_str) else {
            warn!("chat.group without a via field; dropping");
            return;
        };
        let group = self.inner.state.lock().unwrap().groups.get(via).cloned();
        let Some(group) = group else {
            warn!("got a chat message from a group we don't know about: {}", via);
            return;
        };
        let Some(message) = self.decode_chat(payload) else {
            return;
        };
        self.emit(ClientEvent::GroupChat { group, message });
    }

    pub(super) fn handle_user_typing(&self, payload: &Value) {
        let Some((user, starting)) = self.decode_typing(payload) else {
            return;
        };
        self.emit(ClientEvent::UserTyping { user, starting });
    }

    pub(super) fn handle_group_typing(&self, payload: &Value) {
        let Some(via) = payload.get("via").and_then(Value::as_str) else {
            warn!("typing.group without a via field; dropping");
            return;
        };
        if !self.inner.state.lock().unwrap().groups.contains_key(via) {
            warn!("typing notification via unknown group {}; dropping", via);
            return;
        }
        let Some((user, starting)) = self.decode_typing(payload) else {
            return;
        };
        self.emit(ClientEvent::GroupTyping { group: via.to_string(), user, starting });
    }

    /// Decodes the common chat fields. The sender resolves through the user
    /// cache, ghosting names the server has not detailed yet; a missing or
    /// undecodable body drops the whole message.
    fn decode_chat(&self, payload: &Value) -> Option<ChatMessage> {
        let Some(from) = payload.get("from").and_then(Value::as_str) else {
            warn!("chat message without a from field; dropping");
            return None;
        };
        let Some(raw_body) = payload.get("body").and_then(Value::as_str) else {
            warn!("chat message without a body; dropping");
            return None;
        };
        let text = match BASE64.decode(raw_body).map(String::from_utf8) {
            Ok(Ok(text)) => text,
            _ => {
                warn!("chat message with an undecodable body; dropping");
                return None;
            }
        };
        let font = payload.get("font").map(FontOptions::from_wire).unwrap_or_default();
        let timestamp = payload
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let sender = {
            let mut state = self.inner.state.lock().unwrap();
            get_or_ghost(&mut state, from)
        };
        Some(ChatMessage { sender, font, text, timestamp })
    }

    fn decode_typing(&self, payload: &Value) -> Option<(crate::models::User, bool)> {
        let Some(from) = payload.get("from").and_then(Value::as_str) else {
            warn!("typing notification without a from field; dropping");
            return None;
        };
        let Some(starting) = payload.get("starting").and_then(Value::as_bool) else {
            warn!("typing notification without a starting flag; dropping");
            return None;
        };
        let user = {
            let mut state = self.inner.state.lock().unwrap();
            get_or_ghost(&mut state, from)
        };
        Some((user, starting))
    }
}
