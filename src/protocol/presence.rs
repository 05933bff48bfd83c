// Self-presence commands for the Infinichat client
// Status and display-name changes; the local "me" cache only moves once the
// server confirms, so it never drifts from the last acknowledged value.

use log::info;
use serde_json::json;

use crate::error::Result;
use crate::models::{Reply, UserStatus};
use crate::protocol::{ChatClient, ClientEvent};

impl ChatClient {
    /// Changes the local account's status. The cached "me" user is updated
    /// on a successful reply and a roster-changed event refires for self.
    pub async fn change_status(&self, status: UserStatus) -> Result<Reply> {
        let transport = self.require_session()?;
        let mut packet = transport.create_message("me.status");
        packet.insert("status".to_string(), json!(status.to_string()));
        let reply = self.request(&transport, packet).await?;

        if reply.success() {
            let me = {
                let mut state = self.inner.state.lock().unwrap();
                let Some(me) = state.me.as_mut() else {
                    return Ok(reply);
                };
                me.status = status;
                let me = me.clone();
                state.users.insert(me.name.clone(), me.clone());
                me
            };
            info!("status changed to {}", status);
            self.emit(ClientEvent::UserDetails { added: Vec::new(), changed: vec![me] });
        }
        Ok(reply)
    }

    /// Changes the local account's display name, mirroring the confirmed
    /// value into the cache.
    pub async fn change_display_name(&self, display_name: &str) -> Result<Reply> {
        let transport = self.require_session()?;
        let mut packet = transport.create_message("me.name");
        packet.insert("display_name".to_string(), json!(display_name));
        let reply = self.request(&transport, packet).await?;

        if reply.success() {
            let me = {
                let mut state = self.inner.state.lock().unwrap();
                let Some(me) = state.me.as_mut() else {
                    return Ok(reply);
                };
                me.display_name = display_name.to_string();
                let me = me.clone();
                state.users.insert(me.name.clone(), me.clone());
                me
            };
            info!("display name changed to {}", me.display_name);
            self.emit(ClientEvent::UserDetails { added: Vec::new(), changed: vec![me] });
        }
        Ok(reply)
    }
}
