// Roster management for the Infinichat client
// Friend/group listing commands and the handlers that keep the entity
// caches synchronized with detail.* pushes from the server.

use log::{info, warn};
use serde_json::{json, Value};

use crate::error::Result;
use crate::models::{Group, GroupDescription, Reply, User, UserDescription, UserRelation};
use crate::protocol::{get_or_ghost, ChatClient, ClientEvent};

impl ChatClient {
    /// Asks the server to push fresh descriptions for the named users. The
    /// snapshot arrives later as an unsolicited `detail.users` message.
    pub async fn detail_users(&self, usernames: &[&str]) -> Result<()> {
        let transport = self.require_session()?;
        let mut packet = transport.create_message("detail.users");
        packet.insert("usernames".to_string(), json!(usernames));
        info!("detailing {} user(s)", usernames.len());
        transport.send_message(packet, None).await
    }

    /// Asks the server to push fresh descriptions for the named groups.
    pub async fn detail_groups(&self, groupnames: &[&str]) -> Result<()> {
        let transport = self.require_session()?;
        let mut packet = transport.create_message("detail.groups");
        packet.insert("groupnames".to_string(), json!(groupnames));
        info!("detailing {} group(s)", groupnames.len());
        transport.send_message(packet, None).await
    }

    /// Requests the friend list; the result arrives as `detail.users`.
    pub async fn list_friends(&self) -> Result<()> {
        let transport = self.require_session()?;
        let packet = transport.create_message("list.friends");
        info!("listing friends");
        transport.send_message(packet, None).await
    }

    /// Requests the joined-group list; the result arrives as `detail.groups`.
    pub async fn list_groups(&self) -> Result<()> {
        let transport = self.require_session()?;
        let packet = transport.create_message("list.groups");
        info!("listing groups");
        transport.send_message(packet, None).await
    }

    /// Asks the server to add a user as a friend.
    pub async fn add_friend(&self, username: &str) -> Result<Reply> {
        let transport = self.require_session()?;
        let mut packet = transport.create_message("add.user");
        packet.insert("username".to_string(), json!(username));
        info!("adding friend {}", username);
        let reply = self.request(&transport, packet).await?;
        info!("add.user reply: {} {}", reply.code, reply.message);
        Ok(reply)
    }

    /// Applies a `detail.users` push: create-or-update each described user,
    /// maintain the friends subset, and fire one aggregate event per batch.
    pub(super) fn handle_detail_users(&self, payload: &Value) {
        let Some(entries) = payload.get("users").and_then(Value::as_array) else {
            warn!("detail.users without a users array; dropping");
            return;
        };

        let mut added = Vec::new();
        let mut changed = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            let me_name = state.me.as_ref().map(|me| me.name.clone());
            for raw in entries {
                let description: UserDescription = match serde_json::from_value(raw.clone()) {
                    Ok(description) => description,
                    Err(e) => {
                        warn!("skipping malformed user description: {}", e);
                        continue;
                    }
                };
                let name = description.name.clone();
                let was_known = state.users.contains_key(&name);
                let mut user = state.users.remove(&name).unwrap_or_else(|| User::ghost(&name));
                user.apply(&description, me_name.as_deref());

                if user.relation == UserRelation::Friend {
                    state.friends.insert(name.clone());
                } else {
                    state.friends.remove(&name);
                }
                if me_name.as_deref() == Some(name.as_str()) {
                    state.me = Some(user.clone());
                }

                state.users.insert(name, user.clone());
                if was_known {
                    changed.push(user);
                } else {
                    added.push(user);
                }
            }
        }
        self.emit(ClientEvent::UserDetails { added, changed });
    }

    /// Applies a `detail.groups` push. Member-list diffs fire per-group
    /// user-added/user-removed events ahead of the aggregate event; member
    /// names not seen before become ghost users.
    pub(super) fn handle_detail_groups(&self, payload: &Value) {
        let Some(entries) = payload.get("groups").and_then(Value::as_array) else {
            warn!("detail.groups without a groups array; dropping");
            return;
        };

        let mut added = Vec::new();
        let mut changed = Vec::new();
        let mut member_events = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            for raw in entries {
                let description: GroupDescription = match serde_json::from_value(raw.clone()) {
                    Ok(description) => description,
                    Err(e) => {
                        warn!("skipping malformed group description: {}", e);
                        continue;
                    }
                };
                let name = description.name.clone();
                for member in &description.member_names {
                    get_or_ghost(&mut state, member);
                }

                match state.groups.remove(&name) {
                    Some(mut group) => {
                        let old_members = std::mem::take(&mut group.members);
                        group.display_name = description.display_name.clone();
                        group.joined = description.member.unwrap_or(false);
                        group.members = description.member_names.clone();

                        for member in &group.members {
                            if !old_members.contains(member) {
                                member_events.push(ClientEvent::GroupMemberAdded {
                                    group: name.clone(),
                                    user: get_or_ghost(&mut state, member),
                                });
                            }
                        }
                        for member in &old_members {
                            if !group.members.contains(member) {
                                member_events.push(ClientEvent::GroupMemberRemoved {
                                    group: name.clone(),
                                    user: get_or_ghost(&mut state, member),
                                });
                            }
                        }

                        state.groups.insert(name, group.clone());
                        changed.push(group);
                    }
                    None => {
                        let group = Group {
                            name: name.clone(),
                            display_name: description.display_name.clone(),
                            members: description.member_names.clone(),
                            joined: description.member.unwrap_or(false),
                        };
                        state.groups.insert(name, group.clone());
                        added.push(group);
                    }
                }
            }
        }

        for event in member_events {
            self.emit(event);
        }
        self.emit(ClientEvent::GroupDetails { added, changed });
    }
}
