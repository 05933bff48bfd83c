// Session-level integration tests
// Drive a ChatClient against a scripted peer over an in-process stream and
// verify entity synchronization, chat decoding, and failure semantics.

mod common;
use common::*;

use serde_json::json;

use infinichat::{
    ChatClient, ClientEvent, FontOptions, FontStyle, Rgb, SessionPhase, UserRelation, UserStatus,
};

#[tokio::test]
async fn login_success_builds_me_and_fires_roster_change() {
    init_logging();
    let client = ChatClient::new();
    let mut events = client.subscribe();
    let (near, mut server) = duplex_pair();
    client.connect(near).unwrap();
    assert_eq!(client.phase(), SessionPhase::Connected);

    let (reply, _) = tokio::join!(client.log_in("alice", "pw123"), async {
        let login = server.expect("login").await;
        assert_eq!(login["username"], "alice");
        assert_eq!(login["initial_status"], "Available");
        // The password must arrive as a hex digest, never in the clear.
        let password = login["password"].as_str().unwrap();
        assert_ne!(password, "pw123");
        assert_eq!(password.len(), 64);
        assert!(password.chars().all(|c| c.is_ascii_hexdigit()));

        let mut reply = reply_to(&login, 200, "OK");
        reply.as_object_mut().unwrap().insert(
            "me".to_string(),
            user_entry("alice", "Alice", "Available", false),
        );
        server.send(reply).await;
    });

    let reply = reply.unwrap();
    assert!(reply.success());
    assert_eq!(client.phase(), SessionPhase::LoggedIn);

    let me = client.me().expect("me not populated");
    assert_eq!(me.name, "alice");
    assert_eq!(me.status, UserStatus::Available);
    assert_eq!(me.relation, UserRelation::Me);

    match recv_event(&mut events).await {
        ClientEvent::UserDetails { added, changed } => {
            assert!(added.is_empty());
            assert_eq!(changed.len(), 1);
            assert_eq!(changed[0].name, "alice");
        }
        other => panic!("expected a roster change, got {:?}", other),
    }
}

#[tokio::test]
async fn rejected_login_stays_logged_out() {
    init_logging();
    let client = ChatClient::new();
    let (near, mut server) = duplex_pair();
    client.connect(near).unwrap();

    let (reply, _) = tokio::join!(client.log_in("alice", "wrong"), async {
        let login = server.expect("login").await;
        server.send(reply_to(&login, 401, "bad password")).await;
    });

    let reply = reply.unwrap();
    assert!(!reply.success());
    assert_eq!(reply.code, 401);
    assert_eq!(client.phase(), SessionPhase::Connected);
    assert!(client.me().is_none());
}

#[tokio::test]
async fn chat_from_unseen_sender_creates_exactly_one_ghost() {
    init_logging();
    let (client, mut server) = logged_in_client().await;
    let mut events = client.subscribe();

    server.send(user_chat("bob", "hello there")).await;

    match recv_event(&mut events).await {
        ClientEvent::UserChat { message } => {
            assert_eq!(message.sender.name, "bob");
            assert_eq!(message.sender.relation, UserRelation::None);
            assert_eq!(message.sender.status, UserStatus::Unknown);
            assert_eq!(message.text, "hello there");
        }
        other => panic!("expected a user chat, got {:?}", other),
    }

    // A later detail for the same name must update the ghost in place, not
    // create a duplicate.
    server
        .send(detail_users(vec![user_entry("bob", "Bob", "Available", true)]))
        .await;

    match recv_event(&mut events).await {
        ClientEvent::UserDetails { added, changed } => {
            assert!(added.is_empty(), "ghost was duplicated instead of promoted");
            assert_eq!(changed.len(), 1);
            assert_eq!(changed[0].name, "bob");
            assert_eq!(changed[0].relation, UserRelation::Friend);
        }
        other => panic!("expected a roster change, got {:?}", other),
    }

    let bob = client.user("bob").unwrap();
    assert_eq!(bob.display_name, "Bob");
    assert_eq!(bob.status, UserStatus::Available);
}

#[tokio::test]
async fn detail_users_maintains_the_friend_subset() {
    init_logging();
    let (client, mut server) = logged_in_client().await;
    let mut events = client.subscribe();

    server
        .send(detail_users(vec![
            user_entry("bob", "Bob", "Available", true),
            user_entry("carol", "Carol", "Busy", false),
        ]))
        .await;
    recv_event(&mut events).await;

    let friends = client.friends();
    assert_eq!(friends.len(), 1);
    assert_eq!(friends[0].name, "bob");

    // Bob falls out of the friend set when the server stops flagging him.
    server
        .send(detail_users(vec![user_entry("bob", "Bob", "Available", false)]))
        .await;
    recv_event(&mut events).await;
    assert!(client.friends().is_empty());
}

#[tokio::test]
async fn group_detail_diffing_is_idempotent() {
    init_logging();
    let (client, mut server) = logged_in_client().await;
    let mut events = client.subscribe();

    let payload = detail_groups(vec![group_entry("lounge", "The Lounge", &["bob", "carol"], true)]);
    server.send(payload.clone()).await;

    match recv_event(&mut events).await {
        ClientEvent::GroupDetails { added, changed } => {
            assert_eq!(added.len(), 1);
            assert!(changed.is_empty());
            assert_eq!(added[0].members, vec!["bob".to_string(), "carol".to_string()]);
        }
        other => panic!("expected group details, got {:?}", other),
    }

    // The same payload again: a changed event, but zero membership churn.
    server.send(payload).await;
    match recv_event(&mut events).await {
        ClientEvent::GroupDetails { added, changed } => {
            assert!(added.is_empty());
            assert_eq!(changed.len(), 1);
        }
        ClientEvent::GroupMemberAdded { .. } | ClientEvent::GroupMemberRemoved { .. } => {
            panic!("identical payload produced membership events")
        }
        other => panic!("expected group details, got {:?}", other),
    }

    let group = client.group("lounge").unwrap();
    assert!(group.joined);
    assert_eq!(client.joined_groups().len(), 1);
}

#[tokio::test]
async fn group_membership_changes_fire_member_events() {
    init_logging();
    let (client, mut server) = logged_in_client().await;
    let mut events = client.subscribe();

    server
        .send(detail_groups(vec![group_entry("lounge", "The Lounge", &["bob", "carol"], true)]))
        .await;
    recv_event(&mut events).await;

    server
        .send(detail_groups(vec![group_entry("lounge", "The Lounge", &["carol", "dave"], true)]))
        .await;

    match recv_event(&mut events).await {
        ClientEvent::GroupMemberAdded { group, user } => {
            assert_eq!(group, "lounge");
            assert_eq!(user.name, "dave");
        }
        other => panic!("expected a member addition, got {:?}", other),
    }
    match recv_event(&mut events).await {
        ClientEvent::GroupMemberRemoved { group, user } => {
            assert_eq!(group, "lounge");
            assert_eq!(user.name, "bob");
        }
        other => panic!("expected a member removal, got {:?}", other),
    }
    match recv_event(&mut events).await {
        ClientEvent::GroupDetails { added, changed } => {
            assert!(added.is_empty());
            assert_eq!(changed.len(), 1);
        }
        other => panic!("expected group details, got {:?}", other),
    }

    assert_eq!(client.group("lounge").unwrap().members, vec!["carol", "dave"]);
}

#[tokio::test]
async fn chat_via_unknown_group_is_dropped() {
    init_logging();
    let (client, mut server) = logged_in_client().await;
    let mut events = client.subscribe();

    server.send(group_chat("bob", "never-detailed", "psst")).await;
    // Follow with a benign push; the next event observed must be that push,
    // proving the group chat produced nothing and crashed nothing.
    server
        .send(detail_users(vec![user_entry("bob", "Bob", "Available", false)]))
        .await;

    match recv_event(&mut events).await {
        ClientEvent::UserDetails { .. } => {}
        other => panic!("unknown-group chat leaked an event: {:?}", other),
    }
}

#[tokio::test]
async fn known_group_chat_fires_a_group_event() {
    init_logging();
    let (client, mut server) = logged_in_client().await;
    let mut events = client.subscribe();

    server
        .send(detail_groups(vec![group_entry("lounge", "The Lounge", &["bob"], true)]))
        .await;
    recv_event(&mut events).await;

    server.send(group_chat("bob", "lounge", "hi all")).await;
    match recv_event(&mut events).await {
        ClientEvent::GroupChat { group, message } => {
            assert_eq!(group.name, "lounge");
            assert_eq!(message.sender.name, "bob");
            assert_eq!(message.text, "hi all");
        }
        other => panic!("expected a group chat, got {:?}", other),
    }
}

#[tokio::test]
async fn outbound_chat_encodes_body_font_and_timestamp() {
    init_logging();
    let (client, mut server) = logged_in_client().await;

    let font = FontOptions {
        family: "Consolas".to_string(),
        color: Rgb { r: 0xff, g: 0x00, b: 0x80 },
        style: FontStyle { bold: true, italic: false, underline: true },
    };
    client.chat_user("bob", &font, "hello, bob", None).await.unwrap();

    let packet = server.expect("chat.user").await;
    assert_eq!(packet["to"], "bob");
    assert_eq!(decode_body(&packet), "hello, bob");
    assert_eq!(packet["font"]["family"], "Consolas");
    assert_eq!(packet["font"]["color"], "#ff0080");
    let style = packet["font"]["style"].as_str().unwrap();
    assert!(style.contains('b') && style.contains('u') && !style.contains('i'));
    let timestamp = packet["timestamp"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
}

#[tokio::test]
async fn change_status_updates_me_after_confirmation() {
    init_logging();
    let (client, mut server) = logged_in_client().await;
    let mut events = client.subscribe();

    let (reply, _) = tokio::join!(client.change_status(UserStatus::Away), async {
        let request = server.expect("me.status").await;
        assert_eq!(request["status"], "Away");
        server.send(reply_to(&request, 200, "OK")).await;
    });

    assert!(reply.unwrap().success());
    assert_eq!(client.me().unwrap().status, UserStatus::Away);
    match recv_event(&mut events).await {
        ClientEvent::UserDetails { changed, .. } => {
            assert_eq!(changed[0].status, UserStatus::Away);
        }
        other => panic!("expected a roster change, got {:?}", other),
    }
}

#[tokio::test]
async fn rejected_status_change_leaves_the_cache_alone() {
    init_logging();
    let (client, mut server) = logged_in_client().await;

    let (reply, _) = tokio::join!(client.change_status(UserStatus::Busy), async {
        let request = server.expect("me.status").await;
        server.send(reply_to(&request, 403, "not allowed")).await;
    });

    assert!(!reply.unwrap().success());
    assert_eq!(client.me().unwrap().status, UserStatus::Available);
}

#[tokio::test]
async fn detail_requests_carry_name_lists() {
    init_logging();
    let (client, mut server) = logged_in_client().await;

    client.detail_users(&["bob", "carol"]).await.unwrap();
    let packet = server.expect("detail.users").await;
    assert_eq!(packet["usernames"], json!(["bob", "carol"]));

    client.detail_groups(&["lounge"]).await.unwrap();
    let packet = server.expect("detail.groups").await;
    assert_eq!(packet["groupnames"], json!(["lounge"]));

    client.list_friends().await.unwrap();
    server.expect("list.friends").await;
    client.list_groups().await.unwrap();
    server.expect("list.groups").await;
}

#[tokio::test]
async fn add_friend_round_trips_the_reply() {
    init_logging();
    let (client, mut server) = logged_in_client().await;

    let (reply, _) = tokio::join!(client.add_friend("dave"), async {
        let request = server.expect("add.user").await;
        assert_eq!(request["username"], "dave");
        server.send(reply_to(&request, 202, "request sent")).await;
    });

    let reply = reply.unwrap();
    assert!(reply.success());
    assert_eq!(reply.message, "request sent");
}

#[tokio::test]
async fn logout_sends_a_notice_and_clears_all_session_state() {
    init_logging();
    let (client, mut server) = logged_in_client().await;
    let mut events = client.subscribe();

    server
        .send(detail_users(vec![user_entry("bob", "Bob", "Available", true)]))
        .await;
    recv_event(&mut events).await;
    assert_eq!(client.friends().len(), 1);

    client.log_out(Some("signing off")).await.unwrap();

    let notice = server.expect("logout").await;
    assert_eq!(notice["reason"], "signing off");

    assert_eq!(client.phase(), SessionPhase::Disconnected);
    assert!(client.me().is_none());
    assert!(client.friends().is_empty());
    assert!(client.user("bob").is_none());
}

#[tokio::test]
async fn server_disconnect_forces_a_logged_out_session() {
    init_logging();
    let (client, server) = logged_in_client().await;
    let mut events = client.subscribe();

    drop(server);

    // Teardown first, then exactly one stream-error escalation.
    match recv_event(&mut events).await {
        ClientEvent::SessionEnded => {}
        other => panic!("expected session end, got {:?}", other),
    }
    match recv_event(&mut events).await {
        ClientEvent::StreamError { .. } => {}
        other => panic!("expected a stream error, got {:?}", other),
    }
    assert_eq!(client.phase(), SessionPhase::Disconnected);
    assert!(client.me().is_none());
}

#[tokio::test]
async fn malformed_detail_entries_are_skipped_not_fatal() {
    init_logging();
    let (client, mut server) = logged_in_client().await;
    let mut events = client.subscribe();

    server
        .send(json!({
            "message": "detail.users",
            "users": [
                { "display_name": "No Name", "status": "Available" },
                user_entry("bob", "Bob", "Available", false),
            ],
        }))
        .await;

    match recv_event(&mut events).await {
        ClientEvent::UserDetails { added, .. } => {
            assert_eq!(added.len(), 1);
            assert_eq!(added[0].name, "bob");
        }
        other => panic!("expected user details, got {:?}", other),
    }

    // The dispatch loop survived; another push still lands.
    server.send(user_chat("bob", "still alive")).await;
    match recv_event(&mut events).await {
        ClientEvent::UserChat { message } => assert_eq!(message.text, "still alive"),
        other => panic!("expected a user chat, got {:?}", other),
    }
}

#[tokio::test]
async fn typing_notifications_resolve_senders_like_chat() {
    init_logging();
    let (client, mut server) = logged_in_client().await;
    let mut events = client.subscribe();

    server.send(user_typing("bob", true)).await;
    match recv_event(&mut events).await {
        ClientEvent::UserTyping { user, starting } => {
            assert_eq!(user.name, "bob");
            assert!(starting);
        }
        other => panic!("expected a typing event, got {:?}", other),
    }
    assert!(client.user("bob").is_some(), "typing sender was not ghosted");
}
