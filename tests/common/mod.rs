// Shared utilities for Infinichat integration tests
// A scripted peer speaking the line-delimited JSON protocol, plus builders
// for the common packet shapes.

#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use infinichat::ChatClient;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The server side of a scripted exchange: reads the client's packets one
/// line at a time and writes back whatever the test scenario calls for.
pub struct ServerConn<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl<R, W> ServerConn<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub async fn recv(&mut self) -> Value {
        let mut line = String::new();
        let read = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a client packet")
            .expect("read from client failed");
        assert!(read > 0, "client closed the connection");
        serde_json::from_str(line.trim_end()).expect("client sent unparseable JSON")
    }

    pub async fn send(&mut self, packet: Value) {
        let line = format!("{}\r\n", packet);
        self.writer.write_all(line.as_bytes()).await.expect("write to client failed");
        self.writer.flush().await.expect("flush to client failed");
    }

    /// Reads one packet and asserts its message name.
    pub async fn expect(&mut self, name: &str) -> Value {
        let packet = self.recv().await;
        assert_eq!(
            packet.get("message").and_then(Value::as_str),
            Some(name),
            "unexpected packet: {}",
            packet
        );
        packet
    }

    /// Handles one login exchange, replying 200 with the given identity.
    pub async fn accept_login(&mut self, username: &str, display_name: &str) {
        let login = self.expect("login").await;
        assert!(login.get("password").and_then(Value::as_str).is_some());
        let reply = reply_to(&login, 200, "OK")
            .tap_insert("me", user_entry(username, display_name, "Available", false));
        self.send(reply).await;
    }
}

/// In-process transport pair: the near end goes to `ChatClient::connect`,
/// the far end is the scripted server.
pub fn duplex_pair() -> (
    DuplexStream,
    ServerConn<tokio::io::ReadHalf<DuplexStream>, tokio::io::WriteHalf<DuplexStream>>,
) {
    let (near, far) = tokio::io::duplex(8192);
    let (reader, writer) = tokio::io::split(far);
    (near, ServerConn { reader: BufReader::new(reader), writer })
}

/// Binds a localhost listener for tests that need a real socket.
pub async fn spawn_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("could not bind listener");
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

pub async fn accept(
    listener: &TcpListener,
) -> ServerConn<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf> {
    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("timed out waiting for the client to dial")
        .expect("accept failed");
    let (reader, writer) = stream.into_split();
    ServerConn { reader: BufReader::new(reader), writer }
}

/// A client attached over a duplex stream and logged in as alice.
pub async fn logged_in_client() -> (
    ChatClient,
    ServerConn<tokio::io::ReadHalf<DuplexStream>, tokio::io::WriteHalf<DuplexStream>>,
) {
    let client = ChatClient::new();
    let (near, mut server) = duplex_pair();
    client.connect(near).expect("connect failed");

    let (reply, _) = tokio::join!(client.log_in("alice", "pw123"), async {
        server.accept_login("alice", "Alice").await;
    });
    assert!(reply.expect("login errored").success());
    (client, server)
}

/// Receives the next broadcast event, panicking rather than hanging.
pub async fn recv_event<T: Clone>(events: &mut broadcast::Receiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

// ---------------------------------------------------------------------------
// Packet builders

pub fn reply_to(request: &Value, result: i64, result_message: &str) -> Value {
    json!({
        "reply": request["message"],
        "tag": request["tag"],
        "result": result,
        "result_message": result_message,
    })
}

pub fn user_entry(name: &str, display_name: &str, status: &str, friend: bool) -> Value {
    json!({
        "username": name,
        "display_name": display_name,
        "status": status,
        "friend": friend,
    })
}

pub fn group_entry(name: &str, display_name: &str, members: &[&str], joined: bool) -> Value {
    json!({
        "groupname": name,
        "display_name": display_name,
        "members": members,
        "member": joined,
    })
}

pub fn detail_users(entries: Vec<Value>) -> Value {
    json!({ "message": "detail.users", "users": entries })
}

pub fn detail_groups(entries: Vec<Value>) -> Value {
    json!({ "message": "detail.groups", "groups": entries })
}

pub fn user_chat(from: &str, text: &str) -> Value {
    json!({
        "message": "chat.user",
        "from": from,
        "font": { "family": "Segoe UI", "color": "#000000", "style": "" },
        "body": BASE64.encode(text.as_bytes()),
        "timestamp": "2024-05-04T12:30:00Z",
    })
}

pub fn group_chat(from: &str, via: &str, text: &str) -> Value {
    json!({
        "message": "chat.group",
        "from": from,
        "via": via,
        "font": { "family": "Segoe UI", "color": "#000000", "style": "" },
        "body": BASE64.encode(text.as_bytes()),
        "timestamp": "2024-05-04T12:30:00Z",
    })
}

pub fn user_typing(from: &str, starting: bool) -> Value {
    json!({ "message": "typing.user", "from": from, "starting": starting })
}

pub fn decode_body(packet: &Value) -> String {
    let raw = packet.get("body").and_then(Value::as_str).expect("packet has no body");
    String::from_utf8(BASE64.decode(raw).expect("body is not base64")).expect("body is not UTF-8")
}

/// Small helper so reply builders stay one expression.
trait TapInsert {
    fn tap_insert(self, key: &str, value: Value) -> Value;
}

impl TapInsert for Value {
    fn tap_insert(mut self, key: &str, value: Value) -> Value {
        self.as_object_mut().unwrap().insert(key.to_string(), value);
        self
    }
}
