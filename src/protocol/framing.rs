// Line framing and request correlation for the Infinichat wire protocol
// One JSON object per line, CRLF-terminated; replies are matched to pending
// requests by the tag the client assigned at send time.

use log::{debug, info, warn};
use serde_json::Value;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, Mutex as TokioMutex, Notify};
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{ClientError, Result};

/// How long a registered reply callback lives before it expires.
pub const REPLY_EXPIRY: Duration = Duration::from_secs(10);

/// How often expired callbacks are swept.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// An outbound packet under construction. Fields beyond `message` and `tag`
/// are inserted by the caller before sending.
pub type Packet = serde_json::Map<String, Value>;

/// How a pending request resolved. Exactly one of these is delivered per
/// registered callback: a matching reply, expiry, or transport shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyResult {
    Success,
    Fail,
    Expired,
}

pub type ReplyCallback = Box<dyn FnOnce(ReplyResult, Option<Value>) + Send + 'static>;

/// An unsolicited server push, carrying the message name and the full packet.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub name: String,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// A read failure that was not a requested shutdown. The owner decides
    /// whether it is recoverable.
    StreamError(Arc<io::Error>),
}

struct PendingRequest {
    message_name: String,
    tag: String,
    expires_at: Instant,
    callback: ReplyCallback,
}

struct PendingTable {
    /// Set by the read loop as it drains; once closed, no new request can
    /// register, which keeps every callback resolved exactly once.
    closed: bool,
    entries: Vec<PendingRequest>,
}

/// Reads and writes newline-delimited JSON packets over a byte stream and
/// correlates replies with pending request callbacks.
///
/// A background task owns the read half; it dispatches unsolicited messages
/// to subscribers, resolves tagged replies, sweeps expired callbacks, and on
/// termination fails every request still outstanding.
pub struct FrameTransport {
    writer: TokioMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: Arc<Mutex<PendingTable>>,
    next_tag: AtomicU64,
    events: broadcast::Sender<TransportEvent>,
    stopping: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl FrameTransport {
    pub fn new<S>(stream: S) -> FrameTransport
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let pending = Arc::new(Mutex::new(PendingTable { closed: false, entries: Vec::new() }));
        let (events, _) = broadcast::channel(128);
        let stopping = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        tokio::spawn(read_loop(
            BufReader::new(read_half),
            pending.clone(),
            events.clone(),
            stopping.clone(),
            shutdown.clone(),
        ));

        FrameTransport {
            writer: TokioMutex::new(Box::new(write_half)),
            pending,
            next_tag: AtomicU64::new(0),
            events,
            stopping,
            shutdown,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Allocates an outbound packet carrying the message name and a tag
    /// unique for the lifetime of this transport.
    pub fn create_message(&self, name: &str) -> Packet {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed).to_string();
        let mut packet = Packet::new();
        packet.insert("message".to_string(), Value::String(name.to_string()));
        packet.insert("tag".to_string(), Value::String(tag));
        packet
    }

    /// Serializes the packet as a single JSON line and writes it. With a
    /// callback, the request is registered before the write so a fast reply
    /// cannot race past it; a write failure resolves the callback with
    /// [`ReplyResult::Fail`].
    pub async fn send_message(&self, packet: Packet, callback: Option<ReplyCallback>) -> Result<()> {
        let name = packet.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
        let tag = packet.get("tag").and_then(Value::as_str).unwrap_or_default().to_string();

        if let Some(callback) = callback {
            let mut table = self.pending.lock().unwrap();
            if table.closed {
                drop(table);
                callback(ReplyResult::Fail, None);
                return Err(ClientError::TransportClosed);
            }
            table.entries.push(PendingRequest {
                message_name: name.clone(),
                tag: tag.clone(),
                expires_at: Instant::now() + REPLY_EXPIRY,
                callback,
            });
        }

        debug!("sending \"{}\" (tag {})", name, tag);
        let mut line = serde_json::to_string(&packet)?;
        line.push_str("\r\n");

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(line.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            warn!("write failed for \"{}\": {}", name, e);
            self.fail_pending(&tag);
            return Err(e.into());
        }
        Ok(())
    }

    /// Asks the read loop to terminate. Outstanding requests are failed by
    /// the loop as it drains; safe to call more than once.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    fn fail_pending(&self, tag: &str) {
        let request = {
            let mut table = self.pending.lock().unwrap();
            table
                .entries
                .iter()
                .position(|r| r.tag == tag)
                .map(|index| table.entries.remove(index))
        };
        if let Some(request) = request {
            (request.callback)(ReplyResult::Fail, None);
        }
    }
}

impl Drop for FrameTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn read_loop<R>(
    reader: BufReader<R>,
    pending: Arc<Mutex<PendingTable>>,
    events: broadcast::Sender<TransportEvent>,
    stopping: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut prune = tokio::time::interval(PRUNE_INTERVAL);
    prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
    prune.tick().await; // the first tick completes immediately

    let mut lines = reader.lines();
    loop {
        if stopping.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = prune.tick() => prune_expired(&pending),
            next = lines.next_line() => match next {
                Ok(Some(line)) => handle_line(&line, &pending, &events),
                Ok(None) => {
                    if !stopping.load(Ordering::SeqCst) {
                        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the connection");
                        let _ = events.send(TransportEvent::StreamError(Arc::new(eof)));
                    }
                    break;
                }
                Err(e) => {
                    if !stopping.load(Ordering::SeqCst) {
                        let _ = events.send(TransportEvent::StreamError(Arc::new(e)));
                    }
                    break;
                }
            },
        }
    }

    // Fail whatever is still outstanding; callers treat this as a terminal
    // transport error.
    let drained = {
        let mut table = pending.lock().unwrap();
        table.closed = true;
        std::mem::take(&mut table.entries)
    };
    if !drained.is_empty() {
        debug!("failing {} pending request(s) on transport shutdown", drained.len());
    }
    for request in drained {
        (request.callback)(ReplyResult::Fail, None);
    }
}

fn handle_line(raw: &str, pending: &Arc<Mutex<PendingTable>>, events: &broadcast::Sender<TransportEvent>) {
    let raw = raw.trim_end_matches(['\r', '\n']);
    if raw.is_empty() {
        return;
    }
    debug!("<- {}", raw);

    let packet: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            warn!("discarding unparseable packet: {}", e);
            return;
        }
    };
    let Some(fields) = packet.as_object() else {
        info!("received an invalid packet: not a JSON object");
        return;
    };

    if let Some(name) = fields.get("message").and_then(Value::as_str) {
        let message = InboundMessage { name: name.to_string(), payload: packet.clone() };
        let _ = events.send(TransportEvent::Message(message));
    } else if fields.get("reply").and_then(Value::as_str).is_some() {
        let missing = missing_fields(fields, &["tag", "result", "result_message"]);
        if !missing.is_empty() {
            debug!("discarding reply missing required fields: {}", missing.join(", "));
            return;
        }
        let Some(tag) = fields.get("tag").and_then(Value::as_str) else {
            debug!("discarding reply with a non-string tag");
            return;
        };
        let request = {
            let mut table = pending.lock().unwrap();
            table
                .entries
                .iter()
                .position(|r| r.tag == tag)
                .map(|index| table.entries.remove(index))
        };
        match request {
            Some(request) => {
                debug!("resolving \"{}\" (tag {})", request.message_name, request.tag);
                (request.callback)(ReplyResult::Success, Some(packet));
            }
            None => debug!("no pending request for reply tag {}", tag),
        }
    } else {
        info!("received an invalid packet: not a message or a reply");
    }
}

fn prune_expired(pending: &Arc<Mutex<PendingTable>>) {
    let now = Instant::now();
    let expired = {
        let mut table = pending.lock().unwrap();
        let mut kept = Vec::with_capacity(table.entries.len());
        let mut expired = Vec::new();
        for request in table.entries.drain(..) {
            if request.expires_at <= now {
                expired.push(request);
            } else {
                kept.push(request);
            }
        }
        table.entries = kept;
        expired
    };
    for request in expired {
        warn!("request \"{}\" (tag {}) expired without a reply", request.message_name, request.tag);
        (request.callback)(ReplyResult::Expired, None);
    }
}

fn missing_fields<'a>(fields: &serde_json::Map<String, Value>, required: &[&'a str]) -> Vec<&'a str> {
    required.iter().filter(|name| !fields.contains_key(**name)).copied().collect()
}
