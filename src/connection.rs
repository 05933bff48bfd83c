// Connection lifecycle for the Infinichat client
// Cancellable dialing, a slow-connection UX signal, bounded-retry
// reconnection with exponential backoff, and stream-error supervision that
// bridges transport failures back into the session.

use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

use crate::error::{ClientError, Result};
use crate::models::Reply;
use crate::protocol::{ChatClient, ClientEvent};

pub const DEFAULT_PORT: u16 = 49520;

/// Tunables for the connect/reconnect path. Defaults match the production
/// behavior; tests shrink the delays.
#[derive(Debug, Clone)]
pub struct ConnectPolicy {
    /// Extra attempts after the first when reconnecting. First-time
    /// connects never retry.
    pub retry_attempts: u32,
    /// Backoff before the first retry; doubles per attempt.
    pub retry_base_delay: Duration,
    /// How long a connect may run before the slow-connection signal fires.
    pub slow_connect_after: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        ConnectPolicy {
            retry_attempts: 5,
            retry_base_delay: Duration::from_millis(500),
            slow_connect_after: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The in-flight attempt is taking a while; purely informational, the
    /// attempt itself continues.
    SlowConnect,
    Retrying { attempt: u32, delay: Duration },
    Connected,
    /// The stream failed mid-session; a silent reconnect is starting.
    Lost,
    Reconnected,
    Failed { reason: String },
}

#[derive(Clone)]
struct ConnectionSettings {
    host: String,
    port: u16,
    username: String,
    password: String,
}

struct ConnectionInner {
    client: ChatClient,
    policy: ConnectPolicy,
    settings: Mutex<Option<ConnectionSettings>>,
    cancelled: AtomicBool,
    cancel: Notify,
    events: broadcast::Sender<ConnectionEvent>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.lock().unwrap().take() {
            supervisor.abort();
        }
    }
}

/// Owns connect, retry, and reconnect-on-failure policy for one session.
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

impl ConnectionManager {
    pub fn new(client: ChatClient) -> ConnectionManager {
        ConnectionManager::with_policy(client, ConnectPolicy::default())
    }

    pub fn with_policy(client: ChatClient, policy: ConnectPolicy) -> ConnectionManager {
        let (events, _) = broadcast::channel(64);
        ConnectionManager {
            inner: Arc::new(ConnectionInner {
                client,
                policy,
                settings: Mutex::new(None),
                cancelled: AtomicBool::new(false),
                cancel: Notify::new(),
                events,
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn client(&self) -> &ChatClient {
        &self.inner.client
    }

    /// Opens a TCP connection and logs in, blocking the caller until a
    /// terminal outcome. A first attempt does not retry: one socket failure
    /// is immediately reported.
    pub async fn connect(&self, host: &str, port: u16, username: &str, password: &str) -> Result<Reply> {
        *self.inner.settings.lock().unwrap() = Some(ConnectionSettings {
            host: host.to_string(),
            port,
            username: username.to_string(),
            password: password.to_string(),
        });
        self.inner.cancelled.store(false, Ordering::SeqCst);
        self.connect_inner(false).await
    }

    /// Disconnects the current session cleanly, then reconnects to the
    /// previously used host with the retry budget enabled.
    pub async fn reconnect(&self) -> Result<Reply> {
        self.inner.client.disconnect();
        self.inner.cancelled.store(false, Ordering::SeqCst);
        self.connect_inner(true).await
    }

    /// Aborts an in-flight connect attempt. The dial task releases the
    /// socket and returns without running the login path.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.cancel.notify_one();
    }

    /// Closes the session. Safe to call when already disconnected.
    pub fn disconnect(&self) {
        self.cancel();
        self.inner.client.disconnect();
    }

    async fn connect_inner(&self, reconnect: bool) -> Result<Reply> {
        let settings = self
            .inner
            .settings
            .lock()
            .unwrap()
            .clone()
            .ok_or(ClientError::NotConnected)?;
        let retries = if reconnect { self.inner.policy.retry_attempts } else { 0 };

        // The slow-connection signal is a separate observer; it never
        // disturbs or cancels the attempt it is watching.
        let slow = {
            let events = self.inner.events.clone();
            let after = self.inner.policy.slow_connect_after;
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = events.send(ConnectionEvent::SlowConnect);
            })
        };
        let outcome = self.dial_and_login(&settings, retries).await;
        slow.abort();

        match &outcome {
            Ok(reply) if reply.success() => {
                info!("connected to {}:{} as {}", settings.host, settings.port, settings.username);
                let event = if reconnect { ConnectionEvent::Reconnected } else { ConnectionEvent::Connected };
                let _ = self.inner.events.send(event);
                self.ensure_supervisor();
            }
            Ok(reply) => {
                error!("login rejected: {} {}", reply.code, reply.message);
                let _ = self.inner.events.send(ConnectionEvent::Failed { reason: reply.message.clone() });
            }
            Err(e) => {
                error!("connection failed: {}", e);
                let _ = self.inner.events.send(ConnectionEvent::Failed { reason: e.to_string() });
            }
        }
        outcome
    }

    async fn dial_and_login(&self, settings: &ConnectionSettings, retries: u32) -> Result<Reply> {
        let mut delay = self.inner.policy.retry_base_delay;
        let mut attempt = 0u32;
        let stream = loop {
            attempt += 1;
            tokio::select! {
                _ = wait_cancelled(&self.inner) => return Err(ClientError::Cancelled),
                dialed = TcpStream::connect((settings.host.as_str(), settings.port)) => match dialed {
                    Ok(stream) => break stream,
                    Err(e) => {
                        if attempt > retries {
                            return Err(e.into());
                        }
                        warn!("connect attempt {} failed: {}; retrying in {:?}", attempt, e, delay);
                        let _ = self.inner.events.send(ConnectionEvent::Retrying { attempt, delay });
                        tokio::select! {
                            _ = wait_cancelled(&self.inner) => return Err(ClientError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay *= 2;
                    }
                },
            }
        };
        if self.inner.cancelled.load(Ordering::SeqCst) {
            return Err(ClientError::Cancelled);
        }

        self.inner.client.connect(stream)?;
        self.inner.client.log_in(&settings.username, &settings.password).await
    }

    fn ensure_supervisor(&self) {
        let mut slot = self.inner.supervisor.lock().unwrap();
        if slot.as_ref().map(|handle| !handle.is_finished()).unwrap_or(false) {
            return;
        }
        let events = self.inner.client.subscribe();
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(supervise(events, weak)));
    }
}

/// Resolves once cancellation is requested. Checking the flag around the
/// wait absorbs stale notify permits from a cancel that landed after its
/// attempt already finished.
async fn wait_cancelled(inner: &ConnectionInner) {
    loop {
        if inner.cancelled.load(Ordering::SeqCst) {
            return;
        }
        inner.cancel.notified().await;
    }
}

/// Watches the session for stream errors and runs the silent-reconnection
/// policy; only an exhausted retry budget surfaces as a failure.
async fn supervise(mut events: broadcast::Receiver<ClientEvent>, weak: Weak<ConnectionInner>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::StreamError { error }) => {
                let Some(inner) = weak.upgrade() else { break };
                warn!("connection lost: {}; attempting silent reconnection", error);
                let _ = inner.events.send(ConnectionEvent::Lost);
                let manager = ConnectionManager { inner };
                match manager.reconnect().await {
                    Ok(reply) if reply.success() => {}
                    Ok(reply) => error!("reconnect rejected by server: {} {}", reply.code, reply.message),
                    Err(e) => error!("reconnect gave up: {}", e),
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
