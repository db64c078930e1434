//! Threaded Stream Manager
//!
//! Synchronous facade over [`StreamClient`] for callers that do not run an
//! async runtime. A dedicated OS thread hosts a current-thread Tokio runtime
//! that owns every connection; the caller's thread only enqueues commands
//! on an unbounded channel, so nothing loop-owned is touched from outside.
//!
//! ```text
//! caller thread                       stream thread (current_thread runtime)
//! ─────────────                       ──────────────────────────────────────
//! start_socket(name, topic, cb) ──►  client_for(channel) ──► listener task
//! subscribe(topic)              ──►  client.subscribe(topic)
//! stop_socket(name)             ──►  running[name] = false
//! stop()                        ──►  flag all, close clients, drain tasks
//! ```
//!
//! Commands sent before a connection exists are queued; the client is
//! created lazily on first use and subscriptions made before it streams are
//! replayed once it connects.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::Instrument;

use super::client::{StreamClient, StreamError};
use super::connection::StreamEvent;
use crate::domain::connection::Channel;
use crate::infrastructure::config::StreamSettings;
use crate::infrastructure::telemetry;

/// Wait window of each listener poll; bounds how long a stopped listener
/// lingers.
pub const LISTEN_WINDOW: Duration = Duration::from_secs(3);

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Data callback run on the stream thread for each message.
pub type MessageCallback = Box<dyn FnMut(Value) + Send>;

/// Callback run on the stream thread for each answered server ping.
pub type PingCallback = Box<dyn FnMut() + Send>;

/// Builds the client for a channel. Called on the stream thread.
pub type ClientFactory = Arc<dyn Fn(Channel) -> Result<StreamClient, StreamError> + Send + Sync>;

type Reply = oneshot::Sender<Result<(), StreamError>>;

enum FacadeCommand {
    StartSocket {
        name: String,
        topic: String,
        callback: MessageCallback,
        ping: Option<PingCallback>,
        channel: Channel,
        reply: Reply,
    },
    Subscribe {
        topic: String,
        channel: Channel,
        reply: Reply,
    },
    StopSocket(String),
    Stop,
}

/// Synchronous handle to connections hosted on a background thread.
pub struct ThreadedStreamManager {
    commands: mpsc::UnboundedSender<FacadeCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadedStreamManager {
    /// Start the stream thread with clients built from `settings`.
    ///
    /// # Errors
    ///
    /// Returns `Runtime` if the runtime or thread cannot be created.
    pub fn new(settings: StreamSettings) -> Result<Self, StreamError> {
        let factory: ClientFactory = Arc::new(move |channel| match channel {
            Channel::Public => Ok(StreamClient::public(&settings)),
            Channel::Private => StreamClient::private(&settings),
        });
        Self::with_factory(factory)
    }

    /// Start the stream thread with clients built by `factory`.
    ///
    /// # Errors
    ///
    /// Returns `Runtime` if the runtime or thread cannot be created.
    pub fn with_factory(factory: ClientFactory) -> Result<Self, StreamError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (commands, rx) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name("orderly-stream".to_owned())
            .spawn(move || {
                runtime.block_on(FacadeLoop::new(factory).run(rx));
                tracing::debug!("Stream thread finished");
            })?;
        Ok(Self {
            commands,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Start a named listener that feeds `topic` to `callback`.
    ///
    /// `auth` selects the private channel. Server pings answered on that
    /// channel go to `ping` instead of `callback`. Blocks until the
    /// listener is scheduled; must not be called from inside a Tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be built or the manager has
    /// stopped.
    pub fn start_socket(
        &self,
        name: impl Into<String>,
        topic: impl Into<String>,
        callback: impl FnMut(Value) + Send + 'static,
        ping: Option<PingCallback>,
        auth: bool,
    ) -> Result<(), StreamError> {
        let (reply, done) = oneshot::channel();
        self.send(FacadeCommand::StartSocket {
            name: name.into(),
            topic: topic.into(),
            callback: Box::new(callback),
            ping,
            channel: channel_for(auth),
            reply,
        })?;
        done.blocking_recv().map_err(|_| StreamError::Closed)?
    }

    /// Subscribe to `topic` without attaching a listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be built or the manager has
    /// stopped.
    pub fn subscribe(&self, topic: impl Into<String>, auth: bool) -> Result<(), StreamError> {
        let (reply, done) = oneshot::channel();
        self.send(FacadeCommand::Subscribe {
            topic: topic.into(),
            channel: channel_for(auth),
            reply,
        })?;
        done.blocking_recv().map_err(|_| StreamError::Closed)?
    }

    /// Flag the named listener to stop after its current wait.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the manager has stopped.
    pub fn stop_socket(&self, name: impl Into<String>) -> Result<(), StreamError> {
        self.send(FacadeCommand::StopSocket(name.into()))
    }

    /// Flag every listener and close every connection.
    ///
    /// Returns immediately; use [`Self::join`] to wait for teardown.
    pub fn stop(&self) {
        let _ = self.commands.send(FacadeCommand::Stop);
    }

    /// Wait for the stream thread to finish.
    pub fn join(&self) {
        let thread = self.thread.lock().take();
        if let Some(thread) = thread
            && thread.join().is_err()
        {
            tracing::error!("Stream thread panicked");
        }
    }

    fn send(&self, command: FacadeCommand) -> Result<(), StreamError> {
        self.commands.send(command).map_err(|_| StreamError::Closed)
    }
}

impl Drop for ThreadedStreamManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ThreadedStreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedStreamManager")
            .field("running", &!self.commands.is_closed())
            .finish_non_exhaustive()
    }
}

const fn channel_for(auth: bool) -> Channel {
    if auth { Channel::Private } else { Channel::Public }
}

// =============================================================================
// Stream Thread
// =============================================================================

struct FacadeLoop {
    factory: ClientFactory,
    clients: Arc<Mutex<HashMap<Channel, StreamClient>>>,
    listeners: HashMap<String, Arc<AtomicBool>>,
    tasks: JoinSet<()>,
}

impl FacadeLoop {
    fn new(factory: ClientFactory) -> Self {
        Self {
            factory,
            clients: Arc::new(Mutex::new(HashMap::new())),
            listeners: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<FacadeCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                FacadeCommand::StartSocket {
                    name,
                    topic,
                    callback,
                    ping,
                    channel,
                    reply,
                } => {
                    let result = self
                        .client_for(channel)
                        .map(|client| self.spawn_listener(name, client, topic, callback, ping));
                    let _ = reply.send(result);
                }
                FacadeCommand::Subscribe {
                    topic,
                    channel,
                    reply,
                } => {
                    let result = self.client_for(channel).map(|client| {
                        self.tasks.spawn(async move {
                            if let Err(e) = client.subscribe(&topic).await {
                                tracing::warn!(topic, error = %e, "Subscribe failed");
                            }
                        });
                    });
                    let _ = reply.send(result);
                }
                FacadeCommand::StopSocket(name) => {
                    if let Some(running) = self.listeners.remove(&name) {
                        running.store(false, Ordering::SeqCst);
                        tracing::info!(name, "Stopping listener");
                    }
                }
                FacadeCommand::Stop => break,
            }
            // Reap finished tasks so the set does not grow unbounded.
            while self.tasks.try_join_next().is_some() {}
        }
        self.shutdown().await;
    }

    /// Get the client for `channel`, creating and starting it on first use.
    fn client_for(&mut self, channel: Channel) -> Result<StreamClient, StreamError> {
        if let Some(client) = self.clients.lock().get(&channel) {
            return Ok(client.clone());
        }

        let client = (self.factory)(channel)?;
        let clients = Arc::clone(&self.clients);
        client.on_exit(move || {
            let mut clients = clients.lock();
            if clients.get(&channel).is_some_and(StreamClient::is_closed) {
                clients.remove(&channel);
            }
        });
        let driver = client.start(&Handle::current())?;
        self.tasks.spawn(async move {
            match driver.await {
                Ok(Ok(())) => tracing::debug!(endpoint = %channel, "Stream driver finished"),
                Ok(Err(e)) => tracing::error!(endpoint = %channel, error = %e, "Stream driver failed"),
                Err(e) => tracing::error!(endpoint = %channel, error = %e, "Stream driver panicked"),
            }
        });
        self.clients.lock().insert(channel, client.clone());
        Ok(client)
    }

    fn spawn_listener(
        &mut self,
        name: String,
        client: StreamClient,
        topic: String,
        mut callback: MessageCallback,
        mut ping: Option<PingCallback>,
    ) {
        let span = telemetry::listener_span(&name, &topic);
        let running = Arc::new(AtomicBool::new(true));
        if let Some(previous) = self.listeners.insert(name, Arc::clone(&running)) {
            previous.store(false, Ordering::SeqCst);
        }

        let listener = async move {
            let mut events = client.events();
            if let Err(e) = client.subscribe(&topic).await {
                tracing::warn!(error = %e, "Subscribe failed");
            }
            tracing::info!("Listener started");

            while running.load(Ordering::SeqCst) {
                tokio::select! {
                    event = events.recv(), if ping.is_some() => match event {
                        Ok(StreamEvent::Ping) => {
                            if let Some(ping) = ping.as_mut() {
                                ping();
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(n)) => {
                            tracing::debug!(skipped = n, "Listener lagged behind events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    next = client.next_within(&topic, LISTEN_WINDOW) => match next {
                        Ok(Some(message)) => callback(message),
                        Ok(None) => {}
                        Err(_) => break,
                    },
                }
            }
            tracing::info!("Listener stopped");
        };
        self.tasks.spawn(listener.instrument(span));
    }

    async fn shutdown(mut self) {
        for running in self.listeners.values() {
            running.store(false, Ordering::SeqCst);
        }
        let clients: Vec<StreamClient> = self.clients.lock().drain().map(|(_, c)| c).collect();
        for client in &clients {
            client.close();
        }
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("Tasks still running at shutdown, aborting");
            self.tasks.abort_all();
        }
        tracing::info!(connections = clients.len(), "Stream manager stopped");
    }
}
