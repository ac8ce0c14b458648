//! Background-task MQTT client.
//!
//! [`AsyncClient`] moves a [`Session`] into a tokio task that owns it
//! exclusively. Requests travel over an mpsc channel and are answered through
//! oneshot replies; the task pumps the session on a fixed interval. Session
//! calls that touch the transport run on the blocking pool, so a slow socket
//! never stalls a runtime worker. Received messages land in a shared
//! [`MessageQueue`] that can be drained without awaiting anything.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::client::ClientConfig;
use crate::error::{Error, Result};
use crate::queue::MessageQueue;
use crate::session::Session;
use crate::transport::{TcpTransport, Transport, parse_address};
use crate::types::{Event, Message, QoS};

const COMMAND_CHANNEL_SIZE: usize = 64;

/// Poll period while waiting for CONNACK.
const CONNACK_POLL_INTERVAL: Duration = Duration::from_millis(10);

enum Command {
    Connect {
        host: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        filter: String,
        qos: QoS,
        reply: oneshot::Sender<Result<u16>>,
    },
    Unsubscribe {
        filter: String,
        reply: oneshot::Sender<Result<u16>>,
    },
    Events {
        reply: oneshot::Sender<Vec<Event>>,
    },
    Shutdown,
}

/// QoS 0 MQTT client driven by a background tokio task.
///
/// Dropping the handle stops the task, which disconnects and closes the
/// transport.
pub struct AsyncClient {
    commands: mpsc::Sender<Command>,
    queue: Arc<MessageQueue>,
    connected: Arc<AtomicBool>,
    client_id: String,
    config: ClientConfig,
    task: Option<JoinHandle<()>>,
}

impl AsyncClient {
    /// Spawn a client that connects over plain TCP.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_tcp(config: ClientConfig) -> Result<Self> {
        let transport = TcpTransport::new().with_write_timeout(config.connect_timeout());
        Self::spawn(config, transport)
    }

    /// Spawn a client over a caller-supplied transport.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<T: Transport + 'static>(config: ClientConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let queue = Arc::new(MessageQueue::new(config.queue_capacity));
        let session = Session::new(&config, transport, Arc::clone(&queue))?;
        let client_id = session.client_id().to_string();

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let connected = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run(session, rx, Arc::clone(&connected), config.pump_interval()));
        debug!("Started session task for {}", client_id);

        Ok(Self {
            commands: tx,
            queue,
            connected,
            client_id,
            config,
            task: Some(task),
        })
    }

    /// Connect to `host` (`host`, `host:port` or `mqtt://host:port`).
    ///
    /// Resolves once CONNACK arrives or the connect timeout elapses. A
    /// `disconnect` issued meanwhile aborts it with [`Error::ConnectionClosed`].
    pub async fn connect(&self, host: &str, username: Option<&str>, password: Option<&str>) -> Result<()> {
        let addr = parse_address(host, Some(self.config.port))?;
        let username = username.or(self.config.username.as_deref()).map(str::to_string);
        let password = password.or(self.config.password.as_deref()).map(str::to_string);

        self.request(|reply| Command::Connect {
            host: addr.host,
            port: addr.port,
            username,
            password,
            reply,
        })
        .await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Connection state as last published by the session task.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Publish a message. Only QoS 0 is supported.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Result<()> {
        let topic = topic.to_string();
        let payload = payload.into();
        self.request(|reply| Command::Publish { topic, payload, qos, retain, reply })
            .await?
    }

    /// Subscribe to a topic filter. Returns the SUBSCRIBE packet id.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<u16> {
        let filter = filter.to_string();
        self.request(|reply| Command::Subscribe { filter, qos, reply }).await?
    }

    /// Unsubscribe from a topic filter. Returns the UNSUBSCRIBE packet id.
    pub async fn unsubscribe(&self, filter: &str) -> Result<u16> {
        let filter = filter.to_string();
        self.request(|reply| Command::Unsubscribe { filter, reply }).await?
    }

    /// Take all received messages in arrival order. Never blocks.
    pub fn drain_messages(&self) -> Vec<Message> {
        self.queue.drain()
    }

    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped_count()
    }

    /// Take advisory events recorded by the session.
    pub async fn drain_events(&self) -> Result<Vec<Event>> {
        self.request(|reply| Command::Events { reply }).await
    }

    /// Stop the session task and wait for it to close the transport.
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown).await;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Session task for {} ended abnormally: {}", self.client_id, e);
            }
        }
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }
}

impl Drop for AsyncClient {
    fn drop(&mut self) {
        // The task also stops once the channel closes; this just makes it prompt.
        let _ = self.commands.try_send(Command::Shutdown);
    }
}

// ============================================================================
// Session task
// ============================================================================

type ConnectReply = oneshot::Sender<Result<()>>;

async fn run<T: Transport + 'static>(
    mut session: Session<T>,
    mut commands: mpsc::Receiver<Command>,
    connected: Arc<AtomicBool>,
    pump_interval: Duration,
) {
    let mut ticker = time::interval(pump_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Reply for a connect still waiting on CONNACK. Commands keep flowing
    // meanwhile, so a disconnect or shutdown can abort it.
    let mut pending_connect: Option<ConnectReply> = None;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let command = match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => command,
                };
                session = match handle_command(session, command, &mut pending_connect, &connected).await {
                    Some(session) => session,
                    None => return fail_connect(&mut pending_connect, &connected, Error::Shutdown),
                };
            }
            _ = ticker.tick() => {
                session = match pump(session, &mut pending_connect, &connected).await {
                    Some(session) => session,
                    None => return fail_connect(&mut pending_connect, &connected, Error::Shutdown),
                };
            }
            _ = time::sleep(CONNACK_POLL_INTERVAL), if pending_connect.is_some() => {
                session = match pump(session, &mut pending_connect, &connected).await {
                    Some(session) => session,
                    None => return fail_connect(&mut pending_connect, &connected, Error::Shutdown),
                };
            }
        }
        connected.store(session.is_connected(), Ordering::Release);
    }

    debug!("Stopping session task for {}", session.client_id());
    let _ = run_blocking(session, Session::disconnect).await;
    fail_connect(&mut pending_connect, &connected, Error::Shutdown);
}

/// Apply one command. Returns `None` if the session was lost.
async fn handle_command<T: Transport + 'static>(
    session: Session<T>,
    command: Command,
    pending_connect: &mut Option<ConnectReply>,
    connected: &AtomicBool,
) -> Option<Session<T>> {
    match command {
        Command::Connect { host, port, username, password, reply } => {
            let (session, result) = run_blocking(session, move |s| {
                s.begin_connect(&host, port, username.as_deref(), password.as_deref())
            })
            .await?;
            // begin_connect refuses unless Disconnected, so no reply is pending here
            match result {
                Ok(()) => *pending_connect = Some(reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
            Some(session)
        }
        Command::Disconnect { reply } => {
            let (session, ()) = run_blocking(session, Session::disconnect).await?;
            fail_connect(pending_connect, connected, Error::ConnectionClosed);
            let _ = reply.send(());
            Some(session)
        }
        Command::Publish { topic, payload, qos, retain, reply } => {
            let (session, result) = run_blocking(session, move |s| s.publish(&topic, payload, qos, retain)).await?;
            connected.store(session.is_connected(), Ordering::Release);
            let _ = reply.send(result);
            Some(session)
        }
        Command::Subscribe { filter, qos, reply } => {
            let (session, result) = run_blocking(session, move |s| s.subscribe(&filter, qos)).await?;
            connected.store(session.is_connected(), Ordering::Release);
            let _ = reply.send(result);
            Some(session)
        }
        Command::Unsubscribe { filter, reply } => {
            let (session, result) = run_blocking(session, move |s| s.unsubscribe(&filter)).await?;
            connected.store(session.is_connected(), Ordering::Release);
            let _ = reply.send(result);
            Some(session)
        }
        Command::Events { reply } => {
            let mut session = session;
            let _ = reply.send(session.take_events());
            Some(session)
        }
        Command::Shutdown => Some(session),
    }
}

/// Pump once and settle a pending connect if its outcome is known.
async fn pump<T: Transport + 'static>(
    session: Session<T>,
    pending_connect: &mut Option<ConnectReply>,
    connected: &AtomicBool,
) -> Option<Session<T>> {
    let (session, result) = run_blocking(session, Session::pump).await?;
    connected.store(session.is_connected(), Ordering::Release);

    match result {
        Err(e) => match pending_connect.take() {
            Some(reply) => {
                let _ = reply.send(Err(e));
            }
            None => debug!("Pump failed for {}: {}", session.client_id(), e),
        },
        Ok(()) if session.is_connected() => {
            if let Some(reply) = pending_connect.take() {
                trace!("CONNACK received for {}", session.client_id());
                let _ = reply.send(Ok(()));
            }
        }
        Ok(()) => {}
    }
    Some(session)
}

fn fail_connect(pending_connect: &mut Option<ConnectReply>, connected: &AtomicBool, err: Error) {
    connected.store(false, Ordering::Release);
    if let Some(reply) = pending_connect.take() {
        let _ = reply.send(Err(err));
    }
}

/// Run a session call that may block on the transport on the blocking pool,
/// handing the session back afterwards. `None` if the call panicked.
async fn run_blocking<T, R, F>(mut session: Session<T>, f: F) -> Option<(Session<T>, R)>
where
    T: Transport + 'static,
    R: Send + 'static,
    F: FnOnce(&mut Session<T>) -> R + Send + 'static,
{
    match task::spawn_blocking(move || {
        let result = f(&mut session);
        (session, result)
    })
    .await
    {
        Ok(pair) => Some(pair),
        Err(e) => {
            warn!("Session call panicked: {}", e);
            None
        }
    }
}
