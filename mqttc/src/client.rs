//! Synchronous MQTT 3.1.1 client.
//!
//! [`Client`] is a thin facade over a [`Session`]: the application owns it,
//! calls [`Client::pump`] from its own loop and drains received messages when
//! it is ready for them. No threads are spawned.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::MAX_PACKET_SIZE;
use crate::queue::{DEFAULT_QUEUE_CAPACITY, MessageQueue};
use crate::session::Session;
use crate::transport::{TcpTransport, Transport, TransportType, parse_address};
use crate::types::{Event, Message, QoS, State};

/// Client configuration.
///
/// Loadable from JSON (or any serde format); missing fields take defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client ID. Generated as `id-NNNNNN` when absent.
    pub client_id: Option<String>,
    /// Broker port used when the host carries none.
    pub port: u16,
    /// Username used when `connect` is given none.
    pub username: Option<String>,
    /// Password used when `connect` is given none.
    pub password: Option<String>,
    /// Keep alive interval in seconds (0 disables).
    pub keep_alive: u16,
    /// Clean session flag.
    pub clean_session: bool,
    /// Upper bound for opening the transport and for waiting on CONNACK.
    pub connect_timeout_ms: u64,
    /// How long a SUBSCRIBE / UNSUBSCRIBE may wait for its ack.
    pub ack_timeout_ms: u64,
    /// How long a PINGREQ may wait for PINGRESP.
    pub ping_timeout_ms: u64,
    /// Inbound message queue capacity.
    pub queue_capacity: usize,
    /// Maximum packet size, both directions.
    pub max_packet_size: usize,
    /// Pump period of the background client.
    pub pump_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            port: TransportType::Tcp.default_port(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            connect_timeout_ms: 10_000,
            ack_timeout_ms: 10_000,
            ping_timeout_ms: 10_000,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_packet_size: MAX_PACKET_SIZE,
            pump_interval_ms: 50,
        }
    }
}

impl ClientConfig {
    /// Create a new client config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set client ID.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set default broker port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep alive interval.
    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set clean session flag.
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn with_pump_interval(mut self, interval: Duration) -> Self {
        self.pump_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }

    /// Reject configurations no session could run with.
    pub fn validate(&self) -> Result<()> {
        if matches!(self.client_id.as_deref(), Some("")) {
            return Err(Error::InvalidConfig("client id must not be empty".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig("queue capacity must be at least 1".to_string()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(Error::InvalidConfig("connect timeout must be non-zero".to_string()));
        }
        if self.pump_interval_ms == 0 {
            return Err(Error::InvalidConfig("pump interval must be non-zero".to_string()));
        }
        // smallest packets (PINGREQ, DISCONNECT) are two bytes
        if self.max_packet_size < 2 {
            return Err(Error::InvalidConfig("max packet size too small".to_string()));
        }
        Ok(())
    }

    /// The configured client id, or a freshly generated one.
    pub(crate) fn resolve_client_id(&self) -> String {
        match self.client_id {
            Some(ref id) => id.clone(),
            None => generate_client_id(),
        }
    }
}

/// Generate a client id of the form `id-NNNNNN` from the wall clock.
pub fn generate_client_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("id-{}", millis % 1_000_000)
}

/// QoS 0 MQTT client driven by the caller.
pub struct Client<T: Transport = TcpTransport> {
    session: Session<T>,
    config: ClientConfig,
}

impl Client<TcpTransport> {
    /// Create a client that connects over plain TCP.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = TcpTransport::new().with_write_timeout(config.connect_timeout());
        Self::with_transport(config, transport)
    }
}

impl<T: Transport> Client<T> {
    /// Create a client over a caller-supplied transport.
    pub fn with_transport(config: ClientConfig, transport: T) -> Result<Self> {
        config.validate()?;
        let queue = Arc::new(MessageQueue::new(config.queue_capacity));
        let session = Session::new(&config, transport, queue)?;
        Ok(Self { session, config })
    }

    /// Connect to `host` (`host`, `host:port` or `mqtt://host:port`).
    ///
    /// Blocks until CONNACK or the connect timeout. Credentials fall back to
    /// those in the config.
    pub fn connect(&mut self, host: &str, username: Option<&str>, password: Option<&str>) -> Result<()> {
        let addr = parse_address(host, Some(self.config.port))?;
        let username = username.or(self.config.username.as_deref());
        let password = password.or(self.config.password.as_deref());
        self.session.connect(&addr.host, addr.port, username, password)
    }

    pub fn disconnect(&mut self) {
        self.session.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn state(&self) -> State {
        self.session.state()
    }

    /// Whether the last connection dropped without `disconnect`.
    pub fn connection_lost(&self) -> bool {
        self.session.connection_lost()
    }

    pub fn client_id(&self) -> &str {
        self.session.client_id()
    }

    /// Publish a message. Only QoS 0 is supported.
    pub fn publish(&mut self, topic: &str, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Result<()> {
        self.session.publish(topic, payload.into(), qos, retain)
    }

    /// Subscribe to a topic filter. Returns the SUBSCRIBE packet id; the
    /// matching SUBACK shows up in [`drain_events`](Self::drain_events).
    pub fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<u16> {
        self.session.subscribe(filter, qos)
    }

    /// Unsubscribe from a topic filter. Returns the UNSUBSCRIBE packet id.
    pub fn unsubscribe(&mut self, filter: &str) -> Result<u16> {
        self.session.unsubscribe(filter)
    }

    /// Process pending network input and timers without blocking.
    pub fn pump(&mut self) -> Result<()> {
        self.session.pump()
    }

    /// Take all received messages in arrival order.
    pub fn drain_messages(&self) -> Vec<Message> {
        self.session.queue().drain()
    }

    /// Messages discarded because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.session.queue().dropped_count()
    }

    /// Take advisory events (acks, ack timeouts, connection loss).
    pub fn drain_events(&mut self) -> Vec<Event> {
        self.session.take_events()
    }

    /// Shared handle to the inbound queue, for draining from another thread.
    pub fn queue(&self) -> Arc<MessageQueue> {
        Arc::clone(self.session.queue())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.port, 1883);
        assert_eq!(config.keep_alive, 60);
        assert!(config.clean_session);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.max_packet_size, 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::new()
            .with_client_id("sensor-7")
            .with_port(2883)
            .with_credentials("user", "pass")
            .with_keep_alive(30)
            .with_clean_session(false)
            .with_connect_timeout(Duration::from_secs(3))
            .with_ack_timeout(Duration::from_millis(1500))
            .with_ping_timeout(Duration::from_secs(4))
            .with_queue_capacity(16)
            .with_max_packet_size(4096)
            .with_pump_interval(Duration::from_millis(20));

        assert_eq!(config.client_id.as_deref(), Some("sensor-7"));
        assert_eq!(config.port, 2883);
        assert_eq!(config.username.as_deref(), Some("user"));
        assert_eq!(config.keep_alive, 30);
        assert!(!config.clean_session);
        assert_eq!(config.ack_timeout(), Duration::from_millis(1500));
        assert_eq!(config.ping_timeout(), Duration::from_secs(4));
        assert_eq!(config.pump_interval(), Duration::from_millis(20));
    }

    #[test]
    fn test_config_from_json() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"client_id": "from-json", "keep_alive": 15, "queue_capacity": 8}"#).unwrap();
        assert_eq!(config.client_id.as_deref(), Some("from-json"));
        assert_eq!(config.keep_alive, 15);
        assert_eq!(config.queue_capacity, 8);
        // unspecified fields keep defaults
        assert_eq!(config.port, 1883);
        assert_eq!(config.connect_timeout_ms, 10_000);

        let json = serde_json::to_string(&config).unwrap();
        let back: ClientConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_config_validate() {
        assert!(matches!(
            ClientConfig::new().with_client_id("").validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(ClientConfig::new().with_queue_capacity(0).validate().is_err());
        assert!(ClientConfig::new().with_connect_timeout(Duration::ZERO).validate().is_err());
        assert!(ClientConfig::new().with_max_packet_size(1).validate().is_err());
    }

    #[test]
    fn test_generated_client_id() {
        let id = generate_client_id();
        let digits = id.strip_prefix("id-").unwrap();
        assert!(!digits.is_empty() && digits.len() <= 6);
        assert!(digits.parse::<u32>().unwrap() < 1_000_000);

        let client = Client::new(ClientConfig::new()).unwrap();
        assert!(client.client_id().starts_with("id-"));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_empty_client_id_rejected() {
        assert!(matches!(
            Client::new(ClientConfig::new().with_client_id("")),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_unreachable_broker_times_out() {
        // reserved TEST-NET-1 address, never routable
        let config = ClientConfig::new()
            .with_client_id("unreachable")
            .with_connect_timeout(Duration::from_millis(200));
        let mut client = Client::new(config).unwrap();

        let started = std::time::Instant::now();
        assert!(client.connect("192.0.2.1", None, None).is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(client.state(), State::Disconnected);
    }
}
