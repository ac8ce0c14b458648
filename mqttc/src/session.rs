//! MQTT session state machine.
//!
//! A [`Session`] owns its transport and drives one connection through
//! `Disconnected -> Connecting -> Connected -> Disconnecting`. It never spawns
//! threads or blocks on reads: callers advance it by calling [`Session::pump`].

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::client::ClientConfig;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::v4::{self, Packet};
use crate::queue::MessageQueue;
use crate::topic::{validate_topic, validate_topic_filter};
use crate::transport::Transport;
use crate::types::{ConnectReturnCode, Event, Message, PacketType, QoS, State};

/// How often a blocking [`Session::connect`] polls for the CONNACK.
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Kind of request waiting for a broker acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKind {
    Subscribe,
    Unsubscribe,
}

#[derive(Debug, Clone, Copy)]
struct PendingAck {
    kind: AckKind,
    sent_at: Instant,
}

/// One client's protocol state over an exclusively owned transport.
pub struct Session<T: Transport> {
    client_id: String,
    state: State,
    transport: T,
    queue: Arc<MessageQueue>,

    keep_alive: u16,
    clean_session: bool,
    connect_timeout: Duration,
    ack_timeout: Duration,
    ping_timeout: Duration,
    max_packet_size: usize,

    next_pkid: u16,
    pending: HashMap<u16, PendingAck>,
    read_buf: BytesMut,

    connect_started: Option<Instant>,
    last_outbound: Instant,
    ping_sent_at: Option<Instant>,

    connection_lost: bool,
    events: Vec<Event>,
}

impl<T: Transport> Session<T> {
    /// Create a disconnected session.
    ///
    /// The client id is taken from `config` or generated. Fails with
    /// [`Error::InvalidConfig`] before touching the transport.
    pub fn new(config: &ClientConfig, transport: T, queue: Arc<MessageQueue>) -> Result<Self> {
        config.validate()?;
        let client_id = config.resolve_client_id();

        Ok(Self {
            client_id,
            state: State::Disconnected,
            transport,
            queue,
            keep_alive: config.keep_alive,
            clean_session: config.clean_session,
            connect_timeout: config.connect_timeout(),
            ack_timeout: config.ack_timeout(),
            ping_timeout: config.ping_timeout(),
            max_packet_size: config.max_packet_size,
            next_pkid: 1,
            pending: HashMap::new(),
            read_buf: BytesMut::with_capacity(4096),
            connect_started: None,
            last_outbound: Instant::now(),
            ping_sent_at: None,
            connection_lost: false,
            events: Vec::new(),
        })
    }

    // ========================================================================
    // Observers
    // ========================================================================

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    /// Whether the last connection (or connection attempt, including a failed
    /// transport open) ended in an error rather than a local `disconnect`.
    ///
    /// Cleared by the next `begin_connect`.
    pub fn connection_lost(&self) -> bool {
        self.connection_lost
    }

    /// Number of SUBSCRIBE / UNSUBSCRIBE requests still awaiting an ack.
    pub fn pending_acks(&self) -> usize {
        self.pending.len()
    }

    /// Take all advisory events recorded since the last call.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Queue receiving inbound messages.
    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// When an in-progress connect gives up waiting for CONNACK.
    pub fn connect_deadline(&self) -> Option<Instant> {
        match self.state {
            State::Connecting => self.connect_started.map(|t| t + self.connect_timeout),
            _ => None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Connect and wait (blocking) for CONNACK, at most `connect_timeout`.
    pub fn connect(
        &mut self,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        self.begin_connect(host, port, username, password)?;

        loop {
            self.pump()?;
            match self.state {
                State::Connected => return Ok(()),
                State::Connecting => thread::sleep(CONNECT_POLL_INTERVAL),
                // pump reports every way out of Connecting as an error
                _ => return Err(Error::NotConnected),
            }
        }
    }

    /// Open the transport and send CONNECT without waiting for CONNACK.
    ///
    /// On success the session is `Connecting`; keep calling [`pump`](Self::pump)
    /// until it becomes `Connected` or an error is returned.
    pub fn begin_connect(
        &mut self,
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        if self.state != State::Disconnected {
            return Err(Error::InvalidState(format!("connect while {}", self.state)));
        }

        // Oversized client id or credentials fail here, before any I/O.
        let connect = v4::create_connect(
            &self.client_id,
            username,
            password.map(str::as_bytes),
            self.keep_alive,
            self.clean_session,
        );
        let bytes = connect.encode(self.max_packet_size)?;

        debug!("Connecting to {}:{} as {} (MQTT 3.1.1)", host, port, self.client_id);

        self.read_buf.clear();
        self.pending.clear();
        self.ping_sent_at = None;
        self.connection_lost = false;

        if let Err(e) = self.transport.open(host, port, self.connect_timeout) {
            warn!("Failed to open transport to {}:{}: {}", host, port, e);
            self.transport.close();
            self.connection_lost = true;
            return Err(e.into());
        }

        let now = Instant::now();
        self.state = State::Connecting;
        self.connect_started = Some(now);
        self.send_encoded(PacketType::Connect, &bytes, now)
    }

    /// Gracefully end the connection. Always leaves the session `Disconnected`.
    pub fn disconnect(&mut self) {
        match self.state {
            State::Disconnected => return,
            State::Connected => {
                self.state = State::Disconnecting;
                let result = Packet::Disconnect
                    .encode(self.max_packet_size)
                    .and_then(|bytes| self.transport.send(&bytes).map_err(Error::from));
                if let Err(e) = result {
                    debug!("Failed to send DISCONNECT: {}", e);
                }
                debug!("Disconnected {}", self.client_id);
            }
            State::Connecting | State::Disconnecting => {
                debug!("Aborting connection for {}", self.client_id);
            }
        }

        self.transport.close();
        self.reset_connection();
    }

    // ========================================================================
    // Outbound operations
    // ========================================================================

    /// Publish a QoS 0 message.
    pub fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        self.ensure_connected()?;
        validate_topic(topic)?;
        if qos != QoS::AtMostOnce {
            return Err(ProtocolError::UnsupportedQoS(qos as u8).into());
        }

        trace!("Publishing {} bytes to {}", payload.len(), topic);
        self.send_packet(&v4::create_publish(topic, payload, retain), Instant::now())
    }

    /// Subscribe to a topic filter. Returns the packet id awaiting SUBACK.
    pub fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<u16> {
        self.ensure_connected()?;
        validate_topic_filter(filter)?;
        if qos != QoS::AtMostOnce {
            return Err(ProtocolError::UnsupportedQoS(qos as u8).into());
        }

        let pkid = self.allocate_pkid()?;
        debug!("Subscribing to {} (pkid {})", filter, pkid);
        self.send_tracked(&v4::create_subscribe(pkid, &[(filter, qos)]), pkid, AckKind::Subscribe)
    }

    /// Unsubscribe from a topic filter. Returns the packet id awaiting UNSUBACK.
    pub fn unsubscribe(&mut self, filter: &str) -> Result<u16> {
        self.ensure_connected()?;
        validate_topic_filter(filter)?;

        let pkid = self.allocate_pkid()?;
        debug!("Unsubscribing from {} (pkid {})", filter, pkid);
        self.send_tracked(&v4::create_unsubscribe(pkid, &[filter]), pkid, AckKind::Unsubscribe)
    }

    // ========================================================================
    // Inbound processing
    // ========================================================================

    /// Advance the protocol once without blocking.
    pub fn pump(&mut self) -> Result<()> {
        self.pump_at(Instant::now())
    }

    /// [`pump`](Self::pump) with an explicit clock, for deterministic timers.
    pub fn pump_at(&mut self, now: Instant) -> Result<()> {
        if !matches!(self.state, State::Connecting | State::Connected) {
            return Ok(());
        }

        match self.transport.receive_available() {
            Ok(bytes) => {
                if !bytes.is_empty() {
                    trace!("Received {} bytes", bytes.len());
                    self.read_buf.extend_from_slice(&bytes);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(self.fail(Error::ConnectionClosed));
            }
            Err(e) => return Err(self.fail(e.into())),
        }

        self.process_read_buf(now)?;
        self.expire_pending(now);

        match self.state {
            State::Connecting => self.check_connect_timeout(now),
            State::Connected => self.keep_alive_tick(now),
            _ => Ok(()),
        }
    }

    fn process_read_buf(&mut self, now: Instant) -> Result<()> {
        while matches!(self.state, State::Connecting | State::Connected) {
            let (packet, consumed) = match Packet::read(&self.read_buf, self.max_packet_size) {
                Ok(Some(decoded)) => decoded,
                Ok(None) => return Ok(()),
                Err(e) => return Err(self.fail(e)),
            };
            let _ = self.read_buf.split_to(consumed);

            trace!("Received {:?}", packet.packet_type());
            if let Err(e) = self.handle_packet(packet, now) {
                return Err(self.fail(e));
            }
        }
        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet, now: Instant) -> Result<()> {
        match (self.state, packet) {
            (State::Connecting, Packet::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Accepted {
                    warn!("Connection rejected for {}: {}", self.client_id, ack.code);
                    return Err(Error::ConnectRejected(ack.code));
                }
                debug!("Connected as {} (session present: {})", self.client_id, ack.session_present);
                self.state = State::Connected;
                self.connect_started = None;
                self.last_outbound = now;
                Ok(())
            }
            (State::Connected, Packet::Publish(publish)) => {
                trace!("Message on {} ({} bytes)", publish.topic, publish.payload.len());
                self.queue.push(Message {
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                });
                Ok(())
            }
            (State::Connected, Packet::SubAck(ack)) => {
                if self.take_pending(ack.pkid, AckKind::Subscribe) {
                    self.events.push(Event::SubAck {
                        pkid: ack.pkid,
                        return_codes: ack.return_codes.iter().map(|c| c.to_u8()).collect(),
                    });
                }
                Ok(())
            }
            (State::Connected, Packet::UnsubAck(ack)) => {
                if self.take_pending(ack.pkid, AckKind::Unsubscribe) {
                    self.events.push(Event::UnsubAck { pkid: ack.pkid });
                }
                Ok(())
            }
            (State::Connected, Packet::PingResp) => {
                self.ping_sent_at = None;
                Ok(())
            }
            (_, Packet::Disconnect) => Err(Error::ConnectionClosed),
            (state, packet) => {
                warn!("Unexpected {:?} while {}", packet.packet_type(), state);
                Err(ProtocolError::MalformedPacket("unexpected packet from broker").into())
            }
        }
    }

    fn take_pending(&mut self, pkid: u16, kind: AckKind) -> bool {
        match self.pending.get(&pkid) {
            Some(entry) if entry.kind == kind => {
                self.pending.remove(&pkid);
                true
            }
            _ => {
                // late ack after timeout eviction, or a broker bug
                debug!("Ignoring {:?} ack for unknown pkid {}", kind, pkid);
                false
            }
        }
    }

    fn expire_pending(&mut self, now: Instant) {
        let ack_timeout = self.ack_timeout;
        let mut expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.sent_at) >= ack_timeout)
            .map(|(&pkid, _)| pkid)
            .collect();
        expired.sort_unstable();

        for pkid in expired {
            self.pending.remove(&pkid);
            warn!("No acknowledgement for pkid {} within {:?}", pkid, ack_timeout);
            self.events.push(Event::AckTimeout { pkid });
        }
    }

    fn check_connect_timeout(&mut self, now: Instant) -> Result<()> {
        match self.connect_started {
            Some(started) if now.saturating_duration_since(started) >= self.connect_timeout => {
                let err = Error::Timeout(format!("no CONNACK within {:?}", self.connect_timeout));
                Err(self.fail(err))
            }
            _ => Ok(()),
        }
    }

    fn keep_alive_tick(&mut self, now: Instant) -> Result<()> {
        if self.keep_alive == 0 {
            return Ok(());
        }

        if let Some(sent) = self.ping_sent_at {
            if now.saturating_duration_since(sent) >= self.ping_timeout {
                let err = Error::Timeout(format!("no PINGRESP within {:?}", self.ping_timeout));
                return Err(self.fail(err));
            }
            return Ok(());
        }

        let interval = Duration::from_secs(self.keep_alive as u64);
        if now.saturating_duration_since(self.last_outbound) >= interval {
            trace!("Sending PINGREQ");
            self.send_packet(&Packet::PingReq, now)?;
            self.ping_sent_at = Some(now);
        }
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn ensure_connected(&self) -> Result<()> {
        if self.state == State::Connected {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Next free non-zero packet id.
    fn allocate_pkid(&mut self) -> Result<u16> {
        for _ in 0..u16::MAX {
            let pkid = self.next_pkid;
            self.next_pkid = if pkid == u16::MAX { 1 } else { pkid + 1 };
            if !self.pending.contains_key(&pkid) {
                return Ok(pkid);
            }
        }
        Err(Error::InvalidState("all packet identifiers in use".to_string()))
    }

    fn send_tracked(&mut self, packet: &Packet, pkid: u16, kind: AckKind) -> Result<u16> {
        let now = Instant::now();
        self.send_packet(packet, now)?;
        self.pending.insert(pkid, PendingAck { kind, sent_at: now });
        Ok(pkid)
    }

    /// Encode and send. Once connected, encoding errors leave the connection
    /// intact; transport errors always tear it down.
    fn send_packet(&mut self, packet: &Packet, now: Instant) -> Result<()> {
        let bytes = match packet.encode(self.max_packet_size) {
            Ok(bytes) => bytes,
            Err(e) if self.state == State::Connecting => return Err(self.fail(e)),
            Err(e) => return Err(e),
        };
        self.send_encoded(packet.packet_type(), &bytes, now)
    }

    fn send_encoded(&mut self, packet_type: PacketType, bytes: &[u8], now: Instant) -> Result<()> {
        if let Err(e) = self.transport.send(bytes) {
            return Err(self.fail(e.into()));
        }
        trace!("Sent {:?} ({} bytes)", packet_type, bytes.len());
        self.last_outbound = now;
        Ok(())
    }

    /// Drop the connection after `err`, returning `err` for propagation.
    fn fail(&mut self, err: Error) -> Error {
        if self.state == State::Disconnected {
            return err;
        }

        if self.state == State::Connected {
            warn!("Connection lost for {}: {}", self.client_id, err);
            self.events.push(Event::ConnectionLost { reason: err.to_string() });
        } else {
            debug!("Connection attempt for {} failed: {}", self.client_id, err);
        }
        self.connection_lost = true;

        self.transport.close();
        self.reset_connection();
        err
    }

    fn reset_connection(&mut self) {
        self.state = State::Disconnected;
        self.pending.clear();
        self.read_buf.clear();
        self.connect_started = None;
        self.ping_sent_at = None;
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        self.disconnect();
        self.transport.close();
    }
}
