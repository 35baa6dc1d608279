//! Single relay connection management.
//!
//! A [`RelayConnection`] is a state machine driven by the pool driver. It
//! never blocks: transport work and timers run as background tasks that
//! report back through [`ConnectionSignal`]s, and everything the connection
//! wants to tell the pool is queued as a [`RelayEvent`] until the driver
//! drains it.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use nostr::{Event, Filter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, RelayMessage, parse_relay_message};
use crate::pool::Signal;
use crate::relay_url::RelayUrl;
use crate::timer::{Scheduler, TimerHandle};
use crate::transport::{Transport, TransportChannel, TransportFrame};

pub(crate) const CLIENT_TIMEOUT: &str = "error: client timeout";
pub(crate) const CLIENT_RESET: &str = "error: client reset";

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// Terminated; never reconnects.
    Closed,
}

/// Relay connection configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Subscriptions are only sent to readable relays.
    pub read: bool,
    /// Events are only published to writable relays.
    pub write: bool,
    pub connect_timeout: Duration,
    /// Period of the reconnect/liveness watchdog. Zero disables it.
    pub watchdog_interval: Duration,
    /// How long an open connection may stay silent before the watchdog resets it.
    pub keep_alive_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read: true,
            write: true,
            connect_timeout: Duration::from_secs(2),
            watchdog_interval: Duration::from_secs(60),
            keep_alive_timeout: Duration::from_secs(60),
        }
    }
}

/// Permission change; `None` leaves a flag untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayPermission {
    pub read: Option<bool>,
    pub write: Option<bool>,
}

/// Messages from background tasks and timers to one connection.
#[derive(Debug)]
pub(crate) enum ConnectionSignal {
    Opened {
        generation: u64,
        channel: TransportChannel,
    },
    ConnectFailed {
        generation: u64,
        error: String,
    },
    Frame {
        generation: u64,
        frame: InboundFrame,
    },
    ConnectTimeout {
        token: u64,
    },
    Watchdog {
        token: u64,
    },
    EoseTimeout {
        subscription_id: String,
        token: u64,
    },
    PublishTimeout {
        event_id: String,
        token: u64,
    },
}

/// A transport frame after parsing and verification.
#[derive(Debug)]
pub(crate) enum InboundFrame {
    Message(RelayMessage),
    Invalid(String),
    Heartbeat,
    Closed(Option<String>),
}

/// What a connection reports to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RelayEvent {
    Healthy,
    Event(String, Event),
    Eose(String),
    Ok(String, bool, String),
}

struct Attachment {
    transport: Arc<dyn Transport>,
    scheduler: Scheduler,
}

struct Socket {
    outbound: mpsc::UnboundedSender<String>,
    pump: JoinHandle<()>,
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[derive(Debug)]
struct SubSlot {
    /// `None` once EOSE was delivered for this subscription.
    eose_timer: Option<TimerHandle>,
}

/// Relay connection.
pub struct RelayConnection {
    url: RelayUrl,
    config: RelayConfig,
    read: bool,
    write: bool,
    state: ConnectionState,
    generation: u64,
    attachment: Option<Attachment>,
    socket: Option<Socket>,
    connect_task: Option<JoinHandle<()>>,
    connect_timer: Option<TimerHandle>,
    watchdog: Option<TimerHandle>,
    keep_alive_at: Option<Instant>,
    subs: HashMap<String, SubSlot>,
    cmds: HashMap<String, TimerHandle>,
    outbox: VecDeque<RelayEvent>,
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.url)
            .field("state", &self.state)
            .field("read", &self.read)
            .field("write", &self.write)
            .finish_non_exhaustive()
    }
}

impl RelayConnection {
    /// Create a new relay connection with default config.
    pub fn new(url: &str) -> Result<Self> {
        Self::with_config(url, RelayConfig::default())
    }

    /// Create a new relay connection with custom config.
    pub fn with_config(url: &str, config: RelayConfig) -> Result<Self> {
        Ok(Self::from_url(RelayUrl::parse(url)?, config))
    }

    pub fn from_url(url: RelayUrl, config: RelayConfig) -> Self {
        Self {
            url,
            read: config.read,
            write: config.write,
            config,
            state: ConnectionState::Idle,
            generation: 0,
            attachment: None,
            socket: None,
            connect_task: None,
            connect_timer: None,
            watchdog: None,
            keep_alive_at: None,
            subs: HashMap::new(),
            cmds: HashMap::new(),
            outbox: VecDeque::new(),
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_readable(&self) -> bool {
        self.read
    }

    pub fn is_writable(&self) -> bool {
        self.write
    }

    pub fn is_healthy(&self) -> bool {
        self.state == ConnectionState::Open && self.socket.is_some()
    }

    fn may_be_dead(&self) -> bool {
        self.keep_alive_at
            .is_none_or(|at| at.elapsed() > self.config.keep_alive_timeout)
    }

    pub(crate) fn attach(&mut self, transport: Arc<dyn Transport>, scheduler: Scheduler) {
        self.attachment = Some(Attachment {
            transport,
            scheduler,
        });
    }

    pub(crate) fn drain_events(&mut self) -> Vec<RelayEvent> {
        self.outbox.drain(..).collect()
    }

    /// Start connecting. No-op unless idle.
    pub(crate) fn connect(&mut self) {
        if self.state != ConnectionState::Idle {
            return;
        }
        let Some(attachment) = &self.attachment else {
            debug!("[{}] connect requested before attaching to a pool", self.url);
            return;
        };
        let transport = Arc::clone(&attachment.transport);
        let scheduler = attachment.scheduler.clone();

        if self.watchdog.is_none() && !self.config.watchdog_interval.is_zero() {
            let url = self.url.clone();
            self.watchdog = Some(scheduler.every(self.config.watchdog_interval, move |token| {
                Signal::Connection {
                    url: url.clone(),
                    signal: ConnectionSignal::Watchdog { token },
                }
            }));
        }

        self.reset("before connect");
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        debug!("[{}] connecting", self.url);

        let generation = self.generation;
        let url = self.url.clone();
        let signals = scheduler.signals();
        self.connect_task = Some(tokio::spawn(async move {
            let signal = match transport.open(&url).await {
                Ok(channel) => ConnectionSignal::Opened {
                    generation,
                    channel,
                },
                Err(error) => ConnectionSignal::ConnectFailed {
                    generation,
                    error: error.to_string(),
                },
            };
            let _ = signals.send(Signal::Connection { url, signal });
        }));

        let url = self.url.clone();
        self.connect_timer = Some(scheduler.after(self.config.connect_timeout, |token| {
            Signal::Connection {
                url,
                signal: ConnectionSignal::ConnectTimeout { token },
            }
        }));
    }

    pub(crate) fn handle(&mut self, signal: ConnectionSignal) {
        match signal {
            ConnectionSignal::Opened {
                generation,
                channel,
            } => self.on_opened(generation, channel),
            ConnectionSignal::ConnectFailed { generation, error } => {
                if generation == self.generation && self.state == ConnectionState::Connecting {
                    warn!("[{}] WebSocket error: {}", self.url, error);
                    self.reset("connect error");
                }
            }
            ConnectionSignal::ConnectTimeout { token } => {
                let armed = self
                    .connect_timer
                    .as_ref()
                    .is_some_and(|timer| timer.matches(token));
                if armed && self.state == ConnectionState::Connecting {
                    warn!("[{}] connection timed out", self.url);
                    self.reset("timeout");
                }
            }
            ConnectionSignal::Frame { generation, frame } => {
                if generation == self.generation && self.state == ConnectionState::Open {
                    self.on_frame(frame);
                }
            }
            ConnectionSignal::Watchdog { token } => {
                if !self.watchdog.as_ref().is_some_and(|timer| timer.matches(token)) {
                    return;
                }
                if self.state == ConnectionState::Open && self.may_be_dead() {
                    self.reset("watchdog");
                }
                if self.state == ConnectionState::Idle {
                    debug!("[{}] reconnect by watchdog", self.url);
                    self.connect();
                }
            }
            ConnectionSignal::EoseTimeout {
                subscription_id,
                token,
            } => {
                let armed = self
                    .subs
                    .get(&subscription_id)
                    .and_then(|slot| slot.eose_timer.as_ref())
                    .is_some_and(|timer| timer.matches(token));
                if armed {
                    debug!("[{}] EOSE timed out: {}", self.url, subscription_id);
                    self.emit_eose(&subscription_id);
                }
            }
            ConnectionSignal::PublishTimeout { event_id, token } => {
                if self.cmds.get(&event_id).is_some_and(|timer| timer.matches(token)) {
                    self.emit_result(&event_id, false, CLIENT_TIMEOUT);
                }
            }
        }
    }

    fn on_opened(&mut self, generation: u64, channel: TransportChannel) {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            return;
        }
        let Some(attachment) = &self.attachment else {
            return;
        };

        self.connect_timer = None;
        self.connect_task = None;
        let TransportChannel { outbound, inbound } = channel;
        let pump = spawn_pump(
            self.url.clone(),
            generation,
            inbound,
            attachment.scheduler.signals(),
        );
        self.socket = Some(Socket { outbound, pump });
        self.state = ConnectionState::Open;
        debug!("[{}] open", self.url);

        self.keep_alived();
        self.outbox.push_back(RelayEvent::Healthy);
    }

    fn on_frame(&mut self, frame: InboundFrame) {
        self.keep_alived();
        match frame {
            InboundFrame::Message(RelayMessage::Event(subscription_id, event)) => {
                self.outbox
                    .push_back(RelayEvent::Event(subscription_id, event));
            }
            InboundFrame::Message(RelayMessage::Eose(subscription_id)) => {
                self.emit_eose(&subscription_id);
            }
            InboundFrame::Message(RelayMessage::Ok(event_id, accepted, message)) => {
                self.emit_result(&event_id, accepted, &message);
            }
            InboundFrame::Message(RelayMessage::Notice(message)) => {
                info!("[{}] received NOTICE, but it is NOT supported yet: {}", self.url, message);
            }
            InboundFrame::Invalid(reason) => {
                warn!("[{}] received {}", self.url, reason);
            }
            InboundFrame::Heartbeat => {}
            InboundFrame::Closed(reason) => {
                debug!(
                    "[{}] transport closed: {}",
                    self.url,
                    reason.as_deref().unwrap_or("no reason")
                );
                self.reset("ws close");
            }
        }
    }

    /// Change read/write permission. Revoking read closes every subscription
    /// and reports EOSE for those still waiting on it.
    pub(crate) fn update_permission(&mut self, permission: RelayPermission) {
        if let Some(read) = permission.read
            && read != self.read
        {
            self.read = read;
            if !read {
                let subscription_ids: Vec<String> = self.subs.keys().cloned().collect();
                for subscription_id in subscription_ids {
                    self.emit_eose(&subscription_id);
                    self.close(&subscription_id);
                }
            }
        }

        if let Some(write) = permission.write {
            self.write = write;
        }
    }

    /// Send an event. The caller is trusted to have verified it.
    pub(crate) fn publish(&mut self, event: &Event, timeout: Duration) -> Result<()> {
        if !self.write {
            return Err(ClientError::NotWritable(self.url.to_string()));
        }
        if self.cmds.contains_key(&event.id) {
            return Ok(());
        }
        let scheduler = self.scheduler()?;

        debug!("[{}] send event {}", self.url, event.id);
        let healthy = self.is_healthy();
        if healthy {
            self.send(&ClientMessage::Event(event.clone()));
        }

        let delay = if healthy { timeout } else { Duration::ZERO };
        let url = self.url.clone();
        let event_id = event.id.clone();
        let timer = scheduler.after(delay, |token| Signal::Connection {
            url,
            signal: ConnectionSignal::PublishTimeout { event_id, token },
        });
        self.cmds.insert(event.id.clone(), timer);
        Ok(())
    }

    /// Send REQ and start waiting for EOSE.
    pub(crate) fn request(
        &mut self,
        subscription_id: &str,
        filters: Vec<Filter>,
        eose_timeout: Duration,
    ) -> Result<()> {
        if !self.read {
            return Err(ClientError::NotReadable(self.url.to_string()));
        }
        if self.subs.contains_key(subscription_id) {
            return Ok(());
        }
        if !self.is_healthy() {
            return Err(ClientError::NotConnected(self.url.to_string()));
        }
        let scheduler = self.scheduler()?;

        debug!("[{}] send request: {}", self.url, subscription_id);
        self.send(&ClientMessage::Req(subscription_id.to_string(), filters));

        let url = self.url.clone();
        let sub = subscription_id.to_string();
        let timer = scheduler.after(eose_timeout, |token| Signal::Connection {
            url,
            signal: ConnectionSignal::EoseTimeout {
                subscription_id: sub,
                token,
            },
        });
        self.subs.insert(
            subscription_id.to_string(),
            SubSlot {
                eose_timer: Some(timer),
            },
        );
        Ok(())
    }

    /// Stop a subscription without reporting EOSE for it.
    pub(crate) fn close(&mut self, subscription_id: &str) {
        if !self.subs.contains_key(subscription_id) || self.socket.is_none() {
            return;
        }
        self.subs.remove(subscription_id);

        debug!("[{}] close subscription: {}", self.url, subscription_id);
        self.send(&ClientMessage::Close(subscription_id.to_string()));
    }

    /// Stop the watchdog and close for good.
    pub(crate) fn terminate(&mut self) {
        self.watchdog = None;
        self.reset("close");
        self.state = ConnectionState::Closed;
    }

    /// Drop the transport and report a terminal signal for everything in flight.
    /// The watchdog keeps running.
    fn reset(&mut self, reason: &str) {
        debug!("[{}] reset by {}", self.url, reason);

        self.generation += 1;
        self.socket = None;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.connect_timer = None;
        self.keep_alive_at = None;
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Idle;
        }

        let subs = std::mem::take(&mut self.subs);
        let cmds = std::mem::take(&mut self.cmds);
        for (subscription_id, slot) in subs {
            if slot.eose_timer.is_some() {
                self.outbox.push_back(RelayEvent::Eose(subscription_id));
            }
        }
        for event_id in cmds.into_keys() {
            self.outbox
                .push_back(RelayEvent::Ok(event_id, false, CLIENT_RESET.to_string()));
        }
    }

    fn keep_alived(&mut self) {
        self.keep_alive_at = Some(Instant::now());
    }

    fn emit_eose(&mut self, subscription_id: &str) {
        let Some(slot) = self.subs.get_mut(subscription_id) else {
            return;
        };
        if slot.eose_timer.take().is_some() {
            self.outbox
                .push_back(RelayEvent::Eose(subscription_id.to_string()));
        }
    }

    fn emit_result(&mut self, event_id: &str, accepted: bool, message: &str) {
        if self.cmds.remove(event_id).is_some() {
            self.outbox.push_back(RelayEvent::Ok(
                event_id.to_string(),
                accepted,
                message.to_string(),
            ));
        }
    }

    fn scheduler(&self) -> Result<Scheduler> {
        self.attachment
            .as_ref()
            .map(|attachment| attachment.scheduler.clone())
            .ok_or_else(|| ClientError::Connection(format!("{} is not attached to a pool", self.url)))
    }

    fn send(&self, message: &ClientMessage) {
        let Some(socket) = &self.socket else {
            return;
        };
        match message.to_json() {
            Ok(text) => {
                if socket.outbound.send(text).is_err() {
                    debug!("[{}] transport dropped outbound frame", self.url);
                }
            }
            Err(error) => warn!("[{}] failed to encode frame: {}", self.url, error),
        }
    }
}

fn spawn_pump(
    url: RelayUrl,
    generation: u64,
    mut inbound: mpsc::UnboundedReceiver<TransportFrame>,
    signals: mpsc::UnboundedSender<Signal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let (frame, last) = match inbound.recv().await {
                Some(TransportFrame::Text(text)) => {
                    let frame = match parse_relay_message(&text) {
                        Ok(Some(message)) => InboundFrame::Message(message),
                        Ok(None) => InboundFrame::Heartbeat,
                        Err(error) => InboundFrame::Invalid(error.to_string()),
                    };
                    (frame, false)
                }
                Some(TransportFrame::Heartbeat) => (InboundFrame::Heartbeat, false),
                Some(TransportFrame::Closed(reason)) => (InboundFrame::Closed(reason), true),
                None => (InboundFrame::Closed(None), true),
            };
            let signal = Signal::Connection {
                url: url.clone(),
                signal: ConnectionSignal::Frame { generation, frame },
            };
            if signals.send(signal).is_err() || last {
                break;
            }
        }
    })
}
