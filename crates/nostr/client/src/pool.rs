//! Relay pool for multi-relay fanout.
//!
//! [`RelayPool`] is a cheap, cloneable handle. All state (connections,
//! subscription and command trackers, plugins) lives in one driver task, so
//! nothing is shared between threads and no locks are taken. Handles talk to
//! the driver with [`PoolCommand`]s; connections, timers and transport pumps
//! report through [`Signal`]s.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use nostr::Event;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::command::{CommandAck, CommandTracker, PublishOptions};
use crate::error::{ClientError, Result};
use crate::plugin::{Plugin, PluginRegistry};
use crate::relay::{
    ConnectionSignal, ConnectionState, RelayConfig, RelayConnection, RelayEvent, RelayPermission,
};
use crate::relay_url::RelayUrl;
use crate::subscription::{ReceivedEvent, SubscribeOptions, SubscriptionTracker};
use crate::timer::{Scheduler, TimerHandle};
use crate::transport::{Transport, WebSocketTransport};

/// Relay pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Relay configuration template used by [`RelayPool::add_relay`].
    pub relay_config: RelayConfig,
    /// Default time a relay gets to answer a publish.
    pub publish_timeout: Duration,
    /// Default time a relay gets to report EOSE.
    pub eose_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relay_config: RelayConfig::default(),
            publish_timeout: Duration::from_secs(5),
            eose_timeout: Duration::from_secs(5),
        }
    }
}

/// Point-in-time view of one registered relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub url: RelayUrl,
    pub state: ConnectionState,
    pub readable: bool,
    pub writable: bool,
}

/// Everything that wakes the driver besides handle commands.
#[derive(Debug)]
pub(crate) enum Signal {
    Connection {
        url: RelayUrl,
        signal: ConnectionSignal,
    },
    Pool(PoolSignal),
}

#[derive(Debug)]
pub(crate) enum PoolSignal {
    BufferFlush { subscription_id: String, token: u64 },
    HealthyWaitExpired { watcher_id: u64, token: u64 },
    InitialEose { subscription_id: String },
}

enum PoolCommand {
    AddConnection {
        connection: Box<RelayConnection>,
        reply: oneshot::Sender<bool>,
    },
    RemoveRelay {
        url: RelayUrl,
        reply: oneshot::Sender<bool>,
    },
    WaitHealthy {
        count: usize,
        timeout: Duration,
        reply: oneshot::Sender<bool>,
    },
    Publish {
        event: Box<Event>,
        options: PublishOptions,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        options: SubscribeOptions,
        reply: oneshot::Sender<Result<String>>,
    },
    Unsubscribe {
        subscription_id: String,
        reply: oneshot::Sender<()>,
    },
    UpdatePermission {
        url: RelayUrl,
        permission: RelayPermission,
        reply: oneshot::Sender<Result<()>>,
    },
    Relays {
        reply: oneshot::Sender<Vec<RelayStatus>>,
    },
    InstallPlugin {
        plugin: Box<dyn Plugin>,
        reply: oneshot::Sender<Result<()>>,
    },
    UninstallPlugin {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Multiplexing handle over many relays.
///
/// Creating a pool spawns its driver, so it must happen inside a tokio
/// runtime. The driver stops on [`RelayPool::shutdown`] or once every handle
/// is dropped; a plugin keeping the handle it was installed with keeps the
/// driver alive until it is uninstalled.
#[derive(Clone)]
pub struct RelayPool {
    commands: mpsc::UnboundedSender<PoolCommand>,
    config: Arc<PoolConfig>,
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPool")
            .field("config", &self.config)
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

impl RelayPool {
    /// Create new relay pool speaking WebSocket.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_transport(config, Arc::new(WebSocketTransport))
    }

    /// Create a relay pool over a custom transport.
    pub fn with_transport(config: PoolConfig, transport: Arc<dyn Transport>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let config = Arc::new(config);

        let driver = PoolDriver {
            config: Arc::clone(&config),
            transport,
            scheduler: Scheduler::new(signal_tx),
            commands: commands.downgrade(),
            relays: BTreeMap::new(),
            subs: HashMap::new(),
            sub_seq: 1,
            cmds: HashMap::new(),
            healthy_watchers: HashMap::new(),
            next_watcher_id: 1,
            plugins: PluginRegistry::default(),
        };
        tokio::spawn(driver.run(command_rx, signal_rx));

        Self { commands, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> PoolCommand) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| ClientError::PoolClosed)?;
        response.await.map_err(|_| ClientError::PoolClosed)
    }

    /// Register a connection and start connecting. Returns `false` when a
    /// connection with the same URL is already registered.
    pub async fn add_connection(&self, connection: RelayConnection) -> Result<bool> {
        self.request(|reply| PoolCommand::AddConnection {
            connection: Box::new(connection),
            reply,
        })
        .await
    }

    /// Add relay URL to pool using the pool's relay configuration.
    pub async fn add_relay(&self, url: &str) -> Result<bool> {
        let connection = RelayConnection::with_config(url, self.config.relay_config.clone())?;
        self.add_connection(connection).await
    }

    /// Unregister a relay. Everything still pending on it gets its terminal
    /// EOSE or `error: client reset` result.
    pub async fn remove_relay(&self, url: &str) -> Result<bool> {
        let url = RelayUrl::parse(url)?;
        self.request(|reply| PoolCommand::RemoveRelay { url, reply })
            .await
    }

    /// Wait until at least `count` relays are open. Resolves `false` on timeout.
    pub async fn wait_until_healthy(&self, count: usize, timeout: Duration) -> Result<bool> {
        self.request(|reply| PoolCommand::WaitHealthy {
            count,
            timeout,
            reply,
        })
        .await
    }

    /// Verify `event` and publish it to every writable relay (or the subset
    /// named in `options`). Results arrive through the option callbacks.
    pub async fn publish(&self, event: Event, options: PublishOptions) -> Result<()> {
        self.request(|reply| PoolCommand::Publish {
            event: Box::new(event),
            options,
            reply,
        })
        .await?
    }

    /// Start a subscription on every open, readable relay. Returns its id.
    pub async fn subscribe(&self, options: SubscribeOptions) -> Result<String> {
        self.request(|reply| PoolCommand::Subscribe { options, reply })
            .await?
    }

    /// Close a subscription on every relay and flush its buffered events.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let subscription_id = subscription_id.to_string();
        self.request(|reply| PoolCommand::Unsubscribe {
            subscription_id,
            reply,
        })
        .await
    }

    pub async fn update_permission(&self, url: &str, permission: RelayPermission) -> Result<()> {
        let url = RelayUrl::parse(url)?;
        self.request(|reply| PoolCommand::UpdatePermission {
            url,
            permission,
            reply,
        })
        .await?
    }

    pub async fn relays(&self) -> Result<Vec<RelayStatus>> {
        self.request(|reply| PoolCommand::Relays { reply }).await
    }

    pub async fn healthy_count(&self) -> Result<usize> {
        Ok(self
            .relays()
            .await?
            .iter()
            .filter(|status| status.state == ConnectionState::Open)
            .count())
    }

    pub async fn install_plugin(&self, plugin: impl Plugin) -> Result<()> {
        self.request(|reply| PoolCommand::InstallPlugin {
            plugin: Box::new(plugin),
            reply,
        })
        .await?
    }

    pub async fn uninstall_plugin(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.request(|reply| PoolCommand::UninstallPlugin { id, reply })
            .await
    }

    /// Terminate every relay, uninstall plugins and stop the driver.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| PoolCommand::Shutdown { reply }).await
    }
}

struct HealthyWatcher {
    count: usize,
    reply: oneshot::Sender<bool>,
    timer: TimerHandle,
}

struct PoolDriver {
    config: Arc<PoolConfig>,
    transport: Arc<dyn Transport>,
    scheduler: Scheduler,
    commands: mpsc::WeakUnboundedSender<PoolCommand>,
    relays: BTreeMap<RelayUrl, RelayConnection>,
    subs: HashMap<String, SubscriptionTracker>,
    sub_seq: u64,
    cmds: HashMap<String, CommandTracker>,
    healthy_watchers: HashMap<u64, HealthyWatcher>,
    next_watcher_id: u64,
    plugins: PluginRegistry,
}

impl PoolDriver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PoolCommand>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) {
        debug!("relay pool driver started");
        loop {
            tokio::select! {
                biased;
                Some(signal) = signals.recv() => self.on_signal(signal),
                command = commands.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    if !self.on_command(command) {
                        break;
                    }
                }
            }
        }
        self.shutdown();
        debug!("relay pool driver stopped");
    }

    /// Returns `false` when the driver should stop.
    fn on_command(&mut self, command: PoolCommand) -> bool {
        match command {
            PoolCommand::AddConnection { connection, reply } => {
                let _ = reply.send(self.add_connection(*connection));
            }
            PoolCommand::RemoveRelay { url, reply } => {
                let _ = reply.send(self.remove_relay(&url));
            }
            PoolCommand::WaitHealthy {
                count,
                timeout,
                reply,
            } => self.wait_until_healthy(count, timeout, reply),
            PoolCommand::Publish {
                event,
                options,
                reply,
            } => {
                let _ = reply.send(self.publish(*event, options));
            }
            PoolCommand::Subscribe { options, reply } => {
                let _ = reply.send(self.subscribe(options));
            }
            PoolCommand::Unsubscribe {
                subscription_id,
                reply,
            } => {
                self.unsubscribe(&subscription_id);
                let _ = reply.send(());
            }
            PoolCommand::UpdatePermission {
                url,
                permission,
                reply,
            } => {
                let result = match self.relays.get_mut(&url) {
                    Some(connection) => {
                        connection.update_permission(permission);
                        Ok(())
                    }
                    None => Err(ClientError::UnknownRelay(url.to_string())),
                };
                self.dispatch(&url);
                let _ = reply.send(result);
            }
            PoolCommand::Relays { reply } => {
                let _ = reply.send(self.relay_statuses());
            }
            PoolCommand::InstallPlugin { plugin, reply } => {
                let result = match self.commands.upgrade() {
                    Some(commands) => {
                        let pool = RelayPool {
                            commands,
                            config: Arc::clone(&self.config),
                        };
                        self.plugins.install(plugin, pool);
                        Ok(())
                    }
                    None => Err(ClientError::PoolClosed),
                };
                let _ = reply.send(result);
            }
            PoolCommand::UninstallPlugin { id, reply } => {
                let _ = reply.send(self.plugins.uninstall(&id));
            }
            PoolCommand::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn on_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Connection { url, signal } => {
                if let Some(connection) = self.relays.get_mut(&url) {
                    connection.handle(signal);
                    self.dispatch(&url);
                }
            }
            Signal::Pool(PoolSignal::BufferFlush {
                subscription_id,
                token,
            }) => {
                if let Some(tracker) = self.subs.get_mut(&subscription_id) {
                    tracker.on_flush_timer(token);
                }
            }
            Signal::Pool(PoolSignal::HealthyWaitExpired { watcher_id, token }) => {
                let armed = self
                    .healthy_watchers
                    .get(&watcher_id)
                    .is_some_and(|watcher| watcher.timer.matches(token));
                if armed && let Some(watcher) = self.healthy_watchers.remove(&watcher_id) {
                    let _ = watcher.reply.send(false);
                }
            }
            Signal::Pool(PoolSignal::InitialEose { subscription_id }) => {
                if let Some(tracker) = self.subs.get_mut(&subscription_id) {
                    tracker.consume_initial_eose();
                }
            }
        }
    }

    /// Route everything a registered connection queued until it is quiet.
    fn dispatch(&mut self, url: &RelayUrl) {
        loop {
            let events = match self.relays.get_mut(url) {
                Some(connection) => connection.drain_events(),
                None => return,
            };
            if events.is_empty() {
                return;
            }
            self.route(url, events);
        }
    }

    fn route(&mut self, url: &RelayUrl, events: Vec<RelayEvent>) {
        for event in events {
            match event {
                RelayEvent::Healthy => self.on_relay_healthy(url),
                RelayEvent::Event(subscription_id, event) => {
                    self.plugins.on_inbound_event(&event, url);
                    if let Some(tracker) = self.subs.get_mut(&subscription_id) {
                        tracker.consume_event(ReceivedEvent {
                            relay: url.clone(),
                            subscription_id,
                            event,
                        });
                    }
                }
                RelayEvent::Eose(subscription_id) => {
                    if let Some(tracker) = self.subs.get_mut(&subscription_id) {
                        tracker.consume_eose(url);
                    }
                }
                RelayEvent::Ok(event_id, accepted, message) => {
                    let Some(tracker) = self.cmds.get_mut(&event_id) else {
                        continue;
                    };
                    tracker.consume_result(CommandAck {
                        relay: url.clone(),
                        event_id: event_id.clone(),
                        accepted,
                        message,
                    });
                    if tracker.has_completed() {
                        self.cmds.remove(&event_id);
                    }
                }
            }
        }
    }

    fn on_relay_healthy(&mut self, url: &RelayUrl) {
        let healthy = self.healthy_count();
        let satisfied: Vec<u64> = self
            .healthy_watchers
            .iter()
            .filter(|(_, watcher)| healthy >= watcher.count)
            .map(|(id, _)| *id)
            .collect();
        for id in satisfied {
            if let Some(watcher) = self.healthy_watchers.remove(&id) {
                let _ = watcher.reply.send(true);
            }
        }

        let Some(connection) = self.relays.get_mut(url) else {
            return;
        };
        if !connection.is_readable() {
            return;
        }

        // Resume subscriptions that are already running on other relays.
        for (subscription_id, tracker) in &mut self.subs {
            let filters = tracker.recovery_filters(url);
            if filters.is_empty() {
                continue;
            }
            if let Err(error) = connection.request(subscription_id, filters, tracker.eose_timeout())
            {
                warn!("[{}] failed to resume {}: {}", url, subscription_id, error);
            }
        }
    }

    fn add_connection(&mut self, mut connection: RelayConnection) -> bool {
        let url = connection.url().clone();
        if self.relays.contains_key(&url) {
            return false;
        }

        debug!("[{}] added to pool", url);
        connection.attach(Arc::clone(&self.transport), self.scheduler.clone());
        connection.connect();
        self.relays.insert(url.clone(), connection);
        self.dispatch(&url);
        true
    }

    fn remove_relay(&mut self, url: &RelayUrl) -> bool {
        let Some(mut connection) = self.relays.remove(url) else {
            return false;
        };

        debug!("[{}] removed from pool", url);
        connection.terminate();
        let events = connection.drain_events();
        self.route(url, events);
        true
    }

    fn wait_until_healthy(&mut self, count: usize, timeout: Duration, reply: oneshot::Sender<bool>) {
        if self.healthy_count() >= count {
            let _ = reply.send(true);
            return;
        }

        let watcher_id = self.next_watcher_id;
        self.next_watcher_id += 1;
        let timer = self.scheduler.after(timeout, |token| {
            Signal::Pool(PoolSignal::HealthyWaitExpired { watcher_id, token })
        });
        self.healthy_watchers.insert(
            watcher_id,
            HealthyWatcher {
                count,
                reply,
                timer,
            },
        );
    }

    fn publish(&mut self, event: Event, options: PublishOptions) -> Result<()> {
        let targets: Vec<RelayUrl> = self
            .relays
            .values()
            .filter(|connection| {
                connection.is_writable()
                    && options
                        .relays
                        .as_ref()
                        .is_none_or(|urls| urls.contains(connection.url()))
            })
            .map(|connection| connection.url().clone())
            .collect();
        if targets.is_empty() {
            return Err(ClientError::NoPublishTargets);
        }

        event.verify()?;

        let timeout = options.timeout.unwrap_or(self.config.publish_timeout);
        self.cmds.insert(
            event.id.clone(),
            CommandTracker::new(targets.iter().cloned(), options),
        );
        for url in &targets {
            if let Some(connection) = self.relays.get_mut(url)
                && let Err(error) = connection.publish(&event, timeout)
            {
                warn!("[{}] failed to publish {}: {}", url, event.id, error);
            }
        }

        self.plugins.on_publish(&event);
        Ok(())
    }

    fn subscribe(&mut self, mut options: SubscribeOptions) -> Result<String> {
        if options.filters.is_empty() {
            return Err(ClientError::InvalidRequest(
                "subscription needs at least one filter".to_string(),
            ));
        }

        let subscription_id = match options.id.take() {
            Some(id) => id,
            None => {
                let id = format!("__sub:{}", self.sub_seq);
                self.sub_seq += 1;
                id
            }
        };
        if self.subs.contains_key(&subscription_id) {
            return Err(ClientError::DuplicateSubscription(subscription_id));
        }

        let initial: Vec<RelayUrl> = self
            .relays
            .values()
            .filter(|connection| connection.is_healthy() && connection.is_readable())
            .map(|connection| connection.url().clone())
            .collect();
        let eose_timeout = options.eose_timeout.unwrap_or(self.config.eose_timeout);
        let tracker = SubscriptionTracker::new(
            subscription_id.clone(),
            initial.clone(),
            options,
            eose_timeout,
            self.scheduler.clone(),
        );

        for filter in tracker.filters() {
            self.plugins.on_filter_request(filter);
        }
        for url in &initial {
            if let Some(connection) = self.relays.get_mut(url)
                && let Err(error) =
                    connection.request(&subscription_id, tracker.filters().to_vec(), eose_timeout)
            {
                warn!("[{}] failed to request {}: {}", url, subscription_id, error);
            }
        }

        self.subs.insert(subscription_id.clone(), tracker);
        Ok(subscription_id)
    }

    fn unsubscribe(&mut self, subscription_id: &str) {
        for connection in self.relays.values_mut() {
            connection.close(subscription_id);
        }
        if let Some(mut tracker) = self.subs.remove(subscription_id) {
            tracker.unsubscribe();
        }
    }

    fn healthy_count(&self) -> usize {
        self.relays
            .values()
            .filter(|connection| connection.is_healthy())
            .count()
    }

    fn relay_statuses(&self) -> Vec<RelayStatus> {
        self.relays
            .values()
            .map(|connection| RelayStatus {
                url: connection.url().clone(),
                state: connection.state(),
                readable: connection.is_readable(),
                writable: connection.is_writable(),
            })
            .collect()
    }

    fn shutdown(&mut self) {
        let urls: Vec<RelayUrl> = self.relays.keys().cloned().collect();
        for url in urls {
            self.remove_relay(&url);
        }
        for (_, watcher) in self.healthy_watchers.drain() {
            let _ = watcher.reply.send(false);
        }
        for (_, mut tracker) in self.subs.drain() {
            tracker.unsubscribe();
        }
        self.plugins.uninstall_all();
    }
}
