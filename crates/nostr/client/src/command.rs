//! Aggregation of per-relay publish results.

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::relay_url::RelayUrl;

/// One relay's answer to a published event. Timeouts and resets are reported
/// as rejections with an `error: client ...` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAck {
    pub relay: RelayUrl,
    pub event_id: String,
    pub accepted: bool,
    pub message: String,
}

pub type ResultCallback = Box<dyn FnMut(&CommandAck) + Send>;
pub type CompleteCallback = Box<dyn FnOnce(Vec<CommandAck>) + Send>;

/// Options for [`RelayPool::publish`](crate::RelayPool::publish).
#[derive(Default)]
pub struct PublishOptions {
    /// Restrict publishing to these relays. Unregistered URLs are ignored.
    pub relays: Option<Vec<RelayUrl>>,
    /// Falls back to the pool's `publish_timeout`.
    pub timeout: Option<Duration>,
    on_result: Option<ResultCallback>,
    on_complete: Option<CompleteCallback>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options whose aggregated results arrive on a oneshot channel.
    pub fn completion() -> (Self, oneshot::Receiver<Vec<CommandAck>>) {
        let (tx, rx) = oneshot::channel();
        let options = Self::new().on_complete(move |results| {
            let _ = tx.send(results);
        });
        (options, rx)
    }

    /// Options that stream every result to a channel as it arrives.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CommandAck>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = Self::new().on_result(move |ack| {
            let _ = tx.send(ack.clone());
        });
        (options, rx)
    }

    pub fn relays(mut self, relays: impl IntoIterator<Item = RelayUrl>) -> Self {
        self.relays = Some(relays.into_iter().collect());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn on_result(mut self, callback: impl FnMut(&CommandAck) + Send + 'static) -> Self {
        self.on_result = Some(Box::new(callback));
        self
    }

    pub fn on_complete(mut self, callback: impl FnOnce(Vec<CommandAck>) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }
}

/// Tracks which target relays still owe an answer for one published event.
pub struct CommandTracker {
    waiting: HashSet<RelayUrl>,
    results: Vec<CommandAck>,
    on_result: Option<ResultCallback>,
    on_complete: Option<CompleteCallback>,
}

impl CommandTracker {
    pub fn new(targets: impl IntoIterator<Item = RelayUrl>, options: PublishOptions) -> Self {
        Self {
            waiting: targets.into_iter().collect(),
            results: Vec::new(),
            on_result: options.on_result,
            on_complete: options.on_complete,
        }
    }

    pub fn has_completed(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Record one relay's answer. Answers from relays that are not (or no
    /// longer) awaited are ignored.
    pub fn consume_result(&mut self, ack: CommandAck) {
        if !self.waiting.remove(&ack.relay) {
            return;
        }

        if let Some(on_result) = self.on_result.as_mut() {
            on_result(&ack);
        }
        self.results.push(ack);

        if self.has_completed()
            && let Some(on_complete) = self.on_complete.take()
        {
            on_complete(std::mem::take(&mut self.results));
        }
    }
}
