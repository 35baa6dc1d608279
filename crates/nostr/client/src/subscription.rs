//! Subscription management for receiving filtered events.
//!
//! One [`SubscriptionTracker`] exists per logical subscription. It knows which
//! relays still owe an EOSE, which relays have ever been sent its filters, and
//! buffers deliveries when asked to.

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nostr::{Event, Filter, FilterMatcher, matches_any};
use tokio::sync::mpsc;
use tracing::debug;

use crate::pool::{PoolSignal, Signal};
use crate::relay_url::RelayUrl;
use crate::timer::{Scheduler, TimerHandle};

/// An event delivered for a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEvent {
    pub relay: RelayUrl,
    pub subscription_id: String,
    pub event: Event,
}

/// Callback type for handling received events. Never called with an empty batch.
pub type EventCallback = Box<dyn FnMut(Vec<ReceivedEvent>) + Send>;

/// Called once, when every initial relay reported end of stored events.
pub type EoseCallback = Box<dyn FnOnce(&str) + Send>;

/// Decides what to send to a relay that became healthy. The flag is `true`
/// when the relay never received this subscription before.
pub type RecoveredCallback = Box<dyn FnMut(&RelayUrl, bool) -> Vec<Filter> + Send>;

/// Event batching. A zero `flush_interval` delivers every event on its own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferOptions {
    pub flush_interval: Duration,
    pub max_event_count: Option<usize>,
}

/// Update delivered by [`SubscribeOptions::channel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionUpdate {
    Events(Vec<ReceivedEvent>),
    Eose(String),
}

/// Options for [`RelayPool::subscribe`](crate::RelayPool::subscribe).
pub struct SubscribeOptions {
    pub id: Option<String>,
    pub filters: Vec<Filter>,
    pub buffer: BufferOptions,
    /// Falls back to the pool's `eose_timeout`.
    pub eose_timeout: Option<Duration>,
    on_event: EventCallback,
    on_eose: Option<EoseCallback>,
    on_recovered: Option<RecoveredCallback>,
}

impl SubscribeOptions {
    pub fn new(
        filters: Vec<Filter>,
        on_event: impl FnMut(Vec<ReceivedEvent>) + Send + 'static,
    ) -> Self {
        Self {
            id: None,
            filters,
            buffer: BufferOptions::default(),
            eose_timeout: None,
            on_event: Box::new(on_event),
            on_eose: None,
            on_recovered: None,
        }
    }

    /// Options that forward every delivery and the EOSE to a channel.
    pub fn channel(filters: Vec<Filter>) -> (Self, mpsc::UnboundedReceiver<SubscriptionUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let eose_tx = tx.clone();
        let options = Self::new(filters, move |events| {
            let _ = tx.send(SubscriptionUpdate::Events(events));
        })
        .on_eose(move |subscription_id| {
            let _ = eose_tx.send(SubscriptionUpdate::Eose(subscription_id.to_string()));
        });
        (options, rx)
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn on_eose(mut self, callback: impl FnOnce(&str) + Send + 'static) -> Self {
        self.on_eose = Some(Box::new(callback));
        self
    }

    pub fn on_recovered(
        mut self,
        callback: impl FnMut(&RelayUrl, bool) -> Vec<Filter> + Send + 'static,
    ) -> Self {
        self.on_recovered = Some(Box::new(callback));
        self
    }

    pub fn buffer(mut self, buffer: BufferOptions) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn eose_timeout(mut self, timeout: Duration) -> Self {
        self.eose_timeout = Some(timeout);
        self
    }
}

pub(crate) struct SubscriptionTracker {
    id: String,
    filters: Vec<Filter>,
    matchers: Vec<FilterMatcher>,
    eose_timeout: Duration,
    sent_filter_once: HashSet<RelayUrl>,
    eose_wait: HashSet<RelayUrl>,
    buffer: BufferOptions,
    buffered: Vec<ReceivedEvent>,
    flush_timer: Option<TimerHandle>,
    scheduler: Scheduler,
    on_event: EventCallback,
    on_eose: Option<EoseCallback>,
    on_recovered: Option<RecoveredCallback>,
}

impl SubscriptionTracker {
    /// Start tracking. With no initial relays, EOSE is posted right away and
    /// fires on a later driver step.
    pub(crate) fn new(
        id: String,
        initial_relays: Vec<RelayUrl>,
        options: SubscribeOptions,
        eose_timeout: Duration,
        scheduler: Scheduler,
    ) -> Self {
        let matchers = options.filters.iter().map(FilterMatcher::new).collect();
        let eose_wait: HashSet<RelayUrl> = initial_relays.iter().cloned().collect();
        if eose_wait.is_empty() {
            scheduler.post(Signal::Pool(PoolSignal::InitialEose {
                subscription_id: id.clone(),
            }));
        }

        Self {
            id,
            filters: options.filters,
            matchers,
            eose_timeout,
            sent_filter_once: initial_relays.into_iter().collect(),
            eose_wait,
            buffer: options.buffer,
            buffered: Vec::new(),
            flush_timer: None,
            scheduler,
            on_event: options.on_event,
            on_eose: options.on_eose,
            on_recovered: options.on_recovered,
        }
    }

    pub(crate) fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub(crate) fn eose_timeout(&self) -> Duration {
        self.eose_timeout
    }

    pub(crate) fn is_after_eose(&self) -> bool {
        self.eose_wait.is_empty()
    }

    /// Deliver an event if it still matches one of the filters.
    pub(crate) fn consume_event(&mut self, received: ReceivedEvent) {
        if !matches_any(&self.matchers, &received.event) {
            debug!(
                "subscription {} dropped non-matching event {} from {}",
                self.id, received.event.id, received.relay
            );
            return;
        }

        if self.buffer.flush_interval.is_zero() {
            (self.on_event)(vec![received]);
            return;
        }

        self.buffered.push(received);
        if self
            .buffer
            .max_event_count
            .is_some_and(|max| self.buffered.len() >= max)
        {
            self.flush();
            return;
        }

        if self.flush_timer.is_none() {
            let subscription_id = self.id.clone();
            self.flush_timer = Some(self.scheduler.after(self.buffer.flush_interval, |token| {
                Signal::Pool(PoolSignal::BufferFlush {
                    subscription_id,
                    token,
                })
            }));
        }
    }

    pub(crate) fn consume_eose(&mut self, relay: &RelayUrl) {
        if !self.eose_wait.remove(relay) {
            return;
        }
        if self.is_after_eose() {
            self.fire_eose();
        }
    }

    /// EOSE for a subscription that started without any relay.
    pub(crate) fn consume_initial_eose(&mut self) {
        if self.is_after_eose() {
            self.fire_eose();
        }
    }

    fn fire_eose(&mut self) {
        self.flush();
        if let Some(on_eose) = self.on_eose.take() {
            on_eose(&self.id);
        }
    }

    /// Filters to send to a relay that just became healthy; empty means none.
    pub(crate) fn recovery_filters(&mut self, relay: &RelayUrl) -> Vec<Filter> {
        self.recovery_filters_at(relay, unix_now())
    }

    pub(crate) fn recovery_filters_at(&mut self, relay: &RelayUrl, now: u64) -> Vec<Filter> {
        let is_new = self.sent_filter_once.insert(relay.clone());

        if let Some(on_recovered) = self.on_recovered.as_mut() {
            return on_recovered(relay, is_new);
        }

        if is_new {
            return self.filters.clone();
        }

        self.filters
            .iter()
            .filter_map(|filter| recovery_filter(filter, now))
            .collect()
    }

    pub(crate) fn on_flush_timer(&mut self, token: u64) {
        if self
            .flush_timer
            .as_ref()
            .is_some_and(|timer| timer.matches(token))
        {
            self.flush();
        }
    }

    pub(crate) fn unsubscribe(&mut self) {
        self.flush();
    }

    fn flush(&mut self) {
        self.flush_timer = None;
        if self.buffered.is_empty() {
            return;
        }
        let events = std::mem::take(&mut self.buffered);
        (self.on_event)(events);
    }
}

/// Rewrite a filter for a reconnecting relay so it only asks for new events.
/// A filter whose `until` already passed can never match again.
fn recovery_filter(filter: &Filter, now: u64) -> Option<Filter> {
    if filter.until.is_some_and(|until| until < now) {
        return None;
    }
    let mut recovered = filter.clone();
    recovered.since = Some(filter.since.map_or(now, |since| since.max(now)));
    Some(recovered)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClientError, Result};
    use nostr::{EventTemplate, finalize_event};
    use std::sync::{Arc, Mutex};

    fn url(raw: &str) -> Result<RelayUrl> {
        RelayUrl::parse(raw)
    }

    fn event(kind: u16) -> Result<Event> {
        finalize_event(
            &EventTemplate {
                created_at: 1_700_000_000,
                kind,
                tags: vec![],
                content: format!("kind {kind}"),
            },
            &[5u8; 32],
        )
        .map_err(|error| ClientError::Internal(error.to_string()))
    }

    fn received(relay: &RelayUrl, kind: u16) -> Result<ReceivedEvent> {
        Ok(ReceivedEvent {
            relay: relay.clone(),
            subscription_id: "s".to_string(),
            event: event(kind)?,
        })
    }

    #[derive(Default, Clone)]
    struct Log(Arc<Mutex<Vec<String>>>);

    impl Log {
        fn push(&self, entry: String) {
            if let Ok(mut entries) = self.0.lock() {
                entries.push(entry);
            }
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().map(|entries| entries.clone()).unwrap_or_default()
        }
    }

    fn logged_options(filters: Vec<Filter>, log: &Log) -> SubscribeOptions {
        let events = log.clone();
        let eose = log.clone();
        SubscribeOptions::new(filters, move |batch| {
            events.push(format!(
                "events:{}",
                batch
                    .iter()
                    .map(|received| received.event.kind.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            ));
        })
        .on_eose(move |id| eose.push(format!("eose:{id}")))
    }

    fn new_tracker(
        relays: Vec<RelayUrl>,
        options: SubscribeOptions,
    ) -> (SubscriptionTracker, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = SubscriptionTracker::new(
            "s".to_string(),
            relays,
            options,
            Duration::from_secs(5),
            Scheduler::new(tx),
        );
        (tracker, rx)
    }

    #[tokio::test]
    async fn empty_initial_set_posts_eose_asynchronously() -> Result<()> {
        let log = Log::default();
        let (mut tracker, mut signals) = new_tracker(vec![], logged_options(vec![Filter::new()], &log));

        assert!(log.entries().is_empty());
        match signals.recv().await {
            Some(Signal::Pool(PoolSignal::InitialEose { subscription_id })) => {
                assert_eq!(subscription_id, "s");
            }
            other => return Err(ClientError::Internal(format!("unexpected {other:?}"))),
        }
        tracker.consume_initial_eose();
        tracker.consume_initial_eose();
        assert_eq!(log.entries(), vec!["eose:s".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn eose_waits_for_every_initial_relay() -> Result<()> {
        let (a, b) = (url("wss://a.test")?, url("wss://b.test")?);
        for order in [[&a, &b], [&b, &a]] {
            let log = Log::default();
            let (mut tracker, _signals) = new_tracker(
                vec![a.clone(), b.clone()],
                logged_options(vec![Filter::new()], &log),
            );

            tracker.consume_eose(order[0]);
            assert!(log.entries().is_empty());
            tracker.consume_eose(order[1]);
            tracker.consume_eose(order[1]);
            tracker.consume_eose(&url("wss://stranger.test")?);
            assert_eq!(log.entries(), vec!["eose:s".to_string()]);
        }
        Ok(())
    }

    #[tokio::test]
    async fn events_are_refiltered_before_delivery() -> Result<()> {
        let a = url("wss://a.test")?;
        let log = Log::default();
        let (mut tracker, _signals) = new_tracker(
            vec![a.clone()],
            logged_options(vec![Filter::new().kinds([1]), Filter::new().kinds([7])], &log),
        );

        tracker.consume_event(received(&a, 1)?);
        tracker.consume_event(received(&a, 3)?);
        tracker.consume_event(received(&a, 7)?);
        assert_eq!(
            log.entries(),
            vec!["events:1".to_string(), "events:7".to_string()]
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_events_flush_on_timer_count_and_eose() -> Result<()> {
        let a = url("wss://a.test")?;
        let log = Log::default();
        let options = logged_options(vec![Filter::new()], &log).buffer(BufferOptions {
            flush_interval: Duration::from_millis(100),
            max_event_count: Some(3),
        });
        let (mut tracker, mut signals) = new_tracker(vec![a.clone()], options);

        tracker.consume_event(received(&a, 1)?);
        tracker.consume_event(received(&a, 2)?);
        assert!(log.entries().is_empty());

        match signals.recv().await {
            Some(Signal::Pool(PoolSignal::BufferFlush { token, .. })) => {
                tracker.on_flush_timer(token);
            }
            other => return Err(ClientError::Internal(format!("unexpected {other:?}"))),
        }
        assert_eq!(log.entries(), vec!["events:1,2".to_string()]);

        for kind in 3..=5 {
            tracker.consume_event(received(&a, kind)?);
        }
        tracker.consume_event(received(&a, 6)?);
        tracker.consume_eose(&a);

        assert_eq!(
            log.entries(),
            vec![
                "events:1,2".to_string(),
                "events:3,4,5".to_string(),
                "events:6".to_string(),
                "eose:s".to_string(),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn unsubscribe_flushes_buffer() -> Result<()> {
        let a = url("wss://a.test")?;
        let log = Log::default();
        let options = logged_options(vec![Filter::new()], &log).buffer(BufferOptions {
            flush_interval: Duration::from_secs(60),
            max_event_count: None,
        });
        let (mut tracker, _signals) = new_tracker(vec![a.clone()], options);

        tracker.consume_event(received(&a, 1)?);
        tracker.unsubscribe();
        tracker.unsubscribe();
        assert_eq!(log.entries(), vec!["events:1".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn recovery_filters_for_new_and_reconnecting_relays() -> Result<()> {
        let (a, b) = (url("wss://a.test")?, url("wss://b.test")?);
        let filters = vec![
            Filter::new().kinds([1]),
            Filter::new().kinds([1]).until(10),
            Filter::new().kinds([2]).since(500),
            Filter::new().kinds([3]).since(50).until(200),
        ];
        let (mut tracker, _signals) = new_tracker(
            vec![a.clone()],
            SubscribeOptions::new(filters.clone(), |_| {}),
        );

        assert_eq!(tracker.recovery_filters_at(&b, 100), filters);
        assert_eq!(
            tracker.recovery_filters_at(&a, 100),
            vec![
                Filter::new().kinds([1]).since(100),
                Filter::new().kinds([2]).since(500),
                Filter::new().kinds([3]).since(100).until(200),
            ]
        );
        assert_eq!(tracker.recovery_filters_at(&b, 100).len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn expired_only_filter_yields_nothing() -> Result<()> {
        let a = url("wss://a.test")?;
        let (mut tracker, _signals) = new_tracker(
            vec![a.clone()],
            SubscribeOptions::new(vec![Filter::new().kinds([1]).until(10)], |_| {}),
        );
        assert!(tracker.recovery_filters(&a).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn recovered_callback_overrides_default() -> Result<()> {
        let (a, b) = (url("wss://a.test")?, url("wss://b.test")?);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let options = SubscribeOptions::new(vec![Filter::new().kinds([1])], |_| {}).on_recovered(
            move |relay, is_new| {
                if let Ok(mut calls) = recorder.lock() {
                    calls.push((relay.to_string(), is_new));
                }
                Vec::new()
            },
        );
        let (mut tracker, _signals) = new_tracker(vec![a.clone()], options);

        assert!(tracker.recovery_filters(&a).is_empty());
        assert!(tracker.recovery_filters(&b).is_empty());
        assert!(tracker.recovery_filters(&b).is_empty());
        let calls = seen.lock().map(|calls| calls.clone()).unwrap_or_default();
        assert_eq!(
            calls,
            vec![
                ("wss://a.test".to_string(), false),
                ("wss://b.test".to_string(), true),
                ("wss://b.test".to_string(), false),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn channel_options_forward_updates() -> Result<()> {
        let a = url("wss://a.test")?;
        let (options, mut updates) = SubscribeOptions::channel(vec![Filter::new()]);
        let (mut tracker, _signals) = new_tracker(vec![a.clone()], options);

        let delivered = received(&a, 1)?;
        tracker.consume_event(delivered.clone());
        tracker.consume_eose(&a);

        assert_eq!(
            updates.recv().await,
            Some(SubscriptionUpdate::Events(vec![delivered]))
        );
        assert_eq!(
            updates.recv().await,
            Some(SubscriptionUpdate::Eose("s".to_string()))
        );
        Ok(())
    }
}
