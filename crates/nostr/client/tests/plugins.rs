//! Plugin lifecycle and hooks.

mod common;

use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use common::{Fixture, event_frame, next_frame, note};
use nostr::{Event, Filter};
use nostr_client::{
    Plugin, PublishOptions, RelayPool, RelayUrl, SubscribeOptions, SubscriptionUpdate,
};

type Log = Arc<Mutex<Vec<String>>>;

struct Recorder {
    id: String,
    label: &'static str,
    log: Log,
}

impl Recorder {
    fn new(id: &str, label: &'static str, log: &Log) -> Self {
        Self {
            id: id.to_string(),
            label,
            log: Arc::clone(log),
        }
    }

    fn record(&self, entry: String) {
        if let Ok(mut log) = self.log.lock() {
            log.push(format!("{}:{}", self.label, entry));
        }
    }
}

impl Plugin for Recorder {
    fn id(&self) -> &str {
        &self.id
    }

    fn install(&mut self, _pool: RelayPool) {
        self.record("install".to_string());
    }

    fn uninstall(&mut self) {
        self.record("uninstall".to_string());
    }

    fn on_publish(&mut self, event: &Event) {
        self.record(format!("publish {}", event.content));
    }

    fn on_filter_request(&mut self, filter: &Filter) {
        self.record(format!("filter {:?}", filter.kinds));
    }

    fn on_inbound_event(&mut self, event: &Event, relay: &RelayUrl) {
        self.record(format!("inbound {} from {}", event.content, relay));
    }
}

fn drain(log: &Log) -> Vec<String> {
    log.lock()
        .map(|mut log| std::mem::take(&mut *log))
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn hooks_observe_pool_traffic() -> Result<()> {
    let mut fixture = Fixture::new();
    let mut sessions = fixture.open(&["wss://a.test"]).await?;
    let log = Log::default();

    fixture
        .pool
        .install_plugin(Recorder::new("recorder", "r", &log))
        .await?;
    assert_eq!(drain(&log), vec!["r:install"]);

    let (options, mut updates) = SubscribeOptions::channel(vec![
        Filter::new().kinds([1]),
        Filter::new().kinds([7]),
    ]);
    let id = fixture.pool.subscribe(options).await?;
    assert_eq!(
        drain(&log),
        vec!["r:filter Some([1])", "r:filter Some([7])"]
    );

    assert_eq!(next_frame(&mut sessions[0]).await?[0], "REQ");
    sessions[0].send_json(&event_frame(&id, &note(1, "hi")?))?;
    let Some(SubscriptionUpdate::Events(_)) = updates.recv().await else {
        bail!("expected events");
    };
    assert_eq!(drain(&log), vec!["r:inbound hi from wss://a.test"]);

    let (publish_options, _done) = PublishOptions::completion();
    fixture
        .pool
        .publish(note(1, "out")?, publish_options)
        .await?;
    assert_eq!(drain(&log), vec!["r:publish out"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn reinstalling_an_id_replaces_the_plugin() -> Result<()> {
    let fixture = Fixture::new();
    let log = Log::default();

    fixture
        .pool
        .install_plugin(Recorder::new("shared", "first", &log))
        .await?;
    fixture
        .pool
        .install_plugin(Recorder::new("shared", "second", &log))
        .await?;
    fixture
        .pool
        .install_plugin(Recorder::new("other", "third", &log))
        .await?;
    assert_eq!(
        drain(&log),
        vec!["first:install", "first:uninstall", "second:install", "third:install"]
    );

    fixture
        .pool
        .subscribe(SubscribeOptions::new(vec![Filter::new()], |_| {}))
        .await?;
    // Hooks run in plugin id order.
    assert_eq!(drain(&log), vec!["third:filter None", "second:filter None"]);

    assert!(fixture.pool.uninstall_plugin("shared").await?);
    assert!(!fixture.pool.uninstall_plugin("shared").await?);
    assert_eq!(drain(&log), vec!["second:uninstall"]);

    fixture.pool.shutdown().await?;
    assert_eq!(drain(&log), vec!["third:uninstall"]);
    Ok(())
}
