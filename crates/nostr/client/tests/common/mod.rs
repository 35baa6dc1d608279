//! Shared fixture: a pool over an in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use nostr::{Event, EventTemplate, finalize_event};
use nostr_client::{MemorySession, MemoryTransport, PoolConfig, RelayPool, RelayUrl};
use serde_json::{Value, json};
use tokio::sync::mpsc;

pub const SECRET_KEY: [u8; 32] = [7u8; 32];

pub struct Fixture {
    pub pool: RelayPool,
    pub transport: MemoryTransport,
    accepted: mpsc::UnboundedReceiver<MemorySession>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        let (transport, accepted) = MemoryTransport::new();
        let pool = RelayPool::with_transport(config, Arc::new(transport.clone()));
        Self {
            pool,
            transport,
            accepted,
        }
    }

    /// Add relays, wait until all of them are open and return their relay
    /// sides in the order given.
    pub async fn open(&mut self, urls: &[&str]) -> Result<Vec<MemorySession>> {
        for url in urls {
            self.pool.add_relay(url).await?;
        }
        let registered = self.pool.relays().await?.len();
        ensure!(
            self.pool
                .wait_until_healthy(registered, Duration::from_secs(1))
                .await?,
            "relays did not open"
        );

        let mut sessions = Vec::new();
        for _ in urls {
            sessions.push(self.next_session().await?);
        }
        let mut ordered = Vec::new();
        for url in urls {
            let url = RelayUrl::parse(url)?;
            let index = sessions
                .iter()
                .position(|session| session.url == url)
                .with_context(|| format!("no session for {url}"))?;
            ordered.push(sessions.swap_remove(index));
        }
        Ok(ordered)
    }

    pub async fn next_session(&mut self) -> Result<MemorySession> {
        self.accepted.recv().await.context("transport dropped")
    }
}

pub async fn next_frame(session: &mut MemorySession) -> Result<Value> {
    session
        .recv_json()
        .await
        .with_context(|| format!("{} client hung up", session.url))
}

pub fn note(kind: u16, content: &str) -> Result<Event> {
    Ok(finalize_event(
        &EventTemplate {
            created_at: 1_700_000_000,
            kind,
            tags: vec![],
            content: content.to_string(),
        },
        &SECRET_KEY,
    )?)
}

pub fn event_frame(subscription_id: &str, event: &Event) -> Value {
    json!(["EVENT", subscription_id, event])
}

pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
