//! Extension seam for features built on top of the pool.
//!
//! Hooks run on the pool driver task, in plugin id order. A hook must not
//! wait on the pool it was installed into; spawn a task for follow-up work
//! instead.

use std::collections::BTreeMap;

use nostr::{Event, Filter};
use tracing::debug;

use crate::pool::RelayPool;
use crate::relay_url::RelayUrl;

pub trait Plugin: Send + 'static {
    /// Stable identifier. Installing another plugin with the same id replaces this one.
    fn id(&self) -> &str;

    fn install(&mut self, _pool: RelayPool) {}

    fn uninstall(&mut self) {}

    /// Called after a verified event was handed to every target relay.
    fn on_publish(&mut self, _event: &Event) {}

    /// Called for each filter of a new subscription before any REQ goes out.
    fn on_filter_request(&mut self, _filter: &Filter) {}

    /// Called for every verified inbound event before subscription dispatch.
    fn on_inbound_event(&mut self, _event: &Event, _relay: &RelayUrl) {}
}

#[derive(Default)]
pub(crate) struct PluginRegistry {
    plugins: BTreeMap<String, Box<dyn Plugin>>,
}

impl PluginRegistry {
    pub(crate) fn install(&mut self, mut plugin: Box<dyn Plugin>, pool: RelayPool) {
        let id = plugin.id().to_string();
        self.uninstall(&id);
        debug!("installing plugin {}", id);
        plugin.install(pool);
        self.plugins.insert(id, plugin);
    }

    pub(crate) fn uninstall(&mut self, id: &str) -> bool {
        match self.plugins.remove(id) {
            Some(mut plugin) => {
                debug!("uninstalling plugin {}", id);
                plugin.uninstall();
                true
            }
            None => false,
        }
    }

    pub(crate) fn uninstall_all(&mut self) {
        for (id, mut plugin) in std::mem::take(&mut self.plugins) {
            debug!("uninstalling plugin {}", id);
            plugin.uninstall();
        }
    }

    pub(crate) fn on_publish(&mut self, event: &Event) {
        for plugin in self.plugins.values_mut() {
            plugin.on_publish(event);
        }
    }

    pub(crate) fn on_filter_request(&mut self, filter: &Filter) {
        for plugin in self.plugins.values_mut() {
            plugin.on_filter_request(filter);
        }
    }

    pub(crate) fn on_inbound_event(&mut self, event: &Event, relay: &RelayUrl) {
        for plugin in self.plugins.values_mut() {
            plugin.on_inbound_event(event, relay);
        }
    }
}
