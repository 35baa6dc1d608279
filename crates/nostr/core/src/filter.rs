//! NIP-01 subscription filters and their compiled matcher.
//!
//! A [`Filter`] is what goes over the wire in `REQ`. A [`FilterMatcher`] is
//! the same filter compiled into hash sets so a client can re-check events a
//! relay delivered. Predicates combine with AND inside one filter; several
//! filters on one subscription combine with OR (see [`matches_any`]).

use std::collections::{BTreeMap, HashSet};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::nip01::Event;
use crate::tag_parsing::tag_values;

/// NIP-01 filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Lower time bound, inclusive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Upper time bound, inclusive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    /// Maximum number of stored events a relay should return
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Tag queries keyed with the `#` prefix (`"#e"`, `"#p"`, ...). Other
    /// unknown keys are ignored when parsing.
    #[serde(flatten, deserialize_with = "tag_queries")]
    pub tags: BTreeMap<String, Vec<String>>,
}

fn tag_queries<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    BTreeMap::<String, Value>::deserialize(deserializer)?
        .into_iter()
        .filter(|(key, _)| key.starts_with('#'))
        .map(|(key, values)| {
            serde_json::from_value(values)
                .map(|values| (key, values))
                .map_err(D::Error::custom)
        })
        .collect()
}

impl Filter {
    /// Create a new empty filter (matches all events).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Add a tag query. `name` may be given with or without the `#` prefix.
    pub fn tag(
        mut self,
        name: &str,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let key = if name.starts_with('#') {
            name.to_string()
        } else {
            format!("#{}", name)
        };
        self.tags
            .insert(key, values.into_iter().map(Into::into).collect());
        self
    }
}

/// A [`Filter`] compiled for fast membership tests.
///
/// An empty accepted-value list (`ids: []`, `"#t": []`) rejects every event.
#[derive(Debug, Clone)]
pub struct FilterMatcher {
    ids: Option<HashSet<String>>,
    authors: Option<HashSet<String>>,
    kinds: Option<HashSet<u16>>,
    tags: Vec<(String, HashSet<String>)>,
    since: Option<u64>,
    until: Option<u64>,
}

impl FilterMatcher {
    pub fn new(filter: &Filter) -> Self {
        let mut tags: Vec<(String, HashSet<String>)> = Vec::new();
        for (key, values) in &filter.tags {
            let Some(name) = key.strip_prefix('#') else {
                continue;
            };
            tags.push((name.to_string(), values.iter().cloned().collect()));
        }

        Self {
            ids: filter.ids.as_ref().map(|ids| ids.iter().cloned().collect()),
            authors: filter
                .authors
                .as_ref()
                .map(|authors| authors.iter().cloned().collect()),
            kinds: filter
                .kinds
                .as_ref()
                .map(|kinds| kinds.iter().copied().collect()),
            tags,
            since: filter.since,
            until: filter.until,
        }
    }

    /// Check every present predicate, failing fast in a fixed order:
    /// id, author, kind, tags, since, until.
    pub fn test(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids
            && !ids.contains(&event.id)
        {
            return false;
        }

        if let Some(authors) = &self.authors
            && !authors.contains(&event.pubkey)
        {
            return false;
        }

        if let Some(kinds) = &self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }

        for (name, accepted) in &self.tags {
            if !tag_values(&event.tags, name).any(|value| accepted.contains(value)) {
                return false;
            }
        }

        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }

        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }

        true
    }
}

impl From<&Filter> for FilterMatcher {
    fn from(filter: &Filter) -> Self {
        Self::new(filter)
    }
}

/// True when at least one matcher accepts the event.
pub fn matches_any(matchers: &[FilterMatcher], event: &Event) -> bool {
    matchers.iter().any(|matcher| matcher.test(event))
}
