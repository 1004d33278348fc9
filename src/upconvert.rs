//! # Event Upconversion
//!
//! Stored events keep the shape they were written with. When an event type
//! evolves, a converter turns the old shape into the new one at read time:
//!
//! ```text
//!   stored:   OrderPlaced.v1 ──► OrderPlaced.v2 ──► OrderPlaced.v3 ──► caller
//!                           conv(v1)          conv(v2)
//! ```
//!
//! Converters are registered once, up front, into an immutable
//! [`ConverterMap`] keyed by source kind. There is no global registry and no
//! discovery at runtime.
//!
//! Chains are followed until no converter matches the current kind. A chain
//! that revisits a kind is cut at the repeat. A converter that fails leaves the
//! event as stored and logs a warning; reads never fail because of a
//! converter.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::commit::{Commit, EventMessage, Payload};
use crate::error::Result;
use crate::pipeline::PipelineHook;

/// A function from one payload shape to the next.
pub type Converter = Arc<dyn Fn(Payload) -> Result<Payload> + Send + Sync>;

/// Immutable map from source kind to converter.
#[derive(Clone, Default)]
pub struct ConverterMap {
    converters: HashMap<String, Converter>,
}

impl fmt::Debug for ConverterMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.converters.keys().collect();
        kinds.sort();
        f.debug_struct("ConverterMap").field("kinds", &kinds).finish()
    }
}

impl ConverterMap {
    /// Starts an empty map.
    pub fn builder() -> ConverterMapBuilder {
        ConverterMapBuilder::default()
    }

    /// Number of registered converters.
    pub fn len(&self) -> usize {
        self.converters.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }

    /// Converts a payload as far as the registered chain goes.
    pub fn convert(&self, payload: Payload) -> Result<Payload> {
        let mut seen = HashSet::new();
        let mut current = payload;

        while let Some(converter) = self.converters.get(&current.kind) {
            if !seen.insert(current.kind.clone()) {
                warn!(kind = %current.kind, "converter chain loops, stopping");
                break;
            }
            current = (converter.as_ref())(current)?;
        }
        Ok(current)
    }
}

/// Collects converters before freezing them into a [`ConverterMap`].
#[derive(Default)]
pub struct ConverterMapBuilder {
    converters: HashMap<String, Converter>,
}

impl ConverterMapBuilder {
    /// Registers a converter for `kind`. A later registration replaces an
    /// earlier one.
    pub fn register<F>(mut self, kind: impl Into<String>, converter: F) -> Self
    where
        F: Fn(Payload) -> Result<Payload> + Send + Sync + 'static,
    {
        self.converters.insert(kind.into(), Arc::new(converter));
        self
    }

    /// Freezes the map.
    pub fn build(self) -> ConverterMap {
        ConverterMap {
            converters: self.converters,
        }
    }
}

/// Pipeline hook that upconverts every event body on read.
#[derive(Debug, Clone)]
pub struct EventUpconverterHook {
    converters: ConverterMap,
}

impl EventUpconverterHook {
    /// Creates the hook.
    pub fn new(converters: ConverterMap) -> Self {
        Self { converters }
    }

    fn convert_event(&self, event: EventMessage) -> EventMessage {
        if !self.converters.converters.contains_key(&event.body.kind) {
            return event;
        }

        match self.converters.convert(event.body.clone()) {
            Ok(body) => EventMessage { body, ..event },
            Err(e) => {
                warn!(kind = %event.body.kind, error = %e, "upconversion failed, keeping stored shape");
                event
            }
        }
    }
}

impl PipelineHook for EventUpconverterHook {
    fn name(&self) -> &'static str {
        "upconverter"
    }

    fn select(&self, mut commit: Commit) -> Option<Commit> {
        if self.converters.is_empty() {
            return Some(commit);
        }
        commit.events = commit
            .events
            .into_iter()
            .map(|event| self.convert_event(event))
            .collect();
        Some(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitAttempt;
    use crate::error::Error;
    use crate::types::{CheckpointToken, CommitId, CommitSequence, StreamRev};
    use serde_json::json;

    fn converters() -> ConverterMap {
        ConverterMap::builder()
            .register("Renamed.v1", |p: Payload| {
                Ok(Payload::new("Renamed.v2", json!({ "name": p.data["old_name"] })))
            })
            .register("Renamed.v2", |p: Payload| {
                Ok(Payload::new("Renamed.v3", json!({ "full_name": p.data["name"] })))
            })
            .register("Broken", |_p: Payload| Err(Error::Storage("nope".into())))
            .register("Ping", |p: Payload| Ok(Payload::new("Pong", p.data)))
            .register("Pong", |p: Payload| Ok(Payload::new("Ping", p.data)))
            .build()
    }

    fn commit_of(payloads: Vec<Payload>) -> Commit {
        let attempt = CommitAttempt::new(
            "default",
            "s",
            StreamRev::from_raw(payloads.len() as u64),
            CommitId::new(),
            CommitSequence::FIRST,
            payloads.into_iter().map(EventMessage::new).collect(),
        );
        Commit::from_attempt(attempt, CheckpointToken::from_raw(1))
    }

    #[test]
    fn test_chain_is_followed() {
        let payload = converters()
            .convert(Payload::new("Renamed.v1", json!({ "old_name": "ada" })))
            .unwrap();
        assert_eq!(payload, Payload::new("Renamed.v3", json!({ "full_name": "ada" })));
    }

    #[test]
    fn test_cycle_is_cut() {
        let payload = converters().convert(Payload::new("Ping", json!(1))).unwrap();
        assert_eq!(payload.kind, "Ping");
    }

    #[test]
    fn test_hook_converts_and_keeps_failures() {
        let hook = EventUpconverterHook::new(converters());
        let commit = commit_of(vec![
            Payload::new("Renamed.v1", json!({ "old_name": "bo" })),
            Payload::new("Broken", json!(7)),
            Payload::new("Untouched", json!(8)),
        ]);

        let converted = hook.select(commit).unwrap();
        let kinds: Vec<&str> = converted.events.iter().map(|e| e.body.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Renamed.v3", "Broken", "Untouched"]);
    }
}
