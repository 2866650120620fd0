// File: src/subject.rs
//
// Subject scheme shared by the broker and stream adapters:
//   events.<kind>                  unsharded
//   events.shard.<N>.<kind>        sharded
//   commands.<kind>                command dispatch
// Streams are named events_shard_<N> over events.shard.<N>.>

use trading_engine_core::event::EventEnvelope;

/// Derives subjects from a configurable prefix (default `events`).
#[derive(Debug, Clone)]
pub struct SubjectScheme {
    prefix: String,
}

impl Default for SubjectScheme {
    fn default() -> Self {
        Self::new("events")
    }
}

impl SubjectScheme {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Subject for one event: sharded when a shard hint is stamped.
    pub fn subject_for(&self, event: &EventEnvelope) -> String {
        match event.metadata.shard {
            Some(shard) => self.shard_subject(shard, &event.event_kind),
            None => self.kind_subject(&event.event_kind),
        }
    }

    pub fn kind_subject(&self, event_kind: &str) -> String {
        format!("{}.{}", self.prefix, event_kind)
    }

    pub fn shard_subject(&self, shard: u32, event_kind: &str) -> String {
        format!("{}.shard.{}.{}", self.prefix, shard, event_kind)
    }

    /// Wildcard covering every event, sharded or not.
    pub fn all_wildcard(&self) -> String {
        format!("{}.>", self.prefix)
    }

    /// Wildcards covering one kind across both the unsharded subject
    /// and every shard.
    pub fn kind_wildcards(&self, event_kind: &str) -> Vec<String> {
        vec![
            self.kind_subject(event_kind),
            format!("{}.shard.*.{}", self.prefix, event_kind),
        ]
    }

    /// Wildcard covering everything routed to one shard.
    pub fn shard_wildcard(&self, shard: u32) -> String {
        format!("{}.shard.{}.>", self.prefix, shard)
    }

    pub fn command_subject(&self, command_kind: &str) -> String {
        format!("commands.{}", command_kind)
    }

    /// Stream name for a shard on the persistent substrate.
    pub fn stream_name(&self, shard: u32) -> String {
        format!("{}_shard_{}", self.prefix, shard)
    }
}
