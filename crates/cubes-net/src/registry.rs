//! Per-connection mapping between compact tags and packet type names.
//!
//! The server is the tag authority: it hands out `0, 1, 2, ...` in the order
//! types first cross the connection, in either direction. The client only ever
//! learns tags from `TagAssignment` packets. A binding, once made, is never
//! changed for the lifetime of the connection.

use std::collections::{HashMap, HashSet};

use crate::error::ProtocolError;

/// Tag table for one connection. Shared by its reader and writer threads.
#[derive(Debug, Default)]
pub struct PacketIdRegistry {
    by_tag: HashMap<i32, &'static str>,
    by_name: HashMap<&'static str, i32>,
    /// Types whose tag the peer is known to hold (server side).
    announced: HashSet<&'static str>,
    /// Types with a queued but unsent assignment (server side).
    pending: HashSet<&'static str>,
    next_tag: i32,
}

impl PacketIdRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag_of(&self, name: &str) -> Option<i32> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, tag: i32) -> Option<&'static str> {
        self.by_tag.get(&tag).copied()
    }

    /// Number of bound types.
    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// Authority side: the tag for `name`, binding the next free one if needed.
    pub fn assign(&mut self, name: &'static str) -> i32 {
        if let Some(tag) = self.by_name.get(name) {
            return *tag;
        }
        let tag = self.next_tag;
        self.next_tag += 1;
        self.by_tag.insert(tag, name);
        self.by_name.insert(name, tag);
        tag
    }

    /// Learning side: record a binding announced by the peer.
    ///
    /// Re-learning an identical binding is a no-op. Anything that would rebind
    /// a tag or a name is a desync.
    pub fn learn(&mut self, name: &'static str, tag: i32) -> Result<(), ProtocolError> {
        if let Some(existing) = self.by_tag.get(&tag) {
            if *existing == name {
                return Ok(());
            }
            return Err(ProtocolError::TagConflict {
                name,
                tag,
                existing: (*existing).to_string(),
            });
        }
        if let Some(existing) = self.by_name.get(name) {
            return Err(ProtocolError::TagConflict {
                name,
                tag,
                existing: format!("tag {existing}"),
            });
        }
        self.by_tag.insert(tag, name);
        self.by_name.insert(name, tag);
        Ok(())
    }

    pub fn is_announced(&self, name: &str) -> bool {
        self.announced.contains(name)
    }

    /// The peer now holds the tag for `name`.
    pub fn mark_announced(&mut self, name: &'static str) {
        self.pending.remove(name);
        self.announced.insert(name);
    }

    /// Called when the peer named a type. Returns the tag to announce back if
    /// no announcement has been sent or queued for it yet.
    pub fn needs_assignment(&mut self, name: &'static str) -> Option<i32> {
        let tag = self.assign(name);
        if self.announced.contains(name) || !self.pending.insert(name) {
            return None;
        }
        Some(tag)
    }
}
