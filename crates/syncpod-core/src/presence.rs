//! Per-room presence table.
//!
//! Presence is lossy, latest-wins state: a map of user id to an opaque
//! field bag plus a server-stamped `lastActive`. Diffs are shallow
//! overwrites (named fields replace, absent fields persist); a diff with
//! no field bag is a tombstone. Entries expire after a TTL without
//! activity.
//!
//! For entries arriving from peer pods the table is the deduplication
//! point: a peer diff whose `source_ts` is older than the entry's stored
//! `lastActive` is rejected, which keeps `lastActive` non-decreasing per
//! user on every replica regardless of stream interleaving.

use std::collections::BTreeMap;

use ciborium::value::Value;
use syncpod_proto::payload::MAX_FIELDS_BYTES;
use syncpod_proto::PresenceEntryWire;
use thiserror::Error;

/// One user's presence entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    /// Current field bag (full state, not a diff).
    pub fields: BTreeMap<String, Value>,
    /// Server-stamped last activity. Never taken from the client.
    pub last_active: u64,
}

/// Errors from diff application.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    /// Encoded field bag exceeds the 2 KiB cap.
    #[error("presence fields too large: {size} bytes (max {max})")]
    FieldsTooLarge {
        /// Encoded size of the offending bag
        size: usize,
        /// Allowed maximum
        max: usize,
    },
}

/// Outcome of applying a peer-originated diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerApply {
    /// Diff was newer than stored state and took effect.
    Applied,
    /// Diff was older than the stored entry and was dropped.
    Stale,
}

/// Per-room user→presence map.
#[derive(Debug, Default)]
pub struct PresenceTable {
    entries: BTreeMap<String, PresenceEntry>,
}

impl PresenceTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a locally-originated diff, stamping `last_active = now_ms`.
    ///
    /// Merge is shallow field-level overwrite: fields named in the diff
    /// replace, fields absent from it persist (unknown fields included).
    /// Returns the effective entry after the merge.
    ///
    /// # Errors
    ///
    /// `PresenceError::FieldsTooLarge` if the diff's encoded bag exceeds
    /// the cap; the table is unchanged.
    pub fn apply_diff(
        &mut self,
        user_id: &str,
        diff: &BTreeMap<String, Value>,
        now_ms: u64,
    ) -> Result<&PresenceEntry, PresenceError> {
        check_fields_size(diff)?;

        let entry = self
            .entries
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceEntry { fields: BTreeMap::new(), last_active: now_ms });

        for (key, value) in diff {
            entry.fields.insert(key.clone(), value.clone());
        }
        // Stamped here, never trusted from the wire.
        entry.last_active = entry.last_active.max(now_ms);

        Ok(&self.entries[user_id])
    }

    /// Apply a peer-originated diff or tombstone, deduplicating by
    /// `source_ts`.
    ///
    /// Oversized peer bags are dropped as stale rather than erroring: the
    /// origin pod already enforced the cap, so an oversized entry here is
    /// a peer bug, not a client one.
    pub fn apply_peer(
        &mut self,
        user_id: &str,
        fields: Option<&BTreeMap<String, Value>>,
        source_ts: u64,
    ) -> PeerApply {
        if let Some(existing) = self.entries.get(user_id) {
            if source_ts < existing.last_active {
                return PeerApply::Stale;
            }
        }

        match fields {
            Some(diff) => {
                if check_fields_size(diff).is_err() {
                    return PeerApply::Stale;
                }
                let entry = self.entries.entry(user_id.to_string()).or_insert_with(|| {
                    PresenceEntry { fields: BTreeMap::new(), last_active: source_ts }
                });
                for (key, value) in diff {
                    entry.fields.insert(key.clone(), value.clone());
                }
                entry.last_active = entry.last_active.max(source_ts);
            },
            None => {
                self.entries.remove(user_id);
            },
        }

        PeerApply::Applied
    }

    /// Remove a user's entry. Returns `true` if an entry existed — the
    /// caller emits the tombstone exactly once per such transition.
    pub fn remove(&mut self, user_id: &str) -> bool {
        self.entries.remove(user_id).is_some()
    }

    /// Entry lookup.
    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.entries.get(user_id)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Full snapshot in wire form.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PresenceEntryWire> {
        self.entries
            .iter()
            .map(|(user_id, entry)| PresenceEntryWire {
                user_id: user_id.clone(),
                fields: entry.fields.clone(),
                last_active: entry.last_active,
            })
            .collect()
    }

    /// Drop entries idle past `ttl_ms` and return the removed user ids.
    /// The caller turns each into exactly one tombstone diff.
    pub fn expire_stale(&mut self, now_ms: u64, ttl_ms: u64) -> Vec<String> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now_ms.saturating_sub(entry.last_active) >= ttl_ms)
            .map(|(user_id, _)| user_id.clone())
            .collect();

        for user_id in &stale {
            self.entries.remove(user_id);
        }
        stale
    }
}

fn check_fields_size(fields: &BTreeMap<String, Value>) -> Result<(), PresenceError> {
    let mut buf = Vec::new();
    if ciborium::into_writer(fields, &mut buf).is_err() {
        // Unencodable bags count as oversized; the cap is on encoded form.
        return Err(PresenceError::FieldsTooLarge { size: usize::MAX, max: MAX_FIELDS_BYTES });
    }
    if buf.len() > MAX_FIELDS_BYTES {
        return Err(PresenceError::FieldsTooLarge { size: buf.len(), max: MAX_FIELDS_BYTES });
    }
    Ok(())
}
