//! Per-session object ID registry.
//!
//! IDs come from a fixed-size bitmap. Allocation starts at a random probe
//! and scans forward, wrapping once, so a freshly released ID is unlikely
//! to be handed out again right away and late replies for a destroyed
//! object do not land on its successor.

use chrono::{DateTime, Utc};
use guestctl_shared::errors::{GuestctlError, GuestctlResult};
use rand::Rng;
use std::collections::BTreeMap;

/// Type tag of a registered session object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Session,
    Directory,
    File,
    Process,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Session => "session",
            ObjectKind::Directory => "directory",
            ObjectKind::File => "file",
            ObjectKind::Process => "process",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ObjectEntry {
    pub kind: ObjectKind,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ObjectRegistry {
    /// ID space size. IDs 0 and `max - 1` are never issued.
    max: u32,
    bitmap: Vec<u64>,
    entries: BTreeMap<u32, ObjectEntry>,
}

impl ObjectRegistry {
    pub fn new(max: u32) -> Self {
        let words = (max as usize).div_ceil(64);
        Self {
            max,
            bitmap: vec![0; words],
            entries: BTreeMap::new(),
        }
    }

    /// Number of IDs that can be live at once.
    pub fn capacity(&self) -> u32 {
        self.max.saturating_sub(2)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_set(&self, id: u32) -> bool {
        self.bitmap[(id / 64) as usize] & (1u64 << (id % 64)) != 0
    }

    fn set(&mut self, id: u32) {
        self.bitmap[(id / 64) as usize] |= 1u64 << (id % 64);
    }

    fn clear(&mut self, id: u32) {
        self.bitmap[(id / 64) as usize] &= !(1u64 << (id % 64));
    }

    fn first_clear_in(&self, from: u32, to: u32) -> Option<u32> {
        (from..=to).find(|&id| !self.is_set(id))
    }

    /// Register a new object and return its ID.
    pub fn register(&mut self, kind: ObjectKind) -> GuestctlResult<u32> {
        if self.entries.len() as u32 >= self.capacity() {
            return Err(GuestctlError::MaxObjectsReached(self.max));
        }

        let last = self.max - 2;
        let probe = rand::rng().random_range(1..=last);
        let id = if !self.is_set(probe) {
            Some(probe)
        } else {
            self.first_clear_in(probe + 1, last)
                .or_else(|| self.first_clear_in(1, probe - 1))
        };

        let id = id.ok_or_else(|| {
            tracing::error!(live = self.entries.len(), "Object bitmap full despite free capacity");
            GuestctlError::MaxObjectsReached(self.max)
        })?;

        self.set(id);
        self.entries.insert(
            id,
            ObjectEntry {
                kind,
                registered_at: Utc::now(),
            },
        );
        tracing::trace!(object_id = id, kind = kind.as_str(), "Registered object");
        Ok(id)
    }

    /// Release `id`. Unknown IDs are an error.
    pub fn unregister(&mut self, id: u32) -> GuestctlResult<ObjectEntry> {
        let entry = self
            .entries
            .remove(&id)
            .ok_or_else(|| GuestctlError::NotFound(format!("object {} is not registered", id)))?;
        self.clear(id);
        tracing::trace!(object_id = id, kind = entry.kind.as_str(), "Unregistered object");
        Ok(entry)
    }

    pub fn lookup(&self, id: u32) -> Option<ObjectEntry> {
        self.entries.get(&id).copied()
    }

    pub fn ids_of(&self, kind: ObjectKind) -> Vec<u32> {
        self.entries
            .iter()
            .filter(|(_, e)| e.kind == kind)
            .map(|(id, _)| *id)
            .collect()
    }
}
