// Copyright 2025 Simo Sorce
// See LICENSE.txt file for terms

//! Handle and key caches
//!
//! Both maps are only ever reached through the session pool lock, which
//! also guards the live session set. Entries have no expiry of their own:
//! they are dropped all at once when the last live session goes away.

use std::collections::HashMap;
use std::sync::Arc;

use crate::device::{ObjectClass, ObjectHandle};
use crate::key::Key;

/// Object handles and key objects found on the device, keyed by SKI
#[derive(Debug, Default)]
pub struct ObjectCache {
    handles: HashMap<(ObjectClass, Vec<u8>), ObjectHandle>,
    keys: HashMap<Vec<u8>, Arc<dyn Key>>,
}

impl ObjectCache {
    /// The cached handle of the `class` object with this SKI
    pub fn lookup_handle(
        &self,
        class: ObjectClass,
        ski: &[u8],
    ) -> Option<ObjectHandle> {
        self.handles.get(&(class, ski.to_vec())).copied()
    }

    /// Records the handle found on the device, replacing any older one
    pub fn populate_handle(
        &mut self,
        class: ObjectClass,
        ski: &[u8],
        handle: ObjectHandle,
    ) {
        self.handles.insert((class, ski.to_vec()), handle);
    }

    /// The cached key object with this SKI
    pub fn lookup_key(&self, ski: &[u8]) -> Option<Arc<dyn Key>> {
        self.keys.get(ski).cloned()
    }

    /// Records a key object read from the device
    pub fn populate_key(&mut self, ski: &[u8], key: Arc<dyn Key>) {
        self.keys.insert(ski.to_vec(), key);
    }

    /// Empties both maps
    pub fn purge_all(&mut self) {
        self.handles.clear();
        self.keys.clear();
    }

    /// Number of cached handles
    pub fn handles_len(&self) -> usize {
        self.handles.len()
    }

    /// Number of cached keys
    pub fn keys_len(&self) -> usize {
        self.keys.len()
    }
}
