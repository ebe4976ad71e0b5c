//! Process-local capability tables.
//!
//! A [Universe] maps integer handles to descriptors. Completing an accept
//! or pull-descriptor operation attaches the transferred capability to the
//! receiver's universe and hands the resulting handle back through the
//! completion.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::stream::LaneHandle;

/// Index of a descriptor inside a [Universe].
pub type Handle = u64;

/// A capability that can be held by a universe or carried by a
/// descriptor-transfer operation.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Descriptor {
    /// One endpoint of a stream.
    Lane(LaneHandle),
}

/// A process-local capability table.
///
/// Attachment runs under the universe's own lock; the stream mutex is
/// never held at the same time.
#[derive(Debug, Default)]
pub struct Universe {
    table: Mutex<Table>,
}

#[derive(Debug, Default)]
struct Table {
    next_handle: Handle,
    descriptors: HashMap<Handle, Descriptor>,
}

impl Universe {
    /// Creates an empty universe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a descriptor and returns the handle it was filed under.
    pub fn attach(&self, descriptor: Descriptor) -> Handle {
        let mut table = self.table.lock().unwrap();
        let handle = table.next_handle;
        table.next_handle += 1;
        table.descriptors.insert(handle, descriptor);
        handle
    }

    /// Returns a copy of the descriptor filed under `handle`, if any.
    pub fn get(&self, handle: Handle) -> Option<Descriptor> {
        self.table.lock().unwrap().descriptors.get(&handle).cloned()
    }

    /// Removes and returns the descriptor filed under `handle`, if any.
    pub fn detach(&self, handle: Handle) -> Option<Descriptor> {
        self.table.lock().unwrap().descriptors.remove(&handle)
    }
}
