// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Device-local semaphores.
//!
//! A device owns a fixed file of scoped semaphore slots plus one barrier
//! semaphore per collective id. Scoped slots are handed out by a
//! `SemaphorePool` while a kernel is traced and are zeroed when the scope is
//! entered at run time; barrier semaphores are never reset.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::Error;

pub type CollectiveId = u32;

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum SemaphoreType {
    /// A counting semaphore, signalled and waited on explicitly.
    Regular,
    /// Tracks DMA completion; bound to the send or receive role by the copy
    /// naming it.
    Dma,
}

/// A semaphore as named by kernel code.
///
/// The same reference names the same slot on every device, so a signal
/// targeting a remote device increments the peer's copy of the semaphore.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SemaphoreRef {
    Scoped { slot: usize, kind: SemaphoreType },
    Barrier(CollectiveId),
}

impl SemaphoreRef {
    pub fn kind(&self) -> SemaphoreType {
        match self {
            Self::Scoped { kind, .. } => *kind,
            Self::Barrier(_) => SemaphoreType::Regular,
        }
    }
}

impl fmt::Display for SemaphoreRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Scoped { slot, kind } => write!(f, "sem_{}:{:?}", slot, kind),
            Self::Barrier(id) => write!(f, "barrier_{}", id),
        }
    }
}

/// Trace-time allocator for scoped semaphores; a stack, since scopes nest.
#[derive(Debug)]
pub(crate) struct SemaphorePool {
    capacity: usize,
    top: usize,
}

impl SemaphorePool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { capacity, top: 0 }
    }

    pub(crate) fn allocate(&mut self, types: &[SemaphoreType]) -> Result<Vec<SemaphoreRef>, Error> {
        if self.top + types.len() > self.capacity {
            log::error!(
                "Cannot allocate {} semaphores; {} of {} in use",
                types.len(),
                self.top,
                self.capacity
            );
            return Err(Error::OutOfSemaphores {
                capacity: self.capacity,
            });
        }
        let sems = types
            .iter()
            .enumerate()
            .map(|(i, kind)| SemaphoreRef::Scoped {
                slot: self.top + i,
                kind: *kind,
            })
            .collect::<Vec<_>>();
        self.top += types.len();
        Ok(sems)
    }

    pub(crate) fn release(&mut self, count: usize) {
        assert!(count <= self.top, "releasing more semaphores than allocated");
        self.top -= count;
    }

    pub(crate) fn in_use(&self) -> usize {
        self.top
    }
}

#[derive(Clone, Debug, Default)]
struct Slot {
    count: u64,
    owner: Option<SemaphoreType>,
}

/// The run-time semaphore state of one device.
#[derive(Clone, Debug)]
pub struct SemaphoreFile {
    slots: Vec<Slot>,
    barriers: HashMap<CollectiveId, u64>,
}

impl SemaphoreFile {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![Slot::default(); capacity],
            barriers: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot_mut(&mut self, slot: usize) -> Result<&mut Slot, Error> {
        let capacity = self.slots.len();
        self.slots
            .get_mut(slot)
            .ok_or(Error::OutOfSemaphores { capacity })
    }

    /// The current count, or `None` for a slot beyond the file.
    pub fn count(&self, sem: &SemaphoreRef) -> Option<u64> {
        match sem {
            SemaphoreRef::Scoped { slot, .. } => self.slots.get(*slot).map(|s| s.count),
            SemaphoreRef::Barrier(id) => Some(self.barriers.get(id).copied().unwrap_or(0)),
        }
    }

    /// Enter a scope: the slots become owned and start from zero.
    ///
    /// Increments that arrived while a slot was not owned by this scope are
    /// discarded here.
    pub(crate) fn acquire(&mut self, sems: &[SemaphoreRef]) -> Result<(), Error> {
        for sem in sems {
            if let SemaphoreRef::Scoped { slot, kind } = sem {
                let entry = self.slot_mut(*slot)?;
                if entry.count != 0 {
                    log::debug!("{} discards {} stale increments", sem, entry.count);
                }
                entry.count = 0;
                entry.owner = Some(*kind);
            }
        }
        Ok(())
    }

    /// Leave a scope. Unconsumed increments are reported, not cleared.
    pub(crate) fn release(&mut self, sems: &[SemaphoreRef]) -> Result<(), Error> {
        for sem in sems {
            if let SemaphoreRef::Scoped { slot, .. } = sem {
                let entry = self.slot_mut(*slot)?;
                if entry.count != 0 {
                    log::warn!(
                        "{} released with {} unconsumed increments",
                        sem,
                        entry.count
                    );
                }
                entry.owner = None;
            }
        }
        Ok(())
    }

    pub fn signal(&mut self, sem: &SemaphoreRef, amount: u64) -> Result<(), Error> {
        match sem {
            SemaphoreRef::Scoped { slot, .. } => {
                let entry = self.slot_mut(*slot)?;
                if entry.owner.is_none() {
                    log::debug!("{} signalled outside of its scope", sem);
                }
                entry.count += amount;
            }
            SemaphoreRef::Barrier(id) => *self.barriers.entry(*id).or_insert(0) += amount,
        }
        if cfg!(feature = "trace-semaphore-changes") {
            log::trace!("{} += {} -> {:?}", sem, amount, self.count(sem));
        }
        Ok(())
    }

    /// Decrement by `amount` if the count allows it; returns whether it did.
    pub fn try_wait(&mut self, sem: &SemaphoreRef, amount: u64) -> Result<bool, Error> {
        let count = match sem {
            SemaphoreRef::Scoped { slot, .. } => &mut self.slot_mut(*slot)?.count,
            SemaphoreRef::Barrier(id) => self.barriers.entry(*id).or_insert(0),
        };
        if *count < amount {
            return Ok(false);
        }
        *count -= amount;
        Ok(true)
    }

    pub(crate) fn slot_counts(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots.iter().map(|s| s.count)
    }
}
