// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::scope::ScopeSlot;

/// Upper bound on retained slot buffers
const MAX_POOLED: usize = 1000;

/// Buffers grown past this many slots are dropped instead of retained
const MAX_RETAINED_SLOTS: usize = 4096;

/// Pool of scope list storage, shared by scopes allocated with it
///
/// Transactions that allocate a scope per operation recycle the slot buffer
/// of the previous scope instead of growing a fresh one.
#[derive(Debug, Default)]
pub struct ScopePool {
    buffers: SegQueue<Vec<ScopeSlot>>,
    reused: AtomicU64,
    created: AtomicU64,
    returned: AtomicU64,
}

/// Snapshot of pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopePoolStats {
    pub hits: u64,
    pub misses: u64,
    pub releases: u64,
    pub pooled: usize,
}

impl ScopePoolStats {
    /// Fraction of acquisitions served from the pool
    pub fn hit_rate(&self) -> f64 {
        match self.hits + self.misses {
            0 => 0.0,
            total => self.hits as f64 / total as f64,
        }
    }
}

impl ScopePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn acquire(&self) -> Vec<ScopeSlot> {
        match self.buffers.pop() {
            Some(mut slots) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                slots.clear();
                slots
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        }
    }

    /// Hand a scope's slot buffer back for the next scope
    pub(crate) fn release(&self, slots: Vec<ScopeSlot>) {
        if slots.capacity() > MAX_RETAINED_SLOTS || self.buffers.len() >= MAX_POOLED {
            return;
        }
        self.returned.fetch_add(1, Ordering::Relaxed);
        self.buffers.push(slots);
    }

    pub fn stats(&self) -> ScopePoolStats {
        ScopePoolStats {
            hits: self.reused.load(Ordering::Relaxed),
            misses: self.created.load(Ordering::Relaxed),
            releases: self.returned.load(Ordering::Relaxed),
            pooled: self.buffers.len(),
        }
    }

    pub fn hit_rate(&self) -> f64 {
        self.stats().hit_rate()
    }
}
