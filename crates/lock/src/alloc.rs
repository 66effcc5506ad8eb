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

//! Memory accounting for lock manager structures.
//!
//! Every structure the lock manager creates (chain tables, scopes, lock
//! requests, atomic release objects) first reserves its size from a
//! [`LockAllocator`]. The allocator may refuse, which surfaces as
//! [`LockError::AllocateError`] at the point of construction and never in the
//! middle of a commit.

use crate::error::{LockError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Kind of structure a reservation is made for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    LockTable,
    LockScope,
    LockRequest,
    AtomicRelease,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 4] = [
        MemoryKind::LockTable,
        MemoryKind::LockScope,
        MemoryKind::LockRequest,
        MemoryKind::AtomicRelease,
    ];

    fn index(self) -> usize {
        match self {
            MemoryKind::LockTable => 0,
            MemoryKind::LockScope => 1,
            MemoryKind::LockRequest => 2,
            MemoryKind::AtomicRelease => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryKind::LockTable => "lock table",
            MemoryKind::LockScope => "lock scope",
            MemoryKind::LockRequest => "lock request",
            MemoryKind::AtomicRelease => "atomic release",
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allocation contract consumed by the lock manager
///
/// `reserve` must either account for `bytes` and return `Ok`, or return an
/// [`LockError::AllocateError`] and leave no trace. Every successful reserve is
/// matched by exactly one `release` of the same kind and size.
pub trait LockAllocator: Send + Sync + fmt::Debug {
    fn reserve(&self, kind: MemoryKind, bytes: usize) -> Result<()>;

    fn release(&self, kind: MemoryKind, bytes: usize);
}

/// Default allocator: counts outstanding bytes per kind and optionally
/// enforces an upper bound, which is how memory pressure reaches the lock
/// manager.
#[derive(Debug)]
pub struct TrackingAllocator {
    limit: Option<usize>,
    total: AtomicUsize,
    outstanding: [AtomicUsize; 4],
    reservations: AtomicU64,
    refused: AtomicU64,
}

impl TrackingAllocator {
    /// Create an allocator without a limit
    pub fn new() -> Self {
        Self {
            limit: None,
            total: AtomicUsize::new(0),
            outstanding: Default::default(),
            reservations: AtomicU64::new(0),
            refused: AtomicU64::new(0),
        }
    }

    /// Create an allocator that refuses reservations beyond `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    /// Bytes currently reserved for `kind`
    pub fn outstanding(&self, kind: MemoryKind) -> usize {
        self.outstanding[kind.index()].load(Ordering::Acquire)
    }

    /// Bytes currently reserved across all kinds
    pub fn total_outstanding(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Number of successful reservations since creation
    pub fn reservation_count(&self) -> u64 {
        self.reservations.load(Ordering::Relaxed)
    }

    /// Number of refused reservations since creation
    pub fn refused_count(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    fn refuse(&self, kind: MemoryKind, bytes: usize, reason: &str) -> LockError {
        self.refused.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Refused {} byte reservation for {}: {}", bytes, kind, reason);
        LockError::allocate(kind, reason)
    }
}

impl Default for TrackingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl LockAllocator for TrackingAllocator {
    fn reserve(&self, kind: MemoryKind, bytes: usize) -> Result<()> {
        match self.limit {
            Some(limit) => {
                let mut current = self.total.load(Ordering::Acquire);
                loop {
                    let next = match current.checked_add(bytes) {
                        Some(next) if next <= limit => next,
                        _ => return Err(self.refuse(kind, bytes, "memory limit reached")),
                    };

                    match self
                        .total
                        .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                    {
                        Ok(_) => break,
                        Err(actual) => current = actual,
                    }
                }
            }
            None => {
                self.total.fetch_add(bytes, Ordering::AcqRel);
            }
        }

        self.outstanding[kind.index()].fetch_add(bytes, Ordering::AcqRel);
        self.reservations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release(&self, kind: MemoryKind, bytes: usize) {
        self.outstanding[kind.index()].fetch_sub(bytes, Ordering::AcqRel);
        self.total.fetch_sub(bytes, Ordering::AcqRel);
    }
}

/// RAII reservation, released back to its allocator on drop
pub(crate) struct Reservation {
    allocator: Arc<dyn LockAllocator>,
    kind: MemoryKind,
    bytes: usize,
}

impl Reservation {
    pub(crate) fn new(allocator: &Arc<dyn LockAllocator>, kind: MemoryKind, bytes: usize) -> Result<Self> {
        allocator.reserve(kind, bytes)?;
        Ok(Self {
            allocator: allocator.clone(),
            kind,
            bytes,
        })
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("kind", &self.kind)
            .field("bytes", &self.bytes)
            .finish()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.allocator.release(self.kind, self.bytes);
    }
}
