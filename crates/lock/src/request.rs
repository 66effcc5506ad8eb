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

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::alloc::{LockAllocator, MemoryKind, Reservation};
use crate::atomic_release::{ReleaseLink, ReleaseWaiter};
use crate::error::Result;
use crate::types::{LockDuration, LockMode, LockName};

/// Storage for one lock instance (lock request block)
///
/// While granted the block is a node of its hash chain. An unlinked block has
/// mode and duration `None` and can be reused by a later take or freed.
#[derive(Debug)]
pub struct LockRequest {
    block: Box<RequestBlock>,
}

#[derive(Debug)]
struct RequestBlock {
    id: u64,
    name: Option<LockName>,
    hash: u32,
    mode: LockMode,
    duration: LockDuration,
    being_released: bool,
    release: Option<ReleaseLink>,
    /// Next request in the same hash chain
    next: Option<LockRequest>,
    _reservation: Reservation,
}

impl LockRequest {
    pub(crate) fn new(allocator: &Arc<dyn LockAllocator>) -> Result<Self> {
        let reservation = Reservation::new(allocator, MemoryKind::LockRequest, Self::block_size())?;

        Ok(Self {
            block: Box::new(RequestBlock {
                id: 0,
                name: None,
                hash: 0,
                mode: LockMode::None,
                duration: LockDuration::None,
                being_released: false,
                release: None,
                next: None,
                _reservation: reservation,
            }),
        })
    }

    /// Fill in everything except the release link ahead of taking the chain lock
    pub(crate) fn prepare(&mut self, id: u64, name: LockName, hash: u32, mode: LockMode, duration: LockDuration) {
        debug_assert!(self.block.next.is_none(), "preparing a request still in a chain");
        let block = &mut self.block;
        block.id = id;
        block.name = Some(name);
        block.hash = hash;
        block.mode = mode;
        block.duration = duration;
        block.being_released = false;
        block.release = None;
    }

    #[inline]
    pub(crate) fn next_in_chain(&self) -> Option<&LockRequest> {
        self.block.next.as_ref()
    }

    #[inline]
    pub(crate) fn chain_link_mut(&mut self) -> &mut Option<LockRequest> {
        &mut self.block.next
    }

    pub(crate) fn set_release(&mut self, link: ReleaseLink) {
        self.block.release = Some(link);
    }

    pub(crate) fn reset(&mut self) {
        let block = &mut self.block;
        block.id = 0;
        block.name = None;
        block.hash = 0;
        block.mode = LockMode::None;
        block.duration = LockDuration::None;
        block.being_released = false;
        block.release = None;
    }

    #[inline]
    pub(crate) fn matches(&self, hash: u32, name: &LockName) -> bool {
        self.block.hash == hash && self.block.name.as_ref() == Some(name)
    }

    pub(crate) fn mark_being_released(&mut self) {
        self.block.being_released = true;
    }

    /// Register interest in the commit releasing this lock, if any
    pub(crate) fn release_waiter(&self) -> Option<ReleaseWaiter> {
        if !self.block.being_released {
            return None;
        }
        self.block.release.as_ref().and_then(ReleaseLink::waiter)
    }

    pub fn id(&self) -> u64 {
        self.block.id
    }

    pub fn name(&self) -> Option<LockName> {
        self.block.name
    }

    pub fn hash(&self) -> u32 {
        self.block.hash
    }

    pub fn mode(&self) -> LockMode {
        self.block.mode
    }

    pub fn duration(&self) -> LockDuration {
        self.block.duration
    }

    pub fn is_being_released(&self) -> bool {
        self.block.being_released
    }

    /// Whether the request is currently part of a hash chain
    pub fn is_linked(&self) -> bool {
        self.block.mode != LockMode::None || self.block.duration != LockDuration::None
    }

    /// Size of the storage behind one lock request
    pub(crate) fn block_size() -> usize {
        std::mem::size_of::<RequestBlock>()
    }

    pub fn snapshot(&self) -> LockRequestInfo {
        LockRequestInfo {
            id: self.block.id,
            name: self.block.name,
            hash: self.block.hash,
            mode: self.block.mode,
            duration: self.block.duration,
            being_released: self.block.being_released,
        }
    }
}

/// Point-in-time copy of a lock request, used by dumps and scope listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRequestInfo {
    pub id: u64,
    pub name: Option<LockName>,
    pub hash: u32,
    pub mode: LockMode,
    pub duration: LockDuration,
    pub being_released: bool,
}

/// Handle to a lock granted within a scope
///
/// Handles are only meaningful for the scope that issued them; a released or
/// foreign handle is rejected with [`LockError::InvalidHandle`](crate::LockError::InvalidHandle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockRequestHandle {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
    pub(crate) request_id: u64,
}

impl LockRequestHandle {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }
}

impl fmt::Display for LockRequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lrb#{}@{}.{}", self.request_id, self.slot, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::TrackingAllocator;

    fn allocator() -> Arc<dyn LockAllocator> {
        Arc::new(TrackingAllocator::new())
    }

    #[test]
    fn test_new_request_is_unlinked() {
        let request = LockRequest::new(&allocator()).unwrap();
        assert!(!request.is_linked());
        assert_eq!(request.mode(), LockMode::None);
        assert_eq!(request.duration(), LockDuration::None);
        assert!(request.name().is_none());
    }

    #[test]
    fn test_prepare_and_reset() {
        let mut request = LockRequest::new(&allocator()).unwrap();
        let name = LockName::message(4, 10);
        request.prepare(7, name, 10, LockMode::Exclusive, LockDuration::Request);

        assert!(request.is_linked());
        assert!(request.matches(10, &name));
        assert!(!request.matches(11, &name));
        assert!(!request.matches(10, &LockName::message(5, 10)));
        assert!(request.release_waiter().is_none());

        request.mark_being_released();
        // No release link for request-duration locks
        assert!(request.release_waiter().is_none());

        request.reset();
        assert!(!request.is_linked());
        assert!(!request.is_being_released());
        assert_eq!(request.id(), 0);
    }

    #[test]
    fn test_request_reservation() {
        let tracking = Arc::new(TrackingAllocator::new());
        let allocator: Arc<dyn LockAllocator> = tracking.clone();

        let request = LockRequest::new(&allocator).unwrap();
        assert!(tracking.outstanding(MemoryKind::LockRequest) > 0);
        drop(request);
        assert_eq!(tracking.outstanding(MemoryKind::LockRequest), 0);
    }

    #[test]
    fn test_handle_display() {
        let handle = LockRequestHandle {
            slot: 2,
            generation: 5,
            request_id: 99,
        };
        assert_eq!(handle.to_string(), "lrb#99@2.5");
    }
}
