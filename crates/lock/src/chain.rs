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

use parking_lot::{Mutex, MutexGuard};
use std::fmt;

use crate::request::{LockRequest, LockRequestInfo};
use crate::types::LockName;

/// One bucket of a lock table
///
/// Holds every granted lock request whose name hashes to this bucket, in
/// grant order. Requests are linked through their own storage, so linking and
/// unlinking never allocate. Contention is partitioned across buckets, so the
/// mutex is only held for a scan plus a link or unlink.
#[derive(Debug, Default)]
pub(crate) struct LockHashChain {
    state: Mutex<ChainState>,
}

#[derive(Default)]
pub(crate) struct ChainState {
    head: Option<LockRequest>,
    count: usize,
}

impl LockHashChain {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock()
    }

    pub(crate) fn header_count(&self) -> usize {
        self.state.lock().header_count()
    }
}

impl ChainState {
    fn iter(&self) -> impl Iterator<Item = &LockRequest> + '_ {
        std::iter::successors(self.head.as_ref(), |request| request.next_in_chain())
    }

    /// Any request on `name` conflicts, whatever the modes involved
    pub(crate) fn find(&self, hash: u32, name: &LockName) -> Option<&LockRequest> {
        self.iter().find(|request| request.matches(hash, name))
    }

    /// Append at the tail
    pub(crate) fn link(&mut self, request: LockRequest) {
        let mut cursor = &mut self.head;
        while let Some(node) = cursor {
            cursor = node.chain_link_mut();
        }
        *cursor = Some(request);
        self.count += 1;
    }

    pub(crate) fn unlink(&mut self, request_id: u64) -> Option<LockRequest> {
        let mut cursor = &mut self.head;
        while cursor.as_ref().is_some_and(|request| request.id() != request_id) {
            cursor = cursor.as_mut()?.chain_link_mut();
        }

        let mut removed = cursor.take()?;
        *cursor = removed.chain_link_mut().take();
        self.count -= 1;
        Some(removed)
    }

    pub(crate) fn mark_being_released(&mut self, request_id: u64) -> bool {
        let mut cursor = self.head.as_mut();
        while let Some(request) = cursor {
            if request.id() == request_id {
                request.mark_being_released();
                return true;
            }
            cursor = request.chain_link_mut().as_mut();
        }
        false
    }

    #[inline]
    pub(crate) fn header_count(&self) -> usize {
        self.count
    }

    pub(crate) fn snapshot(&self) -> Vec<LockRequestInfo> {
        self.iter().map(LockRequest::snapshot).collect()
    }
}

impl fmt::Debug for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainState").field("count", &self.count).finish()
    }
}

impl Drop for ChainState {
    // Iterative, so a long chain cannot overflow the stack
    fn drop(&mut self) {
        let mut next = self.head.take();
        while let Some(mut request) = next {
            next = request.chain_link_mut().take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{LockAllocator, TrackingAllocator};
    use crate::types::{LockDuration, LockMode};
    use std::sync::Arc;

    fn request(id: u64, name: LockName, hash: u32) -> LockRequest {
        let allocator: Arc<dyn LockAllocator> = Arc::new(TrackingAllocator::new());
        let mut request = LockRequest::new(&allocator).unwrap();
        request.prepare(id, name, hash, LockMode::Exclusive, LockDuration::Request);
        request
    }

    #[test]
    fn test_link_find_unlink() {
        let chain = LockHashChain::new();
        let first = LockName::message(1, 100);
        let second = LockName::message(2, 100);

        {
            let mut state = chain.lock();
            state.link(request(1, first, 3));
            state.link(request(2, second, 3));
        }
        assert_eq!(chain.header_count(), 2);

        let mut state = chain.lock();
        assert_eq!(state.find(3, &first).map(LockRequest::id), Some(1));
        assert_eq!(state.find(3, &second).map(LockRequest::id), Some(2));
        assert!(state.find(4, &first).is_none());
        assert!(state.find(3, &LockName::message(3, 100)).is_none());

        let removed = state.unlink(1).unwrap();
        assert_eq!(removed.name(), Some(first));
        assert!(state.unlink(1).is_none());
        assert_eq!(state.header_count(), 1);
    }

    #[test]
    fn test_unlink_keeps_grant_order() {
        let chain = LockHashChain::new();
        let mut state = chain.lock();
        for id in 1..=4 {
            state.link(request(id, LockName::message(0, id), 0));
        }

        // Middle, tail, then head
        let middle = state.unlink(2).unwrap();
        assert!(middle.next_in_chain().is_none());
        state.unlink(4).unwrap();
        let ids: Vec<_> = state.snapshot().iter().map(|info| info.id).collect();
        assert_eq!(ids, vec![1, 3]);

        state.unlink(1).unwrap();
        state.link(request(5, LockName::message(0, 5), 0));
        let ids: Vec<_> = state.snapshot().iter().map(|info| info.id).collect();
        assert_eq!(ids, vec![3, 5]);
        assert_eq!(state.header_count(), 2);
    }

    #[test]
    fn test_mark_being_released() {
        let chain = LockHashChain::new();
        let name = LockName::message(9, 9);
        let mut state = chain.lock();
        state.link(request(5, name, 9));

        assert!(state.mark_being_released(5));
        assert!(!state.mark_being_released(6));
        assert!(state.snapshot()[0].being_released);
    }
}
