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

//! Lock scopes: the set of locks held by one transaction.
//!
//! Lock order is scope, then chain. An atomic release is only waited on or
//! fired once both are dropped.

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::Arc;

use crate::alloc::{MemoryKind, Reservation};
use crate::atomic_release::{AtomicRelease, ReleaseLink, ReleaseTicket};
use crate::error::{LockError, Result, capture_failure};
use crate::manager::LockManager;
use crate::pool::ScopePool;
use crate::request::{LockRequest, LockRequestHandle};
use crate::types::{LockDuration, LockMode, LockName, ScopeOptions};

/// Lock list slots kept free, so takes with a caller-supplied spare need no
/// allocation
pub(crate) const RESERVED_SLOTS: usize = 16;

/// Entry in a scope's lock list
#[derive(Debug, Clone, Default)]
pub(crate) struct ScopeSlot {
    generation: u32,
    entry: Option<SlotEntry>,
    prev: Option<u32>,
    /// Next in the lock list, or next free slot when unused
    next: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    request_id: u64,
    name: LockName,
    hash: u32,
    mode: LockMode,
    duration: LockDuration,
}

/// Lock held by a scope, as listed by [`LockScope::held_locks`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeldLock {
    pub handle: LockRequestHandle,
    pub name: LockName,
    pub mode: LockMode,
    pub duration: LockDuration,
}

struct ScopeState {
    slots: Vec<ScopeSlot>,
    head: Option<u32>,
    tail: Option<u32>,
    free_head: Option<u32>,
    request_count: usize,
    commit_duration_count: usize,
    cached_request: Option<LockRequest>,
    cached_release: Option<Arc<AtomicRelease>>,
    in_flight: Option<ReleaseTicket>,
    release_cycle: u64,
}

impl ScopeState {
    fn new(slots: Vec<ScopeSlot>, cached_release: Option<Arc<AtomicRelease>>) -> Self {
        Self {
            slots,
            head: None,
            tail: None,
            free_head: None,
            request_count: 0,
            commit_duration_count: 0,
            cached_request: None,
            cached_release,
            in_flight: None,
            release_cycle: 0,
        }
    }

    fn take_or_allocate_request(&mut self, manager: &LockManager) -> Result<LockRequest> {
        match self.cached_request.take() {
            Some(request) => Ok(request),
            None => LockRequest::new(manager.allocator()),
        }
    }

    /// Keep at most one unlinked request for the next grant
    fn recycle(&mut self, mut request: LockRequest) {
        request.reset();
        if self.cached_request.is_none() {
            self.cached_request = Some(request);
        }
    }

    /// Entries that can be linked without growing the slot buffer
    fn headroom(&self) -> usize {
        self.slots.capacity() - self.request_count
    }

    /// Make sure `count` more entries can be linked without allocating
    fn reserve_slots(&mut self, count: usize) -> Result<()> {
        let free = self.slots.len() - self.request_count;
        if free < count {
            self.slots
                .try_reserve(count - free)
                .map_err(|e| LockError::allocate(MemoryKind::LockScope, e.to_string()))?;
        }
        Ok(())
    }

    /// Restore the reserved headroom after a grant that was allowed to allocate
    fn rearm(&mut self) {
        if let Err(err) = self.reserve_slots(RESERVED_SLOTS) {
            tracing::warn!("Lock scope headroom not restored: {}", err);
        }
    }

    /// Start a release cycle on the first commit-duration grant since the
    /// last completed release
    fn promote_release(&mut self) -> Option<ReleaseLink> {
        if self.in_flight.is_none() {
            let release = self.cached_release.as_ref()?.clone();
            self.release_cycle += 1;
            self.in_flight = Some(ReleaseTicket {
                release,
                cycle: self.release_cycle,
            });
        }
        self.in_flight.as_ref().map(ReleaseTicket::link)
    }

    fn push_back(&mut self, entry: SlotEntry) -> LockRequestHandle {
        let index = match self.free_head {
            Some(index) => {
                self.free_head = self.slots[index as usize].next;
                index
            }
            None => {
                self.slots.push(ScopeSlot::default());
                (self.slots.len() - 1) as u32
            }
        };

        let tail = self.tail;
        let slot = &mut self.slots[index as usize];
        slot.entry = Some(entry);
        slot.prev = tail;
        slot.next = None;
        let generation = slot.generation;

        match tail {
            Some(tail) => self.slots[tail as usize].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.request_count += 1;

        LockRequestHandle {
            slot: index,
            generation,
            request_id: entry.request_id,
        }
    }

    fn entry(&self, handle: LockRequestHandle) -> Option<SlotEntry> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.filter(|entry| entry.request_id == handle.request_id)
    }

    fn remove(&mut self, handle: LockRequestHandle) -> Option<SlotEntry> {
        let entry = self.entry(handle)?;
        self.detach(handle.slot);
        Some(entry)
    }

    fn pop_back(&mut self) -> Option<SlotEntry> {
        let index = self.tail?;
        let entry = self.slots[index as usize].entry?;
        self.detach(index);
        Some(entry)
    }

    fn detach(&mut self, index: u32) {
        let (prev, next) = {
            let slot = &mut self.slots[index as usize];
            let links = (slot.prev, slot.next);
            slot.entry = None;
            slot.generation = slot.generation.wrapping_add(1);
            slot.prev = None;
            slot.next = self.free_head;
            links
        };
        self.free_head = Some(index);

        match prev {
            Some(prev) => self.slots[prev as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slots[next as usize].prev = prev,
            None => self.tail = prev,
        }

        self.request_count -= 1;
    }

    fn held(&self) -> impl Iterator<Item = HeldLock> + '_ {
        std::iter::successors(self.head, move |&index| self.slots[index as usize].next).filter_map(move |index| {
            let slot = &self.slots[index as usize];
            slot.entry.map(|entry| HeldLock {
                handle: LockRequestHandle {
                    slot: index,
                    generation: slot.generation,
                    request_id: entry.request_id,
                },
                name: entry.name,
                mode: entry.mode,
                duration: entry.duration,
            })
        })
    }
}

/// Transaction container for granted locks
///
/// Holds the scope's lock list, one spare lock request and, for commit-capable
/// scopes, the atomic release used to publish the release of all
/// commit-duration locks at once. A scope must hold no locks when it is
/// freed.
pub struct LockScope {
    manager: Arc<LockManager>,
    options: ScopeOptions,
    state: Mutex<ScopeState>,
    pool: Option<Arc<ScopePool>>,
    _reservation: Reservation,
}

impl LockScope {
    pub(crate) fn new(manager: Arc<LockManager>, options: ScopeOptions, pool: Option<Arc<ScopePool>>) -> Result<Self> {
        let reservation = Reservation::new(manager.allocator(), MemoryKind::LockScope, std::mem::size_of::<LockScope>())?;

        let cached_release = if options.is_commit_capable() {
            Some(AtomicRelease::new(manager.allocator())?)
        } else {
            None
        };

        let slots = pool.as_ref().map(|pool| pool.acquire()).unwrap_or_default();
        let mut state = ScopeState::new(slots, cached_release);
        state.reserve_slots(RESERVED_SLOTS)?;

        tracing::trace!(?options, pooled = pool.is_some(), "Lock scope allocated");

        Ok(Self {
            manager,
            options,
            state: Mutex::new(state),
            pool,
            _reservation: reservation,
        })
    }

    pub fn manager(&self) -> &Arc<LockManager> {
        &self.manager
    }

    pub fn options(&self) -> ScopeOptions {
        self.options
    }

    pub fn is_commit_capable(&self) -> bool {
        self.options.is_commit_capable()
    }

    /// Whether the scope's list storage came from a [`ScopePool`]
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().request_count
    }

    pub fn commit_duration_count(&self) -> usize {
        self.state.lock().commit_duration_count
    }

    pub fn has_cached_request(&self) -> bool {
        self.state.lock().cached_request.is_some()
    }

    /// Interest count of the scope's atomic release, if commit-capable
    pub fn release_interest(&self) -> Option<usize> {
        self.state.lock().cached_release.as_ref().map(Arc::strong_count)
    }

    /// Number of takes with a caller-supplied spare that need no allocation
    pub fn take_headroom(&self) -> usize {
        self.state.lock().headroom()
    }

    /// Guarantee that the next `count` takes with a caller-supplied spare
    /// need no allocation
    ///
    /// Every scope starts with, and after each allocating grant returns to,
    /// a headroom of at least 16 takes.
    pub fn reserve_takes(&self, count: usize) -> Result<()> {
        self.state.lock().reserve_slots(count)
    }

    /// Locks currently held, oldest first
    pub fn held_locks(&self) -> Vec<HeldLock> {
        self.state.lock().held().collect()
    }

    /// Take a lock the caller knows is uncontested
    ///
    /// No conflict check is made. With `spare` supplied and
    /// [`take_headroom`](Self::take_headroom) above zero the take makes no
    /// allocation and cannot fail for lack of memory. If the take fails the
    /// spare becomes the scope's cached request.
    pub fn take_lock(
        &self,
        spare: Option<LockRequest>,
        name: &LockName,
        mode: LockMode,
        duration: LockDuration,
    ) -> Result<LockRequestHandle> {
        debug_assert!(duration != LockDuration::None);
        debug_assert!(duration != LockDuration::Commit || mode == LockMode::Exclusive);

        let hash = self.manager.hash_name(name);
        let mut state = self.state.lock();

        let checked = if duration == LockDuration::Commit && state.cached_release.is_none() {
            Err(capture_failure(9, "Atomic release not allocated"))
        } else {
            state.reserve_slots(1)
        };
        if let Err(err) = checked {
            if let Some(spare) = spare {
                state.recycle(spare);
            }
            return Err(err);
        }

        let allocating = spare.is_none();
        let mut request = match spare {
            Some(request) => request,
            None => state.take_or_allocate_request(&self.manager)?,
        };

        let request_id = self.manager.next_request_id();
        request.prepare(request_id, *name, hash, mode, duration);

        {
            let mut chain = self.manager.chain(name.lock_type(), hash).lock();
            if duration == LockDuration::Commit {
                if let Some(link) = state.promote_release() {
                    request.set_release(link);
                }
            }
            chain.link(request);
        }

        let handle = self.link_to_scope(&mut state, request_id, *name, hash, mode, duration);
        if allocating {
            state.rearm();
        }
        drop(state);

        self.manager.record_grant();
        Ok(handle)
    }

    /// Request a lock once
    ///
    /// Returns [`LockError::LockNotGranted`] if any lock is held on `name`. When
    /// that lock belongs to a commit being released, the error carries a
    /// waiter; retrying after it fires is expected to succeed.
    pub fn try_request_lock(&self, name: &LockName, mode: LockMode, duration: LockDuration) -> Result<LockRequestHandle> {
        debug_assert!(duration != LockDuration::None);
        debug_assert!(duration != LockDuration::Commit || mode == LockMode::Exclusive);

        let hash = self.manager.hash_name(name);
        let mut state = self.state.lock();

        if duration == LockDuration::Commit && state.cached_release.is_none() {
            return Err(capture_failure(10, "Atomic release not allocated"));
        }

        state.reserve_slots(1)?;
        let mut request = state.take_or_allocate_request(&self.manager)?;

        let request_id = self.manager.next_request_id();
        request.prepare(request_id, *name, hash, mode, duration);

        {
            let mut chain = self.manager.chain(name.lock_type(), hash).lock();

            let conflict = chain.find(hash, name).map(LockRequest::release_waiter);
            if let Some(pending_release) = conflict {
                drop(chain);
                state.recycle(request);
                return Err(LockError::not_granted(*name, pending_release));
            }

            if duration == LockDuration::Commit {
                if let Some(link) = state.promote_release() {
                    request.set_release(link);
                }
            }
            chain.link(request);
        }

        let handle = self.link_to_scope(&mut state, request_id, *name, hash, mode, duration);
        state.rearm();
        drop(state);

        self.manager.record_grant();
        Ok(handle)
    }

    /// Request a lock, blocking while a conflicting commit is being released
    ///
    /// A conflict with a lock that is not being released is returned at once.
    pub fn request_lock(&self, name: &LockName, mode: LockMode, duration: LockDuration) -> Result<LockRequestHandle> {
        loop {
            match self.try_request_lock(name, mode, duration) {
                Err(LockError::LockNotGranted {
                    pending_release: Some(waiter),
                    ..
                }) => waiter.wait(),
                result => return result,
            }
        }
    }

    /// Async variant of [`request_lock`](Self::request_lock)
    pub async fn request_lock_async(&self, name: &LockName, mode: LockMode, duration: LockDuration) -> Result<LockRequestHandle> {
        loop {
            match self.try_request_lock(name, mode, duration) {
                Err(LockError::LockNotGranted {
                    pending_release: Some(waiter),
                    ..
                }) => waiter.wait_async().await,
                result => return result,
            }
        }
    }

    /// Release a request-duration lock, keeping its storage as the spare
    pub fn release_lock(&self, handle: LockRequestHandle) -> Result<()> {
        let mut state = self.state.lock();
        let request = self.unlink_request(&mut state, handle)?;
        state.recycle(request);
        Ok(())
    }

    /// Release a request-duration lock and hand its storage back
    ///
    /// The returned request can be passed to [`take_lock`](Self::take_lock) or
    /// freed with [`LockManager::free_request`].
    pub fn release_lock_no_free(&self, handle: LockRequestHandle) -> Result<LockRequest> {
        let mut state = self.state.lock();
        let mut request = self.unlink_request(&mut state, handle)?;
        request.reset();
        Ok(request)
    }

    /// Mark every commit-duration lock as being released
    ///
    /// From here until [`release_all_complete`](Self::release_all_complete),
    /// requesters of those locks wait for the whole commit instead of being
    /// refused.
    pub fn release_all_begin(&self) -> Result<()> {
        let state = self.state.lock();
        if state.commit_duration_count == 0 {
            return Ok(());
        }

        let mut result = Ok(());
        for held in state.held().filter(|held| held.duration == LockDuration::Commit) {
            let hash = self.manager.hash_name(&held.name);
            if !self.manager.mark_being_released(&held.name, hash, held.handle.request_id) && result.is_ok() {
                result = Err(capture_failure(12, &format!("commit lock {} missing from its chain", held.name)));
            }
        }
        result
    }

    /// Release every lock in the scope and wake waiters of this commit
    ///
    /// Locks are unlinked newest first. Waiters are woken only after the scope
    /// lock is dropped, so they observe the whole release.
    pub fn release_all_complete(&self) -> Result<()> {
        let mut state = self.state.lock();

        let mut result = Ok(());
        while let Some(entry) = state.pop_back() {
            match self.manager.unlink_from_chain(&entry.name, entry.hash, entry.request_id) {
                Ok(request) => state.recycle(request),
                Err(err) => {
                    if result.is_ok() {
                        result = Err(err);
                    }
                }
            }
        }
        state.commit_duration_count = 0;

        let fire = state.in_flight.take().map(|ticket| {
            let cached = usize::from(state.cached_release.is_some());
            let others = Arc::strong_count(&ticket.release).saturating_sub(1 + cached);
            (ticket, others)
        });
        drop(state);

        if let Some((ticket, waiters)) = fire {
            if waiters > 0 {
                ticket.release.fire(ticket.cycle);
            }
            tracing::trace!(cycle = ticket.cycle, waiters, "Commit locks released");
        }

        result
    }

    /// Hold the scope lock across a batch of single releases
    pub fn release_many_begin(&self) -> ReleaseMany<'_> {
        ReleaseMany {
            scope: self,
            state: self.state.lock(),
        }
    }

    /// Free the scope; it must not hold any locks
    pub fn free(self) {
        drop(self);
    }

    fn link_to_scope(
        &self,
        state: &mut ScopeState,
        request_id: u64,
        name: LockName,
        hash: u32,
        mode: LockMode,
        duration: LockDuration,
    ) -> LockRequestHandle {
        if duration == LockDuration::Commit {
            state.commit_duration_count += 1;
        }

        let handle = state.push_back(SlotEntry {
            request_id,
            name,
            hash,
            mode,
            duration,
        });

        tracing::trace!(request_id, %name, ?mode, ?duration, "Lock granted");
        handle
    }

    fn unlink_request(&self, state: &mut ScopeState, handle: LockRequestHandle) -> Result<LockRequest> {
        let entry = state.entry(handle).ok_or_else(|| LockError::invalid_handle(handle))?;
        if entry.duration == LockDuration::Commit {
            return Err(capture_failure(11, "Commit-duration lock released individually"));
        }

        state.remove(handle);
        self.manager.unlink_from_chain(&entry.name, entry.hash, entry.request_id)
    }
}

impl fmt::Debug for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LockScope")
            .field("options", &self.options)
            .field("request_count", &state.request_count)
            .field("commit_duration_count", &state.commit_duration_count)
            .field("release_cycle", &state.release_cycle)
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

impl Drop for LockScope {
    fn drop(&mut self) {
        let state = self.state.get_mut();

        if !std::thread::panicking() {
            assert_eq!(
                state.request_count, 0,
                "lock scope freed while holding {} lock request(s)",
                state.request_count
            );
        }

        state.cached_request = None;
        state.in_flight = None;
        // Drops the interest that keeps the atomic release alive; waiters
        // still holding it keep it until they wake.
        state.cached_release = None;

        if let Some(pool) = &self.pool {
            pool.release(std::mem::take(&mut state.slots));
        }
    }
}

/// Batch of single releases under one hold of the scope lock
///
/// Created by [`LockScope::release_many_begin`]; the scope lock is released
/// when the batch is completed or dropped.
pub struct ReleaseMany<'a> {
    scope: &'a LockScope,
    state: MutexGuard<'a, ScopeState>,
}

impl ReleaseMany<'_> {
    /// Release one request-duration lock of the batch
    pub fn release_one(&mut self, handle: LockRequestHandle) -> Result<()> {
        let request = self.scope.unlink_request(&mut self.state, handle)?;
        self.state.recycle(request);
        Ok(())
    }

    /// End the batch, releasing the scope lock
    pub fn complete(self) {
        drop(self.state);
    }
}
