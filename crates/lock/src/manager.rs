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

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use crate::alloc::{LockAllocator, MemoryKind, Reservation, TrackingAllocator};
use crate::chain::LockHashChain;
use crate::config::LockManagerConfig;
use crate::error::{LockError, Result, capture_failure};
use crate::pool::ScopePool;
use crate::request::LockRequest;
use crate::scope::LockScope;
use crate::types::{LockName, LockType, MessageState, ScopeOptions};

/// Per-lock-type array of hash chains
pub(crate) struct LockTable {
    pub(crate) lock_type: LockType,
    pub(crate) chains: Vec<LockHashChain>,
    _reservation: Reservation,
}

impl LockTable {
    fn new(lock_type: LockType, table_size: u32, allocator: &Arc<dyn LockAllocator>) -> Result<Self> {
        let count = table_size as usize;
        let bytes = count.saturating_mul(std::mem::size_of::<LockHashChain>());
        let reservation = Reservation::new(allocator, MemoryKind::LockTable, bytes)?;

        let mut chains = Vec::new();
        chains
            .try_reserve_exact(count)
            .map_err(|e| LockError::allocate(MemoryKind::LockTable, e.to_string()))?;
        chains.extend((0..count).map(|_| LockHashChain::new()));

        Ok(Self {
            lock_type,
            chains,
            _reservation: reservation,
        })
    }
}

/// Multi-duration lock manager for message-broker transactions
///
/// Owns one lock table per lock type. Transactions take and release locks
/// through [`LockScope`]s allocated from the manager; point-in-time checks go
/// through the instant-lock operations without a scope.
pub struct LockManager {
    tables: Vec<LockTable>,
    table_size: u32,
    config: LockManagerConfig,
    allocator: Arc<dyn LockAllocator>,
    next_request_id: AtomicU64,
    grants_since_report: AtomicU64,
}

impl LockManager {
    /// Create lock manager with the default tracking allocator
    pub fn new(config: LockManagerConfig) -> Result<Arc<Self>> {
        Self::with_allocator(config, Arc::new(TrackingAllocator::new()))
    }

    /// Create lock manager drawing memory from `allocator`
    ///
    /// Any failure part way through releases everything already built.
    pub fn with_allocator(config: LockManagerConfig, allocator: Arc<dyn LockAllocator>) -> Result<Arc<Self>> {
        config.validate()?;

        let mut tables = Vec::new();
        tables
            .try_reserve_exact(LockType::COUNT)
            .map_err(|e| LockError::allocate(MemoryKind::LockTable, e.to_string()))?;

        for lock_type in LockType::ALL {
            tables.push(LockTable::new(lock_type, config.table_size, &allocator)?);
        }

        tracing::debug!(
            "Lock manager created: {} lock type(s), {} chains each",
            LockType::COUNT,
            config.table_size
        );

        Ok(Arc::new(Self {
            tables,
            table_size: config.table_size,
            config,
            allocator,
            next_request_id: AtomicU64::new(0),
            grants_since_report: AtomicU64::new(0),
        }))
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    pub fn table_size(&self) -> u32 {
        self.table_size
    }

    pub fn allocator(&self) -> &Arc<dyn LockAllocator> {
        &self.allocator
    }

    /// Allocate a lock scope for one transaction
    ///
    /// A commit-capable scope reserves its atomic release up front, so taking
    /// commit-duration locks later never fails for lack of memory.
    pub fn allocate_scope(self: &Arc<Self>, options: ScopeOptions, pool: Option<&Arc<ScopePool>>) -> Result<LockScope> {
        LockScope::new(self.clone(), options, pool.cloned())
    }

    /// Allocate a standalone lock request to be consumed by a later take
    pub fn allocate_spare_request(&self) -> Result<LockRequest> {
        LockRequest::new(&self.allocator)
    }

    /// Free a lock request that is not part of any chain
    pub fn free_request(&self, request: LockRequest) {
        debug_assert!(!request.is_linked(), "freeing a linked lock request");
        drop(request);
    }

    /// Check for a conflicting lock and read a message's delivery state
    /// while no conflicting lock can be granted
    ///
    /// Never waits for a commit in progress.
    pub fn instant_lock_with_peek(&self, name: &LockName, peek: &AtomicU8) -> Result<MessageState> {
        let hash = self.hash_name(name);
        let state = self.chain(name.lock_type(), hash).lock();

        if state.find(hash, name).is_some() {
            return Err(LockError::not_granted(*name, None));
        }

        Ok(MessageState::from(peek.load(Ordering::Acquire)))
    }

    /// Check for a conflicting lock and run `callback` while no conflicting
    /// lock can be granted
    ///
    /// The callback runs under the chain lock and must be very short. With
    /// `pause_for_commit` a conflict held by a commit that is being released
    /// is waited out and the check repeated; otherwise any conflict returns
    /// [`LockError::LockNotGranted`].
    pub fn instant_lock_with_callback<F, R>(&self, name: &LockName, pause_for_commit: bool, callback: F) -> Result<R>
    where
        F: FnOnce() -> R,
    {
        let hash = self.hash_name(name);
        let chain = self.chain(name.lock_type(), hash);

        loop {
            let waiter = {
                let state = chain.lock();
                match state.find(hash, name) {
                    None => return Ok(callback()),
                    Some(existing) if pause_for_commit => existing.release_waiter(),
                    Some(_) => None,
                }
            };

            match waiter {
                Some(waiter) => waiter.wait(),
                None => return Err(LockError::not_granted(*name, None)),
            }
        }
    }

    #[inline]
    pub(crate) fn hash_name(&self, name: &LockName) -> u32 {
        name.hash_value(self.table_size)
    }

    #[inline]
    pub(crate) fn chain(&self, lock_type: LockType, hash: u32) -> &LockHashChain {
        &self.tables[lock_type.index()].chains[(hash % self.table_size) as usize]
    }

    pub(crate) fn tables(&self) -> &[LockTable] {
        &self.tables
    }

    pub(crate) fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Remove a granted request from its chain
    pub(crate) fn unlink_from_chain(&self, name: &LockName, hash: u32, request_id: u64) -> Result<LockRequest> {
        self.chain(name.lock_type(), hash)
            .lock()
            .unlink(request_id)
            .ok_or_else(|| capture_failure(8, &format!("lock request {request_id} for {name} missing from its chain")))
    }

    pub(crate) fn mark_being_released(&self, name: &LockName, hash: u32, request_id: u64) -> bool {
        self.chain(name.lock_type(), hash).lock().mark_being_released(request_id)
    }

    /// Count a grant; returns whether this grant emitted the spread report
    pub(crate) fn record_grant(&self) -> bool {
        let interval = self.config.spread_report_interval;
        if interval == 0 {
            return false;
        }

        // Exactly one grant per interval sees the counter wrap
        let previous = self
            .grants_since_report
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |grants| {
                Some(if grants + 1 >= interval { 0 } else { grants + 1 })
            })
            .unwrap_or_default();
        if previous + 1 < interval {
            return false;
        }

        for spread in self.hash_spread() {
            tracing::debug!(
                lock_type = %spread.lock_type,
                chains = spread.chains,
                non_empty = spread.non_empty,
                total = spread.total,
                min = spread.min,
                max = spread.max,
                mean = spread.mean,
                "Lock hash spread"
            );
        }
        true
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("lock_types", &self.tables.len())
            .field("table_size", &self.table_size)
            .field("config", &self.config)
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        tracing::debug!("Lock manager destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LockDuration;
    use crate::types::LockMode;

    #[test]
    fn test_manager_creation() {
        let tracking = Arc::new(TrackingAllocator::new());
        let manager = LockManager::with_allocator(LockManagerConfig::minimal(), tracking.clone()).unwrap();

        assert_eq!(manager.table_size(), 127);
        assert_eq!(manager.tables().len(), LockType::COUNT);
        assert!(tracking.outstanding(MemoryKind::LockTable) > 0);

        drop(manager);
        assert_eq!(tracking.total_outstanding(), 0);
    }

    #[test]
    fn test_manager_creation_refused() {
        let tracking = Arc::new(TrackingAllocator::with_limit(64));
        let err = LockManager::with_allocator(LockManagerConfig::minimal(), tracking.clone()).unwrap_err();

        assert!(matches!(err, LockError::AllocateError { kind: MemoryKind::LockTable, .. }));
        assert_eq!(tracking.total_outstanding(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = LockManagerConfig {
            table_size: 0,
            ..LockManagerConfig::minimal()
        };
        assert!(matches!(LockManager::new(config), Err(LockError::Configuration { .. })));
    }

    #[test]
    fn test_instant_lock_with_peek() {
        let manager = LockManager::new(LockManagerConfig::minimal()).unwrap();
        let name = LockName::message(1, 500);
        let delivery_state = AtomicU8::new(1);

        assert_eq!(manager.instant_lock_with_peek(&name, &delivery_state).unwrap(), MessageState::Delivered);

        let scope = manager.allocate_scope(ScopeOptions::NoCommit, None).unwrap();
        let handle = scope
            .try_request_lock(&name, LockMode::Exclusive, LockDuration::Request)
            .unwrap();

        let err = manager.instant_lock_with_peek(&name, &delivery_state).unwrap_err();
        assert!(err.is_retryable());
        assert!(err.pending_release().is_none());

        scope.release_lock(handle).unwrap();
        assert!(manager.instant_lock_with_peek(&name, &delivery_state).is_ok());
    }

    #[test]
    fn test_instant_lock_with_callback() {
        let manager = LockManager::new(LockManagerConfig::minimal()).unwrap();
        let name = LockName::message(2, 7);

        assert_eq!(manager.instant_lock_with_callback(&name, false, || 42).unwrap(), 42);

        let scope = manager.allocate_scope(ScopeOptions::NoCommit, None).unwrap();
        let handle = scope
            .try_request_lock(&name, LockMode::Exclusive, LockDuration::Request)
            .unwrap();

        let mut called = false;
        let result = manager.instant_lock_with_callback(&name, true, || called = true);
        assert!(matches!(result, Err(LockError::LockNotGranted { .. })));
        assert!(!called);

        scope.release_lock(handle).unwrap();
    }

    #[test]
    fn test_spread_report_claimed_once_per_interval() {
        let config = LockManagerConfig {
            spread_report_interval: 100,
            ..LockManagerConfig::minimal()
        };
        let manager = LockManager::new(config).unwrap();

        let reports: usize = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| s.spawn(|| (0..300).filter(|_| manager.record_grant()).count()))
                .collect();
            workers.into_iter().map(|worker| worker.join().unwrap()).sum()
        });

        assert_eq!(reports, 24);
        assert_eq!(manager.grants_since_report.load(Ordering::Relaxed), 0);
        assert!(!LockManager::new(LockManagerConfig::minimal()).unwrap().record_grant());
    }

    #[test]
    fn test_request_ids_are_unique() {
        let manager = LockManager::new(LockManagerConfig::minimal()).unwrap();
        let first = manager.next_request_id();
        let second = manager.next_request_id();
        assert_ne!(first, 0);
        assert!(second > first);
    }
}
