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

use crate::alloc::LockAllocator;
use crate::config::LockManagerConfig;
use crate::error::Result;
use crate::manager::LockManager;
use crate::pool::ScopePool;
use crate::scope::LockScope;
use crate::types::ScopeOptions;

/// Engine-wide services handed to components that take locks
///
/// Cloning is cheap and every clone shares the same lock manager and scope
/// pool.
#[derive(Debug, Clone)]
pub struct EngineContext {
    lock_manager: Arc<LockManager>,
    scope_pool: Arc<ScopePool>,
}

impl EngineContext {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            lock_manager,
            scope_pool: Arc::new(ScopePool::new()),
        }
    }

    /// Build a context around a fresh lock manager
    pub fn with_config(config: LockManagerConfig) -> Result<Self> {
        Ok(Self::new(LockManager::new(config)?))
    }

    pub fn with_allocator(config: LockManagerConfig, allocator: Arc<dyn LockAllocator>) -> Result<Self> {
        Ok(Self::new(LockManager::with_allocator(config, allocator)?))
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn scope_pool(&self) -> &Arc<ScopePool> {
        &self.scope_pool
    }

    /// Allocate a scope whose storage is recycled through the context's pool
    pub fn allocate_scope(&self, options: ScopeOptions) -> Result<LockScope> {
        self.lock_manager.allocate_scope(options, Some(&self.scope_pool))
    }
}
