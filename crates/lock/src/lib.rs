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

// ============================================================================
// Core Module Declarations
// ============================================================================

// Lock table and transaction scopes
pub mod manager;
pub mod scope;

// Building blocks
pub mod atomic_release;
mod chain;
pub mod request;

// Ambient services
pub mod alloc;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod pool;

// Core Modules
pub mod error;
pub mod types;

// ============================================================================
// Public API Exports
// ============================================================================

pub use crate::{
    alloc::{LockAllocator, MemoryKind, TrackingAllocator},
    atomic_release::{AtomicRelease, ReleaseWaiter},
    config::LockManagerConfig,
    context::EngineContext,
    diagnostics::{DumpOptions, DumpSummary, HashSpread, StructureDescription},
    error::{LockError, Result},
    manager::LockManager,
    pool::{ScopePool, ScopePoolStats},
    request::{LockRequest, LockRequestHandle, LockRequestInfo},
    scope::{HeldLock, LockScope, ReleaseMany},
    types::{LockDuration, LockMode, LockName, LockType, MessageState, ScopeOptions},
};

// ============================================================================
// Version Information
// ============================================================================

/// Current version of the lock crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of hash chains per lock type
pub const DEFAULT_LOCK_TABLE_SIZE: u32 = 24_593;
