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

use crate::alloc::MemoryKind;
use crate::atomic_release::ReleaseWaiter;
use crate::types::LockName;
use thiserror::Error;

/// Lock manager error types
#[derive(Error, Debug)]
pub enum LockError {
    /// Storage for a lock manager structure could not be reserved
    #[error("Allocation failed for {kind}: {reason}")]
    AllocateError { kind: MemoryKind, reason: String },

    /// The name is already locked by another request
    ///
    /// When the conflicting lock is part of a commit that is being released,
    /// `pending_release` lets the caller wait for that commit to finish before
    /// retrying.
    #[error("Lock not granted for {name}")]
    LockNotGranted {
        name: LockName,
        pending_release: Option<ReleaseWaiter>,
    },

    /// Internal invariant violation, captured at the point of first failure
    #[error("Internal error (probe {probe}): {message}")]
    Internal { probe: u32, message: String },

    /// Handle does not refer to a lock held by this scope
    #[error("Invalid lock request handle: {handle}")]
    InvalidHandle { handle: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl Clone for LockError {
    fn clone(&self) -> Self {
        match self {
            LockError::AllocateError { kind, reason } => LockError::AllocateError {
                kind: *kind,
                reason: reason.clone(),
            },
            LockError::LockNotGranted { name, pending_release } => LockError::LockNotGranted {
                name: *name,
                pending_release: pending_release.clone(),
            },
            LockError::Internal { probe, message } => LockError::Internal {
                probe: *probe,
                message: message.clone(),
            },
            LockError::InvalidHandle { handle } => LockError::InvalidHandle { handle: handle.clone() },
            LockError::Configuration { message } => LockError::Configuration {
                message: message.clone(),
            },
        }
    }
}

impl LockError {
    /// Create allocation error
    pub fn allocate(kind: MemoryKind, reason: impl Into<String>) -> Self {
        Self::AllocateError {
            kind,
            reason: reason.into(),
        }
    }

    /// Create lock not granted error
    pub fn not_granted(name: LockName, pending_release: Option<ReleaseWaiter>) -> Self {
        Self::LockNotGranted { name, pending_release }
    }

    /// Create internal error
    pub fn internal(probe: u32, message: impl Into<String>) -> Self {
        Self::Internal {
            probe,
            message: message.into(),
        }
    }

    /// Create invalid handle error
    pub fn invalid_handle(handle: impl std::fmt::Display) -> Self {
        Self::InvalidHandle {
            handle: handle.to_string(),
        }
    }

    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Check if it is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockNotGranted { .. })
    }

    /// Check if it is a fatal error for the enclosing transaction
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AllocateError { .. } | Self::Internal { .. })
    }

    /// Waiter for the commit currently releasing the conflicting lock, if any
    pub fn pending_release(&self) -> Option<&ReleaseWaiter> {
        match self {
            Self::LockNotGranted { pending_release, .. } => pending_release.as_ref(),
            _ => None,
        }
    }
}

/// Lock operation Result type
pub type Result<T> = std::result::Result<T, LockError>;

/// Record a first-failure diagnostic and build the matching internal error.
pub(crate) fn capture_failure(probe: u32, message: &str) -> LockError {
    tracing::error!(probe, "Lock manager failure capture: {}", message);
    LockError::internal(probe, message)
}
