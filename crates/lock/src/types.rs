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

/// Lock type enumeration
///
/// Each lock type owns a separate table of hash chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    /// Message node within a queue
    Message,
}

impl LockType {
    /// Number of recognized lock types
    pub const COUNT: usize = 1;

    pub const ALL: [LockType; Self::COUNT] = [LockType::Message];

    pub(crate) fn index(self) -> usize {
        match self {
            LockType::Message => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LockType::Message => "message",
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of a lockable resource
///
/// Equality requires the same lock type and equal type-specific fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockName {
    Message { qid: u32, node_id: u64 },
}

impl LockName {
    /// Lock name for message `node_id` on queue `qid`
    pub fn message(qid: u32, node_id: u64) -> Self {
        LockName::Message { qid, node_id }
    }

    pub fn lock_type(&self) -> LockType {
        match self {
            LockName::Message { .. } => LockType::Message,
        }
    }

    /// Bucket index of this name in a table of `table_size` chains
    ///
    /// The queue id is shifted in 32-bit arithmetic so that the bucket layout
    /// matches existing dumps and spread reports.
    pub fn hash_value(&self, table_size: u32) -> u32 {
        debug_assert!(table_size > 0);
        match *self {
            LockName::Message { qid, node_id } => {
                let mixed = u64::from(qid << 24) ^ node_id;
                (mixed % u64::from(table_size)) as u32
            }
        }
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockName::Message { qid, node_id } => write!(f, "msg:{qid}:{node_id}"),
        }
    }
}

/// Lock mode
///
/// The grant algorithm treats any existing lock on a name as a conflict, so
/// only `Exclusive` is meaningful for grants today. The compatibility matrix
/// is kept for callers that reason about intent modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LockMode {
    #[default]
    None,
    IntentShared,
    IntentExclusive,
    Shared,
    SharedIntentExclusive,
    Exclusive,
}

impl LockMode {
    const COUNT: usize = 6;

    fn index(self) -> usize {
        match self {
            LockMode::None => 0,
            LockMode::IntentShared => 1,
            LockMode::IntentExclusive => 2,
            LockMode::Shared => 3,
            LockMode::SharedIntentExclusive => 4,
            LockMode::Exclusive => 5,
        }
    }

    /// Mode held after granting `requested` on top of `self`, or `None` on clash
    pub fn effective_with(self, requested: LockMode) -> Option<LockMode> {
        use LockMode::*;

        // [existing][requested]
        const EFFECTIVE: [[Option<LockMode>; LockMode::COUNT]; LockMode::COUNT] = [
            [
                Some(None),
                Some(IntentShared),
                Some(IntentExclusive),
                Some(Shared),
                Some(SharedIntentExclusive),
                Some(Exclusive),
            ],
            [
                Some(IntentShared),
                Some(IntentShared),
                Some(IntentExclusive),
                Some(Shared),
                Some(SharedIntentExclusive),
                Option::None,
            ],
            [
                Some(IntentExclusive),
                Some(IntentExclusive),
                Some(IntentExclusive),
                Option::None,
                Option::None,
                Option::None,
            ],
            [
                Some(Shared),
                Some(Shared),
                Option::None,
                Some(Shared),
                Option::None,
                Option::None,
            ],
            [
                Some(SharedIntentExclusive),
                Some(SharedIntentExclusive),
                Option::None,
                Option::None,
                Option::None,
                Option::None,
            ],
            [
                Some(Exclusive),
                Option::None,
                Option::None,
                Option::None,
                Option::None,
                Option::None,
            ],
        ];

        EFFECTIVE[self.index()][requested.index()]
    }

    /// Whether `requested` can be held alongside `self`
    pub fn compatible_with(self, requested: LockMode) -> bool {
        self.effective_with(requested).is_some()
    }
}

/// How long a granted lock is held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LockDuration {
    /// Unlinked request
    #[default]
    None,
    /// Released explicitly by the caller
    Request,
    /// Released atomically with the scope's other commit-duration locks
    Commit,
}

/// Capabilities of a lock scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScopeOptions {
    /// Request-duration locks only
    #[default]
    NoCommit,
    /// May take commit-duration locks
    CommitCapable,
}

impl ScopeOptions {
    pub fn is_commit_capable(self) -> bool {
        matches!(self, ScopeOptions::CommitCapable)
    }
}

/// Delivery state of a message, as observed by an instant-lock peek
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    Available,
    Delivered,
    Received,
    Consumed,
    /// Values reserved for internal use
    Reserved(u8),
}

impl From<u8> for MessageState {
    fn from(value: u8) -> Self {
        match value {
            0 => MessageState::Available,
            1 => MessageState::Delivered,
            2 => MessageState::Received,
            3 => MessageState::Consumed,
            other => MessageState::Reserved(other),
        }
    }
}

impl From<MessageState> for u8 {
    fn from(state: MessageState) -> Self {
        match state {
            MessageState::Available => 0,
            MessageState::Delivered => 1,
            MessageState::Received => 2,
            MessageState::Consumed => 3,
            MessageState::Reserved(value) => value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_name_equality() {
        assert_eq!(LockName::message(1, 42), LockName::message(1, 42));
        assert_ne!(LockName::message(1, 42), LockName::message(2, 42));
        assert_ne!(LockName::message(1, 42), LockName::message(1, 43));
        assert_eq!(LockName::message(1, 42).lock_type(), LockType::Message);
    }

    #[test]
    fn test_message_hash() {
        let size = 24_593;
        assert_eq!(LockName::message(0, 5).hash_value(size), 5);
        assert_eq!(LockName::message(0, 24_593).hash_value(size), 0);

        let expected = ((1u64 << 24) ^ 7) % 24_593;
        assert_eq!(u64::from(LockName::message(1, 7).hash_value(size)), expected);

        // Shift overflows 32 bits and drops the high byte of the queue id
        assert_eq!(LockName::message(0x100, 9).hash_value(size), LockName::message(0, 9).hash_value(size));
    }

    #[test]
    fn test_lock_name_display() {
        assert_eq!(LockName::message(3, 99).to_string(), "msg:3:99");
    }

    #[test]
    fn test_mode_matrix() {
        use LockMode::*;

        assert_eq!(None.effective_with(Exclusive), Some(Exclusive));
        assert_eq!(IntentShared.effective_with(IntentExclusive), Some(IntentExclusive));
        assert_eq!(IntentShared.effective_with(Shared), Some(Shared));
        assert_eq!(Shared.effective_with(IntentShared), Some(Shared));
        assert_eq!(SharedIntentExclusive.effective_with(IntentShared), Some(SharedIntentExclusive));

        assert!(!IntentExclusive.compatible_with(Shared));
        assert!(!Shared.compatible_with(IntentExclusive));
        assert!(!IntentShared.compatible_with(Exclusive));
        for mode in [None, IntentShared, IntentExclusive, Shared, SharedIntentExclusive, Exclusive] {
            assert_eq!(Exclusive.compatible_with(mode), mode == None);
        }
    }

    #[test]
    fn test_message_state_conversion() {
        assert_eq!(MessageState::from(0), MessageState::Available);
        assert_eq!(MessageState::from(3), MessageState::Consumed);
        assert_eq!(MessageState::from(127), MessageState::Reserved(127));
        assert_eq!(u8::from(MessageState::Delivered), 1);
        assert_eq!(u8::from(MessageState::Reserved(128)), 128);
    }
}
