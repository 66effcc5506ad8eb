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
use std::env;

use crate::error::{LockError, Result};

/// Environment variable overriding [`LockManagerConfig::table_size`]
pub const ENV_LOCK_TABLE_SIZE: &str = "BROKER_LOCK_TABLE_SIZE";

/// Environment variable overriding [`LockManagerConfig::spread_report_interval`]
pub const ENV_LOCK_SPREAD_REPORT_INTERVAL: &str = "BROKER_LOCK_SPREAD_REPORT_INTERVAL";

/// Highest dump detail level
pub const MAX_DUMP_DETAIL_LEVEL: u8 = 9;

/// Lock manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockManagerConfig {
    /// Number of hash chains per lock type, ideally prime
    #[serde(default = "default_table_size")]
    pub table_size: u32,

    /// Log the hash spread every this many grants, 0 disables the report
    #[serde(default = "default_spread_report_interval")]
    pub spread_report_interval: u64,

    /// Dump detail level from which empty chains are written too
    #[serde(default = "default_dump_empty_chain_detail")]
    pub dump_empty_chain_detail: u8,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            table_size: default_table_size(),
            spread_report_interval: default_spread_report_interval(),
            dump_empty_chain_detail: default_dump_empty_chain_detail(),
        }
    }
}

// Default value functions
fn default_table_size() -> u32 {
    crate::DEFAULT_LOCK_TABLE_SIZE
}

fn default_spread_report_interval() -> u64 {
    0
}

fn default_dump_empty_chain_detail() -> u8 {
    7
}

impl LockManagerConfig {
    /// Interval used when spread reporting is switched on without a value
    pub const DEFAULT_SPREAD_REPORT_INTERVAL: u64 = 100_000;

    /// Create minimal configuration, suited to tests and tools
    pub fn minimal() -> Self {
        Self {
            table_size: 127,
            spread_report_interval: 0,
            dump_empty_chain_detail: default_dump_empty_chain_detail(),
        }
    }

    /// Create configuration for brokers holding very many message locks
    pub fn high_throughput() -> Self {
        Self {
            table_size: 196_613,
            spread_report_interval: 0,
            dump_empty_chain_detail: MAX_DUMP_DETAIL_LEVEL,
        }
    }

    /// Load configuration from the environment on top of the defaults
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| env::var(key).ok())
    }

    pub(crate) fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(table_size) = lookup(ENV_LOCK_TABLE_SIZE).and_then(|v| v.parse().ok()) {
            self.table_size = table_size;
        }

        if let Some(interval) = lookup(ENV_LOCK_SPREAD_REPORT_INTERVAL).and_then(|v| v.parse().ok()) {
            self.spread_report_interval = interval;
        }

        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.table_size == 0 {
            return Err(LockError::configuration("Lock table size must be greater than zero"));
        }

        if self.dump_empty_chain_detail == 0 || self.dump_empty_chain_detail > MAX_DUMP_DETAIL_LEVEL {
            return Err(LockError::configuration(format!(
                "Dump detail level must be between 1 and {MAX_DUMP_DETAIL_LEVEL}"
            )));
        }

        Ok(())
    }

    pub fn spread_report_enabled(&self) -> bool {
        self.spread_report_interval > 0
    }
}
