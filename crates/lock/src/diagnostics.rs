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

//! Lock table dumps and hash-spread reporting.
//!
//! A dump is newline-delimited JSON: one `header` record, one `chain` record
//! per written chain and a closing `trailer`.

use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::atomic_release::AtomicRelease;
use crate::chain::LockHashChain;
use crate::config::LockManagerConfig;
use crate::manager::LockManager;
use crate::request::{LockRequest, LockRequestInfo};
use crate::scope::LockScope;
use crate::types::LockType;

/// Dump options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpOptions {
    /// Detail level, 1 to 9
    pub detail_level: u8,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self { detail_level: 5 }
    }
}

/// What a dump wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpSummary {
    pub chains_written: usize,
    pub locks_written: usize,
    pub elapsed: Duration,
}

/// Name and size of a lock manager structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureDescription {
    pub name: String,
    pub size: usize,
}

/// Distribution of granted locks over the chains of one lock type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashSpread {
    pub lock_type: LockType,
    pub chains: usize,
    pub non_empty: usize,
    pub total: usize,
    pub min: usize,
    pub max: usize,
    pub mean: f64,
}

#[derive(Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum DumpRecord<'a> {
    Header {
        version: &'static str,
        lock_types: usize,
        config: &'a LockManagerConfig,
        detail_level: u8,
    },
    Chain {
        lock_type: LockType,
        index: usize,
        header_count: usize,
        locks: Vec<LockRequestInfo>,
    },
    Trailer {
        chains: usize,
        locks: usize,
        elapsed_nanos: u64,
    },
}

fn write_record<W: Write>(writer: &mut W, record: &DumpRecord<'_>) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")
}

impl LockManager {
    /// Write every granted lock to `writer`
    ///
    /// Each chain is locked only while its own record is built. Empty chains
    /// are written from the configured detail level upwards.
    pub fn dump_locks<W: Write>(&self, options: DumpOptions, mut writer: W) -> io::Result<DumpSummary> {
        let start = Instant::now();
        let include_empty = options.detail_level >= self.config().dump_empty_chain_detail;

        write_record(
            &mut writer,
            &DumpRecord::Header {
                version: crate::VERSION,
                lock_types: self.tables().len(),
                config: self.config(),
                detail_level: options.detail_level,
            },
        )?;

        let mut chains_written = 0;
        let mut locks_written = 0;

        for table in self.tables() {
            for (index, chain) in table.chains.iter().enumerate() {
                let locks = {
                    let state = chain.lock();
                    if state.header_count() == 0 && !include_empty {
                        continue;
                    }
                    state.snapshot()
                };

                chains_written += 1;
                locks_written += locks.len();

                write_record(
                    &mut writer,
                    &DumpRecord::Chain {
                        lock_type: table.lock_type,
                        index,
                        header_count: locks.len(),
                        locks,
                    },
                )?;
            }
        }

        let elapsed = start.elapsed();
        write_record(
            &mut writer,
            &DumpRecord::Trailer {
                chains: chains_written,
                locks: locks_written,
                elapsed_nanos: u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            },
        )?;
        writer.flush()?;

        tracing::debug!(
            "Dumping locks took {:.2} secs ({}ns)",
            elapsed.as_secs_f64(),
            elapsed.as_nanos()
        );

        Ok(DumpSummary {
            chains_written,
            locks_written,
            elapsed,
        })
    }

    /// Names and sizes of the structures appearing in dumps
    pub fn describe_structures(&self) -> Vec<StructureDescription> {
        [
            ("AtomicRelease", std::mem::size_of::<AtomicRelease>()),
            ("LockRequest", LockRequest::block_size()),
            ("LockScope", std::mem::size_of::<LockScope>()),
            ("LockHashChain", std::mem::size_of::<LockHashChain>()),
            ("LockManager", std::mem::size_of::<LockManager>()),
        ]
        .into_iter()
        .map(|(name, size)| StructureDescription {
            name: name.to_string(),
            size,
        })
        .collect()
    }

    /// Chain length distribution per lock type
    pub fn hash_spread(&self) -> Vec<HashSpread> {
        self.tables()
            .iter()
            .map(|table| {
                let mut spread = HashSpread {
                    lock_type: table.lock_type,
                    chains: table.chains.len(),
                    non_empty: 0,
                    total: 0,
                    min: usize::MAX,
                    max: 0,
                    mean: 0.0,
                };

                for chain in &table.chains {
                    let length = chain.header_count();
                    if length > 0 {
                        spread.non_empty += 1;
                    }
                    spread.total += length;
                    spread.min = spread.min.min(length);
                    spread.max = spread.max.max(length);
                }

                if spread.chains == 0 {
                    spread.min = 0;
                } else {
                    spread.mean = spread.total as f64 / spread.chains as f64;
                }
                spread
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LockDuration, LockMode, LockName, ScopeOptions};
    use serde_json::Value;

    fn records(output: &[u8]) -> Vec<Value> {
        output
            .split(|byte| *byte == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| serde_json::from_slice(line).unwrap())
            .collect()
    }

    #[test]
    fn test_dump_non_empty_chains() {
        let manager = LockManager::new(LockManagerConfig::minimal()).unwrap();
        let scope = manager.allocate_scope(ScopeOptions::CommitCapable, None).unwrap();
        scope
            .try_request_lock(&LockName::message(1, 1), LockMode::Exclusive, LockDuration::Commit)
            .unwrap();
        scope
            .try_request_lock(&LockName::message(1, 2), LockMode::Exclusive, LockDuration::Request)
            .unwrap();

        let mut output = Vec::new();
        let summary = manager.dump_locks(DumpOptions::default(), &mut output).unwrap();
        assert_eq!(summary.chains_written, 2);
        assert_eq!(summary.locks_written, 2);

        let records = records(&output);
        assert_eq!(records.len(), 4);
        assert_eq!(records[0]["record"], "header");
        assert_eq!(records[1]["record"], "chain");
        assert_eq!(records[3]["record"], "trailer");
        assert_eq!(records[3]["locks"], 2);

        scope.release_all_complete().unwrap();
    }

    #[test]
    fn test_dump_empty_chains_at_high_detail() {
        let manager = LockManager::new(LockManagerConfig::minimal()).unwrap();

        let mut output = Vec::new();
        let summary = manager.dump_locks(DumpOptions { detail_level: 7 }, &mut output).unwrap();
        assert_eq!(summary.chains_written, manager.table_size() as usize);
        assert_eq!(summary.locks_written, 0);

        let mut output = Vec::new();
        let summary = manager.dump_locks(DumpOptions { detail_level: 6 }, &mut output).unwrap();
        assert_eq!(summary.chains_written, 0);
        assert_eq!(records(&output).len(), 2);
    }

    #[test]
    fn test_describe_structures() {
        let manager = LockManager::new(LockManagerConfig::minimal()).unwrap();
        let descriptions = manager.describe_structures();
        assert_eq!(descriptions.len(), 5);
        assert!(descriptions.iter().all(|d| d.size > 0));
        assert!(descriptions.iter().any(|d| d.name == "LockScope"));
    }

    #[test]
    fn test_hash_spread() {
        let manager = LockManager::new(LockManagerConfig::minimal()).unwrap();
        let scope = manager.allocate_scope(ScopeOptions::NoCommit, None).unwrap();

        // Node ids 0 and 127 share a chain in a table of 127
        for node in [0, 127, 5] {
            scope
                .try_request_lock(&LockName::message(0, node), LockMode::Exclusive, LockDuration::Request)
                .unwrap();
        }

        let spread = &manager.hash_spread()[0];
        assert_eq!(spread.lock_type, LockType::Message);
        assert_eq!(spread.chains, 127);
        assert_eq!(spread.total, 3);
        assert_eq!(spread.non_empty, 2);
        assert_eq!(spread.max, 2);
        assert_eq!(spread.min, 0);

        let handles: Vec<_> = scope.held_locks().into_iter().map(|held| held.handle).collect();
        let mut batch = scope.release_many_begin();
        for handle in handles {
            batch.release_one(handle).unwrap();
        }
        batch.complete();
    }
}
