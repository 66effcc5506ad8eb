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

use broker_lock::{EngineContext, LockDuration, LockManager, LockManagerConfig, LockMode, LockName, ScopeOptions};
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::atomic::AtomicU8;

fn bench_request_release(c: &mut Criterion) {
    let manager = LockManager::new(LockManagerConfig::default()).unwrap();
    let scope = manager.allocate_scope(ScopeOptions::NoCommit, None).unwrap();
    let name = LockName::message(1, 42);

    c.bench_function("request_release", |b| {
        b.iter(|| {
            let handle = scope
                .try_request_lock(black_box(&name), LockMode::Exclusive, LockDuration::Request)
                .unwrap();
            scope.release_lock(handle).unwrap();
        })
    });
}

fn bench_commit_cycle(c: &mut Criterion) {
    let manager = LockManager::new(LockManagerConfig::default()).unwrap();
    let scope = manager.allocate_scope(ScopeOptions::CommitCapable, None).unwrap();
    let names: Vec<_> = (0..16).map(|node| LockName::message(2, node)).collect();

    c.bench_function("commit_cycle_16_locks", |b| {
        b.iter(|| {
            for name in &names {
                scope
                    .try_request_lock(name, LockMode::Exclusive, LockDuration::Commit)
                    .unwrap();
            }
            scope.release_all_begin().unwrap();
            scope.release_all_complete().unwrap();
        })
    });
}

fn bench_instant_peek(c: &mut Criterion) {
    let manager = LockManager::new(LockManagerConfig::default()).unwrap();
    let state = AtomicU8::new(1);
    let name = LockName::message(3, 7);

    c.bench_function("instant_lock_with_peek", |b| {
        b.iter(|| black_box(manager.instant_lock_with_peek(&name, &state).unwrap()))
    });
}

fn bench_pooled_scope(c: &mut Criterion) {
    let context = EngineContext::with_config(LockManagerConfig::default()).unwrap();

    c.bench_function("pooled_scope_allocate_free", |b| {
        b.iter(|| {
            let scope = context.allocate_scope(ScopeOptions::CommitCapable).unwrap();
            black_box(&scope);
            scope.free();
        })
    });
}

criterion_group!(
    benches,
    bench_request_release,
    bench_commit_cycle,
    bench_instant_peek,
    bench_pooled_scope
);
criterion_main!(benches);
