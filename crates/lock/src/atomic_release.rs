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

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::pin::pin;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

use crate::alloc::{LockAllocator, MemoryKind, Reservation};
use crate::error::Result;

/// Wait/notify object that makes the release of a scope's commit-duration
/// locks visible to other threads all at once
///
/// One object belongs to each commit-capable scope and is reused for every
/// commit of that scope. Each reuse is a release cycle: `fired` holds the most
/// recent cycle whose completion was broadcast, and a waiter for cycle `n` is
/// released once `fired >= n`.
///
/// Interest is the strong count of the owning `Arc`: one for the scope's
/// cache, one while a release is in flight and one per waiter.
pub struct AtomicRelease {
    fired: Mutex<u64>,
    event: Condvar,
    notify: Notify,
    _reservation: Reservation,
}

impl AtomicRelease {
    pub(crate) fn new(allocator: &Arc<dyn LockAllocator>) -> Result<Arc<Self>> {
        let reservation = Reservation::new(allocator, MemoryKind::AtomicRelease, std::mem::size_of::<AtomicRelease>())?;

        Ok(Arc::new(Self {
            fired: Mutex::new(0),
            event: Condvar::new(),
            notify: Notify::new(),
            _reservation: reservation,
        }))
    }

    /// Most recent release cycle whose completion was broadcast
    pub fn fired_cycle(&self) -> u64 {
        *self.fired.lock()
    }

    /// Mark `cycle` complete and wake every blocked and async waiter
    pub(crate) fn fire(&self, cycle: u64) {
        {
            let mut fired = self.fired.lock();
            if *fired < cycle {
                *fired = cycle;
            }
            self.event.notify_all();
        }
        self.notify.notify_waiters();
    }
}

impl fmt::Debug for AtomicRelease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicRelease").field("fired", &self.fired_cycle()).finish()
    }
}

/// The releasing scope's interest in its in-flight atomic release
#[derive(Debug, Clone)]
pub(crate) struct ReleaseTicket {
    pub(crate) release: Arc<AtomicRelease>,
    pub(crate) cycle: u64,
}

impl ReleaseTicket {
    pub(crate) fn link(&self) -> ReleaseLink {
        ReleaseLink {
            release: Arc::downgrade(&self.release),
            cycle: self.cycle,
        }
    }
}

/// Reference from a commit-duration lock request to its scope's atomic
/// release. Holding a link does not count as interest.
#[derive(Debug, Clone)]
pub(crate) struct ReleaseLink {
    release: Weak<AtomicRelease>,
    cycle: u64,
}

impl ReleaseLink {
    /// Register interest in the release. Must be called under the chain lock
    /// of the request holding this link.
    pub(crate) fn waiter(&self) -> Option<ReleaseWaiter> {
        self.release.upgrade().map(|release| ReleaseWaiter {
            release,
            cycle: self.cycle,
        })
    }
}

/// Handle to a commit that is releasing a conflicting lock
///
/// Returned with [`LockError::LockNotGranted`](crate::LockError::LockNotGranted).
/// Waiting consumes the handle, which drops its interest once the release has
/// completed.
#[derive(Clone)]
pub struct ReleaseWaiter {
    release: Arc<AtomicRelease>,
    cycle: u64,
}

impl ReleaseWaiter {
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Whether the release this waiter is interested in has completed
    pub fn is_fired(&self) -> bool {
        *self.release.fired.lock() >= self.cycle
    }

    /// Current interest count of the underlying atomic release
    pub fn interest(&self) -> usize {
        Arc::strong_count(&self.release)
    }

    /// Block the current thread until the release completes
    pub fn wait(self) {
        let mut fired = self.release.fired.lock();
        while *fired < self.cycle {
            self.release.event.wait(&mut fired);
        }
    }

    /// Wait for the release to complete without blocking the executor
    pub async fn wait_async(self) {
        loop {
            let mut notified = pin!(self.release.notify.notified());
            notified.as_mut().enable();

            if self.is_fired() {
                return;
            }

            notified.await;
        }
    }
}

impl fmt::Debug for ReleaseWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseWaiter")
            .field("cycle", &self.cycle)
            .field("fired", &self.is_fired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::TrackingAllocator;
    use std::thread;
    use std::time::Duration;
    use tokio::time::timeout;

    fn new_release() -> (Arc<TrackingAllocator>, Arc<AtomicRelease>) {
        let tracking = Arc::new(TrackingAllocator::new());
        let allocator: Arc<dyn LockAllocator> = tracking.clone();
        let release = AtomicRelease::new(&allocator).unwrap();
        (tracking, release)
    }

    #[test]
    fn test_blocking_waiter_released_by_fire() {
        let (_tracking, release) = new_release();
        let ticket = ReleaseTicket {
            release: release.clone(),
            cycle: 1,
        };
        let waiter = ticket.link().waiter().unwrap();
        assert_eq!(waiter.interest(), 3);
        assert!(!waiter.is_fired());

        let handle = thread::spawn(move || waiter.wait());

        thread::sleep(Duration::from_millis(10));
        release.fire(ticket.cycle);
        handle.join().unwrap();

        assert_eq!(release.fired_cycle(), 1);
    }

    #[test]
    fn test_later_cycle_does_not_see_earlier_fire() {
        let (_tracking, release) = new_release();
        release.fire(1);

        let second = ReleaseTicket { release, cycle: 2 };
        let waiter = second.link().waiter().unwrap();
        assert!(!waiter.is_fired());

        second.release.fire(2);
        assert!(waiter.is_fired());

        // Firing an old cycle never moves the state backwards
        second.release.fire(1);
        assert!(waiter.is_fired());
    }

    #[test]
    fn test_reservation_held_until_last_interest() {
        let (tracking, release) = new_release();
        let ticket = ReleaseTicket {
            release: release.clone(),
            cycle: 1,
        };
        let link = ticket.link();
        let waiter = link.waiter().unwrap();

        drop(release);
        drop(ticket);
        assert!(tracking.outstanding(MemoryKind::AtomicRelease) > 0);

        drop(waiter);
        assert_eq!(tracking.outstanding(MemoryKind::AtomicRelease), 0);
        assert!(link.waiter().is_none());
    }

    #[tokio::test]
    async fn test_async_waiter() {
        let (_tracking, release) = new_release();
        let ticket = ReleaseTicket {
            release: release.clone(),
            cycle: 1,
        };
        let waiter = ticket.link().waiter().unwrap();

        let handle = tokio::spawn(waiter.wait_async());

        tokio::time::sleep(Duration::from_millis(10)).await;
        release.fire(1);

        assert!(timeout(Duration::from_millis(500), handle).await.is_ok());
    }
}
