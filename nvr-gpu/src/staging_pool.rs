//! Deferred-reclaim pool of staging resources
//!
//! A resource released during tick T may still be read by GPU work queued
//! in T. It becomes reusable only after `frames_until_safe` further ticks
//! have completed, and is destroyed after `frames_until_evict` idle ticks.
//!
//! Render-thread only; the pool is owned by the render state and needs no
//! locking of its own.

use crate::backend::{RenderBackend, StagingId};
use crate::error::StagingError;
use nvr_video::StagingDesc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Ticks a released resource waits before reuse
pub const DEFAULT_FRAMES_UNTIL_SAFE: u64 = 3;

/// Idle ticks before a free resource is destroyed
pub const DEFAULT_FRAMES_UNTIL_EVICT: u64 = 3600;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Exclusive use of one staging resource for the current tick.
///
/// Not `Clone`; must be handed back through [`StagingPool::release`].
#[derive(Debug)]
#[must_use = "leases must be released back to the pool"]
pub struct StagingLease {
    id: StagingId,
    desc: StagingDesc,
    pool_id: u64,
}

impl StagingLease {
    pub fn id(&self) -> StagingId {
        self.id
    }

    pub fn desc(&self) -> &StagingDesc {
        &self.desc
    }
}

#[derive(Debug)]
struct FreeEntry {
    id: StagingId,
    last_used: u64,
}

#[derive(Debug)]
struct UnsafeEntry {
    id: StagingId,
    desc: StagingDesc,
    safe_tick: u64,
}

/// What the end-of-tick pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reclaimed {
    pub promoted: usize,
    pub evicted: usize,
}

pub struct StagingPool {
    id: u64,
    frames_until_safe: u64,
    frames_until_evict: u64,

    /// Keyed free lists used as stacks: reuse from the back, evict from
    /// the front. Keys with no entries are removed.
    free: BTreeMap<StagingDesc, VecDeque<FreeEntry>>,
    /// Released entries in release order; `safe_tick` is non-decreasing
    unsafe_queue: VecDeque<UnsafeEntry>,
    leased: HashMap<StagingId, StagingDesc>,

    /// Tick currently being recorded
    current_tick: u64,

    created: u64,
    reused: u64,
    evicted: u64,
    create_failures: u64,
}

impl StagingPool {
    /// Create an empty pool
    ///
    /// `frames_until_safe` is raised to 1 and `frames_until_evict` kept
    /// above it if the caller passes smaller values.
    pub fn new(frames_until_safe: u64, frames_until_evict: u64) -> Self {
        let frames_until_safe = frames_until_safe.max(1);
        let frames_until_evict = frames_until_evict.max(frames_until_safe + 1);

        StagingPool {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            frames_until_safe,
            frames_until_evict,
            free: BTreeMap::new(),
            unsafe_queue: VecDeque::new(),
            leased: HashMap::new(),
            current_tick: 0,
            created: 0,
            reused: 0,
            evicted: 0,
            create_failures: 0,
        }
    }

    /// Lease a resource for `desc`, reusing a safe one when available.
    ///
    /// A backend creation failure is returned to the caller, which skips
    /// the plane for this tick.
    pub fn acquire(
        &mut self,
        backend: &mut dyn RenderBackend,
        desc: StagingDesc,
    ) -> Result<StagingLease, StagingError> {
        if desc.is_empty() {
            return Err(StagingError::EmptyDesc(desc));
        }

        let reused = match self.free.get_mut(&desc) {
            Some(list) => {
                let entry = list.pop_back();
                if list.is_empty() {
                    self.free.remove(&desc);
                }
                entry
            }
            None => None,
        };

        let id = match reused {
            Some(entry) => {
                self.reused += 1;
                entry.id
            }
            None => match backend.create_staging(&desc) {
                Ok(id) => {
                    self.created += 1;
                    log::debug!(
                        "{}: created staging {:?} for {:?}",
                        backend.name(),
                        id,
                        desc
                    );
                    id
                }
                Err(err) => {
                    self.create_failures += 1;
                    log::warn!("{}: staging creation failed: {}", backend.name(), err);
                    return Err(err.into());
                }
            },
        };

        self.leased.insert(id, desc);
        Ok(StagingLease {
            id,
            desc,
            pool_id: self.id,
        })
    }

    /// Return a lease. The resource becomes reusable once
    /// `frames_until_safe` ticks after the current one have completed.
    pub fn release(&mut self, lease: StagingLease) {
        if lease.pool_id != self.id || self.leased.remove(&lease.id).is_none() {
            log::error!(
                "staging {:?} released to pool {} but leased from pool {}",
                lease.id,
                self.id,
                lease.pool_id
            );
            debug_assert!(false, "staging lease released to the wrong pool");
            return;
        }

        self.unsafe_queue.push_back(UnsafeEntry {
            id: lease.id,
            desc: lease.desc,
            safe_tick: self.current_tick + self.frames_until_safe,
        });
    }

    /// Close `tick`: promote entries whose safety tick has been reached and
    /// destroy free entries idle for `frames_until_evict` ticks.
    pub fn process_end_of_tick(&mut self, tick: u64, backend: &mut dyn RenderBackend) -> Reclaimed {
        if !self.leased.is_empty() {
            log::warn!(
                "{} staging leases still outstanding at end of tick {}",
                self.leased.len(),
                tick
            );
        }

        let mut reclaimed = Reclaimed::default();

        while self
            .unsafe_queue
            .front()
            .is_some_and(|entry| entry.safe_tick <= tick)
        {
            let Some(entry) = self.unsafe_queue.pop_front() else {
                break;
            };
            self.free.entry(entry.desc).or_default().push_back(FreeEntry {
                id: entry.id,
                last_used: tick,
            });
            reclaimed.promoted += 1;
        }

        let horizon = self.frames_until_evict;
        for list in self.free.values_mut() {
            while list
                .front()
                .is_some_and(|entry| entry.last_used + horizon <= tick)
            {
                if let Some(entry) = list.pop_front() {
                    backend.destroy_staging(entry.id);
                    reclaimed.evicted += 1;
                }
            }
        }
        if reclaimed.evicted > 0 {
            self.free.retain(|_, list| !list.is_empty());
            self.evicted += reclaimed.evicted as u64;
            log::debug!(
                "{}: evicted {} idle staging resources",
                backend.name(),
                reclaimed.evicted
            );
        }

        self.current_tick = tick + 1;
        reclaimed
    }

    /// Destroy every resource the pool knows about, including leased ones.
    /// Called when the device shuts down.
    pub fn clear(&mut self, backend: &mut dyn RenderBackend) -> usize {
        let mut destroyed = 0;
        for (_, list) in std::mem::take(&mut self.free) {
            for entry in list {
                backend.destroy_staging(entry.id);
                destroyed += 1;
            }
        }
        for entry in self.unsafe_queue.drain(..) {
            backend.destroy_staging(entry.id);
            destroyed += 1;
        }
        for (id, _) in self.leased.drain() {
            backend.destroy_staging(id);
            destroyed += 1;
        }
        destroyed
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    pub fn frames_until_safe(&self) -> u64 {
        self.frames_until_safe
    }

    pub fn frames_until_evict(&self) -> u64 {
        self.frames_until_evict
    }

    pub fn stats(&self) -> StagingPoolStats {
        StagingPoolStats {
            free: self.free.values().map(VecDeque::len).sum(),
            free_keys: self.free.len(),
            unsafe_pending: self.unsafe_queue.len(),
            leased: self.leased.len(),
            created: self.created,
            reused: self.reused,
            evicted: self.evicted,
            create_failures: self.create_failures,
        }
    }
}

impl Default for StagingPool {
    fn default() -> Self {
        Self::new(DEFAULT_FRAMES_UNTIL_SAFE, DEFAULT_FRAMES_UNTIL_EVICT)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagingPoolStats {
    pub free: usize,
    /// Distinct descriptors with at least one free entry
    pub free_keys: usize,
    /// Released, waiting out the safety delay
    pub unsafe_pending: usize,
    pub leased: usize,
    pub created: u64,
    pub reused: u64,
    pub evicted: u64,
    pub create_failures: u64,
}
