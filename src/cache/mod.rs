//! Process-wide page cache accounting and eviction coordination.
//!
//! The cache does not own pages (the arena does); it owns the byte
//! budget, the eviction candidate list, the request table and the
//! condition variable the eviction server parks on.

pub mod evict;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::btree::Btree;
use crate::error::{Error, Result};
use crate::page::PageId;

/// Evict this many pages per LRU pass.
pub const EVICT_GROUP: usize = 10;
/// Pages to visit per file per candidate walk.
pub const EVICT_WALK_PER_FILE: usize = 20;
/// Base number of candidate slots, before the per-file allowance.
pub const EVICT_WALK_BASE: usize = 100;

/// One eviction candidate.
#[derive(Clone)]
pub struct EvictEntry {
    pub btree: Arc<Btree>,
    pub page: PageId,
}

/// The candidate array; mutated only under the cache's LRU mutex.
#[derive(Default)]
pub struct EvictList {
    pub entries: Vec<Option<EvictEntry>>,
    /// Next candidate to hand out.
    pub current: usize,
}

impl EvictList {
    pub fn clear(&mut self) {
        self.entries.clear();
        self.current = 0;
    }
}

/// Completion slot a sync/close requester waits on.
pub struct ReqShared {
    done: Mutex<Option<Result<()>>>,
    cond: Condvar,
}

impl ReqShared {
    fn new() -> Self {
        Self {
            done: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    pub fn complete(&self, result: Result<()>) {
        let mut done = self.done.lock();
        *done = Some(result);
        self.cond.notify_all();
    }

    pub fn wait(&self) -> Result<()> {
        let mut done = self.done.lock();
        while done.is_none() {
            self.cond.wait(&mut done);
        }
        done.take().unwrap()
    }
}

/// A queued eviction request.
pub enum Request {
    /// Flush (sync) or retire (close) a whole file.
    File {
        btree: Arc<Btree>,
        close: bool,
        shared: Arc<ReqShared>,
    },
    /// Forced eviction of one page that outgrew its maximum.
    Page { btree: Arc<Btree>, page: PageId },
}

pub struct Cache {
    pub bytes_max: u64,
    pub eviction_target: u32,
    pub eviction_trigger: u32,

    bytes_inuse: AtomicU64,
    pages_inuse: AtomicU64,
    read_gen: AtomicU64,

    /// Whether an eviction server is draining the request table; forced
    /// eviction is pointless without one.
    server_active: AtomicBool,

    /// Candidate-list mutex; also serializes sync/close handling with
    /// LRU passes.
    pub lru: Mutex<EvictList>,

    requests: Mutex<Vec<Option<Request>>>,

    wake: Mutex<bool>,
    wake_cond: Condvar,
}

impl Cache {
    pub fn new(bytes_max: u64, target: u32, trigger: u32, session_max: u32) -> Self {
        // The request table is bounded: one slot per session plus room
        // for the reserved forced-eviction slot.
        let table = (session_max as usize + 2).max(8);
        Self {
            bytes_max,
            eviction_target: target,
            eviction_trigger: trigger,
            bytes_inuse: AtomicU64::new(0),
            pages_inuse: AtomicU64::new(0),
            read_gen: AtomicU64::new(1),
            server_active: AtomicBool::new(false),
            lru: Mutex::new(EvictList::default()),
            requests: Mutex::new((0..table).map(|_| None).collect()),
            wake: Mutex::new(false),
            wake_cond: Condvar::new(),
        }
    }

    // ------------------------------------------------------------------
    // Accounting
    // ------------------------------------------------------------------

    pub fn bytes_inuse(&self) -> u64 {
        self.bytes_inuse.load(Ordering::Relaxed)
    }

    pub fn pages_inuse(&self) -> u64 {
        self.pages_inuse.load(Ordering::Relaxed)
    }

    /// A page entered memory.
    pub fn page_in_accounting(&self, footprint: usize) {
        self.bytes_inuse.fetch_add(footprint as u64, Ordering::Relaxed);
        self.pages_inuse.fetch_add(1, Ordering::Relaxed);
    }

    /// A page left memory.
    pub fn page_out_accounting(&self, footprint: usize) {
        self.bytes_inuse.fetch_sub(footprint as u64, Ordering::Relaxed);
        self.pages_inuse.fetch_sub(1, Ordering::Relaxed);
    }

    /// A resident page grew.
    pub fn grow_accounting(&self, bytes: usize) {
        self.bytes_inuse.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Next read generation; relaxed, only relative ranking matters.
    pub fn read_gen_next(&self) -> u64 {
        self.read_gen.fetch_add(1, Ordering::Relaxed)
    }

    pub fn set_server_active(&self, active: bool) {
        self.server_active.store(active, Ordering::Release);
    }

    pub fn server_active(&self) -> bool {
        self.server_active.load(Ordering::Acquire)
    }

    pub fn bytes_target(&self) -> u64 {
        (self.bytes_max / 100) * self.eviction_target as u64
    }

    pub fn over_trigger(&self) -> bool {
        self.bytes_inuse() >= (self.bytes_max / 100) * self.eviction_trigger as u64
    }

    pub fn over_target(&self) -> bool {
        self.bytes_inuse() >= self.bytes_target()
    }

    // ------------------------------------------------------------------
    // Eviction server wake protocol
    // ------------------------------------------------------------------

    /// Wake the eviction server.
    pub fn server_wake(&self) {
        debug!(
            target: "evictserver",
            "waking, bytes inuse {} {} max {}",
            self.bytes_inuse(),
            if self.bytes_inuse() <= self.bytes_max { "<=" } else { ">" },
            self.bytes_max
        );
        let mut wake = self.wake.lock();
        *wake = true;
        self.wake_cond.notify_one();
    }

    /// Park until woken; used only by the eviction server.
    pub(crate) fn server_sleep(&self) {
        let mut wake = self.wake.lock();
        while !*wake {
            self.wake_cond.wait(&mut wake);
        }
        *wake = false;
    }

    /// The check application threads run: wake the server when usage
    /// crosses the trigger.
    pub fn eviction_check(&self) {
        if self.over_trigger() {
            self.server_wake();
        }
    }

    // ------------------------------------------------------------------
    // Request table
    // ------------------------------------------------------------------

    /// Schedule a page for forced eviction after a burst of inserts or
    /// updates made it too big.  The caller has already moved the
    /// page's ref to Evicting.  At least one empty slot is always left
    /// for the next request; a full table is transient.
    pub fn request_page(&self, btree: &Arc<Btree>, page: PageId) -> Result<()> {
        let mut slots = self.requests.lock();
        let mut first = true;
        for slot in slots.iter_mut() {
            if slot.is_none() {
                // Always leave one empty slot.
                if first {
                    first = false;
                    continue;
                }
                *slot = Some(Request::Page {
                    btree: Arc::clone(btree),
                    page,
                });
                drop(slots);
                self.server_wake();
                return Ok(());
            }
        }
        // The request table is full; another thread will see this page
        // later.
        debug!(target: "evictserver", "eviction request table full");
        Err(Error::Restart)
    }

    /// Enqueue a sync or close request; the caller waits on the
    /// returned completion slot.
    pub fn request_file(&self, btree: &Arc<Btree>, close: bool) -> Result<Arc<ReqShared>> {
        let shared = Arc::new(ReqShared::new());
        let mut slots = self.requests.lock();
        for slot in slots.iter_mut() {
            if slot.is_none() {
                *slot = Some(Request::File {
                    btree: Arc::clone(btree),
                    close,
                    shared: Arc::clone(&shared),
                });
                drop(slots);
                self.server_wake();
                return Ok(shared);
            }
        }
        debug!(target: "evictserver", "eviction request table full");
        Err(Error::Restart)
    }

    /// Take the next queued request; the server processes one at a
    /// time so forced requests can keep flowing while it works.
    pub(crate) fn next_request(&self) -> Option<Request> {
        let mut slots = self.requests.lock();
        slots.iter_mut().find_map(|slot| slot.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache() -> Cache {
        Cache::new(1024 * 1024, 80, 95, 2)
    }

    #[test]
    fn test_accounting() {
        let cache = test_cache();
        cache.page_in_accounting(1000);
        cache.page_in_accounting(500);
        assert_eq!(cache.bytes_inuse(), 1500);
        assert_eq!(cache.pages_inuse(), 2);
        cache.grow_accounting(100);
        assert_eq!(cache.bytes_inuse(), 1600);
        cache.page_out_accounting(1100);
        assert_eq!(cache.bytes_inuse(), 500);
        assert_eq!(cache.pages_inuse(), 1);
    }

    #[test]
    fn test_trigger_and_target() {
        let cache = test_cache();
        assert!(!cache.over_target());
        cache.page_in_accounting(850_000);
        assert!(cache.over_target());
        assert!(!cache.over_trigger());
        cache.page_in_accounting(150_000);
        assert!(cache.over_trigger());
    }

    #[test]
    fn test_read_gen_monotonic() {
        let cache = test_cache();
        let a = cache.read_gen_next();
        let b = cache.read_gen_next();
        assert!(b > a);
    }

    #[test]
    fn test_wake_protocol() {
        let cache = Arc::new(test_cache());
        let c = Arc::clone(&cache);
        let t = std::thread::spawn(move || c.server_sleep());
        std::thread::sleep(std::time::Duration::from_millis(10));
        cache.server_wake();
        t.join().unwrap();
    }

    #[test]
    fn test_req_shared_completion() {
        let shared = Arc::new(ReqShared::new());
        let s = Arc::clone(&shared);
        let t = std::thread::spawn(move || s.wait());
        std::thread::sleep(std::time::Duration::from_millis(10));
        shared.complete(Ok(()));
        assert!(t.join().unwrap().is_ok());
    }
}
