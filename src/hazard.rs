//! Sessions and hazard references.
//!
//! Each session owns a fixed-size array of page handles.  A reader
//! publishes the page it is about to use into a free slot, then
//! re-checks the ref state; the evictor, before freeing a page, scans
//! every session's array and abandons the eviction if the page is
//! found.  Readers are wait-free, evictors lock-free, and neither
//! blocks the other.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::error::{Error, Result};
use crate::page::{PageId, Ref, RefState, INVALID_PAGE};

/// A session: the per-thread handle application threads use to read and
/// mutate trees.
pub struct Session {
    pub id: u32,
    active: AtomicBool,
    hazard: Vec<AtomicU32>,
}

impl Session {
    fn new(id: u32, hazard_max: u32) -> Self {
        Self {
            id,
            active: AtomicBool::new(true),
            hazard: (0..hazard_max).map(|_| AtomicU32::new(INVALID_PAGE)).collect(),
        }
    }

    /// Acquire a hazard reference on the page `ref_` currently points
    /// to.  Returns false if the ref moved out of a readable state
    /// after publication, in which case no reference is held.
    pub fn hazard_set(&self, ref_: &Ref, page: PageId) -> Result<bool> {
        let slot = self
            .hazard
            .iter()
            .find(|s| s.load(Ordering::Relaxed) == INVALID_PAGE)
            .ok_or_else(|| {
                Error::Internal(format!("session {}: hazard array full", self.id))
            })?;

        // Publish, then re-read the state: either the evictor sees our
        // entry, or we see its state change and back off.  The fence
        // keeps the re-read from moving ahead of the publication.
        slot.store(page, Ordering::SeqCst);
        std::sync::atomic::fence(Ordering::SeqCst);
        match ref_.state() {
            RefState::Mem | RefState::EvictWalk if ref_.page_id() == Some(page) => {
                trace!(target: "hazard", "session {} set {page}", self.id);
                Ok(true)
            }
            _ => {
                slot.store(INVALID_PAGE, Ordering::SeqCst);
                Ok(false)
            }
        }
    }

    /// Release a hazard reference.
    pub fn hazard_clear(&self, page: PageId) {
        for slot in &self.hazard {
            if slot.load(Ordering::Relaxed) == page {
                slot.store(INVALID_PAGE, Ordering::SeqCst);
                trace!(target: "hazard", "session {} clear {page}", self.id);
                return;
            }
        }
        debug_assert!(false, "hazard reference {page} not held");
    }

    pub fn hazard_holds(&self, page: PageId) -> bool {
        self.hazard.iter().any(|s| s.load(Ordering::SeqCst) == page)
    }

    pub fn hazard_is_empty(&self) -> bool {
        self.hazard.iter().all(|s| s.load(Ordering::SeqCst) == INVALID_PAGE)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// The connection's session table.
pub struct SessionTable {
    sessions: RwLock<Vec<Arc<Session>>>,
    session_max: u32,
    hazard_max: u32,
}

impl SessionTable {
    pub fn new(session_max: u32, hazard_max: u32) -> Self {
        Self {
            sessions: RwLock::new(Vec::new()),
            session_max,
            hazard_max,
        }
    }

    /// Open a session; the write lock provides the release barrier so
    /// the eviction server's scans see fully initialized entries.
    pub fn open_session(&self) -> Result<Arc<Session>> {
        let mut sessions = self.sessions.write();

        // Reuse a closed slot before growing the table.
        if let Some(slot) = sessions.iter_mut().find(|s| !s.is_active()) {
            let id = slot.id;
            *slot = Arc::new(Session::new(id, self.hazard_max));
            return Ok(Arc::clone(slot));
        }

        if sessions.len() >= self.session_max as usize {
            return Err(Error::Internal("session table full".to_string()));
        }
        let session = Arc::new(Session::new(sessions.len() as u32, self.hazard_max));
        sessions.push(Arc::clone(&session));
        Ok(session)
    }

    /// Close a session: all of its hazard references must have dropped
    /// naturally as cursors closed.
    pub fn close_session(&self, session: &Session) {
        debug_assert!(session.hazard_is_empty());
        session.active.store(false, Ordering::Release);
    }

    /// Scan every session for a hazard reference to `page`.  The
    /// caller has already moved the ref out of a readable state; the
    /// fence orders that transition before these reads.
    pub fn hazard_scan(&self, page: PageId) -> bool {
        std::sync::atomic::fence(Ordering::SeqCst);
        self.sessions
            .read()
            .iter()
            .any(|s| s.is_active() && s.hazard_holds(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::RefKey;

    #[test]
    fn test_hazard_set_and_clear() {
        let table = SessionTable::new(4, 15);
        let s = table.open_session().unwrap();

        let r = Ref::new_mem(3, RefKey::Col(1));
        assert!(s.hazard_set(&r, 3).unwrap());
        assert!(table.hazard_scan(3));
        s.hazard_clear(3);
        assert!(!table.hazard_scan(3));
        assert!(s.hazard_is_empty());
    }

    #[test]
    fn test_hazard_set_fails_when_ref_moves() {
        let table = SessionTable::new(4, 15);
        let s = table.open_session().unwrap();

        let r = Ref::new_mem(3, RefKey::Col(1));
        assert!(r.cas_state(RefState::Mem, RefState::Evicting));
        // Publication races the state change; the reader must back off
        // without holding a reference.
        assert!(!s.hazard_set(&r, 3).unwrap());
        assert!(s.hazard_is_empty());
    }

    #[test]
    fn test_hazard_array_bounded() {
        let table = SessionTable::new(1, 15);
        let s = table.open_session().unwrap();
        for i in 0..15 {
            let r = Ref::new_mem(i, RefKey::Col(1));
            assert!(s.hazard_set(&r, i).unwrap());
        }
        let r = Ref::new_mem(99, RefKey::Col(1));
        assert!(s.hazard_set(&r, 99).is_err());
    }

    #[test]
    fn test_session_table_bounded_and_reusable() {
        let table = SessionTable::new(2, 15);
        let a = table.open_session().unwrap();
        let _b = table.open_session().unwrap();
        assert!(table.open_session().is_err());

        table.close_session(&a);
        let c = table.open_session().unwrap();
        assert_eq!(c.id, a.id);
    }

    #[test]
    fn test_evictor_scan_vs_reader() {
        // An evictor that moved the state to Evicting before the reader
        // published must find the reader's entry or the reader must see
        // the state; run both orders.
        let table = SessionTable::new(2, 15);
        let s = table.open_session().unwrap();
        let r = Ref::new_mem(5, RefKey::Col(1));

        // Reader first: scan sees the hazard.
        assert!(s.hazard_set(&r, 5).unwrap());
        assert!(r.cas_state(RefState::Mem, RefState::Evicting));
        assert!(table.hazard_scan(5));
        // Evictor restores the state and the page survives.
        r.set_state(RefState::Mem);
        s.hazard_clear(5);
    }
}
