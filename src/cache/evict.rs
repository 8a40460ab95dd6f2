//! The eviction server and the eviction side of reconciliation.
//!
//! A single background thread parks on the cache condition variable.
//! On wake it drains the request queue (sync, close, forced-page
//! requests), then runs LRU passes until cache usage drops below the
//! target, or until ten consecutive passes make no progress.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::utils::Backoff;
use tracing::{debug, warn};

use crate::btree::Btree;
use crate::cache::{
    EvictEntry, EvictList, Request, EVICT_GROUP, EVICT_WALK_BASE, EVICT_WALK_PER_FILE,
};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::page::{Page, PageId, RecResult, Ref, RefState};
use crate::reconcile::rec_write;

/// Body of the eviction server thread.
pub(crate) fn evict_server(conn: Arc<Connection>) {
    let cache = conn.cache();
    loop {
        // Use the same logic as application threads to decide whether
        // there is work to do; if so the condition variable is already
        // signalled and the wait below won't block.
        cache.eviction_check();

        debug!(target: "evictserver", "sleeping");
        cache.server_sleep();
        if !conn.server_running() {
            break;
        }
        debug!(target: "evictserver", "waking");

        if let Err(e) = evict_worker(&conn) {
            warn!(target: "evictserver", "eviction server error: {e}");
        }
    }

    // Drain outstanding sync/close requests, then exit.  In-flight
    // page requests are dropped; the pages return to service.
    while let Some(req) = cache.next_request() {
        match req {
            Request::File { btree, close, shared } => {
                let _lru = cache.lru.lock();
                shared.complete(evict_file(&conn, &btree, close));
            }
            Request::Page { btree, page } => {
                release_claim(&btree, page);
            }
        }
    }

    if cache.bytes_inuse() != 0 {
        warn!(
            target: "evictserver",
            "exiting with {} pages, {} bytes in use",
            cache.pages_inuse(),
            cache.bytes_inuse()
        );
    }
    debug!(target: "evictserver", "exiting");
}

/// Evict pages from memory until the cache reaches its target.
fn evict_worker(conn: &Arc<Connection>) -> Result<()> {
    let cache = conn.cache();
    let mut zero_progress = 0;
    loop {
        evict_request_walk(conn)?;

        if cache.bytes_inuse() < cache.bytes_target() {
            break;
        }

        let bytes_start = cache.bytes_inuse();
        evict_lru(conn)?;

        // If we're making progress, keep going; if not at all, ten
        // passes in a row means it's not something we can fix.
        if cache.bytes_inuse() == bytes_start {
            zero_progress += 1;
            if zero_progress >= 10 {
                debug!(target: "evictserver", "unable to reach eviction goal");
                break;
            }
        } else {
            zero_progress = 0;
        }
    }
    Ok(())
}

/// Walk the eviction request queue.
fn evict_request_walk(conn: &Arc<Connection>) -> Result<()> {
    let cache = conn.cache();
    while let Some(req) = cache.next_request() {
        match req {
            Request::File { btree, close, shared } => {
                // Block out concurrent eviction, and drop any candidate
                // entries referencing pages we're about to discard.
                let mut lru = cache.lru.lock();
                lru.clear();
                shared.complete(evict_file(conn, &btree, close));
            }
            Request::Page { btree, page } => {
                // Forcing out a page that might be our walk position:
                // restart the walk.
                if *btree.evict_cursor.lock() == Some(page) {
                    walk_clear(&btree);
                }
                debug!(target: "evictserver", "forcing eviction of page {page}");
                match forced_page_evict(conn, &btree, page) {
                    Err(e) if e.is_transient() => {
                        // Don't rest until this request is handled:
                        // re-queue it and keep the server awake.
                        if reclaim(&btree, page) {
                            let _ = cache.request_page(&btree, page);
                        }
                        cache.server_wake();
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

fn forced_page_evict(conn: &Arc<Connection>, btree: &Arc<Btree>, page: PageId) -> Result<()> {
    let Some(page) = conn.arena().get(page) else {
        return Ok(());
    };
    let ref_ = btree.ref_of(&page)?;
    rec_evict(conn, btree, &ref_, &page)
}

/// Re-claim a page for forced eviction after a transient failure; the
/// failure path released the Evicting state.
fn reclaim(btree: &Arc<Btree>, page: PageId) -> bool {
    btree
        .arena
        .get(page)
        .and_then(|p| btree.ref_of(&p).ok())
        .map(|r| r.cas_state(RefState::Mem, RefState::Evicting))
        .unwrap_or(false)
}

fn release_claim(btree: &Arc<Btree>, page: PageId) {
    if let Some(p) = btree.arena.get(page) {
        if let Ok(r) = btree.ref_of(&p) {
            if r.state() == RefState::Evicting {
                r.set_state(RefState::Mem);
            }
        }
    }
}

/// Release the walk pin on the file's eviction-cursor page, keeping the
/// position so the next walk resumes there.
fn walk_release(btree: &Arc<Btree>) {
    let cursor = btree.evict_cursor.lock();
    if let Some(id) = *cursor {
        if let Some(p) = btree.arena.get(id) {
            if let Ok(r) = btree.ref_of(&p) {
                r.cas_state(RefState::EvictWalk, RefState::Mem);
            }
        }
    }
}

/// Release the walk pin and forget the position entirely.
fn walk_clear(btree: &Arc<Btree>) {
    walk_release(btree);
    *btree.evict_cursor.lock() = None;
}

// ----------------------------------------------------------------------
// Sync / close
// ----------------------------------------------------------------------

/// Flush pages for a specific file as part of a close/sync operation.
/// Runs under the LRU lock.
fn evict_file(conn: &Arc<Connection>, btree: &Arc<Btree>, close: bool) -> Result<()> {
    debug!(
        target: "evictserver",
        "file request: {} {}", btree.name, if close { "close" } else { "sync" }
    );

    // If this is a close, wait for LRU eviction activity to drain.
    let backoff = Backoff::new();
    while close && btree.lru_count.load(Ordering::Acquire) > 0 {
        backoff.snooze();
    }
    walk_clear(btree);

    // Write the dirty pages, children before parents, so every child
    // is in its final clean state when its parent reconciles.  The
    // walk stays a page ahead of the page being written.
    let pages = btree.inmem_postorder();
    for (ref_, page) in &pages {
        if page.is_split_merge() || !page.is_modified() {
            continue;
        }
        if ref_.cas_state(RefState::Mem, RefState::Evicting) {
            let result = rec_write(btree, page, None);
            ref_.set_state(RefState::Mem);
            match result {
                // Raced an update: the page stays dirty, a later sync
                // picks it up.  A close must not lose it.
                Err(e) if e.is_transient() && !close => {}
                Err(e) if e.is_transient() => {
                    let r = rec_write(btree, page, None);
                    r?
                }
                other => other?,
            }
        } else if close {
            return Err(Error::Busy);
        }
    }

    // Record the root's replacement address for a sync; close rewrites
    // it below after the final eviction.
    if !close {
        if let Some(root) = btree
            .root_ref()
            .page_id()
            .and_then(|id| conn.arena().get(id))
        {
            if let RecResult::Replace(addr) = root.rec_result() {
                *btree.root_addr.lock() = Some(addr);
            }
        }
        return Ok(());
    }

    // Close: discard every page.  Pages expected to be merged into
    // their parents are skipped, they go when the parent goes; the
    // root can't be merged into anything, it must be written.
    for (ref_, page) in &pages {
        if !conn.arena().contains(page.id) {
            continue;
        }
        if page.is_merge_candidate() && !page.is_root() {
            continue;
        }
        if !ref_.cas_state(RefState::Mem, RefState::Evicting) {
            return Err(Error::Busy);
        }
        rec_evict(conn, btree, ref_, page)?;
    }
    Ok(())
}

// ----------------------------------------------------------------------
// LRU eviction
// ----------------------------------------------------------------------

/// Evict pages from the cache based on their read generation.
fn evict_lru(conn: &Arc<Connection>) -> Result<()> {
    {
        let mut lru = conn.cache().lru.lock();
        evict_walk(conn, &mut lru)?;
        evict_dup_remove(conn, &mut lru);
    }

    // Reconcile and discard some pages.
    for _ in 0..EVICT_GROUP {
        if !evict_lru_page(conn) {
            break;
        }
    }
    Ok(())
}

/// Fill in the candidate array by walking the next set of pages from
/// each open file.
fn evict_walk(conn: &Arc<Connection>, lru: &mut EvictList) -> Result<()> {
    lru.clear();
    let btrees = conn.open_btrees();
    lru.entries
        .reserve(EVICT_WALK_BASE + btrees.len() * EVICT_WALK_PER_FILE);
    for btree in &btrees {
        if btree.is_closed() {
            continue;
        }
        evict_walk_file(btree, lru);
    }
    Ok(())
}

/// Get a few page eviction candidates from a single underlying file,
/// continuing from where the last walk left off.
fn evict_walk_file(btree: &Arc<Btree>, lru: &mut EvictList) {
    let pages = btree.inmem_postorder();
    if pages.is_empty() {
        return;
    }

    // Unpin the previous walk position; we stay one page ahead of the
    // page being returned, so the walk position itself is never on the
    // candidate list.
    walk_release(btree);
    let cursor = *btree.evict_cursor.lock();
    let start = cursor
        .and_then(|id| pages.iter().position(|(_, p)| p.id == id))
        .map(|i| (i + 1) % pages.len())
        .unwrap_or(0);

    let mut picked = 0;
    let mut last_visited: Option<(&Arc<Ref>, PageId)> = None;
    for step in 0..pages.len() {
        if picked >= EVICT_WALK_PER_FILE {
            break;
        }
        let (ref_, page) = &pages[(start + step) % pages.len()];
        last_visited = Some((ref_, page.id));

        // The root and pinned pages can't be evicted, locked pages
        // would just fill the list for no benefit, and pages expected
        // to be merged into their parents corrupt the list if both
        // generations land on it.
        if page.is_root() {
            continue;
        }
        if ref_.state() != RefState::Mem {
            continue;
        }
        if page.is_merge_candidate() {
            continue;
        }

        debug!(target: "evict", "select: {}, size {}", page.id, page.footprint());
        lru.entries.push(Some(EvictEntry {
            btree: Arc::clone(btree),
            page: page.id,
        }));
        picked += 1;
    }

    // Pin the new walk position; readers may still acquire it.
    if let Some((ref_, id)) = last_visited {
        *btree.evict_cursor.lock() = Some(id);
        if ref_.cas_state(RefState::Mem, RefState::EvictWalk) {
            for entry in lru.entries.iter_mut() {
                let is_pinned = entry
                    .as_ref()
                    .map(|e| Arc::ptr_eq(&e.btree, btree) && e.page == id)
                    .unwrap_or(false);
                if is_pinned {
                    *entry = None;
                }
            }
        }
    }
}

/// Discard duplicates, then order the candidates by read generation.
fn evict_dup_remove(conn: &Arc<Connection>, lru: &mut EvictList) {
    // Sort by reference so duplicates are adjacent; NULL entries sink
    // to the tail.
    lru.entries.sort_by(|a, b| match (a, b) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (Some(_), None) => std::cmp::Ordering::Less,
        (Some(a), Some(b)) => (Arc::as_ptr(&a.btree) as usize, a.page)
            .cmp(&(Arc::as_ptr(&b.btree) as usize, b.page)),
    });
    for i in 1..lru.entries.len() {
        let dup = match (&lru.entries[i - 1], &lru.entries[i]) {
            (Some(a), Some(b)) => {
                Arc::ptr_eq(&a.btree, &b.btree) && a.page == b.page
            }
            _ => false,
        };
        if dup {
            lru.entries[i - 1] = None;
        }
    }

    // Sort by LRU, biased so internal pages sort later: with enough
    // good leaf candidates we evict them first, without completely
    // ignoring an old internal page.
    let rank = |e: &Option<EvictEntry>| -> u64 {
        let Some(e) = e else { return u64::MAX };
        let Some(page) = conn.arena().get(e.page) else {
            return u64::MAX;
        };
        let mut gen = page.read_gen.load(Ordering::Relaxed);
        if page.page_type.is_internal() {
            gen = gen.saturating_add(EVICT_GROUP as u64);
        }
        gen
    };
    lru.entries.sort_by_key(rank);
    lru.current = 0;
}

/// Take the next queued candidate, switching it to Evicting under the
/// LRU lock so it can't be claimed twice.
fn evict_get_page(conn: &Arc<Connection>) -> Option<(Arc<Btree>, Arc<Ref>, Arc<Page>)> {
    let mut lru = conn.cache().lru.lock();
    while lru.current < lru.entries.len().min(EVICT_GROUP) {
        let slot = lru.current;
        lru.current += 1;

        let Some(entry) = lru.entries[slot].take() else {
            break;
        };
        let Some(page) = conn.arena().get(entry.page) else {
            continue;
        };
        let Ok(ref_) = entry.btree.ref_of(&page) else {
            continue;
        };
        if !ref_.cas_state(RefState::Mem, RefState::Evicting) {
            continue;
        }

        // Keep the handle from being closed out from under us.
        entry.btree.lru_count.fetch_add(1, Ordering::AcqRel);

        // If we're evicting the file's walk position, move on.
        let mut cursor = entry.btree.evict_cursor.lock();
        if *cursor == Some(page.id) {
            *cursor = None;
        }
        drop(cursor);

        return Some((entry.btree, ref_, page));
    }
    None
}

/// Evict one page from the candidate list; false when the list is
/// exhausted.
fn evict_lru_page(conn: &Arc<Connection>) -> bool {
    let Some((btree, ref_, page)) = evict_get_page(conn) else {
        return false;
    };

    // We don't care why eviction failed (dirty page and out of space,
    // hazard references, a busy subtree); regardless, don't pick the
    // same page every time.
    if rec_evict(conn, &btree, &ref_, &page).is_err() {
        page.read_gen
            .store(conn.cache().read_gen_next(), Ordering::Relaxed);
        if ref_.state() == RefState::Evicting {
            ref_.set_state(RefState::Mem);
        }
    }

    btree.lru_count.fetch_sub(1, Ordering::AcqRel);
    true
}

// ----------------------------------------------------------------------
// Single-page eviction
// ----------------------------------------------------------------------

/// Reconcile and discard a page whose ref the caller has moved to
/// Evicting.  On failure the ref is restored to Mem.
pub(crate) fn rec_evict(
    conn: &Arc<Connection>,
    btree: &Arc<Btree>,
    ref_: &Arc<Ref>,
    page: &Arc<Page>,
) -> Result<()> {
    debug_assert_eq!(ref_.state(), RefState::Evicting);

    // An internal page can only leave memory once its subtree is
    // resolved: every child on disk (locked against readers while the
    // page is dismantled), or absorbable by the merge.
    let mut locked: Vec<&Arc<Ref>> = Vec::new();
    let mut resolved = true;
    for child_ref in page.refs() {
        match child_ref.state() {
            RefState::Disk => {
                if child_ref.cas_state(RefState::Disk, RefState::Locked) {
                    locked.push(child_ref);
                } else {
                    resolved = false;
                }
            }
            _ => {
                resolved = child_ref
                    .page_id()
                    .and_then(|id| conn.arena().get(id))
                    .map(|c| c.is_merge_candidate())
                    .unwrap_or(false);
            }
        }
        if !resolved {
            break;
        }
    }

    let fail = |locked: &[&Arc<Ref>]| {
        for r in locked {
            r.set_state(RefState::Disk);
        }
        ref_.set_state(RefState::Mem);
    };
    if !resolved {
        fail(&locked);
        return Err(Error::Busy);
    }

    if page.is_modified() {
        if let Err(e) = rec_write(btree, page, None) {
            fail(&locked);
            return Err(e);
        }
    }

    // Everything we're about to free must be unreferenced: scan every
    // session's hazard array, and abandon the eviction if the page (or
    // a doomed descendant) is in use.
    let doomed = collect_doomed(conn, page);
    for id in &doomed {
        if conn.sessions().hazard_scan(*id) {
            debug!(target: "evict", "page {} hazard-held, abandoning", id);
            fail(&locked);
            return Err(Error::Busy);
        }
    }

    match page.rec_result() {
        // Clean page: discard, the ref keeps its address.
        RecResult::None => {
            if page.is_root() {
                *btree.root_addr.lock() = ref_.addr();
            }
            ref_.publish_disk(None);
            discard_pages(conn, btree, &doomed);
        }

        RecResult::Replace(addr) => {
            if page.is_root() {
                *btree.root_addr.lock() = Some(addr.clone());
            }
            ref_.publish_disk(Some(addr));
            discard_pages(conn, btree, &doomed);
        }

        RecResult::Empty => {
            if page.is_root() {
                // The whole tree is empty.
                *btree.root_addr.lock() = None;
                ref_.publish_disk(None);
                discard_pages(conn, btree, &doomed);
            } else {
                // The parent's next reconciliation deletes the ref; the
                // page stays in memory until then.
                fail(&locked);
            }
        }

        RecResult::Split(split_id) => {
            if page.is_root() {
                // Root split: the tree deepens by a level.  The split
                // page becomes the new root and is written out like any
                // other page.
                let split = conn
                    .arena()
                    .get(split_id)
                    .ok_or_else(|| Error::Internal("split page gone".to_string()))?;
                split.clear_split_merge();
                split.mark_modified();
                let new_ref = Arc::new(Ref::new_mem(split_id, root_key(btree, &split)));
                btree.set_root_ref(Arc::clone(&new_ref));
                discard_pages(conn, btree, &doomed);

                if !new_ref.cas_state(RefState::Mem, RefState::Evicting) {
                    return Err(Error::Busy);
                }
                return rec_evict(conn, btree, &new_ref, &split);
            }

            // Replace the evicted page with the split page; the parent
            // merges it in on its own eviction.
            ref_.publish_mem(split_id);
            discard_pages(conn, btree, &doomed);
        }
    }
    Ok(())
}

fn root_key(btree: &Arc<Btree>, page: &Arc<Page>) -> crate::page::RefKey {
    if btree.is_row() {
        crate::page::RefKey::Row(Vec::new())
    } else {
        crate::page::RefKey::Col(page.recno().max(1))
    }
}

/// The set of pages discarded with `page`: the page itself plus every
/// in-memory descendant that was merged into its new image.  The
/// page's own split page survives, it just replaced the page in the
/// tree.
fn collect_doomed(conn: &Arc<Connection>, page: &Arc<Page>) -> Vec<PageId> {
    let mut doomed = Vec::new();
    collect_subtree(conn, page, true, &mut doomed);
    doomed
}

fn collect_subtree(conn: &Arc<Connection>, page: &Arc<Page>, top: bool, out: &mut Vec<PageId>) {
    out.push(page.id);
    for child_ref in page.refs() {
        if let Some(child) = child_ref.page_id().and_then(|id| conn.arena().get(id)) {
            collect_subtree(conn, &child, false, out);
        }
    }
    if !top {
        if let RecResult::Split(split_id) = page.rec_result() {
            if let Some(split) = conn.arena().get(split_id) {
                collect_subtree(conn, &split, false, out);
            }
        }
    }
}

fn discard_pages(conn: &Arc<Connection>, btree: &Arc<Btree>, doomed: &[PageId]) {
    let _ = conn;
    for id in doomed {
        btree.discard_page(*id);
    }
}
