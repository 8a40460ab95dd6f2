//! Reconciliation: take an in-memory page, walk each entry, build a
//! backing disk image in a temporary buffer, and write that buffer out,
//! splitting into several chunks when it overflows the maximum page
//! size.  The outcome (empty, replace, split) is recorded on the page
//! for the eviction path and the parent's next reconciliation.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::btree::Btree;
use crate::error::{Error, Result};
use crate::page::codec::{
    self, CellType, DiskPageType, PageHeader, PAGE_HEADER_SIZE,
};
use crate::page::{
    self, bit_setv, bitstr_size, Page, PageBuild, PageData, PageType, RecResult, Ref,
    RefKey, UpdateChain,
};

/// Salvage information for reconciliation: a contiguous record
/// sub-range to emit.
#[derive(Debug, Default, Clone)]
pub struct SalvageCookie {
    /// Leading deleted records to create.
    pub missing: u64,
    /// Initial records to skip.
    pub skip: u64,
    /// Records to take; zero means all.
    pub take: u64,
    /// Ignore the rest of the page.
    pub done: bool,
}

/// The trailing empty key cell on row-store leaves.
const TRAILING_KEY_CELL: usize = 1;

/// Split bookkeeping states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BndState {
    /// Next milestone: a split chunk boundary.
    SplitBoundary,
    /// Next milestone: the maximum page boundary.
    SplitMax,
    /// No boundary checks: never needed, or the fixup already ran.
    TrackingOff,
}

/// One split chunk's bookkeeping.
#[derive(Debug, Default, Clone)]
struct Boundary {
    /// First byte of the chunk in the image buffer.
    start: usize,
    /// Starting record number (column stores).
    recno: u64,
    entries: u32,
    /// Promoted row-store key.
    key: Vec<u8>,
    /// Written location.
    addr: Option<Vec<u8>>,
}

/// An on-page cell being built: descriptor bytes plus payload.
#[derive(Debug, Default, Clone)]
struct Kv {
    cell: Vec<u8>,
    data: Vec<u8>,
}

impl Kv {
    fn len(&self) -> usize {
        self.cell.len() + self.data.len()
    }

    /// A raw copy: cell and payload taken verbatim from the source
    /// image.
    fn raw(bytes: &[u8]) -> Self {
        Kv {
            cell: Vec::new(),
            data: bytes.to_vec(),
        }
    }
}

/// Information tracking a single page reconciliation.
struct Reconciler {
    btree: Arc<Btree>,
    page: Arc<Page>,

    /// Image buffer; cells accumulate after the header.
    dsk: Vec<u8>,
    page_size: usize,
    split_size: usize,
    bnd_state: BndState,

    /// Chunks already written.
    done: Vec<Boundary>,
    /// Boundary records saved while tracking split points.
    saved: Vec<Boundary>,
    /// The chunk currently being filled.
    cur_bnd: Boundary,
    /// Entries copied into saved split chunks.
    total_entries: u32,

    recno: u64,
    entries: u32,
    space_avail: usize,

    /// Row-store internal 0th key truncation.
    cell_zero: bool,
    /// Merge correction key for split subtrees.
    merge_key: Option<Vec<u8>>,

    /// Full copies of the current and last key, for prefix and suffix
    /// compression.
    cur_key: Vec<u8>,
    last_key: Vec<u8>,
    key_pfx_compress: bool,
    key_sfx_compress: bool,
    pfx_conf: bool,
    sfx_conf: bool,

    /// Old blocks to return to the block manager once the new image is
    /// durable.
    blocks_to_free: Vec<Vec<u8>>,
}

/// Reconcile an in-memory page into its on-disk format and write it.
pub fn rec_write(
    btree: &Arc<Btree>,
    page: &Arc<Page>,
    mut salvage: Option<&mut SalvageCookie>,
) -> Result<()> {
    debug!(target: "reconcile", "{}: page {} {:?}", btree.name, page.id, page.page_type);

    // A split-merge page can only be merged into its parent.
    if page.is_split_merge() {
        return Ok(());
    }

    // Snapshot the write generation before reading anything from the
    // page; racing updates force the page to stay dirty.
    let snapshot = page.write_gen.load(Ordering::Acquire);
    let old_disk_gen = page.disk_gen.load(Ordering::Acquire);
    let prev_result = page.rec_result();

    let mut r = Reconciler::new(btree, page);
    let result = (|| -> Result<()> {
        match page.page_type {
            PageType::ColFix => match salvage.as_deref_mut() {
                Some(cookie) => r.col_fix_slvg(cookie)?,
                None => r.col_fix()?,
            },
            PageType::ColInt => r.col_int()?,
            PageType::ColVar => r.col_var(salvage.as_deref_mut())?,
            PageType::RowInt => r.row_int()?,
            PageType::RowLeaf => r.row_leaf(salvage.as_deref_mut())?,
        }
        r.wrapup(prev_result)
    })();

    if let Err(e) = result {
        r.abort();
        return Err(e);
    }

    // Commit: if an update raced reconciliation, the new image is stale.
    if page.write_gen.load(Ordering::Acquire) != snapshot {
        debug!(target: "reconcile", "{}: page {} raced an update", btree.name, page.id);
        page.disk_gen.store(old_disk_gen, Ordering::Release);
        r.abort();
        return Err(Error::Busy);
    }
    page.disk_gen.store(snapshot, Ordering::Release);

    // Now that the new reality is committed, free replaced blocks.
    for addr in std::mem::take(&mut r.blocks_to_free) {
        r.btree.block.free(&addr)?;
    }

    // Mark the parent dirty: eviction is what eventually cares, and
    // it's our update making the parent dirty.
    if let Some(parent_id) = page.parent {
        if let Some(parent) = btree.arena.get(parent_id) {
            parent.mark_modified();
        }
    }
    Ok(())
}

impl Reconciler {
    fn new(btree: &Arc<Btree>, page: &Arc<Page>) -> Self {
        Self {
            btree: Arc::clone(btree),
            page: Arc::clone(page),
            dsk: Vec::new(),
            page_size: 0,
            split_size: 0,
            bnd_state: BndState::TrackingOff,
            done: Vec::new(),
            saved: Vec::new(),
            cur_bnd: Boundary::default(),
            total_entries: 0,
            recno: 0,
            entries: 0,
            space_avail: 0,
            cell_zero: false,
            merge_key: None,
            cur_key: Vec::new(),
            last_key: Vec::new(),
            key_pfx_compress: false,
            key_sfx_compress: false,
            pfx_conf: btree.config.prefix_compression,
            sfx_conf: btree.config.internal_key_truncate,
            blocks_to_free: Vec::new(),
        }
    }

    /// Undo a failed run: free any chunks and overflow blocks written
    /// before the failure.
    fn abort(&mut self) {
        for bnd in self.done.drain(..) {
            if let Some(addr) = bnd.addr {
                let _ = self.btree.block.free(&addr);
            }
        }
        self.blocks_to_free.clear();
    }

    fn read_ovfl(&self, cookie: &[u8]) -> Result<Vec<u8>> {
        self.btree.read_ovfl(cookie)
    }

    // ------------------------------------------------------------------
    // Split bookkeeping
    // ------------------------------------------------------------------

    fn split_init(&mut self, recno: u64, max: u32) {
        self.page_size = max as usize;
        // Splitting to a smaller-than-maximum size keeps a packed page
        // from splitting over and over; fixed-size column stores are
        // allocated at the page size, never anything smaller.
        self.split_size = if self.page.page_type == PageType::ColFix {
            self.page_size
        } else {
            crate::config::split_page_size(
                max,
                self.btree.config.allocation_size,
                self.btree.config.split_pct,
            ) as usize
        };
        self.bnd_state = if self.page_size == self.split_size {
            BndState::TrackingOff
        } else {
            BndState::SplitBoundary
        };

        self.dsk.clear();
        self.dsk.resize(PAGE_HEADER_SIZE, 0);
        self.done.clear();
        self.saved.clear();
        self.cur_bnd = Boundary {
            start: PAGE_HEADER_SIZE,
            recno,
            ..Boundary::default()
        };
        self.total_entries = 0;
        self.recno = recno;
        self.entries = 0;
        self.space_avail = self.split_size - PAGE_HEADER_SIZE;

        // New page, compression off.
        self.key_pfx_compress = false;
        self.key_sfx_compress = false;
    }

    fn is_row(&self) -> bool {
        matches!(self.page.page_type, PageType::RowInt | PageType::RowLeaf)
    }

    /// The first key of the image buffer, fully materialized; used to
    /// fix up the first chunk's promoted key.
    fn first_chunk_key(&self) -> Result<Vec<u8>> {
        let cell = codec::unpack(&self.dsk, PAGE_HEADER_SIZE)?;
        match cell.cell_type {
            CellType::Key => {
                debug_assert_eq!(cell.prefix, 0);
                Ok(cell.data(&self.dsk).to_vec())
            }
            CellType::KeyOvfl => self.read_ovfl(cell.data(&self.dsk)),
            _ => Err(Error::Internal("chunk does not start with a key".to_string())),
        }
    }

    /// Key promotion for a row-store: the new chunk's key, after suffix
    /// compression against the last key of the preceding chunk.
    fn promote_key(&self) -> Vec<u8> {
        // We only need enough of the promoted key to ensure searches go
        // to the correct page: bytes past the first difference from the
        // preceding chunk's last key carry no information.  Not usable
        // across an overflow key, there is no comparable image.
        if self.page.page_type == PageType::RowLeaf && self.key_sfx_compress {
            let pa = &self.last_key;
            let pb = &self.cur_key;
            let len = pa.len().min(pb.len());
            let mut size = len + 1;
            for cnt in 0..len {
                if pa[cnt] != pb[cnt] {
                    size = cnt + 1;
                    break;
                }
            }
            pb[..size.min(pb.len())].to_vec()
        } else {
            self.cur_key.clone()
        }
    }

    /// Handle the page-buffer size bookkeeping at a boundary.
    fn split(&mut self) -> Result<()> {
        match self.bnd_state {
            BndState::SplitBoundary => {
                // Save where we are, in case we eventually have to
                // split for real.
                let mut bnd = std::mem::take(&mut self.cur_bnd);
                bnd.entries = self.entries - self.total_entries;
                self.total_entries = self.entries;

                if self.is_row() && self.saved.is_empty() && self.done.is_empty() {
                    bnd.key = self.first_chunk_key()?;
                }
                let next = Boundary {
                    start: self.dsk.len(),
                    recno: self.recno,
                    key: if self.is_row() { self.promote_key() } else { Vec::new() },
                    ..Boundary::default()
                };
                self.saved.push(bnd);
                self.cur_bnd = next;

                // Another split-size chunk if there's room, else
                // whatever remains under the maximum page size.
                let current_len = self.dsk.len();
                if current_len + self.split_size <= self.page_size {
                    self.space_avail = self.split_size - PAGE_HEADER_SIZE;
                } else {
                    self.bnd_state = BndState::SplitMax;
                    self.space_avail = self.page_size - current_len;
                }
            }
            BndState::SplitMax => {
                // It didn't all fit: write the saved split chunks, then
                // keep going at split-size boundaries.
                self.split_fixup()?;
                self.bnd_state = BndState::TrackingOff;
            }
            BndState::TrackingOff => {
                // Either we never needed boundary tracking or the fixup
                // already ran: write the current chunk immediately.
                let mut bnd = std::mem::take(&mut self.cur_bnd);
                bnd.entries = self.entries;
                if self.is_row() && self.done.is_empty() && bnd.key.is_empty() {
                    bnd.key = self.first_chunk_key()?;
                }
                let chunk = self.dsk[PAGE_HEADER_SIZE..].to_vec();
                self.write_chunk(bnd, &chunk)?;

                let next = Boundary {
                    start: PAGE_HEADER_SIZE,
                    recno: self.recno,
                    key: if self.is_row() { self.promote_key() } else { Vec::new() },
                    ..Boundary::default()
                };
                self.cur_bnd = next;
                self.dsk.truncate(PAGE_HEADER_SIZE);
                self.entries = 0;
                self.space_avail = self.split_size - PAGE_HEADER_SIZE;
            }
        }
        Ok(())
    }

    /// Fix up after crossing the maximum page boundary: write each
    /// saved chunk independently, then slide the remnant down.
    fn split_fixup(&mut self) -> Result<()> {
        let saved = std::mem::take(&mut self.saved);
        let mut boundaries = saved;
        // The current chunk's start marks the end of the last saved
        // chunk.
        let ends: Vec<usize> = boundaries
            .iter()
            .skip(1)
            .map(|b| b.start)
            .chain(std::iter::once(self.cur_bnd.start))
            .collect();
        for (bnd, end) in boundaries.drain(..).zip(ends) {
            let chunk = self.dsk[bnd.start..end].to_vec();
            self.write_chunk(bnd, &chunk)?;
        }

        // The remnant moves to the front of the working buffer.
        let remnant: Vec<u8> = self.dsk[self.cur_bnd.start..].to_vec();
        debug_assert!(remnant.len() < self.split_size - PAGE_HEADER_SIZE);
        self.dsk.truncate(PAGE_HEADER_SIZE);
        self.dsk.extend_from_slice(&remnant);
        self.cur_bnd.start = PAGE_HEADER_SIZE;

        self.entries -= self.total_entries;
        self.space_avail = (self.split_size - PAGE_HEADER_SIZE) - remnant.len();
        Ok(())
    }

    /// Finish the page: write whatever remains.
    fn split_finish(&mut self) -> Result<()> {
        // No entries only happens when the page was entirely empty, or
        // when a split wrote the final record and nothing followed.
        if self.entries == 0 {
            debug_assert!(self.saved.is_empty());
            return Ok(());
        }

        if self.bnd_state == BndState::TrackingOff {
            let mut bnd = std::mem::take(&mut self.cur_bnd);
            bnd.entries = self.entries;
            if self.is_row() && self.done.is_empty() && bnd.key.is_empty() {
                bnd.key = self.first_chunk_key()?;
            }
            let chunk = self.dsk[PAGE_HEADER_SIZE..].to_vec();
            self.write_chunk(bnd, &chunk)
        } else {
            // All the boundary checking was wasted: the page fit.  The
            // first saved slot (or the current one) describes the whole
            // image.
            let mut bnd = if self.saved.is_empty() {
                std::mem::take(&mut self.cur_bnd)
            } else {
                self.saved.swap_remove(0)
            };
            self.saved.clear();
            bnd.entries = self.entries;
            bnd.start = PAGE_HEADER_SIZE;
            if self.is_row() && bnd.key.is_empty() {
                bnd.key = self.first_chunk_key()?;
            }
            let chunk = self.dsk[PAGE_HEADER_SIZE..].to_vec();
            self.write_chunk(bnd, &chunk)
        }
    }

    /// Write one chunk through the block manager and record where it
    /// landed.
    fn write_chunk(&mut self, mut bnd: Boundary, chunk: &[u8]) -> Result<()> {
        let mut buf = vec![0u8; PAGE_HEADER_SIZE];
        buf.extend_from_slice(chunk);

        // Zero-length final values on row-store leaves are detected by
        // two adjacent key cells; write a trailing zero-length key cell
        // so the last pair is unambiguous.
        if self.page.page_type == PageType::RowLeaf {
            buf.push(codec::pack_key_empty());
        }

        let mut hdr = PageHeader::new(self.page.page_type.disk_type());
        hdr.recno = bnd.recno;
        hdr.entries = bnd.entries;
        hdr.size = buf.len() as u32;
        hdr.pack_into(&mut buf);

        trace!(target: "write", "{}: {:?} chunk, {} entries", self.btree.name,
            self.page.page_type, bnd.entries);
        let addr = self.btree.block.write(&mut buf)?;
        bnd.addr = Some(addr);
        self.done.push(bnd);
        Ok(())
    }

    /// Copy a built cell into the image.
    fn copy_incr(&mut self, kv: &Kv) {
        debug_assert!(kv.len() <= self.space_avail);
        self.dsk.extend_from_slice(&kv.cell);
        self.dsk.extend_from_slice(&kv.data);
        self.entries += 1;
        self.space_avail -= kv.len();
    }

    /// Update prefix and suffix compression from the key just written.
    fn key_state_update(&mut self, ovfl_key: bool) {
        // An overflow key leaves the last-key state alone and turns off
        // suffix compression: there is no image to compare against.
        if ovfl_key {
            self.key_sfx_compress = false;
        } else {
            std::mem::swap(&mut self.cur_key, &mut self.last_key);
            self.key_pfx_compress = self.pfx_conf;
            self.key_sfx_compress = self.sfx_conf;
        }
    }

    // ------------------------------------------------------------------
    // Cell builders
    // ------------------------------------------------------------------

    /// Build a key cell.  `None` data means the caller has a
    /// prefix-compressed key it can't use (it just crossed a split
    /// point): rebuild from the saved full key.
    fn build_key(&mut self, data: Option<&[u8]>, is_internal: bool) -> Result<(Kv, bool)> {
        let mut pfx = 0u8;
        let buf: Vec<u8> = match data {
            None => self.cur_key.clone(),
            Some(data) => {
                self.cur_key = data.to_vec();
                if self.key_pfx_compress {
                    // The previous key sorts first by definition, so
                    // the keys differ within the shorter length; we
                    // can't compress out more than 255 bytes.
                    let max = data.len().min(self.last_key.len()).min(u8::MAX as usize);
                    while (pfx as usize) < max
                        && data[pfx as usize] == self.last_key[pfx as usize]
                    {
                        pfx += 1;
                    }
                }
                data[pfx as usize..].to_vec()
            }
        };

        let item_max = if is_internal {
            self.btree.config.internal_item_max
        } else {
            self.btree.config.leaf_item_max
        } as usize;
        if buf.len() > item_max {
            // Overflow keys aren't prefix-compressed; rebuild first if
            // this one was.
            if pfx == 0 {
                let kv = self.build_ovfl(&buf, CellType::KeyOvfl, 0)?;
                return Ok((kv, true));
            }
            return self.build_key(None, is_internal);
        }

        let kv = Kv {
            cell: codec::pack_key(pfx, buf.len()),
            data: buf,
        };
        Ok((kv, false))
    }

    /// Build a value cell.
    fn build_val(&mut self, data: &[u8], rle: u64) -> Result<Kv> {
        if !data.is_empty() && data.len() > self.btree.config.leaf_item_max as usize {
            return self.build_ovfl(data, CellType::ValueOvfl, rle);
        }
        Ok(Kv {
            cell: codec::pack_value(rle, data.len()),
            data: data.to_vec(),
        })
    }

    /// Build an address cell.
    fn build_addr(&self, addr: &[u8], recno: u64) -> Kv {
        Kv {
            cell: codec::pack_addr(recno, addr.len()),
            data: addr.to_vec(),
        }
    }

    /// Store an overflow item, reusing a previously written record if
    /// this page already wrote an identical payload.
    fn build_ovfl(&mut self, payload: &[u8], cell_type: CellType, rle: u64) -> Result<Kv> {
        let mut track = self.page.ovfl_track.lock();
        let addr = match track.iter().find(|(p, _)| p == payload) {
            Some((_, addr)) => addr.clone(),
            None => {
                let mut buf = vec![0u8; PAGE_HEADER_SIZE];
                buf.extend_from_slice(payload);
                let mut hdr = PageHeader::new(DiskPageType::Ovfl);
                hdr.entries = payload.len() as u32;
                hdr.size = buf.len() as u32;
                hdr.pack_into(&mut buf);
                let addr = self.btree.block.write(&mut buf)?;
                track.push((payload.to_vec(), addr.clone()));
                addr
            }
        };
        Ok(Kv {
            cell: codec::pack_ovfl(cell_type, rle, addr.len()),
            data: addr,
        })
    }

    /// If a cell references an overflow chunk, schedule the block for
    /// release once the new image commits.
    fn track_cell_free(&mut self, img: &[u8], cell: &codec::CellUnpack) {
        if cell.cell_type.is_ovfl() {
            self.blocks_to_free.push(cell.data(img).to_vec());
        }
    }

    // ------------------------------------------------------------------
    // Column-store internal pages
    // ------------------------------------------------------------------

    fn col_int(&mut self) -> Result<()> {
        self.split_init(self.page.recno(), self.btree.config.internal_page_max);
        let page = Arc::clone(&self.page);
        self.col_merge(&page)?;
        self.split_finish()
    }

    /// Recursively walk a column-store internal tree of merge pages.
    fn col_merge(&mut self, page: &Arc<Page>) -> Result<()> {
        let refs: Vec<Arc<Ref>> = page.refs().to_vec();
        for ref_ in refs {
            self.recno = ref_.key.recno();

            // Deleted and split child pages are merged into the parent
            // and discarded.
            let mut val: Option<Kv> = None;
            if let Some(child_id) = ref_.page_id() {
                if let Some(child) = self.btree.arena.get(child_id) {
                    if child.is_split_merge() {
                        self.col_merge(&child)?;
                        continue;
                    }
                    match child.rec_result() {
                        RecResult::Empty => continue,
                        RecResult::Replace(addr) => {
                            val = Some(self.build_addr(&addr, ref_.key.recno()));
                        }
                        RecResult::Split(split_id) => {
                            let split = self.btree.arena.get(split_id).ok_or_else(|| {
                                Error::Internal("split page gone".to_string())
                            })?;
                            self.col_merge(&split)?;
                            continue;
                        }
                        RecResult::None => {}
                    }
                }
            }

            // Unresolved children fall back to the on-disk address.
            let val = match val {
                Some(v) => v,
                None => {
                    let addr = ref_.addr().ok_or(Error::Busy)?;
                    self.build_addr(&addr, ref_.key.recno())
                }
            };

            while val.len() > self.space_avail {
                self.split()?;
            }
            self.copy_incr(&val);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Row-store internal pages
    // ------------------------------------------------------------------

    fn row_int(&mut self) -> Result<()> {
        self.split_init(0, self.btree.config.internal_page_max);

        // The 0th key on an internal page is never used by searches:
        // truncate it to a single byte.
        self.cell_zero = true;
        self.merge_key = None;

        let page = Arc::clone(&self.page);
        self.row_merge(&page, true)?;
        self.split_finish()
    }

    /// Walk a row-store internal page, recursing through merge pages.
    fn row_merge(&mut self, page: &Arc<Page>, top: bool) -> Result<()> {
        let refs: Vec<Arc<Ref>> = page.refs().to_vec();
        for ref_ in refs {
            let mut val: Option<Kv> = None;
            if let Some(child_id) = ref_.page_id() {
                if let Some(child) = self.btree.arena.get(child_id) {
                    if child.is_split_merge() || matches!(child.rec_result(), RecResult::Split(_)) {
                        // A merged subtree's first key may be stale: the
                        // search code coerces any 0th key to sort before
                        // any search key, so a new smallest key inserted
                        // below never updated it.  Take this level's key
                        // as the correction; starting descent of a new
                        // merge tree always resets it.
                        if top || self.merge_key.is_none() {
                            self.merge_key = Some(ref_.key.row().to_vec());
                        }
                        let target = if child.is_split_merge() {
                            child
                        } else {
                            match child.rec_result() {
                                RecResult::Split(split_id) => {
                                    self.btree.arena.get(split_id).ok_or_else(|| {
                                        Error::Internal("split page gone".to_string())
                                    })?
                                }
                                _ => unreachable!(),
                            }
                        };
                        self.row_merge(&target, false)?;
                        continue;
                    }
                    match child.rec_result() {
                        RecResult::Empty => continue,
                        RecResult::Replace(addr) => val = Some(self.build_addr(&addr, 0)),
                        RecResult::None | RecResult::Split(_) => {}
                    }
                }
            }

            // Build the key cell.  The first key emitted under a merged
            // subtree uses the correction key saved above; the page's
            // own keys never do.
            let key_bytes = if top {
                ref_.key.row().to_vec()
            } else {
                match self.merge_key.take() {
                    Some(k) => k,
                    None => ref_.key.row().to_vec(),
                }
            };
            let key_data: &[u8] = if self.cell_zero {
                &key_bytes[..key_bytes.len().min(1)]
            } else {
                &key_bytes
            };
            let (mut key, mut ovfl_key) = self.build_key(Some(key_data), true)?;
            self.cell_zero = false;

            let val = match val {
                Some(v) => v,
                None => {
                    let addr = ref_.addr().ok_or(Error::Busy)?;
                    self.build_addr(&addr, 0)
                }
            };

            while key.len() + val.len() > self.space_avail {
                self.split()?;
                self.key_pfx_compress = false;
                if !ovfl_key {
                    let (k, o) = self.build_key(None, true)?;
                    key = k;
                    ovfl_key = o;
                }
            }

            self.copy_incr(&key);
            self.copy_incr(&val);
            self.key_state_update(ovfl_key);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Row-store leaf pages
    // ------------------------------------------------------------------

    fn row_leaf(&mut self, salvage: Option<&mut SalvageCookie>) -> Result<()> {
        self.split_init(0, self.btree.config.leaf_page_max);
        let mut slvg_skip = salvage.map_or(0, |s| s.skip);

        let page = Arc::clone(&self.page);
        let leaf = page.row_leaf();
        let img: Vec<u8> = leaf.dsk.clone().unwrap_or_default();
        let inserts = leaf.inserts.read();
        let updates = leaf.updates.read();
        let cmp = Arc::clone(&self.btree.config.collator);

        let mut ins_iter = inserts.entries.iter().peekable();

        for slot in 0..leaf.rows.len() {
            // Salvage occasionally needs to skip leading records.
            if slvg_skip != 0 {
                slvg_skip -= 1;
                continue;
            }

            let read_ovfl = |cookie: &[u8]| self.btree.read_ovfl(cookie);
            let slot_key = leaf.key_at(slot, self.btree.config.key_gap, &read_ovfl)?;

            // Inserted keys sorting before this one go out first.
            while let Some((ik, chain)) = ins_iter.peek() {
                if crate::config::collate(&cmp, ik, &slot_key) == CmpOrdering::Less {
                    let (ik, chain) = ins_iter.next().unwrap();
                    self.row_leaf_insert(ik, chain)?;
                } else {
                    break;
                }
            }

            let key_cell = leaf.key_cell(slot)?;
            let val_cell = leaf.value_cell(slot)?;

            // Build the value cell.
            let mut val = Kv::default();
            match updates.get(&(slot as u32)).and_then(|c| c.visible()) {
                None => {
                    // Copy the item off the page; it may have been zero
                    // length.
                    if let Some(ref c) = val_cell {
                        val = Kv::raw(&img[c.data_off - (c.len - c.data_len)
                            ..c.data_off + c.data_len]);
                    }
                }
                Some(upd) => {
                    // Rewriting the pair releases any overflow blocks
                    // the old cells referenced.
                    if let Some(ref c) = val_cell {
                        self.track_cell_free(&img, c);
                    }
                    if upd.is_delete() {
                        self.track_cell_free(&img, &key_cell);
                        continue;
                    }
                    let data = upd.data.as_deref().unwrap();
                    if !data.is_empty() {
                        val = self.build_val(data, 0)?;
                    }
                }
            }

            // Build the key cell.
            let mut ovfl_key = false;
            let mut key = Kv::default();
            if key_cell.cell_type == CellType::KeyOvfl {
                // Assume prefix compression won't improve an overflow
                // key, and copy the cell through.
                key = Kv::raw(
                    &img[key_cell.data_off - (key_cell.len - key_cell.data_len)
                        ..key_cell.data_off + key_cell.data_len],
                );
                ovfl_key = true;
            } else {
                let (k, o) = self.build_key(Some(&slot_key), false)?;
                key = k;
                ovfl_key = o;
            }

            while key.len() + val.len() + TRAILING_KEY_CELL > self.space_avail {
                // We're about to promote the key; we need a full copy.
                if ovfl_key && key_cell.cell_type == CellType::KeyOvfl {
                    self.cur_key = slot_key.clone();
                }
                self.split()?;
                self.key_pfx_compress = false;
                if !ovfl_key {
                    let (k, o) = self.build_key(None, false)?;
                    key = k;
                    ovfl_key = o;
                }
            }

            self.copy_incr(&key);
            if val.len() != 0 {
                self.copy_incr(&val);
            }
            self.key_state_update(ovfl_key);
        }

        // Whatever inserts remain sort after the last on-page key.
        let remaining: Vec<(Vec<u8>, UpdateChain)> = ins_iter
            .map(|(k, c)| (k.clone(), c.clone()))
            .collect();
        drop(inserts);
        drop(updates);
        for (ik, chain) in &remaining {
            self.row_leaf_insert(ik, chain)?;
        }

        self.split_finish()
    }

    /// Write one inserted key/value pair.
    fn row_leaf_insert(&mut self, ikey: &[u8], chain: &UpdateChain) -> Result<()> {
        let Some(upd) = chain.visible() else { return Ok(()) };
        if upd.is_delete() {
            return Ok(());
        }
        let data = upd.data.as_deref().unwrap();
        let mut val = Kv::default();
        if !data.is_empty() {
            val = self.build_val(data, 0)?;
        }
        let (mut key, mut ovfl_key) = self.build_key(Some(ikey), false)?;

        while key.len() + val.len() + TRAILING_KEY_CELL > self.space_avail {
            self.split()?;
            self.key_pfx_compress = false;
            if !ovfl_key {
                let (k, o) = self.build_key(None, false)?;
                key = k;
                ovfl_key = o;
            }
        }

        self.copy_incr(&key);
        if val.len() != 0 {
            self.copy_incr(&val);
        }
        self.key_state_update(ovfl_key);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Variable-length column-store leaf pages
    // ------------------------------------------------------------------

    /// Create a variable-length record cell and write it onto the
    /// page, applying any salvage adjustments.
    fn col_var_helper(
        &mut self,
        salvage: Option<&mut SalvageCookie>,
        value: &[u8],
        deleted: bool,
        raw: bool,
        mut rle: u64,
    ) -> Result<()> {
        // Salvage occasionally discards records from the beginning or
        // end of the page; the items may be part of an RLE cell, so the
        // adjustments happen here.
        if let Some(salvage) = salvage {
            if salvage.done {
                return Ok(());
            }
            if salvage.skip != 0 {
                if rle <= salvage.skip {
                    salvage.skip -= rle;
                    return Ok(());
                }
                salvage.skip = 0;
                rle -= salvage.skip;
            }
            if salvage.take != 0 {
                if rle <= salvage.take {
                    salvage.take -= rle;
                } else {
                    rle = salvage.take;
                    salvage.take = 0;
                }
                if salvage.take == 0 {
                    salvage.done = true;
                }
            }
        }

        let val = if deleted {
            Kv {
                cell: codec::pack_del(rle),
                data: Vec::new(),
            }
        } else if raw {
            Kv::raw(value)
        } else {
            self.build_val(value, rle)?
        };

        while val.len() > self.space_avail {
            self.split()?;
        }
        self.copy_incr(&val);
        self.recno += rle;
        Ok(())
    }

    fn col_var(&mut self, mut salvage: Option<&mut SalvageCookie>) -> Result<()> {
        self.split_init(self.page.recno(), self.btree.config.leaf_page_max);

        let page = Arc::clone(&self.page);
        let col = page.col_var();
        let img: Vec<u8> = col.dsk.clone().unwrap_or_default();
        let updates = col.updates.read();
        let append = col.append.read();

        // Salvage may be reconciling a page with missing records ahead
        // of it: a single deleted-run cell re-creates the name space.
        let slvg_missing = salvage.as_deref().map_or(0, |s| s.missing);
        if slvg_missing != 0 {
            self.col_var_helper(None, &[], true, false, slvg_missing)?;
        }

        // Track the previous value: equal runs coalesce into one RLE
        // cell, whether they came from the original page or updates.
        let mut last_val: Vec<u8> = Vec::new();
        let mut last_deleted = false;
        let mut can_compare = false;
        let mut rle: u64 = 0;
        let mut src_recno = self.recno;

        for slot in 0..col.cols.len() {
            let cell = codec::unpack(&img, col.cols[slot] as usize)?;
            let nrepeat = cell.rle();
            let orig_deleted = cell.cell_type == CellType::Del;
            let slot_start = col.starts[slot];

            // Updates overlapping this cell's record range.
            let has_updates = updates
                .range(slot_start..slot_start + nrepeat)
                .next()
                .is_some();

            // Overflow values without updates pass through raw: don't
            // copy the record just to compare it.
            if cell.cell_type == CellType::ValueOvfl && !has_updates {
                if can_compare {
                    self.col_var_helper(
                        salvage.as_deref_mut(),
                        &last_val,
                        last_deleted,
                        false,
                        rle,
                    )?;
                    can_compare = false;
                }
                let raw_bytes =
                    img[cell.data_off - (cell.len - cell.data_len)..cell.data_off + cell.data_len]
                        .to_vec();
                self.col_var_helper(
                    salvage.as_deref_mut(),
                    &raw_bytes,
                    false,
                    true,
                    nrepeat,
                )?;
                src_recno += nrepeat;
                continue;
            }

            let orig: Vec<u8> = if orig_deleted {
                Vec::new()
            } else if cell.cell_type == CellType::ValueOvfl {
                // Rewriting an overflow cell's records releases the
                // underlying file space.
                self.track_cell_free(&img, &cell);
                self.read_ovfl(cell.data(&img))?
            } else {
                cell.data(&img).to_vec()
            };

            // Loop the repeat records, looking for updates matching the
            // record number.
            let mut n = 0u64;
            while n < nrepeat {
                let (deleted, data, repeat_count) = match updates.get(&src_recno) {
                    Some(chain) => {
                        let upd = chain.visible();
                        let deleted = upd.map_or(true, |u| u.is_delete());
                        let data = upd
                            .and_then(|u| u.data.clone())
                            .unwrap_or_default();
                        (deleted, data, 1u64)
                    }
                    None => {
                        // Repeat up to the next updated record, or the
                        // end of this cell.
                        let next_upd = updates
                            .range(src_recno + 1..slot_start + nrepeat)
                            .next()
                            .map(|(&r, _)| r);
                        let count = match next_upd {
                            Some(r) => r - src_recno,
                            None => nrepeat - n,
                        };
                        (orig_deleted, orig.clone(), count)
                    }
                };

                // RLE accounting: matching records extend the run,
                // differing records flush it.
                if can_compare {
                    if (deleted && last_deleted)
                        || (!last_deleted && !deleted && last_val == data)
                    {
                        rle += repeat_count;
                        n += repeat_count;
                        src_recno += repeat_count;
                        continue;
                    }
                    self.col_var_helper(
                        salvage.as_deref_mut(),
                        &last_val,
                        last_deleted,
                        false,
                        rle,
                    )?;
                }

                last_val = data;
                last_deleted = deleted;
                rle = repeat_count;
                can_compare = true;
                n += repeat_count;
                src_recno += repeat_count;
            }
        }

        // Walk the append list; gaps in the name space are deleted
        // records.
        for (&recno, chain) in append.iter() {
            while src_recno <= recno {
                let (deleted, data) = if src_recno < recno {
                    (true, Vec::new())
                } else {
                    let upd = chain.visible();
                    let deleted = upd.map_or(true, |u| u.is_delete());
                    let data = upd.and_then(|u| u.data.clone()).unwrap_or_default();
                    (deleted, data)
                };

                if can_compare {
                    if (deleted && last_deleted)
                        || (!last_deleted && !deleted && last_val == data)
                    {
                        rle += 1;
                        src_recno += 1;
                        continue;
                    }
                    self.col_var_helper(
                        salvage.as_deref_mut(),
                        &last_val,
                        last_deleted,
                        false,
                        rle,
                    )?;
                }

                last_val = data;
                last_deleted = deleted;
                rle = 1;
                can_compare = true;
                src_recno += 1;
            }
        }

        // Flush the record we were tracking.
        if can_compare {
            self.col_var_helper(salvage.as_deref_mut(), &last_val, last_deleted, false, rle)?;
        }

        drop(updates);
        drop(append);
        self.split_finish()
    }

    // ------------------------------------------------------------------
    // Fixed-length column-store leaf pages
    // ------------------------------------------------------------------

    fn col_fix(&mut self) -> Result<()> {
        self.split_init(self.page.recno(), self.btree.config.leaf_page_max);

        let page = Arc::clone(&self.page);
        let fix = page.col_fix();
        let bitcnt = fix.bitcnt as usize;
        let append = fix.append.read();

        // In-place updates were applied to the bit image as they
        // happened; copy it wholesale.
        let chunk_capacity = (self.space_avail * 8) / bitcnt;
        let mut bitbuf = vec![0u8; bitstr_size(chunk_capacity * bitcnt)];
        let onpage = fix.bitf.read();
        bitbuf[..onpage.len()].copy_from_slice(&onpage);
        drop(onpage);

        let mut entry = page.entries as usize;
        let mut nrecs = chunk_capacity.saturating_sub(entry);
        self.recno += entry as u64;

        for (&recno, &bits) in append.iter() {
            loop {
                // Appends may leave gaps in the name space.
                while nrecs > 0 && self.recno < recno {
                    bit_setv(&mut bitbuf, entry, fix.bitcnt, 0);
                    nrecs -= 1;
                    entry += 1;
                    self.recno += 1;
                }

                if nrecs > 0 {
                    bit_setv(&mut bitbuf, entry, fix.bitcnt, bits);
                    nrecs -= 1;
                    entry += 1;
                    self.recno += 1;
                    break;
                }

                // The chunk filled: write it and start another.
                self.fix_incr(&bitbuf, entry, bitcnt);
                self.split()?;
                entry = 0;
                let cap = (self.space_avail * 8) / bitcnt;
                bitbuf = vec![0u8; bitstr_size(cap * bitcnt)];
                nrecs = cap;
            }
        }

        self.fix_incr(&bitbuf, entry, bitcnt);
        drop(append);
        self.split_finish()
    }

    /// Reconcile a fixed-length page during salvage: take a sub-range
    /// of the original bit image, re-creating missing leading records.
    fn col_fix_slvg(&mut self, salvage: &mut SalvageCookie) -> Result<()> {
        self.split_init(self.page.recno(), self.btree.config.leaf_page_max);

        let page = Arc::clone(&self.page);
        let fix = page.col_fix();
        let bitcnt = fix.bitcnt as usize;
        let onpage = fix.bitf.read().clone();

        // We may not be taking all of the entries on the original page.
        let mut page_take = if salvage.take == 0 {
            (page.entries as u64).saturating_sub(salvage.skip)
        } else {
            salvage.take
        };
        let mut page_start = salvage.skip;

        loop {
            let chunk_capacity = (self.space_avail * 8) / bitcnt;
            let mut bitbuf = vec![0u8; bitstr_size(chunk_capacity * bitcnt)];
            let mut entry = 0usize;
            let mut nrecs = chunk_capacity;

            while nrecs > 0 && salvage.missing > 0 {
                bit_setv(&mut bitbuf, entry, fix.bitcnt, 0);
                nrecs -= 1;
                salvage.missing -= 1;
                entry += 1;
            }
            while nrecs > 0 && page_take > 0 {
                let bits = page::bit_getv(&onpage, page_start as usize, fix.bitcnt);
                bit_setv(&mut bitbuf, entry, fix.bitcnt, bits);
                nrecs -= 1;
                page_take -= 1;
                page_start += 1;
                entry += 1;
            }

            self.recno += entry as u64;
            self.fix_incr(&bitbuf, entry, bitcnt);

            if salvage.missing == 0 && page_take == 0 {
                break;
            }
            self.split()?;
        }

        self.split_finish()
    }

    fn fix_incr(&mut self, bitbuf: &[u8], entries: usize, bitcnt: usize) {
        let bytes = bitstr_size(entries * bitcnt);
        self.dsk.extend_from_slice(&bitbuf[..bytes]);
        self.entries += entries as u32;
        self.space_avail -= bytes;
    }

    // ------------------------------------------------------------------
    // Wrap-up
    // ------------------------------------------------------------------

    /// Record the outcome on the page and release blocks the previous
    /// reconciliation left behind.
    fn wrapup(&mut self, prev: RecResult) -> Result<()> {
        // The previous reality is about to be replaced; discard it.
        match prev {
            RecResult::None => {
                // Never reconciled: release the original address blocks.
                if !self.page.is_root() {
                    if let Ok(ref_) = self.btree.ref_of(&self.page) {
                        if let Some(addr) = ref_.addr() {
                            self.blocks_to_free.push(addr);
                        }
                    }
                }
            }
            RecResult::Empty => {}
            RecResult::Replace(addr) => self.blocks_to_free.push(addr),
            RecResult::Split(split_id) => {
                if let Some(split) = self.btree.arena.get(split_id) {
                    for ref_ in split.refs() {
                        if let Some(addr) = ref_.addr() {
                            self.blocks_to_free.push(addr);
                        }
                    }
                }
                self.btree.discard_page(split_id);
            }
        }

        let outcome = match self.done.len() {
            0 => {
                // An empty page is discarded from the tree by the
                // parent's next reconciliation.
                debug!(target: "reconcile", "{}: page {} empty", self.btree.name, self.page.id);
                RecResult::Empty
            }
            1 => {
                let addr = self.done[0].addr.take().expect("written chunk");
                RecResult::Replace(addr)
            }
            n => {
                debug!(
                    target: "reconcile",
                    "{}: page {} split into {} pages", self.btree.name, self.page.id, n
                );
                RecResult::Split(self.split_page()?)
            }
        };
        *self.page.rec_result.write() = outcome;
        Ok(())
    }

    /// Create the synthetic internal page enumerating the split chunks.
    ///
    /// Parent pages aren't rewritten when children split; the new page
    /// is never written to disk, only merged into the parent when the
    /// parent is next reconciled.
    fn split_page(&mut self) -> Result<page::PageId> {
        let is_row = self.is_row();
        let refs: Vec<Arc<Ref>> = self
            .done
            .drain(..)
            .map(|mut bnd| {
                let addr = bnd.addr.take().expect("written chunk");
                let key = if is_row {
                    RefKey::Row(std::mem::take(&mut bnd.key))
                } else {
                    RefKey::Col(bnd.recno)
                };
                Arc::new(Ref::new_disk(addr, key))
            })
            .collect();

        let entries = refs.len() as u32;
        let footprint = std::mem::size_of::<Page>()
            + refs
                .iter()
                .map(|r| r.key.row().len() + r.addr().map_or(0, |a| a.len()) + 64)
                .sum::<usize>();
        let recno = match refs.first().map(|r| r.key.recno()) {
            Some(r) => r,
            None => 0,
        };

        let page_type = if is_row { PageType::RowInt } else { PageType::ColInt };
        let build = PageBuild {
            page_type,
            parent: self.page.parent,
            parent_slot: self.page.parent_slot,
            entries,
            footprint,
            is_split_merge: true,
            dirty: false,
            data_fn: Box::new(move || {
                if is_row {
                    PageData::RowInt(page::RowInt { refs })
                } else {
                    PageData::ColInt(page::ColInt { recno, refs })
                }
            }),
        };
        Ok(self.btree.install_page(build).id)
    }
}

mod bulk;
pub use bulk::BulkLoader;
