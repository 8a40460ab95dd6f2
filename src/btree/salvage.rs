//! File salvage: rebuild a tree from whatever checksum-valid blocks
//! remain in the file.
//!
//! The block manager returns valid blocks in file order.  Row-store
//! leaves are re-inserted through the normal mutation path (later
//! blocks win duplicate keys).  Column-store leaves are reassembled by
//! record range: gaps become leading deleted runs, overlaps are
//! trimmed, and each page is pushed back through reconciliation with a
//! salvage cookie describing the sub-range to emit.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::config::TreeType;
use crate::error::{Error, Result};
use crate::hazard::Session;
use crate::page::codec::{DiskPageType, PageHeader};
use crate::page::{self, ColInt, Page, PageBuild, PageData, PageType, RecResult, Ref, RefKey};
use crate::reconcile::{rec_write, SalvageCookie};

use super::{Btree, OpenMode};

impl Btree {
    /// Salvage the file, rebuilding the tree in memory; the caller
    /// syncs or closes the handle afterwards to make it durable.
    pub fn salvage(self: &Arc<Self>, session: &Session) -> Result<()> {
        if self.open_mode != OpenMode::Salvage {
            return Err(Error::InvalidInput(
                "handle was not opened for salvage".to_string(),
            ));
        }
        debug!(target: "salvage", "{}: starting", self.name);

        self.block.salvage_start()?;
        let mut row_imgs: Vec<Vec<u8>> = Vec::new();
        let mut col_imgs: Vec<(u64, u64, Vec<u8>)> = Vec::new();
        while let Some((img, _addr)) = self.block.salvage_next()? {
            let Ok(hdr) = PageHeader::parse(&img) else {
                continue;
            };
            match (hdr.page_type, self.config.tree_type) {
                (DiskPageType::RowLeaf, TreeType::Row) => row_imgs.push(img),
                (DiskPageType::ColVar, TreeType::ColVar) => {
                    let count = col_var_record_count(&img)?;
                    col_imgs.push((hdr.recno, count, img));
                }
                (DiskPageType::ColFix, TreeType::ColFix { .. }) => {
                    col_imgs.push((hdr.recno, hdr.entries as u64, img));
                }
                // Internal pages are rebuilt from the leaves; overflow
                // blocks stay where leaf cells reference them.
                _ => {}
            }
        }
        self.block.salvage_end()?;

        match self.config.tree_type {
            TreeType::Row => self.salvage_row(session, row_imgs),
            _ => self.salvage_col(col_imgs),
        }
    }

    fn salvage_row(self: &Arc<Self>, session: &Session, imgs: Vec<Vec<u8>>) -> Result<()> {
        self.root_init_empty()?;

        let read_ovfl = |cookie: &[u8]| self.read_ovfl(cookie);
        for img in imgs {
            let build = page::page_inmem(img, None, 0, 0, &read_ovfl)?;
            let entries = build.entries as usize;
            let data = (build.data_fn)();
            let PageData::RowLeaf(leaf) = &data else {
                continue;
            };
            for slot in 0..entries {
                let key = leaf.key_at(slot, self.config.key_gap, &read_ovfl)?;
                let value = leaf.value_at(slot, &read_ovfl)?;
                self.insert(session, &key, &value)?;
            }
        }
        debug!(target: "salvage", "{}: row tree rebuilt", self.name);
        Ok(())
    }

    fn salvage_col(self: &Arc<Self>, mut imgs: Vec<(u64, u64, Vec<u8>)>) -> Result<()> {
        imgs.sort_by_key(|(start, _, _)| *start);

        // Highest record number already covered by a kept page.
        let mut taken_end: u64 = 0;
        let mut children: Vec<(u64, Vec<u8>)> = Vec::new();

        for (start, count, mut img) in imgs {
            if count == 0 {
                continue;
            }
            let end = start + count - 1;
            if end <= taken_end {
                // Fully shadowed by an earlier page.
                continue;
            }

            let mut cookie = SalvageCookie::default();
            let write_recno = taken_end + 1;
            if start > write_recno {
                cookie.missing = start - write_recno;
            } else if start < write_recno {
                cookie.skip = write_recno - start;
            }

            // The written page covers the name space from write_recno;
            // restamp the parsed recno accordingly.
            img[16..24].copy_from_slice(&write_recno.to_le_bytes());

            let read_ovfl = |cookie: &[u8]| self.read_ovfl(cookie);
            let build = page::page_inmem(img, None, 0, self.fix_bitcnt(), &read_ovfl)?;
            let temp = self.install_page(build);
            temp.mark_modified();

            let result = rec_write(self, &temp, Some(&mut cookie));
            if let Err(e) = result {
                self.discard_page(temp.id);
                return Err(e);
            }

            match temp.rec_result() {
                RecResult::Replace(addr) => children.push((write_recno, addr)),
                RecResult::Split(split_id) => {
                    if let Some(split) = self.arena.get(split_id) {
                        for r in split.refs() {
                            if let Some(addr) = r.addr() {
                                children.push((r.key.recno(), addr));
                            }
                        }
                    }
                    self.discard_page(split_id);
                }
                RecResult::Empty | RecResult::None => {}
            }
            self.discard_page(temp.id);
            taken_end = end.max(taken_end);
        }

        if children.is_empty() {
            self.last_recno.store(0, Ordering::Release);
            return self.root_init_empty();
        }

        // Synthesize the root over the salvaged leaves; dirty, so close
        // writes it out.
        let refs: Vec<Arc<Ref>> = children
            .iter()
            .map(|(recno, addr)| {
                Arc::new(Ref::new_disk(addr.clone(), RefKey::Col(*recno)))
            })
            .collect();
        let entries = refs.len() as u32;
        let footprint = std::mem::size_of::<Page>()
            + refs.iter().map(|r| r.addr().map_or(0, |a| a.len()) + 64).sum::<usize>();
        let recno0 = children[0].0;
        let build = PageBuild {
            page_type: PageType::ColInt,
            parent: None,
            parent_slot: 0,
            entries,
            footprint,
            is_split_merge: false,
            dirty: true,
            data_fn: Box::new(move || PageData::ColInt(ColInt { recno: recno0, refs })),
        };
        let root = self.install_page(build);
        self.set_root_ref(Arc::new(Ref::new_mem(root.id, RefKey::Col(recno0))));
        self.last_recno.store(taken_end, Ordering::Release);

        debug!(
            target: "salvage",
            "{}: column tree rebuilt, {} leaves, last record {}",
            self.name, children.len(), taken_end
        );
        Ok(())
    }
}

/// Total record count of a variable-length column-store image.
fn col_var_record_count(img: &[u8]) -> Result<u64> {
    let hdr = PageHeader::parse(img)?;
    let mut count = 0u64;
    for item in page::codec::CellIter::new(img, hdr.size as usize) {
        let (_, cell) = item?;
        count += cell.rle();
    }
    Ok(count)
}
