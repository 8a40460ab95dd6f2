//! Bulk loading: stream sorted key/value pairs (or column values)
//! through the reconciler directly into split chunks, bypassing the
//! per-page mutation structures.  Only valid on an empty tree.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::btree::Btree;
use crate::config::TreeType;
use crate::error::{Error, Result};
use crate::page::{bit_setv, bitstr_size, Page, PageData, RecResult};

use super::{Kv, Reconciler, TRAILING_KEY_CELL};

pub struct BulkLoader {
    r: Reconciler,
    leaf: Arc<Page>,

    /// Sort-order enforcement for row stores.
    prev_key: Option<Vec<u8>>,

    /// Run-length tracking for variable-length column stores.
    last_val: Option<Vec<u8>>,
    rle: u64,

    /// Chunk state for fixed-length column stores.
    fix_buf: Vec<u8>,
    fix_entry: usize,
    fix_nrecs: usize,

    appended: u64,
}

impl BulkLoader {
    /// Begin a bulk load; the tree must be empty.
    pub fn new(btree: &Arc<Btree>) -> Result<BulkLoader> {
        let root = btree
            .arena
            .get(btree.root_ref().page_id().ok_or(Error::Busy)?)
            .ok_or(Error::Busy)?;
        if root.refs().len() != 1 {
            return Err(Error::InvalidInput(
                "bulk-load requires an empty tree".to_string(),
            ));
        }
        let leaf = btree
            .arena
            .get(root.refs()[0].page_id().ok_or(Error::Busy)?)
            .ok_or(Error::Busy)?;
        let empty = match &leaf.data {
            PageData::RowLeaf(l) => l.rows.is_empty() && l.inserts.read().is_empty(),
            PageData::ColVar(c) => c.cols.is_empty() && c.append.read().is_empty(),
            PageData::ColFix(f) => leaf.entries == 0 && f.append.read().is_empty(),
            _ => false,
        };
        if !empty {
            return Err(Error::InvalidInput(
                "bulk-load requires an empty tree".to_string(),
            ));
        }

        let mut r = Reconciler::new(btree, &leaf);
        let recno = if btree.is_row() { 0 } else { 1 };
        r.split_init(recno, btree.config.leaf_page_max);

        Ok(BulkLoader {
            r,
            leaf,
            prev_key: None,
            last_val: None,
            rle: 0,
            fix_buf: Vec::new(),
            fix_entry: 0,
            fix_nrecs: 0,
            appended: 0,
        })
    }

    /// Row-store bulk insert; keys must arrive in collator order.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.r.btree.is_row() {
            return Err(Error::NotSupported(
                "row-store bulk insert into a column store".to_string(),
            ));
        }
        if let Some(prev) = &self.prev_key {
            if crate::config::collate(&self.r.btree.config.collator, prev, key) != CmpOrdering::Less {
                return Err(Error::InvalidInput(
                    "bulk-load keys out of order".to_string(),
                ));
            }
        }
        self.prev_key = Some(key.to_vec());

        let mut val = Kv::default();
        if !value.is_empty() {
            val = self.r.build_val(value, 0)?;
        }
        let (mut kcell, mut ovfl_key) = self.r.build_key(Some(key), false)?;

        while kcell.len() + val.len() + TRAILING_KEY_CELL > self.r.space_avail {
            self.r.split()?;
            self.r.key_pfx_compress = false;
            if !ovfl_key {
                let (k, o) = self.r.build_key(None, false)?;
                kcell = k;
                ovfl_key = o;
            }
        }

        self.r.copy_incr(&kcell);
        if val.len() != 0 {
            self.r.copy_incr(&val);
        }
        self.r.key_state_update(ovfl_key);
        Ok(())
    }

    /// Column-store bulk append of the next record.
    pub fn append(&mut self, value: &[u8]) -> Result<()> {
        match self.r.btree.config.tree_type {
            TreeType::Row => Err(Error::NotSupported(
                "column-store bulk append into a row store".to_string(),
            )),
            TreeType::ColVar => self.append_var(value),
            TreeType::ColFix { bitcnt } => self.append_fix(value, bitcnt),
        }
    }

    fn append_var(&mut self, value: &[u8]) -> Result<()> {
        self.appended += 1;
        match &self.last_val {
            Some(last) if last.as_slice() == value => {
                self.rle += 1;
                Ok(())
            }
            Some(_) => {
                let last = self.last_val.take().unwrap();
                self.r.col_var_helper(None, &last, false, false, self.rle)?;
                self.last_val = Some(value.to_vec());
                self.rle = 1;
                Ok(())
            }
            None => {
                self.last_val = Some(value.to_vec());
                self.rle = 1;
                Ok(())
            }
        }
    }

    fn append_fix(&mut self, value: &[u8], bitcnt: u8) -> Result<()> {
        self.appended += 1;
        if self.fix_entry == self.fix_nrecs {
            // If everything didn't fit, update the counters and split.
            if self.fix_entry != 0 {
                self.r.fix_incr(&self.fix_buf, self.fix_entry, bitcnt as usize);
                self.r.split()?;
            }
            self.fix_entry = 0;
            self.fix_nrecs = (self.r.space_avail * 8) / bitcnt as usize;
            self.fix_buf = vec![0u8; bitstr_size(self.fix_nrecs * bitcnt as usize)];
        }

        let bits = value.first().copied().unwrap_or(0);
        bit_setv(&mut self.fix_buf, self.fix_entry, bitcnt, bits);
        self.fix_entry += 1;
        self.r.recno += 1;
        Ok(())
    }

    /// Flush the remainder and record the outcome on the tree.
    pub fn finish(mut self) -> Result<()> {
        match self.r.btree.config.tree_type {
            TreeType::ColVar => {
                if let Some(last) = self.last_val.take() {
                    self.r.col_var_helper(None, &last, false, false, self.rle)?;
                }
            }
            TreeType::ColFix { bitcnt } => {
                if self.fix_entry != 0 {
                    self.r.fix_incr(&self.fix_buf, self.fix_entry, bitcnt as usize);
                }
            }
            TreeType::Row => {}
        }

        self.r.split_finish()?;
        self.r.wrapup(RecResult::None)?;

        // Commit: the leaf is clean with its outcome recorded, and the
        // parent is dirty so the tree gets written at close.
        let write_gen = self.leaf.write_gen.load(Ordering::Acquire);
        self.leaf.disk_gen.store(write_gen, Ordering::Release);
        if let Some(parent_id) = self.leaf.parent {
            if let Some(parent) = self.r.btree.arena.get(parent_id) {
                parent.mark_modified();
            }
        }

        if !self.r.btree.is_row() {
            self.r.btree.last_recno.store(self.appended, Ordering::Release);
        }
        Ok(())
    }
}
