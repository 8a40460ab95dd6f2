//! Typed configuration consumed from the schema layer.
//!
//! The schema layer parses configuration strings; the storage core only
//! ever sees these structs, already validated against the page-size rules
//! below.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{Error, Result};

/// The minimum btree allocation size is 512B, the maximum 128MB.
pub const ALLOCATION_SIZE_MIN: u32 = 512;
pub const ALLOCATION_SIZE_MAX: u32 = 128 * 1024 * 1024;

/// Page sizes are enforced to 512MB by the software.
pub const PAGE_SIZE_MAX: u32 = 512 * 1024 * 1024;

/// Row-store comparison function, byte-lexicographic unless the schema
/// layer resolved a named collator and injected it here.
pub type Collator = Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>;

pub fn default_collator() -> Collator {
    Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))
}

/// Compare two keys with the configured collator.
#[inline]
pub fn collate(cmp: &Collator, a: &[u8], b: &[u8]) -> Ordering {
    (**cmp)(a, b)
}

/// Underlying tree flavor, derived from the key/value formats by the
/// schema layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeType {
    Row,
    /// Variable-length column store.
    ColVar,
    /// Fixed-length column store; fields are 1..=8 bits wide.
    ColFix { bitcnt: u8 },
}

/// Per-file configuration.
#[derive(Clone)]
pub struct BtreeConfig {
    pub tree_type: TreeType,

    /// Key/value formats; opaque to the core, used by callers for packing.
    pub key_format: String,
    pub value_format: String,

    /// Allocation size: a power of two in [512B, 128MB].
    pub allocation_size: u32,
    /// Page maximums: multiples of the allocation size, at most 512MB.
    pub internal_page_max: u32,
    pub leaf_page_max: u32,
    /// Item maximums: 0 means 1/8th of the split page size.
    pub internal_item_max: u32,
    pub leaf_item_max: u32,

    /// Reconciliation target chunk size as a percentage of the maximum,
    /// in 25..=100.
    pub split_pct: u32,

    /// Row-store prefix-compression reset gap.
    pub key_gap: u32,

    pub prefix_compression: bool,
    pub internal_key_truncate: bool,
    pub checksum: bool,

    pub collator: Collator,
}

impl std::fmt::Debug for BtreeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtreeConfig")
            .field("tree_type", &self.tree_type)
            .field("allocation_size", &self.allocation_size)
            .field("internal_page_max", &self.internal_page_max)
            .field("leaf_page_max", &self.leaf_page_max)
            .field("internal_item_max", &self.internal_item_max)
            .field("leaf_item_max", &self.leaf_item_max)
            .field("split_pct", &self.split_pct)
            .field("key_gap", &self.key_gap)
            .field("prefix_compression", &self.prefix_compression)
            .field("internal_key_truncate", &self.internal_key_truncate)
            .field("checksum", &self.checksum)
            .finish()
    }
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            tree_type: TreeType::Row,
            key_format: "u".to_string(),
            value_format: "u".to_string(),
            allocation_size: 512,
            internal_page_max: 2 * 1024,
            leaf_page_max: 1024 * 1024,
            internal_item_max: 0,
            leaf_item_max: 0,
            split_pct: 75,
            key_gap: 10,
            prefix_compression: true,
            internal_key_truncate: true,
            checksum: true,
            collator: default_collator(),
        }
    }
}

/// Split page size calculation: we don't want to repeatedly split every
/// time a new entry is added, so we split to a smaller-than-maximum size,
/// rounded up to an allocation unit.
pub fn split_page_size(page_size: u32, alloc_size: u32, pct: u32) -> u32 {
    let size = (page_size as u64 * pct as u64) / 100;
    align_up(size, alloc_size as u64) as u32
}

fn align_up(n: u64, align: u64) -> u64 {
    (n + (align - 1)) & !(align - 1)
}

impl BtreeConfig {
    /// Validate the page sizes and resolve the item-max defaults.
    ///
    /// Returns the configuration with `internal_item_max` and
    /// `leaf_item_max` filled in.
    pub fn validated(mut self) -> Result<Self> {
        if !self.allocation_size.is_power_of_two() {
            return Err(Error::InvalidInput(
                "the allocation size must be a power of two".to_string(),
            ));
        }
        if self.allocation_size < ALLOCATION_SIZE_MIN
            || self.allocation_size > ALLOCATION_SIZE_MAX
        {
            return Err(Error::InvalidInput(format!(
                "allocation size {}B outside [{}B, {}B]",
                self.allocation_size, ALLOCATION_SIZE_MIN, ALLOCATION_SIZE_MAX
            )));
        }

        for (name, max) in [
            ("internal", self.internal_page_max),
            ("leaf", self.leaf_page_max),
        ] {
            if max < self.allocation_size || max % self.allocation_size != 0 {
                return Err(Error::InvalidInput(format!(
                    "{} page size must be a multiple of the allocation size \
                     ({}B)",
                    name, self.allocation_size
                )));
            }
            if max > PAGE_SIZE_MAX {
                return Err(Error::InvalidInput(format!(
                    "{} page size {}B larger than the {}B maximum",
                    name, max, PAGE_SIZE_MAX
                )));
            }
        }

        if !(25..=100).contains(&self.split_pct) {
            return Err(Error::InvalidInput(format!(
                "split_pct {} outside 25..=100",
                self.split_pct
            )));
        }

        let intl_split = split_page_size(
            self.internal_page_max,
            self.allocation_size,
            self.split_pct,
        );
        let leaf_split =
            split_page_size(self.leaf_page_max, self.allocation_size, self.split_pct);

        // Default item maximums: at least 8 items fit on split pages.
        if self.internal_item_max == 0 {
            self.internal_item_max = intl_split / 8;
        }
        if self.leaf_item_max == 0 {
            self.leaf_item_max = leaf_split / 8;
        }

        // At least two maximum-sized items must fit on both the full
        // page and a split chunk.
        for (name, page_max, item_max, split) in [
            ("internal", self.internal_page_max, self.internal_item_max, intl_split),
            ("leaf", self.leaf_page_max, self.leaf_item_max, leaf_split),
        ] {
            if item_max > page_max / 2 {
                return Err(Error::InvalidInput(format!(
                    "{} page size ({}B) too small for the maximum item size \
                     ({}B); the page must be able to hold at least 2 items",
                    name, page_max, item_max
                )));
            }
            if item_max > split / 2 {
                return Err(Error::InvalidInput(format!(
                    "{} page size ({}B) too small for the maximum item size \
                     ({}B), because of the split percentage ({}%); a split \
                     page must be able to hold at least 2 items",
                    name, page_max, item_max, self.split_pct
                )));
            }
        }

        if let TreeType::ColFix { bitcnt } = self.tree_type {
            if bitcnt == 0 || bitcnt > 8 {
                return Err(Error::InvalidInput(
                    "fixed-width field sizes must be greater than 0 and less \
                     than or equal to 8"
                        .to_string(),
                ));
            }
        }

        Ok(self)
    }

    pub fn internal_split_size(&self) -> u32 {
        split_page_size(self.internal_page_max, self.allocation_size, self.split_pct)
    }

    pub fn leaf_split_size(&self) -> u32 {
        split_page_size(self.leaf_page_max, self.allocation_size, self.split_pct)
    }
}

/// Connection-level configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Cache byte budget.
    pub cache_size: u64,
    /// Eviction runs until usage drops below this percentage of the
    /// budget.
    pub eviction_target: u32,
    /// Application threads wake the eviction server when usage reaches
    /// this percentage of the budget.
    pub eviction_trigger: u32,
    /// Hazard references per session.
    pub hazard_max: u32,
    pub session_max: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            cache_size: 100 * 1024 * 1024,
            eviction_target: 80,
            eviction_trigger: 95,
            hazard_max: 30,
            session_max: 50,
        }
    }
}

impl ConnectionConfig {
    pub fn validated(self) -> Result<Self> {
        if !(10..=99).contains(&self.eviction_target)
            || !(10..=99).contains(&self.eviction_trigger)
        {
            return Err(Error::InvalidInput(
                "eviction target/trigger outside 10..=99".to_string(),
            ));
        }
        if self.eviction_target > self.eviction_trigger {
            return Err(Error::InvalidInput(
                "eviction target cannot exceed the eviction trigger".to_string(),
            ));
        }
        if self.hazard_max < 15 {
            return Err(Error::InvalidInput(
                "hazard_max must be at least 15".to_string(),
            ));
        }
        if self.session_max < 1 {
            return Err(Error::InvalidInput(
                "session_max must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = BtreeConfig::default().validated().unwrap();
        // leaf split = 768KB, item max defaults to 1/8th of it.
        assert_eq!(cfg.leaf_item_max, cfg.leaf_split_size() / 8);
        assert_eq!(cfg.internal_item_max, cfg.internal_split_size() / 8);

        ConnectionConfig::default().validated().unwrap();
    }

    #[test]
    fn test_allocation_size_power_of_two() {
        let cfg = BtreeConfig {
            allocation_size: 1000,
            ..Default::default()
        };
        assert!(matches!(cfg.validated(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_page_max_multiple_of_allocation() {
        let cfg = BtreeConfig {
            allocation_size: 512,
            leaf_page_max: 1000,
            ..Default::default()
        };
        assert!(matches!(cfg.validated(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_item_max_must_fit_twice() {
        let cfg = BtreeConfig {
            allocation_size: 512,
            leaf_page_max: 512,
            internal_page_max: 512,
            leaf_item_max: 400,
            split_pct: 100,
            ..Default::default()
        };
        assert!(matches!(cfg.validated(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_split_page_size_aligned() {
        assert_eq!(split_page_size(1024 * 1024, 512, 75), 786_432);
        assert_eq!(split_page_size(512, 512, 50), 512);
        assert_eq!(split_page_size(2048, 512, 75), 1536);
    }

    #[test]
    fn test_colfix_bitcnt_range() {
        let cfg = BtreeConfig {
            tree_type: TreeType::ColFix { bitcnt: 9 },
            ..Default::default()
        };
        assert!(cfg.validated().is_err());
        let cfg = BtreeConfig {
            tree_type: TreeType::ColFix { bitcnt: 8 },
            ..Default::default()
        };
        assert!(cfg.validated().is_ok());
    }
}
