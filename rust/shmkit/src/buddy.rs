//! Buddy-system bookkeeping for a power-of-two arena.
//!
//! The arena is overlaid with a complete binary tree. Level 0 is the single
//! root cell spanning the whole arena; level `L` (the top level) has `2^L`
//! one-byte cells. Cells are numbered breadth-first from 0, so the children
//! of cell `c` are `2c + 1` and `2c + 2`.
//!
//! Each cell is `Nil`, `Free` or `Allocated`. Only the frontier of the
//! current partitioning carries `Free`/`Allocated`; everything above or below
//! it is `Nil`. Statuses live in a 2-bit [`SymbolArray`], and a per-level
//! count of `Free` cells answers "is there a free block at level K" without a
//! scan.
//!
//! The tree only hands out offsets. It never touches the arena bytes, which
//! is what lets the arena live in shared memory while this metadata stays in
//! the owning process.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::symbol::SymbolArray;

/// Bits needed to store a [`CellStatus`].
pub const CELL_STATUS_BITS: usize = 2;

/// Deepest supported top level (a 2 GiB arena of 1-byte cells).
pub const MAX_TOP_LEVEL: u32 = 31;

/// State of one cell of the buddy tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellStatus {
    /// Not on the frontier: merged into its parent or split into children.
    Nil = 0,
    Free = 1,
    Allocated = 2,
}

impl CellStatus {
    fn from_symbol(value: u64) -> Self {
        match value {
            1 => Self::Free,
            2 => Self::Allocated,
            _ => Self::Nil,
        }
    }
}

/// Index arithmetic over the breadth-first cell numbering.
pub mod cell {
    /// Number of cells on all levels above `level`.
    #[inline]
    pub const fn cells_before_level(level: u32) -> usize {
        (1usize << level) - 1
    }

    #[inline]
    pub const fn cells_in_level(level: u32) -> usize {
        1usize << level
    }

    /// Level a cell index belongs to.
    #[inline]
    pub const fn level_of(cell: usize) -> u32 {
        usize::BITS - 1 - (cell + 1).leading_zeros()
    }

    #[inline]
    pub const fn parent(cell: usize) -> usize {
        (cell - 1) / 2
    }

    /// The other child of this cell's parent.
    #[inline]
    pub const fn sibling(cell: usize) -> usize {
        if cell % 2 == 1 { cell + 1 } else { cell - 1 }
    }

    #[inline]
    pub const fn children(cell: usize) -> (usize, usize) {
        (2 * cell + 1, 2 * cell + 2)
    }

    /// Byte offset of `cell` (which sits on `level`) in an arena of
    /// `2^top_level` bytes.
    #[inline]
    pub const fn offset(cell: usize, level: u32, top_level: u32) -> usize {
        (cell - cells_before_level(level)) << (top_level - level)
    }

    /// The cell on `level` whose block starts exactly at `offset`, if any.
    #[inline]
    pub const fn at_offset(offset: usize, level: u32, top_level: u32) -> Option<usize> {
        let block = 1usize << (top_level - level);
        if offset % block != 0 {
            return None;
        }
        let index = offset / block;
        if index >= cells_in_level(level) {
            return None;
        }
        Some(index + cells_before_level(level))
    }
}

/// Buddy allocation state for an arena of `2^top_level` bytes.
pub struct BuddyTree {
    cells: SymbolArray<CELL_STATUS_BITS>,
    /// Level -> number of `Free` cells on it. Levels with none are absent.
    available: BTreeMap<u32, usize>,
    top_level: u32,
}

impl BuddyTree {
    /// A tree for an arena of `2^top_level` bytes, entirely free.
    pub fn new(top_level: u32) -> Result<Self> {
        if top_level > MAX_TOP_LEVEL {
            return Err(Error::precondition(format!(
                "top level {} exceeds the maximum of {}",
                top_level, MAX_TOP_LEVEL
            )));
        }

        let count = cell::cells_before_level(top_level) + cell::cells_in_level(top_level);
        let mut tree = Self {
            cells: SymbolArray::new(count),
            available: BTreeMap::new(),
            top_level,
        };
        tree.set(0, CellStatus::Free);
        tree.increase(0, 1);
        Ok(tree)
    }

    /// A tree covering the largest power of two that fits in `len` bytes.
    pub fn for_arena(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::precondition("arena must not be empty"));
        }
        Self::new(len.ilog2())
    }

    #[inline]
    pub fn top_level(&self) -> u32 {
        self.top_level
    }

    /// Bytes covered by the tree.
    #[inline]
    pub fn arena_len(&self) -> usize {
        1usize << self.top_level
    }

    /// Total number of cells, frontier or not.
    #[inline]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn status(&self, cell: usize) -> CellStatus {
        CellStatus::from_symbol(self.cells.get(cell))
    }

    /// Number of `Free` cells on `level`.
    pub fn free_cells(&self, level: u32) -> usize {
        self.available.get(&level).copied().unwrap_or(0)
    }

    /// True when the whole arena is one free block again.
    pub fn is_coalesced(&self) -> bool {
        self.status(0) == CellStatus::Free
            && self.available.len() == 1
            && self.free_cells(0) == 1
    }

    /// Carve a block of `2^log2_size` bytes and return its offset.
    pub fn allocate(&mut self, log2_size: u32) -> Result<usize> {
        if log2_size > self.top_level {
            return Err(Error::OutOfMemory { log2_size });
        }
        let target = self.top_level - log2_size;

        // Deepest level at or above the target that still has a free cell.
        let source = (0..=target)
            .rev()
            .find(|level| self.available.contains_key(level))
            .ok_or(Error::OutOfMemory { log2_size })?;

        let cell = self
            .partition(source, target)
            .ok_or(Error::OutOfMemory { log2_size })?;

        self.set(cell, CellStatus::Allocated);
        self.decrease(target, 1);
        Ok(cell::offset(cell, target, self.top_level))
    }

    /// Return the block starting at `offset` to the free pool, merging it
    /// with free buddies as far up as possible.
    pub fn deallocate(&mut self, offset: usize) -> Result<()> {
        for level in 0..=self.top_level {
            let Some(cell) = cell::at_offset(offset, level, self.top_level) else {
                continue;
            };
            if self.status(cell) == CellStatus::Allocated {
                self.set(cell, CellStatus::Free);
                self.increase(level, 1);
                self.merge(cell);
                return Ok(());
            }
        }
        Err(Error::InvalidFree { offset })
    }

    /// Walk the tree depth first from the root, splitting free cells on
    /// levels `source..target` until a free cell on `target` turns up.
    fn partition(&mut self, source: u32, target: u32) -> Option<usize> {
        let mut pending = vec![0usize];
        while let Some(current) = pending.pop() {
            let level = cell::level_of(current);
            let status = self.status(current);

            if level == target {
                if status == CellStatus::Free {
                    return Some(current);
                }
                continue;
            }

            let (left, right) = cell::children(current);
            match status {
                CellStatus::Free if level >= source => {
                    self.set(current, CellStatus::Nil);
                    self.set(left, CellStatus::Free);
                    self.set(right, CellStatus::Free);
                    self.decrease(level, 1);
                    self.increase(level + 1, 2);
                    pending.push(right);
                    pending.push(left);
                }
                CellStatus::Nil => {
                    pending.push(right);
                    pending.push(left);
                }
                _ => {}
            }
        }
        None
    }

    fn merge(&mut self, start: usize) {
        let mut current = start;
        while current != 0 {
            let sibling = cell::sibling(current);
            if self.status(current) != CellStatus::Free || self.status(sibling) != CellStatus::Free
            {
                return;
            }

            let level = cell::level_of(current);
            self.set(current, CellStatus::Nil);
            self.set(sibling, CellStatus::Nil);
            self.decrease(level, 2);

            current = cell::parent(current);
            self.set(current, CellStatus::Free);
            self.increase(level - 1, 1);
        }
    }

    #[inline]
    fn set(&mut self, cell: usize, status: CellStatus) {
        self.cells.set(cell, status as u64);
    }

    fn increase(&mut self, level: u32, count: usize) {
        *self.available.entry(level).or_insert(0) += count;
    }

    fn decrease(&mut self, level: u32, count: usize) {
        if let Some(free) = self.available.get_mut(&level) {
            *free -= count;
            if *free == 0 {
                self.available.remove(&level);
            }
        }
    }
}

impl std::fmt::Debug for BuddyTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuddyTree")
            .field("top_level", &self.top_level)
            .field("available", &self.available)
            .finish()
    }
}
