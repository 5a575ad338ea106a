// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Number Pools
//!
//! Fixed-range integer allocators backing TCP ports, DRBD minor numbers and
//! snapshot shipping ports. Exhaustion is an ordinary result, never a wrap
//! around into numbers that are still in use.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    TcpPort,
    MinorNumber,
    ShippingPort,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PoolKind::TcpPort => "TCP port",
            PoolKind::MinorNumber => "minor number",
            PoolKind::ShippingPort => "shipping port",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("{kind} pool is exhausted")]
    Exhausted { kind: PoolKind },

    #[error("{kind} {value} is outside the range {min}-{max}")]
    OutOfRange {
        kind: PoolKind,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("{kind} {value} is already allocated")]
    AlreadyAllocated { kind: PoolKind, value: u32 },

    #[error("{kind} {value} is not allocated")]
    NotAllocated { kind: PoolKind, value: u32 },
}

/// Inclusive numeric range of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRange {
    pub min: u32,
    pub max: u32,
}

impl PoolRange {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: u32) -> bool {
        (self.min..=self.max).contains(&value)
    }

    pub fn size(&self) -> usize {
        if self.max < self.min {
            0
        } else {
            (self.max - self.min) as usize + 1
        }
    }
}

/// Bitmap allocator over a [`PoolRange`]
#[derive(Debug, Clone)]
pub struct BitmapPool {
    kind: PoolKind,
    range: PoolRange,
    words: Vec<u64>,
    allocated: usize,
    cursor: usize,
}

impl BitmapPool {
    pub fn new(kind: PoolKind, range: PoolRange) -> Self {
        let size = range.size();
        Self {
            kind,
            range,
            words: vec![0; size.div_ceil(64)],
            allocated: 0,
            cursor: 0,
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn range(&self) -> PoolRange {
        self.range
    }

    fn index(&self, value: u32) -> Result<usize, PoolError> {
        if !self.range.contains(value) {
            return Err(PoolError::OutOfRange {
                kind: self.kind,
                value,
                min: self.range.min,
                max: self.range.max,
            });
        }
        Ok((value - self.range.min) as usize)
    }

    fn bit(&self, idx: usize) -> bool {
        self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set_bit(&mut self, idx: usize, on: bool) {
        if on {
            self.words[idx / 64] |= 1 << (idx % 64);
        } else {
            self.words[idx / 64] &= !(1 << (idx % 64));
        }
    }

    /// Allocates the next free number after the last allocation
    pub fn allocate(&mut self) -> Result<u32, PoolError> {
        let size = self.range.size();
        if self.allocated >= size {
            return Err(PoolError::Exhausted { kind: self.kind });
        }
        for offset in 0..size {
            let idx = (self.cursor + offset) % size;
            if !self.bit(idx) {
                self.set_bit(idx, true);
                self.allocated += 1;
                self.cursor = (idx + 1) % size;
                return Ok(self.range.min + idx as u32);
            }
        }
        Err(PoolError::Exhausted { kind: self.kind })
    }

    pub fn allocate_specific(&mut self, value: u32) -> Result<(), PoolError> {
        let idx = self.index(value)?;
        if self.bit(idx) {
            return Err(PoolError::AlreadyAllocated {
                kind: self.kind,
                value,
            });
        }
        self.set_bit(idx, true);
        self.allocated += 1;
        Ok(())
    }

    pub fn deallocate(&mut self, value: u32) -> Result<(), PoolError> {
        let idx = self.index(value)?;
        if !self.bit(idx) {
            return Err(PoolError::NotAllocated {
                kind: self.kind,
                value,
            });
        }
        self.set_bit(idx, false);
        self.allocated -= 1;
        Ok(())
    }

    pub fn is_allocated(&self, value: u32) -> bool {
        self.index(value).map(|idx| self.bit(idx)).unwrap_or(false)
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated
    }

    pub fn free_count(&self) -> usize {
        self.range.size() - self.allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(min: u32, max: u32) -> BitmapPool {
        BitmapPool::new(PoolKind::TcpPort, PoolRange::new(min, max))
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let mut pool = pool(7000, 7002);
        assert_eq!(pool.allocate().unwrap(), 7000);
        assert_eq!(pool.allocate().unwrap(), 7001);
        assert_eq!(pool.allocate().unwrap(), 7002);
        assert_eq!(
            pool.allocate(),
            Err(PoolError::Exhausted {
                kind: PoolKind::TcpPort
            })
        );
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_cursor_skips_recently_released() {
        let mut pool = pool(1, 3);
        let a = pool.allocate().unwrap();
        pool.deallocate(a).unwrap();
        assert_eq!(pool.allocate().unwrap(), 2);
        assert_eq!(pool.allocate().unwrap(), 3);
        assert_eq!(pool.allocate().unwrap(), 1);
    }

    #[test]
    fn test_specific_and_double_release() {
        let mut pool = pool(100, 200);
        pool.allocate_specific(150).unwrap();
        assert!(pool.is_allocated(150));
        assert!(matches!(
            pool.allocate_specific(150),
            Err(PoolError::AlreadyAllocated { value: 150, .. })
        ));
        assert!(matches!(
            pool.allocate_specific(99),
            Err(PoolError::OutOfRange { .. })
        ));
        pool.deallocate(150).unwrap();
        assert!(matches!(
            pool.deallocate(150),
            Err(PoolError::NotAllocated { value: 150, .. })
        ));
        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn test_range_spanning_words() {
        let mut pool = pool(0, 129);
        for _ in 0..130 {
            pool.allocate().unwrap();
        }
        assert!(pool.allocate().is_err());
        pool.deallocate(128).unwrap();
        assert_eq!(pool.allocate().unwrap(), 128);
    }
}
