// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Controller Number Pools
//!
//! The three process-wide pools behind short mutexes. Transactions allocate
//! here eagerly so concurrent operations never hand out the same number; the
//! transaction returns its allocations if it is discarded.

use crate::domain::controller_config::NumberPoolsConfig;
use crate::domain::number_pool::{BitmapPool, PoolError, PoolKind};
use parking_lot::Mutex;
use tracing::trace;

pub struct NumberPools {
    tcp_ports: Mutex<BitmapPool>,
    minor_numbers: Mutex<BitmapPool>,
    shipping_ports: Mutex<BitmapPool>,
}

impl NumberPools {
    pub fn new(config: &NumberPoolsConfig) -> Self {
        Self {
            tcp_ports: Mutex::new(BitmapPool::new(PoolKind::TcpPort, config.tcp_ports)),
            minor_numbers: Mutex::new(BitmapPool::new(PoolKind::MinorNumber, config.minor_numbers)),
            shipping_ports: Mutex::new(BitmapPool::new(
                PoolKind::ShippingPort,
                config.shipping_ports,
            )),
        }
    }

    fn pool(&self, kind: PoolKind) -> &Mutex<BitmapPool> {
        match kind {
            PoolKind::TcpPort => &self.tcp_ports,
            PoolKind::MinorNumber => &self.minor_numbers,
            PoolKind::ShippingPort => &self.shipping_ports,
        }
    }

    pub fn allocate(&self, kind: PoolKind) -> Result<u32, PoolError> {
        let value = self.pool(kind).lock().allocate()?;
        trace!(pool = %kind, value, "allocated");
        Ok(value)
    }

    pub fn allocate_specific(&self, kind: PoolKind, value: u32) -> Result<(), PoolError> {
        self.pool(kind).lock().allocate_specific(value)?;
        trace!(pool = %kind, value, "allocated specific");
        Ok(())
    }

    pub fn deallocate(&self, kind: PoolKind, value: u32) -> Result<(), PoolError> {
        self.pool(kind).lock().deallocate(value)?;
        trace!(pool = %kind, value, "released");
        Ok(())
    }

    pub fn is_allocated(&self, kind: PoolKind, value: u32) -> bool {
        self.pool(kind).lock().is_allocated(value)
    }

    pub fn allocated_count(&self, kind: PoolKind) -> usize {
        self.pool(kind).lock().allocated_count()
    }
}

impl Default for NumberPools {
    fn default() -> Self {
        Self::new(&NumberPoolsConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pools_are_independent() {
        let pools = NumberPools::default();
        let port = pools.allocate(PoolKind::TcpPort).unwrap();
        let minor = pools.allocate(PoolKind::MinorNumber).unwrap();
        assert_eq!(port, 7000);
        assert_eq!(minor, 1000);
        assert!(pools.is_allocated(PoolKind::TcpPort, 7000));
        assert!(!pools.is_allocated(PoolKind::ShippingPort, 7000));
        pools.deallocate(PoolKind::TcpPort, port).unwrap();
        assert_eq!(pools.allocated_count(PoolKind::TcpPort), 0);
    }
}
