//! # Physical memory resources
//!
//! A physical memory resource ([`Pmr`]) is a reference counted handle over
//! one unit of physical memory that is allocated, pinned, mapped, exported
//! and freed as a whole. The engine knows nothing about virtual memory; it
//! tracks who holds the memory and when it may go.
//!
//! ## Pieces
//!
//! * [`MappingTable`]: logical to physical chunk translation, dense or
//!   sparse.
//! * [`PmrCounters`]: references and physical-address locks; every lock is
//!   also a reference.
//! * [`Pmr`]: the resource, with its capability set ([`FactoryOps`]) supplied
//!   by the memory backend that created it.
//! * [`PmrDevice`] and the zombie queue: resources the device may still cache
//!   translations of are parked after their last reference is gone and freed
//!   by [`ZombieCleanupItem::run`] once the device has confirmed the cache
//!   invalidation.
//! * [`DeviceImport`]: other devices mapping a resource hold back its
//!   destruction until their caches are clean too.
//! * [`ExportToken`], [`LocalImportHandle`], [`SecureExchange`]: handing
//!   references to others.
//! * Byte access, kernel mappings, page lists.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use kernel_pmr::*;
//!
//! struct Ram;
//!
//! impl PhysBacking for Ram {
//!     fn dev_phys_addr(
//!         &self,
//!         query: &DevPhysQuery<'_>,
//!         out: &mut [Option<DevPhysAddr>],
//!     ) -> Result<(), PmrError> {
//!         for (slot, offset) in out.iter_mut().zip(query.phys_offsets) {
//!             *slot = offset.map(|o| DevPhysAddr::new(0x8000_0000 + o));
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let ctx = PmrContext::new(PmrConfig::DEFAULT, 42);
//! let device = PmrDevice::new(0, "gpu0", PmrConfig::DEFAULT).unwrap();
//! let heap = Arc::new(PhysHeap::new("local", device));
//! let ops = FactoryOps::builder(PmrKind::Other, Arc::new(Ram)).build();
//!
//! let pmr = Pmr::create(&ctx, &heap, ops, &PmrCreateInfo::dense(0x4000, 12, PmrFlags::read_write()))
//!     .unwrap();
//! let addrs = pmr.dev_phys_addr(12, 2, 0).unwrap();
//! assert_eq!(addrs[1], Some(DevPhysAddr::new(0x8000_1000)));
//!
//! pmr.unref_and_maybe_destroy(1).unwrap();
//! assert!(ctx.deinit().is_ok());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod addresses;
mod bytes;
mod config;
mod context;
mod device;
mod error;
mod export;
mod factory;
mod flags;
mod heap;
mod import;
mod mapping_table;
mod page_list;
mod physical;
mod refcount;
mod resource;
mod zombie;

pub use addresses::{CpuPhysAddr, DevPhysAddr};
pub use config::{MAX_DEVICES, NESTED_RESOURCE_LOCK, PmrConfig};
pub use context::{Identity, PmrContext};
pub use device::{PmrDevice, PowerState, has_counter_advanced};
pub use error::PmrError;
pub use export::{ExportToken, LocalImportHandle, SecureExchange};
pub use factory::{
    ByteAccess, DevPhysQuery, FactoryLock, FactoryOps, FactoryOpsBuilder, IpaPolicy, KernelMap,
    KernelMapping, PhysBacking, PhysLock, PmrKind, SparseChange, SparseLayout, ZombiePages,
};
pub use flags::{CacheMode, InternalFlags, PhysAddrUsage, PmrFlags, SparseResize};
pub use heap::{IpaConfig, PhysHeap};
pub use import::DeviceImport;
pub use mapping_table::{MappingTable, Translation};
pub use page_list::{PAGE_LIST_WORD_SIZE, PageList};
pub use physical::MappedRange;
pub use refcount::{MapCount, PmrCounters};
pub use resource::{GpuMappingId, Lifecycle, Pmr, PmrCreateInfo, PmrGuard, RefOutcome};
pub use zombie::{CleanupOutcome, ZombieCleanupItem};
