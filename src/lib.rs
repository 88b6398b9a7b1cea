//! A storage engine for packing Wii optical disc images into a WBFS
//! container and extracting them back out.
//!
//! The four pieces match the ones a WBFS implementation is built from:
//! a [`block_io::BlockDevice`] contract, a [`split::SplitBackend`] that
//! implements it across up to ten files, a [`wii`] module that walks a
//! disc's encrypted filesystem to find which sectors actually hold data,
//! and [`container::Wbfs`], which ties the three together into add/remove
//! /extract/trim operations over a container.

pub mod block_io;
pub mod container;
pub mod error;
pub mod options;
pub mod scrub;
pub mod split;
pub mod wii;

pub use block_io::{BlockDevice, RawHandle, HD_SECTOR_SIZE};
pub use container::{FreeSpaceReport, Wbfs};
pub use error::{Result, WbfsError};
pub use options::{ScrubGranularity, WbfsOptions};
pub use split::SplitBackend;
pub use wii::{DiscHeader, PartitionSelector};
