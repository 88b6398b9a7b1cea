use crate::wii::PartitionSelector;

/// Granularity at which a scrub or extract decides a region is "live".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrubGranularity {
    /// One bit per 32 KiB Wii sector.
    WiiSector,
    /// One bit per WBFS block (the container's allocation unit).
    WbfsBlock,
}

/// Replaces the original tool's global `OPT_*` variables with an explicit,
/// passed-through record (see the Design Notes on threading options rather
/// than relying on process-wide mutable state).
#[derive(Debug, Clone)]
pub struct WbfsOptions {
    /// Which partitions to preserve when walking a source disc.
    pub selector: PartitionSelector,
    /// Copy every Wii sector up to the disc's physical end verbatim,
    /// instead of delegating to the partition walker.
    pub copy_1_1: bool,
    /// Trim container/output size down to the last used block.
    pub trim: bool,
    /// Granularity used by `scrub`/`iso_info`.
    pub scrub_granularity: ScrubGranularity,
    /// Also punch holes for groups whose payload is bitwise zero.
    pub zero_sparse: bool,
    /// Allow overwriting an existing destination file.
    pub overwrite: bool,
    /// Skip geometry/integrity validation on open.
    pub force: bool,
    /// Split size in bytes used when creating a new split-file backend.
    pub split_size: u64,
}

impl Default for WbfsOptions {
    fn default() -> Self {
        WbfsOptions {
            selector: PartitionSelector::AllPartitions,
            copy_1_1: false,
            trim: false,
            scrub_granularity: ScrubGranularity::WbfsBlock,
            zero_sparse: false,
            overwrite: false,
            force: false,
            split_size: crate::split::SPLIT_SIZE_4G,
        }
    }
}
