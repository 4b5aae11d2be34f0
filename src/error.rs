//! The fatal preconditions of an upgrade.
//!
//! Every variant here is checked before anything destructive happens to the flash. None of them
//! are retried.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The `/proc/mtd` fingerprint is not the one we know the offsets for
    #[error("Unsupported NAND partitions (fingerprint {actual}, expected {expected})")]
    UnsupportedLayout {
        expected: &'static str,
        actual: String,
    },

    /// The hardware revision is unknown, or not supported by this firmware
    #[error("Unsupported hardware revision: {0}")]
    UnsupportedHardware(String),

    /// `image_flag` is neither `0` nor `1`
    #[error("Unsupported image flag: '{0}'")]
    UnsupportedImageFlag(String),

    /// A line of `/proc/mtd` could not be parsed
    #[error("Malformed /proc/mtd line: {0:?}")]
    MalformedMtdTable(String),

    /// An MTD index referenced by the offset table is missing from `/proc/mtd`
    #[error("MTD device mtd{0} does not exist")]
    MissingPartition(u32),

    /// A region does not fit inside its MTD device, or is not erase-block aligned
    #[error("Region {region} ({offset:#x}+{len:#x}) does not fit mtd{mtd}")]
    RegionOutOfBounds {
        region: &'static str,
        mtd: u32,
        offset: u64,
        len: u64,
    },

    /// An external flashing tool exited unsuccessfully
    #[error("{tool} failed with {status}")]
    ToolFailed {
        tool: String,
        status: std::process::ExitStatus,
    },
}
