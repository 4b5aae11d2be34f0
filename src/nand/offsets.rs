//! The A/B offset tables.
//!
//! The bootloader's `image_flag` names the slot that currently boots. Each flag value has its own
//! fixed table saying where the staged image lives (source) and where it must be copied to
//! (destination). The destination of one table is the bootable slot of the other, so an upgrade
//! that dies halfway leaves the running image untouched.

use std::fmt;
use std::str::FromStr;

use super::Extent;
use crate::error::UpgradeError;

pub const SPL_OFF: u64 = 0x0000000;
pub const UBOOT_OFF: u64 = 0x0080000;
pub const UBOOT_ENV1_OFF: u64 = 0x01C0000;
pub const UBOOT_ENV2_OFF: u64 = 0x01E0000;
pub const BITSTREAM_OFF: u64 = 0x0200000;

// Placeholders; nothing is known to read these.
pub const SPL_MTD: u32 = 0;
pub const UBOOT_MTD: u32 = 0;
pub const BITSTREAM_MTD: u32 = 0;

/// Room reserved for the bitstream, up to the end of the boot partition
pub const BITSTREAM_MAX_SIZE: u64 = 0x0200000;

/// Every slot region (kernel, stage2, stage3) is the same size
pub const SLOT_REGION_SIZE: u64 = 0x0400000;

/// The staged image is always read from the "upgrade" partition...
pub const SRC_STAGE_MTD: u32 = 1;
pub const STAGING_PARTITION: &str = "upgrade";
/// ...and written into the "firmware" partition.
pub const DST_STAGE_MTD: u32 = 2;

/// The persisted A/B slot indicator
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ImageFlag {
    Zero,
    One,
}

impl ImageFlag {
    /// The flag value that boots the slot this flag's table writes to
    pub fn other(self) -> Self {
        match self {
            ImageFlag::Zero => ImageFlag::One,
            ImageFlag::One => ImageFlag::Zero,
        }
    }
}

impl FromStr for ImageFlag {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self, UpgradeError> {
        match s.trim() {
            "0" => Ok(ImageFlag::Zero),
            "1" => Ok(ImageFlag::One),
            _ => Err(UpgradeError::UnsupportedImageFlag(s.to_owned())),
        }
    }
}

impl fmt::Display for ImageFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFlag::Zero => f.write_str("0"),
            ImageFlag::One => f.write_str("1"),
        }
    }
}

/// A region that gets copied from the staging area into the inactive slot
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlotRegion {
    pub name: &'static str,
    pub src_off: u64,
    pub dst_off: u64,
    pub src_mtd: u32,
    pub dst_mtd: u32,
    pub size: u64,
}

impl SlotRegion {
    const fn new(name: &'static str, src_off: u64, dst_off: u64) -> Self {
        Self {
            name,
            src_off,
            dst_off,
            src_mtd: SRC_STAGE_MTD,
            dst_mtd: DST_STAGE_MTD,
            size: SLOT_REGION_SIZE,
        }
    }

    pub fn source(&self) -> Extent {
        Extent {
            mtd: self.src_mtd,
            offset: self.src_off,
            len: self.size,
        }
    }

    pub fn destination(&self) -> Extent {
        Extent {
            mtd: self.dst_mtd,
            offset: self.dst_off,
            len: self.size,
        }
    }
}

/// A fixed region of the boot partition; these do not move between slots
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BootRegion {
    pub name: &'static str,
    pub offset: u64,
    pub mtd: u32,
}

pub const BOOT_REGIONS: [BootRegion; 5] = [
    BootRegion {
        name: "spl",
        offset: SPL_OFF,
        mtd: SPL_MTD,
    },
    BootRegion {
        name: "u-boot",
        offset: UBOOT_OFF,
        mtd: UBOOT_MTD,
    },
    BootRegion {
        name: "u-boot-env1",
        offset: UBOOT_ENV1_OFF,
        mtd: UBOOT_MTD,
    },
    BootRegion {
        name: "u-boot-env2",
        offset: UBOOT_ENV2_OFF,
        mtd: UBOOT_MTD,
    },
    BootRegion {
        name: "bitstream",
        offset: BITSTREAM_OFF,
        mtd: BITSTREAM_MTD,
    },
];

/// The complete set of offsets for one value of the image flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetTable {
    pub flag: ImageFlag,
    pub kernel: SlotRegion,
    pub stage2: SlotRegion,
    pub stage3: SlotRegion,
}

const TABLE_FLAG_0: OffsetTable = OffsetTable {
    flag: ImageFlag::Zero,
    kernel: SlotRegion::new("kernel", 0x0840000, 0x7D00000),
    stage2: SlotRegion::new("stage2", 0x0C40000, 0x8100000),
    stage3: SlotRegion::new("stage3", 0x1040000, 0x8500000),
};

const TABLE_FLAG_1: OffsetTable = OffsetTable {
    flag: ImageFlag::One,
    kernel: SlotRegion::new("kernel", 0x0680000, 0x1E00000),
    stage2: SlotRegion::new("stage2", 0x0A80000, 0x2200000),
    stage3: SlotRegion::new("stage3", 0x0E80000, 0x2600000),
};

impl OffsetTable {
    pub fn for_flag(flag: ImageFlag) -> Self {
        match flag {
            ImageFlag::Zero => TABLE_FLAG_0,
            ImageFlag::One => TABLE_FLAG_1,
        }
    }

    pub fn slot_regions(&self) -> [SlotRegion; 3] {
        [self.kernel, self.stage2, self.stage3]
    }

    pub fn boot_region(&self, name: &str) -> Option<BootRegion> {
        BOOT_REGIONS.iter().copied().find(|r| r.name == name)
    }

    /// Ensure a copy driven by this table can never clobber its own input, the image that is
    /// currently bootable, or the staging area the other slot's table reads from.
    pub fn check_disjoint(&self) -> anyhow::Result<()> {
        let running = OffsetTable::for_flag(self.flag.other());
        for dst in self.slot_regions() {
            for other in self.slot_regions() {
                anyhow::ensure!(
                    !dst.destination().overlaps(&other.source()),
                    "{} destination overlaps {} source",
                    dst.name,
                    other.name
                );
            }
            for live in running.slot_regions() {
                anyhow::ensure!(
                    !dst.destination().overlaps(&live.destination()),
                    "{} destination overlaps the bootable {}",
                    dst.name,
                    live.name
                );
                anyhow::ensure!(
                    !dst.destination().overlaps(&live.source()),
                    "{} destination overlaps the other slot's staged {}",
                    dst.name,
                    live.name
                );
            }
        }
        Ok(())
    }
}

impl fmt::Display for OffsetTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "image_flag={}", self.flag)?;
        for region in BOOT_REGIONS {
            let name = region.name.to_uppercase().replace('-', "_");
            writeln!(f, "{name}_OFF={:#09x} (mtd{})", region.offset, region.mtd)?;
        }
        for region in self.slot_regions() {
            let name = region.name.to_uppercase();
            writeln!(
                f,
                "SRC_{name}_OFF={:#09x} (mtd{}) DST_{name}_OFF={:#09x} (mtd{})",
                region.src_off, region.src_mtd, region.dst_off, region.dst_mtd
            )?;
        }
        Ok(())
    }
}

#[test]
fn test_parse_image_flag() {
    assert_eq!("0".parse::<ImageFlag>().unwrap(), ImageFlag::Zero);
    assert_eq!("1\n".parse::<ImageFlag>().unwrap(), ImageFlag::One);

    for bad in ["", "2", "01", "yes", "-1", "0x1"] {
        let err = bad.parse::<ImageFlag>().unwrap_err();
        assert!(matches!(err, UpgradeError::UnsupportedImageFlag(_)));
        assert!(err.to_string().starts_with("Unsupported image flag"));
    }
}

#[test]
fn test_table_flag_0() {
    let table = OffsetTable::for_flag(ImageFlag::Zero);
    assert_eq!(table.kernel.src_off, 0x0840000);
    assert_eq!(table.kernel.dst_off, 0x7D00000);
    assert_eq!(table.stage2.src_off, 0x0C40000);
    assert_eq!(table.stage2.dst_off, 0x8100000);
    assert_eq!(table.stage3.src_off, 0x1040000);
    assert_eq!(table.stage3.dst_off, 0x8500000);
    for region in table.slot_regions() {
        assert_eq!(region.src_mtd, 1);
        assert_eq!(region.dst_mtd, 2);
    }
}

#[test]
fn test_table_flag_1() {
    let table = OffsetTable::for_flag(ImageFlag::One);
    assert_eq!(table.kernel.src_off, 0x0680000);
    assert_eq!(table.kernel.dst_off, 0x1E00000);
    assert_eq!(table.stage2.src_off, 0x0A80000);
    assert_eq!(table.stage2.dst_off, 0x2200000);
    assert_eq!(table.stage3.src_off, 0x0E80000);
    assert_eq!(table.stage3.dst_off, 0x2600000);
}

#[test]
fn test_tables_are_disjoint() {
    OffsetTable::for_flag(ImageFlag::Zero).check_disjoint().unwrap();
    OffsetTable::for_flag(ImageFlag::One).check_disjoint().unwrap();

    let mut clobbering = OffsetTable::for_flag(ImageFlag::Zero);
    clobbering.stage3.dst_off = 0x1E00000;
    assert!(clobbering.check_disjoint().is_err());

    // Clear of its own staged regions, but inside the flag 1 staged kernel
    let mut into_staging = OffsetTable::for_flag(ImageFlag::Zero);
    into_staging.stage3.size = 0x100000;
    into_staging.stage3.dst_mtd = SRC_STAGE_MTD;
    into_staging.stage3.dst_off = 0x0680000;
    let err = into_staging.check_disjoint().unwrap_err();
    assert_eq!(
        err.to_string(),
        "stage3 destination overlaps the other slot's staged kernel"
    );
}

#[test]
fn test_boot_regions_shared() {
    let a = OffsetTable::for_flag(ImageFlag::Zero);
    let b = OffsetTable::for_flag(ImageFlag::One);
    assert_eq!(a.boot_region("bitstream"), b.boot_region("bitstream"));
    assert_eq!(a.boot_region("u-boot").map(|r| r.offset), Some(UBOOT_OFF));
    assert!(a.boot_region("kernel").is_none());
}

#[test]
fn test_display_table() {
    let text = OffsetTable::for_flag(ImageFlag::One).to_string();
    assert!(text.contains("image_flag=1"));
    assert!(text.contains("SRC_KERNEL_OFF=0x0680000 (mtd1) DST_KERNEL_OFF=0x1e00000 (mtd2)"));
    assert!(text.contains("U_BOOT_ENV2_OFF=0x01e0000 (mtd0)"));
}
