//! The NAND partition table, as the kernel reports it in `/proc/mtd`.

use std::path::PathBuf;
use std::str::FromStr;

use md5::{Digest, Md5};

use crate::error::UpgradeError;

pub mod offsets;

/// MD5 of the only `/proc/mtd` listing whose offsets this tool knows about.
pub const EXPECTED_MTD_FINGERPRINT: &str = "073658d6b343619e728f028b8084c056";

/// One row of `/proc/mtd`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtdPartition {
    pub index: u32,
    pub size: u64,
    pub erase_size: u64,
    pub name: String,
}

impl MtdPartition {
    /// The character device for this partition (e.g. "/dev/mtd2")
    pub fn dev_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/mtd{}", self.index))
    }

    /// Ensure `extent` lies inside this partition and starts on an erase block boundary
    pub fn check_extent(&self, region: &'static str, extent: &Extent) -> Result<(), UpgradeError> {
        let fits = extent
            .offset
            .checked_add(extent.len)
            .is_some_and(|end| end <= self.size);
        if !fits || extent.offset % self.erase_size != 0 {
            return Err(UpgradeError::RegionOutOfBounds {
                region,
                mtd: self.index,
                offset: extent.offset,
                len: extent.len,
            });
        }
        Ok(())
    }

    /// How many erase blocks are needed to cover `len` bytes
    pub fn blocks_for(&self, len: u64) -> u64 {
        len.div_ceil(self.erase_size)
    }
}

/// Parse lines like `mtd0: 00400000 00020000 "boot"`
impl FromStr for MtdPartition {
    type Err = UpgradeError;

    fn from_str(line: &str) -> Result<Self, UpgradeError> {
        let malformed = || UpgradeError::MalformedMtdTable(line.to_owned());

        let (dev, rest) = line.split_once(':').ok_or_else(malformed)?;
        let index = dev
            .strip_prefix("mtd")
            .and_then(|n| n.parse().ok())
            .ok_or_else(malformed)?;

        let mut fields = rest.trim().splitn(3, char::is_whitespace);
        let mut hex_field = || {
            fields
                .next()
                .and_then(|f| u64::from_str_radix(f, 16).ok())
                .ok_or_else(malformed)
        };
        let size = hex_field()?;
        let erase_size = hex_field()?;
        if erase_size == 0 {
            return Err(malformed());
        }

        let name = fields
            .next()
            .map(str::trim)
            .and_then(|n| n.strip_prefix('"'))
            .and_then(|n| n.strip_suffix('"'))
            .ok_or_else(malformed)?
            .to_owned();

        Ok(MtdPartition {
            index,
            size,
            erase_size,
            name,
        })
    }
}

/// The whole partition table
#[derive(Debug, Clone, Default)]
pub struct MtdTable {
    partitions: Vec<MtdPartition>,
}

impl MtdTable {
    /// Parse the text of `/proc/mtd`, skipping its header line
    pub fn parse(listing: &str) -> Result<Self, UpgradeError> {
        let partitions = listing
            .lines()
            .filter(|line| !line.trim().is_empty() && !line.starts_with("dev:"))
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { partitions })
    }

    /// Look up a partition by its MTD index
    pub fn get(&self, index: u32) -> Result<&MtdPartition, UpgradeError> {
        self.partitions
            .iter()
            .find(|p| p.index == index)
            .ok_or(UpgradeError::MissingPartition(index))
    }

    /// Look up a partition by name
    pub fn find_named(&self, name: &str) -> Option<&MtdPartition> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MtdPartition> {
        self.partitions.iter()
    }
}

/// A byte range inside one MTD device
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Extent {
    pub mtd: u32,
    pub offset: u64,
    pub len: u64,
}

impl Extent {
    pub fn overlaps(&self, other: &Extent) -> bool {
        self.mtd == other.mtd
            && self.offset < other.offset + other.len
            && other.offset < self.offset + self.len
    }
}

/// Hex MD5 of the raw partition listing, the same thing `md5sum /proc/mtd` prints.
pub fn fingerprint(listing: &str) -> String {
    let digest = Md5::digest(listing.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Refuse to go any further unless the partition layout is the one we know.
pub fn verify_layout(listing: &str) -> Result<(), UpgradeError> {
    let actual = fingerprint(listing);
    if actual != EXPECTED_MTD_FINGERPRINT {
        return Err(UpgradeError::UnsupportedLayout {
            expected: EXPECTED_MTD_FINGERPRINT,
            actual,
        });
    }
    Ok(())
}

/// The `/proc/mtd` of a correctly partitioned board.
#[cfg(test)]
pub const TEST_PROC_MTD: &str = "\
dev:    size   erasesize  name
mtd0: 00400000 00020000 \"boot\"
mtd1: 01c00000 00020000 \"upgrade\"
mtd2: 0e000000 00020000 \"firmware\"
";

#[test]
fn test_fingerprint() {
    assert_eq!(fingerprint(""), "d41d8cd98f00b204e9800998ecf8427e");
    assert_eq!(fingerprint(TEST_PROC_MTD), EXPECTED_MTD_FINGERPRINT);
}

#[test]
fn test_verify_layout() {
    assert!(verify_layout(TEST_PROC_MTD).is_ok());

    let resized = TEST_PROC_MTD.replace("0e000000", "0c000000");
    assert!(matches!(
        verify_layout(&resized),
        Err(UpgradeError::UnsupportedLayout { .. })
    ));

    // Even whitespace matters
    let trailing = format!("{TEST_PROC_MTD}\n");
    assert!(verify_layout(&trailing).is_err());
}

#[test]
fn test_parse_mtd_table() {
    let table = MtdTable::parse(TEST_PROC_MTD).unwrap();
    assert_eq!(table.iter().count(), 3);

    let firmware = table.get(2).unwrap();
    assert_eq!(firmware.name, "firmware");
    assert_eq!(firmware.size, 0x0e000000);
    assert_eq!(firmware.erase_size, 0x20000);
    assert_eq!(firmware.dev_path(), PathBuf::from("/dev/mtd2"));

    assert_eq!(table.find_named("upgrade").map(|p| p.index), Some(1));
    assert!(table.find_named("rootfs").is_none());
    assert!(matches!(
        table.get(7),
        Err(UpgradeError::MissingPartition(7))
    ));
}

#[test]
fn test_parse_malformed_line() {
    for line in [
        "mtd0 00400000 00020000 \"boot\"",
        "mtdX: 00400000 00020000 \"boot\"",
        "mtd0: 0040000g 00020000 \"boot\"",
        "mtd0: 00400000 00000000 \"boot\"",
        "mtd0: 00400000 00020000 boot",
    ] {
        assert!(
            matches!(
                line.parse::<MtdPartition>(),
                Err(UpgradeError::MalformedMtdTable(_))
            ),
            "{line}"
        );
    }
}

#[test]
fn test_check_extent() {
    let table = MtdTable::parse(TEST_PROC_MTD).unwrap();
    let boot = table.get(0).unwrap();

    let inside = Extent {
        mtd: 0,
        offset: 0x200000,
        len: 0x200000,
    };
    assert!(boot.check_extent("bitstream", &inside).is_ok());

    let past_end = Extent { len: 0x200001, ..inside };
    assert!(boot.check_extent("bitstream", &past_end).is_err());

    let unaligned = Extent {
        offset: 0x200100,
        len: 0x100,
        ..inside
    };
    assert!(boot.check_extent("bitstream", &unaligned).is_err());

    assert_eq!(boot.blocks_for(0x400000), 32);
    assert_eq!(boot.blocks_for(0x20001), 2);
}

#[test]
fn test_extent_overlap() {
    let a = Extent {
        mtd: 2,
        offset: 0x1000,
        len: 0x1000,
    };
    assert!(a.overlaps(&Extent { offset: 0x1fff, ..a }));
    assert!(!a.overlaps(&Extent { offset: 0x2000, ..a }));
    assert!(!a.overlaps(&Extent { mtd: 1, ..a }));
}
