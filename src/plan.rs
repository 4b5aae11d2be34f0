//! Turn an offset table into the ordered list of flash operations that performs the upgrade.

use std::fmt;
use std::path::Path;

use anyhow::Context;

use crate::config::UpgradeOptions;
use crate::nand::offsets::{OffsetTable, BITSTREAM_MAX_SIZE, STAGING_PARTITION};
use crate::nand::{Extent, MtdTable};
use crate::tools::{file_size, flash_eraseall, FlashOp};

/// One labelled step of the upgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub desc: String,
    pub op: FlashOp,
}

/// The complete, bounds-checked list of operations for one upgrade
#[derive(Debug, Clone)]
pub struct UpgradePlan {
    pub steps: Vec<Step>,
}

impl UpgradePlan {
    /// Build the plan for `table`.
    ///
    /// Every region is checked against the partition table before anything is returned, so a plan
    /// that exists is a plan that fits the device.
    pub fn build(
        table: &OffsetTable,
        mtds: &MtdTable,
        options: &UpgradeOptions,
    ) -> anyhow::Result<Self> {
        table.check_disjoint()?;

        let mut steps = Vec::new();
        let mut push = |desc: String, op: FlashOp| steps.push(Step { desc, op });

        for region in table.slot_regions() {
            let src_mtd = mtds.get(region.src_mtd)?;
            let dst_mtd = mtds.get(region.dst_mtd)?;
            src_mtd.check_extent(region.name, &region.source())?;
            dst_mtd.check_extent(region.name, &region.destination())?;

            let file = options.work_dir.join(format!("{}.bin", region.name));
            push(
                format!("Erasing {} slot", region.name),
                FlashOp::Erase {
                    dev: dst_mtd.dev_path(),
                    start: region.dst_off,
                    count: dst_mtd.blocks_for(region.size),
                },
            );
            push(
                format!("Reading staged {}", region.name),
                FlashOp::Dump {
                    dev: src_mtd.dev_path(),
                    offset: region.src_off,
                    len: region.size,
                    file: file.clone(),
                },
            );
            push(
                format!("Writing {}", region.name),
                FlashOp::Write {
                    dev: dst_mtd.dev_path(),
                    offset: region.dst_off,
                    file,
                },
            );
        }

        if let Some(bitstream) = &options.bitstream {
            let (erase, write) = bitstream_ops(table, mtds, bitstream)?;
            push("Erasing bitstream".into(), erase);
            push("Writing bitstream".into(), write);
        }

        push(
            "Switching image slot".into(),
            FlashOp::SetEnv {
                name: "image_flag".into(),
                value: table.flag.other().to_string(),
            },
        );

        if options.purge_staging {
            let staging = mtds
                .find_named(STAGING_PARTITION)
                .with_context(|| format!("no \"{STAGING_PARTITION}\" partition to purge"))?;
            // Whatever is erased must be where the image was staged, never a slot
            for region in table.slot_regions() {
                anyhow::ensure!(
                    staging.index == region.src_mtd,
                    "{} was staged on mtd{}, not the \"{}\" partition (mtd{})",
                    region.name,
                    region.src_mtd,
                    staging.name,
                    staging.index
                );
            }
            push(
                format!("Purging {} partition", staging.name),
                flash_eraseall(staging),
            );
        }

        Ok(Self { steps })
    }

    /// The work files the dump steps leave behind
    pub fn scratch_files(&self) -> impl Iterator<Item = &Path> {
        self.steps.iter().filter_map(|step| match &step.op {
            FlashOp::Dump { file, .. } => Some(file.as_path()),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Erase and write operations for the FPGA bitstream, sized from the file itself
fn bitstream_ops(
    table: &OffsetTable,
    mtds: &MtdTable,
    bitstream: &Path,
) -> anyhow::Result<(FlashOp, FlashOp)> {
    let region = table
        .boot_region("bitstream")
        .context("no bitstream region")?;
    let mtd = mtds.get(region.mtd)?;

    let size = file_size(bitstream)
        .with_context(|| format!("could not stat {}", bitstream.display()))?;
    let len = u64::from_str_radix(size.trim_start_matches("0x"), 16)?;
    anyhow::ensure!(len > 0, "bitstream {} is empty", bitstream.display());
    anyhow::ensure!(
        len <= BITSTREAM_MAX_SIZE,
        "bitstream is {size} bytes, only {BITSTREAM_MAX_SIZE:#x} fit"
    );

    let extent = Extent {
        mtd: region.mtd,
        offset: region.offset,
        len,
    };
    mtd.check_extent(region.name, &extent)?;

    let erase = FlashOp::Erase {
        dev: mtd.dev_path(),
        start: region.offset,
        count: mtd.blocks_for(len),
    };
    let write = FlashOp::Write {
        dev: mtd.dev_path(),
        offset: region.offset,
        file: bitstream.to_path_buf(),
    };
    Ok((erase, write))
}

impl fmt::Display for UpgradePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            writeln!(f, "{:2}. {:<28} {}", i + 1, step.desc, step.op)?;
        }
        Ok(())
    }
}

#[cfg(test)]
fn test_mtds() -> MtdTable {
    MtdTable::parse(crate::nand::TEST_PROC_MTD).unwrap()
}

#[test]
fn test_plan_flag_0() -> anyhow::Result<()> {
    use crate::nand::offsets::ImageFlag;

    let options = UpgradeOptions::default();
    let table = OffsetTable::for_flag(ImageFlag::Zero);
    let plan = UpgradePlan::build(&table, &test_mtds(), &options)?;
    assert_eq!(plan.len(), 10);
    assert_eq!(
        plan.scratch_files().collect::<Vec<_>>(),
        [
            Path::new("/tmp/kernel.bin"),
            Path::new("/tmp/stage2.bin"),
            Path::new("/tmp/stage3.bin"),
        ]
    );

    assert_eq!(
        plan.steps[0].op,
        FlashOp::Erase {
            dev: "/dev/mtd2".into(),
            start: 0x7D00000,
            count: 32,
        }
    );
    assert_eq!(
        plan.steps[1].op,
        FlashOp::Dump {
            dev: "/dev/mtd1".into(),
            offset: 0x0840000,
            len: 0x400000,
            file: "/tmp/kernel.bin".into(),
        }
    );
    assert_eq!(
        plan.steps[2].op,
        FlashOp::Write {
            dev: "/dev/mtd2".into(),
            offset: 0x7D00000,
            file: "/tmp/kernel.bin".into(),
        }
    );
    assert_eq!(
        plan.steps[9].op,
        FlashOp::SetEnv {
            name: "image_flag".into(),
            value: "1".into(),
        }
    );
    Ok(())
}

#[test]
fn test_plan_flag_1_never_touches_running_slot() -> anyhow::Result<()> {
    use crate::nand::offsets::ImageFlag;

    let options = UpgradeOptions::default();
    let table = OffsetTable::for_flag(ImageFlag::One);
    let plan = UpgradePlan::build(&table, &test_mtds(), &options)?;
    let running = OffsetTable::for_flag(ImageFlag::Zero);

    for step in &plan.steps {
        if let FlashOp::Erase { start, count, .. } = step.op {
            let erased = Extent {
                mtd: 2,
                offset: start,
                len: count * 0x20000,
            };
            for live in running.slot_regions() {
                assert!(!erased.overlaps(&live.destination()), "{}", step.desc);
            }
        }
    }

    assert_eq!(
        plan.steps.last().map(|s| &s.op),
        Some(&FlashOp::SetEnv {
            name: "image_flag".into(),
            value: "0".into(),
        })
    );
    Ok(())
}

#[test]
fn test_plan_purge_staging() -> anyhow::Result<()> {
    use crate::nand::offsets::ImageFlag;

    let options = UpgradeOptions {
        purge_staging: true,
        ..Default::default()
    };
    let table = OffsetTable::for_flag(ImageFlag::Zero);
    let plan = UpgradePlan::build(&table, &test_mtds(), &options)?;
    let last = plan.steps.last().unwrap();
    assert_eq!(last.desc, "Purging upgrade partition");
    assert_eq!(last.op.to_string(), "flash_erase /dev/mtd1 0x0 0");

    // A listing where the staging partition has moved must not purge mtd1
    let swapped = crate::nand::TEST_PROC_MTD
        .replace("\"upgrade\"", "\"tmp\"")
        .replace("\"firmware\"", "\"upgrade\"");
    let mtds = MtdTable::parse(&swapped)?;
    let error = UpgradePlan::build(&table, &mtds, &options).unwrap_err();
    assert_eq!(
        error.to_string(),
        "kernel was staged on mtd1, not the \"upgrade\" partition (mtd2)"
    );

    let renamed = crate::nand::TEST_PROC_MTD.replace("\"upgrade\"", "\"tmp\"");
    let mtds = MtdTable::parse(&renamed)?;
    assert!(UpgradePlan::build(&table, &mtds, &options).is_err());
    assert!(UpgradePlan::build(&table, &mtds, &UpgradeOptions::default()).is_ok());
    Ok(())
}

#[test]
fn test_plan_bitstream() -> anyhow::Result<()> {
    use crate::nand::offsets::ImageFlag;

    let path = std::env::temp_dir().join(format!("fw-upgrade-bit-{}", std::process::id()));
    std::fs::write(&path, vec![0u8; 0x30000])?;

    let options = UpgradeOptions {
        bitstream: Some(path.clone()),
        ..Default::default()
    };
    let table = OffsetTable::for_flag(ImageFlag::Zero);
    let plan = UpgradePlan::build(&table, &test_mtds(), &options)?;
    assert_eq!(
        plan.steps[9].op,
        FlashOp::Erase {
            dev: "/dev/mtd0".into(),
            start: 0x200000,
            count: 2,
        }
    );
    assert_eq!(
        plan.steps[10].op,
        FlashOp::Write {
            dev: "/dev/mtd0".into(),
            offset: 0x200000,
            file: path.clone(),
        }
    );

    std::fs::write(&path, vec![0u8; BITSTREAM_MAX_SIZE as usize + 1])?;
    assert!(UpgradePlan::build(&table, &test_mtds(), &options).is_err());

    std::fs::remove_file(&path)?;
    Ok(())
}

#[test]
fn test_plan_rejects_small_partitions() {
    use crate::nand::offsets::ImageFlag;

    let shrunk = crate::nand::TEST_PROC_MTD.replace("0e000000", "02000000");
    let mtds = MtdTable::parse(&shrunk).unwrap();
    let err = UpgradePlan::build(
        &OffsetTable::for_flag(ImageFlag::Zero),
        &mtds,
        &UpgradeOptions::default(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("does not fit mtd2"));
}
