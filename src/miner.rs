pub mod hwrevision;

use std::{fs, io};

use anyhow::Context;
use log::{info, warn};

use crate::{
    config::{DeviceConfig, UpgradeOptions},
    error::UpgradeError,
    nand::{
        self,
        offsets::{ImageFlag, OffsetTable},
        MtdTable,
    },
    plan::UpgradePlan,
    tools::{FlashOp, Runner},
};

use self::hwrevision::{HwFamily, HwRevision};

pub const BANNER: &str = r"
  __ _    _   _ _ __   __ _ _ __ __ _  __| | ___
 / _` |  | | | | '_ \ / _` | '__/ _` |/ _` |/ _ \
| (_| |  | |_| | |_) | (_| | | | (_| | (_| |  __/
 \__, |   \__,_| .__/ \__, |_|  \__,_|\__,_|\___|
 |___/         |_|    |___/
";

/// What the device turned out to be, once every gate has passed
#[derive(Debug, Clone)]
pub struct Preflight {
    pub family: HwFamily,
    pub flag: ImageFlag,
    pub table: OffsetTable,
    pub mtds: MtdTable,
}

/// Run the three gates, in order, and select the offset table.
///
/// Each gate is fatal, and a later gate is never looked at if an earlier one fails.
pub fn preflight(config: &DeviceConfig, options: &UpgradeOptions) -> anyhow::Result<Preflight> {
    // 1. Partition layout
    if let Err(error) = nand::verify_layout(&config.proc_mtd) {
        eprintln!("{}", config.proc_mtd.trim_end());
        return Err(error.into());
    }
    let mtds = MtdTable::parse(&config.proc_mtd)?;

    // 2. Hardware revision
    let hw_revision: HwRevision = config
        .hw_revision
        .as_deref()
        .ok_or_else(|| UpgradeError::UnsupportedHardware("unknown".into()))?
        .parse()?;
    let family = hw_revision.validate(&options.supported_miners())?;

    // 3. Image slot
    let flag: ImageFlag = config
        .image_flag
        .as_deref()
        .ok_or_else(|| UpgradeError::UnsupportedImageFlag(String::new()))?
        .parse()?;
    let table = OffsetTable::for_flag(flag);

    Ok(Preflight {
        family,
        flag,
        table,
        mtds,
    })
}

/// This is the core function of the upgrade: check the device, then copy the staged image into
/// the slot that is not currently booting and point the bootloader at it.
///
/// Returns the plan that was carried out.
pub fn upgrade_firmware(
    config: &DeviceConfig,
    options: &UpgradeOptions,
    runner: &mut impl Runner,
) -> anyhow::Result<UpgradePlan> {
    eprintln!("{}", BANNER);

    let device = preflight(config, options)?;
    info!(
        "{} board {}, booting image slot {}",
        device.family,
        config.ethaddr.as_deref().unwrap_or("(no ethaddr)"),
        device.flag
    );

    let plan = UpgradePlan::build(&device.table, &device.mtds, options)
        .context("could not plan the upgrade")?;

    let rpt = howudoin::new()
        .label("Upgrading miner firmware")
        .set_len(u64::try_from(plan.len()).ok());

    let mut touched_flash = false;
    let mut switched_slot = false;
    for step in &plan.steps {
        rpt.desc(step.desc.clone());
        rpt.inc();

        touched_flash |= step.op.is_destructive();
        if let Err(error) = runner.run(&step.op) {
            remove_scratch_files(&plan);
            if switched_slot {
                warn!("image slot {} is already selected to boot", device.flag.other());
            } else if touched_flash {
                warn!(
                    "upgrade interrupted; image_flag is still {}, so the current image still boots",
                    device.flag
                );
            }
            return Err(error.context(format!("{} failed", step.desc)));
        }
        switched_slot |= matches!(step.op, FlashOp::SetEnv { .. });
    }

    remove_scratch_files(&plan);
    rpt.finish();
    info!("upgrade done; image slot {} will boot next", device.flag.other());

    Ok(plan)
}

/// Delete the regions dumped out of the staging partition
fn remove_scratch_files(plan: &UpgradePlan) {
    for file in plan.scratch_files() {
        match fs::remove_file(file) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                warn!("could not remove {}: {e}", file.display())
            }
            _ => (),
        }
    }
}

#[cfg(test)]
mod sim {
    use crate::tools::{FlashOp, Runner};

    /// Records operations, and fails the one at `fail_at`
    #[derive(Debug, Default)]
    pub struct FailingRunner {
        pub ops: Vec<FlashOp>,
        pub fail_at: usize,
    }

    impl Runner for FailingRunner {
        fn run(&mut self, op: &FlashOp) -> anyhow::Result<()> {
            anyhow::ensure!(self.ops.len() != self.fail_at, "simulated failure");
            self.ops.push(op.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
fn test_config(proc_mtd: &str, hw_revision: &str, image_flag: Option<&str>) -> DeviceConfig {
    DeviceConfig {
        ethaddr: Some("a0:b0:45:00:00:01".into()),
        image_flag: image_flag.map(String::from),
        hw_revision: Some(hw_revision.into()),
        proc_mtd: proc_mtd.into(),
    }
}

#[cfg(test)]
fn upgrade_error(error: &anyhow::Error) -> &UpgradeError {
    error
        .downcast_ref::<UpgradeError>()
        .expect("should be an UpgradeError")
}

#[test]
fn test_preflight_ok() -> anyhow::Result<()> {
    let config = test_config(nand::TEST_PROC_MTD, "g29 t1.g29\n", Some("1"));
    let device = preflight(&config, &UpgradeOptions::default())?;
    assert_eq!(device.family, HwFamily::G29);
    assert_eq!(device.flag, ImageFlag::One);
    assert_eq!(device.table, OffsetTable::for_flag(ImageFlag::One));
    Ok(())
}

#[test]
fn test_bad_layout_stops_before_hardware_check() {
    let resized = nand::TEST_PROC_MTD.replace("01c00000", "01e00000");
    let config = test_config(&resized, "g30 t1.g30", Some("7"));

    let mut runner = crate::tools::DryRun::default();
    let error = upgrade_firmware(&config, &UpgradeOptions::default(), &mut runner).unwrap_err();
    assert!(matches!(
        upgrade_error(&error),
        UpgradeError::UnsupportedLayout { .. }
    ));
    assert!(runner.ops.is_empty());
}

#[test]
fn test_bad_layout_reported_before_missing_files() -> anyhow::Result<()> {
    use crate::bootenv::FwPrintenv;
    use crate::config::DevicePaths;

    let dir = std::env::temp_dir().join(format!("fw-upgrade-order-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let paths = DevicePaths {
        proc_mtd: dir.join("mtd"),
        hwrevision: dir.join("missing"),
    };
    std::fs::write(
        &paths.proc_mtd,
        nand::TEST_PROC_MTD.replace("\"upgrade\"", "\"rootfs\""),
    )?;

    let env = FwPrintenv::new("/nonexistent/fw_printenv");
    let config = DeviceConfig::load(&env, &paths)?;
    assert_eq!(config.hw_revision, None);
    assert_eq!(config.image_flag, None);

    let error = preflight(&config, &UpgradeOptions::default()).unwrap_err();
    assert!(matches!(
        upgrade_error(&error),
        UpgradeError::UnsupportedLayout { .. }
    ));

    // With the right layout, the missing revision is what gets reported
    std::fs::write(&paths.proc_mtd, nand::TEST_PROC_MTD)?;
    let config = DeviceConfig::load(&env, &paths)?;
    let error = preflight(&config, &UpgradeOptions::default()).unwrap_err();
    assert!(matches!(
        upgrade_error(&error),
        UpgradeError::UnsupportedHardware(_)
    ));

    std::fs::remove_dir_all(&dir)?;
    Ok(())
}

#[test]
fn test_bad_hardware_stops_before_offsets() {
    let options = UpgradeOptions::default();
    for hw_revision in ["g30 t1.g30", "g19 t9.g19", "g19", ""] {
        let config = test_config(nand::TEST_PROC_MTD, hw_revision, Some("9"));
        let error = preflight(&config, &options).unwrap_err();
        assert!(
            matches!(upgrade_error(&error), UpgradeError::UnsupportedHardware(_)),
            "{hw_revision}"
        );
    }
}

#[test]
fn test_bad_image_flag() {
    let options = UpgradeOptions::default();
    for flag in [Some("2"), Some(""), Some("one"), None] {
        let config = test_config(nand::TEST_PROC_MTD, "g19 t1.g19", flag);

        let mut runner = crate::tools::DryRun::default();
        let error = upgrade_firmware(&config, &options, &mut runner).unwrap_err();
        assert!(
            matches!(upgrade_error(&error), UpgradeError::UnsupportedImageFlag(_)),
            "{flag:?}"
        );
        assert!(error.to_string().starts_with("Unsupported image flag"));
        assert!(runner.ops.is_empty());
    }
}

#[test]
fn test_upgrade_dry_run() -> anyhow::Result<()> {
    let config = test_config(nand::TEST_PROC_MTD, "g19 t1.g19", Some("0"));
    let mut runner = crate::tools::DryRun::default();
    let plan = upgrade_firmware(&config, &UpgradeOptions::default(), &mut runner)?;

    assert_eq!(runner.ops.len(), 10);
    assert!(plan.steps.iter().map(|s| &s.op).eq(runner.ops.iter()));
    assert_eq!(
        runner.ops.first(),
        Some(&FlashOp::Erase {
            dev: "/dev/mtd2".into(),
            start: 0x7D00000,
            count: 32,
        })
    );
    assert_eq!(
        runner.ops.last(),
        Some(&FlashOp::SetEnv {
            name: "image_flag".into(),
            value: "1".into(),
        })
    );
    Ok(())
}

#[test]
fn test_scratch_files_removed() -> anyhow::Result<()> {
    let work_dir = std::env::temp_dir().join(format!("fw-upgrade-work-{}", std::process::id()));
    fs::create_dir_all(&work_dir)?;
    let options = UpgradeOptions {
        work_dir: work_dir.clone(),
        ..Default::default()
    };

    // Stand in for what nanddump would have written
    let dumps = ["kernel.bin", "stage2.bin", "stage3.bin"].map(|name| work_dir.join(name));
    for dump in &dumps {
        fs::write(dump, [0xFFu8; 16])?;
    }

    let config = test_config(nand::TEST_PROC_MTD, "g19 t1.g19", Some("0"));
    upgrade_firmware(&config, &options, &mut crate::tools::DryRun::default())?;
    assert!(dumps.iter().all(|dump| !dump.exists()));

    // Also after a failure partway through
    fs::write(&dumps[0], [0xFFu8; 16])?;
    let mut runner = sim::FailingRunner {
        fail_at: 2,
        ..Default::default()
    };
    assert!(upgrade_firmware(&config, &options, &mut runner).is_err());
    assert!(!dumps[0].exists());

    fs::remove_dir_all(&work_dir)?;
    Ok(())
}

#[test]
fn test_failed_step_keeps_image_flag() {
    let config = test_config(nand::TEST_PROC_MTD, "g19 t1.g19", Some("1"));
    let mut runner = sim::FailingRunner {
        fail_at: 4,
        ..Default::default()
    };

    let error = upgrade_firmware(&config, &UpgradeOptions::default(), &mut runner).unwrap_err();
    assert!(error.to_string().contains("Reading staged stage2"));
    assert_eq!(runner.ops.len(), 4);
    assert!(runner
        .ops
        .iter()
        .all(|op| !matches!(op, FlashOp::SetEnv { .. })));
}
