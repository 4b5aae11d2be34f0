//! Everything the upgrade needs to know, gathered once up front.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::warn;

use crate::bootenv::BootEnv;
use crate::miner::hwrevision::HWREVISION_PATH;

pub const PROC_MTD_PATH: &str = "/proc/mtd";

/// The families a firmware image is built for, unless told otherwise
pub const DEFAULT_SUPPORTED_MINERS: [&str; 2] = ["G19", "G29"];

/// A snapshot of the device's identity and state.
///
/// This is read exactly once; nothing afterwards goes back to the device for these values.
/// Only `/proc/mtd` must be readable here. Everything else is recorded as missing and left for
/// the gates to reject, so that a wrong partition layout is always the first thing reported.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// MAC address from the bootloader environment, for diagnostics only
    pub ethaddr: Option<String>,

    /// `image_flag` exactly as the bootloader reported it
    pub image_flag: Option<String>,

    /// Contents of `/etc/hwrevision`, if it could be read
    pub hw_revision: Option<String>,

    /// Contents of `/proc/mtd`
    pub proc_mtd: String,
}

impl DeviceConfig {
    pub fn load(env: &impl BootEnv, paths: &DevicePaths) -> anyhow::Result<Self> {
        let proc_mtd = fs::read_to_string(&paths.proc_mtd)
            .with_context(|| format!("could not read {}", paths.proc_mtd.display()))?;
        let hw_revision = fs::read_to_string(&paths.hwrevision)
            .map_err(|e| warn!("could not read {}: {e}", paths.hwrevision.display()))
            .ok();

        Ok(DeviceConfig {
            ethaddr: read_var(env, "ethaddr"),
            image_flag: read_var(env, "image_flag"),
            hw_revision,
            proc_mtd,
        })
    }
}

fn read_var(env: &impl BootEnv, name: &str) -> Option<String> {
    env.get(name)
        .map_err(|e| warn!("could not read {name}: {e:#}"))
        .ok()
        .flatten()
}

/// Where to find the device's identity files
#[derive(Debug, Clone)]
pub struct DevicePaths {
    pub proc_mtd: PathBuf,
    pub hwrevision: PathBuf,
}

impl Default for DevicePaths {
    fn default() -> Self {
        Self {
            proc_mtd: PROC_MTD_PATH.into(),
            hwrevision: HWREVISION_PATH.into(),
        }
    }
}

/// How the upgrade itself should be carried out
#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    /// Family names the staged firmware supports
    pub supported_miners: Vec<String>,

    /// Optional FPGA bitstream to write into the boot partition
    pub bitstream: Option<PathBuf>,

    /// Erase the whole staging partition once the copy is done
    pub purge_staging: bool,

    /// Scratch directory for the regions read out of the staging partition
    pub work_dir: PathBuf,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            supported_miners: DEFAULT_SUPPORTED_MINERS.map(String::from).to_vec(),
            bitstream: None,
            purge_staging: false,
            work_dir: Path::new("/tmp").to_path_buf(),
        }
    }
}

impl UpgradeOptions {
    pub fn supported_miners(&self) -> Vec<&str> {
        self.supported_miners.iter().map(String::as_str).collect()
    }
}

#[test]
fn test_load_device_config() -> anyhow::Result<()> {
    use crate::bootenv::SimBootEnv;

    let dir = std::env::temp_dir().join(format!("fw-upgrade-config-{}", std::process::id()));
    fs::create_dir_all(&dir)?;
    let paths = DevicePaths {
        proc_mtd: dir.join("mtd"),
        hwrevision: dir.join("hwrevision"),
    };
    fs::write(&paths.proc_mtd, crate::nand::TEST_PROC_MTD)?;
    fs::write(&paths.hwrevision, "g19 t1.g19\n")?;

    let env = SimBootEnv::new()
        .with("ethaddr", "a0:b0:45:00:00:01")
        .with("image_flag", "0");
    let config = DeviceConfig::load(&env, &paths)?;
    assert_eq!(config.ethaddr.as_deref(), Some("a0:b0:45:00:00:01"));
    assert_eq!(config.image_flag.as_deref(), Some("0"));
    assert_eq!(config.hw_revision.as_deref(), Some("g19 t1.g19\n"));
    assert_eq!(config.proc_mtd, crate::nand::TEST_PROC_MTD);

    fs::remove_file(&paths.hwrevision)?;
    let config = DeviceConfig::load(&env, &paths)?;
    assert_eq!(config.hw_revision, None);

    fs::remove_file(&paths.proc_mtd)?;
    assert!(DeviceConfig::load(&env, &paths).is_err());

    fs::remove_dir_all(&dir)?;
    Ok(())
}
