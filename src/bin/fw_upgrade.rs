//! One-shot firmware upgrade for the G19/G29 miner control boards.
//!
//! This runs on the miner itself, from the currently booted image. The new firmware must already
//! be staged in the "upgrade" partition; this program only checks that the device is one we know
//! how to upgrade, then copies the staged regions into the inactive image slot and flips
//! `image_flag` over to it.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use nix::unistd::Uid;

use std::path::PathBuf;

use miner_fw_upgrade::{
    bootenv::FwPrintenv,
    config::{DeviceConfig, DevicePaths, UpgradeOptions, DEFAULT_SUPPORTED_MINERS, PROC_MTD_PATH},
    miner::{self, hwrevision::HWREVISION_PATH},
    nand::offsets::{ImageFlag, OffsetTable},
    tools::{DryRun, ShellRunner},
};

#[derive(Args, Debug)]
struct DeviceOptions {
    /// Path to the MTD partition listing
    #[clap(long, default_value = PROC_MTD_PATH)]
    proc_mtd: PathBuf,

    /// Path to the hardware revision file
    #[clap(long, default_value = HWREVISION_PATH)]
    hwrevision: PathBuf,

    /// The program used to read the bootloader environment
    #[clap(long, default_value = "fw_printenv")]
    fw_printenv: String,

    /// Miner families the staged firmware was built for (repeatable)
    #[clap(long = "miner", default_values_t = DEFAULT_SUPPORTED_MINERS.map(String::from))]
    miners: Vec<String>,
}

impl DeviceOptions {
    fn load(&self) -> Result<DeviceConfig> {
        let paths = DevicePaths {
            proc_mtd: self.proc_mtd.clone(),
            hwrevision: self.hwrevision.clone(),
        };
        DeviceConfig::load(&FwPrintenv::new(&self.fw_printenv), &paths)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the partition layout, hardware revision and image flag; changes nothing
    Check,

    /// Print the offset table
    Offsets {
        /// Print the table for this image flag instead of reading it from the device
        #[clap(long)]
        flag: Option<String>,
    },

    /// Copy the staged firmware into the inactive image slot
    Upgrade {
        /// Only print the commands that would run
        #[clap(long)]
        dry_run: bool,

        /// FPGA bitstream to write along with the image
        #[clap(long)]
        bitstream: Option<PathBuf>,

        /// Erase the staging partition afterwards
        #[clap(long)]
        purge_staging: bool,

        /// Scratch directory for regions read out of the staging partition
        #[clap(long, default_value = "/tmp")]
        work_dir: PathBuf,
    },
}

impl Command {
    fn execute(self, device: &DeviceOptions) -> Result<()> {
        let mut options = UpgradeOptions {
            supported_miners: device.miners.clone(),
            ..Default::default()
        };

        match self {
            Command::Check => {
                let config = device.load()?;
                let checked = miner::preflight(&config, &options)?;
                println!("ethaddr:    {}", config.ethaddr.as_deref().unwrap_or("-"));
                let revision = config.hw_revision.as_deref().unwrap_or_default();
                println!("hardware:   {} ({})", checked.family, revision.trim());
                println!("image_flag: {}", checked.flag);
            }

            Command::Offsets { flag: Some(flag) } => {
                // Parsed here rather than by clap, so a bad flag fails like any other gate
                let flag: ImageFlag = flag.parse()?;
                print!("{}", OffsetTable::for_flag(flag));
            }

            Command::Offsets { flag: None } => {
                let config = device.load()?;
                let checked = miner::preflight(&config, &options)?;
                print!("{}", checked.table);
            }

            Command::Upgrade {
                dry_run,
                bitstream,
                purge_staging,
                work_dir,
            } => {
                options.bitstream = bitstream;
                options.purge_staging = purge_staging;
                options.work_dir = work_dir;

                let config = device.load()?;
                if dry_run {
                    let plan = miner::upgrade_firmware(&config, &options, &mut DryRun::default())?;
                    print!("{plan}");
                } else {
                    anyhow::ensure!(Uid::effective().is_root(), "flashing requires root");
                    miner::upgrade_firmware(&config, &options, &mut ShellRunner)?;
                }
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Where to read the device state from
    #[clap(flatten)]
    device: DeviceOptions,

    /// What to do
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let result = args.cmd.execute(&args.device);

    howudoin::disable();
    std::thread::sleep(std::time::Duration::from_millis(10)); // Give howudoin time to shut down
    result
}

#[test]
fn test_offsets_rejects_bad_flag() {
    use miner_fw_upgrade::UpgradeError;

    let args = Cli::try_parse_from(["fw-upgrade", "offsets", "--flag", "2"])
        .expect("the flag is validated after parsing");
    let error = args.cmd.execute(&args.device).unwrap_err();
    assert!(matches!(
        error.downcast_ref::<UpgradeError>(),
        Some(UpgradeError::UnsupportedImageFlag(flag)) if flag == "2"
    ));

    let args = Cli::try_parse_from(["fw-upgrade", "offsets", "--flag", "1"]).unwrap();
    assert!(args.cmd.execute(&args.device).is_ok());
}
