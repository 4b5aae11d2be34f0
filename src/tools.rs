//! The external utilities that do the actual flash work, and thin helpers around them.
//!
//! Nothing in here knows how a NAND is erased or written; it only knows how to ask `flash_erase`,
//! `nanddump`, `nandwrite` and `fw_setenv` to do it.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context;
use log::{debug, info};

use crate::error::UpgradeError;
use crate::nand::MtdPartition;

/// One invocation of an external flashing utility
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashOp {
    /// Erase `count` blocks starting at `start`; a count of 0 means "to the end of the device"
    Erase {
        dev: PathBuf,
        start: u64,
        count: u64,
    },

    /// Read `len` bytes at `offset` into a file
    Dump {
        dev: PathBuf,
        offset: u64,
        len: u64,
        file: PathBuf,
    },

    /// Write a file to the device at `offset`
    Write {
        dev: PathBuf,
        offset: u64,
        file: PathBuf,
    },

    /// Set a bootloader environment variable
    SetEnv { name: String, value: String },
}

impl FlashOp {
    /// Build the command line for this operation
    pub fn command(&self) -> Command {
        let mut cmd;
        match self {
            FlashOp::Erase { dev, start, count } => {
                cmd = Command::new("flash_erase");
                cmd.arg(dev)
                    .arg(format!("{start:#x}"))
                    .arg(count.to_string());
            }
            FlashOp::Dump {
                dev,
                offset,
                len,
                file,
            } => {
                cmd = Command::new("nanddump");
                cmd.args(["--bb=skipbad", "--omitoob"])
                    .arg(format!("--startaddress={offset:#x}"))
                    .arg(format!("--length={len:#x}"))
                    .arg("-f")
                    .arg(file)
                    .arg(dev);
            }
            FlashOp::Write { dev, offset, file } => {
                cmd = Command::new("nandwrite");
                cmd.arg("--pad")
                    .arg(format!("--start={offset:#x}"))
                    .arg(dev)
                    .arg(file);
            }
            FlashOp::SetEnv { name, value } => {
                cmd = Command::new("fw_setenv");
                cmd.arg(name).arg(value);
            }
        }
        cmd
    }

    /// Does this operation change the contents of flash or the bootloader environment?
    pub fn is_destructive(&self) -> bool {
        !matches!(self, FlashOp::Dump { .. })
    }
}

impl fmt::Display for FlashOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cmd = self.command();
        write!(f, "{}", cmd.get_program().to_string_lossy())?;
        for arg in cmd.get_args() {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Something that can carry out flash operations
pub trait Runner {
    fn run(&mut self, op: &FlashOp) -> anyhow::Result<()>;
}

/// Runs each operation as a subprocess, failing on non-zero exit
#[derive(Debug, Default)]
pub struct ShellRunner;

impl Runner for ShellRunner {
    fn run(&mut self, op: &FlashOp) -> anyhow::Result<()> {
        let mut cmd = op.command();
        let tool = cmd.get_program().to_string_lossy().into_owned();
        debug!("running: {op}");

        let status = cmd
            .status()
            .with_context(|| format!("could not run {tool}"))?;
        if !status.success() {
            return Err(UpgradeError::ToolFailed { tool, status }.into());
        }
        Ok(())
    }
}

/// Only reports what would be run
#[derive(Debug, Default)]
pub struct DryRun {
    pub ops: Vec<FlashOp>,
}

impl Runner for DryRun {
    fn run(&mut self, op: &FlashOp) -> anyhow::Result<()> {
        info!("dry run: {op}");
        self.ops.push(op.clone());
        Ok(())
    }
}

/// Erase an entire MTD device, from offset 0 to its end
pub fn flash_eraseall(mtd: &MtdPartition) -> FlashOp {
    FlashOp::Erase {
        dev: mtd.dev_path(),
        start: 0,
        count: 0,
    }
}

/// The size of a file as a "0x"-prefixed hex string
pub fn file_size(path: impl AsRef<Path>) -> io::Result<String> {
    let len = fs::metadata(path)?.len();
    Ok(format!("{len:#x}"))
}

#[test]
fn test_file_size() -> io::Result<()> {
    let path = std::env::temp_dir().join(format!("fw-upgrade-size-{}", std::process::id()));
    fs::write(&path, [0xA5u8; 256])?;
    assert_eq!(file_size(&path)?, "0x100");

    fs::write(&path, [0u8; 0])?;
    assert_eq!(file_size(&path)?, "0x0");

    fs::remove_file(&path)?;
    assert!(file_size(&path).is_err());
    Ok(())
}

#[test]
fn test_flash_eraseall() {
    let mtd: MtdPartition = "mtd1: 01c00000 00020000 \"upgrade\"".parse().unwrap();
    let op = flash_eraseall(&mtd);
    assert_eq!(
        op,
        FlashOp::Erase {
            dev: "/dev/mtd1".into(),
            start: 0,
            count: 0
        }
    );
    assert_eq!(op.to_string(), "flash_erase /dev/mtd1 0x0 0");
}

#[test]
fn test_op_command_lines() {
    let dump = FlashOp::Dump {
        dev: "/dev/mtd1".into(),
        offset: 0x840000,
        len: 0x400000,
        file: "/tmp/kernel.bin".into(),
    };
    assert_eq!(
        dump.to_string(),
        "nanddump --bb=skipbad --omitoob --startaddress=0x840000 --length=0x400000 \
         -f /tmp/kernel.bin /dev/mtd1"
    );
    assert!(!dump.is_destructive());

    let write = FlashOp::Write {
        dev: "/dev/mtd2".into(),
        offset: 0x7d00000,
        file: "/tmp/kernel.bin".into(),
    };
    assert_eq!(
        write.to_string(),
        "nandwrite --pad --start=0x7d00000 /dev/mtd2 /tmp/kernel.bin"
    );
    assert!(write.is_destructive());

    let setenv = FlashOp::SetEnv {
        name: "image_flag".into(),
        value: "1".into(),
    };
    assert_eq!(setenv.to_string(), "fw_setenv image_flag 1");
}

#[test]
fn test_dry_run_records() -> anyhow::Result<()> {
    let mut runner = DryRun::default();
    let op = FlashOp::SetEnv {
        name: "image_flag".into(),
        value: "0".into(),
    };
    runner.run(&op)?;
    assert_eq!(runner.ops, [op]);
    Ok(())
}
