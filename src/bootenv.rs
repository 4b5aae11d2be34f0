//! Read access to the U-Boot environment.

use std::collections::HashMap;
use std::process::Command;

use anyhow::Context;
use log::debug;

/// Somewhere bootloader variables can be read from
pub trait BootEnv {
    /// Get the value of a variable, or None if it is not set
    fn get(&self, name: &str) -> anyhow::Result<Option<String>>;
}

/// The real environment, read through the `fw_printenv` utility
#[derive(Debug, Clone)]
pub struct FwPrintenv {
    program: String,
}

impl FwPrintenv {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for FwPrintenv {
    fn default() -> Self {
        Self::new("fw_printenv")
    }
}

impl BootEnv for FwPrintenv {
    fn get(&self, name: &str) -> anyhow::Result<Option<String>> {
        let output = Command::new(&self.program)
            .arg("-n")
            .arg(name)
            .output()
            .with_context(|| format!("could not run {}", self.program))?;

        // fw_printenv exits non-zero for undefined variables
        if !output.status.success() {
            debug!("{name} is not set ({})", output.status);
            return Ok(None);
        }

        let value = String::from_utf8(output.stdout)
            .with_context(|| format!("{name} is not valid UTF-8"))?;
        Ok(Some(value.trim_end_matches('\n').to_owned()))
    }
}

/// An in-memory environment, for testing purposes
#[derive(Debug, Clone, Default)]
pub struct SimBootEnv {
    vars: HashMap<String, String>,
}

impl SimBootEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.vars.insert(name.to_owned(), value.to_owned());
        self
    }
}

impl BootEnv for SimBootEnv {
    fn get(&self, name: &str) -> anyhow::Result<Option<String>> {
        Ok(self.vars.get(name).cloned())
    }
}

#[test]
fn test_sim_boot_env() {
    let env = SimBootEnv::new().with("image_flag", "1");
    assert_eq!(env.get("image_flag").unwrap().as_deref(), Some("1"));
    assert_eq!(env.get("ethaddr").unwrap(), None);
}

#[test]
fn test_fw_printenv_missing_program() {
    let env = FwPrintenv::new("/nonexistent/fw_printenv");
    assert!(env.get("image_flag").is_err());
}
