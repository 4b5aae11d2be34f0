//! Firmware upgrade for the G19/G29 miner control boards.
//!
//! The upgrade is strictly gated: the NAND partition table must match the one known layout, the
//! hardware revision must be one we have built for, and the bootloader's `image_flag` must name
//! one of the two image slots. Only then is the offset table for that slot selected and the
//! staged image copied into the inactive slot.

pub mod bootenv;
pub mod config;
pub mod error;
pub mod miner;
pub mod nand;
pub mod plan;
pub mod tools;

pub use error::UpgradeError;
