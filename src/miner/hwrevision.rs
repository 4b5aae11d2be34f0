use std::{fmt, str::FromStr};

use crate::error::UpgradeError;

pub const HWREVISION_PATH: &str = "/etc/hwrevision";

/// The control board families this firmware knows about
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HwFamily {
    G19,
    G29,
}

impl HwFamily {
    /// Match the board name from `/etc/hwrevision` to a family
    pub fn from_board(board: &str) -> Option<Self> {
        let board = board.to_ascii_lowercase();
        if board.starts_with("g19") {
            Some(HwFamily::G19)
        } else if board.starts_with("g29") {
            Some(HwFamily::G29)
        } else {
            None
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HwFamily::G19 => "G19",
            HwFamily::G29 => "G29",
        }
    }

    /// The exact revision strings we have tested on this family
    pub fn accepted_revisions(self) -> &'static [&'static str] {
        match self {
            HwFamily::G19 => &["t1.g19"],
            HwFamily::G29 => &["t1.g29"],
        }
    }
}

impl fmt::Display for HwFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The contents of `/etc/hwrevision`: "<board> <revision>"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwRevision {
    pub board: String,
    pub revision: String,
}

impl HwRevision {
    /// Check this revision is one we support, returning its family.
    ///
    /// `supported` is the list of family names the firmware being installed was built for.
    pub fn validate(&self, supported: &[&str]) -> Result<HwFamily, UpgradeError> {
        let unsupported = || UpgradeError::UnsupportedHardware(self.to_string());

        let family = HwFamily::from_board(&self.board).ok_or_else(unsupported)?;
        if !family.accepted_revisions().contains(&self.revision.as_str()) {
            return Err(unsupported());
        }
        if !fw_miner_check(family, supported) {
            return Err(unsupported());
        }

        Ok(family)
    }
}

impl FromStr for HwRevision {
    type Err = UpgradeError;

    fn from_str(s: &str) -> Result<Self, UpgradeError> {
        let mut words = s.split_whitespace();
        match (words.next(), words.next(), words.next()) {
            (Some(board), Some(revision), None) => Ok(HwRevision {
                board: board.to_owned(),
                revision: revision.to_owned(),
            }),
            _ => Err(UpgradeError::UnsupportedHardware(s.trim().to_owned())),
        }
    }
}

impl fmt::Display for HwRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.board, self.revision)
    }
}

/// Is `family` one of the `candidates`? Names are compared exactly.
pub fn fw_miner_check(family: HwFamily, candidates: &[&str]) -> bool {
    candidates.iter().any(|&c| c == family.name())
}

#[test]
fn test_fw_miner_check() {
    assert!(fw_miner_check(HwFamily::G19, &["G19", "G29"]));
    assert!(fw_miner_check(HwFamily::G29, &["G19", "G29"]));
    assert!(!fw_miner_check(HwFamily::G19, &["G30"]));
    assert!(!fw_miner_check(HwFamily::G19, &["g19"]));
    assert!(!fw_miner_check(HwFamily::G19, &[]));
}

#[test]
fn test_parse_hwrevision() {
    let rev: HwRevision = "g19 t1.g19\n".parse().unwrap();
    assert_eq!(rev.board, "g19");
    assert_eq!(rev.revision, "t1.g19");
    assert_eq!(rev.to_string(), "g19 t1.g19");

    assert!("g19".parse::<HwRevision>().is_err());
    assert!("g19 t1.g19 extra".parse::<HwRevision>().is_err());
    assert!("".parse::<HwRevision>().is_err());
}

#[test]
fn test_validate_hwrevision() {
    let g19: HwRevision = "g19 t1.g19".parse().unwrap();
    assert_eq!(g19.validate(&["G19", "G29"]).unwrap(), HwFamily::G19);

    let g29: HwRevision = "G29 t1.g29".parse().unwrap();
    assert_eq!(g29.validate(&["G19", "G29"]).unwrap(), HwFamily::G29);

    // Family known, but this firmware was not built for it
    assert!(matches!(
        g29.validate(&["G19"]),
        Err(UpgradeError::UnsupportedHardware(_))
    ));

    // Revision outside the family's allow-list
    let newer: HwRevision = "g19 t2.g19".parse().unwrap();
    assert!(newer.validate(&["G19", "G29"]).is_err());

    // Revision of the wrong family
    let crossed: HwRevision = "g19 t1.g29".parse().unwrap();
    assert!(crossed.validate(&["G19", "G29"]).is_err());

    // Unknown family
    let unknown: HwRevision = "g30 t1.g30".parse().unwrap();
    assert!(unknown.validate(&["G19", "G29", "G30"]).is_err());
}
