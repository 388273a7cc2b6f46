//! Packaging tool protocol.
//!
//! The tool prints one status per line while it works:
//!
//! ```text
//! status: starting
//! status: unpacking 3/12
//! status: spacecalculation
//! package: com.example.mail
//! ```
//!
//! and reports the result through its exit code. Both are normalized here
//! into [`OperationStatus`] values relayed under the command's ticket.

use std::{os::unix::process::ExitStatusExt, process::ExitStatus, str::FromStr};

use serde::Serialize;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum InstallPhase {
    Starting,
    Unpacking,
    Verifying,
    Installing,
    SpaceCalculation,
    Removing,
}

/// Failure codes surfaced to requesters. The string forms are part of the
/// external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCode {
    InternalError,
    InvalidArgs,
    CreateTmpFailed,
    NotEnoughTempSpace,
    NotEnoughInstallSpace,
    PackagefileNotFound,
    PackagefileCorrupt,
    VerifyFailed,
    IpkgInstallFailed,
    IpkgRemoveFailed,
}

/// Status relayed under a ticket. `Success` and `Failed` are terminal;
/// every ticketed command relays exactly one of them unless it is
/// interrupted by brick mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "camelCase")]
pub enum OperationStatus {
    Queued,
    Progress {
        phase: InstallPhase,
        detail: Option<String>,
    },
    Success,
    Failed(FailureCode),
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Success | OperationStatus::Failed(_))
    }

    pub fn progress(phase: InstallPhase) -> Self {
        OperationStatus::Progress {
            phase,
            detail: None,
        }
    }
}

/// One parsed line of tool output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolLine {
    Status {
        phase: InstallPhase,
        detail: Option<String>,
    },
    /// Id of the package the tool installed
    Package(String),
    Other(String),
}

pub fn parse_line(line: &str) -> ProtocolLine {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix("status:") {
        let mut parts = rest.trim().splitn(2, char::is_whitespace);
        let word = parts.next().unwrap_or_default();
        if let Ok(phase) = InstallPhase::from_str(word) {
            let detail = parts
                .next()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string);
            return ProtocolLine::Status { phase, detail };
        }
    } else if let Some(rest) = trimmed.strip_prefix("package:") {
        let id = rest.trim();
        if !id.is_empty() {
            return ProtocolLine::Package(id.to_string());
        }
    }
    ProtocolLine::Other(trimmed.to_string())
}

/// How a tool process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum ExitInfo {
    Exited(i32),
    Signaled(i32),
    SpawnFailed(String),
    TimedOut,
    /// The command was settled without starting the tool
    NotRun,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        matches!(self, ExitInfo::Exited(0))
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitInfo::Exited(code),
            (None, Some(signal)) => ExitInfo::Signaled(signal),
            (None, None) => ExitInfo::Exited(-1),
        }
    }
}

/// Install tool exit code table
pub fn install_failure(exit: &ExitInfo) -> Option<FailureCode> {
    let code = match exit {
        ExitInfo::Exited(0) => return None,
        ExitInfo::Exited(code) => *code,
        _ => return Some(FailureCode::InternalError),
    };
    Some(match code {
        2 => FailureCode::InvalidArgs,
        3 => FailureCode::CreateTmpFailed,
        4 => FailureCode::NotEnoughTempSpace,
        5 => FailureCode::NotEnoughInstallSpace,
        6 => FailureCode::PackagefileNotFound,
        7 => FailureCode::PackagefileCorrupt,
        8 => FailureCode::VerifyFailed,
        9 => FailureCode::IpkgInstallFailed,
        _ => FailureCode::InternalError,
    })
}

pub fn remove_failure(exit: &ExitInfo) -> Option<FailureCode> {
    if exit.success() {
        None
    } else {
        Some(FailureCode::IpkgRemoveFailed)
    }
}

/// Package id from an ipk file name (`<id>_<version>_<arch>.ipk`), or the
/// bare file stem for other names.
pub fn package_id_from_target(target: &std::path::Path) -> Option<String> {
    let stem = target.file_stem()?.to_str()?;
    let id = stem.split('_').next().unwrap_or(stem);
    (!id.is_empty()).then(|| id.to_string())
}
