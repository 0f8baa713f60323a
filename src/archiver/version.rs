//! Archiver version query and protocol selection.

use std::fmt;
use std::process::{Command, Stdio};

use anyhow::{Context, bail};

/// How the supervisor talks to archiver processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// `--log-json` output decoded from a pseudo terminal.
    Structured,
    /// Processes inherit the terminal; no decoding, no progress.
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// First release with JSON logging.
pub const STRUCTURED_SINCE: Version = Version {
    major: 1,
    minor: 1,
    patch: 0,
};

impl Version {
    /// Parse `--version` output such as `borg 1.2.4` or `borg-linux64 1.1.0b3`.
    /// Pre-release suffixes are ignored.
    pub fn parse(output: &str) -> Option<Self> {
        let token = output.split_whitespace().nth(1)?;
        let mut parts = token.split('.').map(leading_number);
        let major = parts.next()??;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Some(Self { major, minor, patch })
    }

    pub fn protocol(self) -> Protocol {
        if self < STRUCTURED_SINCE {
            Protocol::Legacy
        } else {
            Protocol::Structured
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn leading_number(part: &str) -> Option<u32> {
    let end = part.find(|c: char| !c.is_ascii_digit()).unwrap_or(part.len());
    part[..end].parse().ok()
}

/// Run `<program> --version`.
pub fn query(program: &str) -> anyhow::Result<Version> {
    let output = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to run {program} --version"))?;
    if !output.status.success() {
        bail!("{program} --version exited with {}", output.status);
    }
    let text = String::from_utf8_lossy(&output.stdout);
    Version::parse(&text).with_context(|| format!("unrecognised {program} version: {}", text.trim()))
}
