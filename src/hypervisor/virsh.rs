//! libvirt domain driven through the `virsh` command-line client.
//!
//! Each [`Domain`] call maps to one `virsh` invocation. Descriptors (snapshot
//! XML, device XML) are handed over in temporary files. A non-zero exit is
//! turned into a [`HypervisorError`] by matching libvirt's message text, then
//! reported on the domain's [`ErrorChannel`] before being returned.
//!
//! ```text
//! create_snapshot  ->  virsh snapshot-create DOM --xmlfile F --no-metadata --atomic --disk-only
//! block_commit     ->  virsh blockcommit DOM TARGET --active --shallow
//! block_job_info   ->  virsh blockjob DOM TARGET --info --bytes
//! block_job_pivot  ->  virsh blockjob DOM TARGET --pivot
//! update_device    ->  virsh update-device DOM F --current
//! ```

use std::io::Write;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use tracing::debug;

use super::{BlockJobInfo, Domain, ErrorChannel, ErrorCode, HypervisorError, SnapshotFlags, SnapshotMode};
use crate::config::HypervisorSettings;

pub struct VirshDomain {
    virsh: String,
    uri: Option<String>,
    name: String,
    errors: ErrorChannel,
}

impl VirshDomain {
    /// Look up `name`, failing with [`ErrorCode::NoDomain`] if it does not exist.
    pub fn lookup(settings: &HypervisorSettings, name: &str) -> Result<Self, HypervisorError> {
        let domain = Self {
            virsh: settings.virsh.clone(),
            uri: settings.uri.clone(),
            name: name.to_string(),
            errors: ErrorChannel::default(),
        };
        domain.run(&["domuuid", name])?;
        Ok(domain)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.virsh);
        if let Some(uri) = &self.uri {
            cmd.arg("-c").arg(uri);
        }
        // Own process group: a Ctrl-C at the terminal must not kill the
        // commit and pivot calls that run after it.
        cmd.stdin(Stdio::null()).process_group(0);
        cmd
    }

    fn run(&self, args: &[&str]) -> Result<String, HypervisorError> {
        debug!(domain = %self.name, ?args, "virsh");
        let output = self.command().args(args).output().map_err(|e| {
            let err = HypervisorError::new(ErrorCode::Internal, format!("failed to run {}: {e}", self.virsh));
            self.errors.report(&err);
            err
        })?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let err = classify(&String::from_utf8_lossy(&output.stderr));
        self.errors.report(&err);
        Err(err)
    }

    /// Run with an XML document written to a temporary file, whose path is
    /// substituted for the `{}` placeholder argument.
    fn run_with_file(&self, args: &[&str], contents: &str) -> Result<String, HypervisorError> {
        let io_err = |e: std::io::Error| {
            let err = HypervisorError::new(ErrorCode::Internal, format!("temporary descriptor: {e}"));
            self.errors.report(&err);
            err
        };
        let mut file = tempfile::Builder::new()
            .prefix("backup-vm-")
            .suffix(".xml")
            .tempfile()
            .map_err(io_err)?;
        file.write_all(contents.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        let path = file.path().to_string_lossy().into_owned();
        let args: Vec<&str> = args
            .iter()
            .map(|a| if *a == "{}" { path.as_str() } else { *a })
            .collect();
        self.run(&args)
    }
}

impl Domain for VirshDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    fn xml_desc(&self) -> Result<String, HypervisorError> {
        self.run(&["dumpxml", &self.name])
    }

    fn is_active(&self) -> Result<bool, HypervisorError> {
        let state = self.run(&["domstate", &self.name])?;
        Ok(state.trim() != "shut off")
    }

    fn fs_freeze(&self) -> Result<(), HypervisorError> {
        self.run(&["domfsfreeze", &self.name]).map(drop)
    }

    fn fs_thaw(&self) -> Result<(), HypervisorError> {
        self.run(&["domfsthaw", &self.name]).map(drop)
    }

    fn create_snapshot(&self, descriptor: &str, flags: SnapshotFlags) -> Result<(), HypervisorError> {
        let mut args = vec!["snapshot-create", self.name.as_str(), "--xmlfile", "{}"];
        if flags.no_metadata {
            args.push("--no-metadata");
        }
        if flags.atomic {
            args.push("--atomic");
        }
        args.push(match flags.mode {
            SnapshotMode::DiskOnly => "--disk-only",
            SnapshotMode::Live => "--live",
        });
        self.run_with_file(&args, descriptor).map(drop)
    }

    fn block_commit(&self, target: &str) -> Result<(), HypervisorError> {
        self.run(&["blockcommit", &self.name, target, "--active", "--shallow"])
            .map(drop)
    }

    fn block_job_info(&self, target: &str) -> Result<Option<BlockJobInfo>, HypervisorError> {
        let output = self.run(&["blockjob", &self.name, target, "--info", "--bytes"])?;
        Ok(parse_block_job(&output))
    }

    fn block_job_pivot(&self, target: &str) -> Result<(), HypervisorError> {
        self.run(&["blockjob", &self.name, target, "--pivot"]).map(drop)
    }

    fn update_device(&self, device_xml: &str) -> Result<(), HypervisorError> {
        self.run_with_file(&["update-device", &self.name, "{}", "--current"], device_xml)
            .map(drop)
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Parse `virsh blockjob --info --bytes` output, e.g.
/// `Active Block Commit: [ 1048576 of 10485760 bytes]`.
/// Returns `None` for `No current block job for vda`.
pub fn parse_block_job(output: &str) -> Option<BlockJobInfo> {
    let line = output.lines().find(|l| l.contains('['))?;
    let inner = &line[line.find('[')? + 1..line.rfind(']')?];
    let mut words = inner.split_whitespace();
    let cur = words.next()?.parse().ok()?;
    if words.next()? != "of" {
        return None;
    }
    let end = words.next()?.parse().ok()?;
    Some(BlockJobInfo { cur, end })
}

/// Map virsh's error text onto a libvirt error code.
pub fn classify(stderr: &str) -> HypervisorError {
    let message = stderr
        .lines()
        .map(|l| l.trim().trim_start_matches("error: ").trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(": ");
    let lower = message.to_lowercase();
    let code = if lower.contains("requested operation is not valid") {
        ErrorCode::OperationInvalid
    } else if lower.contains("argument unsupported") || lower.contains("unsupported flags") {
        ErrorCode::ArgumentUnsupported
    } else if lower.contains("guest agent is not responding") || lower.contains("guest agent is not connected") {
        ErrorCode::AgentUnresponsive
    } else if lower.contains("domain not found") || lower.contains("failed to get domain") {
        ErrorCode::NoDomain
    } else if lower.contains("operation failed") {
        ErrorCode::OperationFailed
    } else {
        ErrorCode::Internal
    };
    HypervisorError::new(code, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_job_in_progress() {
        let out = "Active Block Commit: [ 1048576 of 10485760 bytes]\n";
        assert_eq!(parse_block_job(out), Some(BlockJobInfo { cur: 1048576, end: 10485760 }));
    }

    #[test]
    fn no_block_job() {
        assert_eq!(parse_block_job("No current block job for vda\n"), None);
        assert_eq!(parse_block_job(""), None);
    }

    #[test]
    fn classify_known_messages() {
        let e = classify("error: Requested operation is not valid: domain is not running\n");
        assert_eq!(e.code, ErrorCode::OperationInvalid);
        assert_eq!(e.message, "Requested operation is not valid: domain is not running");

        let agent = classify("error: Unable to freeze filesystems\nerror: Guest agent is not responding: QEMU guest agent is not connected\n");
        assert_eq!(agent.code, ErrorCode::AgentUnresponsive);

        let missing = classify("error: failed to get domain 'nope'\n");
        assert_eq!(missing.code, ErrorCode::NoDomain);

        assert_eq!(classify("error: something odd\n").code, ErrorCode::Internal);
    }
}
