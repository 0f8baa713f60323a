//! Passphrase Prequalification.
//!
//! Before committing to a long backup, each destination's repository is
//! probed with `borg list`, stdin closed. If that fails because the
//! passphrase is wrong, the operator is asked for the real one now, instead
//! of by N processes at once halfway through the run.
//!
//! When no passphrase configuration exists at all, the probe runs with a
//! random passphrase so an encrypted repository reports "incorrect" rather
//! than trying to prompt.

use std::collections::HashMap;
use std::io;
use std::process::{Command, Stdio};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use tracing::{debug, warn};

use crate::config::ArchiverSettings;
use crate::location::Location;
use crate::operator::Operator;

/// Passphrases collected during prequalification, by destination.
pub type SecretMap = HashMap<Location, String>;

/// Environment variables through which borg can already obtain a passphrase.
pub const PASSPHRASE_SOURCES: [&str; 3] = ["BORG_PASSPHRASE", "BORG_PASSCOMMAND", "BORG_NEWPASSPHRASE"];

/// Whether the last line of `borg list` stderr reports a wrong passphrase.
/// The exact wording differs between versions; the ends do not.
pub fn is_wrong_passphrase(stderr: &str) -> bool {
    let last = stderr.trim_end_matches('\n').rsplit('\n').next().unwrap_or("");
    last.starts_with("passphrase supplied") && last.ends_with("is incorrect.")
}

/// 16 random bytes, base64 encoded.
pub fn random_passphrase() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Probe every destination and collect the passphrases that will be needed.
/// Skipped entirely when nobody could answer.
pub fn prequalify(settings: &ArchiverSettings, destinations: &[Location], operator: &mut dyn Operator) -> SecretMap {
    let mut secrets = SecretMap::new();
    if !operator.is_interactive() {
        return secrets;
    }
    let throwaway = PASSPHRASE_SOURCES
        .iter()
        .all(|key| std::env::var_os(key).is_none())
        .then(random_passphrase);

    let mut by_repo: HashMap<Location, String> = HashMap::new();
    for dest in destinations {
        let repo = dest.repository();
        if let Some(secret) = by_repo.get(&repo) {
            secrets.insert(dest.clone(), secret.clone());
            continue;
        }
        let stderr = match probe(settings, &repo, throwaway.as_deref()) {
            Ok(Some(stderr)) => stderr,
            Ok(None) => continue,
            Err(e) => {
                // The real run will report this properly.
                debug!(repo = %repo, "probe did not run: {e}");
                continue;
            }
        };
        if !is_wrong_passphrase(&stderr) {
            debug!(repo = %repo, "probe failed, ignoring: {}", stderr.trim_end());
            continue;
        }
        match operator.ask_secret(None, &format!("Enter passphrase for key {repo}: ")) {
            Ok(Some(secret)) => {
                by_repo.insert(repo, secret.clone());
                secrets.insert(dest.clone(), secret);
            }
            Ok(None) => {}
            Err(e) => warn!("failed to read passphrase: {e}"),
        }
    }
    secrets
}

/// Run `borg list <repo>` without input. Returns its stderr if it failed.
fn probe(settings: &ArchiverSettings, repo: &Location, passphrase: Option<&str>) -> io::Result<Option<String>> {
    let mut cmd = Command::new(&settings.program);
    cmd.arg("list")
        .arg(repo.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    if let Some(passphrase) = passphrase {
        cmd.env(&settings.passphrase_env, passphrase);
    }
    let output = cmd.output()?;
    if output.status.success() {
        Ok(None)
    } else {
        Ok(Some(String::from_utf8_lossy(&output.stderr).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_wrong_passphrase() {
        assert!(is_wrong_passphrase(
            "Some warning\npassphrase supplied in BORG_PASSPHRASE, by BORG_PASSCOMMAND or via BORG_PASSPHRASE_FD is incorrect.\n"
        ));
        assert!(is_wrong_passphrase("passphrase supplied in BORG_PASSPHRASE is incorrect."));
        assert!(!is_wrong_passphrase("Repository /srv/repo does not exist.\n"));
        assert!(!is_wrong_passphrase(
            "passphrase supplied in BORG_PASSPHRASE is incorrect.\nConnection closed by remote host\n"
        ));
        assert!(!is_wrong_passphrase(""));
    }

    #[test]
    fn random_passphrases_differ() {
        let a = random_passphrase();
        let b = random_passphrase();
        assert_eq!(a.len(), 24);
        assert_ne!(a, b);
    }
}
