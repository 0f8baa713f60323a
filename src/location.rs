//! Archive destinations (`repository::archive` locators).
//!
//! Accepted forms, matching what borg itself accepts:
//!
//! ```text
//! ssh://[user@]host[:port]/abs/path[::archive]
//! file://path[::archive]
//! [[user@]host:]path[::archive]          (scp style)
//! ::archive                               (repository from $BORG_REPO)
//! ```
//!
//! A `Location` renders back to a canonical string, and equality and hashing
//! go through that string: two destinations that normalise to the same text
//! are the same destination. That is what keys the passphrase cache and the
//! per-process bookkeeping.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    File,
    Ssh,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Location: parse failed: {0}")]
pub struct LocationError(pub String);

#[derive(Debug, Clone)]
pub struct Location {
    /// Text as given by the operator; used as the tag on relayed output.
    orig: String,
    proto: Proto,
    user: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    path: String,
    archive: Option<String>,
    /// Arguments passed straight through to the archiver for this destination.
    pub extra_args: Vec<String>,
}

impl Location {
    /// Parse `text`, resolving `::archive` forms against `$BORG_REPO`.
    pub fn parse(text: &str) -> Result<Self, LocationError> {
        Self::parse_with_repo(text, std::env::var("BORG_REPO").ok().as_deref())
    }

    /// Parse `text`, resolving `::archive` forms against `default_repo`.
    pub fn parse_with_repo(text: &str, default_repo: Option<&str>) -> Result<Self, LocationError> {
        let fail = || LocationError(text.to_string());
        if let Some(mut loc) = parse_repo_and_archive(text) {
            loc.orig = text.to_string();
            return Ok(loc);
        }
        // "::archive" or "::" alone: the repository comes from the environment.
        let archive = match text.strip_prefix("::") {
            Some("") => None,
            Some(name) if !name.contains('/') => Some(name.to_string()),
            _ => return Err(fail()),
        };
        let repo = default_repo.ok_or_else(fail)?;
        let mut loc = parse_repo_and_archive(repo).ok_or_else(fail)?;
        loc.orig = text.to_string();
        loc.archive = archive;
        Ok(loc)
    }

    /// A location that names an archive inside a reachable repository, i.e.
    /// something `create` can write to.
    pub fn is_archive(&self) -> bool {
        self.archive.is_some() && (self.proto == Proto::File || self.host.is_some())
    }

    pub fn original(&self) -> &str {
        &self.orig
    }

    pub fn proto(&self) -> Proto {
        self.proto
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn archive(&self) -> Option<&str> {
        self.archive.as_deref()
    }

    /// The same location without its archive name.
    pub fn repository(&self) -> Location {
        let mut repo = self.clone();
        repo.archive = None;
        repo.extra_args.clear();
        repo
    }

    /// Make a relative local repository path absolute against `cwd`. The
    /// archiver runs from a staging directory, so relative paths would
    /// otherwise point somewhere else.
    pub fn canonicalize_path(&mut self, cwd: &Path) {
        if self.proto == Proto::File && !self.path.starts_with('/') {
            let joined = cwd.join(&self.path);
            self.path = normpath(&joined.to_string_lossy());
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proto {
            Proto::File => f.write_str(&self.path)?,
            Proto::Ssh => {
                let user = self.user.as_deref().map(|u| format!("{u}@")).unwrap_or_default();
                let host = self.host.as_deref().unwrap_or_default();
                match self.port {
                    Some(port) if self.path.starts_with('/') => {
                        write!(f, "ssh://{user}{host}:{port}{}", self.path)?
                    }
                    Some(port) => write!(f, "ssh://{user}{host}:{port}/./{}", self.path)?,
                    None => write!(f, "{user}{host}:{}", self.path)?,
                }
            }
        }
        if let Some(archive) = &self.archive {
            write!(f, "::{archive}")?;
        }
        Ok(())
    }
}

impl PartialEq for Location {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for Location {}

impl Hash for Location {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_string().hash(state);
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_repo_and_archive(text: &str) -> Option<Location> {
    // A bracketed IPv6 host may itself contain "::".
    let search_from = text.find(']').map(|i| i + 1).unwrap_or(0);
    let split = text[search_from..]
        .find("::")
        .map(|i| (&text[..search_from + i], &text[search_from + i + 2..]));
    let (repo, archive) = match split {
        Some((repo, archive)) => {
            if archive.is_empty() || archive.contains('/') {
                return None;
            }
            (repo, Some(archive.to_string()))
        }
        None => (text, None),
    };
    if repo.is_empty() {
        return None;
    }

    let mut loc = if let Some(rest) = repo.strip_prefix("ssh://") {
        parse_ssh(rest)?
    } else if let Some(rest) = repo.strip_prefix("file://") {
        // The path must contain a slash somewhere.
        if !rest.contains('/') {
            return None;
        }
        bare(Proto::File, normpath_special(rest))
    } else {
        parse_scp(repo)?
    };
    loc.archive = archive;
    Some(loc)
}

fn bare(proto: Proto, path: String) -> Location {
    Location {
        orig: String::new(),
        proto,
        user: None,
        host: None,
        port: None,
        path,
        archive: None,
        extra_args: Vec::new(),
    }
}

fn split_user(text: &str) -> (Option<String>, &str) {
    match text.split_once('@') {
        Some((user, rest)) if !user.is_empty() && !user.contains([':', '/']) => {
            (Some(user.to_string()), rest)
        }
        _ => (None, text),
    }
}

/// Split a host (plain or `[v6]`) from the front of `text`.
fn split_host(text: &str) -> Option<(&str, &str)> {
    if text.starts_with('[') {
        let end = text.find(']')?;
        let host = &text[..=end];
        let inner = &host[1..host.len() - 1];
        if inner.is_empty() || !inner.chars().all(|c| c.is_ascii_hexdigit() || c == ':' || c == '.') {
            return None;
        }
        Some((host, &text[end + 1..]))
    } else {
        let end = text.find([':', '/']).unwrap_or(text.len());
        if end == 0 {
            return None;
        }
        Some((&text[..end], &text[end..]))
    }
}

fn parse_ssh(text: &str) -> Option<Location> {
    let (user, rest) = split_user(text);
    let (host, rest) = split_host(rest)?;
    let (port, path) = match rest.strip_prefix(':') {
        Some(after) => {
            let digits = after.find('/').unwrap_or(after.len());
            let port = after[..digits].parse::<u16>().ok()?;
            (Some(port), &after[digits..])
        }
        None => (None, rest),
    };
    if !path.starts_with('/') || path.len() < 2 {
        return None;
    }
    let mut loc = bare(Proto::Ssh, normpath_special(path));
    loc.user = user;
    loc.host = Some(host.to_string());
    loc.port = port;
    Some(loc)
}

fn parse_scp(text: &str) -> Option<Location> {
    let valid_path = |p: &str| !p.is_empty() && !p.starts_with(':') && !p.starts_with("//") && !p.starts_with("ssh://");

    let (user, rest) = split_user(text);
    if let Some((host, after)) = split_host(rest) {
        if let Some(path) = after.strip_prefix(':') {
            if valid_path(path) {
                let mut loc = bare(Proto::Ssh, normpath_special(path));
                loc.user = user;
                loc.host = Some(host.to_string());
                return Some(loc);
            }
        }
    }

    if !valid_path(text) {
        return None;
    }
    Some(bare(Proto::File, normpath_special(text)))
}

/// Normalise a path the way `os.path.normpath` does, but keep a leading
/// `/./`, which borg uses to mark a path relative to the remote home.
fn normpath_special(path: &str) -> String {
    if path.starts_with("/./") {
        format!("/.{}", normpath(path))
    } else {
        normpath(path)
    }
}

fn normpath(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(text: &str) -> Location {
        Location::parse_with_repo(text, None).expect("location should parse")
    }

    #[test]
    fn scp_style_with_user_and_archive() {
        let l = loc("backup@nas:/srv/borg::vm-{now}");
        assert_eq!(l.proto(), Proto::Ssh);
        assert_eq!(l.user(), Some("backup"));
        assert_eq!(l.host(), Some("nas"));
        assert_eq!(l.path(), "/srv/borg");
        assert_eq!(l.archive(), Some("vm-{now}"));
        assert!(l.is_archive());
        assert_eq!(l.to_string(), "backup@nas:/srv/borg::vm-{now}");
    }

    #[test]
    fn ssh_url_with_port() {
        let l = loc("ssh://me@host.example:2222/var/borg/../repo::daily");
        assert_eq!(l.port(), Some(2222));
        assert_eq!(l.path(), "/var/repo");
        assert_eq!(l.to_string(), "ssh://me@host.example:2222/var/repo::daily");
    }

    #[test]
    fn ssh_url_keeps_relative_marker() {
        let l = loc("ssh://host:22/./repo::a");
        assert_eq!(l.path(), "/./repo");
    }

    #[test]
    fn local_paths() {
        let l = loc("/mnt/backup//repo/::weekly");
        assert_eq!(l.proto(), Proto::File);
        assert_eq!(l.to_string(), "/mnt/backup/repo::weekly");

        let f = loc("file:///mnt/backup::x");
        assert_eq!(f.proto(), Proto::File);
        assert_eq!(f.path(), "/mnt/backup");
    }

    #[test]
    fn ipv6_host() {
        let l = loc("[fe80::1]:/repo::a");
        assert_eq!(l.host(), Some("[fe80::1]"));
        assert_eq!(l.path(), "/repo");
    }

    #[test]
    fn repository_without_archive_is_not_an_archive() {
        let l = loc("nas:/srv/borg");
        assert!(!l.is_archive());
        assert_eq!(loc("nas:/srv/borg::a").repository(), l);
    }

    #[test]
    fn plain_words_are_relative_paths_without_archive() {
        // Disk names like "sda" parse, but never as an archive destination.
        let l = loc("sda");
        assert_eq!(l.proto(), Proto::File);
        assert!(!l.is_archive());
    }

    #[test]
    fn archive_from_env_repo() {
        let l = Location::parse_with_repo("::nightly", Some("nas:/srv/borg")).unwrap();
        assert_eq!(l.to_string(), "nas:/srv/borg::nightly");
        assert_eq!(l.original(), "::nightly");
        assert!(Location::parse_with_repo("::nightly", None).is_err());
    }

    #[test]
    fn rejects_malformed() {
        assert!(Location::parse_with_repo("repo::", None).is_err());
        assert!(Location::parse_with_repo("repo::a/b", None).is_err());
        assert!(Location::parse_with_repo("ssh://host/", None).is_err());
        assert!(Location::parse_with_repo("ssh://host:notaport/x", None).is_err());
    }

    #[test]
    fn canonicalize_relative_file_path() {
        let mut l = loc("backups/repo::a");
        l.canonicalize_path(Path::new("/home/op"));
        assert_eq!(l.to_string(), "/home/op/backups/repo::a");

        let mut remote = loc("nas:repo::a");
        remote.canonicalize_path(Path::new("/home/op"));
        assert_eq!(remote.to_string(), "nas:repo::a");
    }

    #[test]
    fn equality_uses_normalised_form() {
        let a = loc("/srv//borg/./x/..::a");
        let b = loc("/srv/borg::a");
        assert_eq!(a, b);
        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert_ne!(loc("/srv/borg::a"), loc("/srv/borg::b"));
    }

    #[test]
    fn normpath_cases() {
        assert_eq!(normpath("/a/./b/../c/"), "/a/c");
        assert_eq!(normpath("../x"), "../x");
        assert_eq!(normpath("/.."), "/");
        assert_eq!(normpath("a/.."), ".");
    }
}
