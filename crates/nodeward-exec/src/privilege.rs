//! Account lookup, ownership changes and run-as wrapping.
//!
//! Switching users happens through `su - <user> -c <command>` rather than by
//! dropping privileges inside the agent, so the target account gets its own
//! login environment.

use log::{debug, warn};
use nix::unistd::{Group, User};
use std::os::unix::fs::lchown;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Errors from identity resolution and ownership changes.
#[derive(Debug, Error)]
pub enum PrivilegeError {
    #[error("unknown user '{0}'")]
    UnknownUser(String),

    #[error("unknown group '{0}'")]
    UnknownGroup(String),

    #[error("account lookup for '{name}' failed: {source}")]
    Lookup {
        name: String,
        #[source]
        source: nix::Error,
    },

    #[error("changing ownership of {path}: {source}")]
    Chown {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("walking {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Resolve a user name to its uid.
///
/// Unknown users are an error; there is no fallback identity.
pub fn resolve_user(name: &str) -> Result<u32, PrivilegeError> {
    lookup_user(name).map(|user| user.uid.as_raw())
}

/// Resolve a group name to its gid.
pub fn resolve_group(name: &str) -> Result<u32, PrivilegeError> {
    match Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        Ok(None) => Err(PrivilegeError::UnknownGroup(name.to_string())),
        Err(source) => Err(PrivilegeError::Lookup {
            name: name.to_string(),
            source,
        }),
    }
}

fn lookup_user(name: &str) -> Result<User, PrivilegeError> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(PrivilegeError::UnknownUser(name.to_string())),
        Err(source) => Err(PrivilegeError::Lookup {
            name: name.to_string(),
            source,
        }),
    }
}

/// Give `path` (and with `recursive`, everything below it) to `user`.
///
/// `group` defaults to the user's primary group. The walk is not
/// transactional: on error, entries visited earlier keep their new owner.
/// Symlinks are re-owned themselves and never followed.
pub fn chown_tree(
    path: &Path,
    user: &str,
    group: Option<&str>,
    recursive: bool,
) -> Result<(), PrivilegeError> {
    let account = lookup_user(user)?;
    let uid = account.uid.as_raw();
    let gid = match group {
        Some(group) => resolve_group(group)?,
        None => account.gid.as_raw(),
    };

    let walker = WalkDir::new(path).max_depth(if recursive { usize::MAX } else { 0 });
    for entry in walker {
        let entry = entry.map_err(|source| PrivilegeError::Walk {
            path: path.to_path_buf(),
            source,
        })?;
        lchown(entry.path(), Some(uid), Some(gid)).map_err(|source| {
            warn!("chown {}:{} {} failed: {}", uid, gid, entry.path().display(), source);
            PrivilegeError::Chown {
                path: entry.path().to_path_buf(),
                source,
            }
        })?;
    }
    debug!("Changed ownership of {} to {}:{}", path.display(), uid, gid);
    Ok(())
}

/// Wrap `command_line` so it runs as `user` via `su`.
pub fn run_as(user: &str, command_line: &str) -> Vec<String> {
    vec![
        "su".to_string(),
        "-".to_string(),
        user.to_string(),
        "-c".to_string(),
        command_line.to_string(),
    ]
}

/// Whether the agent runs with an effective uid of 0.
pub fn is_root() -> bool {
    rustix::process::geteuid().is_root()
}
