//! The target process: its arguments, environment, user, and the final exec.

use std::path::{Path, PathBuf};

use runf_common::constants::{DEFAULT_PATH, DEFAULT_TERM};
use runf_common::error::{Result, RunfError};
use serde::{Deserialize, Serialize};

/// Everything the init process needs to exec the target command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessArgs {
    /// Command and arguments; `args[0]` is resolved against `PATH`.
    pub args: Vec<String>,
    /// Full environment as `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// `root`, a user name, `uid`, or `uid:gid`.
    pub user: String,
    /// Absolute working directory inside the container.
    pub cwd: PathBuf,
}

impl ProcessArgs {
    /// Checks the command line and working directory.
    ///
    /// # Errors
    ///
    /// Returns [`RunfError::Config`] for an empty command, a relative
    /// working directory, or an environment entry without `=`.
    pub fn validate(&self) -> Result<()> {
        if self.args.first().is_none_or(String::is_empty) {
            return Err(RunfError::Config {
                message: "process has no command".into(),
            });
        }
        if !self.cwd.is_absolute() {
            return Err(RunfError::Config {
                message: format!("working directory {} is not absolute", self.cwd.display()),
            });
        }
        if let Some(entry) = self.env.iter().find(|e| !e.contains('=')) {
            return Err(RunfError::Config {
                message: format!("environment entry {entry:?} has no '='"),
            });
        }
        Ok(())
    }

    /// Looks up a variable in this process's environment.
    #[must_use]
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }
}

/// Builds the container environment: `PATH`, `HOSTNAME` and `TERM`, then
/// the caller's entries. A caller entry replaces a baseline entry with the
/// same key.
#[must_use]
pub fn container_environment(hostname: &str, overrides: &[String]) -> Vec<String> {
    let mut env = vec![
        format!("PATH={DEFAULT_PATH}"),
        format!("HOSTNAME={hostname}"),
        format!("TERM={DEFAULT_TERM}"),
    ];
    for entry in overrides {
        let key = entry.split_once('=').map_or(entry.as_str(), |(k, _)| k);
        env.retain(|existing| existing.split_once('=').is_none_or(|(k, _)| k != key));
        env.push(entry.clone());
    }
    env
}

/// Numeric credentials the target runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessUser {
    /// User ID inside the container.
    pub uid: u32,
    /// Group ID inside the container.
    pub gid: u32,
}

impl ProcessUser {
    /// Container root.
    pub const ROOT: Self = Self { uid: 0, gid: 0 };
}

/// Resolves a user specification against `passwd` file contents.
///
/// `root` and the empty string are uid 0. `uid` and `uid:gid` are numeric;
/// a bare uid takes its group from `passwd` when listed there, otherwise
/// gid equals uid. Anything else is looked up by login name.
///
/// # Errors
///
/// Returns [`RunfError::NotFound`] for an unknown name and
/// [`RunfError::Config`] for a malformed `uid:gid`.
pub fn resolve_user_in(user: &str, passwd: &str) -> Result<ProcessUser> {
    if user.is_empty() || user == "root" {
        return Ok(ProcessUser::ROOT);
    }
    if let Some((uid, gid)) = user.split_once(':') {
        let parse = |s: &str| {
            s.parse::<u32>().map_err(|_| RunfError::Config {
                message: format!("invalid user {user:?}"),
            })
        };
        return Ok(ProcessUser {
            uid: parse(uid)?,
            gid: parse(gid)?,
        });
    }

    let mut entries = passwd.lines().filter_map(|line| {
        let mut fields = line.split(':');
        let name = fields.next()?;
        let _password = fields.next()?;
        let uid = fields.next()?.parse::<u32>().ok()?;
        let gid = fields.next()?.parse::<u32>().ok()?;
        Some((name, uid, gid))
    });

    if let Ok(uid) = user.parse::<u32>() {
        let gid = entries
            .find(|(_, u, _)| *u == uid)
            .map_or(uid, |(_, _, g)| g);
        return Ok(ProcessUser { uid, gid });
    }

    entries
        .find(|(name, _, _)| *name == user)
        .map(|(_, uid, gid)| ProcessUser { uid, gid })
        .ok_or_else(|| RunfError::NotFound {
            kind: "user",
            id: user.to_owned(),
        })
}

/// Resolves a user specification against the current root's `/etc/passwd`.
///
/// A missing `/etc/passwd` is treated as empty.
///
/// # Errors
///
/// See [`resolve_user_in`].
pub fn resolve_user(user: &str) -> Result<ProcessUser> {
    let passwd = match std::fs::read_to_string("/etc/passwd") {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(RunfError::io("/etc/passwd", e)),
    };
    resolve_user_in(user, &passwd)
}

/// Resolves a command against a `PATH` value.
///
/// Commands containing `/` are returned unchanged.
#[must_use]
pub fn find_executable(command: &str, path: &str) -> Option<PathBuf> {
    if command.contains('/') {
        return Some(PathBuf::from(command));
    }
    path.split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(command))
        .find(|candidate| candidate.is_file())
}

/// Changes into the working directory and replaces the process image.
///
/// Only returns on failure.
///
/// # Errors
///
/// Returns an error if the directory or executable cannot be found, an
/// argument contains a NUL byte, or `execve(2)` fails.
#[cfg(target_os = "linux")]
pub fn exec(process: &ProcessArgs) -> Result<std::convert::Infallible> {
    use std::ffi::CString;

    nix::unistd::chdir(&process.cwd)
        .map_err(|e| RunfError::syscall(format!("chdir {}", process.cwd.display()), e))?;

    let command = process.args.first().map_or("", String::as_str);
    let path = process.env_var("PATH").unwrap_or(DEFAULT_PATH);
    let program = find_executable(command, path).ok_or_else(|| RunfError::NotFound {
        kind: "executable",
        id: command.to_owned(),
    })?;

    let to_cstring = |s: &str| {
        CString::new(s).map_err(|_| RunfError::Config {
            message: format!("NUL byte in {s:?}"),
        })
    };
    let program = to_cstring(&program.to_string_lossy())?;
    let args = process
        .args
        .iter()
        .map(|a| to_cstring(a.as_str()))
        .collect::<Result<Vec<_>>>()?;
    let env = process
        .env
        .iter()
        .map(|e| to_cstring(e.as_str()))
        .collect::<Result<Vec<_>>>()?;

    tracing::debug!(program = ?program, "executing target");
    nix::unistd::execve(&program, &args, &env)
        .map_err(|e| RunfError::syscall(format!("execve {command}"), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/sh
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
app:x:1000:1001::/home/app:/bin/sh
";

    fn args(cmd: &[&str]) -> ProcessArgs {
        ProcessArgs {
            args: cmd.iter().map(|s| (*s).to_owned()).collect(),
            env: Vec::new(),
            user: "root".into(),
            cwd: PathBuf::from("/"),
        }
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(args(&[]).validate().is_err());
        assert!(args(&[""]).validate().is_err());
        assert!(args(&["/bin/echo", "hi"]).validate().is_ok());
    }

    #[test]
    fn relative_cwd_is_rejected() {
        let mut process = args(&["true"]);
        process.cwd = PathBuf::from("tmp");
        assert!(process.validate().is_err());
    }

    #[test]
    fn baseline_environment_is_present() {
        let env = container_environment("demo", &[]);
        assert!(env.iter().any(|e| e.starts_with("PATH=/usr/local/sbin")));
        assert!(env.contains(&"HOSTNAME=demo".to_owned()));
        assert!(env.contains(&"TERM=xterm".to_owned()));
    }

    #[test]
    fn caller_entries_override_baseline_keys() {
        let env = container_environment("demo", &["TERM=dumb".into(), "FOO=bar".into()]);
        assert_eq!(env.iter().filter(|e| e.starts_with("TERM=")).count(), 1);
        assert!(env.contains(&"TERM=dumb".to_owned()));
        assert!(env.contains(&"FOO=bar".to_owned()));
    }

    #[test]
    fn users_resolve_by_name_and_number() {
        assert_eq!(resolve_user_in("root", PASSWD).unwrap(), ProcessUser::ROOT);
        assert_eq!(
            resolve_user_in("app", PASSWD).unwrap(),
            ProcessUser { uid: 1000, gid: 1001 }
        );
        assert_eq!(
            resolve_user_in("1000", PASSWD).unwrap(),
            ProcessUser { uid: 1000, gid: 1001 }
        );
        assert_eq!(
            resolve_user_in("42", PASSWD).unwrap(),
            ProcessUser { uid: 42, gid: 42 }
        );
        assert_eq!(
            resolve_user_in("5:6", PASSWD).unwrap(),
            ProcessUser { uid: 5, gid: 6 }
        );
    }

    #[test]
    fn unknown_user_is_not_found() {
        let err = resolve_user_in("nobody", PASSWD).unwrap_err();
        assert!(matches!(err, RunfError::NotFound { kind: "user", .. }));
        assert!(resolve_user_in("1:x", PASSWD).is_err());
    }

    #[test]
    fn commands_with_slash_are_not_searched() {
        assert_eq!(find_executable("/bin/echo", ""), Some(PathBuf::from("/bin/echo")));
    }

    #[test]
    fn path_search_finds_first_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tool"), "").unwrap();
        let path = format!("/nonexistent:{}", dir.path().display());
        assert_eq!(find_executable("tool", &path), Some(dir.path().join("tool")));
        assert_eq!(find_executable("missing", &path), None);
    }
}
