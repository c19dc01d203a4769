//! Locating and launching the baton-do worker executable.

use std::env;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};

use crate::error::{BatonError, Result};
use crate::item::clean_path;

/// The fixed name of the worker executable.
pub const BATON_EXECUTABLE: &str = "baton-do";

/// Returns the cleaned path to the first occurrence of the baton-do
/// executable on the process search path.
pub fn find_baton() -> Result<PathBuf> {
    let search_path = env::var_os("PATH").unwrap_or_default();
    if search_path.is_empty() {
        return Err(BatonError::NotOnSearchPath(String::new()));
    }

    for dir in env::split_paths(&search_path) {
        let candidate = dir.join(BATON_EXECUTABLE);
        if is_executable(&candidate) {
            return Ok(clean_path(&candidate));
        }
    }

    Err(BatonError::NotOnSearchPath(
        search_path.to_string_lossy().into_owned(),
    ))
}

/// Resolve a path to an executable, searching the process search path
/// when given a bare name.
pub(crate) fn resolve_executable(path: &Path) -> Result<PathBuf> {
    if path.components().count() > 1 {
        if is_executable(path) {
            return Ok(clean_path(path));
        }
        return Err(BatonError::NotExecutable(path.to_owned()));
    }

    let search_path = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&search_path) {
        let candidate = dir.join(path);
        if is_executable(&candidate) {
            return Ok(clean_path(&candidate));
        }
    }

    Err(BatonError::NotExecutable(path.to_owned()))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Spawn the worker with piped stdio, in its own process group.
///
/// The process group keeps terminal signals (e.g. ^C) with the parent;
/// the worker is stopped explicitly by its supervisor.
pub(crate) fn spawn_worker<I, S>(
    executable: &Path,
    args: I,
) -> Result<(Child, ChildStdin, ChildStdout, ChildStderr)>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    use std::os::unix::process::CommandExt;

    let mut cmd = Command::new(executable);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = cmd.spawn().map_err(BatonError::Spawn)?;

    let stdin = take_pipe(child.stdin.take(), "stdin")?;
    let stdout = take_pipe(child.stdout.take(), "stdout")?;
    let stderr = take_pipe(child.stderr.take(), "stderr")?;

    Ok((child, stdin, stdout, stderr))
}

fn take_pipe<T>(pipe: Option<T>, name: &str) -> Result<T> {
    pipe.ok_or_else(|| BatonError::Spawn(io::Error::other(format!("{name} was not captured"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).expect("failed to create script");
        f.write_all(b"#!/bin/sh\nexit 0\n")
            .expect("failed to write script");
        drop(f);

        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn test_is_executable() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "runnable");
        assert!(is_executable(&script));

        let plain = tmp.path().join("plain");
        fs::write(&plain, "not a program").unwrap();
        assert!(!is_executable(&plain));

        assert!(!is_executable(&tmp.path().join("absent")));
        assert!(!is_executable(tmp.path()));
    }

    #[test]
    fn test_resolve_executable_by_path() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), BATON_EXECUTABLE);

        let resolved = resolve_executable(&script).unwrap();
        assert_eq!(resolved, clean_path(&script));

        let missing = tmp.path().join("no-such");
        assert!(matches!(
            resolve_executable(&missing),
            Err(BatonError::NotExecutable(_))
        ));
    }

    #[test]
    fn test_spawn_worker_pipes() {
        let (mut child, stdin, stdout, stderr) =
            spawn_worker(Path::new("/bin/cat"), Vec::<String>::new()).unwrap();

        drop(stdin);
        drop(stdout);
        drop(stderr);
        let status = child.wait().unwrap();
        assert!(status.success());
    }
}
