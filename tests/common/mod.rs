//! Test fixtures: scripted stand-ins for the baton-do executable.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tempfile::TempDir;

/// A response envelope carrying an empty list result.
pub const OK_EMPTY_LIST: &str =
    r#"{"operation":"list","arguments":{},"target":{},"result":{"multiple":[]}}"#;

/// Write an executable baton-do stand-in into `dir` and return its path.
/// The body runs under `/bin/sh`.
pub fn write_baton_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("baton-do");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write baton-do script");

    let mut perms = fs::metadata(&path)
        .expect("failed to stat baton-do script")
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("failed to chmod baton-do script");

    path
}

/// The standard stand-in body: answers every request with an empty list
/// result and exits on EOF.
pub fn responder_body() -> String {
    format!(
        "while IFS= read -r line; do\n  printf '%s\\n' '{OK_EMPTY_LIST}'\ndone"
    )
}

static FIXTURE_DIR: OnceLock<TempDir> = OnceLock::new();

/// Put a directory containing the standard stand-in at the front of the
/// process search path, once per test binary. Call this before anything
/// that discovers baton-do.
pub fn install_baton_on_path() {
    FIXTURE_DIR.get_or_init(|| {
        batonio::logging::init(batonio::logging::Level::INFO);

        let dir = tempfile::tempdir().expect("failed to create fixture dir");
        write_baton_script(dir.path(), &responder_body());

        let old = std::env::var_os("PATH").unwrap_or_default();
        let mut paths = vec![dir.path().to_path_buf()];
        paths.extend(std::env::split_paths(&old));
        let joined = std::env::join_paths(paths).expect("failed to join PATH");

        // Runs exactly once, before any test thread reads the
        // environment.
        unsafe { std::env::set_var("PATH", &joined) };

        dir
    });
}
