//! Executable lookup
//!
//! Programs are resolved against the `PATH` of the environment the process
//! will run with, so a context that replaced its environment still finds
//! executables the way a shell would.

use std::path::{Path, PathBuf};

use crate::error::{HalError, HalResult};

/// Resolve `program` to the path that will be executed.
///
/// Names containing a path separator are taken relative to `cwd`. Bare names
/// are searched in `env_path` first and then in the host `PATH`.
pub fn resolve_program(program: &str, env_path: Option<&str>, cwd: &Path) -> HalResult<PathBuf> {
    if program.is_empty() {
        return Err(HalError::spawn_error(program, "empty command"));
    }

    if program.contains('/') || program.contains(std::path::MAIN_SEPARATOR) {
        let candidate = cwd.join(program);
        return if candidate.is_file() {
            Ok(candidate)
        } else {
            Err(HalError::spawn_error(
                program,
                &format!("no such file: {}", candidate.display()),
            ))
        };
    }

    if let Some(paths) = env_path {
        if let Ok(found) = which::which_in(program, Some(paths), cwd) {
            return Ok(found);
        }
    }

    which::which(program)
        .map_err(|e| HalError::spawn_error(program, &format!("command not found: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_bare_name_on_host_path() {
        let cwd = std::env::temp_dir();
        let resolved = resolve_program("sh", None, &cwd).unwrap();
        assert!(resolved.is_absolute());
    }

    #[test]
    fn relative_path_is_joined_to_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("tool.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();

        let resolved = resolve_program("./tool.sh", None, dir.path()).unwrap();
        assert_eq!(resolved, dir.path().join("./tool.sh"));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let cwd = std::env::temp_dir();
        let err = resolve_program("psh-definitely-not-installed", Some("/nonexistent"), &cwd)
            .unwrap_err();
        assert!(err.is_spawn());
        assert!(resolve_program("", None, &cwd).unwrap_err().is_spawn());
    }
}
