use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

static BUILD_CAIRN: OnceLock<Result<(), String>> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub command_line: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunResult {
    #[must_use]
    pub fn transcript(&self) -> String {
        format!(
            "$ {}\n[exit: {}]\n[stdout]\n{}[stderr]\n{}",
            self.command_line, self.exit_code, self.stdout, self.stderr
        )
    }
}

/// Run `cairn up` as an external process with stdin closed.
///
/// `NO_PAGER=1` is always set to keep output deterministic for assertions.
///
/// # Errors
///
/// Returns an error if building/running the `cairn` binary fails.
pub fn run_up(root: &Path, flags: &[&str]) -> Result<RunResult, String> {
    ensure_cairn_built()?;
    let bin = cairn_bin()?;

    let mut command = Command::new(bin);
    command.env("NO_PAGER", "1");
    command.env_remove("RUST_LOG");
    command.stdin(Stdio::null());
    command.arg("up");
    command.arg(root);
    command.args(flags);

    let mut command_parts = vec![
        "cairn".to_string(),
        "up".to_string(),
        root.display().to_string(),
    ];
    command_parts.extend(flags.iter().map(|flag| (*flag).to_string()));

    let output = command
        .output()
        .map_err(|error| format!("failed to run cairn up: {error}"))?;

    Ok(RunResult {
        command_line: command_parts.join(" "),
        exit_code: output.status.code().unwrap_or(1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Write a text file, creating parent directories if needed.
///
/// # Errors
///
/// Returns an error if directories or file contents cannot be written.
pub fn write_file(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

/// Quote a path as a single-quoted configuration string.
#[must_use]
pub fn quoted_path(path: &Path) -> String {
    let escaped = path
        .to_string_lossy()
        .replace('\\', "\\\\")
        .replace('\'', "\\'");
    format!("'{escaped}'")
}

fn ensure_cairn_built() -> Result<(), String> {
    match BUILD_CAIRN.get_or_init(|| {
        let status = Command::new("cargo")
            .arg("build")
            .arg("-q")
            .arg("-p")
            .arg("cairn")
            .status()
            .map_err(|error| format!("failed to build cairn binary: {error}"))?;

        if status.success() {
            Ok(())
        } else {
            Err(format!(
                "failed to build cairn binary: cargo exited with status {status}"
            ))
        }
    }) {
        Ok(()) => Ok(()),
        Err(error) => Err(error.clone()),
    }
}

fn cairn_bin() -> Result<PathBuf, String> {
    let mut path = std::env::current_exe()
        .map_err(|error| format!("failed to determine current executable: {error}"))?;
    if !path.pop() {
        return Err("failed to resolve test executable directory".to_string());
    }
    if path.ends_with("deps") {
        let _ = path.pop();
    }
    Ok(path.join(format!("cairn{}", std::env::consts::EXE_SUFFIX)))
}
