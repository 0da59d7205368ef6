use std::fmt;
use std::io;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use crate::env::Env;

/// A toolchain failure with the banner lines stripped out of the
/// output.
#[derive(Debug, Clone)]
pub struct BuildError(String);

impl BuildError {
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for BuildError {}

/// Run the build command over the dependency set. `files` are passed
/// as extra arguments so the toolchain builds only those entries when
/// several share the target directory. On non-zero exit the combined
/// output is filtered of lines starting with the toolchain banner
/// character (`#`) and returned as the error. Stateless and reentrant;
/// the caller provides the environment.
pub async fn build(
    command: &[String],
    dir: &Path,
    env: &Env,
    files: &[String],
) -> Result<(), BuildError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| BuildError("empty builder command".to_string()))?;

    debug!(program = %program, dir = %dir.display(), ?files, "running builder");

    let (status, combined) = run_combined(program, args, dir, env, files)
        .await
        .map_err(|err| BuildError(format!("{program}: {err}")))?;

    if status.success() {
        return Ok(());
    }

    if combined.is_empty() {
        return Err(BuildError(format!("{program}: {status}")));
    }

    let text = String::from_utf8_lossy(&combined);
    let lines: Vec<&str> = text.lines().filter(|line| !line.starts_with('#')).collect();
    Err(BuildError(lines.join("\n")))
}

/// Run the command with stdout and stderr aliased onto a single pipe
/// so the captured output keeps its true chronological order.
async fn run_combined(
    program: &str,
    args: &[String],
    dir: &Path,
    env: &Env,
    files: &[String],
) -> io::Result<(std::process::ExitStatus, Vec<u8>)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let [read_fd, write_fd] = fds;
    // Takes ownership of the read end so it is closed on every path.
    let reader = unsafe { std::fs::File::from_raw_fd(read_fd) };
    let stdout = unsafe { Stdio::from_raw_fd(write_fd) };
    let stderr_fd = unsafe { libc::dup(write_fd) };
    if stderr_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let stderr = unsafe { Stdio::from_raw_fd(stderr_fd) };

    // The command must be dropped after spawning: it holds the parent's
    // copies of the write ends, and the read below only sees EOF once
    // every write end is closed.
    let mut child = {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .args(files)
            .current_dir(dir)
            .env_clear()
            .envs(env.pairs())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        cmd.spawn()
    }?;

    let mut reader = tokio::fs::File::from_std(reader);
    let mut combined = Vec::new();
    reader.read_to_end(&mut combined).await?;
    let status = child.wait().await?;
    Ok((status, combined))
}
