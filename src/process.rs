//! Supervision of the external tools a capture needs

use std::{
    ffi::OsStr,
    io::{self, BufRead},
    process::{Child, ChildStdout, Command, ExitStatus, Output},
};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// An executable and the CPUs it should be pinned to
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Executable {
    pub path: String,
    /// `taskset -c` CPU list, e.g. `0-8`
    #[serde(default)]
    pub cpus: Option<String>,
}

impl Executable {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cpus: None,
        }
    }

    pub fn pinned(path: impl Into<String>, cpus: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            cpus: Some(cpus.into()),
        }
    }

    /// Binary name, used for log messages and `pkill`
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = match &self.cpus {
            Some(cpus) => {
                let mut cmd = Command::new("taskset");
                cmd.args(["-c", cpus.as_str(), self.path.as_str()]);
                cmd
            }
            None => Command::new(&self.path),
        };
        cmd.args(args);
        cmd
    }
}

fn describe(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a command to completion, failing with its output if it exits nonzero
pub fn run_checked(mut cmd: Command) -> Result<Output> {
    let description = describe(&cmd);
    debug!("Running: {}", description);
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(Error::external(
            &description,
            output.status,
            &output.stdout,
            &output.stderr,
        ));
    }
    Ok(output)
}

/// Read lines until one contains `marker`, handing every line to `on_line`.
///
/// Returns `false` if the stream ended first.
pub fn wait_for_marker<R: BufRead>(
    reader: &mut R,
    marker: &str,
    mut on_line: impl FnMut(&str),
) -> io::Result<bool> {
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(false);
        }
        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim_end();
        on_line(trimmed);
        if trimmed.contains(marker) {
            return Ok(true);
        }
    }
}

/// A launched child process that is killed when dropped
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    child: Child,
    status: Option<ExitStatus>,
}

impl ManagedProcess {
    pub fn launch(name: &str, mut cmd: Command) -> Result<Self> {
        debug!("Launching {}: {}", name, describe(&cmd));
        let child = cmd.spawn().map_err(|e| Error::ExternalProcess {
            command: describe(&cmd),
            status: format!("failed to spawn: {e}"),
            stdout: String::new(),
            stderr: String::new(),
        })?;
        Ok(Self {
            name: name.to_owned(),
            child,
            status: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Block until the process exits on its own
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self.child.wait()?;
        debug!("{} exited with {}", self.name, status);
        self.status = Some(status);
        Ok(status)
    }

    /// Kill the process if it is still running and reap it. Safe to repeat.
    pub fn terminate(&mut self) -> Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        if self.child.try_wait()?.is_none() {
            debug!("Terminating {} (pid {})", self.name, self.child.id());
            if let Err(e) = self.child.kill() {
                // Already gone between try_wait and kill
                if e.kind() != io::ErrorKind::InvalidInput {
                    return Err(e.into());
                }
            }
        }
        self.status = Some(self.child.wait()?);
        Ok(())
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            warn!("Could not terminate {}: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Cursor, process::Stdio};

    #[test]
    fn test_taskset_prefix() {
        let exe = Executable::pinned("/usr/local/bin/mkrecv_rnt", "0-8");
        let cmd = exe.command(["--quiet"]);
        assert_eq!(describe(&cmd), "taskset -c 0-8 /usr/local/bin/mkrecv_rnt --quiet");
        assert_eq!(exe.name(), "mkrecv_rnt");
    }

    #[test]
    fn test_wait_for_marker() {
        let mut input = Cursor::new("starting\nallocating\n[info] ready for data\nlater\n");
        let mut seen = Vec::new();
        let found = wait_for_marker(&mut input, "ready", |l| seen.push(l.to_owned())).unwrap();
        assert!(found);
        assert_eq!(seen.len(), 3);

        let mut input = Cursor::new("starting\n[error] no gpu\n");
        assert!(!wait_for_marker(&mut input, "ready", |_| {}).unwrap());
    }

    #[test]
    fn test_wait_for_marker_past_invalid_utf8() {
        let mut input = Cursor::new(&b"\xe4\xff boot\n[info] Ready\n"[..]);
        let mut seen = Vec::new();
        assert!(wait_for_marker(&mut input, "[info] Ready", |l| seen.push(l.to_owned())).unwrap());
        assert_eq!(seen, vec!["\u{fffd}\u{fffd} boot", "[info] Ready"]);
    }

    #[test]
    fn test_run_checked_reports_output() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let err = run_checked(cmd).unwrap_err();
        match err {
            Error::ExternalProcess { stdout, stderr, .. } => {
                assert_eq!(stdout, "out");
                assert_eq!(stderr, "err");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30").stdout(Stdio::null());
        let mut proc = ManagedProcess::launch("sleeper", cmd).unwrap();
        proc.terminate().unwrap();
        proc.terminate().unwrap();
        assert!(!proc.wait().unwrap().success());
    }

    #[test]
    fn test_launch_missing_binary() {
        let cmd = Command::new("/nonexistent/definitely-not-here");
        assert!(matches!(
            ManagedProcess::launch("ghost", cmd),
            Err(Error::ExternalProcess { .. })
        ));
    }
}
