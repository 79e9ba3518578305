//! Spawn external executables (the raw programmer, the target-control
//! daemon) with an enforced wall-clock timeout.

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::{Error, Result};

/// The result of running a subprocess to completion within the timeout.
pub struct Output {
  pub status: std::process::ExitStatus,
  pub stdout: String,
  pub stderr: String,
}

/// Run `program` with `args`, waiting up to `timeout_duration`. On timeout
/// the child is killed and [`Error::CommandTimeout`] is returned; the
/// caller is responsible for turning a non-success exit status into the
/// appropriate domain error (e.g. [`Error::ProgrammerFailed`]).
pub async fn run_with_timeout<I, S>(program: &str, args: I, timeout_duration: Duration) -> Result<Output>
where
  I: IntoIterator<Item = S>,
  S: AsRef<OsStr>,
{
  let mut command = Command::new(program);
  command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

  tracing::debug!(program, timeout = ?timeout_duration, "spawning subprocess");
  let child = command.spawn()?;

  match timeout(timeout_duration, wait_with_output(child)).await {
    Ok(result) => result,
    Err(_) => Err(Error::CommandTimeout(program.to_string())),
  }
}

async fn wait_with_output(child: Child) -> Result<Output> {
  let output = child.wait_with_output().await?;
  Ok(Output {
    status: output.status,
    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
  })
}

/// Spawn a long-lived subprocess without waiting for it to exit (used for
/// the target-control daemon). The caller owns the returned [`Child`] and
/// is responsible for stopping it.
pub fn spawn_daemon<I, S>(program: &str, args: I) -> Result<Child>
where
  I: IntoIterator<Item = S>,
  S: AsRef<OsStr>,
{
  let mut command = Command::new(program);
  command
    .args(args)
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  tracing::debug!(program, "spawning daemon subprocess");
  Ok(command.spawn()?)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn successful_command_returns_output() {
    let output = run_with_timeout("true", Vec::<&str>::new(), Duration::from_secs(5))
      .await
      .unwrap();
    assert!(output.status.success());
  }

  #[tokio::test]
  async fn nonzero_exit_is_not_itself_an_error() {
    let output = run_with_timeout("false", Vec::<&str>::new(), Duration::from_secs(5))
      .await
      .unwrap();
    assert!(!output.status.success());
  }

  #[tokio::test]
  async fn timeout_kills_and_reports() {
    let result = run_with_timeout("sleep", ["2"], Duration::from_millis(50)).await;
    assert!(matches!(result, Err(Error::CommandTimeout(_))));
  }
}
