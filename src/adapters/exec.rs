//! Subprocess execution with line-streamed output

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::info;

use crate::error::{Error, Result};

/// Run a command to completion, handing every stdout line to `on_stdout`
///
/// Stderr lines are logged as they arrive. A non-zero exit is reported as
/// [`Error::Command`] with the exit status as reported by the OS.
pub async fn stream_command<F>(mut command: Command, cmdline: &str, mut on_stdout: F) -> Result<()>
where
    F: FnMut(&str) + Send,
{
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr was not captured"))?;

    let mut out = BufReader::new(stdout).lines();
    let mut err = BufReader::new(stderr).lines();
    let (mut out_done, mut err_done) = (false, false);

    while !(out_done && err_done) {
        tokio::select! {
            line = out.next_line(), if !out_done => match line? {
                Some(line) => on_stdout(&line),
                None => out_done = true,
            },
            line = err.next_line(), if !err_done => match line? {
                Some(line) => info!(command = %cmdline, "{}", line),
                None => err_done = true,
            },
        }
    }

    let status = child.wait().await?;
    if !status.success() {
        return Err(Error::Command {
            command: cmdline.to_string(),
            status: status.to_string(),
        });
    }
    Ok(())
}
