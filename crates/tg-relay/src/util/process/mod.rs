use crate::prelude::*;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub(crate) enum ProcessError {
    #[error("Couldn't run program that contains a nul byte: {program:?} {args:?}")]
    NulByte { program: String, args: Vec<String> },

    #[error("Invocation failed. Command:\n`{cmd}`")]
    Spawn { cmd: String, source: std::io::Error },

    #[error("Program invocation failed with status {status}. Command:\n`{cmd}`\nStderr:\n{stderr}")]
    BadStatus {
        cmd: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("Program didn't finish in {timeout:.2?} and was killed. Command:\n`{cmd}`")]
    Timeout { cmd: String, timeout: Duration },
}

/// Runs the program to completion and returns its stdout.
///
/// The child is killed if `timeout` elapses, or if the returned future
/// is dropped before the program finishes.
pub(crate) async fn run(
    program: &str,
    args: &[&str],
    timeout: Option<Duration>,
) -> Result<Vec<u8>, ProcessError> {
    let display_args =
        shlex::try_join(args.iter().copied()).map_err(|_| ProcessError::NulByte {
            program: program.to_owned(),
            args: args.iter().map(|&arg| arg.to_owned()).collect(),
        })?;

    let cmd = format!("{program} {display_args}");
    debug!(%cmd, "Running program");

    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let output = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, output)
            .await
            .map_err(|_| ProcessError::Timeout {
                cmd: cmd.clone(),
                timeout,
            })?,
        None => output.await,
    };

    let output = output.map_err(|source| ProcessError::Spawn {
        cmd: cmd.clone(),
        source,
    })?;

    let status = output.status;

    if !status.success() {
        return Err(ProcessError::BadStatus {
            cmd,
            status,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(output.stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test_log::test(tokio::test)]
    async fn returns_stdout_of_successful_program() {
        let stdout = run("echo", &["hello"], None).await.unwrap();
        assert_eq!(String::from_utf8(stdout).unwrap().trim(), "hello");
    }

    #[test_log::test(tokio::test)]
    async fn reports_bad_exit_status() {
        let err = run("false", &[], None).await.unwrap_err();
        assert_matches!(err, ProcessError::BadStatus { .. });
    }

    #[test_log::test(tokio::test)]
    async fn kills_program_after_timeout() {
        let err = run("sleep", &["5"], Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_matches!(err, ProcessError::Timeout { .. });
    }

    #[test_log::test(tokio::test)]
    async fn missing_program_is_a_spawn_error() {
        let err = run("definitely-not-a-real-program-name", &[], None)
            .await
            .unwrap_err();
        assert_matches!(err, ProcessError::Spawn { .. });
    }
}
