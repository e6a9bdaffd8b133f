//! Small helpers shared by the subprocess-driven pipeline stages.

use std::process::Output;

use crate::prelude::*;

/// Report a subprocess failure as an error, including a trailing slice of
/// stderr so conversion-tool diagnostics survive into our logs.
pub fn check_for_command_failure(command_name: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr_tail = stderr
        .lines()
        .rev()
        .take(5)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("\n");
    match output.status.code() {
        Some(exit_code) => Err(anyhow!(
            "{command_name} failed with exit code {exit_code}: {stderr_tail}"
        )),
        // Not all platforms have exit codes.
        None => Err(anyhow!("{command_name} failed: {stderr_tail}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn success_is_ok() {
        let output = tokio::process::Command::new("true").output().await.unwrap();
        assert!(check_for_command_failure("true", &output).is_ok());
    }

    #[tokio::test]
    async fn failure_includes_command_name() {
        let output = tokio::process::Command::new("false").output().await.unwrap();
        let err = check_for_command_failure("false", &output).unwrap_err();
        assert!(err.to_string().contains("false"));
    }
}
