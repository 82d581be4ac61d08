//! External process execution for command-style actions

use async_trait::async_trait;
use device_cloud_shared::{ParamValue, Params};
use std::fmt;
use std::io;
use std::process::Stdio;

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` if the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// The argument vector that ran and what it produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub argv: Vec<String>,
    pub output: ProcessOutput,
}

impl fmt::Display for ProcessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command: {:?}, stdout: {}, stderr: {}",
            self.argv,
            self.output.stdout_lossy().trim_end(),
            self.output.stderr_lossy().trim_end()
        )
    }
}

/// Runs an argument vector to completion
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `argv[0]` with the remaining arguments and wait for it to exit
    async fn run(&self, argv: &[String]) -> io::Result<ProcessOutput>;
}

/// Runs processes directly on the host, without a shell
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, argv: &[String]) -> io::Result<ProcessOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argument vector"))?;

        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(ProcessOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Translate action parameters into command-line flags
///
/// `true` becomes `--key`, `false` is dropped, anything else becomes
/// `--key=value`. Flags follow the parameter order.
pub fn build_argv(program: &str, params: &Params) -> Vec<String> {
    let mut argv = Vec::with_capacity(params.len() + 1);
    argv.push(program.to_string());

    for (key, value) in params {
        match value {
            ParamValue::Bool(true) => argv.push(format!("--{}", key)),
            ParamValue::Bool(false) => {}
            other => argv.push(format!("--{}={}", key, other)),
        }
    }

    argv
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_argv_translates_flags() {
        let mut params = Params::new();
        params.insert("verbose".into(), ParamValue::Bool(true));
        params.insert("count".into(), ParamValue::Int(5));
        params.insert("quiet".into(), ParamValue::Bool(false));

        let argv = build_argv("/usr/bin/tool", &params);
        assert_eq!(argv, vec!["/usr/bin/tool", "--verbose", "--count=5"]);
    }

    #[test]
    fn test_build_argv_keeps_values_verbatim() {
        let mut params = Params::new();
        params.insert("name".into(), ParamValue::Str("two words; rm -rf /".into()));
        params.insert("ratio".into(), ParamValue::Float(0.5));

        let argv = build_argv("tool", &params);
        assert_eq!(argv[1], "--name=two words; rm -rf /");
        assert_eq!(argv[2], "--ratio=0.5");
    }

    #[tokio::test]
    async fn test_empty_argv_is_rejected() {
        let result = SystemRunner.run(&[]).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let argv = vec!["echo".to_string(), "--flag=a b".to_string()];
        let output = SystemRunner.run(&argv).await.expect("echo should run");

        assert!(output.success());
        assert_eq!(output.stdout_lossy(), "--flag=a b\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_system_runner_reports_nonzero_exit() {
        let argv = vec!["false".to_string()];
        let output = SystemRunner.run(&argv).await.expect("false should run");

        assert_eq!(output.code, Some(1));
        assert!(!output.success());
    }
}
