//! External command seam
//!
//! Every call into systemctl, a2ensite, crontab or certbot goes through a
//! [`CommandRunner`]. A non-zero exit is an ordinary [`CommandOutput`];
//! only a failure to launch the program is an error. Call sites decide
//! whether a failed command is fatal or advisory.

use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::error::{Result, SiteError};

/// A program and its arguments, with optional stdin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// True when the program and leading arguments equal `prefix`
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        let Some((program, rest)) = prefix.split_first() else {
            return true;
        };
        self.program == *program
            && self.args.len() >= rest.len()
            && self.args.iter().zip(rest).all(|(a, b)| a == b)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Exit code and captured output of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into [`SiteError::ExternalTool`]
    pub fn check(self, invocation: &Invocation) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }

        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let status = match self.code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        };

        Err(SiteError::tool(
            invocation.to_string(),
            if detail.is_empty() {
                status
            } else {
                format!("{}: {}", status, detail)
            },
        ))
    }
}

/// Runs external programs to completion
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    /// Run with captured stdout/stderr
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;

    /// Run with stdout/stderr inherited from this process
    fn stream(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Runs programs on the host with `std::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    fn command(invocation: &Invocation) -> Command {
        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        command
    }

    fn launch_error(invocation: &Invocation, e: std::io::Error) -> SiteError {
        SiteError::tool(
            invocation.program.clone(),
            format!("failed to execute '{}': {}", invocation, e),
        )
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        debug!("Running: {}", invocation);

        let mut command = Self::command(invocation);
        command
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| Self::launch_error(invocation, e))?;

        if let Some(input) = &invocation.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(input.as_bytes())
                    .map_err(|e| Self::launch_error(invocation, e))?;
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| Self::launch_error(invocation, e))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn stream(&self, invocation: &Invocation) -> Result<CommandOutput> {
        debug!("Running (streamed): {}", invocation);

        let status = Self::command(invocation)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| Self::launch_error(invocation, e))?;

        Ok(CommandOutput {
            code: status.code(),
            ..CommandOutput::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_display_quotes_spaces() {
        let invocation = Invocation::new("certbot")
            .arg("renew")
            .arg("--pre-hook")
            .arg("systemctl stop nginx");
        assert_eq!(
            invocation.to_string(),
            "certbot renew --pre-hook \"systemctl stop nginx\""
        );
    }

    #[test]
    fn test_invocation_starts_with() {
        let invocation = Invocation::new("systemctl").args(["reload", "nginx"]);
        assert!(invocation.starts_with(&["systemctl"]));
        assert!(invocation.starts_with(&["systemctl", "reload"]));
        assert!(!invocation.starts_with(&["systemctl", "stop"]));
        assert!(!invocation.starts_with(&["nginx"]));
    }

    #[test]
    fn test_check_reports_stderr() {
        let invocation = Invocation::new("a2ensite").arg("shop.test.conf");
        let err = CommandOutput::failed(1, "ERROR: Site shop.test does not exist!\n")
            .check(&invocation)
            .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("a2ensite shop.test.conf"));
        assert!(message.contains("exit status 1"));
        assert!(message.contains("does not exist"));
        assert!(err.is_advisory());
    }

    #[test]
    fn test_check_passes_success() {
        let invocation = Invocation::new("true");
        assert!(CommandOutput::ok("").check(&invocation).is_ok());
    }

    #[test]
    #[cfg(unix)]
    fn test_system_runner_captures_output() {
        let output = SystemRunner
            .run(&Invocation::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    #[cfg(unix)]
    fn test_system_runner_feeds_stdin() {
        let output = SystemRunner
            .run(&Invocation::new("cat").stdin("line one\n"))
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "line one\n");
    }

    #[test]
    fn test_system_runner_missing_program() {
        let err = SystemRunner
            .run(&Invocation::new("sitectl-definitely-not-installed"))
            .unwrap_err();
        assert!(matches!(err, SiteError::ExternalTool { .. }));
    }
}
