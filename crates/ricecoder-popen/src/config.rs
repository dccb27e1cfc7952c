//! Command and capture configuration

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::PathBuf;

use crate::redirect::{Redirect, StreamKind};

/// Shell used for [`Program::Shell`] command lines
pub const SHELL: [&str; 2] = ["sh", "-c"];

/// What to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Program {
    /// A command line interpreted by `sh -c`
    Shell(String),
    /// An argument vector; the first token names the executable
    Argv(Vec<OsString>),
}

/// Configuration for spawning one process (one pipeline stage)
///
/// Explicit redirects set here take precedence over the automatic
/// wiring chosen by capture and pipeline operations.
#[derive(Debug, Clone)]
pub struct Command {
    /// Program to execute
    pub program: Program,
    /// Environment overrides (None = remove the variable)
    pub env: BTreeMap<OsString, Option<OsString>>,
    /// Start from an empty environment
    pub env_clear: bool,
    /// Working directory (None = current dir)
    pub working_dir: Option<PathBuf>,
    /// Explicit stdin redirect
    pub stdin: Option<Redirect>,
    /// Explicit stdout redirect
    pub stdout: Option<Redirect>,
    /// Explicit stderr redirect
    pub stderr: Option<Redirect>,
}

impl Command {
    /// Create a command that executes `program` directly, without a shell
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self::from_program(Program::Argv(vec![program.as_ref().to_owned()]))
    }

    /// Create a command interpreted by the system shell
    pub fn shell(cmdline: impl Into<String>) -> Self {
        Self::from_program(Program::Shell(cmdline.into()))
    }

    /// Create a command from a full argument vector
    pub fn argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Self::from_program(Program::Argv(
            argv.into_iter().map(|s| s.as_ref().to_owned()).collect(),
        ))
    }

    fn from_program(program: Program) -> Self {
        Self {
            program,
            env: BTreeMap::new(),
            env_clear: false,
            working_dir: None,
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    /// Append an argument
    ///
    /// For shell command lines the argument becomes a positional parameter
    /// (`$0`, `$1`, ...) of the shell.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.push_arg(arg.as_ref().to_owned());
        self
    }

    /// Append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.push_arg(arg.as_ref().to_owned());
        }
        self
    }

    fn push_arg(&mut self, arg: OsString) {
        match &mut self.program {
            Program::Argv(argv) => argv.push(arg),
            Program::Shell(cmdline) => {
                let cmdline = std::mem::take(cmdline);
                let mut argv: Vec<OsString> = SHELL.iter().map(OsString::from).collect();
                argv.push(cmdline.into());
                argv.push(arg);
                self.program = Program::Argv(argv);
            }
        }
    }

    /// Set an environment variable for the child
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .insert(key.as_ref().to_owned(), Some(value.as_ref().to_owned()));
        self
    }

    /// Remove an environment variable from the child's environment
    pub fn env_remove(mut self, key: impl AsRef<OsStr>) -> Self {
        self.env.insert(key.as_ref().to_owned(), None);
        self
    }

    /// Do not inherit the parent's environment
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set stdin redirect, overriding the caller's stream policy
    ///
    /// # Arguments
    ///
    /// * `redirect` - Where the child's stdin comes from, e.g. a [`File`](std::fs::File)
    pub fn stdin(mut self, redirect: impl Into<Redirect>) -> Self {
        self.stdin = Some(redirect.into());
        self
    }

    /// Set stdout redirect, overriding the caller's stream policy
    pub fn stdout(mut self, redirect: impl Into<Redirect>) -> Self {
        self.stdout = Some(redirect.into());
        self
    }

    /// Set stderr redirect, overriding the caller's stream policy
    pub fn stderr(mut self, redirect: impl Into<Redirect>) -> Self {
        self.stderr = Some(redirect.into());
        self
    }

    /// Explicit redirect for one stream, if any
    pub fn redirect(&self, kind: StreamKind) -> Option<&Redirect> {
        match kind {
            StreamKind::Stdin => self.stdin.as_ref(),
            StreamKind::Stdout => self.stdout.as_ref(),
            StreamKind::Stderr => self.stderr.as_ref(),
        }
    }

    /// Argument vector handed to the spawn primitive
    pub fn to_argv(&self) -> Vec<OsString> {
        match &self.program {
            Program::Argv(argv) => argv.clone(),
            Program::Shell(cmdline) => {
                let mut argv: Vec<OsString> = SHELL.iter().map(OsString::from).collect();
                argv.push(cmdline.into());
                argv
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.program {
            Program::Shell(cmdline) => f.write_str(cmdline),
            Program::Argv(argv) => {
                let parts: Vec<_> = argv.iter().map(|a| a.to_string_lossy()).collect();
                f.write_str(&parts.join(" "))
            }
        }
    }
}

impl From<&str> for Command {
    fn from(cmdline: &str) -> Self {
        Command::shell(cmdline)
    }
}

impl From<String> for Command {
    fn from(cmdline: String) -> Self {
        Command::shell(cmdline)
    }
}

/// Options for the capture family
#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    /// Bytes written to the child's stdin before it is closed
    pub stdin_data: Vec<u8>,
    /// Raw bytes when true; otherwise output is decoded as UTF-8 with replacement
    pub binary: bool,
    /// Fail with `BrokenPipe` when the child closes stdin before all input is sent
    pub strict_input: bool,
}

impl CaptureOptions {
    /// Create options with no input, text mode and lenient input delivery
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the data fed to stdin
    pub fn stdin_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin_data = data.into();
        self
    }

    /// Enable/disable binary mode
    pub fn binary(mut self, binary: bool) -> Self {
        self.binary = binary;
        self
    }

    /// Enable/disable strict input delivery
    pub fn strict_input(mut self, strict: bool) -> Self {
        self.strict_input = strict;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_argv() {
        let cmd = Command::shell("echo hi");
        assert_eq!(cmd.to_argv(), vec!["sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_shell_with_positional_args() {
        let cmd = Command::shell("echo $1").arg("sh").arg("x");
        assert_eq!(cmd.to_argv(), vec!["sh", "-c", "echo $1", "sh", "x"]);
    }

    #[test]
    fn test_argv_builder() {
        let cmd = Command::new("echo").args(["a", "b"]).env("K", "V").env_remove("Z");
        assert_eq!(cmd.to_argv(), vec!["echo", "a", "b"]);
        assert_eq!(cmd.env.len(), 2);
        assert_eq!(cmd.to_string(), "echo a b");
    }

    #[test]
    fn test_capture_options_defaults() {
        let opts = CaptureOptions::new();
        assert!(opts.stdin_data.is_empty());
        assert!(!opts.binary);
        assert!(!opts.strict_input);
    }
}
