//! Shell identifiers and their stdin invocation

use std::fmt;

/// Trampoline for `cmd`: copy stdin to a uniquely named batch file, run it, delete it
pub const CMD_COMMAND: &str =
    "set T=_temp~%RANDOM%.bat && more > %T% && cmd /C %T% && del /Q %T%";

/// `PowerShell` reading the script from stdin, without profiles or execution policy
pub const POWERSHELL_COMMAND: &str = "PowerShell -NoProfile -ExecutionPolicy ByPass -Command -";

/// Shell that executes a rendered script
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Shell {
    /// Windows `cmd.exe`
    Cmd,
    /// Windows `PowerShell`
    PowerShell,
    /// Any shell that reads a script from stdin when given `-` (`sh`, `bash`, ...)
    Other(String),
}

impl Shell {
    /// Command line that executes a script read from standard input
    #[must_use]
    pub fn command(&self) -> String {
        match self {
            Shell::Cmd => CMD_COMMAND.to_string(),
            Shell::PowerShell => POWERSHELL_COMMAND.to_string(),
            Shell::Other(shell) => format!("{shell} -"),
        }
    }

    /// Argument vector for spawning [`Shell::command`] as a local process
    ///
    /// The `cmd` trampoline is a compound command line, so it is handed to
    /// `cmd /C` as one argument instead of being split.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        match self {
            Shell::Cmd => vec!["cmd".to_string(), "/C".to_string(), CMD_COMMAND.to_string()],
            other => other.command().split_whitespace().map(str::to_string).collect(),
        }
    }
}

impl From<&str> for Shell {
    fn from(shell: &str) -> Self {
        match shell.to_ascii_lowercase().as_str() {
            "cmd" => Shell::Cmd,
            "powershell" => Shell::PowerShell,
            _ => Shell::Other(shell.to_string()),
        }
    }
}

impl From<String> for Shell {
    fn from(shell: String) -> Self {
        Shell::from(shell.as_str())
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shell::Cmd => f.write_str("cmd"),
            Shell::PowerShell => f.write_str("powershell"),
            Shell::Other(shell) => f.write_str(shell),
        }
    }
}
