//! Parsed scripts

use std::io::Cursor;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::error::ScriptError;
use crate::shell::Shell;
use crate::template::Template;

/// Anything that yields a usable script, or the error that prevented it
pub trait ScriptSource {
    /// The script to execute
    ///
    /// # Errors
    /// Returns the error recorded when the script was built
    fn script(&self) -> Result<&Script, ScriptError>;
}

/// A parsed template plus the shell it targets
///
/// Immutable once built, so one script can back any number of runners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    name: String,
    shell: Shell,
    template: Template,
}

impl Script {
    /// Parse `code` as a script template
    ///
    /// # Errors
    /// Returns `ScriptError::Parse` if the template is malformed
    pub fn parse(
        name: impl Into<String>,
        shell: impl Into<Shell>,
        code: &str,
    ) -> Result<Self, ScriptError> {
        let name = name.into();
        let template = Template::parse(code).map_err(|message| ScriptError::Parse {
            name: name.clone(),
            message,
        })?;

        Ok(Self {
            name,
            shell: shell.into(),
            template,
        })
    }

    /// Read and parse a script template from a file
    ///
    /// # Errors
    /// Returns `ScriptError::Read` if the file cannot be read, or
    /// `ScriptError::Parse` if its contents are malformed
    pub fn from_file(
        name: impl Into<String>,
        shell: impl Into<Shell>,
        path: impl AsRef<Path>,
    ) -> Result<Self, ScriptError> {
        let path = path.as_ref();
        let code = std::fs::read_to_string(path).map_err(|e| ScriptError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        debug!(path = %path.display(), "loaded script file");

        Self::parse(name, shell, &code)
    }

    /// Script label
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target shell
    #[must_use]
    pub fn shell(&self) -> &Shell {
        &self.shell
    }

    /// Command line that executes this script when it is fed on stdin
    #[must_use]
    pub fn command(&self) -> String {
        self.shell.command()
    }

    /// Argument vector for running [`Script::command`] as a local process
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        self.shell.argv()
    }

    /// Render the template with `arguments`
    ///
    /// # Errors
    /// Returns `ScriptError::Render` if `arguments` cannot be serialized or
    /// does not provide a field the template references
    pub fn render<T: Serialize + ?Sized>(&self, arguments: &T) -> Result<Vec<u8>, ScriptError> {
        let data = serde_json::to_value(arguments).map_err(|e| self.render_error(e.to_string()))?;
        self.template
            .render(&data)
            .map_err(|message| self.render_error(message))
    }

    /// Render the template into a reader suitable as a stdin source
    ///
    /// # Errors
    /// Same as [`Script::render`]
    pub fn new_reader<T: Serialize + ?Sized>(
        &self,
        arguments: &T,
    ) -> Result<Cursor<Vec<u8>>, ScriptError> {
        self.render(arguments).map(Cursor::new)
    }

    fn render_error(&self, message: String) -> ScriptError {
        ScriptError::Render {
            name: self.name.clone(),
            message,
        }
    }
}

impl ScriptSource for Script {
    fn script(&self) -> Result<&Script, ScriptError> {
        Ok(self)
    }
}
