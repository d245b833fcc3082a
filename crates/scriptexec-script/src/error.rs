//! Error types for scriptexec-script

use thiserror::Error;

/// Errors raised while building or rendering a script
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// Template text is malformed
    #[error("cannot parse script {name:?}: {message}")]
    Parse {
        /// Script name
        name: String,
        /// Parser diagnostic
        message: String,
    },

    /// Arguments do not satisfy the template
    #[error("cannot render script {name:?}: {message}")]
    Render {
        /// Script name
        name: String,
        /// Renderer diagnostic
        message: String,
    },

    /// Template file could not be read
    #[error("cannot read script file {path}: {message}")]
    Read {
        /// File path
        path: String,
        /// I/O error text
        message: String,
    },
}
