//! scriptexec-script: Script templates and shell dispatch
//!
//! A [`Script`] pairs a parsed template with the shell that executes it. Rendering
//! produces the bytes fed to the shell on stdin; [`Script::command`] is the command
//! line that makes the shell read them.

pub mod error;
pub mod lazy;
pub mod script;
pub mod shell;
pub mod template;

pub use error::ScriptError;
pub use lazy::LazyScript;
pub use script::{Script, ScriptSource};
pub use shell::Shell;
pub use template::Template;
