//! Scripts declared in `static` items
//!
//! A [`LazyScript`] is built in two phases: declaration is infallible and
//! `const`, parsing happens on the first [`LazyScript::get`]. The parse result
//! is cached, so a malformed script fails every use with the same error and
//! never reaches a runner.

use std::sync::OnceLock;

use crate::error::ScriptError;
use crate::script::{Script, ScriptSource};

/// A script parsed on first use
///
/// ```
/// use scriptexec_script::LazyScript;
///
/// static LS: LazyScript = LazyScript::new("ls", "sh", "ls {{.Path}}");
///
/// assert_eq!(LS.get().unwrap().command(), "sh -");
/// ```
#[derive(Debug)]
pub struct LazyScript {
    name: &'static str,
    shell: &'static str,
    code: &'static str,
    parsed: OnceLock<Result<Script, ScriptError>>,
}

impl LazyScript {
    /// Declare a script without parsing it
    #[must_use]
    pub const fn new(name: &'static str, shell: &'static str, code: &'static str) -> Self {
        Self {
            name,
            shell,
            code,
            parsed: OnceLock::new(),
        }
    }

    /// Script name
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The parsed script, parsing it on first call
    ///
    /// # Errors
    /// Returns the stored `ScriptError::Parse` if the template is malformed
    pub fn get(&self) -> Result<&Script, ScriptError> {
        self.parsed
            .get_or_init(|| Script::parse(self.name, self.shell, self.code))
            .as_ref()
            .map_err(Clone::clone)
    }

    /// The stored parse error, if any
    #[must_use]
    pub fn error(&self) -> Option<&ScriptError> {
        self.parsed
            .get_or_init(|| Script::parse(self.name, self.shell, self.code))
            .as_ref()
            .err()
    }
}

impl ScriptSource for LazyScript {
    fn script(&self) -> Result<&Script, ScriptError> {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static GOOD: LazyScript = LazyScript::new("good", "powershell", "Get-ChildItem {{.Path}}");
    static BAD: LazyScript = LazyScript::new("bad", "sh", "ls {{if .Path}}");

    #[test]
    fn test_good_script_parses_once() {
        let first = GOOD.get().unwrap();
        let second = GOOD.get().unwrap();
        assert!(std::ptr::eq(first, second));
        assert!(GOOD.error().is_none());
    }

    #[test]
    fn test_bad_script_keeps_failing() {
        let first = BAD.get().unwrap_err();
        let second = BAD.get().unwrap_err();
        assert_eq!(first, second);
        assert!(matches!(BAD.error(), Some(ScriptError::Parse { .. })));
    }

    #[test]
    fn test_script_source() {
        assert_eq!(GOOD.script().unwrap().name(), "good");
        assert!(BAD.script().is_err());
    }
}
