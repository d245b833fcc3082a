//! Text templates with `{{ }}` actions
//!
//! Supported actions:
//! - `{{.}}`, `{{.Field}}`, `{{.Outer.Inner}}` insert a value
//! - `{{$}}`, `{{$.Field}}` reach the top-level arguments from any block
//! - `{{$x := pipeline}}` declares a variable until the enclosing `{{end}}`
//! - `{{if pipeline}} … {{else if pipeline}} … {{else}} … {{end}}`
//! - `{{range pipeline}} … {{else}} … {{end}}` (dot is each element),
//!   optionally `{{range $i, $e := pipeline}}`
//! - `{{with pipeline}} … {{else with pipeline}} … {{else}} … {{end}}`
//! - `{{/* comment */}}`
//!
//! A pipeline is an operand (field, variable, string, number, `true`,
//! `false`, `nil`, or a parenthesized pipeline) or a call of one of the
//! builtins `eq ne lt le gt ge not and or len index`, optionally chained
//! with `|`, which passes the previous result as the final argument.
//!
//! A `-` directly inside the braces followed by whitespace (`{{- ` or ` -}}`)
//! trims the whitespace of the adjacent text.

mod funcs;
mod parse;
mod render;

use serde_json::Value;

use self::funcs::Func;

/// A dotted field reference; empty means the value itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FieldPath(Vec<String>);

impl FieldPath {
    pub(crate) fn segments(&self) -> &[String] {
        &self.0
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str(".");
        }
        for segment in &self.0 {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

/// Block actions sharing the `{{kw X}} … {{else}} … {{end}}` shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockKind {
    If,
    Range,
    With,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Operand {
    /// Field of dot
    Field(FieldPath),
    /// `$` or a declared `$name`, then an optional field path
    Variable { name: String, path: FieldPath },
    Literal(Value),
    /// Parenthesized pipeline
    Pipeline(Vec<Command>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Operand(Operand),
    Call { func: Func, args: Vec<Operand> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Pipeline {
    /// Variables assigned from the result (`$x :=`, or `$i, $e :=` in range)
    pub(crate) decl: Vec<String>,
    pub(crate) commands: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Text(String),
    Action(Pipeline),
    Block {
        kind: BlockKind,
        pipeline: Pipeline,
        body: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

/// A parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    /// Parse template source
    ///
    /// # Errors
    /// Returns a diagnostic with the offending line if the source is malformed
    pub fn parse(source: &str) -> Result<Self, String> {
        let nodes = parse::parse(source)?;
        Ok(Self { nodes })
    }

    /// Render against `data`, appending to `out`
    ///
    /// # Errors
    /// Returns a diagnostic if a field reference cannot be resolved
    pub fn render_into(&self, data: &Value, out: &mut Vec<u8>) -> Result<(), String> {
        render::render(&self.nodes, data, out)
    }

    /// Render against `data` into a fresh buffer
    ///
    /// # Errors
    /// Returns a diagnostic if a field reference cannot be resolved
    pub fn render(&self, data: &Value) -> Result<Vec<u8>, String> {
        let mut out = Vec::new();
        self.render_into(data, &mut out)?;
        Ok(out)
    }
}
