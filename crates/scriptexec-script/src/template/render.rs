//! Template evaluation against JSON data

use serde_json::Value;

use super::funcs::{self, Func};
use super::{BlockKind, Command, FieldPath, Node, Operand, Pipeline};

pub(super) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn lookup<'v>(path: &FieldPath, dot: &'v Value) -> Result<&'v Value, String> {
    let mut current = dot;
    for segment in path.segments() {
        current = match current {
            Value::Object(map) => map
                .get(segment)
                .ok_or_else(|| format!("no entry for key {segment:?} in {path}"))?,
            other => {
                return Err(format!(
                    "can't evaluate field {segment} in type {} ({path})",
                    type_name(other)
                ));
            }
        };
    }
    Ok(current)
}

pub(super) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => {}
        Value::String(s) => out.extend_from_slice(s.as_bytes()),
        Value::Bool(b) => out.extend_from_slice(b.to_string().as_bytes()),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::Array(_) | Value::Object(_) => out.extend_from_slice(value.to_string().as_bytes()),
    }
}

pub(super) fn render(nodes: &[Node], root: &Value, out: &mut Vec<u8>) -> Result<(), String> {
    let mut state = State {
        root,
        vars: Vec::new(),
    };
    state.walk(nodes, root, out)
}

/// Evaluation state: the top-level value and the declared variables in scope
struct State<'r> {
    root: &'r Value,
    vars: Vec<(String, Value)>,
}

impl State<'_> {
    fn walk(&mut self, nodes: &[Node], dot: &Value, out: &mut Vec<u8>) -> Result<(), String> {
        for node in nodes {
            match node {
                Node::Text(text) => out.extend_from_slice(text.as_bytes()),
                Node::Action(pipeline) => {
                    let value = self.pipeline(pipeline, dot)?;
                    match pipeline.decl.first() {
                        Some(name) => self.vars.push((name.clone(), value)),
                        None => write_value(&value, out),
                    }
                }
                Node::Block {
                    kind,
                    pipeline,
                    body,
                    otherwise,
                } => {
                    let mark = self.vars.len();
                    let result = match kind {
                        BlockKind::Range => self.range(pipeline, body, otherwise, dot, out),
                        BlockKind::If | BlockKind::With => {
                            self.conditional(*kind, pipeline, body, otherwise, dot, out)
                        }
                    };
                    self.vars.truncate(mark);
                    result?;
                }
            }
        }
        Ok(())
    }

    fn conditional(
        &mut self,
        kind: BlockKind,
        pipeline: &Pipeline,
        body: &[Node],
        otherwise: &[Node],
        dot: &Value,
        out: &mut Vec<u8>,
    ) -> Result<(), String> {
        let value = self.pipeline(pipeline, dot)?;
        if let Some(name) = pipeline.decl.first() {
            self.vars.push((name.clone(), value.clone()));
        }

        match (kind, is_truthy(&value)) {
            (BlockKind::With, true) => self.walk(body, &value, out),
            (_, true) => self.walk(body, dot, out),
            (_, false) => self.walk(otherwise, dot, out),
        }
    }

    fn range(
        &mut self,
        pipeline: &Pipeline,
        body: &[Node],
        otherwise: &[Node],
        dot: &Value,
        out: &mut Vec<u8>,
    ) -> Result<(), String> {
        let entries: Vec<(Value, Value)> = match self.pipeline(pipeline, dot)? {
            Value::Null => Vec::new(),
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| (Value::from(i), item))
                .collect(),
            Value::Object(map) => {
                let mut entries: Vec<_> = map.into_iter().collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                entries
                    .into_iter()
                    .map(|(key, item)| (Value::String(key), item))
                    .collect()
            }
            other => return Err(format!("range can't iterate over {}", type_name(&other))),
        };

        if entries.is_empty() {
            return self.walk(otherwise, dot, out);
        }

        let mark = self.vars.len();
        for (key, item) in entries {
            self.vars.truncate(mark);
            match pipeline.decl.as_slice() {
                [] => {}
                [element] => self.vars.push((element.clone(), item.clone())),
                [index, element, ..] => {
                    self.vars.push((index.clone(), key));
                    self.vars.push((element.clone(), item.clone()));
                }
            }
            self.walk(body, &item, out)?;
        }
        Ok(())
    }

    fn pipeline(&self, pipeline: &Pipeline, dot: &Value) -> Result<Value, String> {
        self.commands(&pipeline.commands, dot)
    }

    fn commands(&self, commands: &[Command], dot: &Value) -> Result<Value, String> {
        let mut piped = None;
        for command in commands {
            let value = match command {
                Command::Operand(operand) => self.operand(operand, dot)?,
                Command::Call { func, args } => self.call(*func, args, piped.take(), dot)?,
            };
            piped = Some(value);
        }
        piped.ok_or_else(|| "missing value for action".to_string())
    }

    fn call(
        &self,
        func: Func,
        args: &[Operand],
        piped: Option<Value>,
        dot: &Value,
    ) -> Result<Value, String> {
        let evaluated = args
            .iter()
            .map(|arg| self.operand(arg, dot))
            .chain(piped.map(Ok));

        match func {
            Func::And | Func::Or => funcs::logical(func, evaluated),
            _ => {
                let values = evaluated.collect::<Result<Vec<_>, _>>()?;
                funcs::apply(func, &values)
            }
        }
    }

    fn operand(&self, operand: &Operand, dot: &Value) -> Result<Value, String> {
        match operand {
            Operand::Field(path) => lookup(path, dot).cloned(),
            Operand::Variable { name, path } => lookup(path, self.variable(name)?).cloned(),
            Operand::Literal(value) => Ok(value.clone()),
            Operand::Pipeline(commands) => self.commands(commands, dot),
        }
    }

    fn variable(&self, name: &str) -> Result<&Value, String> {
        if name == "$" {
            return Ok(self.root);
        }
        self.vars
            .iter()
            .rev()
            .find(|(declared, _)| declared == name)
            .map(|(_, value)| value)
            .ok_or_else(|| format!("undefined variable {name}"))
    }
}
