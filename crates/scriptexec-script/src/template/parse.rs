//! Template lexer and parser

use std::fmt;

use serde_json::Value;

use super::funcs::Func;
use super::{BlockKind, Command, FieldPath, Node, Operand, Pipeline};

#[derive(Debug)]
enum Token<'a> {
    Text(String),
    Action { body: &'a str, line: usize },
}

/// How a nested list ended
#[derive(Debug, PartialEq, Eq)]
enum Terminator {
    Eof,
    /// `{{else}}`, or `{{else if …}}` / `{{else with …}}` with its operand
    Else { line: usize, operand: String },
    End(usize),
}

fn line_at(source: &str, offset: usize) -> usize {
    source[..offset].matches('\n').count() + 1
}

/// A trim marker is a `-` adjacent to the braces and separated from the body by whitespace
fn has_left_trim(inner: &str) -> bool {
    let mut chars = inner.chars();
    chars.next() == Some('-') && chars.next().is_some_and(char::is_whitespace)
}

fn has_right_trim(inner: &str) -> bool {
    let mut chars = inner.chars().rev();
    chars.next() == Some('-') && chars.next().is_some_and(char::is_whitespace)
}

fn tokenize(source: &str) -> Result<Vec<Token<'_>>, String> {
    let mut tokens = Vec::new();
    let mut rest = source;
    let mut trim_next = false;

    loop {
        let offset = source.len() - rest.len();
        let Some(open) = rest.find("{{") else {
            let text = if trim_next { rest.trim_start() } else { rest };
            if !text.is_empty() {
                tokens.push(Token::Text(text.to_string()));
            }
            return Ok(tokens);
        };

        let line = line_at(source, offset + open);
        let after = &rest[open + 2..];
        let trim_left = has_left_trim(after);

        let mut text = &rest[..open];
        if trim_next {
            text = text.trim_start();
        }
        if trim_left {
            text = text.trim_end();
        }
        if !text.is_empty() {
            tokens.push(Token::Text(text.to_string()));
        }

        // Comments may contain braces, so look for the closing `*/` first
        let search_from = match after.find("/*") {
            Some(start) if after[..start].trim_start_matches('-').trim().is_empty() => {
                let end = after[start..]
                    .find("*/")
                    .ok_or_else(|| format!("line {line}: unclosed comment"))?;
                start + end + 2
            }
            _ => 0,
        };
        let close = after[search_from..]
            .find("}}")
            .map(|i| i + search_from)
            .ok_or_else(|| format!("line {line}: unclosed action"))?;

        let inner = &after[..close];
        let trim_right = has_right_trim(inner);
        let start = usize::from(trim_left);
        let end = inner.len() - usize::from(trim_right);
        let body = if start <= end { inner[start..end].trim() } else { "" };

        if body.starts_with("/*") {
            if !body.ends_with("*/") {
                return Err(format!("line {line}: comment ends before closing delimiter"));
            }
        } else {
            tokens.push(Token::Action { body, line });
        }

        trim_next = trim_right;
        rest = &after[close + 2..];
    }
}

/// Lexical items of an action body
#[derive(Debug, Clone, PartialEq)]
enum Item {
    Field(FieldPath),
    Variable(String, FieldPath),
    Ident(String),
    Str(String),
    Number(Value),
    LeftParen,
    RightParen,
    Pipe,
    Comma,
    Declare,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_delimiter(c: Option<&char>) -> bool {
    c.is_none_or(|c| c.is_whitespace() || matches!(c, ')' | '|' | ','))
}

/// Read `.A.B` starting at the `.` at `i`; a lone `.` is the empty path
fn lex_path(chars: &[char], mut i: usize, line: usize, expr: &str) -> Result<(FieldPath, usize), String> {
    let bad = || format!("line {line}: bad field reference in {expr:?}");
    let mut segments = Vec::new();

    while chars.get(i) == Some(&'.') {
        let start = i + 1;
        let mut end = start;
        while end < chars.len() && is_ident_char(chars[end]) {
            end += 1;
        }
        if end == start {
            if segments.is_empty() && is_delimiter(chars.get(end)) {
                return Ok((FieldPath(segments), end));
            }
            return Err(bad());
        }
        segments.push(chars[start..end].iter().collect());
        i = end;
    }

    if !is_delimiter(chars.get(i)) {
        return Err(bad());
    }
    Ok((FieldPath(segments), i))
}

fn lex_string(chars: &[char], i: usize, line: usize) -> Result<(String, usize), String> {
    let quote = chars[i];
    let mut value = String::new();
    let mut j = i + 1;

    while let Some(&c) = chars.get(j) {
        j += 1;
        match c {
            c if c == quote => return Ok((value, j)),
            '\\' if quote == '"' => {
                let escaped = match chars.get(j) {
                    Some('n') => '\n',
                    Some('t') => '\t',
                    Some('r') => '\r',
                    Some('\\') => '\\',
                    Some('"') => '"',
                    other => return Err(format!("line {line}: bad escape {other:?} in string")),
                };
                value.push(escaped);
                j += 1;
            }
            '\n' if quote == '"' => break,
            c => value.push(c),
        }
    }
    Err(format!("line {line}: unterminated string"))
}

fn lex_number(chars: &[char], i: usize, line: usize) -> Result<(Value, usize), String> {
    let mut j = i + 1;
    while let Some(&c) = chars.get(j) {
        let exponent_sign = matches!(c, '+' | '-') && matches!(chars[j - 1], 'e' | 'E');
        if !(c.is_ascii_alphanumeric() || c == '.' || exponent_sign) {
            break;
        }
        j += 1;
    }

    let text: String = chars[i..j].iter().collect();
    let value = if let Ok(n) = text.parse::<i64>() {
        Value::from(n)
    } else if let Ok(n) = text.parse::<u64>() {
        Value::from(n)
    } else {
        text.parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| format!("line {line}: bad number syntax {text:?}"))?
    };
    Ok((value, j))
}

fn lex(expr: &str, line: usize) -> Result<Vec<Item>, String> {
    let chars: Vec<char> = expr.chars().collect();
    let mut items = Vec::new();
    let mut i = 0;

    while let Some(&c) = chars.get(i) {
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                items.push(Item::LeftParen);
                i += 1;
            }
            ')' => {
                items.push(Item::RightParen);
                i += 1;
            }
            '|' => {
                items.push(Item::Pipe);
                i += 1;
            }
            ',' => {
                items.push(Item::Comma);
                i += 1;
            }
            ':' if next == Some('=') => {
                items.push(Item::Declare);
                i += 2;
            }
            '.' => {
                let (path, end) = lex_path(&chars, i, line, expr)?;
                items.push(Item::Field(path));
                i = end;
            }
            '$' => {
                let mut end = i + 1;
                while end < chars.len() && is_ident_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[i..end].iter().collect();
                let (path, end) = if chars.get(end) == Some(&'.') {
                    lex_path(&chars, end, line, expr)?
                } else {
                    (FieldPath(Vec::new()), end)
                };
                items.push(Item::Variable(name, path));
                i = end;
            }
            '"' | '`' => {
                let (value, end) = lex_string(&chars, i, line)?;
                items.push(Item::Str(value));
                i = end;
            }
            c if c.is_ascii_digit()
                || (matches!(c, '-' | '+') && next.is_some_and(|n| n.is_ascii_digit())) =>
            {
                let (value, end) = lex_number(&chars, i, line)?;
                items.push(Item::Number(value));
                i = end;
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = i + 1;
                while end < chars.len() && is_ident_char(chars[end]) {
                    end += 1;
                }
                items.push(Item::Ident(chars[i..end].iter().collect()));
                i = end;
            }
            other => return Err(format!("line {line}: unexpected {other:?} in {expr:?}")),
        }
    }

    Ok(items)
}

/// Parser over the items of one action body
struct ExprParser<'v> {
    items: Vec<Item>,
    pos: usize,
    line: usize,
    vars: &'v [String],
}

impl ExprParser<'_> {
    fn peek(&self) -> Option<&Item> {
        self.items.get(self.pos)
    }

    fn error(&self, message: impl fmt::Display) -> String {
        format!("line {}: {message}", self.line)
    }

    /// Leading `$x :=` or `$i, $e :=`; anything else declares nothing
    fn declarations(&mut self, max: usize) -> Vec<String> {
        let mut names = Vec::new();
        let mut at = self.pos;

        loop {
            match self.items.get(at) {
                Some(Item::Variable(name, path)) if path.segments().is_empty() && name != "$" => {
                    names.push(name.clone());
                    at += 1;
                }
                _ => return Vec::new(),
            }
            match self.items.get(at) {
                Some(Item::Declare) => break,
                Some(Item::Comma) if names.len() < max => at += 1,
                _ => return Vec::new(),
            }
        }

        self.pos = at + 1;
        names
    }

    fn pipeline(&mut self) -> Result<Vec<Command>, String> {
        let mut commands = vec![self.command()?];
        while self.peek() == Some(&Item::Pipe) {
            self.pos += 1;
            let command = self.command()?;
            if !matches!(command, Command::Call { .. }) {
                return Err(self.error("can only pipe into a function"));
            }
            commands.push(command);
        }
        Ok(commands)
    }

    fn command(&mut self) -> Result<Command, String> {
        let func = match self.peek() {
            Some(Item::Ident(name)) => Func::from_name(name),
            _ => None,
        };
        if let Some(func) = func {
            self.pos += 1;
            let mut args = Vec::new();
            while !matches!(self.peek(), None | Some(Item::Pipe | Item::RightParen)) {
                args.push(self.operand()?);
            }
            return Ok(Command::Call { func, args });
        }

        let operand = self.operand()?;
        match self.peek() {
            None | Some(Item::Pipe | Item::RightParen) => Ok(Command::Operand(operand)),
            Some(item) => Err(self.error(format!("unexpected {item:?} after operand"))),
        }
    }

    fn operand(&mut self) -> Result<Operand, String> {
        let Some(item) = self.peek().cloned() else {
            return Err(self.error("missing operand"));
        };
        self.pos += 1;

        match item {
            Item::Field(path) => Ok(Operand::Field(path)),
            Item::Variable(name, path) => {
                if name == "$" || self.vars.contains(&name) {
                    Ok(Operand::Variable { name, path })
                } else {
                    Err(self.error(format!("undefined variable {name:?}")))
                }
            }
            Item::Str(s) => Ok(Operand::Literal(Value::String(s))),
            Item::Number(n) => Ok(Operand::Literal(n)),
            Item::Ident(word) => match word.as_str() {
                "true" => Ok(Operand::Literal(Value::Bool(true))),
                "false" => Ok(Operand::Literal(Value::Bool(false))),
                "nil" => Ok(Operand::Literal(Value::Null)),
                _ if Func::from_name(&word).is_some() => {
                    Err(self.error(format!("{word} as an argument must be parenthesized")))
                }
                _ => Err(self.error(format!("function {word:?} not defined"))),
            },
            Item::LeftParen => {
                let commands = self.pipeline()?;
                if self.peek() != Some(&Item::RightParen) {
                    return Err(self.error("unclosed left paren"));
                }
                self.pos += 1;
                Ok(Operand::Pipeline(commands))
            }
            other => Err(self.error(format!("unexpected {other:?}"))),
        }
    }
}

/// Parse an action body; `max_decl` is how many variables it may declare
fn parse_pipeline(body: &str, line: usize, vars: &[String], max_decl: usize) -> Result<Pipeline, String> {
    let mut parser = ExprParser {
        items: lex(body, line)?,
        pos: 0,
        line,
        vars,
    };

    let decl = parser.declarations(max_decl);
    let commands = parser.pipeline()?;
    if let Some(item) = parser.peek() {
        return Err(parser.error(format!("unexpected {item:?} in {body:?}")));
    }
    Ok(Pipeline { decl, commands })
}

struct Parser<'a> {
    tokens: std::vec::IntoIter<Token<'a>>,
    /// Variables in scope, innermost last
    vars: Vec<String>,
}

impl Parser<'_> {
    fn parse_list(&mut self) -> Result<(Vec<Node>, Terminator), String> {
        let mut nodes = Vec::new();

        while let Some(token) = self.tokens.next() {
            let (body, line) = match token {
                Token::Text(text) => {
                    nodes.push(Node::Text(text));
                    continue;
                }
                Token::Action { body, line } => (body, line),
            };

            let (keyword, operand) = match body.split_once(char::is_whitespace) {
                Some((keyword, operand)) => (keyword, operand.trim()),
                None => (body, ""),
            };

            let kind = match keyword {
                "" => return Err(format!("line {line}: missing value for action")),
                "end" if operand.is_empty() => return Ok((nodes, Terminator::End(line))),
                "else" => {
                    return Ok((
                        nodes,
                        Terminator::Else {
                            line,
                            operand: operand.to_string(),
                        },
                    ));
                }
                "if" => BlockKind::If,
                "range" => BlockKind::Range,
                "with" => BlockKind::With,
                "end" | "define" | "template" | "block" | "break" | "continue" => {
                    return Err(format!("line {line}: unsupported action {body:?}"));
                }
                _ => {
                    let pipeline = parse_pipeline(body, line, &self.vars, 1)?;
                    self.vars.extend(pipeline.decl.iter().cloned());
                    nodes.push(Node::Action(pipeline));
                    continue;
                }
            };

            nodes.push(self.parse_block(kind, operand, line)?);
        }

        Ok((nodes, Terminator::Eof))
    }

    fn parse_block(&mut self, kind: BlockKind, operand: &str, line: usize) -> Result<Node, String> {
        if operand.is_empty() {
            return Err(format!("line {line}: missing operand for {kind:?}"));
        }

        let mark = self.vars.len();
        let max_decl = if kind == BlockKind::Range { 2 } else { 1 };
        let pipeline = parse_pipeline(operand, line, &self.vars, max_decl)?;
        self.vars.extend(pipeline.decl.iter().cloned());
        let scope = self.vars.len();

        let (body, terminator) = self.parse_list()?;
        self.vars.truncate(scope);

        let otherwise = match terminator {
            Terminator::End(_) => Vec::new(),
            Terminator::Else { operand, .. } if operand.is_empty() => {
                let (otherwise, terminator) = self.parse_list()?;
                match terminator {
                    Terminator::End(_) => otherwise,
                    Terminator::Else { line: else_line, .. } => {
                        return Err(format!("line {else_line}: second {{{{else}}}} in block"));
                    }
                    Terminator::Eof => {
                        return Err(format!("line {line}: unexpected EOF, missing {{{{end}}}}"));
                    }
                }
            }
            // `{{else if …}}` / `{{else with …}}` nest a block that shares this `{{end}}`
            Terminator::Else {
                line: else_line,
                operand,
            } => {
                let (nested, rest) = operand
                    .split_once(char::is_whitespace)
                    .unwrap_or((operand.as_str(), ""));
                let nested = match (kind, nested) {
                    (BlockKind::If, "if") => BlockKind::If,
                    (BlockKind::With, "with") => BlockKind::With,
                    _ => {
                        return Err(format!("line {else_line}: unexpected {{{{else {operand}}}}}"));
                    }
                };
                vec![self.parse_block(nested, rest.trim(), else_line)?]
            }
            Terminator::Eof => {
                return Err(format!("line {line}: unexpected EOF, missing {{{{end}}}}"));
            }
        };

        self.vars.truncate(mark);
        Ok(Node::Block {
            kind,
            pipeline,
            body,
            otherwise,
        })
    }
}

pub(super) fn parse(source: &str) -> Result<Vec<Node>, String> {
    let mut parser = Parser {
        tokens: tokenize(source)?.into_iter(),
        vars: Vec::new(),
    };

    match parser.parse_list()? {
        (nodes, Terminator::Eof) => Ok(nodes),
        (_, Terminator::End(line)) => Err(format!("line {line}: unexpected {{{{end}}}}")),
        (_, Terminator::Else { line, .. }) => Err(format!("line {line}: unexpected {{{{else}}}}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_splits_text_and_actions() {
        let tokens = tokenize("a {{.X}} b").unwrap();
        assert_eq!(tokens.len(), 3);
        assert!(matches!(tokens[1], Token::Action { body: ".X", line: 1 }));
    }

    #[test]
    fn test_dash_inside_body_is_not_trim() {
        let tokens = tokenize("a {{-.X}}").unwrap();
        assert!(matches!(tokens[1], Token::Action { body: "-.X", .. }));
    }

    #[test]
    fn test_nested_blocks() {
        let nodes = parse("{{range .A}}{{if .B}}x{{end}}{{end}}").unwrap();
        let [Node::Block { kind: BlockKind::Range, body, .. }] = nodes.as_slice() else {
            panic!("expected a single range block");
        };
        assert!(matches!(body[0], Node::Block { kind: BlockKind::If, .. }));
    }

    #[test]
    fn test_lex_action_body() {
        let items = lex(r#"eq $.Mode "a\"b" -2 1.5 (len .)"#, 1).unwrap();
        assert_eq!(
            items,
            vec![
                Item::Ident("eq".to_string()),
                Item::Variable("$".to_string(), FieldPath(vec!["Mode".to_string()])),
                Item::Str("a\"b".to_string()),
                Item::Number(Value::from(-2)),
                Item::Number(Value::from(1.5)),
                Item::LeftParen,
                Item::Ident("len".to_string()),
                Item::Field(FieldPath(Vec::new())),
                Item::RightParen,
            ]
        );
    }

    #[test]
    fn test_range_declarations() {
        let nodes = parse("{{range $i, $e := .A}}{{$i}}{{end}}").unwrap();
        let [Node::Block { pipeline, .. }] = nodes.as_slice() else {
            panic!("expected a single range block");
        };
        assert_eq!(pipeline.decl, vec!["$i".to_string(), "$e".to_string()]);
    }

    #[test]
    fn test_else_if_nests_block() {
        let nodes = parse("{{if .A}}a{{else if .B}}b{{else}}c{{end}}").unwrap();
        let [Node::Block { otherwise, .. }] = nodes.as_slice() else {
            panic!("expected a single if block");
        };
        let [Node::Block { kind: BlockKind::If, otherwise: last, .. }] = otherwise.as_slice() else {
            panic!("expected a nested if block");
        };
        assert_eq!(last, &vec![Node::Text("c".to_string())]);
    }

    #[test]
    fn test_pipe_requires_function() {
        assert!(parse("{{.A | .B}}").is_err());
        assert!(parse("{{.A | not}}").is_ok());
    }

    #[test]
    fn test_double_else_rejected() {
        let err = parse("{{if .A}}a{{else}}b{{else}}c{{end}}").unwrap_err();
        assert!(err.contains("second"));
    }
}
