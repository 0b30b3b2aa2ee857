//! C-style shader preprocessor.
//!
//! Supported directives:
//!
//! | Directive | Notes |
//! |-----------|-------|
//! | `#include "x"` / `#include <x>` | callback, then sections, then filesystem |
//! | `#define NAME [value]` | object-like macros only |
//! | `#undef NAME` | |
//! | `#ifdef` / `#ifndef` / `#if` / `#elif` / `#else` / `#endif` | `#if` takes integer expressions |
//! | `#pragma once` | other pragmas are dropped |
//! | `#error message` | fails preprocessing |
//!
//! Defines passed in from outside follow command-line semantics: an empty
//! value defines the macro as `1`. A `#define NAME` in source defines it empty.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::GraphicsError;

use super::sections::{SECTION_SUFFIXES, SectionRegistry};

/// Nesting limit for includes and macro expansion.
const MAX_DEPTH: usize = 64;

/// Caller-supplied include resolver, tried before sections and files.
pub trait IncludeHandler: Send + Sync {
    /// Source of `name` included from `from`, or `None` to fall through.
    fn resolve(&self, name: &str, from: &str) -> Option<String>;
}

impl<F> IncludeHandler for F
where
    F: Fn(&str, &str) -> Option<String> + Send + Sync,
{
    fn resolve(&self, name: &str, from: &str) -> Option<String> {
        self(name, from)
    }
}

struct Conditional {
    /// Lines in the current branch are emitted.
    active: bool,
    /// Some branch of this block was taken already.
    taken: bool,
    /// The enclosing block is active.
    parent_active: bool,
    seen_else: bool,
}

/// Expands a shader source into a single translation unit.
pub struct Preprocessor<'a> {
    defines: HashMap<String, String>,
    sections: Option<&'a SectionRegistry>,
    handler: Option<&'a dyn IncludeHandler>,
    root: PathBuf,
    once: HashSet<String>,
    depth: usize,
}

impl Default for Preprocessor<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Preprocessor<'a> {
    /// Preprocessor resolving file includes against the working directory.
    pub fn new() -> Self {
        Self {
            defines: HashMap::new(),
            sections: None,
            handler: None,
            root: PathBuf::from("."),
            once: HashSet::new(),
            depth: 0,
        }
    }

    pub fn with_sections(mut self, sections: &'a SectionRegistry) -> Self {
        self.sections = Some(sections);
        self
    }

    pub fn with_include_handler(mut self, handler: &'a dyn IncludeHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Resolve file includes against `root` instead of the working directory.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Define a macro. An empty value defines it as `1`.
    pub fn define(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        let value = if value.is_empty() { "1".to_string() } else { value };
        self.defines.insert(name.into(), value);
    }

    pub fn undefine(&mut self, name: &str) {
        self.defines.remove(name);
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.defines.contains_key(name)
    }

    /// Current value of a macro.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.defines.get(name).map(String::as_str)
    }

    /// Preprocess `source`, reporting errors against `file`.
    pub fn process(&mut self, file: &str, source: &str) -> Result<String, GraphicsError> {
        let mut output = String::with_capacity(source.len());
        self.process_into(file, source, &mut output)?;
        Ok(output)
    }

    fn process_into(
        &mut self,
        file: &str,
        source: &str,
        output: &mut String,
    ) -> Result<(), GraphicsError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            self.depth -= 1;
            return Err(preprocess_error(file, 0, "include nesting too deep"));
        }
        let result = self.process_lines(file, source, output);
        self.depth -= 1;
        result
    }

    fn process_lines(
        &mut self,
        file: &str,
        source: &str,
        output: &mut String,
    ) -> Result<(), GraphicsError> {
        let mut stack: Vec<Conditional> = Vec::new();
        let mut lines = source.lines().enumerate();

        while let Some((index, raw)) = lines.next() {
            let line_no = index + 1;
            let active = stack.last().is_none_or(|c| c.active);

            let trimmed = raw.trim_start();
            let Some(directive) = trimmed.strip_prefix('#') else {
                if active {
                    output.push_str(&self.substitute(raw, 0));
                }
                output.push('\n');
                continue;
            };

            // Directives may continue onto the next line with a trailing backslash.
            let mut directive = directive.to_string();
            while directive.ends_with('\\') {
                directive.pop();
                match lines.next() {
                    Some((_, next)) => {
                        directive.push(' ');
                        directive.push_str(next.trim());
                        output.push('\n');
                    }
                    None => break,
                }
            }

            let directive = strip_comment(&directive).trim();
            let (keyword, rest) = split_keyword(directive);

            match keyword {
                "ifdef" | "ifndef" => {
                    let name = expect_name(file, line_no, keyword, rest)?;
                    let condition = self.is_defined(name) == (keyword == "ifdef");
                    stack.push(Conditional {
                        active: active && condition,
                        taken: condition,
                        parent_active: active,
                        seen_else: false,
                    });
                }
                "if" => {
                    let condition = active && self.evaluate(file, line_no, rest)? != 0;
                    stack.push(Conditional {
                        active: condition,
                        taken: condition,
                        parent_active: active,
                        seen_else: false,
                    });
                }
                "elif" => {
                    let Some(top) = stack.last() else {
                        return Err(preprocess_error(file, line_no, "#elif without #if"));
                    };
                    if top.seen_else {
                        return Err(preprocess_error(file, line_no, "#elif after #else"));
                    }
                    let condition = top.parent_active
                        && !top.taken
                        && self.evaluate(file, line_no, rest)? != 0;
                    if let Some(top) = stack.last_mut() {
                        top.active = condition;
                        top.taken |= condition;
                    }
                }
                "else" => {
                    let Some(top) = stack.last_mut() else {
                        return Err(preprocess_error(file, line_no, "#else without #if"));
                    };
                    if top.seen_else {
                        return Err(preprocess_error(file, line_no, "duplicate #else"));
                    }
                    top.seen_else = true;
                    top.active = top.parent_active && !top.taken;
                    top.taken = true;
                }
                "endif" => {
                    if stack.pop().is_none() {
                        return Err(preprocess_error(file, line_no, "#endif without #if"));
                    }
                }
                _ if !active => {}
                "define" => {
                    let (name, value) = split_keyword(rest);
                    if !is_identifier(name) {
                        return Err(preprocess_error(
                            file,
                            line_no,
                            format!("invalid macro name \"{name}\""),
                        ));
                    }
                    self.defines.insert(name.to_string(), value.trim().to_string());
                }
                "undef" => {
                    let name = expect_name(file, line_no, keyword, rest)?;
                    self.defines.remove(name);
                }
                "include" => {
                    let name = parse_include_target(rest).ok_or_else(|| {
                        preprocess_error(file, line_no, "expected \"file\" or <file> after #include")
                    })?;
                    self.include(file, name, output)?;
                }
                "pragma" => {
                    if rest == "once" {
                        self.once.insert(file.to_string());
                    }
                }
                "error" => {
                    return Err(preprocess_error(file, line_no, format!("#error {rest}")));
                }
                other => {
                    return Err(preprocess_error(
                        file,
                        line_no,
                        format!("unknown directive #{other}"),
                    ));
                }
            }
            output.push('\n');
        }

        if !stack.is_empty() {
            return Err(preprocess_error(
                file,
                source.lines().count(),
                "unterminated conditional block",
            ));
        }
        Ok(())
    }

    fn include(&mut self, from: &str, name: &str, output: &mut String) -> Result<(), GraphicsError> {
        let (key, source) = self.resolve_include(name, from)?;
        if self.once.contains(&key) {
            return Ok(());
        }
        self.process_into(&key, &source, output)
    }

    /// Find an include. Returns the file key used for `#pragma once` and diagnostics.
    fn resolve_include(&self, name: &str, from: &str) -> Result<(String, String), GraphicsError> {
        if let Some(source) = self.handler.and_then(|h| h.resolve(name, from)) {
            return Ok((name.to_string(), source));
        }

        if let Some((key, source)) = self.sections.and_then(|s| s.resolve(name)) {
            return Ok((key.to_string(), source.to_string()));
        }

        for candidate in file_candidates(&self.root, name) {
            if candidate.is_file() {
                let source = std::fs::read_to_string(&candidate)?;
                return Ok((candidate.to_string_lossy().into_owned(), source));
            }
        }

        Err(GraphicsError::IncludeNotFound {
            name: name.to_string(),
            from: from.to_string(),
        })
    }

    /// Replace macro identifiers outside line comments.
    fn substitute(&self, line: &str, depth: usize) -> String {
        if self.defines.is_empty() || depth > MAX_DEPTH {
            return line.to_string();
        }

        let mut result = String::with_capacity(line.len());
        let mut rest = line;
        while !rest.is_empty() {
            if rest.starts_with("//") {
                result.push_str(rest);
                break;
            }
            let Some(c) = rest.chars().next() else { break };
            if c.is_ascii_alphabetic() || c == '_' {
                let end = rest
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(rest.len());
                let word = &rest[..end];
                match self.defines.get(word) {
                    Some(value) if value != word => {
                        result.push_str(&self.substitute(value, depth + 1));
                    }
                    _ => result.push_str(word),
                }
                rest = &rest[end..];
            } else if c.is_ascii_digit() {
                // Number literals like `1e5f` or `0x1u` are never macros.
                let end = rest
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
                    .unwrap_or(rest.len());
                result.push_str(&rest[..end]);
                rest = &rest[end..];
            } else {
                result.push(c);
                rest = &rest[c.len_utf8()..];
            }
        }
        result
    }

    fn evaluate(&self, file: &str, line: usize, expression: &str) -> Result<i64, GraphicsError> {
        let tokens = tokenize(expression).map_err(|m| preprocess_error(file, line, m))?;
        let mut expanded = Vec::with_capacity(tokens.len());
        self.expand(&tokens, &mut HashSet::new(), &mut expanded)
            .map_err(|m| preprocess_error(file, line, m))?;

        let mut parser = ExprParser {
            tokens: &expanded,
            pos: 0,
        };
        let value = parser
            .parse_or()
            .map_err(|m| preprocess_error(file, line, m))?;
        if parser.pos != expanded.len() {
            return Err(preprocess_error(
                file,
                line,
                format!("unexpected token in #if: {expression}"),
            ));
        }
        Ok(value)
    }

    /// Resolve `defined` and macro names to numbers.
    fn expand(
        &self,
        tokens: &[Token],
        active: &mut HashSet<String>,
        out: &mut Vec<Token>,
    ) -> Result<(), String> {
        let mut i = 0;
        while i < tokens.len() {
            match &tokens[i] {
                Token::Ident(word) if word == "defined" => {
                    let (name, consumed) = match tokens.get(i + 1..i + 4) {
                        Some([Token::Op("("), Token::Ident(name), Token::Op(")")]) => (name, 4),
                        _ => match tokens.get(i + 1) {
                            Some(Token::Ident(name)) => (name, 2),
                            _ => return Err("expected macro name after defined".into()),
                        },
                    };
                    out.push(Token::Number(i64::from(self.is_defined(name))));
                    i += consumed;
                }
                Token::Ident(word) => {
                    match self.defines.get(word) {
                        Some(value) if !active.contains(word) => {
                            if active.len() >= MAX_DEPTH {
                                return Err("macro expansion too deep".into());
                            }
                            let inner = tokenize(value)?;
                            if inner.is_empty() {
                                return Err(format!("macro {word} has no value"));
                            }
                            active.insert(word.clone());
                            out.push(Token::Op("("));
                            self.expand(&inner, active, out)?;
                            out.push(Token::Op(")"));
                            active.remove(word);
                        }
                        // Unknown identifiers evaluate to zero.
                        _ => out.push(Token::Number(0)),
                    }
                    i += 1;
                }
                other => {
                    out.push(other.clone());
                    i += 1;
                }
            }
        }
        Ok(())
    }
}

fn preprocess_error(file: &str, line: usize, message: impl Into<String>) -> GraphicsError {
    GraphicsError::Preprocess {
        file: file.to_string(),
        line,
        message: message.into(),
    }
}

fn file_candidates(root: &Path, name: &str) -> Vec<PathBuf> {
    let mut candidates = vec![root.join(name)];
    candidates.extend(
        SECTION_SUFFIXES
            .iter()
            .map(|suffix| root.join(format!("{name}{suffix}"))),
    );
    candidates
}

fn split_keyword(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    let end = text
        .find(|c: char| c.is_whitespace() || c == '"' || c == '<' || c == '(')
        .unwrap_or(text.len());
    (&text[..end], text[end..].trim())
}

fn expect_name<'s>(
    file: &str,
    line: usize,
    keyword: &str,
    rest: &'s str,
) -> Result<&'s str, GraphicsError> {
    let name = rest.split_whitespace().next().unwrap_or("");
    if is_identifier(name) {
        Ok(name)
    } else {
        Err(preprocess_error(
            file,
            line,
            format!("expected macro name after #{keyword}"),
        ))
    }
}

fn is_identifier(word: &str) -> bool {
    let mut chars = word.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn strip_comment(text: &str) -> &str {
    match text.find("//") {
        Some(index) => &text[..index],
        None => text,
    }
}

/// Parse a `"path"` or `<path>` include target.
fn parse_include_target(rest: &str) -> Option<&str> {
    let rest = rest.trim();
    if let Some(inner) = rest.strip_prefix('"') {
        inner.strip_suffix('"')
    } else if let Some(inner) = rest.strip_prefix('<') {
        inner.strip_suffix('>')
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Number(i64),
    Ident(String),
    Op(&'static str),
}

const OPERATORS: [&str; 18] = [
    "&&", "||", "==", "!=", "<=", ">=", "<", ">", "!", "(", ")", "+", "-", "*", "/", "%", "&",
    "|",
];

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut rest = text.trim();
    while let Some(c) = rest.chars().next() {
        if c.is_whitespace() {
            rest = rest.trim_start();
            continue;
        }
        if c.is_ascii_digit() {
            let end = rest
                .find(|c: char| !c.is_ascii_alphanumeric())
                .unwrap_or(rest.len());
            tokens.push(Token::Number(parse_number(&rest[..end])?));
            rest = &rest[end..];
        } else if c.is_ascii_alphabetic() || c == '_' {
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            tokens.push(Token::Ident(rest[..end].to_string()));
            rest = &rest[end..];
        } else if let Some(op) = OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            tokens.push(Token::Op(*op));
            rest = &rest[op.len()..];
        } else {
            return Err(format!("unexpected character '{c}' in expression"));
        }
    }
    Ok(tokens)
}

fn parse_number(literal: &str) -> Result<i64, String> {
    let digits = literal.trim_end_matches(['u', 'U', 'l', 'L', 'i']);
    let parsed = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16)
    } else {
        digits.parse::<i64>()
    };
    parsed.map_err(|_| format!("invalid number \"{literal}\""))
}

struct ExprParser<'t> {
    tokens: &'t [Token],
    pos: usize,
}

impl ExprParser<'_> {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn eat(&mut self, ops: &[&str]) -> Option<&'static str> {
        let op = self.peek_op().filter(|op| ops.contains(op))?;
        self.pos += 1;
        Some(op)
    }

    fn parse_or(&mut self) -> Result<i64, String> {
        let mut value = self.parse_and()?;
        while self.eat(&["||"]).is_some() {
            let rhs = self.parse_and()?;
            value = i64::from(value != 0 || rhs != 0);
        }
        Ok(value)
    }

    fn parse_and(&mut self) -> Result<i64, String> {
        let mut value = self.parse_bit_or()?;
        while self.eat(&["&&"]).is_some() {
            let rhs = self.parse_bit_or()?;
            value = i64::from(value != 0 && rhs != 0);
        }
        Ok(value)
    }

    fn parse_bit_or(&mut self) -> Result<i64, String> {
        let mut value = self.parse_bit_and()?;
        while self.eat(&["|"]).is_some() {
            value |= self.parse_bit_and()?;
        }
        Ok(value)
    }

    fn parse_bit_and(&mut self) -> Result<i64, String> {
        let mut value = self.parse_equality()?;
        while self.eat(&["&"]).is_some() {
            value &= self.parse_equality()?;
        }
        Ok(value)
    }

    fn parse_equality(&mut self) -> Result<i64, String> {
        let mut value = self.parse_relational()?;
        while let Some(op) = self.eat(&["==", "!="]) {
            let rhs = self.parse_relational()?;
            value = i64::from(if op == "==" { value == rhs } else { value != rhs });
        }
        Ok(value)
    }

    fn parse_relational(&mut self) -> Result<i64, String> {
        let mut value = self.parse_additive()?;
        while let Some(op) = self.eat(&["<=", ">=", "<", ">"]) {
            let rhs = self.parse_additive()?;
            value = i64::from(match op {
                "<=" => value <= rhs,
                ">=" => value >= rhs,
                "<" => value < rhs,
                _ => value > rhs,
            });
        }
        Ok(value)
    }

    fn parse_additive(&mut self) -> Result<i64, String> {
        let mut value = self.parse_multiplicative()?;
        while let Some(op) = self.eat(&["+", "-"]) {
            let rhs = self.parse_multiplicative()?;
            value = if op == "+" {
                value.wrapping_add(rhs)
            } else {
                value.wrapping_sub(rhs)
            };
        }
        Ok(value)
    }

    fn parse_multiplicative(&mut self) -> Result<i64, String> {
        let mut value = self.parse_unary()?;
        while let Some(op) = self.eat(&["*", "/", "%"]) {
            let rhs = self.parse_unary()?;
            value = match op {
                "*" => value.wrapping_mul(rhs),
                _ if rhs == 0 => return Err("division by zero in #if".into()),
                "/" => value.wrapping_div(rhs),
                _ => value.wrapping_rem(rhs),
            };
        }
        Ok(value)
    }

    fn parse_unary(&mut self) -> Result<i64, String> {
        match self.eat(&["!", "-", "+"]) {
            Some("!") => Ok(i64::from(self.parse_unary()? == 0)),
            Some("-") => Ok(self.parse_unary()?.wrapping_neg()),
            Some(_) => self.parse_unary(),
            None => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<i64, String> {
        match self.tokens.get(self.pos) {
            Some(Token::Number(n)) => {
                self.pos += 1;
                Ok(*n)
            }
            Some(Token::Op("(")) => {
                self.pos += 1;
                let value = self.parse_or()?;
                if self.eat(&[")"]).is_none() {
                    return Err("missing ')' in #if".into());
                }
                Ok(value)
            }
            Some(other) => Err(format!("unexpected {other:?} in #if")),
            None => Err("expected expression".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Result<String, GraphicsError> {
        Preprocessor::new().process("test.wgsl", source)
    }

    fn lines(output: &str) -> Vec<&str> {
        output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect()
    }

    #[test]
    fn test_ifdef_else() {
        let mut pp = Preprocessor::new();
        pp.define("USE_RED", "");
        let out = pp
            .process(
                "t.wgsl",
                "#ifdef USE_RED\nred\n#else\ngreen\n#endif\n#ifndef USE_RED\nblue\n#endif",
            )
            .unwrap();
        assert_eq!(lines(&out), vec!["red"]);
    }

    #[test]
    fn test_if_elif_expression() {
        let mut pp = Preprocessor::new();
        pp.define("LIGHTS", "4");
        pp.define("SHADOWS", "");
        let source = "\
#if LIGHTS > 8
many
#elif LIGHTS >= 4 && defined(SHADOWS)
some
#elif 1
fallback
#else
none
#endif";
        assert_eq!(lines(&pp.process("t.wgsl", source).unwrap()), vec!["some"]);
    }

    #[test]
    fn test_nested_inactive_block() {
        let source = "\
#if 0
#ifdef ANYTHING
a
#else
b
#endif
#else
c
#endif";
        assert_eq!(lines(&run(source).unwrap()), vec!["c"]);
    }

    #[test]
    fn test_macro_substitution() {
        let source = "#define COUNT 8\n#define DOUBLE (COUNT * 2)\nvar<private> a: array<f32, DOUBLE>; // COUNT";
        let out = run(source).unwrap();
        assert_eq!(
            lines(&out),
            vec!["var<private> a: array<f32, (8 * 2)>; // COUNT"]
        );
    }

    #[test]
    fn test_substitution_respects_identifier_boundaries() {
        let mut pp = Preprocessor::new();
        pp.define("N", "3");
        let out = pp.process("t.wgsl", "let N_MAX = N + 1e5;").unwrap();
        assert_eq!(lines(&out), vec!["let N_MAX = 3 + 1e5;"]);
    }

    #[test]
    fn test_undef() {
        let source = "#define A\n#undef A\n#ifdef A\nyes\n#else\nno\n#endif";
        assert_eq!(lines(&run(source).unwrap()), vec!["no"]);
    }

    #[test]
    fn test_error_directive() {
        let err = run("#if 1\n#error unsupported target\n#endif").unwrap_err();
        match err {
            GraphicsError::Preprocess { line, message, .. } => {
                assert_eq!(line, 2);
                assert!(message.contains("unsupported target"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_error_in_inactive_block_is_skipped() {
        assert!(run("#ifdef MISSING\n#error never\n#endif\nok").is_ok());
    }

    #[test]
    fn test_unbalanced_conditionals() {
        assert!(matches!(
            run("#ifdef A\nx"),
            Err(GraphicsError::Preprocess { .. })
        ));
        assert!(matches!(
            run("#endif"),
            Err(GraphicsError::Preprocess { .. })
        ));
    }

    #[test]
    fn test_missing_include() {
        let err = run("#include \"nonexistent/file.wgsl\"").unwrap_err();
        assert!(matches!(
            err,
            GraphicsError::IncludeNotFound { ref name, ref from }
                if name == "nonexistent/file.wgsl" && from == "test.wgsl"
        ));
    }

    #[test]
    fn test_include_handler_and_pragma_once() {
        let handler = |name: &str, _from: &str| {
            (name == "shared").then(|| "#pragma once\nconst SHARED: f32 = 1.0;".to_string())
        };
        let mut pp = Preprocessor::new().with_include_handler(&handler);
        let out = pp
            .process("main.wgsl", "#include \"shared\"\n#include <shared>\nbody")
            .unwrap();
        assert_eq!(lines(&out), vec!["const SHARED: f32 = 1.0;", "body"]);
    }

    #[test]
    fn test_include_from_sections() {
        let mut sections = SectionRegistry::new();
        sections.add("lib.wgsl", "fn lib() {}");
        let mut pp = Preprocessor::new().with_sections(&sections);
        let out = pp.process("main.wgsl", "#include \"lib\"").unwrap();
        assert_eq!(lines(&out), vec!["fn lib() {}"]);
    }

    #[test]
    fn test_include_from_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("util.wgsl"), "fn util() {}").unwrap();
        let mut pp = Preprocessor::new().with_root(dir.path());
        let out = pp.process("main.wgsl", "#include \"util\"").unwrap();
        assert_eq!(lines(&out), vec!["fn util() {}"]);
    }

    #[test]
    fn test_recursive_include_is_bounded() {
        let handler = |_: &str, _: &str| Some("#include \"self\"".to_string());
        let mut pp = Preprocessor::new().with_include_handler(&handler);
        assert!(matches!(
            pp.process("main.wgsl", "#include \"self\""),
            Err(GraphicsError::Preprocess { .. })
        ));
    }

    #[test]
    fn test_division_by_zero() {
        assert!(run("#if 1 / 0\n#endif").is_err());
    }

    #[test]
    fn test_line_numbers_preserved() {
        let out = run("#define A 1\n\nline3").unwrap();
        assert_eq!(out.lines().nth(2), Some("line3"));
    }
}
