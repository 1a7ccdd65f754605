/// Code Transformer - Multi-Case Harness Generation
///
/// Turns a user's single-case `solve` routine into a complete C++ program
/// that reads `T` from the first line of stdin and calls `solve()` exactly
/// `T` times. One remote submission can then run a whole batch.
///
/// Snippets that already carry their own `main` are passed through untouched
/// and flagged `single_case_only`; the orchestrator then submits each test
/// case on its own.
///
/// Pure: no I/O, same input always yields the same output.

use std::collections::HashSet;

use lazy_regex::{lazy_regex, Regex};

use crate::error::TransformError;

static RE_INCLUDE: lazy_regex::Lazy<Regex> = lazy_regex!(r#"^\s*#\s*include\s*([<"][^>"]+[>"])"#);
static RE_USING_STD: lazy_regex::Lazy<Regex> = lazy_regex!(r"^\s*using\s+namespace\s+std\s*;\s*$");

// `<type> <name>(<params>) {` - a function definition, not a call or prototype
static RE_FUNCTION_DEF: lazy_regex::Lazy<Regex> = lazy_regex!(
    r"\b[A-Za-z_][\w:]*(?:<[^<>;{}]*>)?[\s&*]+([A-Za-z_]\w*)\s*\([^;{}()]*\)\s*(?:const\s*)?\{"
);

const PROGRAM_ENTRY: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessTemplate {
    /// Name of the per-case routine the driver calls
    pub entry_point: String,
    pub headers: Vec<String>,
    pub preamble: Vec<String>,
}

impl Default for HarnessTemplate {
    fn default() -> Self {
        Self {
            entry_point: "solve".to_string(),
            headers: vec!["#include <bits/stdc++.h>".to_string()],
            preamble: vec!["using namespace std;".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedProgram {
    pub source: String,
    /// The snippet was a complete program; batch it one case per submission
    pub single_case_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CodeTransformer {
    template: HarnessTemplate,
}

impl CodeTransformer {
    pub fn new(template: HarnessTemplate) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &HarnessTemplate {
        &self.template
    }

    pub fn transform(&self, user_code: &str) -> Result<TransformedProgram, TransformError> {
        let masked = mask_comments_and_literals(user_code);
        let defined = defined_functions(&masked);

        let entry_count = defined.iter().filter(|name| *name == PROGRAM_ENTRY).count();
        if entry_count > 1 {
            return Err(TransformError::ConflictingEntryPoints(entry_count));
        }
        if entry_count == 1 {
            // Full program, with or without a solve routine: leave it alone
            return Ok(TransformedProgram {
                source: user_code.to_string(),
                single_case_only: true,
            });
        }

        if !defined.iter().any(|name| *name == self.template.entry_point) {
            return Err(TransformError::MissingEntryPoint(self.template.entry_point.clone()));
        }

        let source = self.assemble(user_code, &masked);

        let assembled_entries = defined_functions(&mask_comments_and_literals(&source))
            .iter()
            .filter(|name| *name == PROGRAM_ENTRY)
            .count();
        if assembled_entries != 1 {
            return Err(TransformError::ConflictingEntryPoints(assembled_entries));
        }

        Ok(TransformedProgram {
            source,
            single_case_only: false,
        })
    }

    /// `masked` is `user_code` after `mask_comments_and_literals`; the two
    /// have the same line structure
    fn assemble(&self, user_code: &str, masked: &str) -> String {
        let lines: Vec<(&str, &str)> = user_code.lines().zip(masked.lines()).collect();
        let first_include = lines.iter().position(|(_, m)| RE_INCLUDE.is_match(m));

        // `#define` / `#pragma` lines ahead of the user's first include must
        // keep preceding every include
        let mut leading: Vec<&str> = Vec::new();
        let mut hoisted = vec![false; lines.len()];
        let mut continued = false;
        for (i, (raw, m)) in lines.iter().enumerate().take(first_include.unwrap_or(0)) {
            if continued || m.trim_start().starts_with('#') {
                leading.push(raw.trim_end());
                hoisted[i] = true;
                continued = raw.trim_end().ends_with('\\');
            }
        }

        let mut seen_includes: HashSet<String> = HashSet::new();
        let mut includes: Vec<String> = Vec::new();

        for header in &self.template.headers {
            if let Some(key) = include_key(header) {
                if seen_includes.insert(key) {
                    includes.push(header.trim().to_string());
                }
            }
        }

        let mut body = String::with_capacity(user_code.len());
        for (i, (line, m)) in lines.iter().enumerate() {
            if hoisted[i] {
                continue;
            }
            if RE_INCLUDE.is_match(m) {
                if let Some(key) = include_key(line) {
                    if seen_includes.insert(key) {
                        includes.push(line.trim().to_string());
                    }
                    continue;
                }
            }
            if RE_USING_STD.is_match(m) && self.has_using_std_preamble() {
                continue;
            }
            body.push_str(line);
            body.push('\n');
        }

        let mut s = String::with_capacity(256 + body.len());
        for line in &leading {
            s.push_str(line);
            s.push('\n');
        }
        for include in &includes {
            s += include;
            s.push('\n');
        }
        for line in &self.template.preamble {
            s += line;
            s.push('\n');
        }
        s.push('\n');
        s += body.trim_matches('\n');
        s.push_str("\n\n");
        s += &self.driver();
        s
    }

    fn has_using_std_preamble(&self) -> bool {
        self.template.preamble.iter().any(|line| RE_USING_STD.is_match(line))
    }

    /// `signed` / `long long` stay correct under `#define int long long`
    fn driver(&self) -> String {
        format!(
            "signed {main}() {{\n    \
             long long T;\n    \
             if (!(cin >> T)) return 0;\n    \
             cin.ignore(numeric_limits<streamsize>::max(), '\\n');\n    \
             while (T-- > 0) {{\n        \
             {entry}();\n    \
             }}\n    \
             return 0;\n\
             }}\n",
            main = PROGRAM_ENTRY,
            entry = self.template.entry_point,
        )
    }
}

/// Transform with the default C++ harness
pub fn transform(user_code: &str) -> Result<TransformedProgram, TransformError> {
    CodeTransformer::default().transform(user_code)
}

/// `#include <a>` and `#include<a>` are the same directive
fn include_key(line: &str) -> Option<String> {
    RE_INCLUDE
        .captures(line)
        .map(|cap| cap[1].chars().filter(|c| !c.is_whitespace()).collect())
}

fn defined_functions(masked_code: &str) -> Vec<String> {
    RE_FUNCTION_DEF
        .captures_iter(masked_code)
        .map(|cap| cap[1].to_string())
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// `number` is set while inside a numeric literal, where `'` is a digit
    /// separator (`10'000`)
    Code { number: bool },
    LineComment,
    BlockComment,
    Literal(char),
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Blank out comments and string/char literal contents, keeping line breaks,
/// so entry-point detection only sees real code
fn mask_comments_and_literals(code: &str) -> String {
    const CODE: Scan = Scan::Code { number: false };

    let mut out = String::with_capacity(code.len());
    let mut chars = code.chars().peekable();
    let mut state = CODE;
    let mut prev = '\n';

    while let Some(c) = chars.next() {
        match state {
            Scan::Code { number } => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = Scan::LineComment;
                    out.push_str("  ");
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = Scan::BlockComment;
                    out.push_str("  ");
                }
                '\'' if number && prev.is_ascii_alphanumeric() => out.push(c),
                '"' | '\'' => {
                    state = Scan::Literal(c);
                    out.push(c);
                }
                _ => {
                    let number = if is_ident_char(c) {
                        if is_ident_char(prev) { number } else { c.is_ascii_digit() }
                    } else {
                        false
                    };
                    state = Scan::Code { number };
                    out.push(c);
                }
            },
            Scan::LineComment => {
                if c == '\n' {
                    state = CODE;
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            Scan::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = CODE;
                    out.push_str("  ");
                } else {
                    out.push(if c == '\n' { '\n' } else { ' ' });
                }
            }
            Scan::Literal(quote) => {
                if c == '\\' {
                    out.push(' ');
                    if let Some(escaped) = chars.next() {
                        out.push(if escaped == '\n' { '\n' } else { ' ' });
                    }
                } else if c == quote {
                    state = CODE;
                    out.push(c);
                } else if c == '\n' {
                    // unterminated literal; it cannot span lines
                    state = CODE;
                    out.push(c);
                } else {
                    out.push(' ');
                }
            }
        }
        prev = c;
    }

    out
}
