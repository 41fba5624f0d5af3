//! Static `require(...)` call-site discovery.
//!
//! The host builds the transitive dependency closure before the guest executes
//! a single statement, so call sites are found by scanning source text: string
//! and comment state is tracked so commented-out requires are ignored, then
//! literal-argument call sites are extracted from the stripped text.

use std::sync::LazyLock;

use regex::Regex;

static REQUIRE_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[^.\w$])require\s*\(\s*(?:'([^'\\]+)'|"([^"\\]+)")\s*\)"#)
        .expect("require call pattern")
});

/// Names required by `source`, in first-appearance order, deduplicated.
/// Only string-literal arguments are discovered; computed requires are
/// invisible to static analysis and fail at run time instead.
pub fn find_requires(source: &str) -> Vec<String> {
    let stripped = strip_comments(source);
    let mut seen = std::collections::HashSet::new();
    let mut names = Vec::new();
    for captures in REQUIRE_CALL.captures_iter(&stripped) {
        let name = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        if !name.is_empty() && seen.insert(name.to_string()) {
            names.push(name.to_string());
        }
    }
    names
}

#[derive(Clone, Copy, PartialEq)]
enum State {
    Code,
    LineComment,
    BlockComment,
    Str(char),
}

/// Replace comment text with spaces, leaving string literals intact so a `//`
/// inside a string does not eat the rest of the line.
fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut state = State::Code;
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::LineComment;
                    out.push_str("  ");
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                    out.push_str("  ");
                }
                '\'' | '"' | '`' => {
                    state = State::Str(c);
                    out.push(c);
                }
                _ => out.push(c),
            },
            State::LineComment => {
                if c == '\n' {
                    state = State::Code;
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                    out.push_str("  ");
                } else if c == '\n' {
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            State::Str(quote) => {
                out.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == quote {
                    state = State::Code;
                }
            }
        }
    }

    out
}
