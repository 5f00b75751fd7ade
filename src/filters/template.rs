//! Header and body templates.
//!
//! Resources are written with Go-style field references
//! (`{{.token.Claims.sub}}`). Inside every `{{ }}` expression the leading dot
//! of each field reference is dropped and the result rendered with
//! minijinja, so filters and operators work on references anywhere in the
//! expression (`{{ .a | default(.b) }}`). Go's own control actions
//! (`{{ if }}`, `{{ range }}`) are not translated; use minijinja's
//! `{% if %}` and `{% for %}` blocks instead.

use std::sync::OnceLock;

use minijinja::Environment;
use serde::Serialize;

fn env() -> &'static Environment<'static> {
    static ENV: OnceLock<Environment<'static>> = OnceLock::new();
    ENV.get_or_init(Environment::new)
}

/// Characters after which a `.` starts a field reference rather than
/// continuing an attribute path or a number.
fn opens_reference(prev: Option<char>) -> bool {
    prev.is_none_or(|c| c.is_whitespace() || "(|,[{~+-*/%=<>!:".contains(c))
}

/// Drop the leading dot of each field reference in one expression body.
fn convert_expression(body: &str, out: &mut String) {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut prev: Option<char> = None;
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
        } else if c == '"' || c == '\'' {
            quote = Some(c);
        } else if c == '.'
            && opens_reference(prev)
            && chars.peek().is_some_and(|n| n.is_alphabetic() || *n == '_')
        {
            prev = Some(c);
            continue;
        }
        out.push(c);
        prev = Some(c);
    }
}

/// Rewrite Go-style field references into minijinja expressions.
pub fn convert(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start + 2]);
        rest = &rest[start + 2..];

        let Some(end) = rest.find("}}") else {
            break;
        };
        convert_expression(&rest[..end], &mut out);
        out.push_str("}}");
        rest = &rest[end + 2..];
    }
    out.push_str(rest);
    out
}

/// Convert and syntax-check a template.
pub fn compile(source: &str) -> Result<String, minijinja::Error> {
    let converted = convert(source);
    let check = Environment::new();
    check.template_from_str(&converted)?;
    Ok(converted)
}

/// Render an already converted template.
pub fn render<S: Serialize>(template: &str, ctx: S) -> Result<String, minijinja::Error> {
    env().render_str(template, ctx)
}
