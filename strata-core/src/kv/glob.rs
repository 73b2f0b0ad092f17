//! Redis-style glob patterns (`*`, `?`, `[...]`, `\` escapes)

use regex::Regex;

use super::KvError;

/// Escape glob metacharacters so `literal` only matches itself.
pub fn escape_glob(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Compile a glob into an anchored regex.
pub fn glob_matcher(pattern: &str) -> Result<Regex, KvError> {
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');

    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '\\' => match chars.next() {
                Some(escaped) => re.push_str(&regex::escape(&escaped.to_string())),
                None => re.push_str(r"\\"),
            },
            '[' => {
                re.push('[');
                let mut closed = false;
                let mut first = true;
                for c in chars.by_ref() {
                    match c {
                        ']' => {
                            closed = true;
                            break;
                        }
                        '^' if first => re.push('^'),
                        '\\' | '[' | '&' | '~' => {
                            re.push('\\');
                            re.push(c);
                        }
                        _ => re.push(c),
                    }
                    first = false;
                }
                if !closed {
                    return Err(KvError::Pattern {
                        pattern: pattern.to_string(),
                        reason: "unterminated character class".to_string(),
                    });
                }
                re.push(']');
            }
            _ => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');

    Regex::new(&re).map_err(|e| KvError::Pattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}
