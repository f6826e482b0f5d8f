//! Best-effort parser for Codex's `error=<HTTP_ERROR>: Some("<escaped JSON>")`
//! stderr lines.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedStderrError {
    pub error_type: String,
    pub message: String,
    pub resets_in_seconds: Option<u64>,
}

#[derive(Deserialize)]
struct RawError {
    #[serde(rename = "type")]
    error_type: Option<String>,
    message: Option<String>,
    resets_in_seconds: Option<Value>,
}

/// Scans `lines` (most-recent-last, as captured from a tailed stderr buffer)
/// for the most recent line matching `error=<kind>: Some("<json>")` and
/// extracts the structured fields. Returns `None` if no line parses.
pub fn parse_recent(lines: &[String]) -> Option<ParsedStderrError> {
    lines.iter().rev().find_map(|line| parse_line(line))
}

fn parse_line(line: &str) -> Option<ParsedStderrError> {
    let rest = line.split_once("error=")?.1;
    let (_kind, tail) = rest.split_once(": Some(")?;
    let quoted = tail.strip_suffix(')').unwrap_or(tail).trim();
    let escaped = quoted.strip_prefix('"')?.strip_suffix('"')?;
    let unescaped = unescape(escaped);

    let raw: RawError = serde_json::from_str(&unescaped).ok()?;
    Some(ParsedStderrError {
        error_type: raw.error_type.unwrap_or_else(|| "unknown".to_string()),
        message: raw.message.unwrap_or_default(),
        resets_in_seconds: raw.resets_in_seconds.and_then(resets_to_seconds),
    })
}

fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some('n') => out.push('\n'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Accepts either a bare number of seconds or a `"<N>h"`/`"<N>m"`/`"<N>s"`
/// unit-scaled string.
fn resets_to_seconds(value: Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            let (digits, unit) = s.split_at(s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len()));
            let amount: u64 = digits.parse().ok()?;
            let scale = match unit {
                "h" | "hr" | "hour" | "hours" => 3600,
                "m" | "min" | "minute" | "minutes" => 60,
                "s" | "sec" | "second" | "seconds" | "" => 1,
                _ => return None,
            };
            Some(amount * scale)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seconds_and_message() {
        let line = r#"error=RateLimitExceeded: Some("{\"type\":\"rate_limit\",\"message\":\"too many requests\",\"resets_in_seconds\":3600}")"#;
        let parsed = parse_line(line).unwrap();
        assert_eq!(parsed.error_type, "rate_limit");
        assert_eq!(parsed.message, "too many requests");
        assert_eq!(parsed.resets_in_seconds, Some(3600));
    }

    #[test]
    fn parses_unit_scaled_reset() {
        let line = r#"error=RateLimitExceeded: Some("{\"type\":\"rate_limit\",\"message\":\"slow down\",\"resets_in_seconds\":\"2h\"}")"#;
        let parsed = parse_line(line).unwrap();
        assert_eq!(parsed.resets_in_seconds, Some(7200));
    }

    #[test]
    fn picks_most_recent_parseable_line() {
        let lines = vec![
            "some unrelated log line".to_string(),
            r#"error=RateLimitExceeded: Some("{\"type\":\"rate_limit\",\"message\":\"first\"}")"#.to_string(),
            r#"error=RateLimitExceeded: Some("{\"type\":\"rate_limit\",\"message\":\"second\"}")"#.to_string(),
        ];
        let parsed = parse_recent(&lines).unwrap();
        assert_eq!(parsed.message, "second");
    }

    #[test]
    fn non_matching_line_returns_none() {
        assert!(parse_line("plain stderr output").is_none());
    }
}
