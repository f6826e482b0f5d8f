use similar::{ChangeTag, TextDiff};

use crate::payload::NormalizedPayload;

/// Per-protocol translation from `(tool_name, args)`/result pairs into the
/// shared [`NormalizedPayload`] shape.
///
/// Each adapter crate implements this once for its protocol's tool-name and
/// argument-key vocabulary. The trait carries no protocol-specific
/// knowledge itself — it only fixes the shape every normalizer must expose.
pub trait ToolNormalizer {
    /// Maps a raw tool invocation to a freshly chosen payload variant. The
    /// variant returned here is the variant for the lifetime of the tool
    /// call: later enrichment only fills its `output` field.
    fn normalize_call(&self, tool_name: &str, args: &serde_json::Value) -> NormalizedPayload;

    /// Fills in the `output` field of `payload` from a result value,
    /// without changing which variant it is.
    fn enrich_result(&self, payload: NormalizedPayload, result: &serde_json::Value) -> NormalizedPayload;
}

/// Strips a Copilot-style `<exited with exit code N>` suffix from shell
/// output, returning the cleaned text and the parsed exit code if present.
pub fn strip_exit_code_suffix(output: &str) -> (String, Option<i32>) {
    const MARKER: &str = "<exited with exit code ";
    if let Some(start) = output.rfind(MARKER) {
        let rest = &output[start + MARKER.len()..];
        if let Some(end) = rest.find('>') {
            if let Ok(code) = rest[..end].parse::<i32>() {
                let cleaned = output[..start].trim_end_matches('\n').to_string();
                return (cleaned, Some(code));
            }
        }
    }
    (output.to_string(), None)
}

/// Builds a `diff --git` unified diff between `old` and `new` for `path`.
/// An empty `old` or `new` yields an empty diff.
///
/// Uses line-level diffing, matching the hunk shape `git diff` produces:
/// `--- a/<path>`, `+++ b/<path>`, `@@ -<old-range> +<new-range> @@`.
pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    if old.is_empty() || new.is_empty() {
        return String::new();
    }
    if old == new {
        return String::new();
    }

    let diff = TextDiff::from_lines(old, new);
    let mut out = String::new();
    out.push_str(&format!("diff --git a/{path} b/{path}\n"));
    out.push_str(&format!("--- a/{path}\n"));
    out.push_str(&format!("+++ b/{path}\n"));

    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        out.push_str(&hunk.header().to_string());
        out.push('\n');
        for change in hunk.iter_changes() {
            let sign = match change.tag() {
                ChangeTag::Delete => "-",
                ChangeTag::Insert => "+",
                ChangeTag::Equal => " ",
            };
            out.push_str(sign);
            out.push_str(change.value());
            if !change.value().ends_with('\n') {
                out.push('\n');
            }
        }
    }

    out
}

/// Maps a file extension to a highlighting language tag. Unknown
/// extensions fall back to `"plaintext"`.
pub fn detect_language(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "ts" | "tsx" => "typescript",
        "js" | "jsx" => "javascript",
        "py" => "python",
        "go" => "go",
        "rs" => "rust",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "hpp" => "cpp",
        "css" => "css",
        "html" => "html",
        "json" => "json",
        "md" => "markdown",
        "yaml" | "yml" => "yaml",
        "sh" | "bash" => "bash",
        _ => "plaintext",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_old_or_new_yields_empty_diff() {
        assert_eq!(unified_diff("a.rs", "", "fn main() {}\n"), "");
        assert_eq!(unified_diff("a.rs", "fn main() {}\n", ""), "");
    }

    #[test]
    fn identical_strings_yield_empty_diff() {
        assert_eq!(unified_diff("a.rs", "same\n", "same\n"), "");
    }

    #[test]
    fn diff_contains_standard_markers() {
        let d = unified_diff("a.rs", "fn old() {}\n", "fn new() {}\n");
        assert!(d.contains("diff --git a/a.rs b/a.rs"));
        assert!(d.contains("--- a/a.rs"));
        assert!(d.contains("+++ b/a.rs"));
        assert!(d.contains("@@ -"));
        assert!(d.lines().any(|l| l.starts_with('-') && l.contains("old")));
        assert!(d.lines().any(|l| l.starts_with('+') && l.contains("new")));
    }

    #[test]
    fn language_detection_covers_known_extensions() {
        assert_eq!(detect_language("main.rs"), "rust");
        assert_eq!(detect_language("index.tsx"), "typescript");
        assert_eq!(detect_language("script.py"), "python");
        assert_eq!(detect_language("README.md"), "markdown");
        assert_eq!(detect_language("notes.txt"), "plaintext");
        assert_eq!(detect_language("noextension"), "plaintext");
    }

    #[test]
    fn strips_copilot_exit_code_suffix() {
        let (cleaned, code) = strip_exit_code_suffix("hello\n<exited with exit code 0>");
        assert_eq!(cleaned, "hello");
        assert_eq!(code, Some(0));

        let (cleaned, code) = strip_exit_code_suffix("no marker here");
        assert_eq!(cleaned, "no marker here");
        assert_eq!(code, None);
    }
}
