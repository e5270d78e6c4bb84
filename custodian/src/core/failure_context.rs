//! Failure-context formatting for the external plan generator.

use std::fmt::Write;

use crate::core::report::{CommandResult, Report};

const STDOUT_LIMIT: usize = 8_000;
const STDERR_LIMIT: usize = 12_000;
const TRUNCATION_MARKER: &str = "\n...<truncated>...\n";

/// Build the failure summary handed to the plan generator: failed command,
/// exit code, kind, truncated output, and the verification results so far.
pub fn format_failure_context(report: &Report, failure: &CommandResult) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Failed command ({}/{}): {}",
        failure.index, failure.total, failure.command
    );
    let _ = writeln!(out, "Exit code: {}", failure.exit_code);
    let _ = writeln!(out, "Kind: {}", failure.kind_str());

    if !failure.stdout.trim().is_empty() {
        out.push_str("\nSTDOUT:\n");
        out.push_str(&trim_for_prompt(&failure.stdout, STDOUT_LIMIT));
        out.push('\n');
    }
    if !failure.stderr.trim().is_empty() {
        out.push_str("\nSTDERR:\n");
        out.push_str(&trim_for_prompt(&failure.stderr, STDERR_LIMIT));
        out.push('\n');
    }

    if !report.commands.is_empty() {
        out.push_str("\nVerification results so far:\n");
        for result in &report.commands {
            let status = if result.passed { "PASS" } else { "FAIL" };
            let _ = writeln!(
                out,
                "- [{}] {} (exit={} kind={})",
                status, result.command, result.exit_code, result.kind_str()
            );
        }
    }
    out
}

/// Truncate to `max` bytes, preserving head and tail around a marker. Head
/// gets two thirds of the allowance.
pub fn trim_for_prompt(text: &str, max: usize) -> String {
    let text = text.trim();
    if max == 0 || text.len() <= max {
        return text.to_string();
    }
    let keep_head = max * 2 / 3;
    let keep_tail = max - keep_head;
    let head_end = floor_char_boundary(text, keep_head);
    let tail_start = ceil_char_boundary(text, text.len() - keep_tail);
    format!("{}{}{}", &text[..head_end], TRUNCATION_MARKER, &text[tail_start..])
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{failed_result, passed_result};

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(trim_for_prompt("  hello  ", 100), "hello");
    }

    #[test]
    fn long_text_keeps_head_and_tail_around_marker() {
        let text = format!("HEAD{}TAIL", "x".repeat(500));
        let trimmed = trim_for_prompt(&text, 90);
        assert!(trimmed.starts_with("HEAD"));
        assert!(trimmed.ends_with("TAIL"));
        assert!(trimmed.contains("...<truncated>..."));
        assert!(trimmed.len() < text.len());
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        let text = "é".repeat(200);
        let trimmed = trim_for_prompt(&text, 99);
        // Must not panic and must keep the marker.
        assert!(trimmed.contains("...<truncated>..."));
    }

    #[test]
    fn context_lists_failure_and_prior_passes() {
        let failure = failed_result(2, 2, "go test ./...", "out line", "--- FAIL: TestFoo");
        let report = Report {
            commands: vec![passed_result(1, 2, "go build ./..."), failure.clone()],
        };

        let ctx = format_failure_context(&report, &failure);
        assert!(ctx.contains("Failed command (2/2): go test ./..."));
        assert!(ctx.contains("Exit code: 1"));
        assert!(ctx.contains("Kind: test_failure"));
        assert!(ctx.contains("STDOUT:\nout line"));
        assert!(ctx.contains("STDERR:\n--- FAIL: TestFoo"));
        assert!(ctx.contains("- [PASS] go build ./... (exit=0 kind=)"));
        assert!(ctx.contains("- [FAIL] go test ./..."));
    }
}
