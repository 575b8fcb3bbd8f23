//! Classification and diagnostics for failed tool-stage executions.
//!
//! A tool stage's raw stdout/stderr is rarely useful to a downstream
//! codergen prompt verbatim — it's too long, and the actual failure is
//! usually a handful of lines buried in a wall of build output. This module
//! trims it down to a [`attractor_types::ToolFailure`] that's cheap to embed
//! in a retry prompt.

use attractor_types::{ToolFailure, ToolFailureClass};

/// Tail extraction caps: last 30 lines, further capped at 4096 characters.
const TAIL_LINES: usize = 30;
const TAIL_CHARS: usize = 4096;

/// First-failing-check heuristics, checked in order against each line.
const CHECK_PATTERNS: &[&str] = &["FAIL  ", "● ", "FAILED: ", "not ok "];

/// Commands that look like a test runner, triggering the patterned digest
/// extraction instead of the generic fallback chain.
fn looks_like_test_runner(command: &str) -> bool {
    let re = regex::Regex::new(
        r"(?i)\bselfci\b|\b(npm run )?(test|check)\b|\bvitest\b|\bjest\b",
    )
    .unwrap();
    re.is_match(command)
}

/// Take the last [`TAIL_LINES`] lines of `text`, capped at [`TAIL_CHARS`]
/// characters (trimming from the front of the joined tail if still too long).
pub fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    let joined = lines[start..].join("\n");
    if joined.len() <= TAIL_CHARS {
        return joined;
    }
    let byte_start = joined.len() - TAIL_CHARS;
    let boundary = joined
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| i >= byte_start)
        .unwrap_or(joined.len());
    joined[boundary..].to_string()
}

/// Scan combined stdout+stderr for the first line matching a known
/// test-runner failure pattern (`FAIL  <name>`, `● <name>`, `FAILED: <name>`,
/// `not ok N - <name>`).
pub fn first_failing_check(combined: &str) -> Option<String> {
    combined
        .lines()
        .find(|line| CHECK_PATTERNS.iter().any(|p| line.contains(p)))
        .map(|l| l.trim().to_string())
}

/// Extract a "Tests: X failed, Y passed, Z total"-style summary from
/// test-runner output, dropping the leading "Tests:" label. Also recognizes
/// "X failing" and "Test suite failed" phrasing.
fn patterned_test_summary(combined: &str) -> Option<String> {
    let re_tests = regex::Regex::new(r"(?i)tests:\s*(.+failed.*)").unwrap();
    if let Some(caps) = re_tests.captures(combined) {
        return Some(caps[1].trim().to_string());
    }
    let re_failing = regex::Regex::new(r"(?i)(\d+\s+failing\b.*)").unwrap();
    if let Some(caps) = re_failing.captures(combined) {
        return Some(caps[1].trim().to_string());
    }
    let re_suite = regex::Regex::new(r"(?i)(test suite failed.*)").unwrap();
    if let Some(caps) = re_suite.captures(combined) {
        return Some(caps[1].trim().to_string());
    }
    None
}

fn first_nonempty_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|l| !l.is_empty())
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

/// Build a one-line digest summarizing the failure for quick scanning in
/// logs and re-review prompts.
pub fn digest(
    class: ToolFailureClass,
    command: &str,
    exit_code: Option<i32>,
    signal: Option<&str>,
    stdout: &str,
    stderr: &str,
) -> String {
    match class {
        ToolFailureClass::Timeout => format!("Timed out: {}", truncate_chars(command, 80)),
        ToolFailureClass::SpawnError => {
            let line = first_nonempty_line(stderr)
                .or_else(|| first_nonempty_line(stdout))
                .unwrap_or("unknown error");
            format!("Spawn error: {line}")
        }
        ToolFailureClass::ExitNonzero => {
            if looks_like_test_runner(command) {
                let combined = format!("{stdout}\n{stderr}");
                if let Some(summary) = patterned_test_summary(&combined) {
                    return summary;
                }
            }
            if let Some(line) = first_nonempty_line(stderr) {
                return line.to_string();
            }
            if let Some(line) = first_nonempty_line(stdout) {
                return line.to_string();
            }
            if let Some(sig) = signal {
                return format!("Killed by signal: {sig}");
            }
            format!("Exit code {}", exit_code.unwrap_or(-1))
        }
    }
}

/// Assemble a full [`ToolFailure`] from raw execution results. Artifact path
/// fields are filled in by the caller once the attempt directory is known.
#[allow(clippy::too_many_arguments)]
pub fn build(
    class: ToolFailureClass,
    command: &str,
    cwd: Option<String>,
    exit_code: Option<i32>,
    signal: Option<String>,
    duration_ms: u64,
    stdout: &str,
    stderr: &str,
) -> ToolFailure {
    let combined = if stderr.is_empty() {
        stdout.to_string()
    } else {
        format!("{stdout}\n{stderr}")
    };
    let first_failing_check = first_failing_check(&combined);
    let digest = digest(class, command, exit_code, signal.as_deref(), stdout, stderr);
    ToolFailure {
        failure_class: class,
        digest,
        command: command.to_string(),
        cwd,
        exit_code,
        signal,
        duration_ms,
        stdout_tail: tail(stdout),
        stderr_tail: tail(stderr),
        artifact_stdout: String::new(),
        artifact_stderr: String::new(),
        artifact_meta: String::new(),
        first_failing_check,
    }
}
