//! Failure classification over captured build output.
//!
//! `classify` is a pure, ordered substring match: the first category whose
//! markers appear in the lowercased tail wins, and anything unrecognised
//! falls back to `BUILD_ERROR`.

use super::models::ErrorType;

/// Ordered rules; earlier entries take priority.
const RULES: &[(ErrorType, &[&str])] = &[
    (
        ErrorType::OutOfMemory,
        &[
            "out of memory",
            "heap out of memory",
            "javascript heap",
            "allocation failed",
            "cannot allocate memory",
            "enomem",
        ],
    ),
    (
        ErrorType::ConnectionError,
        &[
            "econnrefused",
            "connection refused",
            "econnreset",
            "etimedout",
            "connection timed out",
            "socket hang up",
            "getaddrinfo enotfound",
        ],
    ),
    (
        ErrorType::ModuleNotFound,
        &[
            "module not found",
            "cannot find module",
            "err_module_not_found",
            "can't resolve",
        ],
    ),
    (
        ErrorType::SyntaxError,
        &["syntax error", "syntaxerror", "unexpected token", "parsing error"],
    ),
    (
        ErrorType::TypeError,
        &[
            "type error",
            "typeerror",
            "typescript error",
            "is not assignable to type",
        ],
    ),
];

/// Exit status reported for a process killed by SIGKILL (128 + 9), which is
/// what the kernel OOM killer leaves behind.
const SIGKILL_EXIT: i32 = 137;

/// Classify a failed build from the tail of its output and its exit code.
pub fn classify(log_tail: &str, exit_code: Option<i32>) -> ErrorType {
    let haystack = log_tail.to_lowercase();
    for (error_type, markers) in RULES {
        if markers.iter().any(|marker| haystack.contains(marker)) {
            return *error_type;
        }
        if *error_type == ErrorType::OutOfMemory && exit_code == Some(SIGKILL_EXIT) {
            return ErrorType::OutOfMemory;
        }
    }
    ErrorType::BuildError
}

/// The last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let total = text.chars().count();
    if total <= max_chars {
        return text;
    }
    let skip = total - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

/// Line prefixes that mark an error worth surfacing in the record message.
const ERROR_LINE_MARKERS: &[&str] = &[
    "[error]",
    "error:",
    "build error",
    "failed to compile",
    "fatal error",
    "heap out of memory",
];

const MAX_SUMMARY_LINES: usize = 10;

/// Short human-readable message plus the stored `error` text for a failed run.
pub fn summarize_failure(log_tail: &str, exit_code: Option<i32>) -> (String, String) {
    let errors: Vec<&str> = log_tail
        .lines()
        .map(str::trim)
        .filter(|line| {
            let lower = line.to_lowercase();
            ERROR_LINE_MARKERS.iter().any(|m| lower.contains(m))
        })
        .collect();

    let message = match (errors.first(), exit_code) {
        (Some(first), _) => format!("Build failed: {}", first),
        (None, Some(code)) => format!("Build failed with exit code {}", code),
        (None, None) => "Build failed: process terminated by signal".to_string(),
    };

    let error = if errors.is_empty() {
        log_tail.to_string()
    } else {
        errors
            .iter()
            .take(MAX_SUMMARY_LINES)
            .copied()
            .collect::<Vec<_>>()
            .join("\n")
    };

    (message, error)
}
