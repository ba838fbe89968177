//! Failure classification
//!
//! Maps raw test output onto the failure taxonomy that drives branch
//! routing. Wall-time signals win over everything else: a run that was
//! killed for exceeding its budget often leaves a partial traceback that
//! would otherwise classify as something more specific but wrong.

use crate::protocol::{TestCaseStatus, TestReport};
use crate::workflow::FailureClass;
use once_cell::sync::Lazy;
use regex::Regex;

static TIMEOUT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(timed? ?out|TimeoutExpired|wall.?time|deadline exceeded)").expect("static regex")
});
static SYNTAX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(SyntaxError|invalid syntax|IndentationError)").expect("static regex"));
static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(ImportError|ModuleNotFoundError|No module named|cannot import)")
        .expect("static regex")
});
static MISSING_DEP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(No such file or directory|FileNotFoundError|missing fixture|command not found)")
        .expect("static regex")
});
static FLAKY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(ConnectionReset|ConnectionRefused|Broken pipe|temporarily unavailable)")
        .expect("static regex")
});
static SPEC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(signature mismatch|unexpected keyword argument|takes \d+ positional|does not match contract)")
        .expect("static regex")
});
static LOGIC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(metric assertion failed|expected .+ but observed|off by)").expect("static regex")
});
static BUG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(AssertionError|NameError|AttributeError|TypeError|KeyError|IndexError|ZeroDivisionError)")
        .expect("static regex")
});

/// Classify raw diagnostic text.
pub fn classify_text(text: &str) -> FailureClass {
    if TIMEOUT_RE.is_match(text) {
        FailureClass::Timeout
    } else if SYNTAX_RE.is_match(text) {
        FailureClass::SyntaxError
    } else if IMPORT_RE.is_match(text) {
        FailureClass::ImportError
    } else if MISSING_DEP_RE.is_match(text) {
        FailureClass::MissingDependency
    } else if FLAKY_RE.is_match(text) {
        FailureClass::FlakyTest
    } else if SPEC_RE.is_match(text) {
        FailureClass::SpecMismatch
    } else if LOGIC_RE.is_match(text) {
        FailureClass::LogicError
    } else if BUG_RE.is_match(text) {
        FailureClass::ImplementationBug
    } else {
        FailureClass::Unknown
    }
}

/// Classify a failure, preferring the tester's own suggestion, then the
/// report's case output, then free-form diagnostics.
pub fn classify_failure(report: Option<&TestReport>, diagnostics: &str) -> FailureClass {
    if let Some(report) = report {
        if let Some(class) = report.suggested_class {
            return class;
        }
        if report
            .cases
            .iter()
            .any(|c| c.status == TestCaseStatus::Timeout)
        {
            return FailureClass::Timeout;
        }
        for case in report.failing_cases() {
            let mut text = String::new();
            if let Some(message) = &case.message {
                text.push_str(message);
                text.push('\n');
            }
            if let Some(stderr) = &case.stderr_excerpt {
                text.push_str(stderr);
            }
            let class = classify_text(&text);
            if class != FailureClass::Unknown {
                return class;
            }
        }
    }
    classify_text(diagnostics)
}
