//! Coverage and failed-test extraction from test runner output.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static JEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"All files\s*\|\s*([\d.]+)\s*\|\s*([\d.]+)\s*\|\s*([\d.]+)\s*\|\s*([\d.]+)",
    )
    .expect("valid regex")
});
static NYC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)Statements\s*:\s*([\d.]+)%.*?Branches\s*:\s*([\d.]+)%.*?Functions\s*:\s*([\d.]+)%.*?Lines\s*:\s*([\d.]+)%",
    )
    .expect("valid regex")
});
static GO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"coverage:\s*([\d.]+)%").expect("valid regex"));
static PYTHON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"TOTAL\s+\d+\s+\d+\s+([\d.]+)%").expect("valid regex"));

static JEST_FAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"FAIL\s+(\S+\.(?:js|jsx|ts|tsx|mjs))\s*\n\s*●\s*(.+)").expect("valid regex")
});
static MOCHA_FAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d+\)\s+(.+)\n\s+(.*Error:.+)").expect("valid regex")
});
static GO_FAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"--- FAIL:\s+(\w+)\s+\([\d.]+s\)(?:\s*\n\s*(.+))?").expect("valid regex")
});
static PYTEST_FAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"FAILED\s+(\S+?)::(\S+)").expect("valid regex"));
static CARGO_FAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^test (\S+) \.\.\. FAILED$").expect("valid regex"));

/// Coverage percentages in `[0, 100]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coverage {
    pub statements: f64,
    pub branches: f64,
    pub functions: f64,
    pub lines: f64,
}

impl Coverage {
    /// Single-number dialects report one figure for every metric.
    pub fn uniform(value: f64) -> Self {
        Self {
            statements: value,
            branches: value,
            functions: value,
            lines: value,
        }
    }

    fn metrics(&self) -> [f64; 4] {
        [self.statements, self.branches, self.functions, self.lines]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTest {
    pub file: String,
    pub test: String,
}

fn number(caps: &regex::Captures<'_>, idx: usize) -> Option<f64> {
    caps.get(idx)?.as_str().parse().ok()
}

/// Parse coverage from jest/vitest, nyc/istanbul, go, or coverage.py output.
pub fn parse_coverage(output: &str) -> Option<Coverage> {
    for re in [&*JEST_RE, &*NYC_RE] {
        if let Some(caps) = re.captures(output) {
            return Some(Coverage {
                statements: number(&caps, 1)?,
                branches: number(&caps, 2)?,
                functions: number(&caps, 3)?,
                lines: number(&caps, 4)?,
            });
        }
    }
    for re in [&*GO_RE, &*PYTHON_RE] {
        if let Some(caps) = re.captures(output) {
            return Some(Coverage::uniform(number(&caps, 1)?));
        }
    }
    None
}

/// Mean per-metric drop from `baseline` to `current` (negative means improvement).
pub fn coverage_drop(baseline: &Coverage, current: &Coverage) -> f64 {
    let drops: f64 = baseline
        .metrics()
        .iter()
        .zip(current.metrics())
        .map(|(base, now)| base - now)
        .sum();
    drops / 4.0
}

/// Extract failing test identifiers from common runner output formats.
pub fn parse_failed_tests(output: &str) -> Vec<FailedTest> {
    let mut failed = Vec::new();
    for caps in JEST_FAIL_RE.captures_iter(output) {
        failed.push(FailedTest {
            file: caps[1].to_string(),
            test: caps[2].trim().to_string(),
        });
    }
    for caps in MOCHA_FAIL_RE.captures_iter(output) {
        failed.push(FailedTest {
            file: caps[1].trim().to_string(),
            test: caps[2].trim().to_string(),
        });
    }
    for caps in GO_FAIL_RE.captures_iter(output) {
        failed.push(FailedTest {
            file: caps[1].to_string(),
            test: caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default(),
        });
    }
    for caps in PYTEST_FAIL_RE.captures_iter(output) {
        failed.push(FailedTest {
            file: caps[1].to_string(),
            test: caps[2].trim().to_string(),
        });
    }
    for caps in CARGO_FAIL_RE.captures_iter(output) {
        failed.push(FailedTest {
            file: String::new(),
            test: caps[1].to_string(),
        });
    }
    failed
}
