//! Parsers for formatter and test-harness output.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use stageline_core::{FormatReport, MisformattedFile, TestCase, TestReport, TestStatus};

fn diff_header() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Older rustfmt: `Diff in <file> at line <n>:`; newer: `Diff in <file>:<n>:`.
    PATTERN.get_or_init(|| {
        Regex::new(r"^Diff in (?P<path>.+?)(?: at line |:)(?P<line>\d+):?\s*$")
            .expect("diff header pattern is valid")
    })
}

fn test_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^test (?P<name>.+?) \.\.\. (?P<status>ok|FAILED|ignored)\b")
            .expect("test line pattern is valid")
    })
}

fn toolchain_line() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:rustc|cargo|rustfmt|rustup) \d+\.\d+\.\d+\S*(?: .*)?$")
            .expect("toolchain pattern is valid")
    })
}

/// Extract misformatted files from `cargo fmt -- --check` output.
///
/// Paths under `workdir` are made relative to it. Files keep the order in
/// which the formatter first reported them.
pub fn parse_format_report(output: &str, workdir: Option<&Path>) -> FormatReport {
    let mut files: Vec<MisformattedFile> = Vec::new();
    let mut diff = Vec::new();
    let mut in_diff = false;

    for line in output.lines() {
        if let Some(caps) = diff_header().captures(line) {
            in_diff = true;
            let path = relative_to(&caps["path"], workdir);
            let number: u32 = caps["line"].parse().unwrap_or(0);
            match files.iter_mut().find(|f| f.path == path) {
                Some(file) => file.lines.push(number),
                None => files.push(MisformattedFile {
                    path,
                    lines: vec![number],
                }),
            }
        } else if line.starts_with("$ ") {
            in_diff = false;
            continue;
        }
        if in_diff {
            diff.push(line);
        }
    }

    for file in &mut files {
        file.lines.sort_unstable();
        file.lines.dedup();
    }

    FormatReport {
        files,
        diff: diff.join("\n"),
    }
}

fn relative_to(path: &str, workdir: Option<&Path>) -> String {
    let Some(workdir) = workdir else {
        return path.to_string();
    };
    let candidate = Path::new(path);
    if let Ok(stripped) = candidate.strip_prefix(workdir) {
        return stripped.display().to_string();
    }
    if let Ok(canonical) = workdir.canonicalize() {
        if let Ok(stripped) = candidate.strip_prefix(&canonical) {
            return stripped.display().to_string();
        }
    }
    path.to_string()
}

/// Extract per-test outcomes and toolchain versions from test stage output.
pub fn parse_test_report(output: &str) -> TestReport {
    let mut report = TestReport::default();

    for line in output.lines() {
        let line = line.trim_end();
        if let Some(caps) = test_line().captures(line) {
            let status = match &caps["status"] {
                "ok" => TestStatus::Passed,
                "FAILED" => TestStatus::Failed,
                _ => TestStatus::Ignored,
            };
            report.cases.push(TestCase {
                name: caps["name"].to_string(),
                status,
            });
        } else if toolchain_line().is_match(line) {
            report.toolchain.push(line.to_string());
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    const FMT_OUTPUT: &str = "\
$ cargo fmt --all -- --check
Diff in /work/b7/src/main.rs at line 12:
 fn main() {
-    let x=1;
+    let x = 1;
 }
Diff in /work/b7/src/lib.rs:3:
-use std::io;use std::fs;
+use std::fs;
+use std::io;
Diff in /work/b7/src/main.rs at line 40:
-foo( )
+foo()
";

    #[test]
    fn test_format_report_groups_by_file() {
        let report = parse_format_report(FMT_OUTPUT, Some(Path::new("/work/b7")));
        assert_eq!(report.paths(), vec!["src/main.rs", "src/lib.rs"]);
        assert_eq!(report.files[0].lines, vec![12, 40]);
        assert_eq!(report.files[1].lines, vec![3]);
        assert!(report.diff.starts_with("Diff in /work/b7/src/main.rs"));
        assert!(!report.diff.contains("$ cargo fmt"));
    }

    #[test]
    fn test_format_report_keeps_paths_outside_workdir() {
        let report = parse_format_report(FMT_OUTPUT, Some(Path::new("/elsewhere")));
        assert_eq!(report.files[0].path, "/work/b7/src/main.rs");
    }

    #[test]
    fn test_clean_format_output() {
        let report = parse_format_report("$ cargo fmt --all -- --check\n", None);
        assert!(report.is_clean());
        assert!(report.diff.is_empty());
    }

    #[test]
    fn test_parse_test_output() {
        let output = "\
$ rustc --version
rustc 1.75.0 (82e1608df 2023-12-21)
$ cargo --version
cargo 1.75.0 (1d8b05cdd 2023-11-20)
$ cargo test --verbose

running 4 tests
test tracer::tests::parses_header ... ok
test tracer::tests::rejects_empty ... FAILED
test slow_case ... ignored, needs dynamorio
test src/lib.rs - Tracer::new (line 10) ... ok

test result: FAILED. 2 passed; 1 failed; 1 ignored; 0 measured
";
        let report = parse_test_report(output);
        assert_eq!(report.cases.len(), 4);
        assert_eq!(report.passed(), 2);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.ignored(), 1);
        assert_eq!(report.failed_names(), vec!["tracer::tests::rejects_empty"]);
        assert_eq!(report.cases[3].name, "src/lib.rs - Tracer::new (line 10)");
        assert_eq!(report.toolchain.len(), 2);
        assert!(report.toolchain[1].starts_with("cargo 1.75.0"));
    }

    #[test]
    fn test_result_summary_is_not_a_case() {
        let report = parse_test_report("test result: ok. 3 passed; 0 failed\n");
        assert!(report.cases.is_empty());
    }
}
