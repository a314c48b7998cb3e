//! Structured test report written by the runner
//!
//! A JSON array of tests, each holding per-node results:
//!
//! ```json
//! [{"Name": "latency-check",
//!   "TestResults": [{"NodeName": "perf-control-plane", "AverageLatency": 12.5,
//!                    "FailedRequestCount": 0, "FailedPercentage": 0}]}]
//! ```
//!
//! `AverageLatency` is in nanoseconds.

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::common::{Error, Result};

/// Ordered list of tests
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestReport {
    pub tests: Vec<Test>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Test {
    pub name: String,
    #[serde(default)]
    pub test_results: Vec<TestResult>,
}

/// Measurements for one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TestResult {
    pub node_name: String,
    pub average_latency: f64,
    pub failed_request_count: u64,
    pub failed_percentage: f64,
}

impl TestReport {
    /// Parse a report from JSON text
    pub fn parse(content: &str, source: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::ReportParse {
            path: source.to_string(),
            error: e.to_string(),
        })
    }

    /// Read and parse a report file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::ReportParse {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Check the report describes a clean run on `node_name`.
    ///
    /// Every problem is collected, not just the first.
    pub fn validate(&self, node_name: &str) -> Result<()> {
        let mut violations = Vec::new();

        if self.tests.is_empty() {
            violations.push("report contains no tests".to_string());
        }

        for (index, test) in self.tests.iter().enumerate() {
            let label = if test.name.is_empty() {
                violations.push(format!("test #{} has an empty Name", index + 1));
                format!("#{}", index + 1)
            } else {
                test.name.clone()
            };

            if test.test_results.is_empty() {
                violations.push(format!("test '{label}' has no results"));
            }

            for result in &test.test_results {
                let at = format!("test '{label}' on node '{}'", result.node_name);
                if result.node_name != node_name {
                    violations.push(format!("{at}: expected node '{node_name}'"));
                }
                if !result.average_latency.is_finite() || result.average_latency <= 0.0 {
                    violations.push(format!(
                        "{at}: AverageLatency is {}, must be greater than 0",
                        result.average_latency
                    ));
                }
                if result.failed_request_count != 0 {
                    violations.push(format!(
                        "{at}: FailedRequestCount is {}, expected 0",
                        result.failed_request_count
                    ));
                }
                if !result.failed_percentage.is_finite() || result.failed_percentage != 0.0 {
                    violations.push(format!(
                        "{at}: FailedPercentage is {}, expected 0",
                        result.failed_percentage
                    ));
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(Error::ReportInvalid { violations })
        }
    }

    /// Titled, column-aligned text table per test
    pub fn render_text(&self) -> String {
        const HEADERS: [&str; 3] = ["NODE", "AVERAGE LATENCY", "FAILED REQUESTS"];
        const GAP: usize = 3;

        let mut out = String::new();
        for test in &self.tests {
            let rule = "=".repeat(test.name.chars().count() + 2);
            let _ = write!(out, "\n{rule}\n {} \n{rule}\n\n", test.name);

            let rows: Vec<[String; 3]> = test
                .test_results
                .iter()
                .map(|r| {
                    [
                        r.node_name.clone(),
                        format_latency(r.average_latency),
                        format!("{:.2}% ({})", r.failed_percentage, r.failed_request_count),
                    ]
                })
                .collect();

            let mut widths = HEADERS.map(str::len);
            for row in &rows {
                for (width, cell) in widths.iter_mut().zip(row) {
                    *width = (*width).max(cell.chars().count());
                }
            }

            let header = HEADERS.map(str::to_string);
            for row in std::iter::once(&header).chain(&rows) {
                let line: String = row
                    .iter()
                    .zip(widths)
                    .map(|(cell, width)| format!("{:<width$}", cell, width = width + GAP))
                    .collect();
                out.push_str(line.trim_end());
                out.push('\n');
            }
        }
        out
    }

    /// Tab-indented JSON, the same shape the runner writes
    pub fn render_json(&self) -> Result<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut serializer)?;
        String::from_utf8(buf).map_err(|e| Error::Internal(e.to_string()))
    }
}

/// Human-readable duration for a nanosecond count
pub fn format_latency(nanos: f64) -> String {
    let (value, unit) = if nanos.abs() >= 1e9 {
        (nanos / 1e9, "s")
    } else if nanos.abs() >= 1e6 {
        (nanos / 1e6, "ms")
    } else if nanos.abs() >= 1e3 {
        (nanos / 1e3, "µs")
    } else {
        (nanos, "ns")
    };
    let formatted = format!("{value:.3}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "" | "-" => format!("0{unit}"),
        digits => format!("{digits}{unit}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorKind;

    const NODE: &str = "k8s-node-perf-evaluator-control-plane";

    fn report(latency: f64, failed: u64, percentage: f64) -> TestReport {
        TestReport {
            tests: vec![Test {
                name: "latency-check".to_string(),
                test_results: vec![TestResult {
                    node_name: NODE.to_string(),
                    average_latency: latency,
                    failed_request_count: failed,
                    failed_percentage: percentage,
                }],
            }],
        }
    }

    #[test]
    fn test_clean_report_passes() {
        let json = r#"[{"Name":"latency-check","TestResults":[
            {"NodeName":"k8s-node-perf-evaluator-control-plane","AverageLatency":12.5,
             "FailedRequestCount":0,"FailedPercentage":0}]}]"#;
        let parsed = TestReport::parse(json, "inline").unwrap();
        assert_eq!(parsed, report(12.5, 0, 0.0));
        parsed.validate(NODE).unwrap();
    }

    #[test]
    fn test_failed_requests_are_a_report_failure() {
        let err = report(12.5, 3, 0.0).validate(NODE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ReportValidation);
        assert!(!err.is_setup_failure());
        assert!(err.to_string().contains("FailedRequestCount is 3"));
    }

    #[test]
    fn test_zero_latency_fails() {
        let err = report(0.0, 0, 0.0).validate(NODE).unwrap_err();
        assert!(err.to_string().contains("AverageLatency is 0"));
    }

    #[test]
    fn test_non_finite_values_fail() {
        assert!(report(f64::NAN, 0, 0.0).validate(NODE).is_err());
        assert!(report(12.5, 0, f64::INFINITY).validate(NODE).is_err());
    }

    #[test]
    fn test_wrong_node_fails() {
        let err = report(12.5, 0, 0.0)
            .validate("other-control-plane")
            .unwrap_err();
        assert!(err.to_string().contains("expected node 'other-control-plane'"));
    }

    #[test]
    fn test_all_violations_are_collected() {
        let Err(Error::ReportInvalid { violations }) = report(-1.0, 2, 40.0).validate("x") else {
            panic!("expected a report validation error");
        };
        assert_eq!(violations.len(), 4);
    }

    #[test]
    fn test_empty_reports_fail() {
        assert!(TestReport::default().validate(NODE).is_err());
        let empty_test = TestReport {
            tests: vec![Test {
                name: "latency-check".to_string(),
                test_results: vec![],
            }],
        };
        assert!(empty_test.validate(NODE).is_err());
    }

    #[test]
    fn test_malformed_json_is_a_parse_error() {
        let err = TestReport::parse("{not json", "report.json").unwrap_err();
        assert!(matches!(err, Error::ReportParse { .. }));
        assert_eq!(err.kind(), ErrorKind::ReportValidation);
    }

    #[test]
    fn test_integer_latency_from_runner() {
        let json = r#"[{"Name":"t","TestResults":[{"NodeName":"n","AverageLatency":1500000,
            "FailedRequestCount":0,"FailedPercentage":0}]}]"#;
        let parsed = TestReport::parse(json, "inline").unwrap();
        assert_eq!(parsed.tests[0].test_results[0].average_latency, 1_500_000.0);
    }

    #[test]
    fn test_render_text_table() {
        let text = report(1_500_000.0, 1, 0.5).render_text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[1], "===============");
        assert_eq!(lines[2], " latency-check ");
        assert!(lines[5].starts_with("NODE"));
        assert!(lines[5].contains("AVERAGE LATENCY   FAILED REQUESTS"));
        assert!(lines[6].starts_with(NODE));
        assert!(lines[6].contains("1.5ms"));
        assert!(lines[6].ends_with("0.50% (1)"));
    }

    #[test]
    fn test_render_json_matches_runner_shape() {
        let json = report(12.5, 0, 0.0).render_json().unwrap();
        assert!(json.contains("\t{"));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["Name"], "latency-check");
        assert_eq!(value[0]["TestResults"][0]["NodeName"], NODE);
    }

    #[test]
    fn test_format_latency() {
        assert_eq!(format_latency(12.5), "12.5ns");
        assert_eq!(format_latency(2_000.0), "2µs");
        assert_eq!(format_latency(1_234_567.0), "1.235ms");
        assert_eq!(format_latency(3e9), "3s");
        assert_eq!(format_latency(0.0), "0ns");
    }
}
