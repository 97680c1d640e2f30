//! JUnit XML report generation.
//!
//! Outcomes reach the XML only through [`OutcomeMapping`]: each outcome
//! becomes a `(classname, message, failure)` tuple. Captured stderr and
//! stdout are attached as element text.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="3" failures="1" errors="1" time="2.104">
//!   <testsuite name="targetrun" tests="3" failures="1" errors="1" skipped="0" time="2.104">
//!     <testcase classname="targetrun.qemu" name="test_alloc" time="0.412"/>
//!     <testcase classname="targetrun.qemu" name="test_io" time="1.020">
//!       <failure message="crashed with signal 11" type="crashed">...</failure>
//!     </testcase>
//!     <testcase classname="targetrun.qemu" name="test_net" time="0.672">
//!       <error message="adb: device offline" type="tool_error">...</error>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::{Reporter, Summary};
use crate::analysis::Outcome;
use crate::orchestrator::TestResult;

/// How a non-passing outcome is represented in JUnit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// `<failure>`: the test ran and did not pass.
    Failure,
    /// `<error>`: the test could not be run.
    Error,
}

/// JUnit view of one outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeMapping {
    pub classname: String,
    pub message: Option<String>,
    /// `None` for a passing test.
    pub failure: Option<FailureKind>,
    /// Value of the `type` attribute.
    pub failure_type: &'static str,
}

impl OutcomeMapping {
    /// Maps an outcome for a test run under `profile`.
    pub fn new(profile: &str, outcome: &Outcome) -> Self {
        let (failure, failure_type) = match outcome {
            Outcome::Passed => (None, ""),
            Outcome::Failed(_) => (Some(FailureKind::Failure), "failed"),
            Outcome::TimedOut => (Some(FailureKind::Failure), "timed_out"),
            Outcome::Crashed(_) => (Some(FailureKind::Failure), "crashed"),
            Outcome::ToolError(_) => (Some(FailureKind::Error), "tool_error"),
        };
        Self {
            classname: format!("targetrun.{}", profile),
            message: outcome.message().map(|m| first_line(&m)),
            failure,
            failure_type,
        }
    }
}

fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or_default().to_string()
}

/// Builds JUnit XML documents.
#[derive(Debug, Clone)]
pub struct JUnitWriter {
    suite_name: String,
    profile: String,
    timestamp: Option<DateTime<Utc>>,
}

impl JUnitWriter {
    pub fn new(suite_name: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            suite_name: suite_name.into(),
            profile: profile.into(),
            timestamp: None,
        }
    }

    /// Sets the `timestamp` attribute of the test suite.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Renders the report for `results`.
    pub fn render(&self, results: &[TestResult], duration: Duration) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mappings: Vec<_> = results
            .iter()
            .map(|r| OutcomeMapping::new(&self.profile, &r.outcome))
            .collect();
        let tests = results.len().to_string();
        let failures = mappings
            .iter()
            .filter(|m| m.failure == Some(FailureKind::Failure))
            .count()
            .to_string();
        let errors = mappings
            .iter()
            .filter(|m| m.failure == Some(FailureKind::Error))
            .count()
            .to_string();
        let time = format!("{:.3}", duration.as_secs_f64());
        let timestamp = self
            .timestamp
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true));

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.as_str()));
        testsuites.push_attribute(("failures", failures.as_str()));
        testsuites.push_attribute(("errors", errors.as_str()));
        testsuites.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", self.suite_name.as_str()));
        testsuite.push_attribute(("tests", tests.as_str()));
        testsuite.push_attribute(("failures", failures.as_str()));
        testsuite.push_attribute(("errors", errors.as_str()));
        testsuite.push_attribute(("skipped", "0"));
        testsuite.push_attribute(("time", time.as_str()));
        if let Some(timestamp) = &timestamp {
            testsuite.push_attribute(("timestamp", timestamp.as_str()));
        }
        writer.write_event(Event::Start(testsuite))?;

        for (result, mapping) in results.iter().zip(&mappings) {
            write_testcase(&mut writer, result, mapping)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    result: &TestResult,
    mapping: &OutcomeMapping,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", mapping.classname.as_str()));
    testcase.push_attribute(("name", result.test.name.as_str()));
    testcase.push_attribute((
        "time",
        format!("{:.3}", result.duration.as_secs_f64()).as_str(),
    ));

    let Some(kind) = mapping.failure else {
        writer.write_event(Event::Empty(testcase))?;
        return Ok(());
    };
    writer.write_event(Event::Start(testcase))?;

    let tag = match kind {
        FailureKind::Failure => "failure",
        FailureKind::Error => "error",
    };
    let mut element = BytesStart::new(tag);
    let message = mapping.message.as_deref().map(strip_invalid_chars);
    if let Some(message) = &message {
        element.push_attribute(("message", message.as_str()));
    }
    element.push_attribute(("type", mapping.failure_type));
    let body = strip_invalid_chars(&result.stderr);
    if body.is_empty() {
        writer.write_event(Event::Empty(element))?;
    } else {
        writer.write_event(Event::Start(element))?;
        writer.write_event(Event::Text(BytesText::new(&body)))?;
        writer.write_event(Event::End(BytesEnd::new(tag)))?;
    }

    if !result.stdout.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("system-out")))?;
        writer.write_event(Event::Text(BytesText::new(&strip_invalid_chars(&result.stdout))))?;
        writer.write_event(Event::End(BytesEnd::new("system-out")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}

/// Removes characters XML 1.0 cannot represent. Escaping is left to the
/// writer.
fn strip_invalid_chars(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}'))
        .collect()
}

/// Writes a JUnit file when the run completes.
pub struct JUnitReporter {
    output_path: PathBuf,
    suite_name: String,
    /// Profile name and start time, set when the run starts.
    started: OnceLock<(String, DateTime<Utc>)>,
}

impl JUnitReporter {
    pub fn new(output_path: PathBuf) -> Self {
        Self {
            output_path,
            suite_name: "targetrun".to_string(),
            started: OnceLock::new(),
        }
    }

    pub fn with_suite_name(mut self, name: impl Into<String>) -> Self {
        self.suite_name = name.into();
        self
    }
}

#[async_trait]
impl Reporter for JUnitReporter {
    async fn on_run_start(&self, _total: usize, profile: &str) {
        let _ = self.started.set((profile.to_string(), Utc::now()));
    }

    async fn on_test_complete(&self, _result: &TestResult) {}

    async fn on_run_complete(&self, summary: &Summary, results: &[TestResult]) {
        let writer = match self.started.get() {
            Some((profile, started_at)) => JUnitWriter::new(self.suite_name.clone(), profile.as_str())
                .with_timestamp(*started_at),
            None => JUnitWriter::new(self.suite_name.clone(), "unknown"),
        };
        let xml = match writer.render(results, summary.duration) {
            Ok(xml) => xml,
            Err(e) => {
                tracing::error!("Failed to generate JUnit XML: {}", e);
                return;
            }
        };

        if let Some(parent) = self.output_path.parent()
            && !parent.as_os_str().is_empty()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::error!("Failed to create output directory: {}", e);
            return;
        }
        match std::fs::write(&self.output_path, xml) {
            Ok(()) => tracing::info!("JUnit XML written to: {}", self.output_path.display()),
            Err(e) => tracing::error!("Failed to write JUnit XML: {}", e),
        }
    }
}
