//! Verdict aggregation.
//!
//! A test suite verdict is a pure function of the observed sub suite
//! outcomes; the testrun verdict is a pure function of the suite verdicts.
//! Events on the bus carry UPPERCASE verdict strings while the termination
//! log uses Title-case, so both spellings live here and nowhere else.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Verdict of a test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Passed,
    Failed,
    Inconclusive,
}

impl Verdict {
    /// UPPERCASE spelling used on bus events.
    pub fn as_event_str(self) -> &'static str {
        match self {
            Verdict::Passed => "PASSED",
            Verdict::Failed => "FAILED",
            Verdict::Inconclusive => "INCONCLUSIVE",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Verdict::Passed => "Passed",
            Verdict::Failed => "Failed",
            Verdict::Inconclusive => "Inconclusive",
        })
    }
}

/// Conclusion of the process itself, independent of whether tests passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Conclusion {
    Successful,
    Failed,
    Inconclusive,
}

impl Conclusion {
    /// UPPERCASE spelling used on bus events.
    pub fn as_event_str(self) -> &'static str {
        match self {
            Conclusion::Successful => "SUCCESSFUL",
            Conclusion::Failed => "FAILED",
            Conclusion::Inconclusive => "INCONCLUSIVE",
        }
    }
}

impl std::fmt::Display for Conclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Conclusion::Successful => "Successful",
            Conclusion::Failed => "Failed",
            Conclusion::Inconclusive => "Inconclusive",
        })
    }
}

/// Outcome block of a test suite finished event, as read from the bus.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SuiteOutcome {
    #[serde(default)]
    pub verdict: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Runtime state of one sub suite, as observed when its worker has joined.
#[derive(Debug, Clone, Default)]
pub struct SubSuiteSnapshot {
    /// The test runner could not be started.
    pub failed: bool,
    /// A finished event was received.
    pub finished: bool,
    /// Outcome from the finished event, when there is one.
    pub outcome: Option<SuiteOutcome>,
}

/// Verdict, conclusion and description for one main suite.
#[derive(Debug, Clone, PartialEq)]
pub struct SuiteAssessment {
    pub verdict: Verdict,
    pub conclusion: Conclusion,
    pub description: String,
}

/// Result of one main suite, tagged with its identity.
#[derive(Debug, Clone)]
pub struct SuiteResult {
    pub main_suite_id: String,
    pub suite_name: String,
    pub verdict: Verdict,
    pub conclusion: Conclusion,
    pub description: String,
}

/// Computes the verdict for one main suite. First match wins.
pub fn assess(
    testrun_id: &str,
    main_suite_id: &str,
    empty: bool,
    started: bool,
    sub_suites: &[SubSuiteSnapshot],
) -> SuiteAssessment {
    let failed_to_start = sub_suites.iter().filter(|sub| sub.failed).count();

    if empty {
        return SuiteAssessment {
            verdict: Verdict::Inconclusive,
            conclusion: Conclusion::Failed,
            description: format!("No tests in suite {testrun_id}, aborting"),
        };
    }
    if !started {
        return SuiteAssessment {
            verdict: Verdict::Inconclusive,
            conclusion: Conclusion::Failed,
            description: format!("No sub suites started at all for {main_suite_id}."),
        };
    }
    if failed_to_start > 0 {
        return SuiteAssessment {
            verdict: Verdict::Inconclusive,
            conclusion: Conclusion::Failed,
            description: format!("{failed_to_start} sub suites failed to start"),
        };
    }
    if !sub_suites.iter().all(|sub| sub.finished) {
        return SuiteAssessment {
            verdict: Verdict::Inconclusive,
            conclusion: Conclusion::Failed,
            description: "Did not receive test results from sub suites.".to_string(),
        };
    }

    let mut verdict = Verdict::Passed;
    let mut description = String::new();
    for sub in sub_suites {
        let outcome = sub.outcome.clone().unwrap_or_default();
        if outcome.verdict.as_deref() != Some("PASSED") {
            verdict = Verdict::Failed;
        }
        description = outcome.description.unwrap_or_default();
    }
    if verdict == Verdict::Passed {
        description = "All tests passed.".to_string();
    }
    if description.is_empty() {
        description = "No description received from the test runners.".to_string();
    }
    SuiteAssessment {
        verdict,
        conclusion: Conclusion::Successful,
        description,
    }
}

/// The verdict triple written to the termination log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalVerdict {
    pub conclusion: Conclusion,
    pub verdict: Verdict,
    pub description: String,
}

impl FinalVerdict {
    /// The verdict written when the testrun failed outright.
    pub fn failure(description: impl Into<String>) -> Self {
        Self {
            conclusion: Conclusion::Failed,
            verdict: Verdict::Inconclusive,
            description: description.into(),
        }
    }
}

/// Combines the suite results into the testrun verdict.
///
/// The first FAILED suite wins, then the first INCONCLUSIVE one, then the
/// first result as-is.
pub fn testrun_verdict(results: &[SuiteResult]) -> FinalVerdict {
    let picked = results
        .iter()
        .find(|result| result.verdict == Verdict::Failed)
        .or_else(|| {
            results
                .iter()
                .find(|result| result.verdict == Verdict::Inconclusive)
        })
        .or_else(|| results.first());
    match picked {
        Some(result) => FinalVerdict {
            conclusion: result.conclusion,
            verdict: result.verdict,
            description: result.description.clone(),
        },
        None => FinalVerdict {
            conclusion: Conclusion::Inconclusive,
            verdict: Verdict::Inconclusive,
            description: "Got no results from the testrun".to_string(),
        },
    }
}

/// Writes the verdict triple as JSON to the termination log.
pub fn write_termination_log(path: &Path, verdict: &FinalVerdict) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    let payload = serde_json::to_string(verdict)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    file.write_all(payload.as_bytes())
}
