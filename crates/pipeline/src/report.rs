//! Per-run outcome reporting.

use std::fmt;

/// Pipeline stage in which a dataset failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Source,
    Process,
    Harmonize,
    Fuse,
    Write,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Source => "source",
            Stage::Process => "process",
            Stage::Harmonize => "harmonize",
            Stage::Fuse => "fuse",
            Stage::Write => "write",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Output already existed and regeneration was not forced.
    Skipped,
    Failed,
}

/// Final state of one dataset after a run.
#[derive(Debug, Clone)]
pub struct DatasetReport {
    pub identifier: String,
    pub outcome: Outcome,
    pub stage: Option<Stage>,
    pub error: Option<String>,
}

impl DatasetReport {
    pub fn succeeded(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            outcome: Outcome::Succeeded,
            stage: None,
            error: None,
        }
    }

    pub fn skipped(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            outcome: Outcome::Skipped,
            stage: None,
            error: None,
        }
    }

    pub fn failed(identifier: impl Into<String>, stage: Stage, error: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            outcome: Outcome::Failed,
            stage: Some(stage),
            error: Some(error.into()),
        }
    }
}

/// Collected dataset reports for one run, in configuration order.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub entries: Vec<DatasetReport>,
}

impl RunReport {
    pub fn push(&mut self, entry: DatasetReport) {
        self.entries.push(entry);
    }

    pub fn succeeded(&self) -> usize {
        self.count(Outcome::Succeeded)
    }

    pub fn skipped(&self) -> usize {
        self.count(Outcome::Skipped)
    }

    pub fn failed(&self) -> usize {
        self.count(Outcome::Failed)
    }

    pub fn has_failures(&self) -> bool {
        self.failed() > 0
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.entries.iter().filter(|e| e.outcome == outcome).count()
    }

    /// One line per dataset plus a totals line.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            match entry.outcome {
                Outcome::Succeeded => {
                    out.push_str(&format!("{}: ok\n", entry.identifier));
                }
                Outcome::Skipped => {
                    out.push_str(&format!("{}: skipped (already generated)\n", entry.identifier));
                }
                Outcome::Failed => {
                    let stage = entry.stage.map(|s| s.to_string()).unwrap_or_default();
                    let error = entry.error.as_deref().unwrap_or("unknown error");
                    out.push_str(&format!("{}: failed at {stage}: {error}\n", entry.identifier));
                }
            }
        }
        out.push_str(&format!(
            "{} succeeded, {} skipped, {} failed\n",
            self.succeeded(),
            self.skipped(),
            self.failed()
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_summary() {
        let mut report = RunReport::default();
        report.push(DatasetReport::succeeded("sm"));
        report.push(DatasetReport::skipped("lst"));
        report.push(DatasetReport::failed("ndvi", Stage::Source, "no such data id"));

        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.failed(), 1);
        assert!(report.has_failures());

        let summary = report.summary();
        assert!(summary.contains("ndvi: failed at source: no such data id"));
        assert!(summary.contains("1 succeeded, 1 skipped, 1 failed"));
    }

    #[test]
    fn test_empty_report() {
        let report = RunReport::default();
        assert!(!report.has_failures());
        assert_eq!(report.summary(), "0 succeeded, 0 skipped, 0 failed\n");
    }
}
