// Aggregation of test outcomes into the final verdict
use crate::runner::RunOutcome;
use std::fmt;

/// Running totals across every definition and job of an invocation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub passed: usize,
    pub skipped: usize,
    pub ignored: usize,
    pub failed: usize,
    /// Tests that got as far as a rendered command under dry-run.
    pub rendered: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Failed,
    /// Nothing failed, but nothing passed either.
    NothingPassed,
}

impl Verdict {
    pub fn is_success(self) -> bool {
        self == Verdict::Ok
    }
}

impl Summary {
    pub fn record(&mut self, outcome: &RunOutcome) {
        match outcome {
            RunOutcome::Passed => self.passed += 1,
            RunOutcome::Failed(_) => self.failed += 1,
            RunOutcome::Ignored => self.ignored += 1,
            RunOutcome::Skipped { .. } => self.skipped += 1,
            RunOutcome::Rendered => self.rendered += 1,
        }
    }

    /// Under dry-run a rendered test stands in for a passed one.
    pub fn verdict(&self, dry_run: bool, allow_no_tests: bool) -> Verdict {
        let succeeded = if dry_run { self.rendered } else { self.passed };
        if self.failed > 0 {
            Verdict::Failed
        } else if succeeded == 0 && !allow_no_tests {
            Verdict::NothingPassed
        } else {
            Verdict::Ok
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "passed={} skipped={} ignored={} failed={}",
            self.passed, self.skipped, self.ignored, self.failed
        )?;
        if self.rendered > 0 {
            write!(f, " rendered={}", self.rendered)?;
        }
        Ok(())
    }
}
