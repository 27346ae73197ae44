//! Aggregation of per-file loop states into a PR-level report.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::Serialize;

use crate::convergence::{FileImprovementState, IterationResult, LoopOutcome};
use crate::diff;
use crate::host::ChangeType;
use crate::issue::Issue;
use crate::threads::ThreadRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Error,
    AllIssuesResolved,
    IssuesRemain,
}

impl FileStatus {
    pub fn of(state: &FileImprovementState) -> Self {
        if state.error.is_some() {
            FileStatus::Error
        } else if state.all_issues_resolved {
            FileStatus::AllIssuesResolved
        } else {
            FileStatus::IssuesRemain
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Error => "error",
            FileStatus::AllIssuesResolved => "all_issues_resolved",
            FileStatus::IssuesRemain => "issues_remain",
        }
    }
}

/// Content before and after one pass of the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub iteration_index: u32,
    pub before: String,
    pub after: String,
    pub diff: String,
    pub issues_found: usize,
    pub issues_resolved: usize,
    #[serde(skip)]
    pub reviewer_analysis: String,
}

impl Snapshot {
    fn of(file_path: &str, result: &IterationResult) -> Self {
        Self {
            iteration_index: result.iteration_index,
            before: result.original_content.clone(),
            after: result.improved_content.clone(),
            diff: diff::unified(file_path, &result.original_content, &result.improved_content),
            issues_found: result.issues.len(),
            issues_resolved: result.resolved_fingerprints.len(),
            reviewer_analysis: result.reviewer_analysis.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileReport {
    pub file_path: String,
    pub pr_iteration: u32,
    pub change_type: ChangeType,
    pub status: FileStatus,
    pub outcome: LoopOutcome,
    pub iterations_completed: usize,
    pub remaining_issues: Vec<Issue>,
    pub snapshots: Vec<Snapshot>,
    pub threads: Vec<ThreadRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// How one path changed across the PR iterations it appeared in.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileEvolution {
    pub file_path: String,
    pub pr_iterations: Vec<u32>,
    /// Issues in the first analysis that are gone from the last one.
    pub resolved: Vec<Issue>,
    /// Issues in the last analysis that the first one did not report.
    pub introduced: Vec<Issue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub path: String,
    pub pr_iteration: u32,
    pub reason: String,
}

/// One file's completed run within a PR iteration.
#[derive(Debug, Clone)]
pub struct FileRun {
    pub pr_iteration: u32,
    pub change_type: ChangeType,
    pub state: FileImprovementState,
    pub threads: Vec<ThreadRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub total: usize,
    pub all_issues_resolved: usize,
    pub issues_remain: usize,
    pub error: usize,
    pub skipped: usize,
}

/// Concatenated reviewer analyses fed to the final narrative call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NarrativeInput {
    pub analyses: String,
    pub file_count: usize,
    pub pass_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImprovementReport {
    pub pr_id: u64,
    pub iterations: Vec<u32>,
    pub files: Vec<FileReport>,
    pub skipped_files: Vec<SkippedFile>,
    pub evolution: Vec<FileEvolution>,
    pub narrative: Option<String>,
    pub warnings: Vec<String>,
}

/// Builds the report from completed runs, in run order. The narrative is
/// left empty; it needs a generation call.
pub fn aggregate(
    pr_id: u64,
    iterations: &[u32],
    runs: Vec<FileRun>,
    skipped_files: Vec<SkippedFile>,
    warnings: Vec<String>,
) -> ImprovementReport {
    let evolution = evolution(&runs);
    let files = runs.into_iter().map(file_report).collect();
    ImprovementReport {
        pr_id,
        iterations: iterations.to_vec(),
        files,
        skipped_files,
        evolution,
        narrative: None,
        warnings,
    }
}

fn file_report(run: FileRun) -> FileReport {
    let FileRun {
        pr_iteration,
        change_type,
        state,
        threads,
    } = run;
    FileReport {
        status: FileStatus::of(&state),
        outcome: state.outcome,
        iterations_completed: state.iterations.len(),
        remaining_issues: state.remaining_issues().to_vec(),
        snapshots: state
            .iterations
            .iter()
            .map(|it| Snapshot::of(&state.file_path, it))
            .collect(),
        file_path: state.file_path,
        pr_iteration,
        change_type,
        threads,
        error: state.error,
        warnings: state.warnings,
    }
}

fn evolution(runs: &[FileRun]) -> Vec<FileEvolution> {
    let mut by_path: BTreeMap<&str, Vec<&FileRun>> = BTreeMap::new();
    for run in runs {
        by_path.entry(&run.state.file_path).or_default().push(run);
    }
    by_path
        .into_iter()
        .map(|(path, runs)| {
            let mut pr_iterations: Vec<u32> = runs.iter().map(|r| r.pr_iteration).collect();
            pr_iterations.sort_unstable();
            pr_iterations.dedup();

            let parsed = || {
                runs.iter()
                    .flat_map(|r| r.state.iterations.iter())
                    .filter(|it| it.parsed)
            };
            let first = parsed().next().map(|it| it.issues.as_slice()).unwrap_or(&[]);
            let last = parsed().last().map(|it| it.issues.as_slice()).unwrap_or(&[]);
            FileEvolution {
                file_path: path.to_string(),
                pr_iterations,
                resolved: missing_from(first, last),
                introduced: missing_from(last, first),
            }
        })
        .collect()
}

/// Issues of `from` whose fingerprint does not occur in `other`.
fn missing_from(from: &[Issue], other: &[Issue]) -> Vec<Issue> {
    let other: BTreeSet<&str> = other.iter().map(|i| i.fingerprint.as_str()).collect();
    let mut seen = BTreeSet::new();
    from.iter()
        .filter(|i| !other.contains(i.fingerprint.as_str()) && seen.insert(&i.fingerprint))
        .cloned()
        .collect()
}

impl ImprovementReport {
    pub fn summary(&self) -> ReportSummary {
        let mut summary = ReportSummary {
            total: self.files.len(),
            skipped: self.skipped_files.len(),
            ..Default::default()
        };
        for file in &self.files {
            match file.status {
                FileStatus::Error => summary.error += 1,
                FileStatus::AllIssuesResolved => summary.all_issues_resolved += 1,
                FileStatus::IssuesRemain => summary.issues_remain += 1,
            }
        }
        summary
    }

    /// None when no analysis ran at all.
    pub fn narrative_input(&self) -> Option<NarrativeInput> {
        let mut analyses = String::new();
        let mut pass_count = 0;
        for file in &self.files {
            for snapshot in &file.snapshots {
                pass_count += 1;
                let _ = writeln!(
                    analyses,
                    "### {} (PR iteration {}, pass {})\n\n{}\n",
                    file.file_path,
                    file.pr_iteration,
                    snapshot.iteration_index,
                    snapshot.reviewer_analysis.trim()
                );
            }
        }
        (pass_count > 0).then(|| NarrativeInput {
            analyses,
            file_count: self.files.len(),
            pass_count,
        })
    }

    pub fn to_markdown(&self) -> String {
        let summary = self.summary();
        let iterations: Vec<String> = self.iterations.iter().map(u32::to_string).collect();
        let mut out = String::new();
        let _ = writeln!(out, "# Review of PR {}\n", self.pr_id);
        let _ = writeln!(out, "Iterations: {}\n", iterations.join(", "));
        let _ = writeln!(
            out,
            "{} file(s): {} resolved, {} with remaining issues, {} failed, {} skipped.\n",
            summary.total,
            summary.all_issues_resolved,
            summary.issues_remain,
            summary.error,
            summary.skipped
        );

        if let Some(ref narrative) = self.narrative {
            let _ = writeln!(out, "## Summary\n\n{}\n", narrative.trim());
        }

        if !self.files.is_empty() {
            out.push_str("## Files\n\n");
        }
        for file in &self.files {
            let _ = writeln!(
                out,
                "### `{}` (iteration {}, {})\n",
                file.file_path, file.pr_iteration, file.change_type
            );
            let _ = writeln!(
                out,
                "Status: **{}** after {} pass(es).\n",
                file.status.as_str(),
                file.iterations_completed
            );
            if let Some(ref error) = file.error {
                let _ = writeln!(out, "Error: {error}\n");
            }
            if !file.snapshots.is_empty() {
                out.push_str("| Pass | Issues | Resolved | +/- |\n|---|---|---|---|\n");
                for snap in &file.snapshots {
                    let stats = diff::stats(&snap.before, &snap.after);
                    let _ = writeln!(
                        out,
                        "| {} | {} | {} | +{} -{} |",
                        snap.iteration_index,
                        snap.issues_found,
                        snap.issues_resolved,
                        stats.added,
                        stats.removed
                    );
                }
                out.push('\n');
            }
            if !file.remaining_issues.is_empty() {
                out.push_str("Remaining issues:\n\n");
                for issue in &file.remaining_issues {
                    let _ = writeln!(
                        out,
                        "- [{}] {}: {}",
                        issue.severity,
                        issue.location(),
                        issue.description
                    );
                }
                out.push('\n');
            }
            for warning in &file.warnings {
                let _ = writeln!(out, "> ⚠️ {warning}");
            }
            if !file.warnings.is_empty() {
                out.push('\n');
            }
        }

        let changed: Vec<&FileEvolution> = self
            .evolution
            .iter()
            .filter(|e| e.pr_iterations.len() > 1)
            .collect();
        if !changed.is_empty() {
            out.push_str("## Evolution\n\n");
            for evo in changed {
                let seen: Vec<String> = evo.pr_iterations.iter().map(u32::to_string).collect();
                let _ = writeln!(
                    out,
                    "- `{}` (iterations {}): {} resolved, {} introduced",
                    evo.file_path,
                    seen.join(", "),
                    evo.resolved.len(),
                    evo.introduced.len()
                );
            }
            out.push('\n');
        }

        if !self.skipped_files.is_empty() {
            out.push_str("## Skipped\n\n");
            for skipped in &self.skipped_files {
                let _ = writeln!(
                    out,
                    "- `{}` (iteration {}): {}",
                    skipped.path, skipped.pr_iteration, skipped.reason
                );
            }
            out.push('\n');
        }

        if !self.warnings.is_empty() {
            out.push_str("## Warnings\n\n");
            for warning in &self.warnings {
                let _ = writeln!(out, "- {warning}");
            }
        }
        out
    }
}
