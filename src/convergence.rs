use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::extract::{Extraction, IssueExtractor};
use crate::generation::GenerationService;
use crate::issue::Issue;
use crate::prompts::PromptEngine;
use crate::steps::{self, AnalysisRequest, FixRequest};

/// How a file's loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopOutcome {
    /// The last analysis found no issues.
    Resolved,
    /// Issues remained after `max_iterations` analysis passes.
    BudgetExhausted,
    /// A step failed; see `FileImprovementState::error`.
    Failed,
    /// The reviewer's output could not be read, so nothing was fixed or reconciled.
    Unparsed,
}

/// One completed analysis pass, plus the fix that followed it if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration_index: u32,
    pub original_content: String,
    pub improved_content: String,
    pub reviewer_analysis: String,
    pub issues: Vec<Issue>,
    /// Fingerprints present in the previous pass but not in this one.
    pub resolved_fingerprints: BTreeSet<String>,
    pub parsed: bool,
}

impl IterationResult {
    pub fn was_fixed(&self) -> bool {
        self.original_content != self.improved_content
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileImprovementState {
    pub file_path: String,
    pub iterations: Vec<IterationResult>,
    pub all_issues_resolved: bool,
    pub error: Option<String>,
    pub outcome: LoopOutcome,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl FileImprovementState {
    /// A file that failed before its loop could start.
    pub fn failed(file_path: impl Into<String>, error: impl ToString) -> Self {
        Self {
            file_path: file_path.into(),
            iterations: Vec::new(),
            all_issues_resolved: false,
            error: Some(error.to_string()),
            outcome: LoopOutcome::Failed,
            warnings: Vec::new(),
        }
    }

    pub fn final_content(&self) -> Option<&str> {
        self.iterations.last().map(|it| it.improved_content.as_str())
    }

    /// Issues from the last parsed pass that were never confirmed fixed.
    /// An unreadable final review does not clear them.
    pub fn remaining_issues(&self) -> &[Issue] {
        if self.all_issues_resolved {
            return &[];
        }
        self.iterations
            .iter()
            .rev()
            .find(|it| it.parsed)
            .map(|it| it.issues.as_slice())
            .unwrap_or(&[])
    }
}

/// Receives each parsed pass's review and issues before that pass's fix
/// runs. Returned strings are recorded as warnings on the file's state.
pub trait IterationSink: Send {
    fn issues_found(
        &mut self,
        iteration: u32,
        review: &str,
        issues: &[Issue],
    ) -> impl Future<Output = Vec<String>> + Send;
}

/// Sink for runs that do not touch PR threads.
pub struct NoopSink;

impl IterationSink for NoopSink {
    async fn issues_found(&mut self, _iteration: u32, _review: &str, _issues: &[Issue]) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_iterations: u32,
    pub step_timeout: Option<Duration>,
    pub rate_limit_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            step_timeout: Some(Duration::from_secs(300)),
            rate_limit_retries: 2,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

struct PendingPass {
    iteration: u32,
    review: String,
    issues: Vec<Issue>,
    resolved: BTreeSet<String>,
}

impl PendingPass {
    fn finish(self, original: &str, improved: String) -> IterationResult {
        IterationResult {
            iteration_index: self.iteration,
            original_content: original.to_string(),
            improved_content: improved,
            reviewer_analysis: self.review,
            issues: self.issues,
            resolved_fingerprints: self.resolved,
            parsed: true,
        }
    }
}

enum Step {
    Analyzing { iteration: u32 },
    Fixing(PendingPass),
}

/// Per-file analyze/fix state machine.
///
/// Analyzing moves to Fixing while issues remain and budget is left, and to a
/// terminal outcome otherwise. Fixing always returns to Analyzing with the
/// fixed content. Cancellation is honored only between steps.
pub struct ConvergenceLoop<'a, G, X> {
    generation: &'a G,
    extractor: &'a X,
    prompts: &'a PromptEngine,
    settings: &'a LoopSettings,
    shutdown: Option<&'a watch::Receiver<bool>>,
}

impl<'a, G: GenerationService, X: IssueExtractor> ConvergenceLoop<'a, G, X> {
    pub fn new(
        generation: &'a G,
        extractor: &'a X,
        prompts: &'a PromptEngine,
        settings: &'a LoopSettings,
    ) -> Self {
        Self {
            generation,
            extractor,
            prompts,
            settings,
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: Option<&'a watch::Receiver<bool>>) -> Self {
        self.shutdown = shutdown;
        self
    }

    fn cancelled(&self) -> bool {
        self.shutdown.is_some_and(|rx| *rx.borrow())
    }

    /// Runs the loop for one file. `original_content` is the pre-change
    /// baseline used for diffs; `new_content` is what gets reviewed first.
    pub async fn run<K: IterationSink>(
        &self,
        file_path: &str,
        original_content: &str,
        new_content: &str,
        sink: &mut K,
    ) -> FileImprovementState {
        let max_iterations = self.settings.max_iterations.max(1);
        let mut iterations: Vec<IterationResult> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut error: Option<String> = None;
        let mut current = new_content.to_string();
        let mut previous: BTreeSet<String> = BTreeSet::new();
        let mut prior_issues: Vec<Issue> = Vec::new();
        let mut step = Step::Analyzing { iteration: 1 };

        let outcome = loop {
            if self.cancelled() {
                info!(file = file_path, "shutdown requested, stopping between steps");
                error = Some(Error::Interrupted.to_string());
                break LoopOutcome::Failed;
            }

            match step {
                Step::Analyzing { iteration } => {
                    info!(file = file_path, iteration, max_iterations, "analysis pass");
                    let request = AnalysisRequest {
                        file_path,
                        original_content,
                        current_content: &current,
                        iteration,
                        prior_issues: &prior_issues,
                    };
                    let review = match self
                        .retry_rate_limited(file_path, || {
                            steps::analyze(
                                self.generation,
                                self.prompts,
                                &request,
                                self.settings.step_timeout,
                            )
                        })
                        .await
                    {
                        Ok(review) => review,
                        Err(e) => {
                            warn!(file = file_path, iteration, error = %e, "analysis step failed");
                            error = Some(e.to_string());
                            break LoopOutcome::Failed;
                        }
                    };

                    let issues = match self.extractor.extract(&review, file_path) {
                        Extraction::Parsed { issues } => issues,
                        Extraction::Unparseable { raw } => {
                            warn!(file = file_path, iteration, "reviewer output could not be parsed");
                            warnings.push(format!(
                                "iteration {iteration}: reviewer output could not be parsed, threads left unchanged"
                            ));
                            iterations.push(IterationResult {
                                iteration_index: iteration,
                                original_content: current.clone(),
                                improved_content: current.clone(),
                                reviewer_analysis: raw,
                                issues: Vec::new(),
                                resolved_fingerprints: BTreeSet::new(),
                                parsed: false,
                            });
                            break LoopOutcome::Unparsed;
                        }
                    };

                    let now: BTreeSet<String> =
                        issues.iter().map(|i| i.fingerprint.clone()).collect();
                    let resolved: BTreeSet<String> =
                        previous.difference(&now).cloned().collect();
                    info!(
                        file = file_path,
                        iteration,
                        issues = issues.len(),
                        resolved = resolved.len(),
                        "analysis complete"
                    );
                    warnings.extend(sink.issues_found(iteration, &review, &issues).await);

                    let pass = PendingPass {
                        iteration,
                        review,
                        issues,
                        resolved,
                    };
                    if pass.issues.is_empty() {
                        iterations.push(pass.finish(&current, current.clone()));
                        break LoopOutcome::Resolved;
                    }
                    if iteration >= max_iterations {
                        iterations.push(pass.finish(&current, current.clone()));
                        break LoopOutcome::BudgetExhausted;
                    }
                    previous = now;
                    step = Step::Fixing(pass);
                }
                Step::Fixing(pass) => {
                    info!(file = file_path, iteration = pass.iteration, issues = pass.issues.len(), "fix pass");
                    let request = FixRequest {
                        file_path,
                        current_content: &current,
                        issues: &pass.issues,
                        reviewer_analysis: &pass.review,
                    };
                    let improved = match self
                        .retry_rate_limited(file_path, || {
                            steps::fix(
                                self.generation,
                                self.prompts,
                                &request,
                                self.settings.step_timeout,
                            )
                        })
                        .await
                    {
                        Ok(improved) => improved,
                        Err(e) => {
                            warn!(file = file_path, iteration = pass.iteration, error = %e, "fix step failed");
                            error = Some(e.to_string());
                            break LoopOutcome::Failed;
                        }
                    };
                    if improved == current {
                        warn!(file = file_path, iteration = pass.iteration, "fix step made no changes");
                    }
                    prior_issues = pass.issues.clone();
                    let next = pass.iteration + 1;
                    iterations.push(pass.finish(&current, improved.clone()));
                    current = improved;
                    step = Step::Analyzing { iteration: next };
                }
            }
        };

        info!(file = file_path, ?outcome, passes = iterations.len(), "loop finished");
        FileImprovementState {
            file_path: file_path.to_string(),
            iterations,
            all_issues_resolved: outcome == LoopOutcome::Resolved,
            error,
            outcome,
            warnings,
        }
    }

    /// Retries rate-limited generation calls with exponential backoff.
    /// Every other failure is returned at once.
    async fn retry_rate_limited<T, F, Fut>(&self, file_path: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.settings.initial_backoff;
        let mut retries = 0;
        loop {
            match call().await {
                Err(Error::Generation(e))
                    if e.is_retryable() && retries < self.settings.rate_limit_retries =>
                {
                    retries += 1;
                    warn!(
                        file = file_path,
                        attempt = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                other => return other,
            }
        }
    }
}
