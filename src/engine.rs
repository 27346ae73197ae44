use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use crate::comments;
use crate::config::{Config, SkipRules};
use crate::convergence::{
    ConvergenceLoop, FileImprovementState, IterationResult, IterationSink, LoopSettings, NoopSink,
};
use crate::error::{Error, HostError, HostFailure};
use crate::extract::{IssueExtractor, MarkdownExtractor};
use crate::generation::GenerationService;
use crate::host::{self, ChangeType, FileVersion, HostResult, IterationFile, PrHost};
use crate::issue::Issue;
use crate::prompts::PromptEngine;
use crate::reconcile::{ReviewPass, ThreadAction, reconcile};
use crate::report::{self, FileRun, ImprovementReport, SkippedFile};
use crate::steps::{self, SummaryRequest};
use crate::threads::{HostSync, ThreadRecord, ThreadScope, ThreadStore};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub loop_settings: LoopSettings,
    pub host_timeout: Option<Duration>,
    pub max_parallel_files: usize,
    pub post_comments: bool,
    pub skip: SkipRules,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            loop_settings: LoopSettings::default(),
            host_timeout: Some(Duration::from_secs(30)),
            max_parallel_files: 1,
            post_comments: true,
            skip: SkipRules::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            loop_settings: LoopSettings {
                max_iterations: config.max_iterations,
                step_timeout: Some(config.generation_timeout),
                rate_limit_retries: config.rate_limit_retries,
                ..LoopSettings::default()
            },
            host_timeout: Some(config.host_timeout),
            max_parallel_files: config.max_parallel_files,
            post_comments: config.post_comments,
            skip: config.skip.clone(),
        }
    }
}

/// Which PR iterations a review covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationSelection {
    Latest,
    All,
    Only(Vec<u32>),
}

/// Input of a single-file improvement run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImprovementRequest {
    pub pr_id: u64,
    pub file_path: String,
    /// Baseline the diffs are taken against.
    pub original_content: String,
    /// Content reviewed by the first analysis pass.
    pub new_content: String,
    pub max_iterations: u32,
    pub post_comments: bool,
}

struct Shared<G, H, S, X> {
    generation: G,
    host: H,
    store: S,
    extractor: X,
    prompts: PromptEngine,
    settings: EngineSettings,
    /// Completed iterations of the latest run per PR file.
    ledger: Mutex<HashMap<ThreadScope, Vec<IterationResult>>>,
}

/// Drives improvement runs and keeps PR threads in step with them.
pub struct ImprovementEngine<G, H, S, X = MarkdownExtractor> {
    shared: Arc<Shared<G, H, S, X>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<G, H, S> ImprovementEngine<G, H, S>
where
    G: GenerationService + 'static,
    H: PrHost + 'static,
    S: ThreadStore + 'static,
{
    pub fn new(
        generation: G,
        host: H,
        store: S,
        prompts: PromptEngine,
        settings: EngineSettings,
    ) -> Self {
        Self::with_extractor(generation, host, store, MarkdownExtractor, prompts, settings)
    }
}

impl<G, H, S, X> ImprovementEngine<G, H, S, X>
where
    G: GenerationService + 'static,
    H: PrHost + 'static,
    S: ThreadStore + 'static,
    X: IssueExtractor + 'static,
{
    pub fn with_extractor(
        generation: G,
        host: H,
        store: S,
        extractor: X,
        prompts: PromptEngine,
        settings: EngineSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                generation,
                host,
                store,
                extractor,
                prompts,
                settings,
                ledger: Mutex::new(HashMap::new()),
            }),
            shutdown: None,
        }
    }

    /// Loops stop between steps once `shutdown` reads true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.shared.settings
    }

    pub async fn run_improvement(&self, request: ImprovementRequest) -> FileImprovementState {
        self.shared.improve(request, self.shutdown.as_ref()).await
    }

    /// Iterations recorded by the latest run for this file. Empty when the
    /// file was never improved by this engine.
    pub fn get_improvement_details(&self, pr_id: u64, file_path: &str) -> Vec<IterationResult> {
        self.shared
            .ledger
            .lock()
            .ok()
            .and_then(|ledger| ledger.get(&ThreadScope::new(pr_id, file_path)).cloned())
            .unwrap_or_default()
    }

    /// Resolves a selection against the iterations the host knows about.
    pub async fn select_iterations(
        &self,
        pr_id: u64,
        selection: &IterationSelection,
    ) -> HostResult<Vec<u32>> {
        let available = host::with_timeout(
            self.shared.settings.host_timeout,
            self.shared.host.list_iterations(pr_id),
        )
        .await?;
        let selected: Vec<u32> = match selection {
            IterationSelection::Latest => available.last().copied().into_iter().collect(),
            IterationSelection::All => available.clone(),
            IterationSelection::Only(ids) => {
                if let Some(missing) = ids.iter().find(|id| !available.contains(id)) {
                    return Err(HostError::new(
                        HostFailure::NotFound,
                        format!("iteration {missing} not found on pull request {pr_id}"),
                    ));
                }
                ids.clone()
            }
        };
        if selected.is_empty() {
            return Err(HostError::new(
                HostFailure::NotFound,
                format!("pull request {pr_id} has no iterations"),
            ));
        }
        info!(pr_id, ?selected, available = available.len(), "iterations selected");
        Ok(selected)
    }

    /// Improves every reviewable file of the given PR iterations and
    /// aggregates the results. Partial failures end up in the report.
    pub async fn run_multi_iteration_review(
        &self,
        pr_id: u64,
        iterations: &[u32],
    ) -> ImprovementReport {
        let shared = &self.shared;
        let mut warnings = Vec::new();
        let mut skipped = Vec::new();
        let mut jobs = Vec::new();

        for &iteration in iterations {
            if shutdown_requested(self.shutdown.as_ref()) {
                info!(pr_id, iteration, "shutdown requested, not listing further iterations");
                warnings.push(format!("review interrupted before iteration {iteration}"));
                break;
            }
            let listed = host::with_timeout(
                shared.settings.host_timeout,
                shared.host.get_iteration_files(pr_id, iteration),
            )
            .await;
            let files = match listed {
                Ok(files) => files,
                Err(e) => {
                    warn!(pr_id, iteration, error = %e, "could not list iteration files");
                    warnings.push(format!("iteration {iteration}: could not list files: {e}"));
                    continue;
                }
            };
            info!(pr_id, iteration, files = files.len(), "iteration files listed");
            for file in files {
                match skip_reason(&shared.settings.skip, &file) {
                    Some(reason) => {
                        debug!(path = %file.path, %reason, "skipping file");
                        skipped.push(SkippedFile {
                            path: file.path,
                            pr_iteration: iteration,
                            reason,
                        });
                    }
                    None => jobs.push(FileJob {
                        pr_iteration: iteration,
                        path: file.path,
                        change_type: file.change_type,
                    }),
                }
            }
        }

        let runs = self.run_jobs(pr_id, jobs).await;
        let mut report = report::aggregate(pr_id, iterations, runs, skipped, warnings);
        shared.narrate(&mut report, self.shutdown.as_ref()).await;

        let summary = report.summary();
        info!(
            pr_id,
            files = summary.total,
            resolved = summary.all_issues_resolved,
            remaining = summary.issues_remain,
            failed = summary.error,
            skipped = summary.skipped,
            "review complete"
        );
        report
    }

    /// Runs file jobs and returns their results in input order. Distinct
    /// paths may run concurrently; the PR iterations of one path share a
    /// thread scope and always run one after another.
    async fn run_jobs(&self, pr_id: u64, jobs: Vec<FileJob>) -> Vec<FileRun> {
        let parallel = self.shared.settings.max_parallel_files;
        let groups = group_by_path(&jobs);
        if parallel <= 1 || groups.len() <= 1 {
            let mut runs = Vec::with_capacity(jobs.len());
            for job in jobs {
                runs.push(self.shared.review_file(pr_id, job, self.shutdown.as_ref()).await);
            }
            return runs;
        }

        info!(pr_id, files = jobs.len(), paths = groups.len(), parallel, "reviewing files concurrently");
        let concurrency = Arc::new(Semaphore::new(parallel));
        let mut join_set = tokio::task::JoinSet::new();
        for group in groups {
            let shared = Arc::clone(&self.shared);
            let concurrency = Arc::clone(&concurrency);
            let shutdown = self.shutdown.clone();
            join_set.spawn(async move {
                let _permit = concurrency.acquire().await.ok();
                let mut done = Vec::with_capacity(group.len());
                for (index, job) in group {
                    done.push((index, shared.review_file(pr_id, job, shutdown.as_ref()).await));
                }
                done
            });
        }

        let mut slots: Vec<Option<FileRun>> = vec![None; jobs.len()];
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(done) => {
                    for (index, run) in done {
                        slots[index] = Some(run);
                    }
                }
                Err(e) => warn!(error = %e, "file task panicked"),
            }
        }
        jobs.into_iter()
            .zip(slots)
            .map(|(job, slot)| {
                slot.unwrap_or_else(|| FileRun {
                    pr_iteration: job.pr_iteration,
                    change_type: job.change_type,
                    state: FileImprovementState::failed(job.path, "file task panicked"),
                    threads: Vec::new(),
                })
            })
            .collect()
    }
}

/// Jobs grouped by path, each group in input order, groups ordered by
/// first appearance. Entries carry their input index.
fn group_by_path(jobs: &[FileJob]) -> Vec<Vec<(usize, FileJob)>> {
    let mut groups: Vec<Vec<(usize, FileJob)>> = Vec::new();
    let mut by_path: HashMap<&str, usize> = HashMap::new();
    for (index, job) in jobs.iter().enumerate() {
        let slot = *by_path.entry(job.path.as_str()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push((index, job.clone()));
    }
    groups
}

#[derive(Debug, Clone)]
struct FileJob {
    pr_iteration: u32,
    path: String,
    change_type: ChangeType,
}

fn skip_reason(skip: &SkipRules, file: &IterationFile) -> Option<String> {
    if file.change_type == ChangeType::Delete {
        return Some("deleted".to_string());
    }
    skip.should_skip(&file.path)
}

fn shutdown_requested(shutdown: Option<&watch::Receiver<bool>>) -> bool {
    shutdown.is_some_and(|rx| *rx.borrow())
}

impl<G, H, S, X> Shared<G, H, S, X>
where
    G: GenerationService,
    H: PrHost,
    S: ThreadStore,
    X: IssueExtractor,
{
    async fn improve(
        &self,
        request: ImprovementRequest,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> FileImprovementState {
        let settings = LoopSettings {
            max_iterations: request.max_iterations,
            ..self.settings.loop_settings.clone()
        };
        info!(
            pr_id = request.pr_id,
            file = %request.file_path,
            max_iterations = settings.max_iterations,
            post_comments = request.post_comments,
            "improving file"
        );
        let run = ConvergenceLoop::new(&self.generation, &self.extractor, &self.prompts, &settings)
            .with_shutdown(shutdown);
        let state = if request.post_comments {
            let mut sink = ThreadSync {
                host: &self.host,
                store: &self.store,
                scope: ThreadScope::new(request.pr_id, request.file_path.as_str()),
                host_timeout: self.settings.host_timeout,
            };
            run.run(
                &request.file_path,
                &request.original_content,
                &request.new_content,
                &mut sink,
            )
            .await
        } else {
            run.run(
                &request.file_path,
                &request.original_content,
                &request.new_content,
                &mut NoopSink,
            )
            .await
        };

        match self.ledger.lock() {
            Ok(mut ledger) => {
                ledger.insert(
                    ThreadScope::new(request.pr_id, request.file_path),
                    state.iterations.clone(),
                );
            }
            Err(_) => warn!("improvement ledger lock poisoned, details not recorded"),
        }
        state
    }

    async fn review_file(
        &self,
        pr_id: u64,
        job: FileJob,
        shutdown: Option<&watch::Receiver<bool>>,
    ) -> FileRun {
        let state = match self.fetch_versions(pr_id, &job).await {
            Ok((before, after)) => {
                let request = ImprovementRequest {
                    pr_id,
                    file_path: job.path.clone(),
                    original_content: before,
                    new_content: after,
                    max_iterations: self.settings.loop_settings.max_iterations,
                    post_comments: self.settings.post_comments,
                };
                self.improve(request, shutdown).await
            }
            Err(e) => {
                warn!(pr_id, file = %job.path, error = %e, "could not fetch file contents");
                FileImprovementState::failed(job.path.as_str(), e)
            }
        };
        let scope = ThreadScope::new(pr_id, job.path.as_str());
        let threads = self.store.list(&scope).unwrap_or_else(|e| {
            warn!(file = %job.path, error = %e, "could not list thread records");
            Vec::new()
        });
        FileRun {
            pr_iteration: job.pr_iteration,
            change_type: job.change_type,
            state,
            threads,
        }
    }

    /// Merge-base and iteration-head contents. A file absent at the merge
    /// base is reviewed against an empty baseline.
    async fn fetch_versions(&self, pr_id: u64, job: &FileJob) -> HostResult<(String, String)> {
        let before = if job.change_type == ChangeType::Add {
            None
        } else {
            self.content(pr_id, job, FileVersion::Before).await?
        };
        let after = self
            .content(pr_id, job, FileVersion::After)
            .await?
            .ok_or_else(|| {
                HostError::new(
                    HostFailure::NotFound,
                    format!("{} not found at iteration {}", job.path, job.pr_iteration),
                )
            })?;
        Ok((before.unwrap_or_default(), after))
    }

    async fn content(
        &self,
        pr_id: u64,
        job: &FileJob,
        version: FileVersion,
    ) -> HostResult<Option<String>> {
        host::with_timeout(
            self.settings.host_timeout,
            self.host
                .get_file_content(pr_id, job.pr_iteration, &job.path, version),
        )
        .await
    }

    /// Fills the report narrative. Failures become report warnings.
    async fn narrate(
        &self,
        report: &mut ImprovementReport,
        shutdown: Option<&watch::Receiver<bool>>,
    ) {
        let Some(input) = report.narrative_input() else {
            debug!(pr_id = report.pr_id, "no analyses ran, skipping narrative");
            return;
        };
        if shutdown_requested(shutdown) {
            report
                .warnings
                .push("narrative skipped: interrupted".to_string());
            return;
        }
        let request = SummaryRequest {
            pr_id: report.pr_id,
            file_count: input.file_count,
            pass_count: input.pass_count,
            analyses: &input.analyses,
        };
        match steps::summarize(
            &self.generation,
            &self.prompts,
            &request,
            self.settings.loop_settings.step_timeout,
        )
        .await
        {
            Ok(narrative) => {
                if self.settings.post_comments {
                    self.post_summary(report.pr_id, &narrative, &mut report.warnings)
                        .await;
                }
                report.narrative = Some(narrative);
            }
            Err(e) => {
                warn!(pr_id = report.pr_id, error = %e, "narrative summary failed");
                report.warnings.push(format!("narrative summary failed: {e}"));
            }
        }
    }

    async fn post_summary(&self, pr_id: u64, narrative: &str, warnings: &mut Vec<String>) {
        let body = comments::review_summary_body(narrative);
        match host::with_timeout(
            self.settings.host_timeout,
            self.host.create_pr_comment(pr_id, &body),
        )
        .await
        {
            Ok(thread_id) => info!(pr_id, thread_id, "review summary posted"),
            Err(e) => {
                warn!(pr_id, error = %e, "could not post review summary");
                warnings.push(format!("summary comment not posted: {e}"));
            }
        }
    }
}

/// Reconciles each parsed pass against the thread store and mirrors the
/// resulting actions onto the PR host.
struct ThreadSync<'a, H, S> {
    host: &'a H,
    store: &'a S,
    scope: ThreadScope,
    host_timeout: Option<Duration>,
}

impl<H: PrHost, S: ThreadStore> IterationSink for ThreadSync<'_, H, S> {
    async fn issues_found(&mut self, iteration: u32, review: &str, issues: &[Issue]) -> Vec<String> {
        let mut warnings = Vec::new();
        let note =
            comments::file_review_body(&self.scope.file_path, iteration, review, issues.len());
        if let Err(message) = self
            .call(self.host.create_pr_comment(self.scope.pr_id, &note))
            .await
        {
            warn!(file = %self.scope.file_path, iteration, error = %message, "file review comment failed");
            warnings.push(format!("iteration {iteration}: file review comment: {message}"));
        }

        let reconciled = self
            .store
            .begin_pass(&self.scope)
            .and_then(|sequence| {
                reconcile(
                    &self.scope,
                    issues,
                    self.store,
                    ReviewPass {
                        sequence,
                        iteration,
                    },
                )
            });
        let reconciliation = match reconciled {
            Ok(r) => r,
            Err(e) => {
                warn!(file = %self.scope.file_path, iteration, error = %e, "reconciliation failed");
                warnings.push(format!(
                    "iteration {iteration}: threads not reconciled: {e}"
                ));
                return warnings;
            }
        };
        warnings.extend(reconciliation.warnings);

        let mut handled = HashSet::new();
        for action in &reconciliation.actions {
            handled.insert(action.fingerprint().to_string());
            if let Err(message) = self.apply(action, iteration).await {
                warn!(
                    file = %self.scope.file_path,
                    fingerprint = action.fingerprint(),
                    error = %message,
                    "thread update failed"
                );
                warnings.push(format!(
                    "iteration {iteration}: thread {}: {message}",
                    action.fingerprint()
                ));
            }
        }
        warnings.extend(self.retry_unconfirmed(iteration, &handled).await);
        warnings
    }
}

impl<H: PrHost, S: ThreadStore> ThreadSync<'_, H, S> {
    async fn apply(&self, action: &ThreadAction, iteration: u32) -> Result<(), String> {
        match action {
            ThreadAction::Create { issue, record } => self.open_thread(issue, record, iteration).await,
            ThreadAction::Update { issue, record } => match record.external_thread_id {
                Some(ref thread_id) => {
                    debug!(thread_id, fingerprint = %record.fingerprint, "commenting on thread");
                    self.call(self.host.update_thread(
                        self.scope.pr_id,
                        thread_id,
                        &comments::persisting_body(issue, iteration),
                    ))
                    .await
                }
                None => self.open_thread(issue, record, iteration).await,
            },
            ThreadAction::MarkFixed { record } => {
                if record.external_thread_id.is_none() {
                    debug!(fingerprint = %record.fingerprint, "fixed issue never had a thread");
                    return Ok(());
                }
                self.confirm_fixed(record).await
            }
        }
    }

    /// Creates the host thread and stores its id on the record.
    async fn open_thread(
        &self,
        issue: &Issue,
        record: &ThreadRecord,
        iteration: u32,
    ) -> Result<(), String> {
        let thread_id = self
            .call(self.host.create_thread(
                self.scope.pr_id,
                &self.scope.file_path,
                issue.line,
                &comments::new_thread_body(issue, iteration),
            ))
            .await?;
        info!(thread_id, fingerprint = %record.fingerprint, iteration, "thread created");
        let saved = self.write_back(&record.fingerprint, |r| {
            if r.external_thread_id.is_none() {
                r.external_thread_id = Some(thread_id.clone());
            }
        });
        match saved {
            Ok(r) if r.external_thread_id.as_deref() == Some(thread_id.as_str()) => Ok(()),
            Ok(r) => Err(format!(
                "thread {thread_id} duplicates thread {} and was not recorded",
                r.external_thread_id.as_deref().unwrap_or_default()
            )),
            Err(e) => Err(format!("thread {thread_id} created but its id was not saved: {e}")),
        }
    }

    /// Posts the fixed confirmation and resolves the thread, recording each
    /// step so an interrupted confirmation resumes where it stopped.
    async fn confirm_fixed(&self, record: &ThreadRecord) -> Result<(), String> {
        let Some(ref thread_id) = record.external_thread_id else {
            return Ok(());
        };
        let pr_id = self.scope.pr_id;
        let fixed_in = record
            .fixed_in_iteration
            .unwrap_or(record.last_seen_iteration);
        let same_thread = |r: &ThreadRecord| r.external_thread_id.as_deref() == Some(thread_id.as_str());

        if record.host_sync == HostSync::ConfirmPending {
            self.call(self.host.update_thread(pr_id, thread_id, &comments::fixed_body(fixed_in)))
                .await?;
            self.write_back(&record.fingerprint, |r| {
                if same_thread(r) {
                    r.host_sync = HostSync::ResolvePending;
                }
            })?;
        }
        self.call(self.host.resolve_thread(pr_id, thread_id)).await?;
        self.write_back(&record.fingerprint, |r| {
            if same_thread(r) {
                r.host_sync = HostSync::Synced;
            }
        })?;
        info!(thread_id, fingerprint = %record.fingerprint, fixed_in, "thread resolved");
        Ok(())
    }

    /// Finishes confirmations an earlier pass could not complete.
    async fn retry_unconfirmed(&self, iteration: u32, handled: &HashSet<String>) -> Vec<String> {
        let records = match self.store.list(&self.scope) {
            Ok(records) => records,
            Err(e) => return vec![format!("iteration {iteration}: threads not listed: {e}")],
        };
        let mut warnings = Vec::new();
        for record in records
            .iter()
            .filter(|r| r.needs_host_resolution() && !handled.contains(&r.fingerprint))
        {
            debug!(fingerprint = %record.fingerprint, "retrying thread resolution");
            if let Err(message) = self.confirm_fixed(record).await {
                warn!(fingerprint = %record.fingerprint, error = %message, "thread resolution retry failed");
                warnings.push(format!(
                    "iteration {iteration}: thread {}: {message}",
                    record.fingerprint
                ));
            }
        }
        warnings
    }

    /// Re-reads the record and applies `change`, once more on a stale revision.
    fn write_back(
        &self,
        fingerprint: &str,
        change: impl Fn(&mut ThreadRecord),
    ) -> Result<ThreadRecord, String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut record = self
                .store
                .get(&self.scope, fingerprint)
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("thread record {fingerprint} missing"))?;
            let revision = record.revision;
            change(&mut record);
            match self.store.put(&self.scope, record, Some(revision)) {
                Ok(saved) => return Ok(saved),
                Err(Error::ReconciliationConflict { .. }) if attempt < 2 => {
                    debug!(fingerprint, "stale thread record, writing again");
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    async fn call<T>(
        &self,
        call: impl std::future::Future<Output = HostResult<T>>,
    ) -> Result<T, String> {
        host::with_timeout(self.host_timeout, call)
            .await
            .map_err(|e| e.to_string())
    }
}
