#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use revloop::convergence::LoopSettings;
use revloop::engine::EngineSettings;
use revloop::error::{GenerationError, GenerationFailure, HostError, HostFailure};
use revloop::generation::{GenerationRole, GenerationService};
use revloop::host::{ChangeType, FileVersion, HostResult, IterationFile, PrHost};

// --- Generation mock ---

#[derive(Debug)]
pub enum Reply {
    Text(String),
    Fail(GenerationError),
    /// Sleeps, then answers with the text. Used to trip step timeouts.
    Stall(Duration, String),
}

#[derive(Default)]
struct FileScript {
    analyze: VecDeque<Reply>,
    fix: VecDeque<Reply>,
    /// Answer once the analyze queue is empty.
    analyze_fallback: Option<String>,
    /// Answer once the fix queue is empty.
    fix_fallback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationCall {
    pub role: GenerationRole,
    /// File named in the prompt; None for the narrative summary.
    pub file: Option<String>,
}

/// Generation service answering from per-file scripts.
///
/// Prompts are routed by the `File: \`path\`` line of the analyze and fix
/// templates. With empty queues, analysis answers "No issues found." and
/// fixes fail as malformed.
#[derive(Default)]
pub struct MockGeneration {
    scripts: Mutex<HashMap<String, FileScript>>,
    summary: Mutex<VecDeque<Reply>>,
    pub calls: Arc<Mutex<Vec<GenerationCall>>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&mut self, path: &str) -> &mut FileScript {
        self.scripts
            .get_mut()
            .unwrap()
            .entry(path.to_string())
            .or_default()
    }

    pub fn analyze(mut self, path: &str, reply: &str) -> Self {
        self.script(path)
            .analyze
            .push_back(Reply::Text(reply.to_string()));
        self
    }

    pub fn analyze_err(mut self, path: &str, err: GenerationError) -> Self {
        self.script(path).analyze.push_back(Reply::Fail(err));
        self
    }

    pub fn always_analyze(mut self, path: &str, reply: &str) -> Self {
        self.script(path).analyze_fallback = Some(reply.to_string());
        self
    }

    pub fn fix(mut self, path: &str, reply: &str) -> Self {
        self.script(path).fix.push_back(Reply::Text(reply.to_string()));
        self
    }

    pub fn fix_reply(mut self, path: &str, reply: Reply) -> Self {
        self.script(path).fix.push_back(reply);
        self
    }

    pub fn always_fix(mut self, path: &str, reply: &str) -> Self {
        self.script(path).fix_fallback = Some(reply.to_string());
        self
    }

    pub fn summary(self, reply: &str) -> Self {
        self.summary
            .lock()
            .unwrap()
            .push_back(Reply::Text(reply.to_string()));
        self
    }

    pub fn summary_err(self, err: GenerationError) -> Self {
        self.summary.lock().unwrap().push_back(Reply::Fail(err));
        self
    }

    /// Every call sleeps this long first, so concurrent calls overlap.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_in_flight(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.max_in_flight)
    }

    pub fn call_log(&self) -> Arc<Mutex<Vec<GenerationCall>>> {
        Arc::clone(&self.calls)
    }

    fn next_reply(&self, role: GenerationRole, file: Option<&str>) -> Reply {
        let Some(file) = file else {
            return self
                .summary
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Reply::Text("Summary.".to_string()));
        };
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(file.to_string()).or_default();
        match role {
            GenerationRole::Analyze => script.analyze.pop_front().unwrap_or_else(|| {
                Reply::Text(
                    script
                        .analyze_fallback
                        .clone()
                        .unwrap_or_else(|| "No issues found.".to_string()),
                )
            }),
            GenerationRole::Fix => script.fix.pop_front().unwrap_or_else(|| {
                match script.fix_fallback.clone() {
                    Some(text) => Reply::Text(text),
                    None => Reply::Fail(GenerationError::new(
                        GenerationFailure::Malformed,
                        "no scripted fix",
                    )),
                }
            }),
        }
    }
}

fn prompt_file(prompt: &str) -> Option<String> {
    let start = prompt.find("File: `")? + "File: `".len();
    let len = prompt[start..].find('`')?;
    Some(prompt[start..start + len].to_string())
}

impl GenerationService for MockGeneration {
    async fn generate(&self, prompt: &str, role: GenerationRole) -> Result<String, GenerationError> {
        let file = prompt_file(prompt);
        self.calls.lock().unwrap().push(GenerationCall {
            role,
            file: file.clone(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let reply = self.next_reply(role, file.as_deref());
        let result = match reply {
            Reply::Text(text) => Ok(text),
            Reply::Fail(err) => Err(err),
            Reply::Stall(duration, text) => {
                tokio::time::sleep(duration).await;
                Ok(text)
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn count_calls(log: &Mutex<Vec<GenerationCall>>, role: GenerationRole, file: &str) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|c| c.role == role && c.file.as_deref() == Some(file))
        .count()
}

// --- PR host mock ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedThread {
    pub id: String,
    pub pr_id: u64,
    pub file_path: String,
    pub line: Option<u32>,
    pub body: String,
}

#[derive(Default)]
pub struct HostTracker {
    pub created: Vec<CreatedThread>,
    pub comments: Vec<(String, String)>,
    pub resolved: Vec<String>,
    /// PR-level comments: per-pass file reviews and the narrative summary.
    pub pr_comments: Vec<String>,
}

impl HostTracker {
    pub fn comments_on(&self, thread_id: &str) -> Vec<&str> {
        self.comments
            .iter()
            .filter(|(id, _)| id == thread_id)
            .map(|(_, body)| body.as_str())
            .collect()
    }
}

/// In-memory PR host recording every thread mutation.
#[derive(Default)]
pub struct MockHost {
    files: HashMap<u32, Vec<IterationFile>>,
    contents: HashMap<(u32, String, bool), String>,
    failing_iterations: HashSet<u32>,
    fail_threads: bool,
    fail_pr_comments: bool,
    /// Resolve calls still to reject with a rate limit.
    resolve_failures: AtomicUsize,
    next_id: AtomicU64,
    pub tracker: Arc<Mutex<HostTracker>>,
}

impl MockHost {
    pub fn new(tracker: Arc<Mutex<HostTracker>>) -> Self {
        Self {
            tracker,
            next_id: AtomicU64::new(100),
            ..Default::default()
        }
    }

    /// Adds a file to an iteration listing. `before` is the merge-base
    /// content, `after` the iteration head content; None means absent.
    pub fn file(
        mut self,
        iteration: u32,
        path: &str,
        change_type: ChangeType,
        before: Option<&str>,
        after: Option<&str>,
    ) -> Self {
        self.files.entry(iteration).or_default().push(IterationFile {
            path: path.to_string(),
            change_type,
            diff: String::new(),
        });
        if let Some(before) = before {
            self.contents
                .insert((iteration, path.to_string(), false), before.to_string());
        }
        if let Some(after) = after {
            self.contents
                .insert((iteration, path.to_string(), true), after.to_string());
        }
        self
    }

    pub fn fail_listing(mut self, iteration: u32) -> Self {
        self.failing_iterations.insert(iteration);
        self
    }

    pub fn fail_threads(mut self) -> Self {
        self.fail_threads = true;
        self
    }

    pub fn fail_pr_comments(mut self) -> Self {
        self.fail_pr_comments = true;
        self
    }

    /// Rejects the next `times` resolve calls with HTTP 429.
    pub fn fail_resolve(self, times: usize) -> Self {
        self.resolve_failures.store(times, Ordering::SeqCst);
        self
    }

    fn thread_call(&self) -> HostResult<()> {
        if self.fail_threads {
            return Err(HostError::new(HostFailure::RateLimited, "HTTP 429: slow down"));
        }
        Ok(())
    }
}

impl PrHost for MockHost {
    async fn get_iteration_files(&self, _pr_id: u64, iteration: u32) -> HostResult<Vec<IterationFile>> {
        if self.failing_iterations.contains(&iteration) {
            return Err(HostError::new(HostFailure::Auth, "HTTP 401: bad token"));
        }
        Ok(self.files.get(&iteration).cloned().unwrap_or_default())
    }

    async fn list_iterations(&self, _pr_id: u64) -> HostResult<Vec<u32>> {
        let mut ids: Vec<u32> = self
            .files
            .keys()
            .chain(self.failing_iterations.iter())
            .copied()
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn get_file_content(
        &self,
        _pr_id: u64,
        iteration: u32,
        path: &str,
        version: FileVersion,
    ) -> HostResult<Option<String>> {
        let after = version == FileVersion::After;
        Ok(self
            .contents
            .get(&(iteration, path.to_string(), after))
            .cloned())
    }

    async fn create_thread(
        &self,
        pr_id: u64,
        file_path: &str,
        line: Option<u32>,
        body: &str,
    ) -> HostResult<String> {
        self.thread_call()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.tracker.lock().unwrap().created.push(CreatedThread {
            id: id.clone(),
            pr_id,
            file_path: file_path.to_string(),
            line,
            body: body.to_string(),
        });
        Ok(id)
    }

    async fn update_thread(&self, _pr_id: u64, thread_id: &str, body: &str) -> HostResult<()> {
        self.thread_call()?;
        self.tracker
            .lock()
            .unwrap()
            .comments
            .push((thread_id.to_string(), body.to_string()));
        Ok(())
    }

    async fn resolve_thread(&self, _pr_id: u64, thread_id: &str) -> HostResult<()> {
        self.thread_call()?;
        let rejected = self
            .resolve_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(HostError::new(HostFailure::RateLimited, "HTTP 429: slow down"));
        }
        self.tracker
            .lock()
            .unwrap()
            .resolved
            .push(thread_id.to_string());
        Ok(())
    }

    async fn create_pr_comment(&self, _pr_id: u64, body: &str) -> HostResult<String> {
        if self.fail_pr_comments {
            return Err(HostError::new(HostFailure::Unavailable, "HTTP 503: unavailable"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.tracker.lock().unwrap().pr_comments.push(body.to_string());
        Ok(id)
    }
}

// --- Settings ---

pub fn test_settings(max_iterations: u32) -> EngineSettings {
    EngineSettings {
        loop_settings: LoopSettings {
            max_iterations,
            step_timeout: Some(Duration::from_secs(5)),
            rate_limit_retries: 2,
            initial_backoff: Duration::from_millis(1),
        },
        host_timeout: Some(Duration::from_secs(5)),
        ..EngineSettings::default()
    }
}
