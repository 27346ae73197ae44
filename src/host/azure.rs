use std::time::Duration;

use base64::Engine as _;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{ChangeType, FileVersion, HostResult, IterationFile, PrHost};
use crate::config::AzureConfig;
use crate::error::{Error, HostError, HostFailure, Result};

const API_VERSION: &str = "7.1";

/// Azure DevOps Git pull requests over the REST API.
#[derive(Clone)]
pub struct AzureDevOpsHost {
    repo_url: String,
    auth_header: String,
    agent: ureq::Agent,
}

impl AzureDevOpsHost {
    pub fn new(config: &AzureConfig, pat: &str, timeout: Duration) -> Self {
        Self {
            repo_url: format!(
                "https://dev.azure.com/{}/{}/_apis/git/repositories/{}",
                config.organization, config.project, config.repository
            ),
            auth_header: basic_auth(pat),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    /// Reads the personal access token from the configured env var.
    pub fn from_config(config: &AzureConfig, timeout: Duration) -> Result<Self> {
        let pat = std::env::var(&config.pat_env)
            .ok()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                Error::ConfigValidation(format!(
                    "Azure DevOps token not found in ${}",
                    config.pat_env
                ))
            })?;
        Ok(Self::new(config, &pat, timeout))
    }

    fn send(
        &self,
        method: &str,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> HostResult<Value> {
        let url = format!("{}/{}", self.repo_url, path);
        debug!(method, %url, "azure devops request");
        let mut request = self
            .agent
            .request(method, &url)
            .set("Authorization", &self.auth_header)
            .query("api-version", API_VERSION);
        for (key, value) in query {
            request = request.query(key, value);
        }
        let response = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        }
        .map_err(classify)?;
        response.into_json().map_err(|e| {
            HostError::new(
                HostFailure::Unavailable,
                format!("invalid JSON from {path}: {e}"),
            )
        })
    }

    fn iteration_commits(&self, pr_id: u64, iteration: u32) -> HostResult<IterationCommits> {
        let json = self.send(
            "GET",
            &format!("pullRequests/{pr_id}/iterations/{iteration}"),
            &[],
            None,
        )?;
        parse_iteration_commits(&json)
    }

    fn item_content(&self, path: &str, commit: &str) -> HostResult<Option<String>> {
        let result = self.send(
            "GET",
            "items",
            &[
                ("path", path),
                ("versionDescriptor.versionType", "commit"),
                ("versionDescriptor.version", commit),
                ("includeContent", "true"),
            ],
            None,
        );
        match result {
            Ok(json) => Ok(Some(
                json.get("content")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            )),
            Err(e) if e.reason == HostFailure::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn content_at(
        &self,
        commits: &IterationCommits,
        path: &str,
        version: FileVersion,
    ) -> HostResult<Option<String>> {
        let commit = match version {
            FileVersion::Before => commits.base.as_deref(),
            FileVersion::After => Some(commits.head.as_str()),
        };
        match commit {
            Some(commit) => self.item_content(path, commit),
            None => Ok(None),
        }
    }

    /// Lists changed files only. Contents are fetched per file later, so a
    /// file that cannot be read fails alone instead of the whole listing.
    fn iteration_files_blocking(&self, pr_id: u64, iteration: u32) -> HostResult<Vec<IterationFile>> {
        let changes = self.send(
            "GET",
            &format!("pullRequests/{pr_id}/iterations/{iteration}/changes"),
            &[],
            None,
        )?;
        Ok(parse_change_entries(&changes))
    }

    fn post_thread(&self, pr_id: u64, payload: &Value) -> HostResult<String> {
        let json = self.send(
            "POST",
            &format!("pullRequests/{pr_id}/threads"),
            &[],
            Some(payload),
        )?;
        match json.get("id").and_then(Value::as_u64) {
            Some(id) => Ok(id.to_string()),
            None => {
                warn!(pr_id, "thread created without an id in response");
                Err(HostError::new(
                    HostFailure::Unavailable,
                    "thread response missing id",
                ))
            }
        }
    }

    async fn blocking<T, F>(&self, f: F) -> HostResult<T>
    where
        T: Send + 'static,
        F: FnOnce(AzureDevOpsHost) -> HostResult<T> + Send + 'static,
    {
        let host = self.clone();
        tokio::task::spawn_blocking(move || f(host))
            .await
            .map_err(|e| {
                HostError::new(
                    HostFailure::Unavailable,
                    format!("host task failed: {e}"),
                )
            })?
    }
}

impl PrHost for AzureDevOpsHost {
    async fn list_iterations(&self, pr_id: u64) -> HostResult<Vec<u32>> {
        self.blocking(move |host| {
            let json = host.send("GET", &format!("pullRequests/{pr_id}/iterations"), &[], None)?;
            Ok(parse_iteration_ids(&json))
        })
        .await
    }

    async fn get_iteration_files(&self, pr_id: u64, iteration: u32) -> HostResult<Vec<IterationFile>> {
        self.blocking(move |host| host.iteration_files_blocking(pr_id, iteration))
            .await
    }

    async fn get_file_content(
        &self,
        pr_id: u64,
        iteration: u32,
        path: &str,
        version: FileVersion,
    ) -> HostResult<Option<String>> {
        let path = path.to_string();
        self.blocking(move |host| {
            let commits = host.iteration_commits(pr_id, iteration)?;
            host.content_at(&commits, &path, version)
        })
        .await
    }

    async fn create_thread(
        &self,
        pr_id: u64,
        file_path: &str,
        line: Option<u32>,
        body: &str,
    ) -> HostResult<String> {
        let payload = thread_payload(file_path, line, body);
        self.blocking(move |host| host.post_thread(pr_id, &payload))
            .await
    }

    async fn update_thread(&self, pr_id: u64, thread_id: &str, body: &str) -> HostResult<()> {
        let path = format!("pullRequests/{pr_id}/threads/{thread_id}/comments");
        let payload = json!({
            "content": body,
            "parentCommentId": 1,
            "commentType": 1,
        });
        self.blocking(move |host| host.send("POST", &path, &[], Some(&payload)).map(|_| ()))
            .await
    }

    async fn resolve_thread(&self, pr_id: u64, thread_id: &str) -> HostResult<()> {
        let path = format!("pullRequests/{pr_id}/threads/{thread_id}");
        let payload = json!({ "status": "fixed" });
        self.blocking(move |host| host.send("PATCH", &path, &[], Some(&payload)).map(|_| ()))
            .await
    }

    async fn create_pr_comment(&self, pr_id: u64, body: &str) -> HostResult<String> {
        let payload = json!({
            "comments": [{ "parentCommentId": 0, "content": body, "commentType": 1 }],
            "status": "active",
        });
        self.blocking(move |host| host.post_thread(pr_id, &payload))
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IterationCommits {
    base: Option<String>,
    head: String,
}

fn parse_iteration_commits(json: &Value) -> HostResult<IterationCommits> {
    let head = json
        .pointer("/sourceRefCommit/commitId")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            HostError::new(
                HostFailure::Unavailable,
                "iteration response missing sourceRefCommit",
            )
        })?;
    let base = json
        .pointer("/commonRefCommit/commitId")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(IterationCommits {
        base,
        head: head.to_string(),
    })
}

/// Iteration ids from a PR iterations response, oldest first.
fn parse_iteration_ids(json: &Value) -> Vec<u32> {
    let mut ids: Vec<u32> = json
        .get("value")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|it| it.get("id").and_then(Value::as_u64))
                .filter_map(|id| u32::try_from(id).ok())
                .collect()
        })
        .unwrap_or_default();
    ids.sort_unstable();
    ids
}

/// Changed files from an iteration changes response. Folders are skipped.
/// Azure does not return diffs here, so `diff` is left empty.
fn parse_change_entries(json: &Value) -> Vec<IterationFile> {
    let entries = json
        .get("changeEntries")
        .or_else(|| json.get("changes"))
        .and_then(Value::as_array);
    let Some(entries) = entries else {
        return Vec::new();
    };
    entries
        .iter()
        .filter(|entry| {
            let item = &entry["item"];
            !item["isFolder"].as_bool().unwrap_or(false)
                && item["gitObjectType"].as_str() != Some("tree")
        })
        .filter_map(|entry| {
            let path = entry.pointer("/item/path").and_then(Value::as_str)?;
            let change = entry.get("changeType").and_then(Value::as_str).unwrap_or("edit");
            Some(IterationFile {
                path: path.to_string(),
                change_type: ChangeType::parse(change),
                diff: String::new(),
            })
        })
        .collect()
}

fn thread_payload(file_path: &str, line: Option<u32>, body: &str) -> Value {
    let file_path = if file_path.starts_with('/') {
        file_path.to_string()
    } else {
        format!("/{file_path}")
    };
    let mut context = json!({ "filePath": file_path });
    if let Some(line) = line {
        context["rightFileStart"] = json!({ "line": line, "offset": 1 });
        context["rightFileEnd"] = json!({ "line": line, "offset": 1 });
    }
    json!({
        "comments": [{ "parentCommentId": 0, "content": body, "commentType": 1 }],
        "status": "active",
        "threadContext": context,
    })
}

fn basic_auth(pat: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!(":{pat}"));
    format!("Basic {encoded}")
}

pub fn failure_for_status(code: u16) -> HostFailure {
    match code {
        401 | 403 => HostFailure::Auth,
        404 => HostFailure::NotFound,
        409 | 412 => HostFailure::Conflict,
        429 => HostFailure::RateLimited,
        408 | 504 => HostFailure::Timeout,
        _ => HostFailure::Unavailable,
    }
}

fn classify(err: ureq::Error) -> HostError {
    match err {
        ureq::Error::Status(code, response) => {
            let body = response.into_string().unwrap_or_default();
            HostError::new(failure_for_status(code), format!("HTTP {code}: {body}"))
        }
        ureq::Error::Transport(t) => {
            let message = t.to_string();
            let reason = if message.contains("timed out") {
                HostFailure::Timeout
            } else {
                HostFailure::Unavailable
            };
            HostError::new(reason, message)
        }
    }
}
