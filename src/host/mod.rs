pub mod azure;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HostError, HostFailure};

pub type HostResult<T> = std::result::Result<T, HostError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Add,
    Edit,
    Delete,
    Rename,
}

impl ChangeType {
    /// Parses host change types such as `"edit"` or `"edit, rename"`.
    pub fn parse(raw: &str) -> Self {
        let lower = raw.to_ascii_lowercase();
        if lower.contains("delete") {
            ChangeType::Delete
        } else if lower.contains("add") {
            ChangeType::Add
        } else if lower.contains("rename") {
            ChangeType::Rename
        } else {
            ChangeType::Edit
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeType::Add => "add",
            ChangeType::Edit => "edit",
            ChangeType::Delete => "delete",
            ChangeType::Rename => "rename",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationFile {
    pub path: String,
    pub change_type: ChangeType,
    /// Unified diff when the host supplies one, else empty. Reviews diff
    /// the fetched contents themselves.
    #[serde(default)]
    pub diff: String,
}

/// Which side of a PR iteration to read a file from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileVersion {
    /// The merge base the PR is compared against.
    Before,
    /// The head of the given iteration.
    After,
}

/// Pull-request host: file listings, file contents and comment threads.
pub trait PrHost: Send + Sync {
    /// Iteration ids of the PR, oldest first.
    fn list_iterations(&self, pr_id: u64) -> impl Future<Output = HostResult<Vec<u32>>> + Send;

    fn get_iteration_files(
        &self,
        pr_id: u64,
        iteration: u32,
    ) -> impl Future<Output = HostResult<Vec<IterationFile>>> + Send;

    /// `Ok(None)` when the file does not exist on that side.
    fn get_file_content(
        &self,
        pr_id: u64,
        iteration: u32,
        path: &str,
        version: FileVersion,
    ) -> impl Future<Output = HostResult<Option<String>>> + Send;

    /// Opens a thread and returns its host id.
    fn create_thread(
        &self,
        pr_id: u64,
        file_path: &str,
        line: Option<u32>,
        body: &str,
    ) -> impl Future<Output = HostResult<String>> + Send;

    /// Appends a comment to an existing thread.
    fn update_thread(
        &self,
        pr_id: u64,
        thread_id: &str,
        body: &str,
    ) -> impl Future<Output = HostResult<()>> + Send;

    fn resolve_thread(
        &self,
        pr_id: u64,
        thread_id: &str,
    ) -> impl Future<Output = HostResult<()>> + Send;

    /// Posts a PR-level comment not attached to any file; returns its thread id.
    fn create_pr_comment(
        &self,
        pr_id: u64,
        body: &str,
    ) -> impl Future<Output = HostResult<String>> + Send;
}

/// Host used when none is configured. Every call fails with `not_found`,
/// so it only suits runs that neither list files nor post comments.
pub struct NoHost;

fn unconfigured<T>() -> HostResult<T> {
    Err(HostError::new(
        HostFailure::NotFound,
        "no pull request host configured",
    ))
}

impl PrHost for NoHost {
    async fn list_iterations(&self, _pr_id: u64) -> HostResult<Vec<u32>> {
        unconfigured()
    }

    async fn get_iteration_files(&self, _pr_id: u64, _iteration: u32) -> HostResult<Vec<IterationFile>> {
        unconfigured()
    }

    async fn get_file_content(
        &self,
        _pr_id: u64,
        _iteration: u32,
        _path: &str,
        _version: FileVersion,
    ) -> HostResult<Option<String>> {
        unconfigured()
    }

    async fn create_thread(
        &self,
        _pr_id: u64,
        _file_path: &str,
        _line: Option<u32>,
        _body: &str,
    ) -> HostResult<String> {
        unconfigured()
    }

    async fn update_thread(&self, _pr_id: u64, _thread_id: &str, _body: &str) -> HostResult<()> {
        unconfigured()
    }

    async fn resolve_thread(&self, _pr_id: u64, _thread_id: &str) -> HostResult<()> {
        unconfigured()
    }

    async fn create_pr_comment(&self, _pr_id: u64, _body: &str) -> HostResult<String> {
        unconfigured()
    }
}

/// Bounds a host call; expiry becomes a `timeout` host error.
pub async fn with_timeout<T>(
    timeout: Option<Duration>,
    call: impl Future<Output = HostResult<T>>,
) -> HostResult<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
            Err(HostError::new(
                HostFailure::Timeout,
                format!("host call exceeded {limit:?}"),
            ))
        }),
        None => call.await,
    }
}
