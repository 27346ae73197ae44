//! Single calls into the generation service: analysis, fix and the final
//! narrative summary. Each call is bounded by the caller's timeout and never
//! retried here.

use std::time::Duration;

use tracing::debug;

use crate::diff;
use crate::error::{GenerationError, GenerationFailure, Result};
use crate::generation::{GenerationRole, GenerationService};
use crate::issue::Issue;
use crate::prompts::{
    AnalyzeVars, FixVars, PromptEngine, PromptKind, SummarizeVars, render_issues,
    review_checklist,
};

pub struct AnalysisRequest<'a> {
    pub file_path: &'a str,
    pub original_content: &'a str,
    pub current_content: &'a str,
    pub iteration: u32,
    pub prior_issues: &'a [Issue],
}

pub struct FixRequest<'a> {
    pub file_path: &'a str,
    pub current_content: &'a str,
    pub issues: &'a [Issue],
    pub reviewer_analysis: &'a str,
}

pub struct SummaryRequest<'a> {
    pub pr_id: u64,
    pub file_count: usize,
    pub pass_count: usize,
    pub analyses: &'a str,
}

/// Runs one generation call, failing with `Timeout` once `timeout` elapses.
pub async fn call_with_timeout<G: GenerationService>(
    generation: &G,
    prompt: &str,
    role: GenerationRole,
    timeout: Option<Duration>,
) -> std::result::Result<String, GenerationError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, generation.generate(prompt, role))
            .await
            .unwrap_or_else(|_| {
                Err(GenerationError::new(
                    GenerationFailure::Timeout,
                    format!("{role} call exceeded {limit:?}"),
                ))
            }),
        None => generation.generate(prompt, role).await,
    }
}

/// Asks the reviewer for free-text analysis of the file's current state.
pub async fn analyze<G: GenerationService>(
    generation: &G,
    prompts: &PromptEngine,
    request: &AnalysisRequest<'_>,
    timeout: Option<Duration>,
) -> Result<String> {
    let diff = diff::unified(
        request.file_path,
        request.original_content,
        request.current_content,
    );
    let prompt = prompts.render(
        PromptKind::Analyze,
        AnalyzeVars {
            file_path: request.file_path,
            iteration: request.iteration,
            diff: if diff.is_empty() { "(no changes)" } else { &diff },
            current_content: request.current_content,
            prior_issues: render_issues(request.prior_issues),
            checklist: review_checklist(request.file_path),
        },
    )?;
    debug!(file = request.file_path, iteration = request.iteration, prompt_len = prompt.len(), "analysis step");
    Ok(call_with_timeout(generation, &prompt, GenerationRole::Analyze, timeout).await?)
}

/// Asks the coder for a revised file. Output fences are stripped; an empty
/// result is treated as malformed.
pub async fn fix<G: GenerationService>(
    generation: &G,
    prompts: &PromptEngine,
    request: &FixRequest<'_>,
    timeout: Option<Duration>,
) -> Result<String> {
    let prompt = prompts.render(
        PromptKind::Fix,
        FixVars {
            file_path: request.file_path,
            current_content: request.current_content,
            issues: render_issues(request.issues),
            reviewer_analysis: request.reviewer_analysis,
        },
    )?;
    debug!(file = request.file_path, issues = request.issues.len(), "fix step");
    let raw = call_with_timeout(generation, &prompt, GenerationRole::Fix, timeout).await?;
    let content = strip_markdown_fences(&raw);
    if content.trim().is_empty() {
        return Err(GenerationError::new(
            GenerationFailure::Malformed,
            format!("fix for {} returned no content", request.file_path),
        )
        .into());
    }
    Ok(content)
}

/// Final narrative over all reviewer analyses; analysis role, no fix follows.
pub async fn summarize<G: GenerationService>(
    generation: &G,
    prompts: &PromptEngine,
    request: &SummaryRequest<'_>,
    timeout: Option<Duration>,
) -> Result<String> {
    let prompt = prompts.render(
        PromptKind::Summarize,
        SummarizeVars {
            pr_id: request.pr_id,
            file_count: request.file_count,
            pass_count: request.pass_count,
            analyses: request.analyses,
        },
    )?;
    let text = call_with_timeout(generation, &prompt, GenerationRole::Analyze, timeout).await?;
    Ok(text.trim().to_string())
}

/// Removes a surrounding ```lang ... ``` block if the whole reply is fenced.
/// Keeps a trailing newline when the fenced body had one.
pub fn strip_markdown_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") || !trimmed.ends_with("```") || trimmed.len() < 6 {
        return text.to_string();
    }
    let without_close = &trimmed[..trimmed.len() - 3];
    match without_close.find('\n') {
        Some(first_newline) => without_close[first_newline + 1..].to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct EchoGeneration {
        reply: String,
        delay: Option<Duration>,
        prompts: Mutex<Vec<(GenerationRole, String)>>,
    }

    impl EchoGeneration {
        fn new(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                delay: None,
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    impl GenerationService for EchoGeneration {
        async fn generate(
            &self,
            prompt: &str,
            role: GenerationRole,
        ) -> std::result::Result<String, GenerationError> {
            self.prompts.lock().unwrap().push((role, prompt.to_string()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.reply.clone())
        }
    }

    #[test]
    fn test_strip_fences_with_language() {
        assert_eq!(
            strip_markdown_fences("```python\nx = 1\n```"),
            "x = 1\n"
        );
    }

    #[test]
    fn test_strip_fences_leaves_plain_text() {
        assert_eq!(strip_markdown_fences("x = 1\n"), "x = 1\n");
        assert_eq!(strip_markdown_fences("```"), "```");
    }

    #[tokio::test]
    async fn test_analyze_renders_diff_and_uses_analyze_role() {
        let generation = EchoGeneration::new("No issues found.");
        let prompts = PromptEngine::new(None);
        let request = AnalysisRequest {
            file_path: "foo.py",
            original_content: "a = 1\n",
            current_content: "a = 2\n",
            iteration: 1,
            prior_issues: &[],
        };
        let text = analyze(&generation, &prompts, &request, None).await.unwrap();
        assert_eq!(text, "No issues found.");
        let calls = generation.prompts.lock().unwrap();
        assert_eq!(calls[0].0, GenerationRole::Analyze);
        assert!(calls[0].1.contains("+a = 2"));
    }

    #[tokio::test]
    async fn test_fix_strips_fences() {
        let generation = EchoGeneration::new("```\nfixed()\n```");
        let prompts = PromptEngine::new(None);
        let issues = vec![Issue::new("foo.py", Some(1), "broken call")];
        let request = FixRequest {
            file_path: "foo.py",
            current_content: "broken()\n",
            issues: &issues,
            reviewer_analysis: "- line 1: broken call",
        };
        let content = fix(&generation, &prompts, &request, None).await.unwrap();
        assert_eq!(content, "fixed()\n");
        assert_eq!(generation.prompts.lock().unwrap()[0].0, GenerationRole::Fix);
    }

    #[tokio::test]
    async fn test_fix_empty_output_is_malformed() {
        let generation = EchoGeneration::new("```python\n```");
        let prompts = PromptEngine::new(None);
        let request = FixRequest {
            file_path: "foo.py",
            current_content: "x\n",
            issues: &[],
            reviewer_analysis: "",
        };
        let err = fix(&generation, &prompts, &request, None).await.unwrap_err();
        match err {
            crate::error::Error::Generation(e) => assert_eq!(e.reason, GenerationFailure::Malformed),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_failure() {
        let mut generation = EchoGeneration::new("late");
        generation.delay = Some(Duration::from_millis(500));
        let err = call_with_timeout(
            &generation,
            "prompt",
            GenerationRole::Analyze,
            Some(Duration::from_millis(20)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.reason, GenerationFailure::Timeout);
    }
}
