use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::issue::Issue;

const DEFAULT_ANALYZE: &str = include_str!("default_prompts/analyze-file.md");
const DEFAULT_FIX: &str = include_str!("default_prompts/fix-file.md");
const DEFAULT_SUMMARIZE: &str = include_str!("default_prompts/summarize-iterations.md");

const CHECKLIST_GENERAL: &str = include_str!("default_prompts/checklist-general.md");
const CHECKLIST_PYTHON: &str = include_str!("default_prompts/checklist-python.md");
const CHECKLIST_JAVA: &str = include_str!("default_prompts/checklist-java.md");
const CHECKLIST_RUST: &str = include_str!("default_prompts/checklist-rust.md");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Analyze,
    Fix,
    Summarize,
}

impl PromptKind {
    pub fn template_name(self) -> &'static str {
        match self {
            PromptKind::Analyze => "analyze-file",
            PromptKind::Fix => "fix-file",
            PromptKind::Summarize => "summarize-iterations",
        }
    }

    fn default_template(self) -> &'static str {
        match self {
            PromptKind::Analyze => DEFAULT_ANALYZE,
            PromptKind::Fix => DEFAULT_FIX,
            PromptKind::Summarize => DEFAULT_SUMMARIZE,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AnalyzeVars<'a> {
    pub file_path: &'a str,
    pub iteration: u32,
    pub diff: &'a str,
    pub current_content: &'a str,
    pub prior_issues: String,
    pub checklist: String,
}

#[derive(Debug, Serialize)]
pub struct FixVars<'a> {
    pub file_path: &'a str,
    pub current_content: &'a str,
    pub issues: String,
    pub reviewer_analysis: &'a str,
}

#[derive(Debug, Serialize)]
pub struct SummarizeVars<'a> {
    pub pr_id: u64,
    pub file_count: usize,
    pub pass_count: usize,
    pub analyses: &'a str,
}

/// Renders prompt templates. Files named `<template>.md` in the override
/// directory replace the embedded defaults. Rendering is strict: a template
/// that references an unknown variable fails instead of producing a gap.
pub struct PromptEngine {
    override_dir: Option<PathBuf>,
    engine: upon::Engine<'static>,
}

impl PromptEngine {
    pub fn new(override_dir: Option<&Path>) -> Self {
        Self {
            override_dir: override_dir.map(Path::to_path_buf),
            engine: upon::Engine::new(),
        }
    }

    pub fn load_template(&self, kind: PromptKind) -> Result<String> {
        if let Some(ref dir) = self.override_dir {
            let path = dir.join(format!("{}.md", kind.template_name()));
            if path.exists() {
                return std::fs::read_to_string(&path).map_err(|e| {
                    Error::Prompt(format!(
                        "failed to read override template {}: {e}",
                        path.display()
                    ))
                });
            }
        }
        Ok(kind.default_template().to_string())
    }

    pub fn render(&self, kind: PromptKind, vars: impl Serialize) -> Result<String> {
        let source = self.load_template(kind)?;
        let template = self.engine.compile(source).map_err(|e| {
            Error::Prompt(format!("invalid {} template: {e}", kind.template_name()))
        })?;
        template.render(&self.engine, vars).to_string().map_err(|e| {
            Error::Prompt(format!("failed to render {}: {e}", kind.template_name()))
        })
    }
}

/// General checklist plus items for the file's language, chosen by extension.
pub fn review_checklist(file_path: &str) -> String {
    let extension = Path::new(file_path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let specific = match extension.as_deref() {
        Some("py") => Some(CHECKLIST_PYTHON),
        Some("java") => Some(CHECKLIST_JAVA),
        Some("rs") => Some(CHECKLIST_RUST),
        _ => None,
    };
    match specific {
        Some(extra) => format!("{}{}", CHECKLIST_GENERAL, extra).trim_end().to_string(),
        None => CHECKLIST_GENERAL.trim_end().to_string(),
    }
}

/// Numbered issue list for prompts; "None." when empty.
pub fn render_issues(issues: &[Issue]) -> String {
    if issues.is_empty() {
        return "None.".to_string();
    }
    let mut out = String::new();
    for (i, issue) in issues.iter().enumerate() {
        out.push_str(&format!(
            "{}. [{}] {}: {}\n",
            i + 1,
            issue.severity,
            issue.location(),
            issue.description
        ));
        if let Some(ref details) = issue.details {
            for line in details.lines() {
                out.push_str(&format!("   {line}\n"));
            }
        }
    }
    out.trim_end().to_string()
}
