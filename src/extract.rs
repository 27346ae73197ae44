use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::issue::{Issue, Severity, canonicalize_description};

static LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*)(?:[-*+•]|\d{1,3}[.)])\s+(.+)$").expect("valid list item regex")
});

static HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s{0,3}#{1,6}\s+(.+?)\s*#*$").expect("valid heading regex")
});

static BOLD_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\*\*|__)([^*_]+?)(?:\*\*|__)\s*:?\s*$").expect("valid bold heading regex")
});

static LINE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?i:lines?)[\s:#]*(\d+)|\bL(\d+)\b|[\w./-]+\.\w+:(\d+)\b")
        .expect("valid line reference regex")
});

static LEADING_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[(\[]?(?i:(?:around|near|at|on|in)\s+)?(?:(?i:lines?)[\s:#]*\d+(?:\s*(?:-|–|to|and|,)\s*\d+)*|L\d+(?:\s*-\s*L?\d+)?|[\w./-]+\.\w+:\d+(?:-\d+)?)\s*[)\]:.,\-–]*\s*",
    )
    .expect("valid leading reference regex")
});

static NO_ISSUES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:no\s+(?:\w+\s+)?(?:issues?|suggestions?|problems?|concerns?)|lgtm|looks\s+good|nothing\s+to\s+(?:fix|change|report|improve))\b",
    )
    .expect("valid no-issues regex")
});

static NO_ISSUE_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:none|n/?a|nothing(?:\s+to\s+\w+)?|no\s+(?:\w+\s+)?(?:issues?|suggestions?|problems?|concerns?)(?:\s+(?:found|identified|detected))?|lgtm|looks\s+good)\b",
    )
    .expect("valid no-issue item regex")
});

static NON_ISSUE_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:summary|overview|strengths?|positives?|praise|conclusion|verdict|overall)\b",
    )
    .expect("valid section regex")
});

static ISSUE_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:issues?|problems?|concerns?|suggestions?|bugs?|improvements?|fix(?:es)?|recommendations?)\b",
    )
    .expect("valid issue words regex")
});

/// Outcome of reading a review. `Parsed` with no issues means the reviewer
/// found nothing; `Unparseable` means the text could not be read at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Extraction {
    Parsed { issues: Vec<Issue> },
    Unparseable { raw: String },
}

impl Extraction {
    pub fn issues(&self) -> &[Issue] {
        match self {
            Extraction::Parsed { issues } => issues,
            Extraction::Unparseable { .. } => &[],
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, Extraction::Parsed { .. })
    }
}

/// Turns free-form review text into structured issues. Implementations must
/// not fail; anything unreadable comes back as `Extraction::Unparseable`.
pub trait IssueExtractor: Send + Sync {
    fn extract(&self, review_text: &str, file_path: &str) -> Extraction;
}

/// Heuristic reader for markdown-ish reviewer output: bullets, numbered
/// lists, headings and bare "line N:" paragraphs.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownExtractor;

struct PendingItem {
    indent: usize,
    head: String,
    details: Vec<String>,
    section: Option<String>,
}

impl PendingItem {
    fn new(indent: usize, head: &str, section: Option<String>) -> Self {
        Self {
            indent,
            head: strip_emphasis(head.trim()),
            details: Vec::new(),
            section,
        }
    }
}

impl IssueExtractor for MarkdownExtractor {
    fn extract(&self, review_text: &str, file_path: &str) -> Extraction {
        if review_text.trim().is_empty() {
            return Extraction::Unparseable {
                raw: review_text.to_string(),
            };
        }

        let mut issues = Vec::new();
        let mut section: Option<String> = None;
        let mut skip_section = false;
        let mut pending: Option<PendingItem> = None;
        let mut saw_items = false;
        let mut in_code = false;
        let mut prev_blank = false;

        for raw in review_text.lines() {
            let line = raw.trim_end();
            if line.trim_start().starts_with("```") {
                in_code = !in_code;
                continue;
            }
            if in_code {
                continue;
            }
            if line.trim().is_empty() {
                prev_blank = true;
                continue;
            }
            let indent = line.len() - line.trim_start().len();

            if let Some(title) = heading(line) {
                flush(&mut pending, &mut issues, file_path);
                if !skip_section && LINE_REF.is_match(&title) {
                    saw_items = true;
                    pending = Some(PendingItem::new(0, &title, section.clone()));
                } else {
                    skip_section =
                        NON_ISSUE_SECTION.is_match(&title) && !ISSUE_WORDS.is_match(&title);
                    section = Some(title);
                }
                prev_blank = false;
                continue;
            }

            if let Some(caps) = LIST_ITEM.captures(line) {
                let body = caps.get(2).map_or("", |m| m.as_str());
                let nested = pending.as_ref().is_some_and(|item| indent > item.indent);
                if nested {
                    if let Some(item) = pending.as_mut() {
                        item.details.push(strip_emphasis(body.trim()));
                    }
                } else {
                    flush(&mut pending, &mut issues, file_path);
                    saw_items = true;
                    if !skip_section {
                        pending = Some(PendingItem::new(indent, body, section.clone()));
                    }
                }
                prev_blank = false;
                continue;
            }

            let text = line.trim();
            if indent == 0 && LEADING_REF.is_match(text) {
                flush(&mut pending, &mut issues, file_path);
                if !skip_section {
                    saw_items = true;
                    pending = Some(PendingItem::new(0, text, section.clone()));
                }
            } else if indent > 0 || !prev_blank {
                if let Some(item) = pending.as_mut() {
                    item.details.push(strip_emphasis(text));
                }
            } else {
                flush(&mut pending, &mut issues, file_path);
            }
            prev_blank = false;
        }
        flush(&mut pending, &mut issues, file_path);

        if !issues.is_empty() || saw_items || NO_ISSUES.is_match(review_text) {
            Extraction::Parsed { issues }
        } else {
            Extraction::Unparseable {
                raw: review_text.to_string(),
            }
        }
    }
}

fn heading(line: &str) -> Option<String> {
    HEADING
        .captures(line)
        .or_else(|| BOLD_HEADING.captures(line))
        .and_then(|caps| caps.get(1))
        .map(|m| strip_emphasis(m.as_str().trim()))
        .filter(|title| !title.is_empty())
}

fn strip_emphasis(text: &str) -> String {
    text.replace("**", "").replace("__", "")
}

/// First line number referenced in `text`, ignoring zero.
pub fn find_line(text: &str) -> Option<u32> {
    LINE_REF.captures_iter(text).find_map(|caps| {
        caps.iter()
            .skip(1)
            .flatten()
            .next()
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .filter(|&n| n > 0)
    })
}

fn strip_leading_ref(text: &str) -> &str {
    match LEADING_REF.find(text) {
        Some(m) => text[m.end()..].trim(),
        None => text.trim(),
    }
}

fn flush(pending: &mut Option<PendingItem>, issues: &mut Vec<Issue>, file_path: &str) {
    if let Some(item) = pending.take()
        && let Some(issue) = build_issue(item, file_path)
    {
        issues.push(issue);
    }
}

fn build_issue(item: PendingItem, file_path: &str) -> Option<Issue> {
    let line = find_line(&item.head).or_else(|| item.details.iter().find_map(|d| find_line(d)));

    let mut details = item.details.into_iter();
    let head = strip_leading_ref(&item.head).to_string();
    let description = if canonicalize_description(&head).is_empty() {
        details.next().map(|d| strip_leading_ref(&d).to_string())?
    } else {
        head
    };
    if canonicalize_description(&description).is_empty() || NO_ISSUE_ITEM.is_match(&description)
    {
        return None;
    }

    let details: Vec<String> = details.collect();
    let full_text = format!("{description} {}", details.join(" "));
    let mut issue = Issue::new(file_path, line, description).with_severity(Severity::infer(&full_text));
    if !details.is_empty() {
        issue = issue.with_details(details.join("\n"));
    }
    if let Some(section) = item.section {
        issue = issue.with_section(section);
    }
    Some(issue)
}
