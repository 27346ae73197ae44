use crate::issue::{Issue, Severity};

/// Hidden marker so a thread can be traced back to its fingerprint.
pub fn thread_marker(fingerprint: &str) -> String {
    format!("<!-- revloop:{fingerprint} -->")
}

fn severity_badge(severity: Severity) -> &'static str {
    match severity {
        Severity::Error => "🔴 Error",
        Severity::Warning => "🟡 Warning",
        Severity::Info => "🔵 Info",
    }
}

pub fn new_thread_body(issue: &Issue, iteration: u32) -> String {
    let mut body = format!(
        "{}\n**{}**",
        thread_marker(&issue.fingerprint),
        severity_badge(issue.severity)
    );
    if let Some(ref section) = issue.section {
        body.push_str(&format!(" · {section}"));
    }
    body.push_str(&format!("\n\n{}\n", issue.description));
    if let Some(ref details) = issue.details {
        body.push_str(&format!("\n{details}\n"));
    }
    body.push_str(&format!("\n_Raised by automated review, iteration {iteration}._"));
    body
}

pub fn persisting_body(issue: &Issue, iteration: u32) -> String {
    format!(
        "Still present in iteration {iteration}: {}",
        issue.description
    )
}

pub fn fixed_body(iteration: u32) -> String {
    format!("✅ This issue has been fixed in iteration {iteration}.")
}

/// PR-level note posted for each analysis pass of a file. Carries the
/// opening lines of the review, skipping headings.
pub fn file_review_body(file_path: &str, iteration: u32, review: &str, issue_count: usize) -> String {
    let mut body = format!(
        "## Code Review - Iteration {iteration}\n\nAI review for file: `{file_path}`\n\n### Summary\n\n"
    );
    let opening: Vec<&str> = review
        .lines()
        .take(10)
        .filter(|line| !line.starts_with('#') && !line.trim().is_empty())
        .collect();
    if !opening.is_empty() {
        body.push_str(&opening.join("\n"));
        body.push_str("\n\n");
    }
    let noun = if issue_count == 1 { "issue" } else { "issues" };
    body.push_str(&format!(
        "**Found {issue_count} {noun} to address in this file.**"
    ));
    body
}

/// PR-level comment carrying the cross-iteration narrative.
pub fn review_summary_body(narrative: &str) -> String {
    format!("# AI Code Review Summary\n\n{}", narrative.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_thread_body() {
        let issue = Issue::new("foo.py", Some(10), "Security: token logged in plain text")
            .with_section("Security")
            .with_details("Mask it before logging.");
        let body = new_thread_body(&issue, 2);
        assert!(body.starts_with(&format!("<!-- revloop:{} -->", issue.fingerprint)));
        assert!(body.contains("**🔴 Error** · Security"));
        assert!(body.contains("token logged in plain text"));
        assert!(body.contains("Mask it before logging."));
        assert!(body.ends_with("_Raised by automated review, iteration 2._"));
    }

    #[test]
    fn test_followup_bodies() {
        let issue = Issue::new("foo.py", None, "no tests for parser");
        assert_eq!(
            persisting_body(&issue, 3),
            "Still present in iteration 3: no tests for parser"
        );
        assert_eq!(
            fixed_body(2),
            "✅ This issue has been fixed in iteration 2."
        );
    }

    #[test]
    fn test_file_review_body() {
        let review = "## Issues\n\n- line 10: missing null check\n- line 20: unused import";
        let body = file_review_body("/src/app.py", 2, review, 2);
        assert!(body.starts_with("## Code Review - Iteration 2\n"));
        assert!(body.contains("AI review for file: `/src/app.py`"));
        assert!(body.contains("- line 10: missing null check\n- line 20: unused import"));
        assert!(!body.contains("## Issues"));
        assert!(body.ends_with("**Found 2 issues to address in this file.**"));
        assert!(file_review_body("a.py", 1, "LGTM", 0).ends_with("**Found 0 issues to address in this file.**"));
        assert!(file_review_body("a.py", 1, "", 1).ends_with("**Found 1 issue to address in this file.**"));
    }

    #[test]
    fn test_review_summary_body() {
        assert_eq!(
            review_summary_body("Two files improved.\n"),
            "# AI Code Review Summary\n\nTwo files improved."
        );
    }
}
