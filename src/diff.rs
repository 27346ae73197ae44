use serde::Serialize;
use similar::{ChangeTag, TextDiff};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
}

/// Unified diff of `before` against `after` with three lines of context.
/// Empty when the contents are identical.
pub fn unified(path: &str, before: &str, after: &str) -> String {
    if before == after {
        return String::new();
    }
    let diff = TextDiff::from_lines(before, after);
    let mut output = String::new();
    if before.is_empty() {
        output.push_str("--- /dev/null\n");
    } else {
        output.push_str(&format!("--- a/{path}\n"));
    }
    output.push_str(&format!("+++ b/{path}\n"));
    for hunk in diff.unified_diff().context_radius(3).iter_hunks() {
        output.push_str(&hunk.to_string());
    }
    output
}

pub fn stats(before: &str, after: &str) -> DiffStats {
    let diff = TextDiff::from_lines(before, after);
    let mut stats = DiffStats::default();
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => stats.added += 1,
            ChangeTag::Delete => stats.removed += 1,
            ChangeTag::Equal => {}
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_contents_have_no_diff() {
        assert_eq!(unified("a.py", "x = 1\n", "x = 1\n"), "");
        assert_eq!(stats("x = 1\n", "x = 1\n"), DiffStats::default());
    }

    #[test]
    fn test_unified_diff_headers_and_hunk() {
        let diff = unified("a.py", "x = 1\ny = 2\n", "x = 1\ny = 3\n");
        assert!(diff.starts_with("--- a/a.py\n+++ b/a.py\n"));
        assert!(diff.contains("@@"));
        assert!(diff.contains("-y = 2"));
        assert!(diff.contains("+y = 3"));
    }

    #[test]
    fn test_new_file_diff() {
        let diff = unified("new.py", "", "print('hi')\n");
        assert!(diff.starts_with("--- /dev/null\n+++ b/new.py\n"));
        assert!(diff.contains("+print('hi')"));
    }

    #[test]
    fn test_stats_counts_lines() {
        let s = stats("a\nb\nc\n", "a\nB\nc\nd\n");
        assert_eq!(s, DiffStats { added: 2, removed: 1 });
    }
}
