use clap::{Parser, Subcommand};

use crate::engine::IterationSelection;

/// revloop: iterative AI review and fix with pull-request thread tracking
#[derive(Parser, Debug, Clone)]
#[command(name = "revloop", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,

    /// Path to config file (default: .revloop.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Maximum analysis passes per file
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_iterations: Option<u32>,

    /// Do not create, update or resolve PR threads
    #[arg(long, global = true)]
    pub no_comments: bool,

    /// Number of files improved concurrently
    #[arg(long, global = true, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_parallel_files: Option<u64>,

    /// Directory of prompt templates overriding the built-in ones
    #[arg(long, global = true)]
    pub prompts_dir: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CliCommand {
    /// Improve a single file and print its state as JSON
    Improve {
        /// Pull request id
        #[arg(long)]
        pr: u64,

        /// Path of the file within the repository
        #[arg(long)]
        file: String,

        /// Local file holding the content to review
        #[arg(long)]
        current: String,

        /// Local file holding the pre-change content (default: empty)
        #[arg(long)]
        original: Option<String>,
    },

    /// Review the files of one or more PR iterations
    Review {
        /// Pull request id
        #[arg(long)]
        pr: u64,

        /// Comma-separated iteration ids, e.g. 1,2 (default: latest iteration)
        #[arg(long, value_delimiter = ',', conflicts_with = "all")]
        iterations: Vec<u32>,

        /// Review every iteration of the PR
        #[arg(long)]
        all: bool,

        /// Print the report as markdown instead of JSON
        #[arg(long)]
        markdown: bool,
    },
}

/// Iterations a `review` run covers: explicit ids, every iteration, or the latest.
pub fn iteration_selection(iterations: Vec<u32>, all: bool) -> IterationSelection {
    if all {
        IterationSelection::All
    } else if iterations.is_empty() {
        IterationSelection::Latest
    } else {
        IterationSelection::Only(iterations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_improve() {
        let cli = Cli::parse_from([
            "revloop", "improve", "--pr", "42", "--file", "src/app.py", "--current", "app.py",
        ]);
        match cli.command {
            CliCommand::Improve {
                pr,
                file,
                current,
                original,
            } => {
                assert_eq!(pr, 42);
                assert_eq!(file, "src/app.py");
                assert_eq!(current, "app.py");
                assert!(original.is_none());
            }
            _ => panic!("expected Improve subcommand"),
        }
        assert!(!cli.no_comments);
    }

    #[test]
    fn test_parse_review_iterations_list() {
        let cli = Cli::parse_from(["revloop", "review", "--pr", "7", "--iterations", "1,2,3"]);
        match cli.command {
            CliCommand::Review {
                pr,
                iterations,
                all,
                markdown,
            } => {
                assert_eq!(pr, 7);
                assert!(!all);
                assert!(!markdown);
                assert_eq!(
                    iteration_selection(iterations, all),
                    IterationSelection::Only(vec![1, 2, 3])
                );
            }
            _ => panic!("expected Review subcommand"),
        }
    }

    #[test]
    fn test_global_args_after_subcommand() {
        let cli = Cli::parse_from([
            "revloop",
            "review",
            "--pr",
            "7",
            "--iterations",
            "1",
            "--markdown",
            "--max-iterations",
            "5",
            "--no-comments",
            "--max-parallel-files",
            "4",
        ]);
        assert_eq!(cli.max_iterations, Some(5));
        assert!(cli.no_comments);
        assert_eq!(cli.max_parallel_files, Some(4));
        assert!(matches!(cli.command, CliCommand::Review { markdown: true, .. }));
    }

    #[test]
    fn test_zero_max_iterations_rejected() {
        let result = Cli::try_parse_from([
            "revloop",
            "--max-iterations",
            "0",
            "review",
            "--pr",
            "1",
            "--iterations",
            "1",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["revloop"]).is_err());
    }

    #[test]
    fn test_review_defaults_to_latest_iteration() {
        let cli = Cli::parse_from(["revloop", "review", "--pr", "7"]);
        let CliCommand::Review { iterations, all, .. } = cli.command else {
            panic!("expected Review subcommand");
        };
        assert_eq!(iteration_selection(iterations, all), IterationSelection::Latest);
    }

    #[test]
    fn test_review_all_iterations() {
        let cli = Cli::parse_from(["revloop", "review", "--pr", "7", "--all"]);
        let CliCommand::Review { iterations, all, .. } = cli.command else {
            panic!("expected Review subcommand");
        };
        assert_eq!(iteration_selection(iterations, all), IterationSelection::All);
    }

    #[test]
    fn test_all_conflicts_with_iterations() {
        let result =
            Cli::try_parse_from(["revloop", "review", "--pr", "7", "--all", "--iterations", "2"]);
        assert!(result.is_err());
    }
}
