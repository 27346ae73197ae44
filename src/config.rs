use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cli::Cli;
use crate::error::{Error, Result};
use crate::generation::Provider;

pub const DEFAULT_CONFIG_PATH: &str = ".revloop.toml";

const DEFAULT_SKIP_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "svg", "ico", "pdf", "zip", "tar", "gz",
];
const DEFAULT_SKIP_PATTERNS: &[&str] = &["test_", "tests/", "/test/"];

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub max_iterations: Option<u32>,
    pub post_comments: Option<bool>,
    pub max_parallel_files: Option<usize>,
    /// Seconds per generation call.
    pub generation_timeout: Option<u64>,
    /// Seconds per PR host call.
    pub host_timeout: Option<u64>,
    pub rate_limit_retries: Option<u32>,
    pub prompts_dir: Option<String>,
    pub state_dir: Option<String>,
    pub skip_extensions: Option<Vec<String>>,
    pub skip_patterns: Option<Vec<String>>,
    pub generation: Option<GenerationFile>,
    pub azure: Option<AzureFile>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GenerationFile {
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub fix_model: Option<String>,
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AzureFile {
    pub organization: Option<String>,
    pub project: Option<String>,
    pub repository: Option<String>,
    pub pat_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationConfig {
    pub provider: Provider,
    pub base_url: String,
    pub model: String,
    /// Model for the fix role; the analysis model when unset.
    pub fix_model: Option<String>,
    pub api_key_env: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let provider = Provider::OpenAi;
        Self {
            provider,
            base_url: provider.default_base_url().to_string(),
            model: provider.default_model().to_string(),
            fix_model: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureConfig {
    pub organization: String,
    pub project: String,
    pub repository: String,
    pub pat_env: String,
}

/// Files that are never reviewed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipRules {
    pub extensions: Vec<String>,
    pub patterns: Vec<String>,
}

impl Default for SkipRules {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_SKIP_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            patterns: DEFAULT_SKIP_PATTERNS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SkipRules {
    /// The reason `path` is skipped, if it is.
    pub fn should_skip(&self, path: &str) -> Option<String> {
        let extension = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        if let Some(ext) = extension
            && self.extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
        {
            return Some(format!("extension {ext}"));
        }
        self.patterns
            .iter()
            .find(|p| path.contains(p.as_str()))
            .map(|p| format!("matches pattern {p}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub max_iterations: u32,
    pub post_comments: bool,
    pub max_parallel_files: usize,
    pub generation_timeout: Duration,
    pub host_timeout: Duration,
    pub rate_limit_retries: u32,
    pub prompts_dir: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub skip: SkipRules,
    pub generation: GenerationConfig,
    pub azure: Option<AzureConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            post_comments: true,
            max_parallel_files: 1,
            generation_timeout: Duration::from_secs(300),
            host_timeout: Duration::from_secs(30),
            rate_limit_retries: 2,
            prompts_dir: None,
            state_dir: PathBuf::from(".revloop/threads"),
            skip: SkipRules::default(),
            generation: GenerationConfig::default(),
            azure: None,
        }
    }
}

impl Config {
    /// Loads the config file and applies CLI overrides. A missing default
    /// file means defaults; a missing `--config` path is an error.
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = Path::new(cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH));
        let file_config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            parse_config(&content)?
        } else if cli.config.is_some() {
            return Err(Error::ConfigNotFound(config_path.to_path_buf()));
        } else {
            ConfigFile::default()
        };

        Ok(merge(file_config, cli))
    }
}

pub fn parse_config(content: &str) -> Result<ConfigFile> {
    let config: ConfigFile = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ConfigFile) -> Result<()> {
    if config.max_iterations == Some(0) {
        return Err(Error::ConfigValidation(
            "max_iterations must be >= 1".to_string(),
        ));
    }
    if config.max_parallel_files == Some(0) {
        return Err(Error::ConfigValidation(
            "max_parallel_files must be >= 1".to_string(),
        ));
    }
    if config.generation_timeout == Some(0) {
        return Err(Error::ConfigValidation(
            "generation_timeout must be > 0".to_string(),
        ));
    }
    if config.host_timeout == Some(0) {
        return Err(Error::ConfigValidation(
            "host_timeout must be > 0".to_string(),
        ));
    }
    if let Some(ref generation) = config.generation
        && let Some(ref provider) = generation.provider
    {
        provider.parse::<Provider>().map_err(Error::ConfigValidation)?;
    }
    if let Some(ref azure) = config.azure {
        for (key, value) in [
            ("organization", &azure.organization),
            ("project", &azure.project),
            ("repository", &azure.repository),
        ] {
            if value.as_deref().is_none_or(str::is_empty) {
                return Err(Error::ConfigValidation(format!(
                    "azure.{key} is required"
                )));
            }
        }
    }
    Ok(())
}

fn merge_generation(file: Option<GenerationFile>) -> GenerationConfig {
    let file = file.unwrap_or_default();
    let provider = file
        .provider
        .as_deref()
        .and_then(|p| p.parse().ok())
        .unwrap_or(Provider::OpenAi);
    GenerationConfig {
        provider,
        base_url: file
            .base_url
            .unwrap_or_else(|| provider.default_base_url().to_string()),
        model: file
            .model
            .unwrap_or_else(|| provider.default_model().to_string()),
        fix_model: file.fix_model,
        api_key_env: file
            .api_key_env
            .unwrap_or_else(|| "OPENAI_API_KEY".to_string()),
    }
}

fn merge_azure(file: Option<AzureFile>) -> Option<AzureConfig> {
    let file = file?;
    Some(AzureConfig {
        organization: file.organization?,
        project: file.project?,
        repository: file.repository?,
        pat_env: file
            .pat_env
            .unwrap_or_else(|| "AZURE_DEVOPS_PAT".to_string()),
    })
}

pub fn merge(file: ConfigFile, cli: &Cli) -> Config {
    let defaults = Config::default();
    Config {
        max_iterations: cli
            .max_iterations
            .or(file.max_iterations)
            .unwrap_or(defaults.max_iterations),
        post_comments: !cli.no_comments && file.post_comments.unwrap_or(defaults.post_comments),
        max_parallel_files: cli
            .max_parallel_files
            .and_then(|n| usize::try_from(n).ok())
            .or(file.max_parallel_files)
            .unwrap_or(defaults.max_parallel_files),
        generation_timeout: file
            .generation_timeout
            .map(Duration::from_secs)
            .unwrap_or(defaults.generation_timeout),
        host_timeout: file
            .host_timeout
            .map(Duration::from_secs)
            .unwrap_or(defaults.host_timeout),
        rate_limit_retries: file
            .rate_limit_retries
            .unwrap_or(defaults.rate_limit_retries),
        prompts_dir: cli
            .prompts_dir
            .clone()
            .or(file.prompts_dir)
            .map(PathBuf::from),
        state_dir: file.state_dir.map(PathBuf::from).unwrap_or(defaults.state_dir),
        skip: SkipRules {
            extensions: file.skip_extensions.unwrap_or(defaults.skip.extensions),
            patterns: file.skip_patterns.unwrap_or(defaults.skip.patterns),
        },
        generation: merge_generation(file.generation),
        azure: merge_azure(file.azure),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    #[test]
    fn test_parse_valid_config() {
        let toml = r#"
max_iterations = 5
post_comments = false
max_parallel_files = 4
generation_timeout = 120
skip_patterns = ["vendor/"]

[generation]
provider = "ollama"
model = "codellama"

[azure]
organization = "contoso"
project = "web"
repository = "api"
"#;
        let config = parse_config(toml).unwrap();
        assert_eq!(config.max_iterations, Some(5));
        assert_eq!(config.post_comments, Some(false));
        assert_eq!(
            config.generation.as_ref().and_then(|g| g.provider.as_deref()),
            Some("ollama")
        );
        assert_eq!(
            config.azure.as_ref().and_then(|a| a.project.as_deref()),
            Some("web")
        );
    }

    #[test]
    fn test_parse_empty_config() {
        let config = parse_config("").unwrap();
        assert_eq!(config, ConfigFile::default());
    }

    #[test]
    fn test_parse_invalid_provider() {
        let toml = "[generation]\nprovider = \"bard\"";
        let err = parse_config(toml).unwrap_err();
        assert!(err.to_string().contains("unknown provider"));
    }

    #[test]
    fn test_parse_zero_max_iterations() {
        let err = parse_config("max_iterations = 0").unwrap_err();
        assert!(err.to_string().contains("max_iterations must be >= 1"));
    }

    #[test]
    fn test_parse_zero_timeouts() {
        let err = parse_config("generation_timeout = 0").unwrap_err();
        assert!(err.to_string().contains("generation_timeout must be > 0"));
        let err = parse_config("host_timeout = 0").unwrap_err();
        assert!(err.to_string().contains("host_timeout must be > 0"));
    }

    #[test]
    fn test_parse_azure_requires_repository() {
        let toml = "[azure]\norganization = \"contoso\"\nproject = \"web\"";
        let err = parse_config(toml).unwrap_err();
        assert!(err.to_string().contains("azure.repository is required"));
    }

    #[test]
    fn test_parse_unknown_field() {
        let err = parse_config(r#"bogus = "value""#).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
        let err = parse_config("[azure]\ntoken = \"x\"").unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn test_cli_overrides_config() {
        let file = ConfigFile {
            max_iterations: Some(2),
            max_parallel_files: Some(3),
            post_comments: Some(true),
            prompts_dir: Some("file-prompts".to_string()),
            ..Default::default()
        };
        let cli = Cli::parse_from([
            "revloop",
            "--max-iterations",
            "7",
            "--no-comments",
            "--prompts-dir",
            "cli-prompts",
            "review",
            "--pr",
            "1",
            "--iterations",
            "1",
        ]);
        let config = merge(file, &cli);
        assert_eq!(config.max_iterations, 7); // CLI wins
        assert!(!config.post_comments); // CLI wins
        assert_eq!(config.prompts_dir, Some(PathBuf::from("cli-prompts")));
        assert_eq!(config.max_parallel_files, 3); // file value kept
    }

    #[test]
    fn test_defaults_applied() {
        let cli = Cli::parse_from(["revloop", "review", "--pr", "1", "--iterations", "1"]);
        let config = merge(ConfigFile::default(), &cli);
        assert_eq!(config, Config::default());
        assert_eq!(config.generation.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.generation.base_url, "https://api.openai.com");
        assert!(config.azure.is_none());
    }

    #[test]
    fn test_generation_defaults_follow_provider() {
        let file = ConfigFile {
            generation: Some(GenerationFile {
                provider: Some("ollama".to_string()),
                ..Default::default()
            }),
            azure: Some(AzureFile {
                organization: Some("contoso".to_string()),
                project: Some("web".to_string()),
                repository: Some("api".to_string()),
                pat_env: None,
            }),
            ..Default::default()
        };
        let cli = Cli::parse_from(["revloop", "review", "--pr", "1", "--iterations", "1"]);
        let config = merge(file, &cli);
        assert_eq!(config.generation.provider, Provider::Ollama);
        assert_eq!(config.generation.base_url, "http://localhost:11434");
        assert_eq!(config.azure.unwrap().pat_env, "AZURE_DEVOPS_PAT");
    }

    #[test]
    fn test_load_missing_explicit_path() {
        let cli = Cli::parse_from([
            "revloop",
            "--config",
            "/nonexistent/revloop.toml",
            "review",
            "--pr",
            "1",
            "--iterations",
            "1",
        ]);
        let err = Config::load(&cli).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "max_iterations = 4\nstate_dir = \"/tmp/threads\"\n").unwrap();
        let cli = Cli::parse_from([
            "revloop",
            "--config",
            path.to_str().unwrap(),
            "review",
            "--pr",
            "1",
            "--iterations",
            "1",
        ]);
        let config = Config::load(&cli).unwrap();
        assert_eq!(config.max_iterations, 4);
        assert_eq!(config.state_dir, PathBuf::from("/tmp/threads"));
    }

    #[test]
    fn test_skip_rules() {
        let rules = SkipRules::default();
        assert_eq!(rules.should_skip("assets/Logo.PNG"), Some("extension png".to_string()));
        assert_eq!(
            rules.should_skip("src/tests/helpers.py"),
            Some("matches pattern tests/".to_string())
        );
        assert_eq!(
            rules.should_skip("src/test_parser.py"),
            Some("matches pattern test_".to_string())
        );
        assert_eq!(rules.should_skip("src/parser.py"), None);
    }
}
