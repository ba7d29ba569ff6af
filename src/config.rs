//! Configuration for threadflow.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (THREADFLOW_HOME, THREADFLOW_DATABASE, secrets)
//! 2. Config file ($THREADFLOW_CONFIG, or .threadflow/config.yaml found in
//!    the current directory or a parent)
//! 3. Defaults (~/.threadflow)
//!
//! The resolved [`AppConfig`] is an immutable value built once at startup
//! and passed to whatever needs it. Secrets never live in the config file;
//! they come from the environment via [`Credentials`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::{DocumentTemplate, NotionClient, OpenAiClient, SlackClient};
use crate::core::{Collaborators, JobRetryPolicy, Pipeline, StepPolicies, TemplateRegistry};
use crate::domain::{codes, WorkflowError};

pub const ENV_CONFIG: &str = "THREADFLOW_CONFIG";
pub const ENV_HOME: &str = "THREADFLOW_HOME";
pub const ENV_DATABASE: &str = "THREADFLOW_DATABASE";
pub const ENV_SLACK_TOKEN: &str = "SLACK_BOT_TOKEN";
pub const ENV_OPENAI_KEY: &str = "OPENAI_API_KEY";
pub const ENV_NOTION_KEY: &str = "NOTION_API_KEY";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    /// Engine state directory (relative to the config file's directory)
    pub home: Option<String>,
    /// SQLite database (relative to the config file's directory)
    pub database_path: Option<String>,
    pub workflow_name: Option<String>,
    pub workers: Option<usize>,
    #[serde(default)]
    pub job_retry: JobRetryPolicy,
    #[serde(default)]
    pub steps: StepPolicies,
    #[serde(default)]
    pub slack: SlackSettings,
    #[serde(default)]
    pub openai: OpenAiSettings,
    #[serde(default)]
    pub notion: NotionSettings,
    #[serde(default)]
    pub templates: Vec<DocumentTemplate>,
    pub default_template: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SlackSettings {
    #[serde(default = "default_slack_base")]
    pub api_base: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OpenAiSettings {
    #[serde(default = "default_openai_base")]
    pub api_base: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    #[serde(default = "default_openai_timeout")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NotionSettings {
    #[serde(default = "default_notion_base")]
    pub api_base: String,
    #[serde(default = "default_notion_version")]
    pub api_version: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_slack_base() -> String {
    "https://slack.com/api".to_string()
}
fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_notion_base() -> String {
    "https://api.notion.com/v1".to_string()
}
fn default_notion_version() -> String {
    "2022-06-28".to_string()
}
fn default_timeout() -> u64 {
    30
}
fn default_openai_timeout() -> u64 {
    120
}

impl Default for SlackSettings {
    fn default() -> Self {
        Self {
            api_base: default_slack_base(),
            timeout_seconds: default_timeout(),
        }
    }
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            api_base: default_openai_base(),
            model: default_openai_model(),
            timeout_seconds: default_openai_timeout(),
        }
    }
}

impl Default for NotionSettings {
    fn default() -> Self {
        Self {
            api_base: default_notion_base(),
            api_version: default_notion_version(),
            timeout_seconds: default_timeout(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// SQLite database holding run records
    pub database_path: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub workflow_name: String,
    /// Concurrent jobs in the worker pool
    pub workers: usize,
    pub job_retry: JobRetryPolicy,
    pub steps: StepPolicies,
    pub slack: SlackSettings,
    pub openai: OpenAiSettings,
    pub notion: NotionSettings,
    pub templates: Vec<DocumentTemplate>,
    pub default_template: Option<String>,
}

impl AppConfig {
    /// Load configuration from all sources
    pub fn load() -> Result<Self> {
        let config_file = std::env::var(ENV_CONFIG)
            .ok()
            .map(PathBuf::from)
            .or_else(find_config_file);

        let (file, base_dir) = match config_file {
            Some(ref path) => {
                let file = load_config_file(path)?;
                let base = path.parent().unwrap_or(Path::new(".")).to_path_buf();
                (file, Some(base))
            }
            None => (ConfigFile::default(), None),
        };

        Self::resolve(file, base_dir.as_deref(), config_file, |key| std::env::var(key).ok())
    }

    /// Resolve a parsed config file against the environment.
    ///
    /// `base_dir` anchors relative paths (the config file's directory).
    pub fn resolve<F>(
        file: ConfigFile,
        base_dir: Option<&Path>,
        config_file: Option<PathBuf>,
        env: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = match (env(ENV_HOME), &file.home, base_dir) {
            (Some(env_home), _, _) => PathBuf::from(env_home),
            (None, Some(home), Some(base)) => resolve_path(base, home),
            (None, Some(home), None) => PathBuf::from(home),
            (None, None, _) => dirs::home_dir()
                .context("Failed to determine home directory")?
                .join(".threadflow"),
        };

        let database_path = match (env(ENV_DATABASE), &file.database_path, base_dir) {
            (Some(env_db), _, _) => PathBuf::from(env_db),
            (None, Some(db), Some(base)) => resolve_path(base, db),
            (None, Some(db), None) => PathBuf::from(db),
            (None, None, _) => home.join("runs.db"),
        };

        let config = Self {
            home,
            database_path,
            config_file,
            workflow_name: file
                .workflow_name
                .unwrap_or_else(|| "thread_to_document".to_string()),
            workers: file.workers.unwrap_or(4),
            job_retry: file.job_retry,
            steps: file.steps,
            slack: file.slack,
            openai: file.openai,
            notion: file.notion,
            templates: file.templates,
            default_template: file.default_template,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.job_retry.max_attempts == 0 {
            anyhow::bail!("job_retry.max_attempts must be at least 1");
        }
        for policy in [
            &self.steps.capture,
            &self.steps.transform,
            &self.steps.publish,
            &self.steps.notify,
        ] {
            policy.validate()?;
        }
        if let Some(ref id) = self.default_template {
            if !self.templates.iter().any(|t| &t.id == id) {
                anyhow::bail!("default_template '{}' is not among the configured templates", id);
            }
        }
        Ok(())
    }

    pub fn template_registry(&self) -> TemplateRegistry {
        TemplateRegistry::new(self.templates.clone(), self.default_template.clone())
    }

    /// Build the standard pipeline over the real service clients
    pub fn standard_pipeline(&self, credentials: &Credentials) -> Result<Pipeline> {
        let slack = Arc::new(SlackClient::new(
            credentials.require(ENV_SLACK_TOKEN, &credentials.slack_bot_token)?,
            self.slack.api_base.clone(),
            Duration::from_secs(self.slack.timeout_seconds),
        )?);
        let openai = Arc::new(OpenAiClient::new(
            credentials.require(ENV_OPENAI_KEY, &credentials.openai_api_key)?,
            self.openai.api_base.clone(),
            self.openai.model.clone(),
            Duration::from_secs(self.openai.timeout_seconds),
        )?);
        let notion = Arc::new(NotionClient::new(
            credentials.require(ENV_NOTION_KEY, &credentials.notion_api_key)?,
            self.notion.api_base.clone(),
            self.notion.api_version.clone(),
            Duration::from_secs(self.notion.timeout_seconds),
        )?);

        let pipeline = Pipeline::standard(
            self.workflow_name.clone(),
            Collaborators {
                capture: slack.clone(),
                transformer: openai,
                publisher: notion,
                notifier: slack,
            },
            Arc::new(self.template_registry()),
            &self.steps,
        );
        pipeline.validate()?;
        Ok(pipeline)
    }
}

/// API secrets, read from the environment only
#[derive(Clone, Default)]
pub struct Credentials {
    pub slack_bot_token: Option<String>,
    pub openai_api_key: Option<String>,
    pub notion_api_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mask = |v: &Option<String>| if v.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("Credentials")
            .field("slack_bot_token", &mask(&self.slack_bot_token))
            .field("openai_api_key", &mask(&self.openai_api_key))
            .field("notion_api_key", &mask(&self.notion_api_key))
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            slack_bot_token: get(ENV_SLACK_TOKEN),
            openai_api_key: get(ENV_OPENAI_KEY),
            notion_api_key: get(ENV_NOTION_KEY),
        }
    }

    fn require(&self, name: &str, value: &Option<String>) -> Result<String, WorkflowError> {
        value.clone().ok_or_else(|| {
            WorkflowError::configuration(format!("Missing credential: set {}", name))
                .with_code(codes::MISSING_CREDENTIALS)
                .with_context("variable", name)
        })
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".threadflow").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
