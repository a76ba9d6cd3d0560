//! Configuration loader and validator for the appraisal pipeline service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub sheets: Sheets,
    pub content: Content,
    pub describer: Describer,
    pub notifier: Notifier,
    pub artifacts: Artifacts,
    pub intake: Intake,
    pub queue: Queue,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub listen: String,
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    pub max_delivery_attempts: u32,
    pub workers: usize,
    pub step_deadline_seconds: u64,
}

/// Spreadsheet acting as the system of record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sheets {
    pub base_url: String,
    pub spreadsheet_id: String,
    pub pending_sheet: String,
    pub completed_sheet: String,
    #[serde(default)]
    pub move_completed: bool,
    #[serde(default)]
    pub access_token: String,
}

/// Headless CMS holding the public appraisal post.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Content {
    pub base_url: String,
    pub post_type: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub app_password: String,
}

/// Vision-capable text generation API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Describer {
    pub base_url: String,
    pub model: String,
    pub max_words: u32,
    #[serde(default)]
    pub api_key: String,
}

/// Transactional email delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notifier {
    pub base_url: String,
    pub sender_email: String,
    pub sender_name: String,
    pub completed_template_id: String,
    pub update_template_id: String,
    pub update_delay_seconds: u64,
    pub dashboard_url: String,
    #[serde(default)]
    pub api_key: String,
}

/// External document generation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifacts {
    pub endpoint: String,
}

/// Intake webhook settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Intake {
    #[serde(default)]
    pub shared_secret: String,
}

/// Task queue settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    pub project_id: String,
    pub topic: String,
}

impl App {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn step_deadline(&self) -> Duration {
        Duration::from_secs(self.step_deadline_seconds)
    }

    /// SQLite location used when `DATABASE_URL` is not set.
    pub fn default_database_url(&self) -> String {
        format!(
            "sqlite://{}/appraisals.db",
            self.data_dir.trim_end_matches('/')
        )
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Fill blank secrets from the environment. Values already present in the
    /// file win so a checked-in config can still pin them for local runs.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let fill = |slot: &mut String, key: &str| {
            if slot.trim().is_empty() {
                if let Some(v) = lookup(key) {
                    *slot = v;
                }
            }
        };
        fill(&mut self.sheets.access_token, "SHEETS_ACCESS_TOKEN");
        fill(&mut self.content.username, "CONTENT_USERNAME");
        fill(&mut self.content.app_password, "CONTENT_APP_PASSWORD");
        fill(&mut self.describer.api_key, "OPENAI_API_KEY");
        fill(&mut self.notifier.api_key, "SENDGRID_API_KEY");
        fill(&mut self.intake.shared_secret, "INTAKE_SHARED_SECRET");
    }
}

/// Load configuration from a YAML file, fill secrets from the environment
/// and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env_overrides();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.listen.trim().is_empty() {
        return Err(ConfigError::Invalid("app.listen must be non-empty"));
    }
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.max_delivery_attempts == 0 {
        return Err(ConfigError::Invalid("app.max_delivery_attempts must be > 0"));
    }
    if cfg.app.workers == 0 {
        return Err(ConfigError::Invalid("app.workers must be > 0"));
    }
    if cfg.app.step_deadline_seconds == 0 {
        return Err(ConfigError::Invalid("app.step_deadline_seconds must be > 0"));
    }

    if cfg.sheets.spreadsheet_id.trim().is_empty() {
        return Err(ConfigError::Invalid("sheets.spreadsheet_id must be non-empty"));
    }
    if cfg.sheets.pending_sheet.trim().is_empty() {
        return Err(ConfigError::Invalid("sheets.pending_sheet must be non-empty"));
    }
    if cfg.sheets.move_completed && cfg.sheets.completed_sheet.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "sheets.completed_sheet must be non-empty when sheets.move_completed is set",
        ));
    }
    if cfg.sheets.access_token.trim().is_empty() {
        return Err(ConfigError::Invalid("sheets.access_token must be non-empty"));
    }

    if cfg.content.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("content.base_url must be non-empty"));
    }
    if cfg.content.post_type.trim().is_empty() {
        return Err(ConfigError::Invalid("content.post_type must be non-empty"));
    }
    if cfg.content.username.trim().is_empty() || cfg.content.app_password.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "content.username and content.app_password must be non-empty",
        ));
    }

    if cfg.describer.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("describer.api_key must be non-empty"));
    }
    if cfg.describer.max_words == 0 {
        return Err(ConfigError::Invalid("describer.max_words must be > 0"));
    }

    let n = &cfg.notifier;
    if n.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("notifier.api_key must be non-empty"));
    }
    if n.sender_email.trim().is_empty() {
        return Err(ConfigError::Invalid("notifier.sender_email must be non-empty"));
    }
    if n.completed_template_id.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "notifier.completed_template_id must be non-empty",
        ));
    }
    if n.update_template_id.trim().is_empty() {
        return Err(ConfigError::Invalid("notifier.update_template_id must be non-empty"));
    }

    if cfg.artifacts.endpoint.trim().is_empty() {
        return Err(ConfigError::Invalid("artifacts.endpoint must be non-empty"));
    }
    if cfg.intake.shared_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("intake.shared_secret must be non-empty"));
    }
    if cfg.queue.topic.trim().is_empty() {
        return Err(ConfigError::Invalid("queue.topic must be non-empty"));
    }

    Ok(())
}

/// Example configuration with every key present.
pub fn example() -> &'static str {
    r#"app:
  listen: "0.0.0.0:8080"
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 300
  max_delivery_attempts: 5
  workers: 2
  step_deadline_seconds: 90

sheets:
  base_url: "https://sheets.googleapis.com/"
  spreadsheet_id: "SPREADSHEET_ID"
  pending_sheet: "Pending Appraisals"
  completed_sheet: "Completed Appraisals"
  move_completed: false
  access_token: "SHEETS_ACCESS_TOKEN"

content:
  base_url: "https://example.com/wp-json/wp/v2/"
  post_type: "appraisals"
  username: "pipeline"
  app_password: "CONTENT_APP_PASSWORD"

describer:
  base_url: "https://api.openai.com/"
  model: "gpt-4o"
  max_words: 200
  api_key: "OPENAI_API_KEY"

notifier:
  base_url: "https://api.sendgrid.com/"
  sender_email: "appraisals@example.com"
  sender_name: "Appraisal Team"
  completed_template_id: "d-completed"
  update_template_id: "d-update"
  update_delay_seconds: 120
  dashboard_url: "https://example.com/dashboard"
  api_key: "SENDGRID_API_KEY"

artifacts:
  endpoint: "https://documents.example.com/generate-pdf"

intake:
  shared_secret: "INTAKE_SHARED_SECRET"

queue:
  project_id: "appraisals"
  topic: "appraisal-tasks"
"#
}
