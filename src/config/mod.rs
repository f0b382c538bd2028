use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::{Launcher, ScriptEntry};
use crate::log::LogFormat;
use crate::paths;
use crate::prompt::{BACKUP_PROMPT_PATTERN, PromptPatterns};
use crate::supervisor::SupervisorConfig;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".saturn";

fn default_timeout_secs() -> u64 {
    600
}

fn default_prompt_timeout_secs() -> u64 {
    600
}

fn default_grace_period_millis() -> u64 {
    3000
}

fn default_poll_interval_millis() -> u64 {
    100
}

fn default_tail_lines() -> usize {
    200
}

fn default_patterns() -> Vec<String> {
    vec![BACKUP_PROMPT_PATTERN.to_string()]
}

fn default_log_dir() -> String {
    "~/saturn-logs".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_sink_buffer() -> usize {
    1024
}

fn default_interpreter() -> String {
    "~/venv/bin/python3".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_prompt_timeout_secs")]
    pub prompt_timeout_secs: u64,
    #[serde(default = "default_grace_period_millis")]
    pub grace_period_millis: u64,
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            prompt_timeout_secs: default_prompt_timeout_secs(),
            grace_period_millis: default_grace_period_millis(),
            poll_interval_millis: default_poll_interval_millis(),
            tail_lines: default_tail_lines(),
        }
    }
}

impl SupervisorSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }
}

/// Prompt patterns, matched case-insensitively after ANSI and glyph stripping.
///
/// ```toml
/// [prompt]
/// patterns = ['backup\?\s*\[?\s*y\s*/\s*n\s*\]?', 'overwrite\? \(y/n\)']
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromptSettings {
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            patterns: default_patterns(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSettings {
    #[serde(default = "default_log_dir")]
    pub dir: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Events buffered per stream client before the oldest are dropped.
    #[serde(default = "default_sink_buffer")]
    pub sink_buffer: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            sink_buffer: default_sink_buffer(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PythonSettings {
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
}

impl Default for PythonSettings {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub prompt: PromptSettings,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub python: PythonSettings,
    #[serde(default)]
    pub scripts: Vec<ScriptEntry>,
}

impl ManagerConfig {
    /// Search upward from `start` for a `.saturn/config.toml` file and load
    /// it, then try the home directory. Returns the default config if no
    /// file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        Self::load_with_home(start, dirs::home_dir().as_deref())
    }

    pub fn load_with_home(start: &Path, home: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let found = Self::find_config_file(start).or_else(|| {
            home.map(|h| h.join(CONFIG_DIR).join(CONFIG_FILENAME))
                .filter(|p| p.is_file())
        });

        if let Some(path) = found {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: ManagerConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            config
                .prompt_patterns()
                .with_context(|| format!("invalid [prompt] patterns in {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((ManagerConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    pub fn prompt_patterns(&self) -> Result<PromptPatterns> {
        PromptPatterns::new(&self.prompt.patterns).context("failed to compile prompt pattern")
    }

    pub fn supervisor_config(&self) -> Result<SupervisorConfig> {
        Ok(SupervisorConfig {
            poll_interval: Duration::from_millis(self.supervisor.poll_interval_millis.max(1)),
            grace_period: Duration::from_millis(self.supervisor.grace_period_millis),
            tail_lines: self.supervisor.tail_lines,
            patterns: self.prompt_patterns()?,
        })
    }

    pub fn launcher(&self) -> Launcher {
        Launcher {
            python: paths::expand_user(&self.python.interpreter),
            timeout: self.supervisor.timeout(),
            prompt_timeout: self.supervisor.prompt_timeout(),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        paths::expand_user(&self.log.dir)
    }
}

fn source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .saturn/config.toml found)".to_string())
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<22} {value}\n"));
}

/// Sectioned, human-readable rendering for `saturn-relay config`.
pub fn render_human(config: &ManagerConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Supervisor\n");
    push_kv(&mut output, "timeout", format!("{}s", config.supervisor.timeout_secs));
    push_kv(
        &mut output,
        "prompt_timeout",
        format!("{}s", config.supervisor.prompt_timeout_secs),
    );
    push_kv(
        &mut output,
        "grace_period",
        format!("{}ms", config.supervisor.grace_period_millis),
    );
    push_kv(
        &mut output,
        "poll_interval",
        format!("{}ms", config.supervisor.poll_interval_millis),
    );
    push_kv(&mut output, "tail_lines", config.supervisor.tail_lines);
    output.push('\n');

    output.push_str("Prompt Patterns\n");
    if config.prompt.patterns.is_empty() {
        push_kv(&mut output, "patterns", "(none)");
    } else {
        for pattern in &config.prompt.patterns {
            output.push_str(&format!("  - {pattern}\n"));
        }
    }
    output.push('\n');

    output.push_str("Log\n");
    push_kv(&mut output, "dir", &config.log.dir);
    push_kv(
        &mut output,
        "format",
        match config.log.format {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        },
    );
    output.push('\n');

    output.push_str("Server\n");
    push_kv(&mut output, "bind", &config.server.bind);
    push_kv(&mut output, "sink_buffer", config.server.sink_buffer);
    output.push('\n');

    output.push_str("Python\n");
    push_kv(&mut output, "interpreter", &config.python.interpreter);
    output.push('\n');

    output.push_str("Scripts\n");
    if config.scripts.is_empty() {
        push_kv(&mut output, "entries", "(none)");
    } else {
        for script in &config.scripts {
            output.push_str(&format!(
                "  - [{}] {}/{}\n",
                script.category, script.directory, script.filename
            ));
        }
    }
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", source_label(config_path));

    output
}

/// JSON rendering for `saturn-relay config --json`.
pub fn render_json(config: &ManagerConfig, config_path: Option<&Path>) -> Result<String> {
    let mut payload =
        serde_json::to_value(config).context("failed to serialize config to JSON")?;
    if let Some(map) = payload.as_object_mut() {
        map.insert(
            "source_path".to_string(),
            serde_json::Value::String(source_label(config_path)),
        );
    }
    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}
