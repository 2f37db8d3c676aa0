use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::attrs::AttrsPolicy;
use crate::cli::CommonOpts;
use crate::error::MdrunError;
use crate::fence::FenceInfoOptions;
use crate::partials::DuplicatePolicy;

// Precedence: CLI > env > file > defaults.

const DEFAULT_FILE: &str = "Runbook.md";
const DEFAULT_ATTRS_POLICY: &str = "ignore";
const DEFAULT_ON_DUPLICATE_PARTIAL: &str = "overwrite";
const DEFAULT_CONFIG_FILE: &str = "mdrun.toml";

const ENV_PREFIX: &str = "MDRUN_";

fn default_langs() -> Vec<String> {
    ["shell", "sh", "bash", "zsh"]
        .iter()
        .map(|s| (*s).to_owned())
        .collect()
}

/// Resolved configuration for an mdrun invocation.
///
/// Built from three layers with precedence CLI > env > file > defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdrunConfig {
    /// Runbook files consulted when the command line names none.
    pub files: Vec<PathBuf>,
    /// Fence languages admitted by the spawnable inspector.
    pub langs: Vec<String>,
    pub coerce_numbers: bool,
    /// Admit any named fence as a CONTENT task (catch-all inspector).
    pub content_tasks: bool,
    pub attrs_policy: String,
    pub on_duplicate_partial: String,
    /// Per-task timeout in seconds; 0 disables.
    pub task_timeout_sec: u64,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub summary_path: Option<PathBuf>,
}

/// TOML-deserializable config file representation. All fields optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    files: Option<Vec<PathBuf>>,
    langs: Option<Vec<String>>,
    coerce_numbers: Option<bool>,
    content_tasks: Option<bool>,
    attrs_policy: Option<String>,
    on_duplicate_partial: Option<String>,
    task_timeout_sec: Option<u64>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    summary_path: Option<PathBuf>,
}

/// Intermediate layer where every field is optional, used to merge sources.
#[derive(Debug, Default)]
struct ConfigLayer {
    files: Option<Vec<PathBuf>>,
    langs: Option<Vec<String>>,
    coerce_numbers: Option<bool>,
    content_tasks: Option<bool>,
    attrs_policy: Option<String>,
    on_duplicate_partial: Option<String>,
    task_timeout_sec: Option<u64>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    summary_path: Option<PathBuf>,
}

impl MdrunConfig {
    /// Load configuration with precedence CLI > env > file > defaults.
    /// When `--config` is absent, `./mdrun.toml` is used if it exists.
    pub fn load(cli: &CommonOpts) -> anyhow::Result<Self> {
        Self::load_with_env(cli, real_env_var)
    }

    /// Validate enum-valued string fields.
    pub fn validate(&self) -> Result<(), MdrunError> {
        AttrsPolicy::parse(&self.attrs_policy)?;
        DuplicatePolicy::parse(&self.on_duplicate_partial)?;
        Ok(())
    }

    /// Fence-parser options implied by this config.
    pub fn fence_options(&self) -> FenceInfoOptions {
        FenceInfoOptions {
            coerce_numbers: self.coerce_numbers,
            retain_cmd_lang: false,
            normalize_flag_key: None,
            // validate() ran at load time; the string is known-good.
            attrs_policy: AttrsPolicy::parse(&self.attrs_policy).unwrap_or_default(),
        }
    }

    pub fn duplicate_policy(&self) -> DuplicatePolicy {
        DuplicatePolicy::parse(&self.on_duplicate_partial).unwrap_or_default()
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_sec > 0).then(|| Duration::from_secs(self.task_timeout_sec))
    }

    /// Internal constructor that accepts an env-var lookup function,
    /// enabling deterministic testing without process-global mutation.
    fn load_with_env(cli: &CommonOpts, env_fn: fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let file_layer = match resolve_config_path(cli) {
            Some(path) => load_file_layer(&path)?,
            None => ConfigLayer::default(),
        };
        let env_layer = load_env_layer(env_fn);
        let cli_layer = cli_layer_from(cli);

        let merged = merge_layers(file_layer, env_layer, cli_layer);

        let config = MdrunConfig {
            files: merged
                .files
                .unwrap_or_else(|| vec![PathBuf::from(DEFAULT_FILE)]),
            langs: merged.langs.unwrap_or_else(default_langs),
            coerce_numbers: merged.coerce_numbers.unwrap_or(false),
            content_tasks: merged.content_tasks.unwrap_or(false),
            attrs_policy: merged
                .attrs_policy
                .unwrap_or_else(|| DEFAULT_ATTRS_POLICY.to_owned()),
            on_duplicate_partial: merged
                .on_duplicate_partial
                .unwrap_or_else(|| DEFAULT_ON_DUPLICATE_PARTIAL.to_owned()),
            task_timeout_sec: merged.task_timeout_sec.unwrap_or(0),
            log_level: merged.log_level,
            log_file: merged.log_file,
            summary_path: merged.summary_path,
        };
        config.validate()?;
        Ok(config)
    }
}

fn resolve_config_path(cli: &CommonOpts) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    let implicit = PathBuf::from(DEFAULT_CONFIG_FILE);
    implicit.is_file().then_some(implicit)
}

fn load_file_layer(path: &Path) -> anyhow::Result<ConfigLayer> {
    let contents = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
    let fc: FileConfig = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
    Ok(ConfigLayer {
        files: fc.files,
        langs: fc.langs,
        coerce_numbers: fc.coerce_numbers,
        content_tasks: fc.content_tasks,
        attrs_policy: fc.attrs_policy,
        on_duplicate_partial: fc.on_duplicate_partial,
        task_timeout_sec: fc.task_timeout_sec,
        log_level: fc.log_level,
        log_file: fc.log_file,
        summary_path: fc.summary_path,
    })
}

fn real_env_var(suffix: &str) -> Option<String> {
    let key = format!("{ENV_PREFIX}{suffix}");
    env::var(&key).ok().filter(|v| !v.is_empty())
}

fn load_env_layer(env_fn: fn(&str) -> Option<String>) -> ConfigLayer {
    ConfigLayer {
        files: env_fn("FILES").map(|s| s.split(',').map(|p| PathBuf::from(p.trim())).collect()),
        langs: env_fn("LANGS").map(|s| s.split(',').map(|l| l.trim().to_owned()).collect()),
        coerce_numbers: env_fn("COERCE_NUMBERS").map(|v| v == "1" || v == "true"),
        content_tasks: env_fn("CONTENT_TASKS").map(|v| v == "1" || v == "true"),
        attrs_policy: env_fn("ATTRS_POLICY"),
        on_duplicate_partial: env_fn("ON_DUPLICATE_PARTIAL"),
        task_timeout_sec: env_fn("TASK_TIMEOUT_SEC").and_then(|v| v.parse().ok()),
        log_level: env_fn("LOG_LEVEL"),
        log_file: env_fn("LOG_FILE").map(PathBuf::from),
        summary_path: env_fn("SUMMARY_PATH").map(PathBuf::from),
    }
}

fn cli_layer_from(cli: &CommonOpts) -> ConfigLayer {
    ConfigLayer {
        task_timeout_sec: cli.timeout,
        log_level: cli.log_level.clone(),
        log_file: cli.log_file.clone(),
        ..ConfigLayer::default()
    }
}

/// Merge three layers; later arguments win field by field.
fn merge_layers(file: ConfigLayer, env: ConfigLayer, cli: ConfigLayer) -> ConfigLayer {
    ConfigLayer {
        files: cli.files.or(env.files).or(file.files),
        langs: cli.langs.or(env.langs).or(file.langs),
        coerce_numbers: cli.coerce_numbers.or(env.coerce_numbers).or(file.coerce_numbers),
        content_tasks: cli.content_tasks.or(env.content_tasks).or(file.content_tasks),
        attrs_policy: cli.attrs_policy.or(env.attrs_policy).or(file.attrs_policy),
        on_duplicate_partial: cli
            .on_duplicate_partial
            .or(env.on_duplicate_partial)
            .or(file.on_duplicate_partial),
        task_timeout_sec: cli
            .task_timeout_sec
            .or(env.task_timeout_sec)
            .or(file.task_timeout_sec),
        log_level: cli.log_level.or(env.log_level).or(file.log_level),
        log_file: cli.log_file.or(env.log_file).or(file.log_file),
        summary_path: cli.summary_path.or(env.summary_path).or(file.summary_path),
    }
}
