use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dlg_core::request::{DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, DEFAULT_TOP_P};
use dlg_core::{
    DisplayOptions, EngineSettings, ExamplePair, SamplingParams, SlotId, VariableStore,
};
use dlg_providers::openai::DEFAULT_ENDPOINT;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chat completions endpoint, upstream or relay
    pub endpoint: String,

    /// Literal key, `$ENV_VAR`, or a variable id holding the key.
    /// Leave unset when a relay supplies credentials.
    pub api_key: Option<ApiKeySource>,

    pub model: String,

    pub system_message: String,

    pub sampling: SamplingConfig,

    /// Exchanges kept in memory. 0 disables retention.
    pub retention: usize,

    pub stream: bool,

    pub slots: SlotsConfig,

    /// Switch that hides answers while on
    pub hide_switch: Option<SlotId>,

    pub display: DisplayOptions,

    /// Primer exchange sent after the system message
    pub example: Option<ExamplePair>,

    /// Initial switch values, keyed by switch id
    pub switches: HashMap<String, bool>,

    pub names: NamesConfig,

    /// Substituted for `\G`
    pub currency_unit: String,

    /// Lines shown before the answer waits for a scroll. 0 = unbounded.
    pub viewport_lines: usize,

    /// Where variables persist between runs (supports $HOME, ~)
    pub variables_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiKeySource {
    Variable(u32),
    Literal(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotsConfig {
    pub question: Option<SlotId>,
    pub answer: SlotId,
    pub memory: SlotId,
}

impl Default for SlotsConfig {
    fn default() -> Self {
        Self {
            question: Some(SlotId::from(1)),
            answer: SlotId::from(2),
            memory: SlotId::from(3),
        }
    }
}

/// Name tables for `\N[n]` and `\P[n]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NamesConfig {
    /// Actor names keyed by actor id
    pub actors: HashMap<String, String>,
    /// Party members in order
    pub party: Vec<String>,
}

impl NamesConfig {
    /// Actor table with numeric keys. Non-numeric keys are ignored.
    pub fn actor_table(&self) -> HashMap<u32, String> {
        self.actors
            .iter()
            .filter_map(|(id, name)| id.trim().parse().ok().map(|id| (id, name.clone())))
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        let engine = EngineSettings::default();
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            model: engine.model,
            system_message: engine.system_message,
            sampling: SamplingConfig::default(),
            retention: 10,
            stream: true,
            slots: SlotsConfig::default(),
            hide_switch: None,
            display: DisplayOptions::default(),
            example: None,
            switches: HashMap::new(),
            names: NamesConfig::default(),
            currency_unit: String::new(),
            viewport_lines: 0,
            variables_file: None,
        }
    }
}

/// Expand environment variables in a path string
/// Supports: $VAR, ${VAR}, ~
pub fn expand_path(path: &str) -> PathBuf {
    let mut result = path.to_string();

    // Expand ~ at the start
    if result.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            result = format!("{}{}", home.display(), &result[1..]);
        }
    } else if result == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    PathBuf::from(expand_env(&result))
}

/// Replace `$VAR` and `${VAR}` with their values; unknown variables stay as written.
fn expand_env(text: &str) -> String {
    let re = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .expect("env pattern is valid");
    re.replace_all(text, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| caps[0].to_string())
    })
    .to_string()
}

impl Config {
    /// Load defaults, then the config file if present, then `DLG_` variables.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DLG_").split("__"))
            .extract()
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("dlg"))
    }

    pub fn variables_path(&self) -> Result<PathBuf> {
        match &self.variables_file {
            Some(path) => Ok(expand_path(path)),
            None => Ok(Self::config_dir()?.join("variables.json")),
        }
    }

    /// Resolve the API key. Blank values count as absent.
    pub fn resolve_api_key(&self, variables: &dyn VariableStore) -> Option<String> {
        let key = match self.api_key.as_ref()? {
            ApiKeySource::Variable(id) => variables.get_text(&SlotId::from(*id))?,
            ApiKeySource::Literal(text) => {
                let expanded = expand_env(text);
                if expanded.starts_with('$') {
                    return None;
                }
                expanded
            }
        };
        let key = key.trim().to_string();
        (!key.is_empty()).then_some(key)
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.sampling.temperature,
            top_p: self.sampling.top_p,
            max_tokens: self.sampling.max_tokens,
        }
    }

    /// Check values no default can stand in for. Run after command-line
    /// overrides are applied.
    pub fn validate(&self) -> dlg_core::Result<()> {
        if self.model.trim().is_empty() {
            return Err(dlg_core::Error::config("model must not be empty"));
        }
        if self.endpoint.trim().is_empty() {
            return Err(dlg_core::Error::config("endpoint must not be empty"));
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            model: self.model.clone(),
            system_message: self.system_message.clone(),
            stream: self.stream,
            question_slot: self.slots.question.clone(),
            answer_slot: self.slots.answer.clone(),
            memory_slot: self.slots.memory.clone(),
            hide_switch: self.hide_switch.clone(),
            display: self.display.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlg_core::testing::MemoryVariables;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.model, "gpt-3.5-turbo");
        assert_eq!(config.system_message, "Please answer in Japanese.");
        assert_eq!(config.retention, 10);
        assert!(config.stream);
        assert_eq!(config.sampling().max_tokens, 512);
        assert_eq!(config.slots.memory, SlotId::from(3));
        assert_eq!(config.display.strip_chars, "「」");
    }

    #[test]
    fn test_parse_config() {
        let (_dir, path) = write_config(
            r#"
            endpoint = "http://localhost:8787/relay"
            model = "gpt-4o-mini"
            retention = 3
            hide_switch = 12

            [sampling]
            temperature = 0.5

            [slots]
            question = 10
            answer = 11
            memory = "history"

            [display]
            line_break_length = 24
            newline = "<br>"

            [example]
            user = "Who are you?"
            assistant = "I am the innkeeper."

            [names]
            party = ["Aria", "Bram"]

            [names.actors]
            1 = "Harold"
            "#,
        );

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.endpoint, "http://localhost:8787/relay");
        assert_eq!(config.retention, 3);
        assert_eq!(config.hide_switch, Some(SlotId::from(12)));
        assert_eq!(config.sampling.temperature, 0.5);
        assert_eq!(config.sampling.top_p, DEFAULT_TOP_P);
        assert_eq!(config.slots.memory, SlotId::from("history"));
        assert_eq!(config.display.line_break_length, 24);
        assert_eq!(config.display.strip_chars, "「」");
        assert_eq!(config.example.as_ref().unwrap().assistant, "I am the innkeeper.");
        assert_eq!(config.names.actor_table().get(&1).map(String::as_str), Some("Harold"));

        let settings = config.engine_settings();
        assert_eq!(settings.question_slot, Some(SlotId::from(10)));
        assert_eq!(settings.model, "gpt-4o-mini");
    }

    #[test]
    fn test_api_key_literal_and_variable() {
        let variables = MemoryVariables::new();
        variables.set(&SlotId::from(20), serde_json::json!("sk-from-variable"));

        let (_dir, path) = write_config(r#"api_key = 20"#);
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.api_key, Some(ApiKeySource::Variable(20)));
        assert_eq!(
            config.resolve_api_key(&variables),
            Some("sk-from-variable".to_string())
        );

        let (_dir, path) = write_config(r#"api_key = "sk-literal""#);
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.resolve_api_key(&variables), Some("sk-literal".to_string()));
    }

    #[test]
    fn test_api_key_absent_cases() {
        let variables = MemoryVariables::new();

        let config = Config::default();
        assert_eq!(config.resolve_api_key(&variables), None);

        // Empty variable
        let config = Config {
            api_key: Some(ApiKeySource::Variable(99)),
            ..Config::default()
        };
        assert_eq!(config.resolve_api_key(&variables), None);

        // Unset environment variable
        let config = Config {
            api_key: Some(ApiKeySource::Literal("$DLG_TEST_UNSET_KEY_VAR".to_string())),
            ..Config::default()
        };
        assert_eq!(config.resolve_api_key(&variables), None);
    }

    #[test]
    fn test_validate_rejects_blank_model() {
        let (_dir, path) = write_config(r#"model = "  ""#);
        let config = Config::load_from(&path).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, dlg_core::Error::Config(_)));
        assert!(err.to_string().contains("model"));

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_expand_path_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/vars.json"), home.join("vars.json"));
        }
        assert_eq!(expand_path("/tmp/vars.json"), PathBuf::from("/tmp/vars.json"));
    }
}
