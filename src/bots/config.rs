use jsonschema::Validator;
use once_cell::sync::Lazy;
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{HostError, HostResult};

/// Contents of `bot.config.json`. Unknown keys are kept in `extra`.
/// A missing `id` or `name` defaults to the bot folder name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BotConfig {
    #[serde(default)]
    #[schemars(length(min = 1))]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub locked: bool,
    #[schemars(length(min = 1))]
    pub languages: Vec<String>,
    pub default_language: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

static VALIDATOR: Lazy<Result<Validator, String>> = Lazy::new(|| {
    let schema = serde_json::to_value(schema_for!(BotConfig)).map_err(|e| e.to_string())?;
    jsonschema::validator_for(&schema).map_err(|e| e.to_string())
});

impl BotConfig {
    /// Parses and validates a raw config. Every failure is a configuration error for `bot_id`.
    pub fn parse(bot_id: &str, raw: &str) -> HostResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| HostError::configuration(bot_id, format!("bot.config.json is not valid JSON: {e}")))?;
        let validator = VALIDATOR
            .as_ref()
            .map_err(|e| HostError::configuration(bot_id, format!("config schema unavailable: {e}")))?;
        let problems: Vec<String> = validator
            .iter_errors(&value)
            .map(|e| format!("{} ({})", e, e.instance_path))
            .collect();
        if !problems.is_empty() {
            return Err(HostError::configuration(bot_id, problems.join("; ")));
        }

        let mut config: BotConfig = serde_json::from_value(value)
            .map_err(|e| HostError::configuration(bot_id, e.to_string()))?;
        if config.id.is_empty() {
            config.id = bot_id.to_string();
        }
        if config.name.is_empty() {
            config.name = config.id.clone();
        }
        if !config.languages.contains(&config.default_language) {
            return Err(HostError::configuration(
                bot_id,
                "Supported languages must include the default language of the bot",
            ));
        }
        Ok(config)
    }

    /// Current pipeline stage, stored under `pipeline_status.current_stage.id`.
    pub fn stage(&self) -> Option<&str> {
        self.extra
            .get("pipeline_status")?
            .get("current_stage")?
            .get("id")?
            .as_str()
    }

    pub fn set_stage(&mut self, stage: &str) {
        let status = self
            .extra
            .entry("pipeline_status")
            .or_insert_with(|| Value::Object(Map::new()));
        if !status.is_object() {
            *status = Value::Object(Map::new());
        }
        status["current_stage"] = serde_json::json!({ "id": stage });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_and_keeps_extras() {
        let raw = json!({
            "id": "welcome",
            "name": "Welcome bot",
            "languages": ["en", "fr"],
            "defaultLanguage": "en",
            "pipeline_status": { "current_stage": { "id": "prod" } }
        });
        let config = BotConfig::parse("welcome", &raw.to_string()).unwrap();
        assert_eq!(config.default_language, "en");
        assert!(!config.disabled);
        assert_eq!(config.stage(), Some("prod"));
    }

    #[test]
    fn id_and_name_default_to_the_bot_folder() {
        let raw = json!({ "languages": ["en"], "defaultLanguage": "en" });
        let config = BotConfig::parse("support", &raw.to_string()).unwrap();
        assert_eq!(config.id, "support");
        assert_eq!(config.name, "support");

        let raw = json!({ "id": "support", "name": "Support desk", "languages": ["en"], "defaultLanguage": "en" });
        let config = BotConfig::parse("support", &raw.to_string()).unwrap();
        assert_eq!(config.name, "Support desk");
    }

    #[test]
    fn set_stage_creates_pipeline_status() {
        let raw = json!({ "id": "b", "name": "b", "languages": ["en"], "defaultLanguage": "en" });
        let mut config = BotConfig::parse("b", &raw.to_string()).unwrap();
        assert_eq!(config.stage(), None);
        config.set_stage("staging");
        assert_eq!(config.stage(), Some("staging"));
    }

    #[test]
    fn default_language_must_be_supported() {
        let raw = json!({ "id": "b", "name": "b", "languages": ["fr"], "defaultLanguage": "en" });
        let err = BotConfig::parse("b", &raw.to_string()).unwrap_err();
        assert!(matches!(err, HostError::Configuration { .. }));
        assert!(err.to_string().contains("default language"), "{err}");
    }

    #[test]
    fn schema_violations_are_configuration_errors() {
        let missing = json!({ "defaultLanguage": "en" });
        assert!(matches!(
            BotConfig::parse("b", &missing.to_string()),
            Err(HostError::Configuration { .. })
        ));
        let wrong_type = json!({ "id": "b", "name": "b", "languages": "en", "defaultLanguage": "en" });
        assert!(BotConfig::parse("b", &wrong_type.to_string()).is_err());
        assert!(BotConfig::parse("b", "{ not json").is_err());
    }
}
