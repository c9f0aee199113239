use std::collections::BTreeMap;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::store::{Scope, ScriptStore};

/// Content types shared by every bot, plus the elements and extension
/// components of the mounted ones.
#[derive(Debug, Default)]
pub struct ContentRegistry {
    types: DashMap<String, Value>,
    elements: DashMap<String, BTreeMap<String, Value>>,
    components: DashMap<String, Vec<String>>,
}

impl ContentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads global `content-types/*.json`, keyed by their `id` or file stem.
    pub async fn load_content_types(&self, store: &dyn ScriptStore) -> Result<usize> {
        let files = store.directory_listing(&Scope::Global, "content-types", ".json").await?;
        for file in &files {
            let raw = store.read_to_string(&Scope::Global, "content-types", file).await?;
            let value: Value = serde_json::from_str(&raw)
                .with_context(|| format!("content type {file} is not valid JSON"))?;
            let id = value
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| file.trim_end_matches(".json").to_string());
            self.types.insert(id, value);
        }
        Ok(files.len())
    }

    /// Loads `content-elements/*.json` of a bot; each file holds an array of elements.
    pub async fn load_elements_for_bot(&self, store: &dyn ScriptStore, bot_id: &str) -> Result<usize> {
        let scope = Scope::Bot(bot_id.to_string());
        let mut elements = BTreeMap::new();
        for file in store.directory_listing(&scope, "content-elements", ".json").await? {
            let raw = store.read_to_string(&scope, "content-elements", &file).await?;
            let parsed: Value = serde_json::from_str(&raw)
                .with_context(|| format!("content elements {file} of {bot_id} are not valid JSON"))?;
            let content_type = file.trim_end_matches(".json");
            for element in parsed.as_array().into_iter().flatten() {
                let id = element
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{content_type}-{}", elements.len()));
                elements.insert(id, element.clone());
            }
        }
        let count = elements.len();
        debug!(bot_id, count, "content elements loaded");
        self.elements.insert(bot_id.to_string(), elements);
        Ok(count)
    }

    /// Records the bot's extension components (`components/*.json`).
    pub async fn extract_bot_components(&self, store: &dyn ScriptStore, bot_id: &str) -> Result<usize> {
        let scope = Scope::Bot(bot_id.to_string());
        let files = store.directory_listing(&scope, "components", ".json").await?;
        let count = files.len();
        self.components.insert(bot_id.to_string(), files);
        Ok(count)
    }

    pub fn clear_elements(&self, bot_id: &str) {
        self.elements.remove(bot_id);
        self.components.remove(bot_id);
    }

    pub fn element(&self, bot_id: &str, element_id: &str) -> Option<Value> {
        self.elements.get(bot_id)?.get(element_id).cloned()
    }

    pub fn element_count(&self, bot_id: &str) -> usize {
        self.elements.get(bot_id).map(|e| e.len()).unwrap_or(0)
    }

    pub fn content_type(&self, id: &str) -> Option<Value> {
        self.types.get(id).map(|t| t.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryScriptStore;
    use serde_json::json;

    #[tokio::test]
    async fn loads_and_clears_bot_content() {
        let store = MemoryScriptStore::new();
        store
            .upsert_file(
                &Scope::Global,
                "content-types",
                "builtin_text.json",
                json!({ "id": "builtin_text", "title": "Text" }).to_string().into_bytes(),
            )
            .await
            .unwrap();
        let bot = Scope::Bot("welcome".into());
        store
            .upsert_file(
                &bot,
                "content-elements",
                "builtin_text.json",
                json!([{ "id": "builtin_text-abc", "formData": { "text": "hi" } }])
                    .to_string()
                    .into_bytes(),
            )
            .await
            .unwrap();

        let registry = ContentRegistry::new();
        assert_eq!(registry.load_content_types(store.as_ref()).await.unwrap(), 1);
        assert!(registry.content_type("builtin_text").is_some());
        assert_eq!(registry.load_elements_for_bot(store.as_ref(), "welcome").await.unwrap(), 1);
        assert_eq!(
            registry.element("welcome", "builtin_text-abc").unwrap()["formData"]["text"],
            json!("hi")
        );

        registry.clear_elements("welcome");
        assert_eq!(registry.element_count("welcome"), 0);
    }
}
