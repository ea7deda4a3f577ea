//! Entity collections behind the reconciler.
//!
//! Every non-fact entity kind lives as a JSON array of objects (each with a
//! string `id`) under one fixed substrate key; app settings are a single
//! object and the instructional prompt a single record. Keeping the records
//! as raw JSON lets one merge path serve eleven heterogeneous schemas.

use chrono::Utc;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};
use crate::store::KvStore;

pub const CHARACTERS_KEY: &str = "characters";
pub const LOREBOOKS_KEY: &str = "lorebooks";
pub const PERSONAS_KEY: &str = "personas";
pub const PROMPTS_KEY: &str = "prompts";
pub const CONVERSATIONS_KEY: &str = "conversations";
pub const ITEMS_KEY: &str = "items";
pub const WORLDS_KEY: &str = "worlds";
pub const STYLE_PREFERENCES_KEY: &str = "style_preferences";
pub const APP_SETTINGS_KEY: &str = "app_settings";
pub const INSTRUCTIONAL_PROMPT_KEY: &str = "instructional_prompt";

pub fn record_id(record: &Value) -> Option<&str> {
    record.get("id").and_then(Value::as_str)
}

pub struct Collections {
    store: Arc<dyn KvStore>,
    write_lock: Mutex<()>,
}

impl Collections {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn list(&self, collection_key: &str) -> Result<Vec<Value>> {
        self.read(collection_key).await
    }

    pub async fn find(&self, collection_key: &str, id: &str) -> Result<Option<Value>> {
        Ok(self
            .read(collection_key)
            .await?
            .into_iter()
            .find(|r| record_id(r) == Some(id)))
    }

    pub async fn insert(&self, collection_key: &str, record: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read(collection_key).await?;
        records.push(record);
        self.write(collection_key, &records).await
    }

    /// Shallow object merge: keys present in the patch overwrite, everything
    /// else on the record survives. Returns the merged record.
    pub async fn merge_fields(
        &self,
        collection_key: &str,
        id: &str,
        patch: &Map<String, Value>,
    ) -> Result<Value> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read(collection_key).await?;
        let record = records
            .iter_mut()
            .find(|r| record_id(r) == Some(id))
            .ok_or_else(|| EngineError::NotFound(format!("{collection_key}/{id}")))?;
        let fields = record
            .as_object_mut()
            .ok_or_else(|| EngineError::Validation(format!("{collection_key}/{id} is not an object")))?;
        for (key, value) in patch {
            fields.insert(key.clone(), value.clone());
        }
        fields.insert("updated_at".to_string(), json!(Utc::now()));
        let merged = record.clone();
        self.write(collection_key, &records).await?;
        Ok(merged)
    }

    pub async fn remove(&self, collection_key: &str, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read(collection_key).await?;
        let before = records.len();
        records.retain(|r| record_id(r) != Some(id));
        if records.len() == before {
            return Err(EngineError::NotFound(format!("{collection_key}/{id}")));
        }
        self.write(collection_key, &records).await
    }

    // App settings: one keyed field write per setting.

    pub async fn get_setting(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read_settings().await?.get(key).cloned())
    }

    pub async fn set_setting(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut settings = self.read_settings().await?;
        settings.insert(key.to_string(), value);
        self.store
            .set(APP_SETTINGS_KEY, Value::Object(settings))
            .await
            .map_err(EngineError::StoreUnavailable)
    }

    pub async fn remove_setting(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut settings = self.read_settings().await?;
        if settings.remove(key).is_none() {
            return Err(EngineError::NotFound(format!("setting {key}")));
        }
        self.store
            .set(APP_SETTINGS_KEY, Value::Object(settings))
            .await
            .map_err(EngineError::StoreUnavailable)
    }

    // The instructional prompt is a single record, edit-only upstream.

    pub async fn instructional_prompt(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .get(INSTRUCTIONAL_PROMPT_KEY)
            .await
            .map_err(EngineError::StoreUnavailable)?
            .and_then(|v| v.get("content").and_then(Value::as_str).map(String::from)))
    }

    pub async fn set_instructional_prompt(&self, content: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store
            .set(
                INSTRUCTIONAL_PROMPT_KEY,
                json!({ "content": content, "updated_at": Utc::now() }),
            )
            .await
            .map_err(EngineError::StoreUnavailable)
    }

    async fn read(&self, collection_key: &str) -> Result<Vec<Value>> {
        Ok(self
            .store
            .get_json::<Vec<Value>>(collection_key)
            .await
            .map_err(EngineError::StoreUnavailable)?
            .unwrap_or_default())
    }

    async fn write(&self, collection_key: &str, records: &[Value]) -> Result<()> {
        self.store
            .set_json(collection_key, &records)
            .await
            .map_err(EngineError::StoreUnavailable)
    }

    async fn read_settings(&self) -> Result<Map<String, Value>> {
        Ok(self
            .store
            .get(APP_SETTINGS_KEY)
            .await
            .map_err(EngineError::StoreUnavailable)?
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default())
    }
}
