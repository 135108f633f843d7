//! Key/value metadata, including the `settings` JSON object.

use rusqlite::{OptionalExtension, params};
use serde_json::{Map, Value};

use super::{Store, now_ms, store_err};
use crate::error::AppError;

pub const SETTINGS_KEY: &str = "settings";

impl Store {
    pub fn metadata(&self, key: &str) -> Result<Option<String>, AppError> {
        let conn = self.open_conn()?;
        conn.query_row("SELECT value FROM metadata WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(store_err("read metadata"))
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<(), AppError> {
        let conn = self.open_conn()?;
        conn.execute(
            "INSERT INTO metadata (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_ms()],
        )
        .map_err(store_err("write metadata"))?;
        Ok(())
    }

    /// Stored settings; an empty object when none were saved.
    pub fn settings(&self) -> Result<Map<String, Value>, AppError> {
        match self.metadata(SETTINGS_KEY)? {
            None => Ok(Map::new()),
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => Ok(map),
                Ok(_) => Err(AppError::Store("settings are not a JSON object".into())),
                Err(e) => Err(AppError::Store(format!("corrupt settings: {e}"))),
            },
        }
    }

    /// Shallow-merge `patch` into the stored settings; returns the result.
    pub fn update_settings(&self, patch: Map<String, Value>) -> Result<Map<String, Value>, AppError> {
        let mut settings = self.settings()?;
        settings.extend(patch);
        self.set_metadata(SETTINGS_KEY, &Value::Object(settings.clone()).to_string())?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::store::temp_store;
    use serde_json::json;

    #[test]
    fn metadata_upsert() {
        let (_dir, store) = temp_store();
        assert!(store.metadata("theme").unwrap().is_none());
        store.set_metadata("theme", "dark").unwrap();
        store.set_metadata("theme", "light").unwrap();
        assert_eq!(store.metadata("theme").unwrap().as_deref(), Some("light"));
    }

    #[test]
    fn settings_merge_keys() {
        let (_dir, store) = temp_store();
        assert!(store.settings().unwrap().is_empty());

        let patch = |v: Value| v.as_object().cloned().unwrap();
        store.update_settings(patch(json!({ "theme": "dark", "refresh": 5 }))).unwrap();
        let merged = store.update_settings(patch(json!({ "refresh": 10 }))).unwrap();
        assert_eq!(Value::Object(merged), json!({ "theme": "dark", "refresh": 10 }));
        assert_eq!(store.settings().unwrap()["theme"], "dark");
    }

    #[test]
    fn corrupt_settings_surface_as_errors() {
        let (_dir, store) = temp_store();
        store.set_metadata(SETTINGS_KEY, "[1,2]").unwrap();
        assert!(matches!(store.settings(), Err(AppError::Store(_))));
    }
}
