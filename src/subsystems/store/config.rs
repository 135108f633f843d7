//! Per-model configuration: one JSON blob per (model, category).

use std::fmt;
use std::str::FromStr;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Store, now_ms, store_err};
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigCategory {
    Sampling,
    Memory,
    Gpu,
    Advanced,
    Lora,
    Multimodal,
    Server,
}

impl ConfigCategory {
    pub const ALL: [ConfigCategory; 7] = [
        Self::Sampling,
        Self::Memory,
        Self::Gpu,
        Self::Advanced,
        Self::Lora,
        Self::Multimodal,
        Self::Server,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sampling => "sampling",
            Self::Memory => "memory",
            Self::Gpu => "gpu",
            Self::Advanced => "advanced",
            Self::Lora => "lora",
            Self::Multimodal => "multimodal",
            Self::Server => "server",
        }
    }

    /// Only ever one of the seven fixed names, so it is safe to splice
    /// into SQL.
    pub fn table_name(self) -> &'static str {
        match self {
            Self::Sampling => "model_sampling_config",
            Self::Memory => "model_memory_config",
            Self::Gpu => "model_gpu_config",
            Self::Advanced => "model_advanced_config",
            Self::Lora => "model_lora_config",
            Self::Multimodal => "model_multimodal_config",
            Self::Server => "model_server_config",
        }
    }
}

impl fmt::Display for ConfigCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigCategory {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| AppError::InvalidInput(format!("unknown config type '{s}'")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRecord {
    pub model_id: i64,
    pub category: ConfigCategory,
    pub config: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

fn ensure_model(conn: &Connection, model_id: i64) -> Result<(), AppError> {
    let found: Option<i64> = conn
        .query_row("SELECT id FROM models WHERE id = ?1", params![model_id], |row| row.get(0))
        .optional()
        .map_err(store_err("look up model"))?;
    found
        .map(|_| ())
        .ok_or_else(|| AppError::NotFound(format!("model {model_id} not found")))
}

impl Store {
    /// The stored config for one category, `None` when nothing was saved yet.
    pub fn get_config(
        &self,
        model_id: i64,
        category: ConfigCategory,
    ) -> Result<Option<ConfigRecord>, AppError> {
        let conn = self.open_conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT config, created_at, updated_at FROM {} WHERE model_id = ?1",
                    category.table_name()
                ),
                params![model_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(store_err("get_config"))?;

        row.map(|(config, created_at, updated_at)| -> Result<ConfigRecord, AppError> {
            let config = serde_json::from_str(&config).map_err(|e| {
                AppError::Store(format!("corrupt {category} config for model {model_id}: {e}"))
            })?;
            Ok(ConfigRecord { model_id, category, config, created_at, updated_at })
        })
        .transpose()
    }

    /// Insert or replace the config for (model, category). Latest write wins;
    /// `created_at` of the first write is kept.
    pub fn upsert_config(
        &self,
        model_id: i64,
        category: ConfigCategory,
        config: &Value,
    ) -> Result<ConfigRecord, AppError> {
        if !config.is_object() {
            return Err(AppError::InvalidInput(format!(
                "{category} config must be a JSON object"
            )));
        }
        let mut conn = self.open_conn()?;
        let tx = conn.transaction().map_err(store_err("begin upsert tx"))?;
        ensure_model(&tx, model_id)?;

        let now = now_ms();
        tx.execute(
            &format!(
                "INSERT INTO {} (model_id, config, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(model_id) DO UPDATE SET config = excluded.config, updated_at = excluded.updated_at",
                category.table_name()
            ),
            params![model_id, config.to_string(), now],
        )
        .map_err(store_err("upsert config"))?;
        let created_at: i64 = tx
            .query_row(
                &format!("SELECT created_at FROM {} WHERE model_id = ?1", category.table_name()),
                params![model_id],
                |row| row.get(0),
            )
            .map_err(store_err("read back config"))?;
        tx.commit().map_err(store_err("commit upsert tx"))?;

        Ok(ConfigRecord {
            model_id,
            category,
            config: config.clone(),
            created_at,
            updated_at: now,
        })
    }

    /// Every category for a model as `{ "sampling": {...}, ... }`. Missing
    /// categories come back as empty objects.
    pub fn get_complete_config(&self, model_id: i64) -> Result<Value, AppError> {
        {
            let conn = self.open_conn()?;
            ensure_model(&conn, model_id)?;
        }
        let mut all = Map::new();
        for category in ConfigCategory::ALL {
            let config = self
                .get_config(model_id, category)?
                .map(|r| r.config)
                .unwrap_or_else(|| Value::Object(Map::new()));
            all.insert(category.as_str().to_string(), config);
        }
        Ok(Value::Object(all))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::store::{NewModel, temp_store};
    use serde_json::json;

    #[test]
    fn category_names_round_trip() {
        for c in ConfigCategory::ALL {
            assert_eq!(c.as_str().parse::<ConfigCategory>().unwrap(), c);
            assert!(c.table_name().starts_with("model_") && c.table_name().ends_with("_config"));
        }
        assert!(matches!("bogus".parse::<ConfigCategory>(), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn upsert_keeps_one_row_latest_wins() {
        let (_dir, store) = temp_store();
        let model = store.create_model(NewModel::named("llama")).unwrap();

        let first = store
            .upsert_config(model.id, ConfigCategory::Sampling, &json!({ "temperature": 0.7 }))
            .unwrap();
        let second = store
            .upsert_config(model.id, ConfigCategory::Sampling, &json!({ "temperature": 0.2, "top_k": 20 }))
            .unwrap();
        assert_eq!(second.created_at, first.created_at);

        let got = store.get_config(model.id, ConfigCategory::Sampling).unwrap().unwrap();
        assert_eq!(got.config, json!({ "temperature": 0.2, "top_k": 20 }));

        // a write replaces the whole object
        store.upsert_config(model.id, ConfigCategory::Sampling, &json!({ "top_k": 5 })).unwrap();
        let got = store.get_config(model.id, ConfigCategory::Sampling).unwrap().unwrap();
        assert_eq!(got.config, json!({ "top_k": 5 }));

        let conn = store.open_conn().unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM model_sampling_config", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn unknown_model_and_non_object_rejected() {
        let (_dir, store) = temp_store();
        assert!(matches!(
            store.upsert_config(42, ConfigCategory::Gpu, &json!({})),
            Err(AppError::NotFound(_))
        ));
        let model = store.create_model(NewModel::named("m")).unwrap();
        assert!(matches!(
            store.upsert_config(model.id, ConfigCategory::Gpu, &json!("layers")),
            Err(AppError::InvalidInput(_))
        ));
        assert!(store.get_config(model.id, ConfigCategory::Gpu).unwrap().is_none());
    }

    #[test]
    fn complete_config_fills_gaps_and_cascade_deletes() {
        let (_dir, store) = temp_store();
        let model = store.create_model(NewModel::named("m")).unwrap();
        store
            .upsert_config(model.id, ConfigCategory::Memory, &json!({ "ctx_size": 8192 }))
            .unwrap();

        let all = store.get_complete_config(model.id).unwrap();
        assert_eq!(all["memory"]["ctx_size"], 8192);
        assert_eq!(all["lora"], json!({}));
        assert_eq!(all.as_object().unwrap().len(), 7);

        store.delete_model(model.id).unwrap();
        assert!(store.get_config(model.id, ConfigCategory::Memory).unwrap().is_none());
        assert!(matches!(store.get_complete_config(model.id), Err(AppError::NotFound(_))));
    }
}
