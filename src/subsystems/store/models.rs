//! Model records: one row per known model.

use std::fmt;
use std::str::FromStr;

use rusqlite::{OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Store, now_ms, store_err};
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Running,
    #[default]
    Stopped,
    Loading,
    Error,
}

impl ModelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Loading => "loading",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "loading" => Ok(Self::Loading),
            "error" => Ok(Self::Error),
            other => Err(AppError::InvalidInput(format!("unknown model status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub status: ModelStatus,
    pub model_path: Option<String>,
    pub file_size: Option<i64>,
    /// Free-form JSON object.
    pub params: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

fn default_model_type() -> String {
    "gguf".to_string()
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewModel {
    pub name: String,
    #[serde(rename = "type", default = "default_model_type")]
    pub model_type: String,
    #[serde(default)]
    pub status: ModelStatus,
    #[serde(default)]
    pub model_path: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default = "empty_object")]
    pub params: Value,
}

impl NewModel {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_type: default_model_type(),
            status: ModelStatus::Stopped,
            model_path: None,
            file_size: None,
            params: empty_object(),
        }
    }
}

/// Partial update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPatch {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub model_type: Option<String>,
    pub status: Option<ModelStatus>,
    pub model_path: Option<String>,
    pub file_size: Option<i64>,
    pub params: Option<Value>,
}

const SELECT_COLUMNS: &str =
    "SELECT id, name, type, status, model_path, file_size, params, created_at, updated_at FROM models";

fn map_row(row: &Row<'_>) -> rusqlite::Result<ModelRecord> {
    let status: String = row.get(3)?;
    let params: String = row.get(6)?;
    Ok(ModelRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        model_type: row.get(2)?,
        status: status.parse().unwrap_or_default(),
        model_path: row.get(4)?,
        file_size: row.get(5)?,
        params: serde_json::from_str(&params).unwrap_or_else(|_| empty_object()),
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn validate(name: &str, params: &Value) -> Result<(), AppError> {
    if name.trim().is_empty() {
        return Err(AppError::InvalidInput("model name must not be empty".into()));
    }
    if !params.is_object() {
        return Err(AppError::InvalidInput("model params must be a JSON object".into()));
    }
    Ok(())
}

/// Unique-name violations are the caller's fault, not the store's.
fn conflict_or<'a>(op: &'static str, name: &'a str) -> impl Fn(rusqlite::Error) -> AppError + 'a {
    move |e| match e {
        rusqlite::Error::SqliteFailure(ref f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            AppError::InvalidInput(format!("model '{name}' already exists"))
        }
        e => store_err(op)(e),
    }
}

impl Store {
    pub fn list_models(&self) -> Result<Vec<ModelRecord>, AppError> {
        let conn = self.open_conn()?;
        let mut stmt = conn
            .prepare(&format!("{SELECT_COLUMNS} ORDER BY id"))
            .map_err(store_err("prepare list_models"))?;
        let rows = stmt.query_map([], map_row).map_err(store_err("query list_models"))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(store_err("map list_models row"))
    }

    pub fn get_model(&self, id: i64) -> Result<Option<ModelRecord>, AppError> {
        let conn = self.open_conn()?;
        conn.query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), params![id], map_row)
            .optional()
            .map_err(store_err("get_model"))
    }

    pub fn get_model_by_name(&self, name: &str) -> Result<Option<ModelRecord>, AppError> {
        let conn = self.open_conn()?;
        conn.query_row(&format!("{SELECT_COLUMNS} WHERE name = ?1"), params![name], map_row)
            .optional()
            .map_err(store_err("get_model_by_name"))
    }

    pub fn create_model(&self, model: NewModel) -> Result<ModelRecord, AppError> {
        validate(&model.name, &model.params)?;
        let now = now_ms();
        let conn = self.open_conn()?;
        conn.execute(
            "INSERT INTO models (name, type, status, model_path, file_size, params, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                model.name,
                model.model_type,
                model.status.as_str(),
                model.model_path,
                model.file_size,
                model.params.to_string(),
                now,
            ],
        )
        .map_err(conflict_or("insert model", &model.name))?;

        Ok(ModelRecord {
            id: conn.last_insert_rowid(),
            name: model.name,
            model_type: model.model_type,
            status: model.status,
            model_path: model.model_path,
            file_size: model.file_size,
            params: model.params,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn update_model(&self, id: i64, patch: ModelPatch) -> Result<ModelRecord, AppError> {
        let mut record = self
            .get_model(id)?
            .ok_or_else(|| AppError::NotFound(format!("model {id} not found")))?;

        if let Some(name) = patch.name {
            record.name = name;
        }
        if let Some(model_type) = patch.model_type {
            record.model_type = model_type;
        }
        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(path) = patch.model_path {
            record.model_path = Some(path);
        }
        if let Some(size) = patch.file_size {
            record.file_size = Some(size);
        }
        if let Some(params) = patch.params {
            record.params = params;
        }
        validate(&record.name, &record.params)?;
        record.updated_at = now_ms().max(record.created_at);

        let conn = self.open_conn()?;
        conn.execute(
            "UPDATE models SET name = ?1, type = ?2, status = ?3, model_path = ?4, file_size = ?5,
             params = ?6, updated_at = ?7 WHERE id = ?8",
            params![
                record.name,
                record.model_type,
                record.status.as_str(),
                record.model_path,
                record.file_size,
                record.params.to_string(),
                record.updated_at,
                id,
            ],
        )
        .map_err(conflict_or("update model", &record.name))?;
        Ok(record)
    }

    pub fn set_model_status(&self, name: &str, status: ModelStatus) -> Result<bool, AppError> {
        let conn = self.open_conn()?;
        let n = conn
            .execute(
                "UPDATE models SET status = ?1, updated_at = ?2 WHERE name = ?3",
                params![status.as_str(), now_ms(), name],
            )
            .map_err(store_err("set model status"))?;
        Ok(n > 0)
    }

    /// Remove a model and, through the cascade, all of its config rows.
    pub fn delete_model(&self, id: i64) -> Result<(), AppError> {
        let conn = self.open_conn()?;
        let n = conn
            .execute("DELETE FROM models WHERE id = ?1", params![id])
            .map_err(store_err("delete model"))?;
        if n == 0 {
            return Err(AppError::NotFound(format!("model {id} not found")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subsystems::store::temp_store;
    use serde_json::json;

    #[test]
    fn create_get_list() {
        let (_dir, store) = temp_store();
        let mut new = NewModel::named("llama-2-7b");
        new.model_path = Some("/models/llama-2-7b.gguf".into());
        new.params = json!({ "ctx": 4096 });
        let created = store.create_model(new).unwrap();
        assert!(created.id > 0);
        assert_eq!(created.status, ModelStatus::Stopped);

        let fetched = store.get_model(created.id).unwrap().unwrap();
        assert_eq!(fetched, created);
        assert_eq!(store.get_model_by_name("llama-2-7b").unwrap().unwrap().id, created.id);
        assert_eq!(store.list_models().unwrap().len(), 1);
        assert!(store.get_model(999).unwrap().is_none());
    }

    #[test]
    fn duplicate_names_are_invalid_input() {
        let (_dir, store) = temp_store();
        store.create_model(NewModel::named("mistral")).unwrap();
        let err = store.create_model(NewModel::named("mistral")).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)), "{err}");
    }

    #[test]
    fn empty_name_and_non_object_params_rejected() {
        let (_dir, store) = temp_store();
        assert!(matches!(store.create_model(NewModel::named("  ")), Err(AppError::InvalidInput(_))));
        let mut bad = NewModel::named("x");
        bad.params = json!([1, 2]);
        assert!(matches!(store.create_model(bad), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn update_applies_only_given_fields() {
        let (_dir, store) = temp_store();
        let created = store.create_model(NewModel::named("phi")).unwrap();
        let updated = store
            .update_model(
                created.id,
                ModelPatch { status: Some(ModelStatus::Running), ..Default::default() },
            )
            .unwrap();
        assert_eq!(updated.status, ModelStatus::Running);
        assert_eq!(updated.name, "phi");
        assert!(updated.updated_at >= created.updated_at);
        assert_eq!(store.get_model(created.id).unwrap().unwrap().status, ModelStatus::Running);

        assert!(matches!(
            store.update_model(404, ModelPatch::default()),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn status_by_name() {
        let (_dir, store) = temp_store();
        store.create_model(NewModel::named("qwen")).unwrap();
        assert!(store.set_model_status("qwen", ModelStatus::Loading).unwrap());
        assert!(!store.set_model_status("ghost", ModelStatus::Loading).unwrap());
        let m = store.get_model_by_name("qwen").unwrap().unwrap();
        assert_eq!(m.status, ModelStatus::Loading);
    }

    #[test]
    fn delete_missing_is_not_found() {
        let (_dir, store) = temp_store();
        let m = store.create_model(NewModel::named("gone")).unwrap();
        store.delete_model(m.id).unwrap();
        assert!(matches!(store.delete_model(m.id), Err(AppError::NotFound(_))));
    }

    #[test]
    fn wire_shape() {
        let new: NewModel = serde_json::from_value(json!({ "name": "a", "modelPath": "/m/a.gguf" })).unwrap();
        assert_eq!(new.model_type, "gguf");
        assert_eq!(new.model_path.as_deref(), Some("/m/a.gguf"));

        let (_dir, store) = temp_store();
        let v = serde_json::to_value(store.create_model(new).unwrap()).unwrap();
        assert_eq!(v["type"], "gguf");
        assert_eq!(v["status"], "stopped");
        assert!(v["createdAt"].is_i64());
    }
}
