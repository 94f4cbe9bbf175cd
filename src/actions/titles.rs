//! Reference actions over an in-memory `title_basics` table.
//!
//! The four handlers mirror the CRUD operations the fragments serve. The
//! store is deliberately simple; real deployments register handlers backed
//! by their own storage engine.

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::actions::{ActionError, ActionHandler, ActionRegistry};
use crate::locking::LockType;
use crate::transaction::TransactionPayload;

pub const CREATE_TITLE: &str = "CREATE_TITLE";
pub const READ_TITLE: &str = "READ_TITLE";
pub const UPDATE_TITLE: &str = "UPDATE_TITLE";
pub const DELETE_TITLE: &str = "DELETE_TITLE";

/// A row of the `title_basics` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Title {
    pub tconst: String,
    #[serde(default)]
    pub title_type: Option<String>,
    #[serde(default)]
    pub primary_title: Option<String>,
    #[serde(default)]
    pub original_title: Option<String>,
    #[serde(default)]
    pub is_adult: Option<bool>,
    #[serde(default)]
    pub start_year: Option<i64>,
    #[serde(default)]
    pub end_year: Option<i64>,
    #[serde(default)]
    pub runtime_minutes: Option<i64>,
    #[serde(default)]
    pub genres: Option<String>,
}

/// In-memory table keyed by `tconst`.
#[derive(Debug, Default)]
pub struct TitleStore {
    rows: RwLock<HashMap<String, Title>>,
}

impl TitleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, tconst: &str) -> Option<Title> {
        self.rows.read().get(tconst).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    pub fn insert(&self, title: Title) -> Result<(), ActionError> {
        let mut rows = self.rows.write();
        if rows.contains_key(&title.tconst) {
            return Err(ActionError::AlreadyApplied(format!(
                "Title with tconst {} already exists",
                title.tconst
            )));
        }
        rows.insert(title.tconst.clone(), title);
        Ok(())
    }

    /// Merges `changes` into the row. The primary key is immutable.
    pub fn update(
        &self,
        tconst: &str,
        changes: &serde_json::Map<String, Value>,
    ) -> Result<Title, ActionError> {
        if changes.contains_key("tconst") {
            return Err(ActionError::Rejected(
                "Cannot modify primary key 'tconst'".to_string(),
            ));
        }
        let mut rows = self.rows.write();
        let row = rows
            .get_mut(tconst)
            .ok_or_else(|| ActionError::NotFound(format!("Title {tconst} not found")))?;
        let mut merged = serde_json::to_value(&*row)
            .map_err(|e| ActionError::Storage(e.to_string()))?;
        if let Value::Object(fields) = &mut merged {
            for (column, value) in changes {
                fields.insert(column.clone(), value.clone());
            }
        }
        let updated: Title =
            serde_json::from_value(merged).map_err(|e| ActionError::Rejected(e.to_string()))?;
        *row = updated.clone();
        Ok(updated)
    }

    pub fn remove(&self, tconst: &str) -> Option<Title> {
        self.rows.write().remove(tconst)
    }
}

/// Builds a registry with the four title actions bound to `store`.
pub fn title_registry(store: Arc<TitleStore>) -> ActionRegistry {
    ActionRegistry::new()
        .with(CREATE_TITLE, Arc::new(CreateTitle(Arc::clone(&store))))
        .with(READ_TITLE, Arc::new(ReadTitle(Arc::clone(&store))))
        .with(UPDATE_TITLE, Arc::new(UpdateTitle(Arc::clone(&store))))
        .with(DELETE_TITLE, Arc::new(DeleteTitle(store)))
}

fn parse_title(payload: &TransactionPayload) -> Result<Title, ActionError> {
    let title: Title = serde_json::from_value(payload.data.clone())
        .map_err(|e| ActionError::Rejected(format!("Invalid title: {e}")))?;
    if title.tconst.is_empty() {
        return Err(ActionError::Rejected(
            "tconst (primary key) is required".to_string(),
        ));
    }
    // The lock is taken on `payload.id`; the row must live under the same key.
    if title.tconst != payload.id {
        return Err(ActionError::Rejected(format!(
            "tconst {} does not match request id {}",
            title.tconst, payload.id
        )));
    }
    Ok(title)
}

pub struct CreateTitle(pub Arc<TitleStore>);

#[async_trait]
impl ActionHandler for CreateTitle {
    fn lock_type(&self) -> LockType {
        LockType::Exclusive
    }

    async fn validate(&self, payload: &TransactionPayload) -> Result<(), ActionError> {
        let title = parse_title(payload)?;
        if self.0.get(&title.tconst).is_some() {
            return Err(ActionError::Rejected(format!(
                "Title with tconst {} already exists",
                title.tconst
            )));
        }
        Ok(())
    }

    async fn execute(&self, payload: &TransactionPayload) -> Result<Option<Value>, ActionError> {
        self.0.insert(parse_title(payload)?)?;
        Ok(None)
    }
}

pub struct ReadTitle(pub Arc<TitleStore>);

#[async_trait]
impl ActionHandler for ReadTitle {
    fn lock_type(&self) -> LockType {
        LockType::Shared
    }

    // Broadcast reads reach nodes that do not hold the row, so a miss is not a rejection.
    async fn validate(&self, _payload: &TransactionPayload) -> Result<(), ActionError> {
        Ok(())
    }

    async fn execute(&self, payload: &TransactionPayload) -> Result<Option<Value>, ActionError> {
        self.0
            .get(&payload.id)
            .map(|title| serde_json::to_value(title).map_err(|e| ActionError::Storage(e.to_string())))
            .transpose()
    }
}

pub struct UpdateTitle(pub Arc<TitleStore>);

impl UpdateTitle {
    /// The columns an update may touch: everything except the primary key
    /// and the fragmentation key.
    fn safe_changes(payload: &TransactionPayload) -> serde_json::Map<String, Value> {
        match &payload.data {
            Value::Object(fields) => fields
                .iter()
                .filter(|(column, _)| column.as_str() != "tconst" && column.as_str() != "startYear")
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect(),
            _ => serde_json::Map::new(),
        }
    }
}

#[async_trait]
impl ActionHandler for UpdateTitle {
    fn lock_type(&self) -> LockType {
        LockType::Exclusive
    }

    async fn validate(&self, payload: &TransactionPayload) -> Result<(), ActionError> {
        match self.0.get(&payload.id) {
            Some(_) => Ok(()),
            None => Err(ActionError::NotFound(format!("Title {} not found", payload.id))),
        }
    }

    async fn execute(&self, payload: &TransactionPayload) -> Result<Option<Value>, ActionError> {
        let changes = Self::safe_changes(payload);
        if changes.is_empty() {
            return Ok(None);
        }
        self.0.update(&payload.id, &changes)?;
        Ok(None)
    }
}

pub struct DeleteTitle(pub Arc<TitleStore>);

#[async_trait]
impl ActionHandler for DeleteTitle {
    fn lock_type(&self) -> LockType {
        LockType::Exclusive
    }

    async fn validate(&self, payload: &TransactionPayload) -> Result<(), ActionError> {
        match self.0.get(&payload.id) {
            Some(_) => Ok(()),
            None => Err(ActionError::NotFound(format!("Title {} not found", payload.id))),
        }
    }

    // A replayed delete finds nothing to remove, which is still success.
    async fn execute(&self, payload: &TransactionPayload) -> Result<Option<Value>, ActionError> {
        self.0.remove(&payload.id);
        Ok(None)
    }
}
