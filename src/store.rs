use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::value::{get_field_ci, FieldKind, Record, Value};

/// File-based stores can be created on demand; enterprise stores cannot,
/// and a missing one is fatal for the dataset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    File,
    Enterprise,
}

/// Schema metadata for one target field. `system_managed` marks fields the
/// store itself maintains (creation/edit stamps, surrogate and global ids);
/// reconciliation never writes them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    pub system_managed: bool,
}

impl FieldDef {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            system_managed: false,
        }
    }

    pub fn system(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            system_managed: true,
        }
    }
}

/// Target store collaborator. The application engine drives this; it never
/// creates or alters the store's structural schema itself.
///
/// `scan_all` returns materialized rows rather than a borrowing iterator so
/// the caller can interleave `update_row` calls during the pass.
pub trait TargetStore {
    fn location(&self) -> &str;
    fn kind(&self) -> StoreKind;
    fn exists(&self) -> Result<bool, SyncError>;
    fn create(&mut self) -> Result<(), SyncError>;
    fn truncate(&mut self) -> Result<(), SyncError>;
    fn schema(&self) -> Result<Vec<FieldDef>, SyncError>;
    fn bulk_append(&mut self, rows: &[Record]) -> Result<usize, SyncError>;
    fn bulk_delete_by_keys(&mut self, id_field: &str, keys: &[Value])
        -> Result<usize, SyncError>;
    fn scan_all(&mut self, fields: &[String]) -> Result<Vec<Record>, SyncError>;
    fn update_row(
        &mut self,
        id_field: &str,
        key: &Value,
        fields: &Record,
    ) -> Result<(), SyncError>;
}

/// An in-memory target store with a fixed schema. Used by the test suites
/// and as the reference semantics for real store adapters: unknown fields
/// are dropped on write, field names match case-insensitively, deletes of
/// absent keys are no-ops.
pub struct MemoryStore {
    location: String,
    kind: StoreKind,
    exists: bool,
    schema: Vec<FieldDef>,
    rows: Vec<Record>,
}

impl MemoryStore {
    pub fn new(location: &str, kind: StoreKind, schema: Vec<FieldDef>) -> Self {
        Self {
            location: location.to_string(),
            kind,
            exists: false,
            schema,
            rows: Vec::new(),
        }
    }

    /// A store that already exists, as most do mid-run.
    pub fn created(location: &str, kind: StoreKind, schema: Vec<FieldDef>) -> Self {
        let mut store = Self::new(location, kind, schema);
        store.exists = true;
        store
    }

    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    pub fn find(&self, id_field: &str, key: &str) -> Option<&Record> {
        self.rows
            .iter()
            .find(|row| matches_key(row, id_field, key))
    }

    fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.schema
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
    }
}

fn matches_key(row: &Record, id_field: &str, key: &str) -> bool {
    get_field_ci(row, id_field).map(|v| v.key_string()) == Some(key.to_string())
}

impl TargetStore for MemoryStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn kind(&self) -> StoreKind {
        self.kind
    }

    fn exists(&self) -> Result<bool, SyncError> {
        Ok(self.exists)
    }

    fn create(&mut self) -> Result<(), SyncError> {
        log::debug!("STORE CREATE: {}", self.location);
        self.exists = true;
        Ok(())
    }

    fn truncate(&mut self) -> Result<(), SyncError> {
        log::debug!("STORE TRUNCATE: {} ({} rows)", self.location, self.rows.len());
        self.rows.clear();
        Ok(())
    }

    fn schema(&self) -> Result<Vec<FieldDef>, SyncError> {
        Ok(self.schema.clone())
    }

    fn bulk_append(&mut self, rows: &[Record]) -> Result<usize, SyncError> {
        log::debug!("STORE APPEND: {} rows to {}", rows.len(), self.location);
        for row in rows {
            // Keep only fields the schema knows, under their canonical names.
            let mut kept = Record::new();
            for (name, value) in row {
                if let Some(def) = self.field_def(name) {
                    kept.insert(def.name.clone(), value.clone());
                }
            }
            self.rows.push(kept);
        }
        Ok(rows.len())
    }

    fn bulk_delete_by_keys(
        &mut self,
        id_field: &str,
        keys: &[Value],
    ) -> Result<usize, SyncError> {
        let key_strings: Vec<String> = keys.iter().map(|k| k.key_string()).collect();
        let before = self.rows.len();
        self.rows.retain(|row| {
            !key_strings
                .iter()
                .any(|key| matches_key(row, id_field, key))
        });
        let deleted = before - self.rows.len();
        log::debug!(
            "STORE DELETE: {} of {} keys matched in {}",
            deleted,
            keys.len(),
            self.location
        );
        Ok(deleted)
    }

    fn scan_all(&mut self, fields: &[String]) -> Result<Vec<Record>, SyncError> {
        log::debug!("STORE SCAN: {} ({} rows)", self.location, self.rows.len());
        if fields.is_empty() {
            return Ok(self.rows.clone());
        }
        Ok(self
            .rows
            .iter()
            .map(|row| {
                let mut projected = Record::new();
                for name in fields {
                    if let Some(value) = get_field_ci(row, name) {
                        projected.insert(name.clone(), value.clone());
                    }
                }
                projected
            })
            .collect())
    }

    fn update_row(
        &mut self,
        id_field: &str,
        key: &Value,
        fields: &Record,
    ) -> Result<(), SyncError> {
        let key = key.key_string();
        let defs: Vec<(String, String)> = fields
            .keys()
            .map(|name| {
                let canonical = self
                    .field_def(name)
                    .map(|d| d.name.clone())
                    .unwrap_or_else(|| name.clone());
                (name.clone(), canonical)
            })
            .collect();
        for row in self
            .rows
            .iter_mut()
            .filter(|row| matches_key(row, id_field, &key))
        {
            for (source_name, canonical) in &defs {
                if let Some(value) = fields.get(source_name) {
                    row.insert(canonical.clone(), value.clone());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Vec<FieldDef> {
        vec![
            FieldDef::new("id", FieldKind::Id),
            FieldDef::new("name", FieldKind::Text),
            FieldDef::system("created_date", FieldKind::DateTime),
        ]
    }

    fn row(id: &str, name: &str) -> Record {
        let mut row = Record::new();
        row.insert("id".to_string(), Value::Id(id.to_string()));
        row.insert("name".to_string(), Value::Text(name.to_string()));
        row
    }

    #[test]
    fn append_drops_unknown_fields() -> anyhow::Result<()> {
        let mut store = MemoryStore::created("mem.gdb", StoreKind::File, schema());
        let mut extra = row("1", "one");
        extra.insert("not_in_schema".to_string(), Value::Number(1.0));
        store.bulk_append(&[extra])?;
        assert!(store.rows()[0].get("not_in_schema").is_none());
        assert_eq!(store.rows()[0].get("name"), Some(&Value::Text("one".to_string())));
        Ok(())
    }

    #[test]
    fn delete_is_idempotent() -> anyhow::Result<()> {
        let mut store = MemoryStore::created("mem.gdb", StoreKind::File, schema());
        store.bulk_append(&[row("1", "one"), row("2", "two")])?;

        let keys = vec![Value::Id("1".to_string()), Value::Id("404".to_string())];
        assert_eq!(store.bulk_delete_by_keys("id", &keys)?, 1);
        assert_eq!(store.bulk_delete_by_keys("id", &keys)?, 0);
        assert_eq!(store.rows().len(), 1);
        Ok(())
    }

    #[test]
    fn update_matches_field_names_case_insensitively() -> anyhow::Result<()> {
        let mut store = MemoryStore::created("mem.gdb", StoreKind::File, schema());
        store.bulk_append(&[row("1", "one")])?;

        let mut fields = Record::new();
        fields.insert("NAME".to_string(), Value::Text("uno".to_string()));
        store.update_row("ID", &Value::Id("1".to_string()), &fields)?;

        assert_eq!(
            store.find("id", "1").unwrap().get("name"),
            Some(&Value::Text("uno".to_string()))
        );
        Ok(())
    }

    #[test]
    fn scan_projects_requested_fields() -> anyhow::Result<()> {
        let mut store = MemoryStore::created("mem.gdb", StoreKind::File, schema());
        store.bulk_append(&[row("1", "one")])?;

        let scanned = store.scan_all(&["id".to_string()])?;
        assert_eq!(scanned.len(), 1);
        assert!(scanned[0].contains_key("id"));
        assert!(!scanned[0].contains_key("name"));
        Ok(())
    }
}
