use std::collections::HashMap;

use chrono::NaiveDateTime;

use crate::changeset::{ChangeKind, ChangeRow, ChangeSet};
use crate::error::SyncError;
use crate::store::{FieldDef, TargetStore};
use crate::value::{get_field_ci, FieldKind, Record, Value, TIME_FORMAT};

/// Counts from one reconciliation pass. `unmatched_updates` holds the ids
/// of update rows that referenced no target row (reconciliation gaps).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplyResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unmatched_updates: Vec<String>,
}

/// Reconciles a tagged row set against the target store by primary key.
/// Inserts are appended in one bulk operation, updates are keyed
/// field-by-field overwrites excluding system-managed fields, deletes are
/// one bulk keyed removal. Application order is always INSERT, then
/// UPDATE, then DELETE; updates must land before deletes are final even if
/// an upstream feed is malformed. The store's structural schema is never
/// touched.
pub fn apply_changes(
    changes: &ChangeSet,
    store: &mut dyn TargetStore,
    id_field: &str,
) -> Result<ApplyResult, SyncError> {
    if changes.is_empty() {
        return Ok(ApplyResult::default());
    }

    let schema = store.schema()?;
    let writable: Vec<&FieldDef> = schema.iter().filter(|f| !f.system_managed).collect();

    let mut inserts: Vec<&ChangeRow> = Vec::new();
    let mut updates: Vec<&ChangeRow> = Vec::new();
    let mut deletes: Vec<&ChangeRow> = Vec::new();
    for row in &changes.rows {
        match row.kind {
            ChangeKind::Insert => inserts.push(row),
            ChangeKind::Update => updates.push(row),
            ChangeKind::Delete => deletes.push(row),
        }
    }

    let mut result = ApplyResult::default();

    if !inserts.is_empty() {
        let rows: Vec<Record> = inserts
            .iter()
            .map(|row| project_writable(&row.values, &writable))
            .collect();
        result.inserted = store.bulk_append(&rows)?;
        log::info!("Inserted {} rows", result.inserted);
    }

    if !updates.is_empty() {
        let mut pending: HashMap<String, &ChangeRow> = HashMap::new();
        for row in &updates {
            match row.key(id_field) {
                Some(key) if !key.is_null() => {
                    pending.insert(key.key_string(), *row);
                }
                _ => log::warn!("Update row without a {} value, skipping", id_field),
            }
        }

        let mut scan_fields: Vec<String> = vec![id_field.to_string()];
        scan_fields.extend(writable.iter().map(|f| f.name.clone()));

        for target_row in store.scan_all(&scan_fields)? {
            let key = match get_field_ci(&target_row, id_field) {
                Some(key) => key.clone(),
                None => continue,
            };
            if let Some(source) = pending.remove(&key.key_string()) {
                let fields = project_writable(&source.values, &writable);
                store.update_row(id_field, &key, &fields)?;
                result.updated += 1;
            }
        }

        // Anything left referenced an id absent from the target. Logged and
        // reported, not fatal.
        result.unmatched_updates = pending.into_keys().collect();
        result.unmatched_updates.sort();
        for id in &result.unmatched_updates {
            log::warn!(
                "Update for {} = {} matched no target row",
                id_field,
                id
            );
        }
        log::info!("Updated {} rows", result.updated);
    }

    if !deletes.is_empty() {
        let keys: Vec<Value> = deletes
            .iter()
            .filter_map(|row| match row.key(id_field) {
                Some(key) if !key.is_null() => Some(key.clone()),
                _ => {
                    log::warn!("Delete row without a {} value, skipping", id_field);
                    None
                }
            })
            .collect();
        result.deleted = store.bulk_delete_by_keys(id_field, &keys)?;
        log::info!("Deleted {} rows", result.deleted);
    }

    Ok(result)
}

/// Keeps the fields the target schema can accept, excluding system-managed
/// ones. Fields only the source knows are dropped, not an error.
fn project_writable(values: &Record, writable: &[&FieldDef]) -> Record {
    let mut row = Record::new();
    for def in writable {
        if let Some(value) = get_field_ci(values, &def.name) {
            row.insert(def.name.clone(), coerce(value, def.kind));
        }
    }
    row
}

/// Date-time fields arrive as text in changeset feeds; everything else
/// passes through unchanged. Unparseable text is passed through for the
/// store to reject rather than silently dropped.
fn coerce(value: &Value, kind: FieldKind) -> Value {
    match (kind, value) {
        (FieldKind::DateTime, Value::Text(s)) => {
            match NaiveDateTime::parse_from_str(s, TIME_FORMAT) {
                Ok(t) => Value::DateTime(t),
                Err(_) => {
                    log::debug!("Could not parse {} as {}", s, TIME_FORMAT);
                    value.clone()
                }
            }
        }
        _ => value.clone(),
    }
}
