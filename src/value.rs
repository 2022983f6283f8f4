use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Textual timestamp format used for ledger rows, delta windows, and
/// date-time coercion. UTC with no offset suffix, second precision, so
/// lexicographic and chronological ordering coincide.
pub const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// A single row's fields. Geometry is carried as an ordinary field value.
pub type Record = BTreeMap<String, Value>;

/// Closed set of field value kinds. Keeping the set closed means the
/// system-field exclusion and type coercion logic in the application
/// engine is exhaustive.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Number(f64),
    DateTime(NaiveDateTime),
    Geometry(Geometry),
    Id(String),
}

impl Value {
    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            Value::Null => None,
            Value::Text(_) => Some(FieldKind::Text),
            Value::Number(_) => Some(FieldKind::Number),
            Value::DateTime(_) => Some(FieldKind::DateTime),
            Value::Geometry(_) => Some(FieldKind::Geometry),
            Value::Id(_) => Some(FieldKind::Id),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical string form used when a value acts as a primary key, so
    /// `Id("7")`, `Text("7")` and `Number(7.0)` all address the same row.
    pub fn key_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) | Value::Id(s) => s.clone(),
            Value::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
            Value::Number(n) => format!("{}", n),
            Value::DateTime(t) => t.format(TIME_FORMAT).to_string(),
            Value::Geometry(_) => String::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Number,
    DateTime,
    Geometry,
    Id,
}

/// An opaque geometry plus the spatial reference it is expressed in.
/// All geometry math (projection, intersection) lives behind the
/// SpatialEngine trait; this type just carries the payload between the
/// fetch collaborator, the crop cache, and the target store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Geometry {
    pub spatial_reference: i32,
    pub shape: serde_json::Value,
}

impl Geometry {
    pub fn new(spatial_reference: i32, shape: serde_json::Value) -> Self {
        Self {
            spatial_reference,
            shape,
        }
    }
}

/// Axis-aligned bounding box, the only geometry the remote query interface
/// accepts reliably as a filter.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct Envelope {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Envelope {
    pub fn intersects(&self, other: &Envelope) -> bool {
        self.xmin <= other.xmax
            && other.xmin <= self.xmax
            && self.ymin <= other.ymax
            && other.ymin <= self.ymax
    }
}

/// Case-insensitive field lookup. Target stores do not agree on field name
/// casing, so every name match in the engine goes through here.
pub fn get_field_ci<'a>(record: &'a Record, name: &str) -> Option<&'a Value> {
    record
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}
