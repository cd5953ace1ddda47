//! Row-to-record conversion.
//!
//! A [`RowCodec`] is a pure function from a [`RawRow`] to a typed record. It
//! holds no mutable state, so one codec instance is shared across every
//! partition reader without synchronization, and a failed decode never
//! influences the next one.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde_json::{json, Map, Value};

use crate::error::{DecodeError, ScanError};
use crate::row::RawRow;
use crate::spec::ColumnSelector;

/// Converts raw store rows into consumer records.
pub trait RowCodec: Send + Sync + 'static {
    type Record: Send + 'static;

    fn decode(&self, row: &RawRow) -> Result<Self::Record, DecodeError>;
}

/// What a record reader does when a row fails to decode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DecodePolicy {
    /// Fail the whole partition on the first bad row.
    #[default]
    Abort,
    /// Log the bad row, count it, and continue.
    SkipAndLog,
}

/// Adapts a closure into a [`RowCodec`].
pub struct FnCodec<F> {
    f: F,
}

impl<F> FnCodec<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, T> RowCodec for FnCodec<F>
where
    F: Fn(&RawRow) -> Result<T, DecodeError> + Send + Sync + 'static,
    T: Send + 'static,
{
    type Record = T;

    fn decode(&self, row: &RawRow) -> Result<T, DecodeError> {
        (self.f)(row)
    }
}

/// Target type of a mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Utf8,
    Int64,
    Int32,
    Float64,
    Bool,
    Bytes,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Utf8 => "utf8",
            Self::Int64 => "int64",
            Self::Int32 => "int32",
            Self::Float64 => "float64",
            Self::Bool => "bool",
            Self::Bytes => "bytes",
        }
    }
}

impl FromStr for ValueKind {
    type Err = ScanError;

    fn from_str(raw: &str) -> Result<Self, ScanError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "utf8" | "string" | "text" => Ok(Self::Utf8),
            "int64" | "long" | "bigint" => Ok(Self::Int64),
            "int32" | "int" | "integer" => Ok(Self::Int32),
            "float64" | "double" => Ok(Self::Float64),
            "bool" | "boolean" => Ok(Self::Bool),
            "bytes" | "binary" => Ok(Self::Bytes),
            other => Err(ScanError::InvalidArgument(format!(
                "unknown column type '{other}'"
            ))),
        }
    }
}

/// How numeric and boolean values are laid out in cell bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    /// Fixed-width big-endian (`Bytes.toLong` style).
    #[default]
    Binary,
    /// UTF-8 text such as `"42"` or `"true"`.
    Text,
}

/// One decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Utf8(String),
    Int64(i64),
    Int32(i32),
    Float64(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Utf8(value) => json!(value),
            Self::Int64(value) => json!(value),
            Self::Int32(value) => json!(value),
            Self::Float64(value) => json!(value),
            Self::Bool(value) => json!(value),
            Self::Bytes(value) => json!(hex::encode(value)),
        }
    }
}

/// Record produced by [`ColumnMappingCodec`].
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRecord {
    pub row_key: Vec<u8>,
    pub fields: BTreeMap<String, FieldValue>,
}

impl TypedRecord {
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn to_json(&self) -> Value {
        let mut object = Map::new();
        object.insert(
            "row_key".to_string(),
            json!(String::from_utf8_lossy(&self.row_key)),
        );
        for (name, value) in &self.fields {
            object.insert(name.clone(), value.to_json());
        }
        Value::Object(object)
    }
}

/// Maps one `family:qualifier` column to a named, typed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub name: String,
    pub family: Vec<u8>,
    pub qualifier: Vec<u8>,
    pub kind: ValueKind,
    pub encoding: Option<Encoding>,
    pub required: bool,
}

impl ColumnMapping {
    pub fn required(
        name: impl Into<String>,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        kind: ValueKind,
    ) -> Self {
        Self {
            name: name.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            kind,
            encoding: None,
            required: true,
        }
    }

    pub fn optional(
        name: impl Into<String>,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        kind: ValueKind,
    ) -> Self {
        Self {
            required: false,
            ..Self::required(name, family, qualifier, kind)
        }
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    fn column_label(&self) -> String {
        format!(
            "{}:{}",
            String::from_utf8_lossy(&self.family),
            String::from_utf8_lossy(&self.qualifier)
        )
    }
}

impl FromStr for ColumnMapping {
    type Err = ScanError;

    /// Parses `family:qualifier[:type][?]`; a trailing `?` makes the column optional.
    fn from_str(raw: &str) -> Result<Self, ScanError> {
        let raw = raw.trim();
        let (raw, required) = match raw.strip_suffix('?') {
            Some(stripped) => (stripped, false),
            None => (raw, true),
        };
        let mut parts = raw.splitn(3, ':');
        let family = parts.next().unwrap_or_default();
        let qualifier = parts.next().unwrap_or_default();
        if family.is_empty() || qualifier.is_empty() {
            return Err(ScanError::InvalidArgument(format!(
                "invalid column mapping '{raw}', expected family:qualifier[:type]"
            )));
        }
        let kind = match parts.next() {
            Some(kind) => kind.parse()?,
            None => ValueKind::Utf8,
        };
        let mapping = ColumnMapping::required(qualifier, family.as_bytes(), qualifier.as_bytes(), kind);
        Ok(ColumnMapping {
            required,
            ..mapping
        })
    }
}

/// Schema-driven codec producing [`TypedRecord`]s.
#[derive(Debug, Clone)]
pub struct ColumnMappingCodec {
    columns: Vec<ColumnMapping>,
    encoding: Encoding,
}

impl ColumnMappingCodec {
    pub fn new(columns: Vec<ColumnMapping>) -> Self {
        Self {
            columns,
            encoding: Encoding::default(),
        }
    }

    /// Default encoding for columns without an explicit one.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn columns(&self) -> &[ColumnMapping] {
        &self.columns
    }

    /// Column filters covering exactly the mapped columns.
    pub fn column_selectors(&self) -> BTreeSet<ColumnSelector> {
        self.columns
            .iter()
            .map(|column| ColumnSelector::column(column.family.clone(), column.qualifier.clone()))
            .collect()
    }
}

impl RowCodec for ColumnMappingCodec {
    type Record = TypedRecord;

    fn decode(&self, row: &RawRow) -> Result<TypedRecord, DecodeError> {
        let mut fields = BTreeMap::new();
        for column in &self.columns {
            let value = match row.latest(&column.family, &column.qualifier) {
                Some(cell) => decode_value(
                    &row.row_key,
                    column,
                    column.encoding.unwrap_or(self.encoding),
                    &cell.value,
                )?,
                None if column.required => {
                    return Err(DecodeError::missing_column(
                        &row.row_key,
                        column.column_label(),
                    ));
                }
                None => FieldValue::Null,
            };
            fields.insert(column.name.clone(), value);
        }
        Ok(TypedRecord {
            row_key: row.row_key.clone(),
            fields,
        })
    }
}

fn decode_value(
    row_key: &[u8],
    column: &ColumnMapping,
    encoding: Encoding,
    bytes: &[u8],
) -> Result<FieldValue, DecodeError> {
    let invalid = |reason: String| {
        DecodeError::invalid_value(row_key, column.column_label(), column.kind.as_str(), reason)
    };

    match column.kind {
        ValueKind::Bytes => return Ok(FieldValue::Bytes(bytes.to_vec())),
        ValueKind::Utf8 => {
            return std::str::from_utf8(bytes)
                .map(|value| FieldValue::Utf8(value.to_string()))
                .map_err(|err| invalid(err.to_string()));
        }
        _ => {}
    }

    match encoding {
        Encoding::Binary => match column.kind {
            ValueKind::Int64 => fixed::<8>(bytes)
                .map(|raw| FieldValue::Int64(i64::from_be_bytes(raw)))
                .ok_or_else(|| invalid(format!("expected 8 bytes, found {}", bytes.len()))),
            ValueKind::Int32 => fixed::<4>(bytes)
                .map(|raw| FieldValue::Int32(i32::from_be_bytes(raw)))
                .ok_or_else(|| invalid(format!("expected 4 bytes, found {}", bytes.len()))),
            ValueKind::Float64 => fixed::<8>(bytes)
                .map(|raw| FieldValue::Float64(f64::from_be_bytes(raw)))
                .ok_or_else(|| invalid(format!("expected 8 bytes, found {}", bytes.len()))),
            ValueKind::Bool => fixed::<1>(bytes)
                .map(|raw| FieldValue::Bool(raw[0] != 0))
                .ok_or_else(|| invalid(format!("expected 1 byte, found {}", bytes.len()))),
            ValueKind::Utf8 | ValueKind::Bytes => unreachable!("handled above"),
        },
        Encoding::Text => {
            let text = std::str::from_utf8(bytes).map_err(|err| invalid(err.to_string()))?;
            let text = text.trim();
            match column.kind {
                ValueKind::Int64 => text
                    .parse::<i64>()
                    .map(FieldValue::Int64)
                    .map_err(|err| invalid(err.to_string())),
                ValueKind::Int32 => text
                    .parse::<i32>()
                    .map(FieldValue::Int32)
                    .map_err(|err| invalid(err.to_string())),
                ValueKind::Float64 => text
                    .parse::<f64>()
                    .map(FieldValue::Float64)
                    .map_err(|err| invalid(err.to_string())),
                ValueKind::Bool => text
                    .parse::<bool>()
                    .map(FieldValue::Bool)
                    .map_err(|err| invalid(err.to_string())),
                ValueKind::Utf8 | ValueKind::Bytes => unreachable!("handled above"),
            }
        }
    }
}

fn fixed<const N: usize>(bytes: &[u8]) -> Option<[u8; N]> {
    bytes.try_into().ok()
}

/// Codec that keeps every selected cell, keyed by `family:qualifier`.
///
/// Useful when no schema is known up front; values are rendered as UTF-8
/// when valid and hex otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawJsonCodec;

impl RowCodec for RawJsonCodec {
    type Record = Value;

    fn decode(&self, row: &RawRow) -> Result<Value, DecodeError> {
        let mut object = Map::new();
        object.insert(
            "row_key".to_string(),
            json!(String::from_utf8_lossy(&row.row_key)),
        );
        // Cells are sorted newest-first within a column, so the first wins.
        for cell in &row.cells {
            let label = format!(
                "{}:{}",
                String::from_utf8_lossy(&cell.family),
                String::from_utf8_lossy(&cell.qualifier)
            );
            object.entry(label).or_insert_with(|| match std::str::from_utf8(&cell.value) {
                Ok(text) => json!(text),
                Err(_) => json!(hex::encode(&cell.value)),
            });
        }
        Ok(Value::Object(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Cell;

    fn order_codec() -> ColumnMappingCodec {
        ColumnMappingCodec::new(vec![
            ColumnMapping::required("customer", "d", "customer", ValueKind::Utf8),
            ColumnMapping::required("total_cents", "d", "total", ValueKind::Int64),
            ColumnMapping::optional("paid", "d", "paid", ValueKind::Bool),
        ])
    }

    #[test]
    fn binary_columns_decode_into_typed_fields() {
        let row = RawRow::new(
            b"order-1".to_vec(),
            vec![
                Cell::new("d", "customer", 1, "ada"),
                Cell::new("d", "total", 1, 1299i64.to_be_bytes().to_vec()),
                Cell::new("d", "paid", 1, vec![1u8]),
            ],
        );
        let record = order_codec().decode(&row).expect("decode");
        assert_eq!(record.get("customer"), Some(&FieldValue::Utf8("ada".to_string())));
        assert_eq!(record.get("total_cents"), Some(&FieldValue::Int64(1299)));
        assert_eq!(record.get("paid"), Some(&FieldValue::Bool(true)));
        assert_eq!(record.to_json()["row_key"], json!("order-1"));
    }

    #[test]
    fn missing_optional_column_is_null() {
        let row = RawRow::new(
            b"order-2".to_vec(),
            vec![
                Cell::new("d", "customer", 1, "bob"),
                Cell::new("d", "total", 1, 5i64.to_be_bytes().to_vec()),
            ],
        );
        let record = order_codec().decode(&row).expect("decode");
        assert_eq!(record.get("paid"), Some(&FieldValue::Null));
    }

    #[test]
    fn failed_decode_does_not_affect_next_row() {
        let codec = order_codec();
        let bad = RawRow::new(
            b"order-3".to_vec(),
            vec![
                Cell::new("d", "customer", 1, "eve"),
                Cell::new("d", "total", 1, b"abc".to_vec()),
            ],
        );
        let missing = RawRow::new(b"order-4".to_vec(), vec![Cell::new("d", "customer", 1, "x")]);
        let good = RawRow::new(
            b"order-5".to_vec(),
            vec![
                Cell::new("d", "customer", 1, "sam"),
                Cell::new("d", "total", 1, 7i64.to_be_bytes().to_vec()),
            ],
        );

        assert!(matches!(
            codec.decode(&bad),
            Err(DecodeError::InvalidValue { expected: "int64", .. })
        ));
        assert!(matches!(
            codec.decode(&missing),
            Err(DecodeError::MissingColumn { ref column, .. }) if column == "d:total"
        ));
        let record = codec.decode(&good).expect("good row still decodes");
        assert_eq!(record.get("total_cents"), Some(&FieldValue::Int64(7)));
    }

    #[test]
    fn text_encoding_parses_numbers_and_newest_cell_wins() {
        let codec = ColumnMappingCodec::new(vec![ColumnMapping::required(
            "qty",
            "d",
            "qty",
            ValueKind::Int32,
        )])
        .with_encoding(Encoding::Text);
        let row = RawRow::new(
            b"r".to_vec(),
            vec![Cell::new("d", "qty", 1, " 3 "), Cell::new("d", "qty", 9, "12")],
        );
        let record = codec.decode(&row).expect("decode");
        assert_eq!(record.get("qty"), Some(&FieldValue::Int32(12)));
    }

    #[test]
    fn mapping_parser_accepts_types_and_optional_marker() {
        let mapping: ColumnMapping = "d:total:int64?".parse().expect("mapping");
        assert_eq!(mapping.name, "total");
        assert_eq!(mapping.kind, ValueKind::Int64);
        assert!(!mapping.required);

        let plain: ColumnMapping = "d:name".parse().expect("mapping");
        assert_eq!(plain.kind, ValueKind::Utf8);
        assert!(plain.required);

        assert!("d".parse::<ColumnMapping>().is_err());
        assert!("d:x:decimal".parse::<ColumnMapping>().is_err());
    }

    #[test]
    fn selectors_cover_mapped_columns() {
        let selectors = order_codec().column_selectors();
        assert_eq!(selectors.len(), 3);
        assert!(selectors.contains(&ColumnSelector::column("d", "total")));
    }

    #[test]
    fn closures_work_as_codecs() {
        let codec = FnCodec::new(|row: &RawRow| Ok::<usize, DecodeError>(row.cell_count()));
        let row = RawRow::new(b"k".to_vec(), vec![Cell::new("d", "a", 1, "v")]);
        assert_eq!(codec.decode(&row).expect("decode"), 1);
    }

    #[test]
    fn raw_json_codec_renders_latest_values() {
        let row = RawRow::new(
            b"k".to_vec(),
            vec![Cell::new("d", "a", 1, "old"), Cell::new("d", "a", 2, "new")],
        );
        let value = RawJsonCodec.decode(&row).expect("decode");
        assert_eq!(value["d:a"], json!("new"));
    }
}
