// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Table metadata and row payload codec.
//!
//! A value payload is a big-endian `u32` schema version followed by the
//! postcard encoding of the row's value fields in column order.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use shardstream_type::TableId;

use crate::key;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
	Null,
	Bool(bool),
	Integer(i64),
	Float(f64),
	String(String),
	Binary(Vec<u8>),
}

impl FieldValue {
	fn from_key_component(bytes: Vec<u8>) -> Self {
		match String::from_utf8(bytes) {
			Ok(text) => FieldValue::String(text),
			Err(err) => FieldValue::Binary(err.into_bytes()),
		}
	}
}

impl Display for FieldValue {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			FieldValue::Null => f.write_str("null"),
			FieldValue::Bool(v) => Display::fmt(v, f),
			FieldValue::Integer(v) => Display::fmt(v, f),
			FieldValue::Float(v) => Display::fmt(v, f),
			FieldValue::String(v) => write!(f, "'{}'", v),
			FieldValue::Binary(v) => write!(f, "<{} bytes>", v.len()),
		}
	}
}

/// Catalog description of one table, as of `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
	pub id: TableId,
	pub name: String,
	/// Id of the top-level ancestor; equal to `id` for a top-level table.
	pub root_id: TableId,
	/// Index of this table's id component inside its keys.
	pub skip: usize,
	/// Columns of this table's own key components, after the table id.
	pub key_columns: Vec<String>,
	pub value_columns: Vec<String>,
	pub version: u32,
}

impl TableMetadata {
	pub fn top_level(id: TableId, name: impl Into<String>) -> Self {
		Self {
			id,
			name: name.into(),
			root_id: id,
			skip: 0,
			key_columns: Vec::new(),
			value_columns: Vec::new(),
			version: 1,
		}
	}

	pub fn child_of(parent: &TableMetadata, id: TableId, name: impl Into<String>) -> Self {
		Self {
			id,
			name: name.into(),
			root_id: parent.root_id,
			skip: parent.skip + 1 + parent.key_columns.len(),
			key_columns: Vec::new(),
			value_columns: Vec::new(),
			version: 1,
		}
	}

	pub fn with_key(mut self, columns: &[&str]) -> Self {
		self.key_columns = columns.iter().map(|c| c.to_string()).collect();
		self
	}

	pub fn with_values(mut self, columns: &[&str]) -> Self {
		self.value_columns = columns.iter().map(|c| c.to_string()).collect();
		self
	}

	pub fn with_version(mut self, version: u32) -> Self {
		self.version = version;
		self
	}

	pub fn is_top_level(&self) -> bool {
		self.id == self.root_id
	}

	/// Key for a row of this table. `parent_path` holds the components
	/// between the root id and this table's id.
	pub fn key<P, K>(&self, parent_path: &[P], key: &[K]) -> Vec<u8>
	where
		P: AsRef<[u8]>,
		K: AsRef<[u8]>,
	{
		let mut builder = key::KeyBuilder::new();
		if !self.is_top_level() {
			builder.push(&self.root_id.to_component());
			for component in parent_path {
				builder.push(component.as_ref());
			}
		}
		builder.push(&self.id.to_component());
		for component in key {
			builder.push(component.as_ref());
		}
		builder.build()
	}
}

/// A decoded row of a subscribed table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
	pub table: String,
	pub table_id: TableId,
	/// Raw components between the root id and the table id.
	pub parent_path: Vec<Vec<u8>>,
	pub key: Vec<(String, FieldValue)>,
	/// Empty for deletes.
	pub values: Vec<(String, FieldValue)>,
}

impl Row {
	pub fn value(&self, column: &str) -> Option<&FieldValue> {
		self.values.iter().find(|(name, _)| name == column).map(|(_, v)| v)
	}

	pub fn key_value(&self, column: &str) -> Option<&FieldValue> {
		self.key.iter().find(|(name, _)| name == column).map(|(_, v)| v)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
	/// The payload was written by a newer schema than the cached one.
	StaleSchema {
		found: u32,
		known: u32,
	},
	/// The key does not have this table's layout.
	KeyMismatch,
	Corrupt(String),
}

impl Display for DecodeError {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		match self {
			DecodeError::StaleSchema {
				found,
				known,
			} => write!(f, "row schema version {} is newer than cached version {}", found, known),
			DecodeError::KeyMismatch => f.write_str("key does not match the table layout"),
			DecodeError::Corrupt(msg) => write!(f, "corrupt row: {}", msg),
		}
	}
}

pub fn encode_values(version: u32, values: &[FieldValue]) -> Vec<u8> {
	let mut out = version.to_be_bytes().to_vec();
	// Vec<FieldValue> serialization into a Vec cannot fail
	let body = postcard::to_allocvec(values).unwrap_or_default();
	out.extend_from_slice(&body);
	out
}

pub fn payload_version(value: &[u8]) -> Option<u32> {
	let header: [u8; 4] = value.get(..4)?.try_into().ok()?;
	Some(u32::from_be_bytes(header))
}

pub fn decode_row(meta: &TableMetadata, key: &[u8], value: Option<&[u8]>) -> Result<Row, DecodeError> {
	let components: Vec<&[u8]> = key::components(key).collect();
	if components.len() != meta.skip + 1 + meta.key_columns.len() {
		return Err(DecodeError::KeyMismatch);
	}

	let mut parent_path = Vec::with_capacity(meta.skip.saturating_sub(1));
	for component in components.iter().take(meta.skip).skip(1) {
		parent_path.push(unescape(component)?);
	}

	let mut key_fields = Vec::with_capacity(meta.key_columns.len());
	for (column, component) in meta.key_columns.iter().zip(components.iter().skip(meta.skip + 1)) {
		key_fields.push((column.clone(), FieldValue::from_key_component(unescape(component)?)));
	}

	let values = match value {
		None => Vec::new(),
		Some(value) => decode_values(meta, value)?,
	};

	Ok(Row {
		table: meta.name.clone(),
		table_id: meta.id,
		parent_path,
		key: key_fields,
		values,
	})
}

fn decode_values(meta: &TableMetadata, value: &[u8]) -> Result<Vec<(String, FieldValue)>, DecodeError> {
	let version = payload_version(value).ok_or_else(|| DecodeError::Corrupt("missing schema version".into()))?;
	if version > meta.version {
		return Err(DecodeError::StaleSchema {
			found: version,
			known: meta.version,
		});
	}

	let fields: Vec<FieldValue> =
		postcard::from_bytes(&value[4..]).map_err(|e| DecodeError::Corrupt(e.to_string()))?;
	if fields.len() > meta.value_columns.len() {
		return Err(DecodeError::Corrupt(format!(
			"{} fields for {} columns",
			fields.len(),
			meta.value_columns.len()
		)));
	}

	// rows written before a column was added decode with nulls
	let mut fields = fields.into_iter();
	Ok(meta.value_columns.iter().map(|column| (column.clone(), fields.next().unwrap_or(FieldValue::Null))).collect())
}

fn unescape(component: &[u8]) -> Result<Vec<u8>, DecodeError> {
	key::unescape(component).map(|c| c.into_owned()).map_err(|e| DecodeError::Corrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn users() -> TableMetadata {
		TableMetadata::top_level(TableId(10), "users").with_key(&["id"]).with_values(&["name", "age"])
	}

	#[test]
	fn test_decode_top_level_row() {
		let meta = users();
		let key = meta.key::<&[u8], _>(&[], &["u1"]);
		let value = encode_values(1, &[FieldValue::String("ada".into()), FieldValue::Integer(36)]);

		let row = decode_row(&meta, &key, Some(value.as_slice())).unwrap();
		assert_eq!(row.table, "users");
		assert_eq!(row.key_value("id"), Some(&FieldValue::String("u1".into())));
		assert_eq!(row.value("age"), Some(&FieldValue::Integer(36)));
		assert!(row.parent_path.is_empty());
	}

	#[test]
	fn test_decode_child_row_keeps_parent_path() {
		let parent = users();
		let child = TableMetadata::child_of(&parent, TableId(11), "users.emails")
			.with_key(&["seq"])
			.with_values(&["address"]);
		assert_eq!(child.skip, 2);

		let key = child.key(&["u1"], &["1"]);
		let value = encode_values(1, &[FieldValue::String("a@b".into())]);
		let row = decode_row(&child, &key, Some(value.as_slice())).unwrap();
		assert_eq!(row.parent_path, vec![b"u1".to_vec()]);
		assert_eq!(row.key_value("seq"), Some(&FieldValue::String("1".into())));
	}

	#[test]
	fn test_newer_payload_is_stale_schema() {
		let meta = users();
		let key = meta.key::<&[u8], _>(&[], &["u1"]);
		let value = encode_values(2, &[FieldValue::Null]);
		assert_eq!(
			decode_row(&meta, &key, Some(value.as_slice())),
			Err(DecodeError::StaleSchema {
				found: 2,
				known: 1
			})
		);
	}

	#[test]
	fn test_older_payload_pads_added_columns() {
		let meta = users().with_version(2);
		let key = meta.key::<&[u8], _>(&[], &["u1"]);
		let value = encode_values(1, &[FieldValue::String("ada".into())]);
		let row = decode_row(&meta, &key, Some(value.as_slice())).unwrap();
		assert_eq!(row.value("age"), Some(&FieldValue::Null));
	}

	#[test]
	fn test_key_with_extra_components_is_mismatch() {
		let meta = users();
		let key = meta.key::<&[u8], _>(&[], &["u1", "extra"]);
		assert_eq!(decode_row(&meta, &key, None), Err(DecodeError::KeyMismatch));
	}

	#[test]
	fn test_truncated_payload_is_corrupt() {
		let meta = users();
		let key = meta.key::<&[u8], _>(&[], &["u1"]);
		assert!(matches!(decode_row(&meta, &key, Some(&[0u8, 0][..])), Err(DecodeError::Corrupt(_))));
	}

	#[test]
	fn test_delete_has_no_values() {
		let meta = users();
		let key = meta.key::<&[u8], _>(&[], &["u1"]);
		let row = decode_row(&meta, &key, None).unwrap();
		assert!(row.values.is_empty());
	}
}
