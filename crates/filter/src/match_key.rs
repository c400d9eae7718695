// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

use shardstream_core::{TableId, TableMetadata, key};

/// Structural matcher for the keys of one table.
///
/// A key matches when its component 0 is the root table id, its component
/// `skip` is the table id and exactly `key_count` components follow. Only
/// component boundaries are inspected, never the component contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey {
	root: Vec<u8>,
	table: Vec<u8>,
	key_count: usize,
	skip: usize,
}

impl MatchKey {
	pub fn new(root_table_id: TableId, table_id: TableId, key_count: usize, skip: usize) -> Self {
		Self::from_components(&root_table_id.to_component(), &table_id.to_component(), key_count, skip)
	}

	/// Matcher from raw (unescaped) root and table components.
	pub fn from_components(root: &[u8], table: &[u8], key_count: usize, skip: usize) -> Self {
		Self {
			root: key::escape(root).into_owned(),
			table: key::escape(table).into_owned(),
			key_count,
			skip,
		}
	}

	pub fn for_table(table: &TableMetadata) -> Self {
		Self::new(table.root_id, table.id, table.key_columns.len(), table.skip)
	}

	pub fn key_count(&self) -> usize {
		self.key_count
	}

	pub fn skip(&self) -> usize {
		self.skip
	}

	pub fn matches(&self, key: &[u8]) -> bool {
		let mut components = key::components(key);
		let Some(root) = components.next() else {
			return false;
		};
		if root != self.root.as_slice() {
			return false;
		}

		if self.skip == 0 {
			if root != self.table.as_slice() {
				return false;
			}
		} else {
			// components 1..skip are the parent's key path
			match components.nth(self.skip - 1) {
				Some(table) if table == self.table.as_slice() => {}
				_ => return false,
			}
		}

		components.count() == self.key_count
	}
}

#[cfg(test)]
mod tests {
	use shardstream_core::key::KeyBuilder;

	use super::*;

	fn key(parts: &[&str]) -> Vec<u8> {
		parts.iter().fold(KeyBuilder::new(), |b, p| b.component(p)).build()
	}

	#[test]
	fn test_child_match_is_exact() {
		let matcher = MatchKey::from_components(b"T", b"C", 2, 1);

		assert!(matcher.matches(&key(&["T", "C", "k1", "k2"])));
		assert!(!matcher.matches(&key(&["T", "C", "k1"])));
		assert!(!matcher.matches(&key(&["T", "C", "k1", "k2", "k3"])));
		assert!(!matcher.matches(&key(&["T", "D", "k1", "k2"])));
		assert!(!matcher.matches(&key(&["U", "C", "k1", "k2"])));
	}

	#[test]
	fn test_top_level_table() {
		let matcher = MatchKey::new(TableId(10), TableId(10), 1, 0);
		assert!(matcher.matches(&key(&["10", "u1"])));
		assert!(!matcher.matches(&key(&["10"])));
		assert!(!matcher.matches(&key(&["10", "u1", "11", "1"])));
	}

	#[test]
	fn test_parent_does_not_match_child_rows() {
		let parent = TableMetadata::top_level(TableId(10), "users").with_key(&["id"]);
		let child = TableMetadata::child_of(&parent, TableId(11), "users.emails").with_key(&["seq"]);

		let parent_row = parent.key::<&[u8], _>(&[], &["u1"]);
		let child_row = child.key(&["u1"], &["1"]);

		assert!(MatchKey::for_table(&parent).matches(&parent_row));
		assert!(!MatchKey::for_table(&parent).matches(&child_row));
		assert!(MatchKey::for_table(&child).matches(&child_row));
		assert!(!MatchKey::for_table(&child).matches(&parent_row));
	}

	#[test]
	fn test_key_component_containing_delimiter() {
		let matcher = MatchKey::from_components(b"T", b"T", 1, 0);
		let key = KeyBuilder::new().component("T").component([b'a', 0x00, b'b']).build();
		assert!(matcher.matches(&key));
	}

	#[test]
	fn test_empty_key_never_matches() {
		assert!(!MatchKey::from_components(b"T", b"T", 0, 0).matches(&[]));
	}
}
