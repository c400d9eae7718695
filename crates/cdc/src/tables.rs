// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Cached table metadata used to decode committed records.

use std::{
	collections::{BTreeSet, HashMap, HashSet},
	sync::Arc,
};

use parking_lot::RwLock;
use shardstream_core::{Error, Result, TableId, TableMetadata, interface::TableCatalog, key};
use shardstream_filter::{MatchKey, TableSet};
use tracing::debug;

/// Result of resolving a key against the cache.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Lookup {
	Found(TableMetadata),
	/// The root table is cached but none of its cached tables has this
	/// key layout: typically a child table nobody subscribed to.
	UnmatchedChild,
	UnknownRoot,
	/// The table was dropped while streaming all tables.
	Dropped,
	Corrupt,
}

struct Cached {
	meta: TableMetadata,
	matcher: MatchKey,
}

#[derive(Default)]
struct State {
	by_root: HashMap<TableId, Vec<Cached>>,
	/// Tables found dropped while streaming all tables; never reloaded.
	dropped: HashSet<TableId>,
	/// Tables being added. Some shards may already pass their records.
	staged: Vec<Cached>,
}

impl State {
	fn insert(&mut self, meta: TableMetadata) {
		self.staged.retain(|c| c.meta.id != meta.id);
		let tables = self.by_root.entry(meta.root_id).or_default();
		tables.retain(|c| c.meta.id != meta.id);
		tables.push(Cached {
			matcher: MatchKey::for_table(&meta),
			meta,
		});
	}

	fn remove(&mut self, id: TableId) -> Option<TableMetadata> {
		let mut removed = None;
		self.by_root.retain(|_, tables| {
			if let Some(idx) = tables.iter().position(|c| c.meta.id == id) {
				removed = Some(tables.remove(idx).meta);
			}
			!tables.is_empty()
		});
		removed
	}
}

pub(crate) struct TableCache {
	catalog: Arc<dyn TableCatalog>,
	wildcard: bool,
	state: RwLock<State>,
}

impl TableCache {
	/// Loads the subscribed tables, or every table when `tables` is `None`.
	pub fn load(catalog: Arc<dyn TableCatalog>, tables: Option<&BTreeSet<String>>) -> Result<Self> {
		let mut state = State::default();
		match tables {
			None => {
				for meta in catalog.tables()? {
					state.insert(meta);
				}
			}
			Some(names) => {
				for name in names {
					let meta = catalog.table(name)?.ok_or_else(|| Error::TableNotFound(name.clone()))?;
					state.insert(meta);
				}
			}
		}

		Ok(Self {
			catalog,
			wildcard: tables.is_none(),
			state: RwLock::new(state),
		})
	}

	pub fn catalog(&self) -> &Arc<dyn TableCatalog> {
		&self.catalog
	}

	pub fn lookup(&self, key: &[u8]) -> Lookup {
		let Some(root) = root_id(key) else {
			return Lookup::Corrupt;
		};

		let found = self.lookup_root(root, key);
		if self.wildcard && matches!(found, Lookup::UnknownRoot | Lookup::UnmatchedChild) {
			// tables created after the subscription started
			if self.reload().is_ok() {
				return self.lookup_root(root, key);
			}
		}
		found
	}

	fn lookup_root(&self, root: TableId, key: &[u8]) -> Lookup {
		let state = self.state.read();
		let found = match state.by_root.get(&root) {
			None if state.dropped.contains(&root) => return Lookup::Dropped,
			None => Lookup::UnknownRoot,
			Some(tables) => match tables.iter().find(|c| c.matcher.matches(key)) {
				Some(cached) => return Lookup::Found(cached.meta.clone()),
				None => Lookup::UnmatchedChild,
			},
		};
		match state.staged.iter().find(|c| c.meta.root_id == root && c.matcher.matches(key)) {
			Some(staged) => Lookup::Found(staged.meta.clone()),
			None => found,
		}
	}

	fn reload(&self) -> Result<()> {
		let tables = self.catalog.tables()?;
		let mut state = self.state.write();
		for meta in tables {
			if !state.dropped.contains(&meta.id) {
				state.insert(meta);
			}
		}
		Ok(())
	}

	pub fn insert(&self, meta: TableMetadata) {
		debug!(table = %meta.name, version = meta.version, "caching table");
		self.state.write().insert(meta);
	}

	/// Makes `meta` resolvable while its filter change is in flight, without
	/// caching it. [`TableCache::insert`] or [`TableCache::unstage`] ends it.
	pub fn stage(&self, meta: TableMetadata) {
		debug!(table = %meta.name, "staging table");
		let mut state = self.state.write();
		state.staged.retain(|c| c.meta.id != meta.id);
		state.staged.push(Cached {
			matcher: MatchKey::for_table(&meta),
			meta,
		});
	}

	pub fn unstage(&self, name: &str) -> Option<TableMetadata> {
		let mut state = self.state.write();
		let idx = state.staged.iter().position(|c| c.meta.name == name)?;
		Some(state.staged.remove(idx).meta)
	}

	pub fn remove(&self, name: &str) -> Option<TableMetadata> {
		let mut state = self.state.write();
		let id = state.by_root.values().flatten().find(|c| c.meta.name == name).map(|c| c.meta.id)?;
		state.remove(id)
	}

	/// Forgets a dropped table. When streaming all tables it is also kept
	/// out of later reloads.
	pub fn drop_table(&self, id: TableId) {
		let mut state = self.state.write();
		state.remove(id);
		if self.wildcard {
			state.dropped.insert(id);
		}
	}

	/// Filter table set matching the cached tables named in `subscribed`,
	/// or every table when `subscribed` is `None`.
	pub fn table_set(&self, subscribed: Option<&BTreeSet<String>>) -> TableSet {
		let Some(subscribed) = subscribed else {
			return TableSet::Wildcard;
		};
		let state = self.state.read();
		let tables: Vec<&TableMetadata> =
			state.by_root.values().flatten().map(|c| &c.meta).filter(|m| subscribed.contains(&m.name)).collect();
		TableSet::of(tables)
	}
}

fn root_id(key: &[u8]) -> Option<TableId> {
	let component = key::components(key).next()?;
	let raw = key::unescape(component).ok()?;
	let text = std::str::from_utf8(&raw).ok()?;
	text.parse().ok().map(TableId)
}
