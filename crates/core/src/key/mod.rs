// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2025 ReifyDB

//! Delimited key layout.
//!
//! A key is a sequence of components separated by [`DELIMITER`]. Component
//! bytes are escaped so the delimiter never appears inside a component:
//! `0x00` is written as `0x01 0x01` and `0x01` as `0x01 0x02`.
//!
//! Component 0 is always the root table id. A child table key continues with
//! the parent primary key components, then the child table id, then the
//! child's own key components.

use std::borrow::Cow;

use shardstream_type::{Error, Result};

pub const DELIMITER: u8 = 0x00;
const ESCAPE: u8 = 0x01;

/// Builds a delimited key one component at a time.
#[derive(Debug, Default, Clone)]
pub struct KeyBuilder {
	buf: Vec<u8>,
	components: usize,
}

impl KeyBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn component(mut self, bytes: impl AsRef<[u8]>) -> Self {
		self.push(bytes.as_ref());
		self
	}

	pub fn push(&mut self, bytes: &[u8]) {
		if self.components > 0 {
			self.buf.push(DELIMITER);
		}
		for &b in bytes {
			match b {
				DELIMITER => self.buf.extend_from_slice(&[ESCAPE, 0x01]),
				ESCAPE => self.buf.extend_from_slice(&[ESCAPE, 0x02]),
				other => self.buf.push(other),
			}
		}
		self.components += 1;
	}

	pub fn len(&self) -> usize {
		self.components
	}

	pub fn is_empty(&self) -> bool {
		self.components == 0
	}

	pub fn build(self) -> Vec<u8> {
		self.buf
	}
}

/// Iterates the escaped components of a key without copying.
///
/// Escaped components compare equal iff their unescaped bytes are equal, so
/// structural matching never needs to unescape.
pub struct Components<'a> {
	rest: Option<&'a [u8]>,
}

impl<'a> Iterator for Components<'a> {
	type Item = &'a [u8];

	fn next(&mut self) -> Option<Self::Item> {
		let rest = self.rest?;
		match rest.iter().position(|b| *b == DELIMITER) {
			Some(idx) => {
				self.rest = Some(&rest[idx + 1..]);
				Some(&rest[..idx])
			}
			None => {
				self.rest = None;
				Some(rest)
			}
		}
	}
}

pub fn components(key: &[u8]) -> Components<'_> {
	Components {
		rest: if key.is_empty() {
			None
		} else {
			Some(key)
		},
	}
}

pub fn component_count(key: &[u8]) -> usize {
	components(key).count()
}

/// Escapes raw component bytes so they can be compared against
/// [`components`] output.
pub fn escape(bytes: &[u8]) -> Cow<'_, [u8]> {
	if !bytes.iter().any(|b| *b == DELIMITER || *b == ESCAPE) {
		return Cow::Borrowed(bytes);
	}
	let mut builder = KeyBuilder::new();
	builder.push(bytes);
	Cow::Owned(builder.build())
}

pub fn unescape(component: &[u8]) -> Result<Cow<'_, [u8]>> {
	if !component.contains(&ESCAPE) {
		return Ok(Cow::Borrowed(component));
	}

	let mut out = Vec::with_capacity(component.len());
	let mut iter = component.iter();
	while let Some(&b) = iter.next() {
		if b != ESCAPE {
			out.push(b);
			continue;
		}
		match iter.next() {
			Some(0x01) => out.push(DELIMITER),
			Some(0x02) => out.push(ESCAPE),
			Some(other) => return Err(Error::codec(format!("invalid key escape sequence 0x01 0x{:02x}", other))),
			None => return Err(Error::codec("truncated key escape sequence")),
		}
	}
	Ok(Cow::Owned(out))
}

/// The first `count` components including their delimiters. Used to hash
/// the major path of a key.
pub fn prefix(key: &[u8], count: usize) -> &[u8] {
	if count == 0 {
		return &key[..0];
	}
	let mut seen = 0;
	for (idx, b) in key.iter().enumerate() {
		if *b == DELIMITER {
			seen += 1;
			if seen == count {
				return &key[..idx];
			}
		}
	}
	key
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_components_split_on_delimiter() {
		let key = KeyBuilder::new().component("T").component("C").component("k1").build();
		let parts: Vec<&[u8]> = components(&key).collect();
		assert_eq!(parts, vec![b"T".as_slice(), b"C".as_slice(), b"k1".as_slice()]);
	}

	#[test]
	fn test_escaped_delimiter_is_not_a_boundary() {
		let key = KeyBuilder::new().component("T").component([0x61u8, 0x00, 0x62]).build();
		assert_eq!(component_count(&key), 2);

		let second = components(&key).nth(1).unwrap();
		assert_eq!(&*unescape(second).unwrap(), &[0x61u8, 0x00, 0x62][..]);
	}

	#[test]
	fn test_escape_matches_component_bytes() {
		let raw = [0x01u8, 0x05];
		let key = KeyBuilder::new().component(raw).build();
		assert_eq!(components(&key).next().unwrap(), &*escape(&raw));
	}

	#[test]
	fn test_empty_key_has_no_components() {
		assert_eq!(component_count(&[]), 0);
	}

	#[test]
	fn test_empty_component_is_counted() {
		let key = KeyBuilder::new().component("T").component("").build();
		assert_eq!(component_count(&key), 2);
	}

	#[test]
	fn test_prefix() {
		let key = KeyBuilder::new().component("T").component("a").component("b").build();
		assert_eq!(prefix(&key, 2), b"T\x00a");
		assert_eq!(prefix(&key, 5), key.as_slice());
		assert_eq!(prefix(&key, 0), b"");
	}

	#[test]
	fn test_unescape_rejects_bad_sequence() {
		assert!(unescape(&[0x01, 0x09]).is_err());
		assert!(unescape(&[0x01]).is_err());
	}
}
