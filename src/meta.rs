//! Metadata store and inline flow parser
//!
//! Each record optionally carries one single-line, flow-style mapping such
//! as `{source: user, tags: [medical, allergy], priority: 3}`. The store
//! keeps the raw string per slot; parsing happens on demand against the
//! arena's scratch region (the filter pass rewinds it afterwards).
//!
//! # `.meta` sidecar format
//!
//! ```text
//! i32 LE         count
//! per entry:     i32 LE length (0 = no metadata), length UTF-8 bytes
//! ```
//!
//! # Parsed form
//!
//! Values are a tagged sum instead of the source's untagged union:
//! bare tokens become [`MetaValue::Str`] or [`MetaValue::Int`], `[a, b]`
//! arrays become [`MetaValue::Array`] of bare tokens, and `{...}` submaps
//! are preserved verbatim as [`MetaValue::Submap`] for re-parse during
//! operator evaluation.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use crate::arena::{Arena, ArenaError, StrRef};
use crate::sidecar::{read_i32, read_lp_bytes, write_i32, write_lp_bytes};

#[derive(Error, Debug)]
pub enum MetaStoreError {
    #[error("metadata store is full (capacity {0})")]
    Full(usize),

    #[error("id {id} not found (count {count})")]
    NotFound { id: u64, count: usize },

    #[error("corrupt metadata sidecar: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tagged value of one metadata field.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Str(StrRef),
    Int(i64),
    /// Array of bare tokens, stored as strings.
    Array(Vec<StrRef>),
    /// Raw `{...}` text (braces included) kept for deferred re-parse.
    Submap(StrRef),
}

#[derive(Debug, Clone)]
pub struct MetaField {
    pub key: StrRef,
    pub value: MetaValue,
}

/// One parsed flow line: an ordered sequence of fields.
#[derive(Debug, Clone, Default)]
pub struct MetaRecord {
    pub fields: Vec<MetaField>,
}

impl MetaRecord {
    pub fn find<'a>(&'a self, arena: &Arena, key: &str) -> Option<&'a MetaValue> {
        self.fields
            .iter()
            .find(|f| arena.str_of(f.key) == key)
            .map(|f| &f.value)
    }
}

pub fn is_int_token(s: &str) -> bool {
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

const DELIMITERS: &[char] = &[',', ':', '{', '}', '[', ']', ' ', '\t'];

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.bump();
        }
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    /// Read a bare token (word / number / date / $op) up to a delimiter.
    fn read_token(&mut self) -> &'a str {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.peek() {
            if DELIMITERS.contains(&c) {
                break;
            }
            self.bump();
        }
        &self.input[start..self.pos]
    }

    /// Consume a balanced group (cursor on `open`) and return its full text
    /// including the delimiters. Unterminated groups take the rest of the
    /// input.
    fn read_balanced(&mut self, open: char, close: char) -> &'a str {
        let start = self.pos;
        let mut depth = 0usize;
        while let Some(c) = self.peek() {
            if c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    self.bump();
                    break;
                }
            }
            self.bump();
        }
        &self.input[start..self.pos]
    }
}

/// Parse one value: `[...]` array, or a bare token (integer or string).
/// The cursor must not be on `{` (submaps are handled by the field loop).
///
/// A bracketed value containing submaps (`$and: [{a: 1}, {b: 2}]`) is not
/// an array of bare tokens; its raw text is preserved whole so the logical
/// operators can re-parse each element as a nested filter.
fn parse_value(cursor: &mut Cursor, arena: &mut Arena) -> Result<MetaValue, ArenaError> {
    cursor.skip_ws();
    if cursor.peek() == Some('[') {
        let raw = cursor.read_balanced('[', ']');
        if raw.contains('{') {
            return Ok(MetaValue::Str(arena.push_str(raw)?));
        }
        let interior = raw.strip_prefix('[').unwrap_or(raw);
        let interior = interior.strip_suffix(']').unwrap_or(interior);
        let mut items = Vec::new();
        for piece in interior.split(',') {
            let token = piece.trim();
            if !token.is_empty() {
                items.push(arena.push_str(token)?);
            }
        }
        return Ok(MetaValue::Array(items));
    }

    let token = cursor.read_token();
    if is_int_token(token) {
        if let Ok(v) = token.parse::<i64>() {
            return Ok(MetaValue::Int(v));
        }
    }
    Ok(MetaValue::Str(arena.push_str(token)?))
}

/// Lenient parse of one flow line into a record. Optional outer braces are
/// stripped; anything unparseable is skipped rather than rejected.
pub fn parse_record(arena: &mut Arena, line: &str) -> Result<MetaRecord, ArenaError> {
    let mut record = MetaRecord::default();
    let mut cursor = Cursor::new(line);

    cursor.skip_ws();
    cursor.eat('{');

    loop {
        cursor.skip_ws();
        match cursor.peek() {
            None | Some('}') | Some(']') => break,
            _ => {}
        }

        let key_token = cursor.read_token();
        if key_token.is_empty() {
            // Not a key; skip the offending character.
            cursor.bump();
            continue;
        }
        let key = arena.push_str(key_token)?;

        cursor.skip_ws();
        cursor.eat(':');
        cursor.skip_ws();

        let value = if cursor.peek() == Some('{') {
            let raw = cursor.read_balanced('{', '}');
            MetaValue::Submap(arena.push_str(raw)?)
        } else {
            parse_value(&mut cursor, arena)?
        };
        record.fields.push(MetaField { key, value });

        cursor.skip_ws();
        cursor.eat(',');
    }

    Ok(record)
}

/// Parse the operand side of a `{$op: operand}` submap. Returns the
/// operator token and its value.
pub fn parse_submap(arena: &mut Arena, raw: &str) -> Result<Option<(StrRef, MetaValue)>, ArenaError> {
    let mut cursor = Cursor::new(raw);
    cursor.skip_ws();
    cursor.eat('{');
    cursor.skip_ws();

    let op = cursor.read_token();
    if op.is_empty() {
        return Ok(None);
    }
    let op = arena.push_str(op)?;

    cursor.skip_ws();
    cursor.eat(':');
    let value = parse_value(&mut cursor, arena)?;
    Ok(Some((op, value)))
}

pub struct MetaStore {
    /// Raw flow line per slot. `None` means the record was saved without
    /// metadata; such records never pass any filter.
    raw: Vec<Option<String>>,
    capacity: usize,
}

impl MetaStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            raw: Vec::new(),
            capacity,
        }
    }

    pub fn count(&self) -> usize {
        self.raw.len()
    }

    pub fn get(&self, id: u64) -> Option<&str> {
        self.raw.get(id as usize).and_then(|s| s.as_deref())
    }

    /// Raw lines in slot order; `None` for records saved without metadata.
    pub fn iter(&self) -> impl Iterator<Item = Option<&str>> + '_ {
        self.raw.iter().map(|s| s.as_deref())
    }

    /// Append a slot, empty when `line` is `None` or blank. Called in
    /// lockstep with the vector index so counts stay equal.
    pub fn add(&mut self, line: Option<&str>) -> Result<u64, MetaStoreError> {
        if self.raw.len() >= self.capacity {
            return Err(MetaStoreError::Full(self.capacity));
        }
        self.raw.push(normalize(line));
        Ok(self.raw.len() as u64 - 1)
    }

    pub fn set(&mut self, id: u64, line: Option<&str>) -> Result<(), MetaStoreError> {
        let slot = id as usize;
        if slot >= self.raw.len() {
            return Err(MetaStoreError::NotFound {
                id,
                count: self.raw.len(),
            });
        }
        self.raw[slot] = normalize(line);
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), MetaStoreError> {
        let file = File::create(path.as_ref())?;
        let mut w = BufWriter::new(file);
        write_i32(&mut w, self.raw.len() as i32)?;
        for entry in &self.raw {
            write_lp_bytes(&mut w, entry.as_deref().unwrap_or("").as_bytes())?;
        }
        w.flush()?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self, MetaStoreError> {
        let file = File::open(path.as_ref())?;
        let mut r = BufReader::new(file);
        let count = read_i32(&mut r)?;
        if count < 0 {
            return Err(MetaStoreError::Corrupt(format!("negative count {count}")));
        }

        let mut store = Self::new(capacity.max(count as usize));
        for i in 0..count {
            let bytes = read_lp_bytes(&mut r)?;
            let line = String::from_utf8(bytes)
                .map_err(|e| MetaStoreError::Corrupt(format!("entry {i} not UTF-8: {e}")))?;
            store.raw.push(normalize(Some(&line)));
        }
        Ok(store)
    }
}

fn normalize(line: Option<&str>) -> Option<String> {
    match line {
        Some(s) if !s.is_empty() => Some(s.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn parse(arena: &mut Arena, line: &str) -> MetaRecord {
        parse_record(arena, line).unwrap()
    }

    fn str_val<'a>(arena: &'a Arena, v: &MetaValue) -> &'a str {
        match v {
            MetaValue::Str(r) => arena.str_of(*r),
            _ => panic!("expected string, got {v:?}"),
        }
    }

    #[test]
    fn parses_bare_pairs_with_and_without_braces() {
        let mut arena = Arena::with_capacity(4096);
        for line in ["{source: user, priority: 3}", "source: user, priority: 3"] {
            let rec = parse(&mut arena, line);
            assert_eq!(rec.fields.len(), 2, "line: {line}");
            assert_eq!(str_val(&arena, rec.find(&arena, "source").unwrap()), "user");
            assert_eq!(rec.find(&arena, "priority"), Some(&MetaValue::Int(3)));
        }
    }

    #[test]
    fn integers_require_full_digit_tokens() {
        let mut arena = Arena::with_capacity(4096);
        let rec = parse(&mut arena, "a: 42, b: -7, c: 4x2, d: 2026-01-15, e: +");
        assert_eq!(rec.find(&arena, "a"), Some(&MetaValue::Int(42)));
        assert_eq!(rec.find(&arena, "b"), Some(&MetaValue::Int(-7)));
        assert_eq!(str_val(&arena, rec.find(&arena, "c").unwrap()), "4x2");
        // ISO dates stay strings and compare lexicographically later.
        assert_eq!(
            str_val(&arena, rec.find(&arena, "d").unwrap()),
            "2026-01-15"
        );
        assert_eq!(str_val(&arena, rec.find(&arena, "e").unwrap()), "+");
    }

    #[test]
    fn arrays_hold_bare_tokens() {
        let mut arena = Arena::with_capacity(4096);
        let rec = parse(&mut arena, "tags: [medical, allergy], source: chat");
        match rec.find(&arena, "tags").unwrap() {
            MetaValue::Array(items) => {
                let items: Vec<&str> = items.iter().map(|r| arena.str_of(*r)).collect();
                assert_eq!(items, vec!["medical", "allergy"]);
            }
            other => panic!("expected array, got {other:?}"),
        }
        assert_eq!(str_val(&arena, rec.find(&arena, "source").unwrap()), "chat");
    }

    #[test]
    fn submaps_are_preserved_verbatim() {
        let mut arena = Arena::with_capacity(4096);
        let rec = parse(&mut arena, "priority: {$gte: 2}, source: user");
        match rec.find(&arena, "priority").unwrap() {
            MetaValue::Submap(raw) => assert_eq!(arena.str_of(*raw), "{$gte: 2}"),
            other => panic!("expected submap, got {other:?}"),
        }
        assert_eq!(rec.fields.len(), 2);
    }

    #[test]
    fn logical_arrays_keep_raw_text() {
        let mut arena = Arena::with_capacity(4096);
        let rec = parse(&mut arena, "$and: [{a: {$gte: 1}}, {b: 2}]");
        assert_eq!(rec.fields.len(), 1);
        match rec.find(&arena, "$and").unwrap() {
            MetaValue::Str(raw) => {
                assert_eq!(arena.str_of(*raw), "[{a: {$gte: 1}}, {b: 2}]");
            }
            other => panic!("expected raw array text, got {other:?}"),
        }
    }

    #[test]
    fn nested_submaps_keep_balanced_text() {
        let mut arena = Arena::with_capacity(4096);
        let rec = parse(&mut arena, "cond: {outer: {inner: 1}}");
        match rec.find(&arena, "cond").unwrap() {
            MetaValue::Submap(raw) => assert_eq!(arena.str_of(*raw), "{outer: {inner: 1}}"),
            other => panic!("expected submap, got {other:?}"),
        }
    }

    #[test]
    fn parse_submap_extracts_first_op_pair() {
        let mut arena = Arena::with_capacity(4096);
        let (op, value) = parse_submap(&mut arena, "{$gte: 2026-01-01}")
            .unwrap()
            .unwrap();
        assert_eq!(arena.str_of(op), "$gte");
        match value {
            MetaValue::Str(r) => assert_eq!(arena.str_of(r), "2026-01-01"),
            other => panic!("expected string operand, got {other:?}"),
        }
    }

    #[test]
    fn empty_line_parses_to_empty_record() {
        let mut arena = Arena::with_capacity(4096);
        assert!(parse(&mut arena, "").fields.is_empty());
        assert!(parse(&mut arena, "{}").fields.is_empty());
        assert!(parse(&mut arena, "   ").fields.is_empty());
    }

    #[test]
    fn store_distinguishes_missing_from_present() {
        let mut store = MetaStore::new(8);
        store.add(Some("source: user")).unwrap();
        store.add(None).unwrap();
        store.add(Some("")).unwrap();
        assert_eq!(store.get(0), Some("source: user"));
        assert_eq!(store.get(1), None);
        // Blank metadata normalizes to missing.
        assert_eq!(store.get(2), None);
        assert_eq!(store.count(), 3);
    }

    #[test]
    fn sidecar_roundtrip_preserves_empty_slots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.meta");

        let mut store = MetaStore::new(8);
        store.add(Some("source: user, priority: 1")).unwrap();
        store.add(None).unwrap();
        store.add(Some("tags: [a, b]")).unwrap();
        store.save(&path).unwrap();

        let loaded = MetaStore::load(&path, 8).unwrap();
        assert_eq!(loaded.count(), 3);
        assert_eq!(loaded.get(0), Some("source: user, priority: 1"));
        assert_eq!(loaded.get(1), None);
        assert_eq!(loaded.get(2), Some("tags: [a, b]"));
    }

    #[test]
    fn set_overwrites_slot() {
        let mut store = MetaStore::new(4);
        store.add(Some("a: 1")).unwrap();
        store.set(0, Some("a: 2")).unwrap();
        assert_eq!(store.get(0), Some("a: 2"));
        store.set(0, None).unwrap();
        assert_eq!(store.get(0), None);
        assert!(matches!(
            store.set(9, None),
            Err(MetaStoreError::NotFound { .. })
        ));
    }
}
