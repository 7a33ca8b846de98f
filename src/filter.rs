//! Metadata filter evaluation and bitmask production
//!
//! A filter expression is itself a flow line (`source: user`,
//! `priority: {$gte: 2}`, `$and: [{ts: {$gte: 2026-01-01}}, ...]`). Each
//! top-level field is one clause; clauses are implicitly ANDed.
//!
//! Operators inside a `{$op: operand}` submap:
//!
//! | Operator    | Semantics                                              |
//! |-------------|--------------------------------------------------------|
//! | `$gte/$lte` | ordered compare: integer when both sides are integers, |
//! |             | lexicographic otherwise (ISO-8601 dates sort correctly)|
//! | `$ne`       | negated equality                                       |
//! | `$prefix`   | string prefix, string fields only                      |
//! | `$contains` | membership, array fields only                          |
//!
//! A bare value is exact equality, with membership as the fallback for
//! array fields. `$and` / `$or` take an array of nested filters, preserved
//! as raw text by the parser and re-parsed here, element by element.
//!
//! The mask pass parses every record against the arena's scratch region and
//! rewinds the arena to its pre-pass high-water mark before returning, on
//! both the success and the error path.

use std::cmp::Ordering;

use thiserror::Error;

use crate::arena::{Arena, ArenaError};
use crate::meta::{is_int_token, parse_record, parse_submap, MetaRecord, MetaStore, MetaValue};

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("malformed filter expression: unterminated '{{' or '['")]
    Unterminated,

    #[error("filter scratch allocation failed: {0}")]
    Scratch(#[from] ArenaError),
}

/// Strict delimiter check applied to filter expressions only; record-side
/// parsing stays lenient.
fn check_balanced(expr: &str) -> Result<(), FilterError> {
    let mut braces = 0i32;
    let mut brackets = 0i32;
    for c in expr.chars() {
        match c {
            '{' => braces += 1,
            '}' => braces -= 1,
            '[' => brackets += 1,
            ']' => brackets -= 1,
            _ => {}
        }
        if braces < 0 || brackets < 0 {
            return Err(FilterError::Unterminated);
        }
    }
    if braces != 0 || brackets != 0 {
        return Err(FilterError::Unterminated);
    }
    Ok(())
}

/// Exact equality of a data value against an operand token.
fn value_eq(arena: &Arena, dval: &MetaValue, token: &str) -> bool {
    match dval {
        MetaValue::Int(i) => {
            is_int_token(token) && token.parse::<i64>().map(|t| *i == t).unwrap_or(false)
        }
        MetaValue::Str(r) => arena.str_of(*r) == token,
        MetaValue::Array(items) => items.iter().any(|r| arena.str_of(*r) == token),
        MetaValue::Submap(_) => false,
    }
}

/// Ordered compare of a data value against an operand token. Integer
/// compare when both sides are integers, lexicographic otherwise; arrays
/// and submaps do not order.
fn value_cmp(arena: &Arena, dval: &MetaValue, token: &str) -> Option<Ordering> {
    match dval {
        MetaValue::Int(i) => {
            if is_int_token(token) {
                let t = token.parse::<i64>().ok()?;
                Some(i.cmp(&t))
            } else {
                Some(i.to_string().as_str().cmp(token))
            }
        }
        MetaValue::Str(r) => Some(arena.str_of(*r).cmp(token)),
        MetaValue::Array(_) | MetaValue::Submap(_) => None,
    }
}

fn value_prefix(arena: &Arena, dval: &MetaValue, prefix: &str) -> bool {
    match dval {
        MetaValue::Str(r) => arena.str_of(*r).starts_with(prefix),
        _ => false,
    }
}

fn value_contains(arena: &Arena, dval: &MetaValue, elem: &str) -> bool {
    match dval {
        MetaValue::Array(items) => items.iter().any(|r| arena.str_of(*r) == elem),
        _ => false,
    }
}

/// The operand of an operator, flattened to its comparison token.
fn operand_token(arena: &Arena, operand: &MetaValue) -> Option<String> {
    match operand {
        MetaValue::Int(i) => Some(i.to_string()),
        MetaValue::Str(r) => Some(arena.str_of(*r).to_string()),
        MetaValue::Array(_) | MetaValue::Submap(_) => None,
    }
}

/// Evaluate one `field: condition` clause against a data record.
fn eval_condition(
    arena: &mut Arena,
    data: &MetaRecord,
    key: &str,
    fval: &MetaValue,
) -> Result<bool, FilterError> {
    let Some(dval) = data.find(arena, key) else {
        return Ok(false);
    };
    let dval = dval.clone();

    if let MetaValue::Submap(raw) = fval {
        let raw = arena.str_of(*raw).to_string();
        let Some((op, operand)) = parse_submap(arena, &raw)? else {
            return Ok(false);
        };
        let op = arena.str_of(op).to_string();
        let Some(token) = operand_token(arena, &operand) else {
            return Ok(false);
        };

        let pass = match op.as_str() {
            "$gte" => value_cmp(arena, &dval, &token)
                .map(Ordering::is_ge)
                .unwrap_or(false),
            "$lte" => value_cmp(arena, &dval, &token)
                .map(Ordering::is_le)
                .unwrap_or(false),
            "$ne" => !value_eq(arena, &dval, &token),
            "$prefix" => value_prefix(arena, &dval, &token),
            "$contains" => value_contains(arena, &dval, &token),
            other => {
                tracing::debug!(op = other, "unknown filter operator");
                false
            }
        };
        return Ok(pass);
    }

    // Bare value: exact equality (membership for arrays).
    let pass = match fval {
        MetaValue::Int(i) => value_eq(arena, &dval, &i.to_string()),
        MetaValue::Str(r) => {
            let token = arena.str_of(*r).to_string();
            value_eq(arena, &dval, &token)
        }
        MetaValue::Array(_) | MetaValue::Submap(_) => false,
    };
    Ok(pass)
}

/// Evaluate a `$and` / `$or` array: every element is a braced nested
/// filter. `$and` of zero elements passes; `$or` of zero elements fails.
fn eval_logical(
    arena: &mut Arena,
    data: &MetaRecord,
    raw_array: &str,
    is_or: bool,
) -> Result<bool, FilterError> {
    for inner in braced_elements(raw_array) {
        let sub = parse_record(arena, &inner)?;
        let pass = eval_filter(arena, data, &sub)?;
        if is_or && pass {
            return Ok(true);
        }
        if !is_or && !pass {
            return Ok(false);
        }
    }
    Ok(!is_or)
}

/// The interiors of the top-level `{...}` groups inside an array text.
fn braced_elements(raw_array: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in raw_array.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = i + 1;
                }
                depth += 1;
            }
            '}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        out.push(raw_array[start..i].to_string());
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Evaluate a parsed filter against a parsed data record. Top-level
/// clauses are implicitly ANDed.
pub fn eval_filter(
    arena: &mut Arena,
    data: &MetaRecord,
    filter: &MetaRecord,
) -> Result<bool, FilterError> {
    for field in &filter.fields {
        let key = arena.str_of(field.key).to_string();
        match key.as_str() {
            "$and" | "$or" => {
                let is_or = key == "$or";
                // The operand is raw text: `[...]` of nested filters, or a
                // single braced filter.
                if let MetaValue::Str(raw) | MetaValue::Submap(raw) = &field.value {
                    let raw = arena.str_of(*raw).to_string();
                    if !eval_logical(arena, data, &raw, is_or)? {
                        return Ok(false);
                    }
                }
            }
            _ => {
                if !eval_condition(arena, data, &key, &field.value)? {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

/// Produce the pre-filter mask for every record in the store.
///
/// Records without metadata get a zero bit. The arena's high-water mark is
/// restored before returning, pass or fail.
pub fn filter_mask(
    store: &MetaStore,
    arena: &mut Arena,
    expr: &str,
) -> Result<Vec<bool>, FilterError> {
    check_balanced(expr)?;

    let mark = arena.mark();
    let result = mask_pass(store, arena, expr);
    arena.rewind(mark);
    result
}

fn mask_pass(
    store: &MetaStore,
    arena: &mut Arena,
    expr: &str,
) -> Result<Vec<bool>, FilterError> {
    let filter = parse_record(arena, expr)?;
    let mut mask = Vec::with_capacity(store.count());

    for line in store.iter() {
        match line {
            None => mask.push(false),
            Some(line) => {
                let record = parse_record(arena, line)?;
                mask.push(eval_filter(arena, &record, &filter)?);
            }
        }
    }

    let selected = mask.iter().filter(|&&b| b).count();
    tracing::debug!(records = mask.len(), selected, "filter mask built");
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_of(lines: &[Option<&str>]) -> MetaStore {
        let mut store = MetaStore::new(lines.len().max(4));
        for line in lines {
            store.add(*line).unwrap();
        }
        store
    }

    fn mask(store: &MetaStore, expr: &str) -> Vec<bool> {
        let mut arena = Arena::with_capacity(1 << 20);
        filter_mask(store, &mut arena, expr).unwrap()
    }

    #[test]
    fn bare_equality_selects_matching_source() {
        let store = store_of(&[
            Some("source: user"),
            Some("source: chat"),
            Some("source: user"),
        ]);
        assert_eq!(mask(&store, "source: user"), vec![true, false, true]);
    }

    #[test]
    fn contains_matches_array_elements() {
        let store = store_of(&[
            Some("tags: [medical, allergy]"),
            Some("tags: [finance]"),
            Some("source: user"),
        ]);
        assert_eq!(
            mask(&store, "tags: {$contains: allergy}"),
            vec![true, false, false]
        );
    }

    #[test]
    fn bare_equality_falls_back_to_array_membership() {
        let store = store_of(&[Some("tags: [medical, allergy]"), Some("tags: [finance]")]);
        assert_eq!(mask(&store, "tags: allergy"), vec![true, false]);
    }

    #[test]
    fn gte_on_integers_is_numeric() {
        let store = store_of(&[Some("priority: 1"), Some("priority: 3")]);
        assert_eq!(mask(&store, "priority: {$gte: 2}"), vec![false, true]);
        // Lexicographic "1" >= "2" would be false too, but "10" shows the
        // difference.
        let store = store_of(&[Some("priority: 10")]);
        assert_eq!(mask(&store, "priority: {$gte: 2}"), vec![true]);
    }

    #[test]
    fn date_range_with_and_is_lexicographic() {
        let store = store_of(&[Some("ts: 2026-01-15"), Some("ts: 2026-02-15")]);
        let expr = "$and: [{ts: {$gte: 2026-01-01}}, {ts: {$lte: 2026-01-31}}]";
        assert_eq!(mask(&store, expr), vec![true, false]);
    }

    #[test]
    fn or_passes_when_any_branch_passes() {
        let store = store_of(&[
            Some("source: user"),
            Some("source: chat"),
            Some("source: import"),
        ]);
        let expr = "$or: [{source: user}, {source: chat}]";
        assert_eq!(mask(&store, expr), vec![true, true, false]);
    }

    #[test]
    fn ne_negates_equality() {
        let store = store_of(&[Some("source: user"), Some("source: chat")]);
        assert_eq!(mask(&store, "source: {$ne: chat}"), vec![true, false]);
    }

    #[test]
    fn prefix_applies_to_string_fields_only() {
        let store = store_of(&[
            Some("path: docs/notes"),
            Some("path: src/main"),
            Some("path: [docs, other]"),
        ]);
        assert_eq!(
            mask(&store, "path: {$prefix: docs}"),
            vec![true, false, false]
        );
    }

    #[test]
    fn unknown_operator_fails_the_clause() {
        let store = store_of(&[Some("priority: 3")]);
        assert_eq!(mask(&store, "priority: {$near: 3}"), vec![false]);
    }

    #[test]
    fn absent_field_fails_the_clause() {
        let store = store_of(&[Some("source: user")]);
        assert_eq!(mask(&store, "priority: {$gte: 0}"), vec![false]);
    }

    #[test]
    fn missing_metadata_never_matches() {
        let store = store_of(&[Some("source: user"), None, Some("")]);
        assert_eq!(mask(&store, "source: user"), vec![true, false, false]);
        // Even the empty filter skips metadata-less records.
        assert_eq!(mask(&store, ""), vec![true, false, false]);
    }

    #[test]
    fn conjunction_mask_is_subset_of_each_clause() {
        let store = store_of(&[
            Some("source: user, priority: 1"),
            Some("source: user, priority: 3"),
            Some("source: chat, priority: 3"),
            None,
        ]);
        let a = mask(&store, "source: user");
        let a_and_b = mask(&store, "source: user, priority: {$gte: 2}");
        for (conj, single) in a_and_b.iter().zip(&a) {
            assert!(!conj | single, "conjunction selected a record A did not");
        }
    }

    #[test]
    fn unterminated_expression_is_a_parse_error() {
        let store = store_of(&[Some("source: user")]);
        let mut arena = Arena::with_capacity(1 << 20);
        assert!(matches!(
            filter_mask(&store, &mut arena, "source: {$prefix: us"),
            Err(FilterError::Unterminated)
        ));
        assert!(matches!(
            filter_mask(&store, &mut arena, "$and: [{a: 1}"),
            Err(FilterError::Unterminated)
        ));
    }

    #[test]
    fn mask_pass_restores_arena_high_water_mark() {
        let store = store_of(&[
            Some("source: user, tags: [a, b, c], priority: 5"),
            Some("source: chat"),
        ]);
        let mut arena = Arena::with_capacity(1 << 20);
        arena.alloc_f32s(32).unwrap();
        let before = arena.used();

        filter_mask(&store, &mut arena, "source: user").unwrap();
        assert_eq!(arena.used(), before);

        // Error path rewinds too (exhaustion is hard to provoke here, but
        // the unterminated check happens before any allocation).
        let _ = filter_mask(&store, &mut arena, "a: {b");
        assert_eq!(arena.used(), before);
    }

    #[test]
    fn and_accepts_a_single_braced_filter() {
        let store = store_of(&[Some("priority: 3"), Some("priority: 1")]);
        assert_eq!(
            mask(&store, "$and: {priority: {$gte: 2}}"),
            vec![true, false]
        );
    }

    #[test]
    fn and_ignores_non_array_value_like_source() {
        // `$and: 3` has no array text; the clause is skipped.
        let store = store_of(&[Some("source: user")]);
        assert_eq!(mask(&store, "$and: 3, source: user"), vec![true]);
    }
}
