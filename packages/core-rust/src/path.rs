//! JSON path addressing and structural merge for record documents.
//!
//! Paths address nested slots in a record document with dotted or bracketed
//! segments (`"user.address[0].street"`). The write-side operations never
//! mutate their input: [`set`] and [`patch`] report their result through
//! [`Outcome`], and `Outcome::Unchanged` is the contract callers use for
//! cheap change detection -- a write that leaves the document structurally
//! identical produces no new tree and no outbound update.
//!
//! Tokenized paths are memoized in a process-wide bounded cache shared by
//! every record, so repeated subscriptions to the same path do not re-run
//! the tokenizer.

use std::sync::{Arc, OnceLock};

use quick_cache::sync::Cache;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

/// Upper bound on distinct memoized paths. Adversarial inputs past this
/// evict rather than grow.
const TOKEN_CACHE_CAPACITY: usize = 1024;

/// Error raised when a path descends through a primitive value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// A path token remained while the cursor was a string, number, or bool.
    #[error("path `{0}` descends through a primitive value")]
    InvalidPath(String),
}

/// A single parsed path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// An object key.
    Key(String),
    /// A non-negative integer literal, addressing an array element.
    Index(usize),
}

/// Result of a write-side path operation.
///
/// `Unchanged` means the operation would have produced a tree structurally
/// identical to the input; callers treat it as "no change" and skip
/// subscriber notification and update dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The document is structurally identical to the input; nothing to adopt.
    Unchanged,
    /// A new document value to adopt in place of the old one.
    Changed(Value),
}

impl Outcome {
    /// Returns `true` for [`Outcome::Unchanged`].
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Outcome::Unchanged)
    }
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Maximal runs of characters that are not '.', '[', ']', or whitespace.
    PATTERN.get_or_init(|| Regex::new(r"[^.\[\]\s]+").expect("token pattern is valid"))
}

fn token_cache() -> &'static Cache<String, Arc<Vec<Token>>> {
    static CACHE: OnceLock<Cache<String, Arc<Vec<Token>>>> = OnceLock::new();
    CACHE.get_or_init(|| Cache::new(TOKEN_CACHE_CAPACITY))
}

fn empty_object() -> &'static Value {
    static EMPTY: OnceLock<Value> = OnceLock::new();
    EMPTY.get_or_init(|| Value::Object(Map::new()))
}

/// Splits a path into tokens. An empty path yields no tokens (the root).
///
/// Results are memoized process-wide; the returned `Arc` is shared with the
/// cache entry.
#[must_use]
pub fn tokenize(path: &str) -> Arc<Vec<Token>> {
    if path.is_empty() {
        static ROOT: OnceLock<Arc<Vec<Token>>> = OnceLock::new();
        return Arc::clone(ROOT.get_or_init(|| Arc::new(Vec::new())));
    }
    if let Some(tokens) = token_cache().get(path) {
        return tokens;
    }
    let tokens: Vec<Token> = token_pattern()
        .find_iter(path)
        .map(|m| {
            let segment = m.as_str();
            match segment.parse::<usize>() {
                Ok(index) => Token::Index(index),
                Err(_) => Token::Key(segment.to_owned()),
            }
        })
        .collect();
    let tokens = Arc::new(tokens);
    token_cache().insert(path.to_owned(), Arc::clone(&tokens));
    tokens
}

/// Reads the value at `path`, or `None` when any step is absent.
///
/// A root read (`path` empty) returns the document itself, or a shared empty
/// object when the document is null so downstream walks stay safe.
///
/// # Errors
///
/// [`PathError::InvalidPath`] when a token remains while the cursor is a
/// primitive (string, number, or bool).
pub fn get<'a>(data: &'a Value, path: &str) -> Result<Option<&'a Value>, PathError> {
    let tokens = tokenize(path);
    if tokens.is_empty() {
        if data.is_null() {
            return Ok(Some(empty_object()));
        }
        return Ok(Some(data));
    }
    let mut cursor = data;
    for token in tokens.iter() {
        match cursor {
            Value::Null => return Ok(None),
            Value::Object(_) | Value::Array(_) => match step(cursor, token) {
                Some(next) => cursor = next,
                None => return Ok(None),
            },
            _ => return Err(PathError::InvalidPath(path.to_owned())),
        }
    }
    Ok(Some(cursor))
}

/// Writes `value` at `path`, producing a new document that reuses every
/// untouched subtree of `data`.
///
/// The target slot is merged via [`patch`], so a write whose merged subtree
/// equals the existing one reports [`Outcome::Unchanged`]. Missing
/// intermediates are created on the way down: an array when the next token
/// is an integer literal, an object otherwise. A root write (`path` empty)
/// is a whole-document [`patch`].
///
/// # Errors
///
/// [`PathError::InvalidPath`] when the path descends through a primitive,
/// or addresses an object key on an array.
pub fn set(data: &Value, path: &str, value: Value) -> Result<Outcome, PathError> {
    let tokens = tokenize(path);
    if tokens.is_empty() {
        return Ok(patch(data, value));
    }
    set_at(data, &tokens, 0, value, path)
}

/// Recursive structural merge of `new` over `old`.
///
/// Arrays merge elementwise and objects keywise; scalars and type
/// mismatches take `new` wholesale. The merge reports
/// [`Outcome::Unchanged`] exactly when the result would be structurally
/// identical to `old`, which is what makes change detection up the tree
/// O(subscribed paths) instead of O(document).
#[must_use]
pub fn patch(old: &Value, new: Value) -> Outcome {
    match (old, new) {
        (Value::Null, Value::Null) => Outcome::Unchanged,
        (Value::Null, new) => Outcome::Changed(new),
        (_, Value::Null) => Outcome::Changed(Value::Null),
        (Value::Array(old_items), Value::Array(new_items)) => {
            let mut changed = old_items.len() != new_items.len();
            let mut merged = Vec::with_capacity(new_items.len());
            for (index, item) in new_items.into_iter().enumerate() {
                match old_items.get(index) {
                    Some(old_item) => match patch(old_item, item) {
                        Outcome::Unchanged => merged.push(old_item.clone()),
                        Outcome::Changed(value) => {
                            changed = true;
                            merged.push(value);
                        }
                    },
                    None => {
                        changed = true;
                        merged.push(item);
                    }
                }
            }
            if changed {
                Outcome::Changed(Value::Array(merged))
            } else {
                Outcome::Unchanged
            }
        }
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut changed = old_map.len() != new_map.len()
                || old_map.keys().zip(new_map.keys()).any(|(a, b)| a != b);
            let mut merged = Map::new();
            for (key, value) in new_map {
                match old_map.get(&key) {
                    Some(old_value) => match patch(old_value, value) {
                        Outcome::Unchanged => {
                            merged.insert(key, old_value.clone());
                        }
                        Outcome::Changed(patched) => {
                            changed = true;
                            merged.insert(key, patched);
                        }
                    },
                    None => {
                        changed = true;
                        merged.insert(key, value);
                    }
                }
            }
            if changed {
                Outcome::Changed(Value::Object(merged))
            } else {
                Outcome::Unchanged
            }
        }
        (old, new) => {
            if *old == new {
                Outcome::Unchanged
            } else {
                Outcome::Changed(new)
            }
        }
    }
}

/// One step of a read walk. `None` for an absent slot.
fn step<'a>(value: &'a Value, token: &Token) -> Option<&'a Value> {
    match (value, token) {
        (Value::Object(map), Token::Key(key)) => map.get(key),
        // Integer literals address object keys by their decimal form, the
        // way `obj["0"]` and `obj[0]` coincide in loosely typed callers.
        (Value::Object(map), Token::Index(index)) => map.get(&index.to_string()),
        (Value::Array(items), Token::Index(index)) => items.get(*index),
        _ => None,
    }
}

fn set_at(
    current: &Value,
    tokens: &[Token],
    depth: usize,
    value: Value,
    path: &str,
) -> Result<Outcome, PathError> {
    let token = &tokens[depth];
    let last = depth + 1 == tokens.len();

    if matches!(
        current,
        Value::Bool(_) | Value::Number(_) | Value::String(_)
    ) {
        return Err(PathError::InvalidPath(path.to_owned()));
    }
    if matches!((current, token), (Value::Array(_), Token::Key(_))) {
        return Err(PathError::InvalidPath(path.to_owned()));
    }

    let existing = match current {
        Value::Object(_) | Value::Array(_) => step(current, token),
        _ => None,
    };

    let child = if last {
        match existing {
            Some(old) => patch(old, value),
            None => Outcome::Changed(value),
        }
    } else {
        match existing {
            Some(old) => set_at(old, tokens, depth + 1, value, path)?,
            None => {
                let scaffold = scaffold_for(&tokens[depth + 1]);
                match set_at(&scaffold, tokens, depth + 1, value, path)? {
                    Outcome::Changed(built) => Outcome::Changed(built),
                    // A fresh scaffold can only stay unchanged if the leaf
                    // write merged to nothing; adopt the scaffold itself.
                    Outcome::Unchanged => Outcome::Changed(scaffold),
                }
            }
        }
    };

    match child {
        Outcome::Unchanged => Ok(Outcome::Unchanged),
        Outcome::Changed(child) => Ok(Outcome::Changed(replace_slot(current, token, child))),
    }
}

/// Container to create for a missing intermediate, chosen by the next token.
fn scaffold_for(next: &Token) -> Value {
    match next {
        Token::Index(_) => Value::Array(Vec::new()),
        Token::Key(_) => Value::Object(Map::new()),
    }
}

/// Shallow-copies `current` with the slot at `token` replaced by `child`.
fn replace_slot(current: &Value, token: &Token, child: Value) -> Value {
    match (current, token) {
        (Value::Object(map), Token::Key(key)) => {
            let mut copy = map.clone();
            copy.insert(key.clone(), child);
            Value::Object(copy)
        }
        (Value::Object(map), Token::Index(index)) => {
            let mut copy = map.clone();
            copy.insert(index.to_string(), child);
            Value::Object(copy)
        }
        (Value::Array(items), Token::Index(index)) => {
            let mut copy = items.clone();
            if *index >= copy.len() {
                copy.resize(index + 1, Value::Null);
            }
            copy[*index] = child;
            Value::Array(copy)
        }
        // Null root or intermediate: materialize a fresh container.
        _ => {
            let mut fresh = scaffold_for(token);
            match (&mut fresh, token) {
                (Value::Object(map), Token::Key(key)) => {
                    map.insert(key.clone(), child);
                }
                (Value::Array(items), Token::Index(index)) => {
                    items.resize(index + 1, Value::Null);
                    items[*index] = child;
                }
                _ => {}
            }
            fresh
        }
    }
}
