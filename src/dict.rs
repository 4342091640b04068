//! The replicated document: one JSON tree behind a mutex, written under a
//! monotonic compare-and-swap counter.
//!
//! The root of the document is always a mapping. All operations are atomic
//! with respect to each other; mutations happen in place on the live tree
//! and every successful mutation bumps the CAS counter by exactly one.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Mutex;
use thiserror::Error;

use crate::pointer;

/// CAS value 0: "no check". Never a valid stored CAS.
pub const NULL_CAS: f64 = 0.0;

/// Application-level document errors.
///
/// The `Display` forms are the exact strings carried in the wire protocol's
/// `"err"` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DictError {
    /// Path fails to resolve, or the final segment is illegal for the
    /// operation (delete through a sequence, delete of the root).
    #[error("errorInvalidPath")]
    InvalidPath,
    /// Root replacement with a value that is not a mapping.
    #[error("errorInvalidType")]
    InvalidType,
    /// A non-zero CAS that does not equal the document's current CAS.
    #[error("errorInvalidCAS")]
    InvalidCas,
}

/// Thread-safe document store with path-addressed access.
pub struct Dict {
    inner: Mutex<Inner>,
}

struct Inner {
    root: Map<String, Value>,
    cas: f64,
}

/// Snapshot encoding: the root mapping plus the CAS counter. The field
/// names are persisted in snapshots and must stay stable.
#[derive(Serialize, Deserialize)]
struct Persisted {
    m: Map<String, Value>,
    #[serde(rename = "CAS")]
    cas: f64,
}

impl Default for Dict {
    fn default() -> Self {
        Self::new()
    }
}

impl Dict {
    /// Creates an empty document with CAS 1.
    pub fn new() -> Self {
        Self::with_root(Map::new())
    }

    /// Creates a document from an existing root mapping, CAS 1.
    pub fn with_root(root: Map<String, Value>) -> Self {
        Self {
            inner: Mutex::new(Inner { root, cas: 1.0 }),
        }
    }

    /// Creates a document from a JSON-encoded object, CAS 1.
    pub fn from_json(data: &[u8]) -> Result<Self, serde_json::Error> {
        let root: Map<String, Value> = serde_json::from_slice(data)?;
        Ok(Self::with_root(root))
    }

    /// Returns the current CAS.
    pub fn cas(&self) -> f64 {
        self.inner.lock().unwrap().cas
    }

    /// Reads the value at `path` together with the current CAS.
    pub fn get(&self, path: &str) -> Result<(Value, f64), DictError> {
        let segments = pointer::parse(path).ok_or(DictError::InvalidPath)?;
        let inner = self.inner.lock().unwrap();

        if segments.is_empty() {
            return Ok((Value::Object(inner.root.clone()), inner.cas));
        }
        let value = lookup(&inner.root, &segments).ok_or(DictError::InvalidPath)?;
        Ok((value.clone(), inner.cas))
    }

    /// Writes `value` at `path`, checking `cas` unless it is [`NULL_CAS`].
    ///
    /// The empty path replaces the whole root, which must then be a mapping.
    /// For any other path the parent container must already exist: a mapping
    /// parent assigns or overwrites the key, a sequence parent overwrites an
    /// in-bounds index. Returns the new CAS.
    pub fn set(&self, path: &str, value: Value, cas: f64) -> Result<f64, DictError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_cas(cas)?;

        if path.is_empty() {
            match value {
                Value::Object(m) => {
                    inner.root = m;
                    return Ok(inner.increment());
                }
                _ => return Err(DictError::InvalidType),
            }
        }

        let segments = pointer::parse(path).ok_or(DictError::InvalidPath)?;
        let (last, parents) = segments.split_last().expect("non-empty path");

        if parents.is_empty() {
            inner.root.insert(last.clone(), value);
            return Ok(inner.increment());
        }

        let parent = lookup_mut(&mut inner.root, parents).ok_or(DictError::InvalidPath)?;
        match parent {
            Value::Object(m) => {
                m.insert(last.clone(), value);
            }
            Value::Array(a) => {
                let idx: usize = last.parse().map_err(|_| DictError::InvalidPath)?;
                let slot = a.get_mut(idx).ok_or(DictError::InvalidPath)?;
                *slot = value;
            }
            _ => return Err(DictError::InvalidPath),
        }
        Ok(inner.increment())
    }

    /// Removes the field at `path`, checking `cas` unless it is [`NULL_CAS`].
    ///
    /// The parent of the target must be a mapping: sequence elements cannot
    /// be deleted, and neither can the root itself. Returns the new CAS.
    pub fn delete(&self, path: &str, cas: f64) -> Result<f64, DictError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check_cas(cas)?;

        if path.is_empty() {
            return Err(DictError::InvalidPath);
        }
        let segments = pointer::parse(path).ok_or(DictError::InvalidPath)?;
        let (last, parents) = segments.split_last().expect("non-empty path");

        if parents.is_empty() {
            inner.root.remove(last).ok_or(DictError::InvalidPath)?;
            return Ok(inner.increment());
        }

        let parent = lookup_mut(&mut inner.root, parents).ok_or(DictError::InvalidPath)?;
        match parent {
            Value::Object(m) => {
                m.remove(last).ok_or(DictError::InvalidPath)?;
            }
            _ => return Err(DictError::InvalidPath),
        }
        Ok(inner.increment())
    }

    /// Serializes the document and its CAS for the engine's snapshot hook.
    pub fn save(&self) -> Result<Vec<u8>, serde_json::Error> {
        let inner = self.inner.lock().unwrap();
        serde_json::to_vec(&Persisted {
            m: inner.root.clone(),
            cas: inner.cas,
        })
    }

    /// Replaces the document and CAS from snapshot bytes.
    pub fn recover(&self, data: &[u8]) -> Result<(), serde_json::Error> {
        let persisted: Persisted = serde_json::from_slice(data)?;
        let mut inner = self.inner.lock().unwrap();
        inner.root = persisted.m;
        inner.cas = persisted.cas;
        Ok(())
    }
}

impl Inner {
    fn check_cas(&self, cas: f64) -> Result<(), DictError> {
        if cas == NULL_CAS || cas == self.cas {
            Ok(())
        } else {
            Err(DictError::InvalidCas)
        }
    }

    fn increment(&mut self) -> f64 {
        self.cas += 1.0;
        self.cas
    }
}

fn lookup<'a>(root: &'a Map<String, Value>, segments: &[String]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    let mut current = root.get(first)?;
    for segment in rest {
        current = child(current, segment)?;
    }
    Some(current)
}

fn lookup_mut<'a>(root: &'a mut Map<String, Value>, segments: &[String]) -> Option<&'a mut Value> {
    let (first, rest) = segments.split_first()?;
    let mut current = root.get_mut(first)?;
    for segment in rest {
        current = child_mut(current, segment)?;
    }
    Some(current)
}

fn child<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(m) => m.get(segment),
        Value::Array(a) => a.get(segment.parse::<usize>().ok()?),
        _ => None,
    }
}

fn child_mut<'a>(value: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match value {
        Value::Object(m) => m.get_mut(segment),
        Value::Array(a) => a.get_mut(segment.parse::<usize>().ok()?),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Dict {
        Dict::from_json(
            br#"{"eyeColor": "blue", "age": 30, "friends": [{"name": "ada"}, {"name": "bob"}]}"#,
        )
        .unwrap()
    }

    #[test]
    fn fresh_dict_starts_at_cas_one() {
        assert_eq!(Dict::new().cas(), 1.0);
    }

    #[test]
    fn get_root_and_nested() {
        let d = sample();
        let (root, cas) = d.get("").unwrap();
        assert_eq!(cas, 1.0);
        assert_eq!(root["age"], json!(30));

        let (v, _) = d.get("/friends/1/name").unwrap();
        assert_eq!(v, json!("bob"));
    }

    #[test]
    fn get_missing_path_fails() {
        let d = sample();
        assert_eq!(d.get("/nope").unwrap_err(), DictError::InvalidPath);
        assert_eq!(d.get("/friends/7").unwrap_err(), DictError::InvalidPath);
        assert_eq!(d.get("/age/deeper").unwrap_err(), DictError::InvalidPath);
        assert_eq!(d.get("no-slash").unwrap_err(), DictError::InvalidPath);
    }

    #[test]
    fn set_and_read_back() {
        let d = sample();
        let next = d.set("/eyeColor", json!("brown"), 1.0).unwrap();
        assert_eq!(next, 2.0);
        let (v, cas) = d.get("/eyeColor").unwrap();
        assert_eq!(v, json!("brown"));
        assert_eq!(cas, 2.0);
    }

    #[test]
    fn set_new_key_on_mapping_parent() {
        let d = sample();
        d.set("/friends/0/city", json!("london"), NULL_CAS).unwrap();
        assert_eq!(d.get("/friends/0/city").unwrap().0, json!("london"));
    }

    #[test]
    fn set_sequence_slot_in_bounds_only() {
        let d = sample();
        d.set("/friends/1", json!({"name": "eve"}), NULL_CAS).unwrap();
        assert_eq!(d.get("/friends/1/name").unwrap().0, json!("eve"));

        // no append semantics
        assert_eq!(
            d.set("/friends/2", json!("x"), NULL_CAS).unwrap_err(),
            DictError::InvalidPath
        );
    }

    #[test]
    fn set_does_not_create_intermediate_containers() {
        let d = sample();
        assert_eq!(
            d.set("/missing/child", json!(1), NULL_CAS).unwrap_err(),
            DictError::InvalidPath
        );
    }

    #[test]
    fn root_replacement_requires_mapping() {
        let d = sample();
        let next = d.set("", json!({"k": "v"}), 1.0).unwrap();
        assert_eq!(d.get("").unwrap().0, json!({"k": "v"}));

        assert_eq!(
            d.set("", json!("not a mapping"), next).unwrap_err(),
            DictError::InvalidType
        );
        // the failed attempt did not consume a CAS
        assert_eq!(d.cas(), next);
    }

    #[test]
    fn empty_string_key_via_slash() {
        let d = Dict::new();
        d.set("/", json!(42), NULL_CAS).unwrap();
        assert_eq!(d.get("/").unwrap().0, json!(42));
    }

    #[test]
    fn cas_mismatch_rejected_and_state_unchanged() {
        let d = sample();
        let before = d.get("").unwrap().0;
        assert_eq!(
            d.set("/x", json!(1), 5.0).unwrap_err(),
            DictError::InvalidCas
        );
        assert_eq!(d.cas(), 1.0);
        assert_eq!(d.get("").unwrap().0, before);

        // matching CAS then succeeds
        assert_eq!(d.set("/x", json!(1), 1.0).unwrap(), 2.0);
    }

    #[test]
    fn null_cas_bypasses_check() {
        let d = sample();
        assert_eq!(d.set("/age", json!(31), NULL_CAS).unwrap(), 2.0);
        assert_eq!(d.delete("/age", NULL_CAS).unwrap(), 3.0);
    }

    #[test]
    fn cas_counts_successful_mutations() {
        let d = Dict::new();
        let mut cas = d.cas();
        for i in 0..10 {
            cas = d.set(&format!("/key{i}"), json!(i), cas).unwrap();
        }
        assert_eq!(cas, 11.0);
    }

    #[test]
    fn delete_removes_field() {
        let d = sample();
        let next = d.delete("/eyeColor", 1.0).unwrap();
        assert_eq!(next, 2.0);
        assert_eq!(d.get("/eyeColor").unwrap_err(), DictError::InvalidPath);
        assert_eq!(d.cas(), 2.0);
    }

    #[test]
    fn set_then_delete_then_get_fails() {
        let d = Dict::new();
        let c = d.set("/tmp", json!(true), 1.0).unwrap();
        d.delete("/tmp", c).unwrap();
        assert_eq!(d.get("/tmp").unwrap_err(), DictError::InvalidPath);
    }

    #[test]
    fn delete_root_is_rejected() {
        let d = sample();
        assert_eq!(d.delete("", NULL_CAS).unwrap_err(), DictError::InvalidPath);
        assert_eq!(d.cas(), 1.0);
    }

    #[test]
    fn delete_sequence_element_is_rejected() {
        let d = sample();
        assert_eq!(
            d.delete("/friends/0", NULL_CAS).unwrap_err(),
            DictError::InvalidPath
        );
    }

    #[test]
    fn delete_missing_key_is_rejected() {
        let d = sample();
        assert_eq!(
            d.delete("/nothing", NULL_CAS).unwrap_err(),
            DictError::InvalidPath
        );
    }

    #[test]
    fn save_recover_round_trip() {
        let d = sample();
        d.set("/balance", json!([1, 2]), NULL_CAS).unwrap();
        let expected = d.get("").unwrap().0;
        let data = d.save().unwrap();

        let fresh = Dict::new();
        fresh.recover(&data).unwrap();
        let (root, cas) = fresh.get("").unwrap();
        assert_eq!(root, expected);
        assert_eq!(cas, 2.0);
    }

    #[test]
    fn recover_rejects_garbage() {
        let d = Dict::new();
        assert!(d.recover(b"{not json").is_err());
    }
}
