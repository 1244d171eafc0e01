//! Key-path helpers over serde_json values, used by the config layer and when
//! picking fields out of remote responses.

pub use serde_json::Value;
use serde::de::DeserializeOwned;
use serde::ser::Serialize;

use crate::error::{BResult, BError};

/// Parse a YAML string into a JSON Value
pub fn parse_yaml(string: &str) -> BResult<Value> {
    let data: Value = serde_yaml::from_str(string)?;
    Ok(data)
}

/// Walk a JSON structure, given a key path. Traverses both objects and arrays,
/// returning a reference to the found value, if any.
pub fn walk<'a>(keys: &[&str], data: &'a Value) -> BResult<&'a Value> {
    if keys.len() == 0 { return Ok(data); }
    let key = keys[0];
    match *data {
        Value::Object(ref obj) => {
            match obj.get(key) {
                Some(d) => walk(&keys[1..], d),
                None => Err(BError::NotFound(format!("json: key {}", key))),
            }
        }
        Value::Array(ref arr) => {
            let ukey = match key.parse::<usize>() {
                Ok(x) => x,
                Err(..) => return Err(BError::BadValue(format!("json: invalid array index {}", key))),
            };
            match arr.get(ukey) {
                Some(d) => walk(&keys[1..], d),
                None => Err(BError::NotFound(format!("json: index {}", key))),
            }
        }
        _ => Err(BError::NotFound(format!("json: dead end at {}", key))),
    }
}

/// Like `walk` but creates intermediate objects as it goes.
fn walk_create<'a>(keys: &[&str], data: &'a mut Value) -> BResult<&'a mut Value> {
    if keys.len() == 0 { return Ok(data); }
    let key = keys[0];
    if data.is_null() {
        *data = json!({});
    }
    match *data {
        Value::Object(ref mut obj) => {
            let next = obj.entry(String::from(key)).or_insert(Value::Null);
            walk_create(&keys[1..], next)
        }
        _ => Err(BError::BadValue(format!("json: can't descend into non-object at {}", key))),
    }
}

/// Like `walk`, except that this returns the deserialized type instead of a
/// Value.
pub fn get<T: DeserializeOwned>(keys: &[&str], value: &Value) -> BResult<T> {
    let found = walk(keys, value)?;
    serde_json::from_value(found.clone())
        .map_err(|e| BError::BadValue(format!("json: get: {:?}: {}", keys, e)))
}

/// `get()`, with all errors turned into None.
pub fn get_opt<T: DeserializeOwned>(keys: &[&str], value: &Value) -> Option<T> {
    get(keys, value).ok()
}

/// Set a field into a mutable JSON Value, creating objects along the path.
pub fn set<T: Serialize>(keys: &[&str], container: &mut Value, to: &T) -> BResult<()> {
    if keys.len() == 0 {
        return Err(BError::BadValue(String::from("json: set: no keys given")));
    }
    let butlast = &keys[0..(keys.len() - 1)];
    let last = keys[keys.len() - 1];
    let val = walk_create(butlast, container)?;
    if val.is_null() {
        *val = json!({});
    }
    match *val {
        Value::Object(ref mut x) => {
            x.insert(String::from(last), serde_json::to_value(to)?);
            Ok(())
        }
        _ => Err(BError::BadValue(format!("json: set: can't set {} on a non-object", last))),
    }
}

/// Deep-merge `from` into `into`. Objects merge key by key, everything else
/// (arrays included) is replaced.
pub fn merge(into: &mut Value, from: &Value) {
    match (into, from) {
        (&mut Value::Object(ref mut into_obj), &Value::Object(ref from_obj)) => {
            for (key, val) in from_obj {
                merge(into_obj.entry(key.clone()).or_insert(Value::Null), val);
            }
        }
        (into, from) => {
            *into = from.clone();
        }
    }
}
