//! App-wide configuration. Defaults are compiled in from config.yaml, then the
//! file named by `BIBSYNC_CONFIG_FILE` (if any) is merged over them, and
//! finally whatever runtime config the embedding app hands to `init()`.

use std::env;
use std::fs;
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde::ser::Serialize;

use crate::error::BResult;
use crate::util::json::{self, Value};

const DEFAULT_CONFIG: &'static str = include_str!("../config.yaml");

lazy_static! {
    /// create a static/global CONFIG var, and load it with our config data
    static ref CONFIG: RwLock<Value> = {
        match load_config() {
            Ok(x) => RwLock::new(x),
            Err(e) => {
                println!("bibsync: error loading config, using defaults: {}", e);
                RwLock::new(json::parse_yaml(DEFAULT_CONFIG).unwrap_or(Value::Null))
            }
        }
    };
}

/// load/parse our config file(s), and return the parsed JSON value
fn load_config() -> BResult<Value> {
    let mut data = json::parse_yaml(DEFAULT_CONFIG)?;
    if let Ok(path) = env::var("BIBSYNC_CONFIG_FILE") {
        let contents = fs::read_to_string(&path)?;
        let user_config = json::parse_yaml(&contents)?;
        json::merge(&mut data, &user_config);
    }
    Ok(data)
}

/// get a value from our config
pub fn get<T: DeserializeOwned>(keys: &[&str]) -> BResult<T> {
    let guard = lockr!(CONFIG);
    json::get(keys, &guard)
}

/// get a value from our config, or None if missing/malformed
pub fn get_opt<T: DeserializeOwned>(keys: &[&str]) -> Option<T> {
    let guard = lockr!(CONFIG);
    json::get_opt(keys, &guard)
}

/// Set a value into our heroic config
pub fn set<T: Serialize>(keys: &[&str], val: &T) -> BResult<()> {
    let mut guard = lockw!(CONFIG);
    json::set(keys, &mut guard, val)
}

/// Merge a whole tree of values over the current config
pub fn merge(data: &Value) -> BResult<()> {
    let mut guard = lockw!(CONFIG);
    json::merge(&mut guard, data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_defaults() {
        let endpoint: String = get(&["api", "endpoint"]).unwrap();
        assert!(endpoint.starts_with("https://"));
        let conflict: Vec<u64> = get(&["sync", "conflict_delays"]).unwrap();
        assert!(conflict.len() > 0);
        let nothing: Option<String> = get_opt(&["sync", "hoverboard"]);
        assert_eq!(nothing, None);
    }

    #[test]
    fn sets_and_merges() {
        set(&["testing", "config", "value"], &12).unwrap();
        assert_eq!(get::<i64>(&["testing", "config", "value"]).unwrap(), 12);
        merge(&json!({"testing": {"config": {"other": "yes"}}})).unwrap();
        assert_eq!(get::<i64>(&["testing", "config", "value"]).unwrap(), 12);
        assert_eq!(get::<String>(&["testing", "config", "other"]).unwrap(), "yes");
    }
}
