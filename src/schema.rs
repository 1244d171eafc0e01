//! Validation of remote object data against the known item schema. The engine
//! only talks to the `SchemaValidator` trait; callers with a real schema plug
//! in their own, the rest get `PermissiveSchema`.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::models::object::ObjectType;

quick_error! {
    #[derive(Debug, Clone, PartialEq)]
    pub enum SchemaError {
        UnknownField(key: String, field: String) {
            display("object {}: unknown field {}", key, field)
        }
        UnknownItemType(key: String, item_type: String) {
            display("object {}: unknown item type {}", key, item_type)
        }
        UnknownCondition(key: String, condition: String) {
            display("search {}: unknown condition {}", key, condition)
        }
        UnknownOperator(key: String, operator: String) {
            display("search {}: unknown operator {}", key, operator)
        }
    }
}

/// Checks one object's `data` block before it is stored locally.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, object: ObjectType, key: &str, data: &Value) -> Result<(), SchemaError>;
}

/// Accepts everything.
#[derive(Debug, Default, Clone)]
pub struct PermissiveSchema;

impl SchemaValidator for PermissiveSchema {
    fn validate(&self, _object: ObjectType, _key: &str, _data: &Value) -> Result<(), SchemaError> {
        Ok(())
    }
}

/// Fields every item may carry regardless of its type.
const COMMON_ITEM_FIELDS: &'static [&'static str] = &[
    "key", "version", "itemType", "parentItem", "collections", "tags",
    "relations", "deleted", "dateAdded", "dateModified", "note", "linkMode",
    "contentType", "charset", "filename", "md5", "mtime", "path", "url",
    "accessDate", "title",
];

/// A schema built from a map of item types to their allowed fields, plus the
/// search conditions and operators the client understands.
#[derive(Debug, Default, Clone)]
pub struct KnownFieldsSchema {
    item_types: HashMap<String, HashSet<String>>,
    conditions: HashSet<String>,
    operators: HashSet<String>,
}

impl KnownFieldsSchema {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register an item type and the fields (beyond the common ones) it allows.
    pub fn item_type(mut self, name: &str, fields: &[&str]) -> Self {
        let fields = fields.iter().map(|x| String::from(*x)).collect::<HashSet<_>>();
        self.item_types.insert(String::from(name), fields);
        self
    }

    pub fn conditions(mut self, conditions: &[&str]) -> Self {
        self.conditions.extend(conditions.iter().map(|x| String::from(*x)));
        self
    }

    pub fn operators(mut self, operators: &[&str]) -> Self {
        self.operators.extend(operators.iter().map(|x| String::from(*x)));
        self
    }

    fn validate_item(&self, key: &str, data: &Value) -> Result<(), SchemaError> {
        let item_type = data.get("itemType").and_then(|x| x.as_str()).unwrap_or("");
        let fields = match self.item_types.get(item_type) {
            Some(x) => x,
            None => return Err(SchemaError::UnknownItemType(String::from(key), String::from(item_type))),
        };
        if let Some(obj) = data.as_object() {
            for field in obj.keys() {
                if COMMON_ITEM_FIELDS.contains(&field.as_str()) { continue; }
                if !fields.contains(field) {
                    return Err(SchemaError::UnknownField(String::from(key), field.clone()));
                }
            }
        }
        Ok(())
    }

    fn validate_search(&self, key: &str, data: &Value) -> Result<(), SchemaError> {
        let conditions = match data.get("conditions").and_then(|x| x.as_array()) {
            Some(x) => x,
            None => return Ok(()),
        };
        for cond in conditions {
            let name = cond.get("condition").and_then(|x| x.as_str()).unwrap_or("");
            if !self.conditions.contains(name) {
                return Err(SchemaError::UnknownCondition(String::from(key), String::from(name)));
            }
            let op = cond.get("operator").and_then(|x| x.as_str()).unwrap_or("");
            if !self.operators.contains(op) {
                return Err(SchemaError::UnknownOperator(String::from(key), String::from(op)));
            }
        }
        Ok(())
    }
}

impl SchemaValidator for KnownFieldsSchema {
    fn validate(&self, object: ObjectType, key: &str, data: &Value) -> Result<(), SchemaError> {
        match object {
            ObjectType::Item | ObjectType::Trash => self.validate_item(key, data),
            ObjectType::Search => self.validate_search(key, data),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> KnownFieldsSchema {
        KnownFieldsSchema::new()
            .item_type("book", &["publisher", "ISBN"])
            .item_type("note", &[])
            .conditions(&["title", "tag"])
            .operators(&["is", "contains"])
    }

    #[test]
    fn accepts_known_items() {
        let data = json!({"itemType": "book", "title": "Dune", "publisher": "Chilton"});
        assert_eq!(schema().validate(ObjectType::Item, "AAAA1111", &data), Ok(()));
    }

    #[test]
    fn rejects_unknown_things() {
        let data = json!({"itemType": "book", "title": "Dune", "hoverboard": true});
        assert_eq!(
            schema().validate(ObjectType::Item, "AAAA1111", &data),
            Err(SchemaError::UnknownField(String::from("AAAA1111"), String::from("hoverboard")))
        );
        let data = json!({"itemType": "hologram"});
        match schema().validate(ObjectType::Trash, "BBBB", &data) {
            Err(SchemaError::UnknownItemType(_, t)) => assert_eq!(t, "hologram"),
            x => panic!("unexpected {:?}", x),
        }
        let data = json!({"name": "s", "conditions": [{"condition": "title", "operator": "resembles", "value": "x"}]});
        match schema().validate(ObjectType::Search, "CCCC", &data) {
            Err(SchemaError::UnknownOperator(_, op)) => assert_eq!(op, "resembles"),
            x => panic!("unexpected {:?}", x),
        }
    }
}
