//! Common utilities shared between tool and prompt handlers

use std::{
    any::TypeId,
    collections::HashMap,
    sync::{Arc, PoisonError},
};

use schemars::{JsonSchema, generate::SchemaSettings};
use serde_json::Value;

use crate::model::JsonObject;

/// A shortcut for generating a JSON schema for a type.
pub fn schema_for_type<T: JsonSchema>() -> JsonObject {
    // explicitly to align json schema version to official specifications.
    let mut settings = SchemaSettings::draft2020_12();
    settings.transforms = vec![Box::new(schemars::transform::AddNullable::default())];
    let generator = settings.into_generator();
    let schema = generator.into_root_schema_for::<T>();
    match serde_json::to_value(schema) {
        Ok(Value::Object(object)) => object,
        other => {
            tracing::error!(
                r#type = std::any::type_name::<T>(),
                ?other,
                "schema serialization produced a non-object value"
            );
            JsonObject::default()
        }
    }
}

/// Call [`schema_for_type`] with a cache
pub fn cached_schema_for_type<T: JsonSchema + std::any::Any>() -> Arc<JsonObject> {
    thread_local! {
        static CACHE_FOR_TYPE: std::sync::RwLock<HashMap<TypeId, Arc<JsonObject>>> = Default::default();
    };
    CACHE_FOR_TYPE.with(|cache| {
        if let Some(x) = cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&TypeId::of::<T>())
        {
            return x.clone();
        }
        let schema = Arc::new(schema_for_type::<T>());
        cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(TypeId::of::<T>(), schema.clone());
        schema
    })
}

/// Check `value` against the subset of JSON schema that hand-written tool
/// schemas use: `type`, `required`, `properties`, `additionalProperties: false`,
/// `items` and `enum`.
pub fn validate_against_schema(schema: &JsonObject, value: &Value) -> Result<(), String> {
    validate_at("$", schema, value)
}

/// [`validate_against_schema`] for a tool's argument object.
pub fn validate_arguments(schema: &JsonObject, arguments: &JsonObject) -> Result<(), String> {
    if let Some(Value::String(t)) = schema.get("type") {
        if t != "object" {
            return Err(format!("$: expected {t}, found object"));
        }
    }
    validate_object("$", schema, arguments)
}

fn validate_at(path: &str, schema: &JsonObject, value: &Value) -> Result<(), String> {
    if let Some(expected) = schema.get("type") {
        let matches = match expected {
            Value::String(t) => type_matches(t, value),
            Value::Array(types) => types
                .iter()
                .filter_map(Value::as_str)
                .any(|t| type_matches(t, value)),
            _ => true,
        };
        if !matches {
            return Err(format!(
                "{path}: expected {expected}, found {}",
                type_name(value)
            ));
        }
    }
    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            return Err(format!("{path}: {value} is not one of {}", Value::from(allowed.clone())));
        }
    }
    match value {
        Value::Object(object) => validate_object(path, schema, object)?,
        Value::Array(items) => {
            if let Some(Value::Object(item_schema)) = schema.get("items") {
                for (index, item) in items.iter().enumerate() {
                    validate_at(&format!("{path}[{index}]"), item_schema, item)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn validate_object(path: &str, schema: &JsonObject, object: &JsonObject) -> Result<(), String> {
    if let Some(Value::Array(required)) = schema.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(name) {
                return Err(format!("{path}: missing required property `{name}`"));
            }
        }
    }
    let properties = schema.get("properties").and_then(Value::as_object);
    for (name, property) in object {
        match properties.and_then(|p| p.get(name)) {
            Some(Value::Object(property_schema)) => {
                validate_at(&format!("{path}.{name}"), property_schema, property)?
            }
            Some(_) => {}
            None if schema.get("additionalProperties") == Some(&Value::Bool(false)) => {
                return Err(format!("{path}: unexpected property `{name}`"));
            }
            None => {}
        }
    }
    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
