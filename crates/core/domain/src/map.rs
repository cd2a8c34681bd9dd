//! 实体与 map 之间的显式转换辅助函数。
//!
//! 每个实体手写 `to_map` / `from_map`，缺失或类型不符的字段直接返回
//! [`ValidationError`]，不依赖运行时反射。

use crate::validation::ValidationError;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// 实体的 map 表示。
pub type EntityMap = Map<String, Value>;

pub fn required_str(map: &EntityMap, field: &'static str) -> Result<String, ValidationError> {
    match map.get(field) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(Value::Null) | None => Err(ValidationError::MissingField(field)),
        Some(_) => Err(ValidationError::TypeMismatch {
            field,
            expected: "string",
        }),
    }
}

pub fn optional_str(
    map: &EntityMap,
    field: &'static str,
) -> Result<Option<String>, ValidationError> {
    match map.get(field) {
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(ValidationError::TypeMismatch {
            field,
            expected: "string",
        }),
    }
}

pub fn str_or_default(map: &EntityMap, field: &'static str) -> Result<String, ValidationError> {
    Ok(optional_str(map, field)?.unwrap_or_default())
}

pub fn required_u64(map: &EntityMap, field: &'static str) -> Result<u64, ValidationError> {
    optional_u64(map, field)?.ok_or(ValidationError::MissingField(field))
}

pub fn optional_u64(map: &EntityMap, field: &'static str) -> Result<Option<u64>, ValidationError> {
    match map.get(field) {
        Some(Value::Null) | None => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or(ValidationError::TypeMismatch {
            field,
            expected: "unsigned integer",
        }),
    }
}

pub fn u64_or_default(map: &EntityMap, field: &'static str) -> Result<u64, ValidationError> {
    Ok(optional_u64(map, field)?.unwrap_or_default())
}

pub fn optional_i64(map: &EntityMap, field: &'static str) -> Result<Option<i64>, ValidationError> {
    match map.get(field) {
        Some(Value::Null) | None => Ok(None),
        Some(value) => value.as_i64().map(Some).ok_or(ValidationError::TypeMismatch {
            field,
            expected: "integer",
        }),
    }
}

pub fn i64_or_default(map: &EntityMap, field: &'static str) -> Result<i64, ValidationError> {
    Ok(optional_i64(map, field)?.unwrap_or_default())
}

pub fn f64_or_default(map: &EntityMap, field: &'static str) -> Result<f64, ValidationError> {
    match map.get(field) {
        Some(Value::Null) | None => Ok(0.0),
        Some(value) => value.as_f64().ok_or(ValidationError::TypeMismatch {
            field,
            expected: "number",
        }),
    }
}

pub fn bool_or_default(map: &EntityMap, field: &'static str) -> Result<bool, ValidationError> {
    match map.get(field) {
        Some(Value::Null) | None => Ok(false),
        Some(Value::Bool(value)) => Ok(*value),
        Some(_) => Err(ValidationError::TypeMismatch {
            field,
            expected: "bool",
        }),
    }
}

pub fn string_list(map: &EntityMap, field: &'static str) -> Result<Vec<String>, ValidationError> {
    match map.get(field) {
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or(ValidationError::TypeMismatch {
                        field,
                        expected: "string array",
                    })
            })
            .collect(),
        Some(_) => Err(ValidationError::TypeMismatch {
            field,
            expected: "string array",
        }),
    }
}

pub fn object(
    map: &EntityMap,
    field: &'static str,
) -> Result<BTreeMap<String, Value>, ValidationError> {
    match map.get(field) {
        Some(Value::Null) | None => Ok(BTreeMap::new()),
        Some(Value::Object(items)) => Ok(items
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()),
        Some(_) => Err(ValidationError::TypeMismatch {
            field,
            expected: "object",
        }),
    }
}

/// 字节数组以十六进制字符串存放在 map 中。
pub fn bytes_hex(map: &EntityMap, field: &'static str) -> Result<Vec<u8>, ValidationError> {
    let Some(text) = optional_str(map, field)? else {
        return Ok(Vec::new());
    };
    decode_hex(&text).ok_or(ValidationError::InvalidFormat { field, value: text })
}

pub fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

pub fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|idx| u8::from_str_radix(text.get(idx..idx + 2)?, 16).ok())
        .collect()
}

pub fn object_value(items: &BTreeMap<String, Value>) -> Value {
    Value::Object(
        items
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hex_roundtrip_is_exact() {
        let bytes = vec![0x44, 0x4E, 0x59, 0x00, 0xFF];
        assert_eq!(encode_hex(&bytes), "444E5900FF");
        assert_eq!(decode_hex("444E5900FF"), Some(bytes));
        assert_eq!(decode_hex("ABC"), None);
        assert_eq!(decode_hex("ZZ"), None);
    }

    #[test]
    fn typed_getters_report_field() {
        let mut map = EntityMap::new();
        map.insert("count".to_string(), json!("seven"));
        let err = required_u64(&map, "count").expect_err("type mismatch");
        assert_eq!(
            err,
            ValidationError::TypeMismatch {
                field: "count",
                expected: "unsigned integer"
            }
        );
        assert_eq!(
            required_str(&map, "missing").expect_err("missing"),
            ValidationError::MissingField("missing")
        );
    }
}
