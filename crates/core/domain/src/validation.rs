//! 实体字段校验
//!
//! 校验失败的实体在持久化之前即被拒绝，不会被部分应用。

/// 实体校验错误。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid format for {field}: {value}")]
    InvalidFormat { field: &'static str, value: String },
    #[error("{field} must be positive")]
    NotPositive { field: &'static str },
    #[error("{field} must not be negative: {value}")]
    Negative { field: &'static str, value: f64 },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("type mismatch for {field}: expected {expected}")]
    TypeMismatch {
        field: &'static str,
        expected: &'static str,
    },
}

/// 设备 ID：8 位十六进制字符。
pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::MissingField("device_id"));
    }
    if device_id.len() != 8 || !device_id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ValidationError::InvalidFormat {
            field: "device_id",
            value: device_id.to_string(),
        });
    }
    Ok(())
}

/// ICCID：`^89[0-9A-Fa-f]{18}$`。
pub fn validate_iccid(iccid: &str) -> Result<(), ValidationError> {
    if iccid.is_empty() {
        return Err(ValidationError::MissingField("iccid"));
    }
    let valid = iccid.len() == 20
        && iccid.starts_with("89")
        && iccid.bytes().all(|b| b.is_ascii_hexdigit());
    if !valid {
        return Err(ValidationError::InvalidFormat {
            field: "iccid",
            value: iccid.to_string(),
        });
    }
    Ok(())
}

/// 浮点字段必须为非负且有限值。
pub fn ensure_non_negative(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ValidationError::Negative { field, value });
    }
    Ok(())
}

/// 将设备 ID 规范化为大写形式。
pub fn canonical_device_id(device_id: &str) -> String {
    device_id.trim().to_ascii_uppercase()
}

/// 物理 ID 与设备 ID 之间的换算：设备 ID 即物理 ID 的 8 位十六进制表示。
pub fn device_id_from_physical(physical_id: u32) -> String {
    format!("{:08X}", physical_id)
}

pub fn physical_id_from_device_id(device_id: &str) -> Result<u32, ValidationError> {
    validate_device_id(device_id)?;
    u32::from_str_radix(device_id, 16).map_err(|_| ValidationError::InvalidFormat {
        field: "device_id",
        value: device_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_requires_eight_hex_chars() {
        assert!(validate_device_id("04A228CD").is_ok());
        assert!(validate_device_id("04a228cd").is_ok());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("04A228C").is_err());
        assert!(validate_device_id("04A228CG").is_err());
    }

    #[test]
    fn iccid_must_start_with_89() {
        assert!(validate_iccid("89860318123456789012").is_ok());
        assert!(validate_iccid("89860318ABCDEF789012").is_ok());
        assert!(validate_iccid("98860318123456789012").is_err());
        assert!(validate_iccid("8986031812345678901").is_err());
        assert!(validate_iccid("8986031812345678901Z").is_err());
    }

    #[test]
    fn physical_id_converts_both_ways() {
        let physical = physical_id_from_device_id("04A228CD").expect("physical");
        assert_eq!(physical, 0x04A2_28CD);
        assert_eq!(device_id_from_physical(physical), "04A228CD");
    }

    #[test]
    fn non_negative_rejects_nan() {
        assert!(ensure_non_negative("power", 0.0).is_ok());
        assert!(ensure_non_negative("power", -0.5).is_err());
        assert!(ensure_non_negative("power", f64::NAN).is_err());
    }
}
