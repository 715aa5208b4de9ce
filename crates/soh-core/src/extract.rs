use crate::CoreError;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

pub(crate) fn block_label(block: &hcl::Block, index: usize, what: &str) -> Result<String, CoreError> {
    block
        .labels
        .get(index)
        .map(|l| l.as_str().to_string())
        .ok_or_else(|| CoreError::InvalidExperiment(format!("Missing {what}")))
}

pub(crate) fn find_attr<'a>(block: &'a hcl::Block, key: &str) -> Option<&'a hcl::Expression> {
    block
        .body
        .attributes()
        .find(|a| a.key.as_str() == key)
        .map(|a| &a.expr)
}

pub(crate) fn extract_optional_attr_string(
    block: &hcl::Block,
    key: &str,
) -> Result<Option<String>, CoreError> {
    find_attr(block, key).map(extract_string).transpose()
}

pub(crate) fn extract_required_attr_string(
    block: &hcl::Block,
    key: &str,
) -> Result<String, CoreError> {
    extract_optional_attr_string(block, key)?.ok_or_else(|| {
        CoreError::InvalidExperiment(format!(
            "{} block missing required attribute '{key}'",
            block.identifier
        ))
    })
}

pub(crate) fn extract_string(expr: &hcl::Expression) -> Result<String, CoreError> {
    match expr {
        hcl::Expression::String(s) => Ok(s.clone()),
        hcl::Expression::TemplateExpr(t) => Ok(t.to_string().trim_matches('"').to_string()),
        _ => Err(CoreError::InvalidExperiment(format!(
            "Expected string, got {expr:?}"
        ))),
    }
}

/// Numbers are accepted wherever a string is expected (ports written as `80`).
pub(crate) fn extract_scalar_string(expr: &hcl::Expression) -> Result<String, CoreError> {
    match expr {
        hcl::Expression::Number(n) => Ok(n.to_string()),
        other => extract_string(other),
    }
}

pub(crate) fn extract_bool(expr: &hcl::Expression) -> Result<bool, CoreError> {
    match expr {
        hcl::Expression::Bool(b) => Ok(*b),
        _ => Err(CoreError::InvalidExperiment(format!(
            "Expected bool, got {expr:?}"
        ))),
    }
}

pub(crate) fn extract_u32(expr: &hcl::Expression) -> Result<u32, CoreError> {
    match expr {
        hcl::Expression::Number(n) => n
            .as_u64()
            .ok_or_else(|| CoreError::InvalidExperiment("Invalid number".into()))
            .and_then(|v| {
                u32::try_from(v).map_err(|_| CoreError::InvalidExperiment("Invalid number".into()))
            }),
        _ => Err(CoreError::InvalidExperiment(format!(
            "Expected number, got {expr:?}"
        ))),
    }
}

pub(crate) fn extract_u16(expr: &hcl::Expression) -> Result<u16, CoreError> {
    let value = extract_u32(expr)?;
    u16::try_from(value).map_err(|_| CoreError::InvalidExperiment("Invalid number".into()))
}

pub(crate) fn extract_u8(expr: &hcl::Expression) -> Result<u8, CoreError> {
    let value = extract_u32(expr)?;
    u8::try_from(value).map_err(|_| CoreError::InvalidExperiment("Invalid number".into()))
}

pub(crate) fn extract_string_array(expr: &hcl::Expression) -> Result<Vec<String>, CoreError> {
    match expr {
        hcl::Expression::Array(arr) => arr.iter().map(extract_scalar_string).collect(),
        _ => Err(CoreError::InvalidExperiment(format!(
            "Expected array, got {expr:?}"
        ))),
    }
}

/// Accept either a single string or a list of strings.
pub(crate) fn extract_string_or_array(expr: &hcl::Expression) -> Result<Vec<String>, CoreError> {
    match expr {
        hcl::Expression::Null => Ok(Vec::new()),
        hcl::Expression::Array(_) => extract_string_array(expr),
        other => extract_string(other).map(|s| vec![s]).map_err(|_| {
            CoreError::InvalidConfig("must be a string or a list of strings".into())
        }),
    }
}

pub(crate) fn extract_string_map(
    expr: &hcl::Expression,
) -> Result<HashMap<String, String>, CoreError> {
    match expr {
        hcl::Expression::Object(obj) => obj
            .iter()
            .map(|(k, v)| Ok((object_key(k), extract_scalar_string(v)?)))
            .collect(),
        _ => Err(CoreError::InvalidExperiment(format!(
            "Expected object, got {expr:?}"
        ))),
    }
}

/// `{ host = ["a", "b"] }` style maps used for per-host process and listener lists.
pub(crate) fn extract_string_list_map(
    expr: &hcl::Expression,
) -> Result<BTreeMap<String, Vec<String>>, CoreError> {
    match expr {
        hcl::Expression::Object(obj) => obj
            .iter()
            .map(|(k, v)| Ok((object_key(k), extract_string_or_array(v)?)))
            .collect(),
        _ => Err(CoreError::InvalidExperiment(format!(
            "Expected object, got {expr:?}"
        ))),
    }
}

pub(crate) fn extract_duration(expr: &hcl::Expression) -> Result<Duration, CoreError> {
    let raw = extract_string(expr)?;
    parse_duration(&raw)
}

pub(crate) fn parse_duration(raw: &str) -> Result<Duration, CoreError> {
    humantime::parse_duration(raw)
        .map_err(|e| CoreError::InvalidConfig(format!("parsing duration '{raw}': {e}")))
}

pub(crate) fn expr_to_json(expr: &hcl::Expression) -> Result<serde_json::Value, CoreError> {
    match expr {
        hcl::Expression::Null => Ok(serde_json::Value::Null),
        hcl::Expression::String(s) => Ok(serde_json::Value::String(s.clone())),
        hcl::Expression::TemplateExpr(_) => Ok(serde_json::Value::String(extract_string(expr)?)),
        hcl::Expression::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(serde_json::Value::Number(i.into()))
            } else if let Some(f) = n.as_f64() {
                Ok(serde_json::json!(f))
            } else {
                Ok(serde_json::Value::Null)
            }
        }
        hcl::Expression::Bool(b) => Ok(serde_json::Value::Bool(*b)),
        hcl::Expression::Array(arr) => {
            let values: Result<Vec<_>, _> = arr.iter().map(expr_to_json).collect();
            Ok(serde_json::Value::Array(values?))
        }
        hcl::Expression::Object(obj) => {
            let mut map = serde_json::Map::new();
            for (k, v) in obj {
                map.insert(object_key(k), expr_to_json(v)?);
            }
            Ok(serde_json::Value::Object(map))
        }
        _ => Ok(serde_json::Value::String(format!("{expr:?}"))),
    }
}

fn object_key(key: &hcl::ObjectKey) -> String {
    match key {
        hcl::ObjectKey::Identifier(id) => id.as_str().to_string(),
        hcl::ObjectKey::Expression(hcl::Expression::String(s)) => s.clone(),
        other => other.to_string().trim_matches('"').to_string(),
    }
}
