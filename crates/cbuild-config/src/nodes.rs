// Helper functions for extracting values from KDL nodes. Errors carry the
// dotted path of the offending field.

use kdl::{KdlNode, KdlValue};

use crate::{ConfigError, ConfigResult};

fn positional(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
}

pub(crate) fn first_arg<'a>(node: &'a KdlNode, path: &str) -> ConfigResult<&'a KdlValue> {
    positional(node)
        .next()
        .ok_or_else(|| ConfigError::MissingField(path.to_string()))
}

pub(crate) fn get_string(node: &KdlNode, path: &str) -> ConfigResult<String> {
    first_arg(node, path)?
        .as_string()
        .map(|s| s.to_string())
        .ok_or_else(|| ConfigError::invalid(path, "must be a string"))
}

/// All positional arguments, each a string.
pub(crate) fn get_strings(node: &KdlNode, path: &str) -> ConfigResult<Vec<String>> {
    positional(node)
        .enumerate()
        .map(|(i, v)| {
            v.as_string()
                .map(|s| s.to_string())
                .ok_or_else(|| ConfigError::invalid(format!("{}.{}", path, i), "must be a string"))
        })
        .collect()
}

pub(crate) fn get_integer(node: &KdlNode, path: &str) -> ConfigResult<i64> {
    first_arg(node, path)?
        .as_integer()
        .and_then(|i| i64::try_from(i).ok())
        .ok_or_else(|| ConfigError::invalid(path, "must be an integer"))
}

pub(crate) fn get_bool(node: &KdlNode, path: &str) -> ConfigResult<bool> {
    first_arg(node, path)?
        .as_bool()
        .ok_or_else(|| ConfigError::invalid(path, "must be a boolean"))
}

/// A node's children read as `NAME "value"` pairs.
pub(crate) fn get_string_map(
    node: &KdlNode,
    path: &str,
) -> ConfigResult<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let name = child.name().value().to_string();
            let value = get_string(child, &format!("{}.{}", path, name))?;
            pairs.push((name, value));
        }
    }
    Ok(pairs)
}

pub(crate) fn require_min_len(value: &str, min: usize, path: &str) -> ConfigResult<()> {
    if value.chars().count() < min {
        return Err(ConfigError::invalid(
            path,
            format!("must be at least {} characters", min),
        ));
    }
    Ok(())
}
