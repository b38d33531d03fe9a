//! Helpers for pulling values out of KDL nodes.

use kdl::{KdlNode, KdlValue};
use std::time::Duration;

use crate::{ConfigError, ConfigResult, parse_duration};

pub(crate) fn first_string_arg(node: &KdlNode) -> Option<String> {
    first_arg(node)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

pub(crate) fn all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
}

pub(crate) fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// Named string properties of a node, in source order.
pub(crate) fn string_props(node: &KdlNode) -> Vec<(String, String)> {
    node.entries()
        .iter()
        .filter_map(|e| {
            let name = e.name()?;
            let value = e.value().as_string()?;
            Some((name.value().to_string(), value.to_string()))
        })
        .collect()
}

/// Required single string argument, e.g. `repository "https://..."`.
pub(crate) fn required_string_arg(node: &KdlNode, field: &str) -> ConfigResult<String> {
    first_string_arg(node).ok_or_else(|| ConfigError::MissingField(field.to_string()))
}

/// A flag node: bare `privileged` or `privileged #true`.
pub(crate) fn flag(node: &KdlNode) -> ConfigResult<bool> {
    match first_arg(node) {
        None => Ok(true),
        Some(value) => value
            .as_bool()
            .ok_or_else(|| ConfigError::invalid(node.name().value(), "expected #true or #false")),
    }
}

pub(crate) fn u32_value(value: &KdlValue, field: &str) -> ConfigResult<u32> {
    value
        .as_integer()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| ConfigError::invalid(field, format!("expected a non-negative integer, got {}", value)))
}

pub(crate) fn u16_value(value: &KdlValue, field: &str) -> ConfigResult<u16> {
    value
        .as_integer()
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| ConfigError::invalid(field, format!("expected a port number, got {}", value)))
}

/// A duration written either as `"10m"` or as integer seconds.
pub(crate) fn duration_value(value: &KdlValue, field: &str) -> ConfigResult<Duration> {
    if let Some(s) = value.as_string() {
        return parse_duration(s).map_err(|_| {
            ConfigError::invalid(field, format!("expected e.g. \"30s\", \"10m\" or \"1h\", got \"{}\"", s))
        });
    }
    value
        .as_integer()
        .and_then(|n| u64::try_from(n).ok())
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::invalid(field, format!("expected a duration, got {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdl::KdlDocument;

    fn node(text: &str) -> KdlNode {
        let doc: KdlDocument = text.parse().unwrap();
        doc.nodes()[0].clone()
    }

    #[test]
    fn test_string_helpers() {
        let n = node(r#"output "vpc_id" "subnet_ids" region="eu-west-1""#);
        assert_eq!(first_string_arg(&n).as_deref(), Some("vpc_id"));
        assert_eq!(all_string_args(&n), vec!["vpc_id", "subnet_ids"]);
        assert_eq!(string_prop(&n, "region").as_deref(), Some("eu-west-1"));
        assert_eq!(
            string_props(&n),
            vec![("region".to_string(), "eu-west-1".to_string())]
        );
    }

    #[test]
    fn test_flag() {
        assert!(flag(&node("privileged")).unwrap());
        assert!(flag(&node("privileged #true")).unwrap());
        assert!(!flag(&node("privileged #false")).unwrap());
        assert!(flag(&node(r#"privileged "yes""#)).is_err());
    }

    #[test]
    fn test_numeric_values() {
        let n = node("capacity 2");
        assert_eq!(u32_value(first_arg(&n).unwrap(), "capacity").unwrap(), 2);

        let n = node("capacity -1");
        assert!(u32_value(first_arg(&n).unwrap(), "capacity").is_err());

        let n = node("port 70000");
        assert!(u16_value(first_arg(&n).unwrap(), "port").is_err());
    }

    #[test]
    fn test_duration_value() {
        let n = node(r#"timeout "10m""#);
        assert_eq!(
            duration_value(first_arg(&n).unwrap(), "timeout").unwrap(),
            Duration::from_secs(600)
        );

        let n = node("timeout 90");
        assert_eq!(
            duration_value(first_arg(&n).unwrap(), "timeout").unwrap(),
            Duration::from_secs(90)
        );

        let n = node(r#"timeout "soon""#);
        assert!(duration_value(first_arg(&n).unwrap(), "timeout").is_err());
    }
}
