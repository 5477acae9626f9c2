//! Attribute Selectors
//!
//! Compiled form of a pool's `selector` block. Globs are compiled once at
//! startup so classification never fails at runtime.

use crate::config::{MatchExpression, MatchOperator, SelectorConfig};
use crate::domain::{attr, RawEvent};
use crate::error::{Error, Result};
use glob::Pattern;

/// Compiled attribute selector
#[derive(Debug, Clone)]
pub struct Selector {
    subsystem: Option<Pattern>,
    devpath_prefix: Option<String>,
    attributes: Vec<(String, Pattern)>,
    expressions: Vec<MatchExpression>,
}

impl Selector {
    /// Compile a selector, rejecting malformed globs and expressions
    pub fn compile(config: &SelectorConfig) -> Result<Self> {
        let subsystem = config.subsystem.as_deref().map(compile_pattern).transpose()?;

        let mut attributes = Vec::new();
        if let Some(vendor) = &config.vendor_id {
            attributes.push((attr::ID_VENDOR_ID.to_string(), compile_pattern(vendor)?));
        }
        if let Some(product) = &config.product_id {
            attributes.push((attr::ID_MODEL_ID.to_string(), compile_pattern(product)?));
        }
        for (key, pattern) in &config.attributes {
            attributes.push((key.clone(), compile_pattern(pattern)?));
        }

        for expr in &config.match_expressions {
            validate_expression(expr)?;
        }

        Ok(Self {
            subsystem,
            devpath_prefix: config.devpath_prefix.clone(),
            attributes,
            expressions: config.match_expressions.clone(),
        })
    }

    /// Whether every requirement holds for the event's attributes
    ///
    /// A missing attribute never satisfies a glob.
    pub fn matches(&self, event: &RawEvent) -> bool {
        if let Some(pattern) = &self.subsystem {
            match event.get(attr::SUBSYSTEM) {
                Some(value) if pattern.matches(value) => {}
                _ => return false,
            }
        }

        if let Some(prefix) = &self.devpath_prefix {
            match event.get(attr::DEVPATH) {
                Some(path) if path.starts_with(prefix.as_str()) => {}
                _ => return false,
            }
        }

        let globs = self.attributes.iter().all(|(key, pattern)| {
            event.get(key).map(|v| pattern.matches(v)).unwrap_or(false)
        });

        globs
            && self
                .expressions
                .iter()
                .all(|expr| expression_matches(expr, event.get(&expr.key)))
    }
}

fn compile_pattern(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern).map_err(|e| Error::Pattern {
        pattern: pattern.to_string(),
        reason: e.msg.to_string(),
    })
}

fn validate_expression(expr: &MatchExpression) -> Result<()> {
    match expr.operator {
        MatchOperator::In | MatchOperator::NotIn if expr.values.is_empty() => {
            Err(Error::Configuration(format!(
                "matchExpression on {:?}: {:?} requires values",
                expr.key, expr.operator
            )))
        }
        MatchOperator::Exists | MatchOperator::DoesNotExist if !expr.values.is_empty() => {
            Err(Error::Configuration(format!(
                "matchExpression on {:?}: {:?} takes no values",
                expr.key, expr.operator
            )))
        }
        _ => Ok(()),
    }
}

fn expression_matches(expr: &MatchExpression, value: Option<&str>) -> bool {
    match (expr.operator, value) {
        (MatchOperator::In, Some(v)) => expr.values.iter().any(|x| x == v),
        (MatchOperator::In, None) => false,
        (MatchOperator::NotIn, Some(v)) => !expr.values.iter().any(|x| x == v),
        (MatchOperator::NotIn, None) => true,
        (MatchOperator::Exists, value) => value.is_some(),
        (MatchOperator::DoesNotExist, value) => value.is_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Attributes, EventKind};
    use assert_matches::assert_matches;

    fn event(pairs: &[(&str, &str)]) -> RawEvent {
        let attributes: Attributes = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RawEvent::new(EventKind::Add, attributes)
    }

    fn expr(key: &str, operator: MatchOperator, values: &[&str]) -> MatchExpression {
        MatchExpression {
            key: key.into(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let selector = Selector::compile(&SelectorConfig::default()).unwrap();
        assert!(selector.matches(&event(&[])));
    }

    #[test]
    fn test_subsystem_glob_and_ids() {
        let selector = Selector::compile(&SelectorConfig {
            subsystem: Some("tty*".into()),
            vendor_id: Some("0403".into()),
            product_id: Some("60?1".into()),
            ..Default::default()
        })
        .unwrap();

        let ftdi = event(&[
            ("SUBSYSTEM", "tty"),
            ("ID_VENDOR_ID", "0403"),
            ("ID_MODEL_ID", "6001"),
        ]);
        assert!(selector.matches(&ftdi));

        let other = event(&[
            ("SUBSYSTEM", "tty"),
            ("ID_VENDOR_ID", "1a86"),
            ("ID_MODEL_ID", "6001"),
        ]);
        assert!(!selector.matches(&other));

        // Missing vendor id is fewer signals, not a match
        assert!(!selector.matches(&event(&[("SUBSYSTEM", "tty")])));
    }

    #[test]
    fn test_devpath_prefix() {
        let selector = Selector::compile(&SelectorConfig {
            devpath_prefix: Some("/devices/pci0000:00/0000:00:14.0/usb1/1-2".into()),
            ..Default::default()
        })
        .unwrap();

        assert!(selector.matches(&event(&[(
            "DEVPATH",
            "/devices/pci0000:00/0000:00:14.0/usb1/1-2/1-2:1.0/ttyUSB0/tty/ttyUSB0"
        )])));
        assert!(!selector.matches(&event(&[("DEVPATH", "/devices/platform/serial8250")])));
    }

    #[test]
    fn test_match_expressions() {
        let selector = Selector::compile(&SelectorConfig {
            match_expressions: vec![
                expr("ID_MODEL_ID", MatchOperator::In, &["9302", "089a"]),
                expr("DRIVER", MatchOperator::NotIn, &["usbhid"]),
                expr("ID_SERIAL", MatchOperator::Exists, &[]),
                expr("ID_FS_TYPE", MatchOperator::DoesNotExist, &[]),
            ],
            ..Default::default()
        })
        .unwrap();

        assert!(selector.matches(&event(&[("ID_MODEL_ID", "9302"), ("ID_SERIAL", "abc")])));
        assert!(!selector.matches(&event(&[("ID_MODEL_ID", "0001"), ("ID_SERIAL", "abc")])));
        assert!(!selector.matches(&event(&[
            ("ID_MODEL_ID", "9302"),
            ("ID_SERIAL", "abc"),
            ("DRIVER", "usbhid")
        ])));
        assert!(!selector.matches(&event(&[
            ("ID_MODEL_ID", "9302"),
            ("ID_SERIAL", "abc"),
            ("ID_FS_TYPE", "ext4")
        ])));
        // Empty value counts as absent
        assert!(!selector.matches(&event(&[("ID_MODEL_ID", "9302"), ("ID_SERIAL", "")])));
    }

    #[test]
    fn test_invalid_expressions_rejected() {
        let config = SelectorConfig {
            match_expressions: vec![expr("X", MatchOperator::In, &[])],
            ..Default::default()
        };
        assert_matches!(Selector::compile(&config), Err(Error::Configuration(_)));

        let config = SelectorConfig {
            match_expressions: vec![expr("X", MatchOperator::Exists, &["a"])],
            ..Default::default()
        };
        assert_matches!(Selector::compile(&config), Err(Error::Configuration(_)));
    }
}
