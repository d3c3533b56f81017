//! Range checking and coercion of inbound write values.
//!
//! Validation never fails: a rejected value is replaced by the last value the
//! device reported for the field, and the reason travels along as a
//! [`Rejection`] for logging.

use super::fields::{Counterpart, WritableField};
use crate::config::Bounds;
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    NotAnInteger(String),
    OutOfRange { value: i64, bounds: Bounds },
    AboveCounterpart { value: i64, field: &'static str, limit: i64 },
    BelowCounterpart { value: i64, field: &'static str, limit: i64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rejection::NotAnInteger(raw) => write!(f, "'{}' is not an integer", raw),
            Rejection::OutOfRange { value, bounds } => write!(
                f,
                "{} out of range [{}, {}]",
                value, bounds.min, bounds.max
            ),
            Rejection::AboveCounterpart { value, field, limit } => {
                write!(f, "{} bigger than {} {}", value, field, limit)
            }
            Rejection::BelowCounterpart { value, field, limit } => {
                write!(f, "{} lower than {} {}", value, field, limit)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    /// Always safe to send
    pub value: i64,
    pub rejection: Option<Rejection>,
}

impl Validation {
    pub fn is_accepted(&self) -> bool {
        self.rejection.is_none()
    }
}

/// Reads a remembered value as an integer, tolerating integral floats.
pub fn remembered_int(remembered: &Map<String, Value>, key: &str) -> Option<i64> {
    match remembered.get(key)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|v| v.fract() == 0.0).map(|v| v as i64)),
        Value::String(s) => coerce(s),
        _ => None,
    }
}

fn coerce(raw: &str) -> Option<i64> {
    let trimmed = raw.trim();
    if let Ok(value) = trimmed.parse::<i64>() {
        return Some(value);
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && v.fract() == 0.0)
        .map(|v| v as i64)
}

/// Validates `raw` for `field`.
///
/// The fallback is the remembered value of the field, or the lower bound when
/// the device never reported one.
pub fn validate(
    field: &WritableField,
    raw: &str,
    bounds: Bounds,
    remembered: &Map<String, Value>,
) -> Validation {
    let former = remembered_int(remembered, field.name).unwrap_or(bounds.min);
    let reject = |rejection| Validation {
        value: former,
        rejection: Some(rejection),
    };

    let Some(value) = coerce(raw) else {
        return reject(Rejection::NotAnInteger(raw.to_string()));
    };

    if !bounds.contains(value) {
        return reject(Rejection::OutOfRange { value, bounds });
    }

    match field.counterpart {
        Some(Counterpart::AtMost(other)) => {
            if let Some(limit) = remembered_int(remembered, other) {
                if value > limit {
                    return reject(Rejection::AboveCounterpart {
                        value,
                        field: other,
                        limit,
                    });
                }
            }
        }
        Some(Counterpart::AtLeast(other)) => {
            if let Some(limit) = remembered_int(remembered, other) {
                if value < limit {
                    return reject(Rejection::BelowCounterpart {
                        value,
                        field: other,
                        limit,
                    });
                }
            }
        }
        None => {}
    }

    Validation {
        value,
        rejection: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::fields::find;
    use crate::config::LimitConfig;
    use serde_json::json;

    fn injection() -> Map<String, Value> {
        json!({
            "user_minimum_injection": 100,
            "user_maximum_injection": 500,
            "user_minimum_battery_percentage": 10
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn check(name: &str, raw: &str) -> Validation {
        let field = find(name).unwrap();
        validate(field, raw, field.bounds(&LimitConfig::default()), &injection())
    }

    #[test]
    fn values_inside_bounds_pass_unchanged() {
        let field = find("user_minimum_battery_percentage").unwrap();
        let bounds = field.bounds(&LimitConfig::default());
        for value in bounds.min..=bounds.max {
            let result = validate(field, &value.to_string(), bounds, &injection());
            assert_eq!(result.value, value);
            assert!(result.is_accepted());
        }
    }

    #[test]
    fn values_outside_bounds_fall_back_to_remembered() {
        for raw in ["1", "0", "-5", "101", "100000"] {
            let result = check("user_minimum_battery_percentage", raw);
            assert_eq!(result.value, 10, "input {}", raw);
            assert!(matches!(result.rejection, Some(Rejection::OutOfRange { .. })));
        }
    }

    #[test]
    fn garbage_falls_back_to_remembered() {
        let result = check("user_minimum_injection", "lots");
        assert_eq!(result.value, 100);
        assert_eq!(result.rejection, Some(Rejection::NotAnInteger("lots".into())));
        assert_eq!(check("user_minimum_injection", "120.5").value, 100);
    }

    #[test]
    fn integral_float_payload_is_coerced() {
        let result = check("user_minimum_injection", " 250.0 ");
        assert_eq!(result.value, 250);
        assert!(result.is_accepted());
    }

    #[test]
    fn minimum_above_remembered_maximum_is_rejected() {
        let result = check("user_minimum_injection", "600");
        assert_eq!(result.value, 100);
        assert_eq!(
            result.rejection,
            Some(Rejection::AboveCounterpart {
                value: 600,
                field: "user_maximum_injection",
                limit: 500
            })
        );
    }

    #[test]
    fn maximum_below_remembered_minimum_is_rejected() {
        let result = check("user_maximum_injection", "50");
        assert_eq!(result.value, 500);
        assert!(matches!(
            result.rejection,
            Some(Rejection::BelowCounterpart { limit: 100, .. })
        ));
        assert_eq!(check("user_maximum_injection", "100").value, 100);
    }

    #[test]
    fn missing_memory_falls_back_to_lower_bound() {
        let field = find("set_time").unwrap();
        let bounds = field.bounds(&LimitConfig::default());
        let result = validate(field, "x", bounds, &Map::new());
        assert_eq!(result.value, bounds.min);
    }
}
