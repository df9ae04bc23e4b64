//! Composable capabilities for moveable devices.
//!
//! Each capability contributes a parameter list (merged into the device class
//! specs with [`merge_specs`](super::param::merge_specs)) and a trait with
//! default methods working on those parameters. A device class opts in by
//! adding the parameters and an empty `impl HasLimits for MyDevice {}`.

use super::param::{ParamSpec, ParamType};
use super::traits::Moveable;
use crate::error::{AppResult, IcsError};
use async_trait::async_trait;
use serde_json::{json, Value};

fn limits_of(value: Option<Value>) -> Option<(f64, f64)> {
    let value = value?;
    let pair = value.as_array()?;
    match (pair.first()?.as_f64(), pair.get(1)?.as_f64()) {
        (Some(low), Some(high)) => Some((low, high)),
        _ => None,
    }
}

// =============================================================================
// Limits
// =============================================================================

pub fn limits_params() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new("abslimits", ParamType::Limits)
            .description("Absolute limits of the device value")
            .mandatory()
            .category("limits"),
        ParamSpec::new("userlimits", ParamType::none_or(ParamType::Limits))
            .description("User defined limits, within the absolute limits")
            .settable()
            .category("limits"),
    ]
}

#[async_trait]
pub trait HasLimits: Moveable {
    fn abslimits(&self) -> (f64, f64) {
        limits_of(self.core().local("abslimits")).unwrap_or((f64::NEG_INFINITY, f64::INFINITY))
    }

    /// User limits, or the absolute limits if none are set.
    fn userlimits(&self) -> (f64, f64) {
        limits_of(self.core().local("userlimits")).unwrap_or_else(|| self.abslimits())
    }

    /// Fail with a limit error if `value` lies outside either limit pair.
    fn check_limits(&self, value: f64) -> AppResult<()> {
        let (abs_low, abs_high) = self.abslimits();
        let (low, high) = self.userlimits();
        let name = self.name();
        if value < abs_low || value > abs_high {
            return Err(IcsError::limit(
                name,
                format!("{} is outside the absolute limits [{}, {}]", value, abs_low, abs_high),
            ));
        }
        if value < low || value > high {
            return Err(IcsError::limit(
                name,
                format!("{} is outside the user limits [{}, {}]", value, low, high),
            ));
        }
        Ok(())
    }

    async fn set_userlimits(&self, low: f64, high: f64) -> AppResult<()> {
        let (abs_low, abs_high) = self.abslimits();
        if low < abs_low || high > abs_high {
            return Err(IcsError::limit(
                self.name(),
                format!("user limits must lie within [{}, {}]", abs_low, abs_high),
            ));
        }
        self.core().set_param("userlimits", json!([low, high])).await
    }
}

// =============================================================================
// Offset
// =============================================================================

pub fn offset_params() -> Vec<ParamSpec> {
    vec![ParamSpec::new("offset", ParamType::float())
        .description("Offset of the device zero to the hardware zero")
        .default(0.0)
        .unit("main")
        .settable()
        .category("offsets")]
}

#[async_trait]
pub trait HasOffset: Moveable {
    fn offset(&self) -> f64 {
        self.core().float("offset").unwrap_or(0.0)
    }

    fn to_user(&self, raw: f64) -> f64 {
        raw - self.offset()
    }

    fn to_raw(&self, user: f64) -> f64 {
        user + self.offset()
    }

    /// Change the offset so the current position reads as `new_value`.
    async fn adjust(&self, new_value: f64) -> AppResult<()> {
        let current = self
            .read(Some(0.0))
            .await?
            .as_f64()
            .ok_or_else(|| IcsError::invalid(self.name(), "current value is not a number"))?;
        let offset = self.offset() + current - new_value;
        tracing::info!(device = %self.name(), old = self.offset(), new = offset, "adjusting offset");
        self.core().set_param("offset", json!(offset)).await
    }
}

// =============================================================================
// Precision
// =============================================================================

pub fn precision_params() -> Vec<ParamSpec> {
    vec![ParamSpec::new("precision", ParamType::float_min(0.0))
        .description("Precision of the device value")
        .default(0.0)
        .unit("main")
        .settable()
        .prefer_cache(false)]
}

pub trait HasPrecision: Moveable {
    fn precision(&self) -> f64 {
        self.core().float("precision").unwrap_or(0.0)
    }

    fn is_at_target(&self, position: f64, target: f64) -> bool {
        (position - target).abs() <= self.precision()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_of() {
        assert_eq!(limits_of(Some(json!([-1.0, 2.0]))), Some((-1.0, 2.0)));
        assert_eq!(limits_of(Some(Value::Null)), None);
        assert_eq!(limits_of(None), None);
    }

    #[test]
    fn test_param_lists() {
        let limits = limits_params();
        assert!(limits.iter().any(|s| s.name == "abslimits" && s.mandatory));
        assert!(limits.iter().any(|s| s.name == "userlimits" && s.prefers_cache()));
        assert!(offset_params()[0].prefers_cache());
        assert!(!precision_params()[0].prefers_cache());
    }
}
