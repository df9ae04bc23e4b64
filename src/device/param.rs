//! Parameter specifications and typed parameter descriptors.
//!
//! Every device class declares its parameters once as a list of [`ParamSpec`]s.
//! Subclass lists are merged over their base lists with [`merge_specs`], a later
//! spec replacing an earlier one of the same name. Instances never reflect on
//! their parameters at runtime: code that needs a concrete Rust type goes
//! through a [`Parameter<T>`] descriptor, which carries the name (and with it
//! the cache key) and decodes/encodes through serde.
//!
//! # Example
//!
//! ```rust,ignore
//! pub const SPEED: Parameter<f64> = Parameter::new("speed");
//!
//! let spec = ParamSpec::new("speed", ParamType::float_min(0.0))
//!     .description("Motor speed")
//!     .unit("main/s")
//!     .settable()
//!     .volatile();
//!
//! let speed = SPEED.get(device.core()).await?;
//! SPEED.set(device.core(), speed * 2.0).await?;
//! ```

use super::core::DeviceCore;
use crate::error::{AppResult, IcsError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

// =============================================================================
// Validators
// =============================================================================

/// Custom validation: returns the normalised value or a message.
pub type CustomValidator = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// Value type and constraint of a parameter.
#[derive(Clone)]
pub enum ParamType {
    Any,
    Float { min: Option<f64>, max: Option<f64> },
    Int { min: Option<i64>, max: Option<i64> },
    Bool,
    Str,
    /// One of a fixed set of values.
    OneOf(Vec<Value>),
    /// `[low, high]` with `low <= high`.
    Limits,
    ListOf(Box<ParamType>),
    /// `null` or a value of the inner type.
    NoneOr(Box<ParamType>),
    Custom(CustomValidator),
}

impl fmt::Debug for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Any => write!(f, "any"),
            ParamType::Float { min, max } => write!(f, "float({:?}..{:?})", min, max),
            ParamType::Int { min, max } => write!(f, "int({:?}..{:?})", min, max),
            ParamType::Bool => write!(f, "bool"),
            ParamType::Str => write!(f, "str"),
            ParamType::OneOf(values) => write!(f, "oneof{:?}", values),
            ParamType::Limits => write!(f, "limits"),
            ParamType::ListOf(inner) => write!(f, "listof({:?})", inner),
            ParamType::NoneOr(inner) => write!(f, "none_or({:?})", inner),
            ParamType::Custom(_) => write!(f, "custom(<function>)"),
        }
    }
}

impl ParamType {
    pub fn float() -> Self {
        ParamType::Float {
            min: None,
            max: None,
        }
    }

    pub fn float_min(min: f64) -> Self {
        ParamType::Float {
            min: Some(min),
            max: None,
        }
    }

    pub fn float_range(min: f64, max: f64) -> Self {
        ParamType::Float {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn none_or(inner: ParamType) -> Self {
        ParamType::NoneOr(Box::new(inner))
    }

    pub fn list_of(inner: ParamType) -> Self {
        ParamType::ListOf(Box::new(inner))
    }

    pub fn one_of<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        ParamType::OneOf(values.into_iter().map(Into::into).collect())
    }

    pub fn custom(f: impl Fn(&Value) -> Result<Value, String> + Send + Sync + 'static) -> Self {
        ParamType::Custom(Arc::new(f))
    }

    /// Check `value` and return it in normalised form (integers given for a
    /// float parameter become floats, and so on).
    pub fn validate(&self, value: &Value) -> Result<Value, String> {
        match self {
            ParamType::Any => Ok(value.clone()),
            ParamType::Float { min, max } => {
                let x = value
                    .as_f64()
                    .ok_or_else(|| format!("{} is not a number", value))?;
                if !x.is_finite() {
                    return Err(format!("{} is not a finite number", x));
                }
                if let Some(min) = min {
                    if x < *min {
                        return Err(format!("{} is below the minimum {}", x, min));
                    }
                }
                if let Some(max) = max {
                    if x > *max {
                        return Err(format!("{} is above the maximum {}", x, max));
                    }
                }
                Ok(json!(x))
            }
            ParamType::Int { min, max } => {
                let n = value
                    .as_i64()
                    .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .ok_or_else(|| format!("{} is not an integer", value))?;
                if min.is_some_and(|min| n < min) || max.is_some_and(|max| n > max) {
                    return Err(format!("{} is out of range {:?}..{:?}", n, min, max));
                }
                Ok(json!(n))
            }
            ParamType::Bool => value
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| format!("{} is not a boolean", value)),
            ParamType::Str => match value {
                Value::String(_) => Ok(value.clone()),
                other => Err(format!("{} is not a string", other)),
            },
            ParamType::OneOf(choices) => {
                if choices.contains(value) {
                    Ok(value.clone())
                } else {
                    Err(format!("{} is not one of {:?}", value, choices))
                }
            }
            ParamType::Limits => {
                let pair = value
                    .as_array()
                    .filter(|a| a.len() == 2)
                    .ok_or_else(|| format!("{} is not a [low, high] pair", value))?;
                let low = pair[0]
                    .as_f64()
                    .ok_or_else(|| format!("low limit {} is not a number", pair[0]))?;
                let high = pair[1]
                    .as_f64()
                    .ok_or_else(|| format!("high limit {} is not a number", pair[1]))?;
                if low > high {
                    return Err(format!("low limit {} is above high limit {}", low, high));
                }
                Ok(json!([low, high]))
            }
            ParamType::ListOf(inner) => {
                let items = value
                    .as_array()
                    .ok_or_else(|| format!("{} is not a list", value))?;
                items
                    .iter()
                    .map(|item| inner.validate(item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            ParamType::NoneOr(inner) => {
                if value.is_null() {
                    Ok(Value::Null)
                } else {
                    inner.validate(value)
                }
            }
            ParamType::Custom(f) => f(value),
        }
    }
}

// =============================================================================
// ParamSpec
// =============================================================================

/// Declaration of one device parameter.
#[derive(Clone, Debug)]
pub struct ParamSpec {
    pub name: String,
    pub description: String,
    pub kind: ParamType,
    pub default: Value,
    /// May be changed at runtime by `set`.
    pub settable: bool,
    /// Backed by a live hardware read on every access.
    pub volatile: bool,
    /// Must come from the cache or the configuration.
    pub mandatory: bool,
    /// Cache wins over configuration on init. Defaults to `settable`.
    pub prefer_cache: Option<bool>,
    /// Managed by the device itself; not allowed in configuration.
    pub internal: bool,
    pub category: Option<String>,
    pub unit: String,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind,
            default: Value::Null,
            settable: false,
            volatile: false,
            mandatory: false,
            prefer_cache: None,
            internal: false,
            category: None,
            unit: String::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = value.into();
        self
    }

    pub fn settable(mut self) -> Self {
        self.settable = true;
        self
    }

    pub fn volatile(mut self) -> Self {
        self.volatile = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn prefer_cache(mut self, prefer: bool) -> Self {
        self.prefer_cache = Some(prefer);
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn prefers_cache(&self) -> bool {
        self.prefer_cache.unwrap_or(self.settable)
    }

    /// Validate `value`, naming the device and parameter on failure.
    pub fn check(&self, device: &str, value: &Value) -> AppResult<Value> {
        self.kind.validate(value).map_err(|msg| {
            IcsError::invalid(device, format!("invalid value for parameter '{}': {}", self.name, msg))
        })
    }
}

/// Merge `overrides` over `base`; same-named specs are replaced in place and
/// new ones appended.
pub fn merge_specs(base: Vec<ParamSpec>, overrides: Vec<ParamSpec>) -> Vec<ParamSpec> {
    let mut merged = base;
    for spec in overrides {
        match merged.iter_mut().find(|s| s.name == spec.name) {
            Some(slot) => *slot = spec,
            None => merged.push(spec),
        }
    }
    merged
}

// =============================================================================
// Common parameter lists
// =============================================================================

/// Parameters every device has.
pub fn device_params() -> Vec<ParamSpec> {
    vec![
        ParamSpec::new("description", ParamType::Str)
            .description("Description of the device")
            .default("")
            .settable()
            .prefer_cache(false)
            .category("general"),
        ParamSpec::new("unit", ParamType::Str)
            .description("Unit of the device main value")
            .default("")
            .category("general"),
        ParamSpec::new("fmtstr", ParamType::Str)
            .description("Format string for the device value")
            .default("%.3f")
            .settable()
            .prefer_cache(false),
    ]
}

/// Parameters of readable devices.
pub fn readable_params() -> Vec<ParamSpec> {
    merge_specs(
        device_params(),
        vec![
            ParamSpec::new("maxage", ParamType::none_or(ParamType::float_min(0.0)))
                .description("Maximum age of cached values")
                .default(12.0)
                .unit("s")
                .settable()
                .prefer_cache(false),
            ParamSpec::new("pollinterval", ParamType::none_or(ParamType::float_min(0.0)))
                .description("Polling interval for value and status")
                .default(5.0)
                .unit("s")
                .settable()
                .prefer_cache(false),
        ],
    )
}

/// Parameters of moveable devices.
pub fn moveable_params() -> Vec<ParamSpec> {
    merge_specs(
        readable_params(),
        vec![
            ParamSpec::new("target", ParamType::Any)
                .description("Last target position of a start() action")
                .internal(),
            ParamSpec::new("fixed", ParamType::Str)
                .description("Reason why the device is fixed, empty if not fixed")
                .default("")
                .internal(),
            ParamSpec::new("requires", ParamType::Any)
                .description("Access requirements for moving, e.g. {\"level\": \"admin\"}")
                .default(json!({})),
        ],
    )
}

// =============================================================================
// Typed descriptors
// =============================================================================

/// Typed accessor for one parameter of a device.
pub struct Parameter<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Parameter<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Parameter<T> {}

impl<T> Parameter<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Cache key of this parameter on `device`.
    pub fn key(&self, device: &str) -> String {
        format!("{}/{}", device.to_lowercase(), self.name)
    }

    pub async fn get(&self, core: &DeviceCore) -> AppResult<T> {
        let value = core.param(self.name).await?;
        self.decode(core.name(), value)
    }

    pub async fn set(&self, core: &DeviceCore, value: T) -> AppResult<()> {
        core.set_param(self.name, serde_json::to_value(value)?).await
    }

    /// In-process value without touching cache or hardware.
    pub fn local(&self, core: &DeviceCore) -> Option<T> {
        core.local(self.name)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    fn decode(&self, device: &str, value: Value) -> AppResult<T> {
        serde_json::from_value(value).map_err(|err| {
            IcsError::invalid(device, format!("parameter '{}' has unexpected type: {}", self.name, err))
        })
    }
}

pub const DESCRIPTION: Parameter<String> = Parameter::new("description");
pub const UNIT: Parameter<String> = Parameter::new("unit");
pub const FMTSTR: Parameter<String> = Parameter::new("fmtstr");
pub const MAXAGE: Parameter<Option<f64>> = Parameter::new("maxage");
pub const POLLINTERVAL: Parameter<Option<f64>> = Parameter::new("pollinterval");
pub const FIXED: Parameter<String> = Parameter::new("fixed");

// =============================================================================
// Value formatting
// =============================================================================

/// Format `value` with a printf-style `fmtstr` (`%.3f`, `%d`, `%s`, `%g`,
/// `%e`). Unsupported formats fall back to the JSON rendering.
pub fn format_value(fmtstr: &str, value: &Value) -> String {
    let Some(start) = fmtstr.find('%') else {
        return value.to_string();
    };
    let spec = &fmtstr[start + 1..];
    let end = spec
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(spec.len());
    let (flags, conv) = spec.split_at(end);
    let conv = conv.chars().next();
    let precision: Option<usize> = flags.split_once('.').and_then(|(_, p)| p.parse().ok());
    let body = match (conv, value) {
        (Some('f'), v) if v.is_number() => {
            let x = v.as_f64().unwrap_or_default();
            format!("{:.*}", precision.unwrap_or(6), x)
        }
        (Some('e'), v) if v.is_number() => {
            let x = v.as_f64().unwrap_or_default();
            format!("{:.*e}", precision.unwrap_or(6), x)
        }
        (Some('g'), v) if v.is_number() => format!("{}", v.as_f64().unwrap_or_default()),
        (Some('d'), v) if v.is_number() => format!("{}", v.as_f64().unwrap_or_default().round() as i64),
        (Some('s'), Value::String(s)) => s.clone(),
        (Some('s'), v) => v.to_string(),
        (_, Value::String(s)) => s.clone(),
        _ => value.to_string(),
    };
    let suffix_start = start + 1 + end + conv.map_or(0, char::len_utf8);
    format!("{}{}{}", &fmtstr[..start], body, &fmtstr[suffix_start.min(fmtstr.len())..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_validation_normalises_ints() {
        let kind = ParamType::float_range(0.0, 10.0);
        assert_eq!(kind.validate(&json!(3)).unwrap(), json!(3.0));
        assert!(kind.validate(&json!(11.0)).is_err());
        assert!(kind.validate(&json!("3")).is_err());
    }

    #[test]
    fn test_limits_validation() {
        assert_eq!(
            ParamType::Limits.validate(&json!([-1, 2])).unwrap(),
            json!([-1.0, 2.0])
        );
        assert!(ParamType::Limits.validate(&json!([2, -1])).is_err());
        assert!(ParamType::Limits.validate(&json!([1])).is_err());
    }

    #[test]
    fn test_nested_types() {
        let kind = ParamType::none_or(ParamType::list_of(ParamType::Int {
            min: Some(0),
            max: None,
        }));
        assert_eq!(kind.validate(&Value::Null).unwrap(), Value::Null);
        assert_eq!(kind.validate(&json!([1, 2.0])).unwrap(), json!([1, 2]));
        assert!(kind.validate(&json!([-1])).is_err());
        let choice = ParamType::one_of(["a", "b"]);
        assert!(choice.validate(&json!("c")).is_err());
    }

    #[test]
    fn test_merge_overrides_by_name() {
        let merged = merge_specs(
            readable_params(),
            vec![ParamSpec::new("maxage", ParamType::float()).default(1.0)],
        );
        let maxage = merged.iter().find(|s| s.name == "maxage").unwrap();
        assert_eq!(maxage.default, json!(1.0));
        assert_eq!(merged.iter().filter(|s| s.name == "maxage").count(), 1);
        assert!(merged.iter().any(|s| s.name == "fmtstr"));
    }

    #[test]
    fn test_prefer_cache_defaults_to_settable() {
        assert!(ParamSpec::new("offset", ParamType::float()).settable().prefers_cache());
        assert!(!ParamSpec::new("unit", ParamType::Str).prefers_cache());
        assert!(!ParamSpec::new("x", ParamType::Any)
            .settable()
            .prefer_cache(false)
            .prefers_cache());
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value("%.3f", &json!(1.23456)), "1.235");
        assert_eq!(format_value("%d", &json!(4.6)), "5");
        assert_eq!(format_value("%s", &json!("in")), "in");
        assert_eq!(format_value("%.1f mm", &json!(2)), "2.0 mm");
        assert_eq!(format_value("", &json!([1, 2])), "[1,2]");
    }

    #[test]
    fn test_parameter_key() {
        const SPEED: Parameter<f64> = Parameter::new("speed");
        assert_eq!(SPEED.key("Motor1"), "motor1/speed");
    }
}
