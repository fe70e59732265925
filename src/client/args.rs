//! Argument resolution for subscribe and unsubscribe
//!
//! Both calls take `(pattern, [share], [options], [callback])` where any of
//! the trailing arguments may be left out. Arity alone cannot tell a share
//! from an options map, so each trailing argument is classified by the type
//! of its value and placed in the first slot at or after the current one
//! that accepts it.

use super::address::validate_pattern;
use crate::error::ClientError;
use serde_json::{Map, Number, Value};
use std::fmt;

/// String form of a function used as a pattern
pub const FUNCTION_PATTERN: &str = "[function]";

/// A dynamically typed call argument
pub enum Arg<C> {
    Undefined,
    Null,
    Bool(bool),
    Number(Number),
    Str(String),
    Array(Vec<Value>),
    Map(Map<String, Value>),
    Function(C),
}

impl<C> Arg<C> {
    pub fn callback(callback: C) -> Self {
        Arg::Function(callback)
    }

    fn type_name(&self) -> &'static str {
        match self {
            Arg::Undefined => "undefined",
            Arg::Null => "null",
            Arg::Bool(_) => "boolean",
            Arg::Number(_) => "number",
            Arg::Str(_) => "string",
            Arg::Array(_) => "array",
            Arg::Map(_) => "map",
            Arg::Function(_) => "function",
        }
    }
}

impl<C> fmt::Debug for Arg<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Undefined => write!(f, "Undefined"),
            Arg::Null => write!(f, "Null"),
            Arg::Bool(b) => write!(f, "Bool({b})"),
            Arg::Number(n) => write!(f, "Number({n})"),
            Arg::Str(s) => write!(f, "Str({s:?})"),
            Arg::Array(a) => write!(f, "Array({a:?})"),
            Arg::Map(m) => write!(f, "Map({m:?})"),
            Arg::Function(_) => write!(f, "Function(..)"),
        }
    }
}

impl<C> From<&str> for Arg<C> {
    fn from(value: &str) -> Self {
        Arg::Str(value.to_string())
    }
}

impl<C> From<String> for Arg<C> {
    fn from(value: String) -> Self {
        Arg::Str(value)
    }
}

impl<C> From<bool> for Arg<C> {
    fn from(value: bool) -> Self {
        Arg::Bool(value)
    }
}

impl<C> From<i32> for Arg<C> {
    fn from(value: i32) -> Self {
        Arg::Number(value.into())
    }
}

impl<C> From<i64> for Arg<C> {
    fn from(value: i64) -> Self {
        Arg::Number(value.into())
    }
}

impl<C> From<u32> for Arg<C> {
    fn from(value: u32) -> Self {
        Arg::Number(value.into())
    }
}

impl<C> From<u64> for Arg<C> {
    fn from(value: u64) -> Self {
        Arg::Number(value.into())
    }
}

impl<C> From<f64> for Arg<C> {
    fn from(value: f64) -> Self {
        match Number::from_f64(value) {
            Some(number) => Arg::Number(number),
            None => Arg::Str(value.to_string()),
        }
    }
}

impl<C> From<Map<String, Value>> for Arg<C> {
    fn from(value: Map<String, Value>) -> Self {
        Arg::Map(value)
    }
}

impl<C> From<Value> for Arg<C> {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Arg::Null,
            Value::Bool(b) => Arg::Bool(b),
            Value::Number(n) => Arg::Number(n),
            Value::String(s) => Arg::Str(s),
            Value::Array(a) => Arg::Array(a),
            Value::Object(m) => Arg::Map(m),
        }
    }
}

impl<C, T: Into<Arg<C>>> From<Option<T>> for Arg<C> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Arg::Undefined, Into::into)
    }
}

/// Canonical form of a subscribe or unsubscribe call
pub struct SubscriptionRequest<C> {
    pub pattern: String,
    pub share: Option<String>,
    pub options: Option<Map<String, Value>>,
    pub callback: Option<C>,
}

impl<C> fmt::Debug for SubscriptionRequest<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRequest")
            .field("pattern", &self.pattern)
            .field("share", &self.share)
            .field("options", &self.options)
            .field("callback", &self.callback.as_ref().map(|_| ".."))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Slot {
    Share,
    Options,
    Callback,
    Done,
}

impl Slot {
    fn next(self) -> Self {
        match self {
            Slot::Share => Slot::Options,
            Slot::Options => Slot::Callback,
            Slot::Callback | Slot::Done => Slot::Done,
        }
    }
}

/// Classify a subscribe/unsubscribe argument list
///
/// The first argument is the pattern. Each following argument goes to the
/// share slot if it is a string, number, boolean or array, to the options
/// slot if it is a map (or an array once the share slot is passed), and to
/// the callback slot if it is a function. `Undefined` and `Null` leave the
/// current slot empty. Arguments after the callback slot are ignored.
pub fn resolve<C, I>(operation: &str, args: I) -> Result<SubscriptionRequest<C>, ClientError>
where
    I: IntoIterator<Item = Arg<C>>,
{
    let mut args = args.into_iter();
    let pattern = match args.next() {
        Some(arg) => coerce_pattern(operation, arg)?,
        None => {
            return Err(ClientError::validation(format!(
                "{operation} requires at least a pattern argument"
            )))
        }
    };

    let mut request = SubscriptionRequest {
        pattern,
        share: None,
        options: None,
        callback: None,
    };
    let mut slot = Slot::Share;

    for arg in args {
        if slot == Slot::Done {
            break;
        }
        match arg {
            Arg::Undefined | Arg::Null => slot = slot.next(),
            Arg::Function(callback) => {
                request.callback = Some(callback);
                slot = Slot::Done;
            }
            Arg::Map(map) if slot <= Slot::Options => {
                request.options = Some(map);
                slot = Slot::Callback;
            }
            Arg::Array(items) if slot == Slot::Options => {
                request.options = Some(array_to_map(items));
                slot = Slot::Callback;
            }
            share @ (Arg::Str(_) | Arg::Number(_) | Arg::Bool(_) | Arg::Array(_))
                if slot == Slot::Share =>
            {
                let share = coerce_to_string(&share);
                request.share = (!share.is_empty()).then_some(share);
                slot = Slot::Options;
            }
            other => {
                let expected = match slot {
                    Slot::Options => "options must be a map",
                    _ => "callback must be a function",
                };
                return Err(ClientError::validation(format!(
                    "{operation}: {expected}, got {}",
                    other.type_name()
                )));
            }
        }
    }

    Ok(request)
}

fn coerce_pattern<C>(operation: &str, arg: Arg<C>) -> Result<String, ClientError> {
    let pattern = match arg {
        Arg::Undefined | Arg::Null => {
            return Err(ClientError::validation(format!(
                "{operation}: pattern must not be {}",
                arg.type_name()
            )))
        }
        other => coerce_to_string(&other),
    };
    validate_pattern(&pattern)?;
    Ok(pattern)
}

/// String form of a value, following the usual dynamic-language rules
fn coerce_to_string<C>(arg: &Arg<C>) -> String {
    match arg {
        Arg::Undefined => "undefined".to_string(),
        Arg::Null => "null".to_string(),
        Arg::Bool(b) => b.to_string(),
        Arg::Number(n) => number_to_string(n),
        Arg::Str(s) => s.clone(),
        Arg::Array(items) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(","),
        Arg::Map(_) => "[object Object]".to_string(),
        Arg::Function(_) => FUNCTION_PATTERN.to_string(),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => number_to_string(n),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(value_to_string).collect::<Vec<_>>().join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

fn number_to_string(number: &Number) -> String {
    if number.is_f64() {
        if let Some(f) = number.as_f64() {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                return format!("{}", f as i64);
            }
        }
    }
    number.to_string()
}

fn array_to_map(items: Vec<Value>) -> Map<String, Value> {
    items
        .into_iter()
        .enumerate()
        .map(|(index, value)| (index.to_string(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    type TestArg = Arg<&'static str>;

    fn object() -> TestArg {
        Arg::Map(Map::new())
    }

    fn cb() -> TestArg {
        Arg::callback("cb")
    }

    fn run(args: Vec<TestArg>) -> Result<SubscriptionRequest<&'static str>, ClientError> {
        resolve("subscribe", args)
    }

    #[test]
    fn test_zero_arguments_rejected() {
        let error = run(vec![]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_pattern_only() {
        let request = run(vec!["/pattern".into()]).unwrap();
        assert_eq!(request.pattern, "/pattern");
        assert_eq!(request.share, None);
        assert!(request.options.is_none());
        assert!(request.callback.is_none());
    }

    #[test]
    fn test_two_argument_forms() {
        let request = run(vec!["/p".into(), cb()]).unwrap();
        assert_eq!(request.callback, Some("cb"));
        assert_eq!(request.share, None);

        let request = run(vec!["/p".into(), "share".into()]).unwrap();
        assert_eq!(request.share.as_deref(), Some("share"));
        assert!(request.options.is_none());

        let request = run(vec!["/p".into(), object()]).unwrap();
        assert_eq!(request.options, Some(Map::new()));
        assert_eq!(request.share, None);

        let request = run(vec!["/p".into(), 7.into()]).unwrap();
        assert_eq!(request.share.as_deref(), Some("7"));
    }

    #[test]
    fn test_three_argument_forms() {
        let request = run(vec!["/p".into(), "share".into(), cb()]).unwrap();
        assert_eq!(request.share.as_deref(), Some("share"));
        assert_eq!(request.callback, Some("cb"));

        let request = run(vec!["/p".into(), object(), cb()]).unwrap();
        assert_eq!(request.options, Some(Map::new()));
        assert_eq!(request.share, None);
        assert_eq!(request.callback, Some("cb"));

        let request = run(vec!["/p".into(), "share".into(), object()]).unwrap();
        assert_eq!(request.share.as_deref(), Some("share"));
        assert_eq!(request.options, Some(Map::new()));
        assert!(request.callback.is_none());

        let request = run(vec!["/p".into(), 7.into(), cb()]).unwrap();
        assert_eq!(request.share.as_deref(), Some("7"));
        assert_eq!(request.callback, Some("cb"));
    }

    #[test]
    fn test_four_argument_form() {
        let request = run(vec!["/p".into(), "share".into(), object(), cb()]).unwrap();
        assert_eq!(request.share.as_deref(), Some("share"));
        assert_eq!(request.options, Some(Map::new()));
        assert_eq!(request.callback, Some("cb"));
    }

    #[test]
    fn test_extra_arguments_ignored() {
        let request = run(vec![
            "/foo".into(),
            "share1".into(),
            object(),
            cb(),
            "stowaway".into(),
        ])
        .unwrap();
        assert_eq!(request.share.as_deref(), Some("share1"));
        assert_eq!(request.callback, Some("cb"));

        let request = run(vec!["/foo".into(), cb(), "stowaway".into()]).unwrap();
        assert_eq!(request.callback, Some("cb"));
    }

    #[test]
    fn test_non_function_callback_rejected() {
        let error = run(vec!["/foo".into(), "share".into(), object(), 7.into()]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);
        assert!(error.to_string().contains("callback must be a function"));

        let error = run(vec!["/foo".into(), object(), "late".into()]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_non_map_options_rejected() {
        let error = run(vec!["/foo".into(), "share".into(), "other".into()]).unwrap_err();
        assert!(error.to_string().contains("options must be a map"));
    }

    #[test]
    fn test_arrays_fill_share_then_options() {
        let request = run(vec!["/p".into(), json!([]).into(), json!(["a"]).into()]).unwrap();
        assert_eq!(request.share, None);
        let options = request.options.unwrap();
        assert_eq!(options.get("0"), Some(&json!("a")));

        let request = run(vec!["/p".into(), json!(["x", 1]).into()]).unwrap();
        assert_eq!(request.share.as_deref(), Some("x,1"));
    }

    #[test]
    fn test_undefined_skips_slot() {
        let request = run(vec!["/p".into(), Arg::Undefined, object(), cb()]).unwrap();
        assert_eq!(request.share, None);
        assert!(request.options.is_some());

        let request = run(vec!["/p".into(), Arg::Null, Arg::Null, cb()]).unwrap();
        assert_eq!(request.callback, Some("cb"));

        let error = run(vec!["/p".into(), None::<&str>.into(), "x".into()]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_pattern_coercion() {
        assert_eq!(run(vec![1234.into()]).unwrap().pattern, "1234");
        assert_eq!(run(vec![cb()]).unwrap().pattern, FUNCTION_PATTERN);
        assert_eq!(run(vec![12.0.into()]).unwrap().pattern, "12");
        assert_eq!(run(vec![1.5.into()]).unwrap().pattern, "1.5");
        assert_eq!(run(vec![true.into()]).unwrap().pattern, "true");
        for pattern in ["kittens", "/kittens", "+", "#", "/#", "/+"] {
            assert_eq!(run(vec![pattern.into()]).unwrap().pattern, pattern);
        }
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        for arg in [Arg::Undefined, Arg::Null, "".into()] {
            let error = run(vec![arg]).unwrap_err();
            assert_eq!(error.kind(), ErrorKind::Validation);
        }
    }

    #[test]
    fn test_operation_named_in_errors() {
        let error = resolve::<&str, _>("unsubscribe", vec![]).unwrap_err();
        assert!(error.to_string().contains("unsubscribe"));
    }
}
