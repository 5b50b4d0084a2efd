//! Argument checks for host functions.
//!
//! Registration functions validate shape and arity up front so a script author
//! sees the mistake at startup instead of when the handler first fires.

use serde_json::Value;

use crate::{Callable, ScriptError, ScriptValue};

pub fn expect_arity(function: &str, args: &[ScriptValue], min: usize, max: usize) -> Result<(), ScriptError> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return Err(ScriptError::invalid_arguments(
            function,
            format!("expected {} argument(s), got {}", expected, args.len()),
        ));
    }
    Ok(())
}

pub fn expect_string(function: &str, args: &[ScriptValue], index: usize) -> Result<String, ScriptError> {
    match args.get(index) {
        Some(ScriptValue::Json(Value::String(s))) => Ok(s.clone()),
        Some(other) => Err(ScriptError::invalid_arguments(
            function,
            format!("argument {} must be a string, got {}", index + 1, other.kind()),
        )),
        None => Err(ScriptError::invalid_arguments(
            function,
            format!("missing argument {}", index + 1),
        )),
    }
}

pub fn expect_callable(function: &str, args: &[ScriptValue], index: usize) -> Result<Callable, ScriptError> {
    match args.get(index) {
        Some(ScriptValue::Function(callable)) => Ok(*callable),
        Some(other) => Err(ScriptError::invalid_arguments(
            function,
            format!("argument {} must be a function, got {}", index + 1, other.kind()),
        )),
        None => Err(ScriptError::invalid_arguments(
            function,
            format!("missing argument {}", index + 1),
        )),
    }
}

/// Optional plain-data argument; `None` and `null` both read as an empty object
pub fn optional_object(
    function: &str,
    args: &[ScriptValue],
    index: usize,
) -> Result<serde_json::Map<String, Value>, ScriptError> {
    match args.get(index) {
        None | Some(ScriptValue::Json(Value::Null)) => Ok(serde_json::Map::new()),
        Some(ScriptValue::Json(Value::Object(map))) => Ok(map.clone()),
        Some(other) => Err(ScriptError::invalid_arguments(
            function,
            format!("argument {} must be an object, got {}", index + 1, other.kind()),
        )),
    }
}

pub fn expect_bool(function: &str, args: &[ScriptValue], index: usize) -> Result<bool, ScriptError> {
    match args.get(index) {
        Some(ScriptValue::Json(Value::Bool(b))) => Ok(*b),
        Some(other) => Err(ScriptError::invalid_arguments(
            function,
            format!("argument {} must be a boolean, got {}", index + 1, other.kind()),
        )),
        None => Err(ScriptError::invalid_arguments(
            function,
            format!("missing argument {}", index + 1),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_arity_message() {
        let err = expect_arity("router.get", &[ScriptValue::null()], 2, 2).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid arguments to router.get: expected 2 argument(s), got 1"
        );
    }

    #[test]
    fn test_expect_callable_rejects_string() {
        let args = vec![ScriptValue::from("/x"), ScriptValue::from("nope")];
        assert!(expect_callable("router.get", &args, 1).is_err());
        assert_eq!(expect_string("router.get", &args, 0).unwrap(), "/x");
    }

    #[test]
    fn test_optional_object() {
        assert!(optional_object("ui.alert", &[], 0).unwrap().is_empty());
        let args = vec![ScriptValue::from(json!({"title": "hi"}))];
        assert_eq!(optional_object("ui.alert", &args, 0).unwrap()["title"], "hi");
        assert!(optional_object("ui.alert", &[ScriptValue::from("x")], 0).is_err());
    }
}
