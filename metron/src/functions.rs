//! Built-in custom functions available to every expression.
//!
//! The `custom-functions` section of the configuration maps names to
//! these (and to functions registered by embedders through
//! [`crate::Runtime::register_function`]); there is no dynamic code
//! loading.

use chrono::NaiveDateTime;
use metron_common::{ExprError, ScopeFn, Value, now_seconds};

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// The built-in function table.
pub fn builtins() -> Vec<(&'static str, ScopeFn)> {
    let entries: Vec<(&'static str, ScopeFn)> = vec![
        (
            "now",
            scope_fn(|_args| Ok(Value::Int(now_seconds()))),
        ),
        (
            "echo",
            scope_fn(|args| Ok(args.first().cloned().unwrap_or(Value::Null))),
        ),
        (
            "round",
            scope_fn(|args| {
                let value = args
                    .first()
                    .and_then(Value::as_f64)
                    .ok_or_else(|| ExprError::call("round: expected a number"))?;
                match args.get(1).and_then(Value::as_i64) {
                    None => Ok(Value::Int(value.round() as i64)),
                    Some(digits) => {
                        let factor = 10f64.powi(i32::try_from(digits).unwrap_or(0));
                        Ok(Value::Float((value * factor).round() / factor))
                    }
                }
            }),
        ),
        (
            "hostname",
            scope_fn(|_args| Ok(Value::Str(hostname()))),
        ),
        (
            "check_hostname",
            scope_fn(|args| {
                let name = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| ExprError::call("check_hostname: expected a string"))?;
                Ok(Value::Bool(hostname() == name))
            }),
        ),
        (
            "epoch_time",
            scope_fn(|args| {
                let text = args
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| ExprError::call("epoch_time: expected a datetime string"))?;
                let format = args
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| ExprError::call("epoch_time: expected a format string"))?;
                NaiveDateTime::parse_from_str(text, format)
                    .map(|parsed| Value::Int(parsed.and_utc().timestamp()))
                    .map_err(|e| ExprError::call(format!("epoch_time: {e}")))
            }),
        ),
    ];
    entries
}

fn scope_fn<F>(f: F) -> ScopeFn
where
    F: Fn(&[Value]) -> Result<Value, ExprError> + Send + Sync + 'static,
{
    std::sync::Arc::new(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Result<Value, ExprError> {
        let table = builtins();
        let (_, func) = table.iter().find(|(n, _)| *n == name).unwrap();
        func(args)
    }

    #[test]
    fn now_returns_unix_seconds() {
        let Value::Int(t) = call("now", &[]).unwrap() else {
            panic!("expected an integer");
        };
        assert!(t > 1_700_000_000);
    }

    #[test]
    fn echo_returns_its_argument() {
        assert_eq!(call("echo", &[Value::Int(3)]).unwrap(), Value::Int(3));
        assert_eq!(call("echo", &[]).unwrap(), Value::Null);
    }

    #[test]
    fn round_handles_digits() {
        assert_eq!(call("round", &[Value::Float(2.6)]).unwrap(), Value::Int(3));
        assert_eq!(
            call("round", &[Value::Float(2.625), Value::Int(2)]).unwrap(),
            Value::Float(2.63)
        );
        assert!(call("round", &[Value::Str("x".into())]).is_err());
    }

    #[test]
    fn epoch_time_parses_with_format() {
        assert_eq!(
            call(
                "epoch_time",
                &[
                    Value::Str("2026-01-01 00:00:00".into()),
                    Value::Str("%Y-%m-%d %H:%M:%S".into()),
                ],
            )
            .unwrap(),
            Value::Int(1_767_225_600)
        );
    }
}
