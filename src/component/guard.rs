//! Argument Guards
//!
//! Every remote channel validates its arguments before any handler runs.
//! Invalid arguments are dropped by the receiver.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Predicate over the raw arguments of a remote call or event.
pub type ArgGuard = Arc<dyn Fn(&[Value]) -> bool + Send + Sync>;

/// Accept any arguments.
pub fn any() -> ArgGuard {
    Arc::new(|_| true)
}

/// Accept only an empty argument list.
pub fn no_args() -> ArgGuard {
    Arc::new(|args| args.is_empty())
}

/// Accept exactly `count` arguments of any shape.
pub fn arity(count: usize) -> ArgGuard {
    Arc::new(move |args| args.len() == count)
}

/// Accept arguments that deserialize into `T`, typically a tuple.
///
/// `typed::<(u32, String)>()` accepts `[5, "x"]` and rejects `["5", "x"]`
/// or `[5]`.
pub fn typed<T: DeserializeOwned + 'static>() -> ArgGuard {
    Arc::new(|args| serde_json::from_value::<T>(Value::Array(args.to_vec())).is_ok())
}

/// Wrap an arbitrary predicate.
pub fn custom<F>(check: F) -> ArgGuard
where
    F: Fn(&[Value]) -> bool + Send + Sync + 'static,
{
    Arc::new(check)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_tuple_guard() {
        let guard = typed::<(u32, String)>();
        assert!(guard(&[json!(5), json!("x")]));
        assert!(!guard(&[json!("5"), json!("x")]));
        assert!(!guard(&[json!(5)]));
        assert!(!guard(&[json!(5), json!("x"), json!(1)]));
    }

    #[test]
    fn test_arity_and_no_args() {
        assert!(no_args()(&[]));
        assert!(!no_args()(&[json!(1)]));
        assert!(arity(2)(&[json!(1), json!(null)]));
        assert!(!arity(2)(&[json!(1)]));
        assert!(any()(&[json!({ "a": 1 })]));
    }

    #[test]
    fn test_custom_guard() {
        let positive = custom(|args| args.first().and_then(Value::as_i64).map_or(false, |n| n > 0));
        assert!(positive(&[json!(3)]));
        assert!(!positive(&[json!(-3)]));
    }
}
