//! Type-erased argument and reply values.
//!
//! The dispatcher receives arguments and reply slots as trait objects so the
//! same entry point serves the local fast path (the caller's own typed values)
//! and the server loop (values decoded off the wire as `serde_json::Value`).

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;

/// An argument value handed to the dispatcher
pub trait Payload: Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Structural encoding, used when the callee expects a different type
    fn to_value(&self) -> serde_json::Result<Value>;

    fn type_name(&self) -> &'static str;
}

impl<T> Payload for T
where
    T: Serialize + Any + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// A caller-owned reply slot the callee writes into
pub trait ReplyPayload: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Overwrite the slot with a structurally encoded reply
    fn assign_value(&mut self, value: Value) -> serde_json::Result<()>;

    fn type_name(&self) -> &'static str;
}

impl<T> ReplyPayload for T
where
    T: DeserializeOwned + Any + Send,
{
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn assign_value(&mut self, value: Value) -> serde_json::Result<()> {
        *self = serde_json::from_value(value)?;
        Ok(())
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Where the invoked method's reply ends up
pub enum ReplyTarget<'a> {
    /// The caller's reply value (local fast path)
    Typed(&'a mut dyn ReplyPayload),
    /// Encoded for the wire. Left `None` when the method never ran.
    Encoded(&'a mut Option<Value>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Quotient {
        quo: i64,
        rem: i64,
    }

    #[test]
    fn test_payload_downcasts_to_concrete_type() {
        let q = Quotient { quo: 3, rem: 2 };
        let payload: &dyn Payload = &q;
        assert_eq!(payload.as_any().downcast_ref::<Quotient>(), Some(&q));
        assert_eq!(payload.to_value().unwrap(), json!({"quo": 3, "rem": 2}));
        assert!(payload.type_name().ends_with("Quotient"));
    }

    #[test]
    fn test_reply_assign_value_overwrites() {
        let mut q = Quotient { quo: 9, rem: 9 };
        let slot: &mut dyn ReplyPayload = &mut q;
        slot.assign_value(json!({"quo": 3, "rem": 2})).unwrap();
        assert_eq!(q, Quotient { quo: 3, rem: 2 });
    }

    #[test]
    fn test_reply_assign_value_type_mismatch() {
        let mut n = 0i32;
        let slot: &mut dyn ReplyPayload = &mut n;
        assert!(slot.assign_value(json!("six")).is_err());
        assert_eq!(n, 0);
    }
}
