//! Service definitions: receivers and their tables of callable methods.
//!
//! A receiver type declares its methods once, at registration, through
//! [`Service::methods`]. Each declaration is boxed into a [`Callable`] that
//! knows how to coerce an erased argument into the method's argument type and
//! how to hand it a reply slot, so nothing is resolved per call beyond a
//! name lookup.

use crate::payload::{Payload, ReplyPayload, ReplyTarget};
use peercall_protocol::RemoteError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// A receiver whose methods can be called over RPC.
///
/// ```ignore
/// struct Arith;
///
/// impl Arith {
///     fn multiply(&self, args: &Args, reply: &mut i64) -> anyhow::Result<()> {
///         *reply = args.a * args.b;
///         Ok(())
///     }
/// }
///
/// impl Service for Arith {
///     fn methods(table: &mut MethodTable<Self>) {
///         table.method("Multiply", Arith::multiply);
///     }
/// }
/// ```
pub trait Service: Send + Sync + Sized + 'static {
    /// Declare the callable methods
    fn methods(table: &mut MethodTable<Self>);

    /// Name the service registers under; the receiver's type name by default
    fn service_name() -> String {
        short_type_name::<Self>()
    }
}

/// Receiver handed to `register`.
///
/// Only a shared handle is accepted: the registry keeps the receiver for the
/// server's lifetime and every stream calls into the same instance.
pub enum Receiver<S> {
    Shared(Arc<S>),
    /// A plain value; registration rejects it
    Owned(S),
}

impl<S> From<Arc<S>> for Receiver<S> {
    fn from(receiver: Arc<S>) -> Self {
        Self::Shared(receiver)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgConvention {
    /// `Fn(&S, &A, &mut R)`
    ByReference,
    /// `Fn(&S, A, &mut R)`
    ByValue,
}

/// Shape of one registered method
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodDescriptor {
    pub service: String,
    pub name: String,
    pub arg_type: &'static str,
    pub reply_type: &'static str,
    pub convention: ArgConvention,
}

pub(crate) trait Callable<S>: Send + Sync {
    fn call(
        &self,
        receiver: &S,
        descriptor: &MethodDescriptor,
        arg: &dyn Payload,
        reply: ReplyTarget<'_>,
    ) -> Result<(), RemoteError>;
}

pub(crate) struct MethodEntry<S> {
    pub(crate) descriptor: MethodDescriptor,
    pub(crate) callable: Box<dyn Callable<S>>,
}

/// Methods declared by a [`Service`].
///
/// Names must be exported (start with an uppercase ASCII letter); other names
/// and repeated names are skipped without error.
pub struct MethodTable<S> {
    service: String,
    entries: HashMap<String, MethodEntry<S>>,
}

impl<S: Service> MethodTable<S> {
    pub(crate) fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            entries: HashMap::new(),
        }
    }

    /// Declare a method taking its argument by reference
    pub fn method<A, R, E, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&S, &A, &mut R) -> Result<(), E> + Send + Sync + 'static,
        A: DeserializeOwned + Clone + Send + Sync + 'static,
        R: Serialize + DeserializeOwned + Default + Send + 'static,
        E: fmt::Display + 'static,
    {
        self.insert::<A, R>(
            name,
            ArgConvention::ByReference,
            Box::new(ByReference {
                f,
                _types: PhantomData,
            }),
        )
    }

    /// Declare a method taking its argument by value
    pub fn method_owned<A, R, E, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&S, A, &mut R) -> Result<(), E> + Send + Sync + 'static,
        A: DeserializeOwned + Clone + Send + Sync + 'static,
        R: Serialize + DeserializeOwned + Default + Send + 'static,
        E: fmt::Display + 'static,
    {
        self.insert::<A, R>(
            name,
            ArgConvention::ByValue,
            Box::new(ByValue {
                f,
                _types: PhantomData,
            }),
        )
    }

    fn insert<A: 'static, R: 'static>(
        &mut self,
        name: &str,
        convention: ArgConvention,
        callable: Box<dyn Callable<S>>,
    ) -> &mut Self {
        if !is_exported(name) {
            debug!(service = %self.service, method = name, "Skipping unexported method");
            return self;
        }
        if self.entries.contains_key(name) {
            debug!(service = %self.service, method = name, "Skipping duplicate method");
            return self;
        }

        let descriptor = MethodDescriptor {
            service: self.service.clone(),
            name: name.to_string(),
            arg_type: std::any::type_name::<A>(),
            reply_type: std::any::type_name::<R>(),
            convention,
        };
        self.entries
            .insert(name.to_string(), MethodEntry { descriptor, callable });
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn into_entries(self) -> HashMap<String, MethodEntry<S>> {
        self.entries
    }
}

struct ByReference<F, A, R, E> {
    f: F,
    _types: PhantomData<fn(&A, &mut R) -> E>,
}

struct ByValue<F, A, R, E> {
    f: F,
    _types: PhantomData<fn(A, &mut R) -> E>,
}

impl<S, F, A, R, E> Callable<S> for ByReference<F, A, R, E>
where
    F: Fn(&S, &A, &mut R) -> Result<(), E> + Send + Sync,
    A: DeserializeOwned + Clone + 'static,
    R: Serialize + DeserializeOwned + Default + Send + 'static,
    E: fmt::Display,
{
    fn call(
        &self,
        receiver: &S,
        descriptor: &MethodDescriptor,
        arg: &dyn Payload,
        reply: ReplyTarget<'_>,
    ) -> Result<(), RemoteError> {
        let arg = decode_arg::<A>(arg, descriptor)?;
        with_reply::<R, _>(reply, descriptor, |slot| {
            (self.f)(receiver, &arg, slot).map_err(|e| RemoteError::application(e.to_string()))
        })
    }
}

impl<S, F, A, R, E> Callable<S> for ByValue<F, A, R, E>
where
    F: Fn(&S, A, &mut R) -> Result<(), E> + Send + Sync,
    A: DeserializeOwned + Clone + 'static,
    R: Serialize + DeserializeOwned + Default + Send + 'static,
    E: fmt::Display,
{
    fn call(
        &self,
        receiver: &S,
        descriptor: &MethodDescriptor,
        arg: &dyn Payload,
        reply: ReplyTarget<'_>,
    ) -> Result<(), RemoteError> {
        let arg = decode_arg::<A>(arg, descriptor)?.into_owned();
        with_reply::<R, _>(reply, descriptor, |slot| {
            (self.f)(receiver, arg, slot).map_err(|e| RemoteError::application(e.to_string()))
        })
    }
}

/// Borrow the argument when the caller passed the exact type, decode it
/// structurally otherwise.
fn decode_arg<'a, A>(
    arg: &'a dyn Payload,
    descriptor: &MethodDescriptor,
) -> Result<Cow<'a, A>, RemoteError>
where
    A: DeserializeOwned + Clone + 'static,
{
    let invalid = |e: serde_json::Error| {
        RemoteError::invalid_argument(&descriptor.service, &descriptor.name, e)
    };

    if let Some(arg) = arg.as_any().downcast_ref::<A>() {
        return Ok(Cow::Borrowed(arg));
    }
    // Decoded values and local arguments of another type take the same route
    let value = match arg.as_any().downcast_ref::<Value>() {
        Some(value) => Cow::Borrowed(value),
        None => Cow::Owned(arg.to_value().map_err(invalid)?),
    };
    A::deserialize(value.as_ref()).map(Cow::Owned).map_err(invalid)
}

/// Run `invoke` against a reply that starts as `R::default()`, then route the
/// reply to the target. The reply is delivered even when `invoke` fails.
fn with_reply<R, F>(
    reply: ReplyTarget<'_>,
    descriptor: &MethodDescriptor,
    invoke: F,
) -> Result<(), RemoteError>
where
    R: Serialize + DeserializeOwned + Default + Send + 'static,
    F: FnOnce(&mut R) -> Result<(), RemoteError>,
{
    match reply {
        ReplyTarget::Typed(slot) => {
            if let Some(slot) = slot.as_any_mut().downcast_mut::<R>() {
                *slot = R::default();
                return invoke(slot);
            }
            let mut fresh = R::default();
            let outcome = invoke(&mut fresh);
            let value = encode_reply(&fresh, descriptor)?;
            deliver_reply(slot, value, &descriptor.service, &descriptor.name)?;
            outcome
        }
        ReplyTarget::Encoded(out) => {
            let mut fresh = R::default();
            let outcome = invoke(&mut fresh);
            *out = Some(encode_reply(&fresh, descriptor)?);
            outcome
        }
    }
}

fn encode_reply<R>(reply: &R, descriptor: &MethodDescriptor) -> Result<Value, RemoteError>
where
    R: Serialize + DeserializeOwned,
{
    let invalid = |e: serde_json::Error| {
        RemoteError::invalid_reply(&descriptor.service, &descriptor.name, e)
    };
    let value = serde_json::to_value(reply).map_err(invalid)?;
    // Non-finite floats encode to null; a caller would read them back as something else
    if value.is_null() {
        R::deserialize(&value).map_err(invalid)?;
    }
    Ok(value)
}

/// Write an encoded reply into a caller's slot. Shared by the local fast path
/// (when reply types differ) and the client's remote path.
pub(crate) fn deliver_reply(
    slot: &mut dyn ReplyPayload,
    value: Value,
    service: &str,
    method: &str,
) -> Result<(), RemoteError> {
    slot.assign_value(value)
        .map_err(|e| RemoteError::invalid_reply(service, method, e))
}

fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_ascii_uppercase())
}

/// Last path segment of a type name, generics stripped
pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Args {
        a: i64,
        b: i64,
    }

    struct Counter<T>(PhantomData<T>);

    struct Echo;

    impl Echo {
        fn echo(&self, args: &Args, reply: &mut Args) -> Result<(), String> {
            *reply = args.clone();
            Ok(())
        }

        fn sum(&self, args: Args, reply: &mut i64) -> Result<(), String> {
            *reply = args.a + args.b;
            Ok(())
        }
    }

    impl Service for Echo {
        fn methods(table: &mut MethodTable<Self>) {
            table
                .method("Echo", Echo::echo)
                .method_owned("Sum", Echo::sum)
                .method("lowercase", Echo::echo)
                .method_owned("Echo", Echo::sum);
        }
    }

    fn table() -> HashMap<String, MethodEntry<Echo>> {
        let mut table = MethodTable::new("Echo");
        Echo::methods(&mut table);
        table.into_entries()
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<Echo>(), "Echo");
        assert_eq!(short_type_name::<Counter<Echo>>(), "Counter");
        assert_eq!(Echo::service_name(), "Echo");
    }

    #[test]
    fn test_unexported_and_duplicate_methods_are_skipped() {
        let entries = table();
        assert_eq!(entries.len(), 2);
        assert!(!entries.contains_key("lowercase"));
        assert_eq!(entries["Echo"].descriptor.convention, ArgConvention::ByReference);
        assert_eq!(entries["Sum"].descriptor.convention, ArgConvention::ByValue);
        assert!(entries["Sum"].descriptor.reply_type.ends_with("i64"));
    }

    #[test]
    fn test_call_with_exact_types_borrows_argument() {
        let entries = table();
        let entry = &entries["Echo"];
        let args = Args { a: 1, b: 2 };
        let mut reply = Args::default();

        entry
            .callable
            .call(&Echo, &entry.descriptor, &args, ReplyTarget::Typed(&mut reply))
            .unwrap();
        assert_eq!(reply, args);
    }

    #[test]
    fn test_call_with_encoded_argument_and_reply() {
        let entries = table();
        let entry = &entries["Sum"];
        let mut out = None;

        entry
            .callable
            .call(
                &Echo,
                &entry.descriptor,
                &json!({"a": 20, "b": 22}),
                ReplyTarget::Encoded(&mut out),
            )
            .unwrap();
        assert_eq!(out, Some(json!(42)));
    }

    #[test]
    fn test_invalid_argument_leaves_reply_untouched() {
        let entries = table();
        let entry = &entries["Sum"];
        let mut out = None;

        let err = entry
            .callable
            .call(
                &Echo,
                &entry.descriptor,
                &json!("not args"),
                ReplyTarget::Encoded(&mut out),
            )
            .unwrap_err();
        assert!(matches!(err, RemoteError::InvalidArgument { .. }));
        assert_eq!(out, None);
    }

    #[test]
    fn test_reply_of_compatible_type_is_converted() {
        let entries = table();
        let entry = &entries["Sum"];
        let mut reply: f64 = -1.0;

        entry
            .callable
            .call(
                &Echo,
                &entry.descriptor,
                &Args { a: 1, b: 2 },
                ReplyTarget::Typed(&mut reply),
            )
            .unwrap();
        assert_eq!(reply, 3.0);
    }
}
