//! Endpoint targets and the factories that bind them per call.
//!
//! A [`Factory`] turns the constructor arguments carried by a request into the
//! concrete [`Handler`] to invoke:
//!
//! - [`Factory::function`]: the same function every time.
//! - [`Factory::instance_method`]: a fresh instance is built from the request's
//!   `ctor_args`/`ctor_kwargs` on every call, and the method runs against it.
//! - [`Factory::static_like`]: a method on a fixed, shared owner; no instance
//!   is constructed.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use fastpipe_core::types::{SERIALIZATION_ERROR, TYPE_ERROR};
use fastpipe_core::{ArgumentError, Arguments};

/// A bound, invocable endpoint target.
pub type Handler = Arc<dyn Fn(&Arguments) -> Result<Value, EndpointError> + Send + Sync>;

type Binder = Arc<dyn Fn(&Arguments) -> Result<Handler, EndpointError> + Send + Sync>;

/// Failure raised by an endpoint, reported to the caller as `{type, message}`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct EndpointError {
    pub kind: String,
    pub message: String,
}

impl EndpointError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(TYPE_ERROR, message)
    }

    pub fn serialization(source: serde_json::Error) -> Self {
        Self::new(
            SERIALIZATION_ERROR,
            format!("result is not JSON serializable: {source}"),
        )
    }
}

impl From<ArgumentError> for EndpointError {
    fn from(err: ArgumentError) -> Self {
        Self::type_error(err.to_string())
    }
}

/// Which binding strategy a [`Factory`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryKind {
    Function,
    InstanceMethod,
    StaticLike,
}

impl fmt::Display for FactoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactoryKind::Function => write!(f, "function"),
            FactoryKind::InstanceMethod => write!(f, "instance method"),
            FactoryKind::StaticLike => write!(f, "static"),
        }
    }
}

/// Strategy producing the concrete target for an endpoint at call time.
#[derive(Clone)]
pub enum Factory {
    Function(Handler),
    InstanceMethod(Binder),
    StaticLike(Handler),
}

impl Factory {
    /// Plain function endpoint.
    pub fn function<F, R>(f: F) -> Self
    where
        F: Fn(&Arguments) -> Result<R, EndpointError> + Send + Sync + 'static,
        R: Serialize,
    {
        Factory::Function(Arc::new(move |call: &Arguments| into_json(f(call))))
    }

    /// Method on a `T` constructed from the request's constructor arguments.
    ///
    /// `construct` runs on every call; instances are never reused.
    pub fn instance_method<T, C, M, R>(construct: C, method: M) -> Self
    where
        T: Send + Sync + 'static,
        C: Fn(&Arguments) -> Result<T, EndpointError> + Send + Sync + 'static,
        M: Fn(&T, &Arguments) -> Result<R, EndpointError> + Send + Sync + 'static,
        R: Serialize,
    {
        let method = Arc::new(method);
        Factory::InstanceMethod(Arc::new(move |ctor: &Arguments| -> Result<Handler, EndpointError> {
            let instance = Arc::new(construct(ctor)?);
            let method = Arc::clone(&method);
            let handler: Handler =
                Arc::new(move |call: &Arguments| into_json(method(instance.as_ref(), call)));
            Ok(handler)
        }))
    }

    /// Method on a shared `owner`, ignoring constructor arguments.
    pub fn static_like<T, M, R>(owner: Arc<T>, method: M) -> Self
    where
        T: Send + Sync + 'static,
        M: Fn(&T, &Arguments) -> Result<R, EndpointError> + Send + Sync + 'static,
        R: Serialize,
    {
        Factory::StaticLike(Arc::new(move |call: &Arguments| {
            into_json(method(owner.as_ref(), call))
        }))
    }

    pub fn kind(&self) -> FactoryKind {
        match self {
            Factory::Function(_) => FactoryKind::Function,
            Factory::InstanceMethod(_) => FactoryKind::InstanceMethod,
            Factory::StaticLike(_) => FactoryKind::StaticLike,
        }
    }

    /// Produce the target for one invocation.
    pub fn bind(&self, ctor: &Arguments) -> Result<Handler, EndpointError> {
        match self {
            Factory::Function(handler) | Factory::StaticLike(handler) => Ok(Arc::clone(handler)),
            Factory::InstanceMethod(binder) => binder(ctor),
        }
    }

    /// Bind and call in one step.
    pub fn invoke(&self, ctor: &Arguments, call: &Arguments) -> Result<Value, EndpointError> {
        let target = self.bind(ctor)?;
        target(call)
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Factory").field(&self.kind()).finish()
    }
}

fn into_json<R: Serialize>(result: Result<R, EndpointError>) -> Result<Value, EndpointError> {
    let value = result?;
    serde_json::to_value(value).map_err(EndpointError::serialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Greeter {
        greeting: String,
    }

    #[test]
    fn function_factory_returns_same_target() {
        let factory = Factory::function(|call: &Arguments| {
            let x: i64 = call.param(0, "x")?;
            Ok(x * 2)
        });
        assert_eq!(factory.kind(), FactoryKind::Function);
        let value = factory
            .invoke(&Arguments::new(), &Arguments::positional([21]))
            .expect("invoke");
        assert_eq!(value, Value::from(42));
    }

    #[test]
    fn instance_method_constructs_per_call() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&constructed);
        let factory = Factory::instance_method(
            move |ctor: &Arguments| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Greeter {
                    greeting: ctor.param(0, "greeting")?,
                })
            },
            |greeter: &Greeter, call: &Arguments| {
                let name: String = call.param(0, "name")?;
                Ok(format!("{}, {name}", greeter.greeting))
            },
        );

        let hello = Arguments::positional(["Hello"]);
        let hola = Arguments::new().with_kwarg("greeting", "Hola");
        let who = Arguments::positional(["Ana"]);
        assert_eq!(factory.invoke(&hello, &who).expect("hello"), Value::from("Hello, Ana"));
        assert_eq!(factory.invoke(&hola, &who).expect("hola"), Value::from("Hola, Ana"));
        assert_eq!(factory.invoke(&hello, &who).expect("again"), Value::from("Hello, Ana"));
        assert_eq!(constructed.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn instance_method_constructor_failure_is_reported() {
        let factory = Factory::instance_method(
            |ctor: &Arguments| {
                Ok(Greeter {
                    greeting: ctor.param(0, "greeting")?,
                })
            },
            |greeter: &Greeter, _call: &Arguments| Ok(greeter.greeting.clone()),
        );
        let err = factory.bind(&Arguments::new()).err().expect("missing ctor arg");
        assert_eq!(err.kind, TYPE_ERROR);
        assert!(err.message.contains("greeting"));
    }

    #[test]
    fn static_like_ignores_ctor_arguments() {
        let owner = Arc::new(Greeter {
            greeting: "fixed".to_string(),
        });
        let factory =
            Factory::static_like(owner, |greeter: &Greeter, _call: &Arguments| Ok(greeter.greeting.clone()));
        let value = factory
            .invoke(&Arguments::positional(["ignored"]), &Arguments::new())
            .expect("invoke");
        assert_eq!(value, Value::from("fixed"));
        assert_eq!(factory.kind(), FactoryKind::StaticLike);
    }

    #[test]
    fn unserializable_result_becomes_serialization_error() {
        let factory = Factory::function(|_call: &Arguments| {
            let mut map = HashMap::new();
            map.insert((1, 2), "tuple keys are not JSON");
            Ok(map)
        });
        let err = factory.invoke(&Arguments::new(), &Arguments::new()).unwrap_err();
        assert_eq!(err.kind, SERIALIZATION_ERROR);
    }
}
