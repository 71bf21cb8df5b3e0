//! Service and method descriptors.
//!
//! A [`Service`] is an explicit table of invokable methods built once at
//! registration time. Each [`MethodDescriptor`] lists its parameters (name,
//! [`ParamKind`], optional default, direction) and the closure that runs the
//! method. The dispatch engine only ever looks at these tables.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value, json};

use crate::dispatch::DeferredReply;
use crate::error::MethodError;

/// Declared type of a method parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// Accepts any JSON value, including null
    Any,
    Bool,
    /// Integral numbers; `3.0` is accepted and passed on as `3`
    Integer,
    /// Any number, passed on as a floating point value
    Double,
    String,
    List,
    Map,
}

impl ParamKind {
    pub fn name(&self) -> &'static str {
        match self {
            ParamKind::Any => "any",
            ParamKind::Bool => "bool",
            ParamKind::Integer => "integer",
            ParamKind::Double => "double",
            ParamKind::String => "string",
            ParamKind::List => "list",
            ParamKind::Map => "map",
        }
    }

    /// How well `value` fits this kind, or `None` if it cannot be bound.
    ///
    /// An exact match scores 2, an integral number given to a `Double`
    /// scores 1 and `Any` always scores 0, so the most specific overload wins.
    pub fn score(&self, value: &Value) -> Option<u32> {
        match (self, value) {
            (ParamKind::Any, _) => Some(0),
            (ParamKind::Bool, Value::Bool(_)) => Some(2),
            (ParamKind::Integer, Value::Number(n)) if is_integral(n) => Some(2),
            (ParamKind::Double, Value::Number(n)) if n.is_f64() => Some(2),
            (ParamKind::Double, Value::Number(_)) => Some(1),
            (ParamKind::String, Value::String(_)) => Some(2),
            (ParamKind::List, Value::Array(_)) => Some(2),
            (ParamKind::Map, Value::Object(_)) => Some(2),
            _ => None,
        }
    }

    /// Normalise a value that already passed [`ParamKind::score`]
    pub(crate) fn coerce(&self, value: Value) -> Value {
        let converted = match (self, &value) {
            (ParamKind::Integer, Value::Number(n)) if n.is_f64() => {
                n.as_f64().map(|f| Value::from(f as i64))
            }
            (ParamKind::Double, Value::Number(n)) if !n.is_f64() => n.as_f64().map(Value::from),
            _ => None,
        };
        converted.unwrap_or(value)
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn is_integral(n: &Number) -> bool {
    n.is_i64()
        || n.is_u64()
        || n.as_f64()
            .is_some_and(|f| f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64)
}

/// Whether a parameter is only read, or also written back into the result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    InOut,
}

/// One declared parameter of a method
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDescriptor {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<Value>,
    pub direction: Direction,
}

impl ParamDescriptor {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            direction: Direction::In,
        }
    }

    pub fn is_in_out(&self) -> bool {
        self.direction == Direction::InOut
    }

    fn describe(&self) -> Value {
        let mut object = Map::new();
        object.insert("name".to_string(), Value::String(self.name.clone()));
        object.insert("type".to_string(), Value::from(self.kind.name()));
        if let Some(default) = &self.default {
            object.insert("default".to_string(), default.clone());
        }
        if self.is_in_out() {
            object.insert("inOut".to_string(), Value::Bool(true));
        }
        Value::Object(object)
    }
}

/// Body of a method that answers immediately
pub type MethodHandler = dyn Fn(&mut Arguments) -> Result<Value, MethodError> + Send + Sync;

/// Body of a method that answers later through a [`DeferredReply`]
pub type DeferredHandler = dyn Fn(Arguments, DeferredReply) + Send + Sync;

pub(crate) enum Invoker {
    Immediate(Box<MethodHandler>),
    Deferred(Box<DeferredHandler>),
}

/// An invokable method: its name, parameter list and body
pub struct MethodDescriptor {
    name: String,
    params: Vec<ParamDescriptor>,
    invoker: Invoker,
    /// Current value of each in/out parameter the caller did not supply
    slots: Mutex<HashMap<String, Value>>,
}

impl MethodDescriptor {
    pub fn builder(name: impl Into<String>) -> MethodBuilder {
        MethodBuilder {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamDescriptor] {
        &self.params
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self.invoker, Invoker::Deferred(_))
    }

    /// Human readable signature, e.g. `testMethod2(name: string = "", year: integer = 2012)`
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                let prefix = if p.is_in_out() { "inout " } else { "" };
                match &p.default {
                    Some(default) => format!("{prefix}{}: {} = {default}", p.name, p.kind),
                    None => format!("{prefix}{}: {}", p.name, p.kind),
                }
            })
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }

    pub fn describe(&self) -> Value {
        json!({
            "name": self.name,
            "params": self.params.iter().map(ParamDescriptor::describe).collect::<Vec<_>>(),
            "deferred": self.is_deferred(),
        })
    }

    pub(crate) fn invoker(&self) -> &Invoker {
        &self.invoker
    }

    pub(crate) fn slot(&self, name: &str) -> Option<Value> {
        self.slots.lock().get(name).cloned()
    }

    pub(crate) fn store_slot(&self, name: &str, value: Value) {
        if let Some(slot) = self.slots.lock().get_mut(name) {
            *slot = value;
        }
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("deferred", &self.is_deferred())
            .finish()
    }
}

/// Builder returned by [`MethodDescriptor::builder`]; finished by
/// [`MethodBuilder::handler`] or [`MethodBuilder::deferred`].
#[derive(Debug)]
pub struct MethodBuilder {
    name: String,
    params: Vec<ParamDescriptor>,
}

impl MethodBuilder {
    /// Add a required parameter
    pub fn param(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push(ParamDescriptor::new(name, kind));
        self
    }

    /// Add a parameter used when the caller omits it
    pub fn param_with_default(
        mut self,
        name: impl Into<String>,
        kind: ParamKind,
        default: impl Into<Value>,
    ) -> Self {
        let mut param = ParamDescriptor::new(name, kind);
        param.default = Some(default.into());
        self.params.push(param);
        self
    }

    /// Add an in/out parameter.
    ///
    /// It binds only from named params. When the caller leaves it out the
    /// method sees the value left by the previous such call (starting at
    /// `initial`). Its final value is merged into the result either way.
    pub fn in_out(mut self, name: impl Into<String>, kind: ParamKind, initial: impl Into<Value>) -> Self {
        let mut param = ParamDescriptor::new(name, kind);
        param.default = Some(initial.into());
        param.direction = Direction::InOut;
        self.params.push(param);
        self
    }

    pub fn handler<F>(self, handler: F) -> MethodDescriptor
    where
        F: Fn(&mut Arguments) -> Result<Value, MethodError> + Send + Sync + 'static,
    {
        let slots = self
            .params
            .iter()
            .filter(|p| p.is_in_out())
            .map(|p| (p.name.clone(), p.default.clone().unwrap_or(Value::Null)))
            .collect();
        MethodDescriptor {
            name: self.name,
            params: self.params,
            invoker: Invoker::Immediate(Box::new(handler)),
            slots: Mutex::new(slots),
        }
    }

    /// Finish with a body that answers through a [`DeferredReply`].
    ///
    /// The reply outlives the call, so in/out parameters are bound as plain
    /// inputs here.
    pub fn deferred<F>(mut self, handler: F) -> MethodDescriptor
    where
        F: Fn(Arguments, DeferredReply) + Send + Sync + 'static,
    {
        for param in &mut self.params {
            param.direction = Direction::In;
        }
        MethodDescriptor {
            name: self.name,
            params: self.params,
            invoker: Invoker::Deferred(Box::new(handler)),
            slots: Mutex::new(HashMap::new()),
        }
    }
}

/// Arguments bound to a method's declared parameters, in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    entries: Vec<(String, Value)>,
}

impl Arguments {
    pub(crate) fn new(entries: Vec<(String, Value)>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Raw value of a parameter
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Typed value of a parameter
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<T, MethodError> {
        let value = self
            .value(name)
            .ok_or_else(|| MethodError::argument(name, "no such parameter"))?;
        serde_json::from_value(value.clone()).map_err(|e| MethodError::argument(name, e))
    }

    /// Typed value of the parameter at `index` in declaration order
    pub fn get_index<T: DeserializeOwned>(&self, index: usize) -> Result<T, MethodError> {
        let (name, value) = self
            .entries
            .get(index)
            .ok_or_else(|| MethodError::argument(index.to_string(), "no such parameter"))?;
        serde_json::from_value(value.clone()).map_err(|e| MethodError::argument(name.as_str(), e))
    }

    /// Overwrite a parameter, typically an in/out one
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), MethodError> {
        let slot = self
            .entries
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| MethodError::argument(name, "no such parameter"))?;
        slot.1 = value.into();
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }
}

/// A named bundle of methods.
///
/// Registration is by handle (`Arc<Service>`); the registry never owns or
/// drops the state captured by the method closures.
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: Vec<MethodDescriptor>,
}

impl Service {
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Builder named after `T`, lower-cased (`TestService` -> `testservice`)
    pub fn builder_for<T: ?Sized>() -> ServiceBuilder {
        Self::builder(default_service_name::<T>())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    /// Distinct method names in declaration order
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for method in &self.methods {
            if !names.contains(&method.name()) {
                names.push(method.name());
            }
        }
        names
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m.name() == name)
    }

    /// Every overload registered under `name`
    pub fn overloads<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MethodDescriptor> {
        self.methods.iter().filter(move |m| m.name() == name)
    }

    /// JSON description of every method signature
    pub fn describe(&self) -> Value {
        json!({
            "name": self.name,
            "methods": self.methods.iter().map(MethodDescriptor::describe).collect::<Vec<_>>(),
        })
    }
}

#[derive(Debug)]
pub struct ServiceBuilder {
    name: String,
    methods: Vec<MethodDescriptor>,
}

impl ServiceBuilder {
    /// Add a method; adding the same name again declares an overload
    pub fn method(mut self, method: MethodDescriptor) -> Self {
        self.methods.push(method);
        self
    }

    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}

/// Lower-cased final path segment of a type name, without generics
pub fn default_service_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestService;
    struct Wrapper<T>(T);

    #[test]
    fn test_default_service_name() {
        assert_eq!(default_service_name::<TestService>(), "testservice");
        assert_eq!(default_service_name::<Wrapper<TestService>>(), "wrapper");
        assert_eq!(Service::builder_for::<TestService>().build().name(), "testservice");
    }

    #[test]
    fn test_param_kind_scores() {
        assert_eq!(ParamKind::Integer.score(&json!(10)), Some(2));
        assert_eq!(ParamKind::Integer.score(&json!(10.0)), Some(2));
        assert_eq!(ParamKind::Integer.score(&json!(3.5)), None);
        assert_eq!(ParamKind::Double.score(&json!(3.14159)), Some(2));
        assert_eq!(ParamKind::Double.score(&json!(3)), Some(1));
        assert_eq!(ParamKind::String.score(&json!(1)), None);
        assert_eq!(ParamKind::Map.score(&json!([{"foo": "bar"}])), None);
        assert_eq!(ParamKind::Any.score(&Value::Null), Some(0));
        assert_eq!(ParamKind::Bool.score(&json!("true")), None);
    }

    #[test]
    fn test_param_kind_coercion() {
        assert_eq!(ParamKind::Integer.coerce(json!(4.0)), json!(4));
        assert!(ParamKind::Integer.coerce(json!(4.0)).is_i64());
        assert!(ParamKind::Double.coerce(json!(4)).is_f64());
        assert_eq!(ParamKind::String.coerce(json!("x")), json!("x"));
    }

    #[test]
    fn test_arguments_access() {
        let mut args = Arguments::new(vec![
            ("name".to_string(), json!("KONY")),
            ("year".to_string(), json!(2012)),
        ]);

        assert_eq!(args.get::<String>("name").unwrap(), "KONY");
        assert_eq!(args.get_index::<i64>(1).unwrap(), 2012);
        assert!(args.get::<i64>("name").is_err());
        assert!(args.get::<String>("missing").is_err());

        args.set("year", 2013).unwrap();
        assert_eq!(args.value("year"), Some(&json!(2013)));
        assert!(args.set("missing", 1).is_err());
    }

    #[test]
    fn test_describe_and_signature() {
        let service = Service::builder("service")
            .method(
                MethodDescriptor::builder("testMethod2")
                    .param_with_default("name", ParamKind::String, "")
                    .param_with_default("year", ParamKind::Integer, 2012)
                    .handler(|_| Ok(Value::Null)),
            )
            .method(
                MethodDescriptor::builder("overloaded")
                    .param("input", ParamKind::Integer)
                    .handler(|_| Ok(json!(true))),
            )
            .method(
                MethodDescriptor::builder("overloaded")
                    .param("input", ParamKind::String)
                    .handler(|_| Ok(json!(false))),
            )
            .build();

        assert_eq!(service.method_names(), vec!["testMethod2", "overloaded"]);
        assert_eq!(service.overloads("overloaded").count(), 2);
        assert_eq!(
            service.methods()[0].signature(),
            r#"testMethod2(name: string = "", year: integer = 2012)"#
        );

        let description = service.describe();
        assert_eq!(description["name"], "service");
        assert_eq!(description["methods"][0]["params"][1]["default"], 2012);
        assert_eq!(description["methods"][1]["params"][0]["type"], "integer");
    }

    #[test]
    fn test_deferred_methods_have_no_in_out_params() {
        let method = MethodDescriptor::builder("later")
            .in_out("count", ParamKind::Integer, 0)
            .deferred(|_, reply| reply.complete(Value::Null));

        assert!(method.is_deferred());
        assert!(!method.params()[0].is_in_out());
        assert_eq!(method.slot("count"), None);
    }

    #[test]
    fn test_in_out_slots() {
        let method = MethodDescriptor::builder("increment")
            .in_out("total", ParamKind::Integer, 0)
            .handler(|_| Ok(Value::Null));

        assert_eq!(method.slot("total"), Some(json!(0)));
        method.store_slot("total", json!(5));
        assert_eq!(method.slot("total"), Some(json!(5)));
        method.store_slot("unknown", json!(1));
        assert_eq!(method.slot("unknown"), None);
    }
}
