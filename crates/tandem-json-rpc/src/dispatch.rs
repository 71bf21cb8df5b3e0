//! Dispatch engine: resolve a call to exactly one method, bind its
//! arguments and turn the outcome into a reply.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::error::{JsonRpcError, JsonRpcErrorCode, JsonRpcErrorObject, MethodError};
use crate::message::{JsonRpcResponse, Message, RequestParams};
use crate::service::{Arguments, DeferredHandler, Invoker, MethodDescriptor, MethodHandler, Service};
use crate::types::RequestId;

/// Where a deferred reply is delivered once the method completes
pub type ReplySink = Box<dyn FnOnce(Message) + Send>;

type SharedSink = Arc<Mutex<Option<ReplySink>>>;

/// What the caller of [`ServiceRegistry::dispatch`] has to do next
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Write this reply back to the peer
    Reply(Message),
    /// A deferred method took the call; its reply goes through the sink
    Deferred,
    /// Nothing is sent (notifications, stray replies)
    NoReply,
}

impl DispatchOutcome {
    pub fn into_reply(self) -> Option<Message> {
        match self {
            DispatchOutcome::Reply(message) => Some(message),
            _ => None,
        }
    }
}

/// Completion handle handed to a deferred method.
///
/// The first of [`complete`](Self::complete) or [`fail`](Self::fail) sends
/// the reply; dropping the handle unanswered sends nothing.
pub struct DeferredReply {
    id: Option<RequestId>,
    method: String,
    sink: SharedSink,
}

impl DeferredReply {
    /// Id of the request being answered; `None` for a notification
    pub fn id(&self) -> Option<&RequestId> {
        self.id.as_ref()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    pub fn complete(self, result: impl Into<Value>) {
        self.deliver(Ok(result.into()));
    }

    pub fn fail(self, error: impl Into<MethodError>) {
        let error: MethodError = error.into();
        self.deliver(Err(error.into_error_object()));
    }

    fn deliver(&self, result: Result<Value, JsonRpcErrorObject>) {
        let Some(sink) = self.sink.lock().take() else {
            return;
        };
        if let Some(id) = self.id.clone() {
            sink(reply_message(id, result));
        }
    }
}

impl Drop for DeferredReply {
    fn drop(&mut self) {
        if self.id.is_some() && self.sink.lock().is_some() {
            debug!(method = %self.method, "Deferred reply dropped without an answer");
        }
    }
}

impl fmt::Debug for DeferredReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredReply")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("answered", &self.sink.lock().is_none())
            .finish()
    }
}

/// The set of services a server currently exposes.
///
/// Services are kept in registration order and deduplicated by handle
/// identity; several services may share a name.
#[derive(Debug, Default, Clone)]
pub struct ServiceRegistry {
    services: Vec<Arc<Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service. Returns false if this exact handle is already registered.
    pub fn add(&mut self, service: Arc<Service>) -> bool {
        if self.contains(&service) {
            return false;
        }
        debug!(service = %service.name(), "Registering service");
        self.services.push(service);
        true
    }

    /// Deregister a service. Returns false if it was not registered.
    pub fn remove(&mut self, service: &Arc<Service>) -> bool {
        match self.services.iter().position(|s| Arc::ptr_eq(s, service)) {
            Some(index) => {
                debug!(service = %service.name(), "Removing service");
                self.services.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, service: &Arc<Service>) -> bool {
        self.services.iter().any(|s| Arc::ptr_eq(s, service))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn services(&self) -> &[Arc<Service>] {
        &self.services
    }

    /// Distinct service names in registration order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for service in &self.services {
            if !names.iter().any(|n| n == service.name()) {
                names.push(service.name().to_string());
            }
        }
        names
    }

    /// Split a method path into (service, method) using the longest
    /// registered service name that prefixes it.
    pub fn resolve<'m>(&self, method: &'m str) -> Option<(&'m str, &'m str)> {
        method.rmatch_indices('.').find_map(|(index, _)| {
            let (service, name) = (&method[..index], &method[index + 1..]);
            let registered = !name.is_empty() && self.services.iter().any(|s| s.name() == service);
            registered.then_some((service, name))
        })
    }

    /// Run one inbound message.
    ///
    /// Immediate methods are answered through the returned outcome. A
    /// deferred method receives a [`DeferredReply`] that later hands its reply
    /// to `sink`; `sink` is never called for anything else.
    pub fn dispatch<F>(&self, message: &Message, sink: F) -> DispatchOutcome
    where
        F: FnOnce(Message) + Send + 'static,
    {
        match message {
            Message::Request(request) => self.call(
                Some(&request.id),
                &request.method,
                request.params.as_ref(),
                sink,
            ),
            Message::Notification(notification) => {
                self.call(None, &notification.method, notification.params.as_ref(), sink)
            }
            Message::Invalid(invalid) => {
                debug!(error = %invalid.error.error, "Answering invalid message");
                DispatchOutcome::Reply(Message::Error(invalid.error.clone()))
            }
            Message::Response(_) | Message::Error(_) => {
                debug!(id = ?message.id(), "Ignoring reply that answers no call");
                DispatchOutcome::NoReply
            }
        }
    }

    fn call<F>(
        &self,
        id: Option<&RequestId>,
        method: &str,
        params: Option<&RequestParams>,
        sink: F,
    ) -> DispatchOutcome
    where
        F: FnOnce(Message) + Send + 'static,
    {
        match (self.invoke(id, method, params, sink), id) {
            (Invocation::Done(result), Some(id)) => {
                if let Err(error) = &result {
                    debug!(method = %method, id = %id, error = %error, "Call failed");
                }
                DispatchOutcome::Reply(reply_message(id.clone(), result))
            }
            (Invocation::Done(Err(error)), None) => {
                debug!(method = %method, error = %error, "Notification failed");
                DispatchOutcome::NoReply
            }
            (Invocation::Done(Ok(_)), None) => DispatchOutcome::NoReply,
            (Invocation::Deferred, Some(_)) => DispatchOutcome::Deferred,
            (Invocation::Deferred, None) => DispatchOutcome::NoReply,
        }
    }

    fn invoke<F>(
        &self,
        id: Option<&RequestId>,
        method: &str,
        params: Option<&RequestParams>,
        sink: F,
    ) -> Invocation
    where
        F: FnOnce(Message) + Send + 'static,
    {
        let Some((service, name)) = self.resolve(method) else {
            return Invocation::Done(Err(JsonRpcErrorObject::method_not_found(method)));
        };

        let candidates: Vec<&MethodDescriptor> = self
            .services
            .iter()
            .filter(|s| s.name() == service)
            .flat_map(|s| s.overloads(name))
            .collect();
        if candidates.is_empty() {
            return Invocation::Done(Err(JsonRpcErrorObject::method_not_found(method)));
        }

        let binding = match select(method, &candidates, params) {
            Ok(binding) => binding,
            Err(error) => return Invocation::Done(Err(error)),
        };

        let descriptor = binding.method;
        match descriptor.invoker() {
            Invoker::Immediate(handler) => Invocation::Done(invoke_immediate(binding, handler)),
            Invoker::Deferred(handler) => invoke_deferred(binding, handler, id, Box::new(sink)),
        }
    }
}

enum Invocation {
    Done(Result<Value, JsonRpcErrorObject>),
    Deferred,
}

/// Arguments bound to one candidate method
struct Binding<'a> {
    method: &'a MethodDescriptor,
    score: u32,
    arguments: Arguments,
    /// In/out parameters the caller did not supply
    from_slot: Vec<String>,
}

fn bind<'a>(method: &'a MethodDescriptor, params: Option<&RequestParams>) -> Option<Binding<'a>> {
    let mut score = 0;
    let mut entries = Vec::with_capacity(method.params().len());
    let mut from_slot = Vec::new();

    match params {
        Some(RequestParams::Object(named)) => {
            if named
                .keys()
                .any(|key| !method.params().iter().any(|p| &p.name == key))
            {
                return None;
            }
            for param in method.params() {
                let value = match named.get(&param.name) {
                    Some(value) => {
                        score += param.kind.score(value)?;
                        param.kind.coerce(value.clone())
                    }
                    None if param.is_in_out() => {
                        from_slot.push(param.name.clone());
                        method.slot(&param.name).unwrap_or(Value::Null)
                    }
                    None => param.default.clone()?,
                };
                entries.push((param.name.clone(), value));
            }
        }
        positional => {
            let supplied: &[Value] = match positional {
                Some(RequestParams::Array(values)) => values,
                _ => &[],
            };
            let mut supplied = supplied.iter();
            for param in method.params() {
                let value = if param.is_in_out() {
                    from_slot.push(param.name.clone());
                    method.slot(&param.name).unwrap_or(Value::Null)
                } else {
                    match supplied.next() {
                        Some(value) => {
                            score += param.kind.score(value)?;
                            param.kind.coerce(value.clone())
                        }
                        None => param.default.clone()?,
                    }
                };
                entries.push((param.name.clone(), value));
            }
            if supplied.next().is_some() {
                return None;
            }
        }
    }

    Some(Binding {
        method,
        score,
        arguments: Arguments::new(entries),
        from_slot,
    })
}

/// Pick the single best-scoring overload
fn select<'a>(
    path: &str,
    candidates: &[&'a MethodDescriptor],
    params: Option<&RequestParams>,
) -> Result<Binding<'a>, JsonRpcErrorObject> {
    let mut best: Option<Binding<'a>> = None;
    let mut tied = false;

    for &method in candidates {
        let Some(binding) = bind(method, params) else {
            continue;
        };
        match best.as_ref().map(|b| b.score) {
            Some(score) if binding.score < score => {}
            Some(score) if binding.score == score => tied = true,
            _ => {
                best = Some(binding);
                tied = false;
            }
        }
    }

    let signatures = || json!(candidates.iter().map(|m| m.signature()).collect::<Vec<_>>());
    match best {
        None => Err(JsonRpcErrorObject::new(
            JsonRpcErrorCode::InvalidParams,
            Some(format!("No signature of '{}' accepts the given params", path)),
            Some(signatures()),
        )),
        Some(_) if tied => Err(JsonRpcErrorObject::new(
            JsonRpcErrorCode::InvalidParams,
            Some(format!("Params match more than one signature of '{}'", path)),
            Some(signatures()),
        )),
        Some(binding) => Ok(binding),
    }
}

fn invoke_immediate(
    binding: Binding<'_>,
    handler: &MethodHandler,
) -> Result<Value, JsonRpcErrorObject> {
    let Binding {
        method,
        mut arguments,
        from_slot,
        ..
    } = binding;

    let result = match catch_unwind(AssertUnwindSafe(|| handler(&mut arguments))) {
        Ok(Ok(result)) => result,
        Ok(Err(error)) => return Err(error.into_error_object()),
        Err(payload) => return Err(panic_error(method.name(), payload)),
    };

    let mut fields = Map::new();
    for param in method.params().iter().filter(|p| p.is_in_out()) {
        let value = arguments.value(&param.name).cloned().unwrap_or(Value::Null);
        if from_slot.contains(&param.name) {
            method.store_slot(&param.name, value.clone());
        }
        fields.insert(param.name.clone(), value);
    }

    if fields.is_empty() {
        Ok(result)
    } else {
        Ok(merge_in_out(result, fields))
    }
}

fn invoke_deferred(
    binding: Binding<'_>,
    handler: &DeferredHandler,
    id: Option<&RequestId>,
    sink: ReplySink,
) -> Invocation {
    let shared: SharedSink = Arc::new(Mutex::new(Some(sink)));
    let reply = DeferredReply {
        id: id.cloned(),
        method: binding.method.name().to_string(),
        sink: Arc::clone(&shared),
    };
    let arguments = binding.arguments;

    match catch_unwind(AssertUnwindSafe(|| handler(arguments, reply))) {
        Ok(()) => Invocation::Deferred,
        Err(payload) => {
            let error = panic_error(binding.method.name(), payload);
            // A reply that already went out must not be followed by a second one
            if shared.lock().take().is_some() {
                Invocation::Done(Err(error))
            } else {
                Invocation::Deferred
            }
        }
    }
}

/// Fold in/out values into the method's result
fn merge_in_out(result: Value, fields: Map<String, Value>) -> Value {
    match result {
        Value::Object(mut object) => {
            object.extend(fields);
            Value::Object(object)
        }
        Value::Null => Value::Object(fields),
        other => {
            let mut object = Map::new();
            object.insert("value".to_string(), other);
            object.extend(fields);
            Value::Object(object)
        }
    }
}

fn panic_error(method: &str, payload: Box<dyn Any + Send>) -> JsonRpcErrorObject {
    let detail = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in method handler".to_string()
    };
    warn!(method = %method, detail = %detail, "Method panicked");
    JsonRpcErrorObject::internal_error(None, Some(Value::String(detail)))
}

fn reply_message(id: RequestId, result: Result<Value, JsonRpcErrorObject>) -> Message {
    match result {
        Ok(value) => Message::Response(JsonRpcResponse::new(id, value)),
        Err(error) => Message::Error(JsonRpcError::new(Some(id), error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ParamKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service(name: &str, method: &str) -> Arc<Service> {
        let reply = format!("{name}/{method}");
        Arc::new(
            Service::builder(name)
                .method(
                    MethodDescriptor::builder(method)
                        .handler(move |_| Ok(Value::String(reply.clone()))),
                )
                .build(),
        )
    }

    fn run(registry: &ServiceRegistry, message: &Message) -> Option<Message> {
        registry.dispatch(message, |_| {}).into_reply()
    }

    #[test]
    fn test_add_and_remove_by_identity() {
        let mut registry = ServiceRegistry::new();
        let first = service("service", "a");
        let twin = service("service", "a");

        assert!(registry.add(first.clone()));
        assert!(!registry.add(first.clone()));
        assert!(registry.add(twin.clone()));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["service".to_string()]);

        assert!(registry.remove(&first));
        assert!(!registry.remove(&first));
        assert!(registry.contains(&twin));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let mut registry = ServiceRegistry::new();
        registry.add(service("service", "complex"));
        registry.add(service("service.complex.prefix.for", "testMethod"));

        assert_eq!(
            registry.resolve("service.complex.prefix.for.testMethod"),
            Some(("service.complex.prefix.for", "testMethod"))
        );
        assert_eq!(registry.resolve("service.complex"), Some(("service", "complex")));
        assert_eq!(registry.resolve("other.method"), None);
        assert_eq!(registry.resolve("service."), None);
        assert_eq!(registry.resolve("noservice"), None);
    }

    #[test]
    fn test_no_fallback_to_shorter_prefix() {
        let mut registry = ServiceRegistry::new();
        registry.add(service("a", "b.c"));
        registry.add(service("a.b", "other"));

        // "a.b" is the longest registered prefix and has no method "c"
        let reply = run(&registry, &Message::request("a.b.c", ())).unwrap();
        assert_eq!(reply.error_code(), Some(JsonRpcErrorCode::MethodNotFound));
    }

    #[test]
    fn test_services_sharing_a_name_pool_their_methods() {
        let mut registry = ServiceRegistry::new();
        registry.add(service("service", "first"));
        registry.add(service("service", "second"));

        let reply = run(&registry, &Message::request("service.second", ())).unwrap();
        assert_eq!(reply.result(), Some(&json!("service/second")));
    }

    #[test]
    fn test_notification_never_replies() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut registry = ServiceRegistry::new();
        registry.add(Arc::new(
            Service::builder("service")
                .method(MethodDescriptor::builder("increaseCalled").handler(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }))
                .build(),
        ));

        let ok = registry.dispatch(&Message::notification("service.increaseCalled", ()), |_| {});
        let missing = registry.dispatch(&Message::notification("service.nope", ()), |_| {});
        let bad_args = registry.dispatch(
            &Message::notification("service.increaseCalled", json!([1])),
            |_| {},
        );

        assert_eq!(ok, DispatchOutcome::NoReply);
        assert_eq!(missing, DispatchOutcome::NoReply);
        assert_eq!(bad_args, DispatchOutcome::NoReply);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stray_replies_are_ignored() {
        let registry = ServiceRegistry::new();
        let response = Message::response(RequestId::Number(1), json!(true));
        assert_eq!(registry.dispatch(&response, |_| {}), DispatchOutcome::NoReply);
    }

    #[test]
    fn test_invalid_message_is_answered() {
        let registry = ServiceRegistry::new();
        let invalid = Message::parse(br#"{"jsonrpc": "2.0", "id": 666}"#);

        let reply = run(&registry, &invalid).unwrap();
        assert_eq!(reply.error_code(), Some(JsonRpcErrorCode::InvalidRequest));
        assert_eq!(reply.id(), Some(&RequestId::Number(666)));
    }

    #[test]
    fn test_ambiguous_overloads() {
        let mut registry = ServiceRegistry::new();
        registry.add(Arc::new(
            Service::builder("service")
                .method(
                    MethodDescriptor::builder("either")
                        .param("value", ParamKind::Any)
                        .handler(|_| Ok(json!(1))),
                )
                .method(
                    MethodDescriptor::builder("either")
                        .param("other", ParamKind::Any)
                        .handler(|_| Ok(json!(2))),
                )
                .build(),
        ));

        let reply = run(&registry, &Message::request("service.either", json!([null]))).unwrap();
        assert_eq!(reply.error_code(), Some(JsonRpcErrorCode::InvalidParams));

        // Named params pick the overload by name
        let reply = run(&registry, &Message::request("service.either", json!({"other": 1}))).unwrap();
        assert_eq!(reply.result(), Some(&json!(2)));
    }

    #[test]
    fn test_merge_in_out_shapes() {
        let fields: Map<String, Value> = [("total".to_string(), json!(3))].into_iter().collect();

        assert_eq!(merge_in_out(Value::Null, fields.clone()), json!({"total": 3}));
        assert_eq!(
            merge_in_out(json!({"sum": 1}), fields.clone()),
            json!({"sum": 1, "total": 3})
        );
        assert_eq!(
            merge_in_out(json!("done"), fields),
            json!({"value": "done", "total": 3})
        );
    }

    #[test]
    fn test_panic_after_deferred_reply_sends_once() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut registry = ServiceRegistry::new();
        registry.add(Arc::new(
            Service::builder("service")
                .method(MethodDescriptor::builder("answerThenPanic").deferred(|_, reply| {
                    reply.complete("answered");
                    panic!("after reply");
                }))
                .method(MethodDescriptor::builder("panicFirst").deferred(|_, reply| {
                    let _keep = reply;
                    panic!("before reply");
                }))
                .build(),
        ));

        let sender = tx.clone();
        let outcome = registry.dispatch(&Message::request("service.answerThenPanic", ()), move |m| {
            let _ = sender.send(m);
        });
        assert_eq!(outcome, DispatchOutcome::Deferred);
        assert_eq!(rx.try_recv().unwrap().result(), Some(&json!("answered")));

        let outcome = registry.dispatch(&Message::request("service.panicFirst", ()), move |m| {
            let _ = tx.send(m);
        });
        let reply = outcome.into_reply().unwrap();
        assert_eq!(reply.error_code(), Some(JsonRpcErrorCode::InternalError));
        assert_eq!(reply.error_object().unwrap().data, Some(json!("before reply")));
        assert!(rx.try_recv().is_err());
    }
}
