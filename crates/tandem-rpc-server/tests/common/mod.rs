//! Shared fixtures for the server integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tandem_rpc_server::prelude::*;
use tracing_subscriber::EnvFilter;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Counts calls to `service.increaseCalled`
#[derive(Default)]
pub struct CallCounter {
    called: AtomicUsize,
}

impl CallCounter {
    pub fn get(&self) -> usize {
        self.called.load(Ordering::SeqCst)
    }
}

pub fn test_service() -> (Arc<CallCounter>, Arc<Service>) {
    let counter = Arc::new(CallCounter::default());
    let calls = counter.clone();

    let service = Service::builder("service")
        .method(MethodDescriptor::builder("noParam").handler(|_| Ok(Value::Null)))
        .method(
            MethodDescriptor::builder("singleParam")
                .param("string", ParamKind::String)
                .handler(|args| Ok(Value::String(args.get("string")?))),
        )
        .method(
            MethodDescriptor::builder("add")
                .param("a", ParamKind::Integer)
                .param_with_default("b", ParamKind::Integer, 1)
                .handler(|args| Ok(json!(args.get::<i64>("a")? + args.get::<i64>("b")?))),
        )
        .method(MethodDescriptor::builder("increaseCalled").handler(move |_| {
            calls.called.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }))
        .method(MethodDescriptor::builder("hugeResponse").handler(|_| {
            let mut result = serde_json::Map::new();
            for i in 0..1000 {
                result.insert(
                    format!("testKeyForHugeResponse{i}"),
                    json!("some sample data to make the response larger"),
                );
            }
            Ok(Value::Object(result))
        }))
        .method(
            MethodDescriptor::builder("later")
                .param("value", ParamKind::Any)
                .deferred(|args, reply| {
                    let value = args.value("value").cloned().unwrap_or(Value::Null);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        reply.complete(value);
                    });
                }),
        )
        .method(MethodDescriptor::builder("never").deferred(|_, reply| {
            // Keep the reply alive without ever answering
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                drop(reply);
            });
        }))
        .build();

    (counter, Arc::new(service))
}

/// A server on an ephemeral loopback port with the test service registered
pub async fn tcp_server() -> (Server, Endpoint, Arc<CallCounter>) {
    init_logging();
    let server = Server::new();
    let (counter, service) = test_service();
    assert!(server.add_service(service).await.unwrap());
    let endpoint = server.listen(Endpoint::tcp("127.0.0.1:0")).await.unwrap();
    (server, endpoint, counter)
}

pub async fn connect(endpoint: &Endpoint) -> Connection {
    Connection::connect(endpoint, ConnectionConfig::default())
        .await
        .unwrap()
}

/// Accepting is asynchronous, so poll until the server has registered everyone
pub async fn wait_for_clients(server: &Server, expected: usize) {
    for _ in 0..200 {
        if server.client_count().await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "expected {expected} clients, found {}",
        server.client_count().await.unwrap()
    );
}
