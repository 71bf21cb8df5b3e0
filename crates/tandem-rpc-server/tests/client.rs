//! Client-side call behaviour against a live server: timeouts, disposal of
//! pending calls and failure of outstanding calls on disconnect.

mod common;

use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tandem_rpc_server::prelude::*;

use common::{connect, tcp_server};

#[tokio::test]
async fn test_blocking_call_times_out() -> Result<()> {
    let (_server, endpoint, _) = tcp_server().await;
    let config = ConnectionConfig::default().with_request_timeout(Duration::from_millis(50));
    let client = Connection::connect(&endpoint, config).await?;

    let result = client.invoke("service.never", ()).await;
    assert!(matches!(result, Err(RpcError::Timeout(_))));
    assert_eq!(client.pending_calls().await, 0);

    // The connection stays usable after a timeout
    let reply = client.invoke("service.noParam", ()).await?;
    assert_eq!(reply.error_code(), None);
    Ok(())
}

#[tokio::test]
async fn test_disposed_handle_drops_late_reply() -> Result<()> {
    let (_server, endpoint, _) = tcp_server().await;
    let client = connect(&endpoint).await;
    let mut events = client.subscribe();

    let handle = client.call_async(Message::request("service.later", json!(["late"])))?;
    assert_eq!(client.pending_calls().await, 1);
    handle.dispose();
    assert_eq!(client.pending_calls().await, 0);

    // Give the deferred reply time to arrive and be discarded
    tokio::time::sleep(Duration::from_millis(100)).await;
    let reply = client.invoke("service.noParam", ()).await?;
    assert_eq!(events.try_recv()?, reply);
    assert!(events.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn test_server_close_fails_pending_calls() -> Result<()> {
    let (server, endpoint, _) = tcp_server().await;
    let client = connect(&endpoint).await;

    let pending = client.call_async(Message::request("service.never", ()))?;
    // Make sure the request is registered before the server goes away
    assert_eq!(client.pending_calls().await, 1);
    server.close().await?;

    let result = tokio::time::timeout(Duration::from_secs(1), pending).await?;
    assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    Ok(())
}
