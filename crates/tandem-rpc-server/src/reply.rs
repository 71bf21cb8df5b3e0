//! Awaitable handle for an in-flight call

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tandem_json_rpc::{Message, RequestId};
use tokio::sync::{mpsc, oneshot};

use crate::connection::{CallToken, Command};
use crate::error::{RpcError, RpcResult};

/// Resolves with the reply to one request.
///
/// Dropping or [disposing](Self::dispose) the handle before the reply arrives
/// removes the call from the pending table; a reply that shows up later is
/// discarded.
#[derive(Debug)]
pub struct ReplyHandle {
    id: RequestId,
    token: CallToken,
    receiver: Option<oneshot::Receiver<RpcResult<Message>>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ReplyHandle {
    pub(crate) fn new(
        id: RequestId,
        token: CallToken,
        receiver: oneshot::Receiver<RpcResult<Message>>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            token,
            receiver: Some(receiver),
            commands,
        }
    }

    /// Id of the request this handle is waiting on
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Stop waiting for the reply
    pub fn dispose(self) {}
}

impl Future for ReplyHandle {
    type Output = RpcResult<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Poll::Ready(Err(RpcError::ConnectionClosed));
        };
        let result = match Pin::new(receiver).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(result)) => result,
            Poll::Ready(Err(_)) => Err(RpcError::ConnectionClosed),
        };
        self.receiver = None;
        Poll::Ready(result)
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        if self.receiver.is_some() {
            let _ = self.commands.send(Command::Cancel {
                id: self.id.clone(),
                token: self.token,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drop_posts_cancel() {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let (_tx, receiver) = oneshot::channel();
        let handle = ReplyHandle::new(RequestId::Number(3), 11, receiver, commands);
        handle.dispose();

        match rx.recv().await {
            Some(Command::Cancel { id, token }) => {
                assert_eq!(id, RequestId::Number(3));
                assert_eq!(token, 11);
            }
            _ => panic!("expected a cancel command"),
        }
    }

    #[tokio::test]
    async fn test_resolved_handle_does_not_cancel() {
        let (commands, mut rx) = mpsc::unbounded_channel();
        let (tx, receiver) = oneshot::channel();
        let handle = ReplyHandle::new(RequestId::Number(4), 12, receiver, commands);

        let reply = Message::response(RequestId::Number(4), serde_json::json!(1));
        tx.send(Ok(reply.clone())).unwrap();
        assert_eq!(handle.await.unwrap(), reply);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_sender_is_connection_closed() {
        let (commands, _rx) = mpsc::unbounded_channel();
        let (tx, receiver) = oneshot::channel();
        let handle = ReplyHandle::new(RequestId::from("x"), 13, receiver, commands);
        drop(tx);
        assert!(matches!(handle.await, Err(RpcError::ConnectionClosed)));
    }
}
