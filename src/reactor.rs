//! Demultiplexes a session's inbound messages to typed handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics;
use crate::protocol::{Message, MessageType};
use crate::registry::RegistryError;

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),
    #[error("registration failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("timed out replying to peer")]
    Timeout,
    #[error("connection is closed")]
    Closed,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: Message) -> Result<(), HandlerError>;
}

#[async_trait]
pub trait DisconnectHandler: Send + Sync {
    async fn disconnected(&self);
}

/// Handler table for one session. Clones share the table so a running
/// handler can install the handlers for the next connection state.
#[derive(Clone, Default)]
pub struct Reactor {
    handlers: Arc<RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>>,
    disconnect: Arc<Mutex<Option<Arc<dyn DisconnectHandler>>>>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `message_type` to `handler`, replacing any previous one.
    pub fn register(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.insert(message_type, handler);
        }
    }

    pub fn register_disconnect(&self, handler: Arc<dyn DisconnectHandler>) {
        if let Ok(mut slot) = self.disconnect.lock() {
            *slot = Some(handler);
        }
    }

    fn handler_for(&self, message_type: MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .ok()
            .and_then(|h| h.get(&message_type).cloned())
    }

    /// Dispatch from `recv_rx` until it closes or `cancel` fires, then run
    /// the disconnect handler. The disconnect handler runs at most once
    /// across all clones.
    pub async fn run(&self, mut recv_rx: mpsc::Receiver<Message>, cancel: CancellationToken) {
        loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => break,
                msg = recv_rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            let kind = msg.kind();
            match self.handler_for(msg.message_type()) {
                Some(handler) => {
                    if let Err(e) = handler.handle(msg).await {
                        warn!(kind, error = %e, "Message handler failed");
                    }
                }
                None => {
                    metrics::response_without_handler();
                    warn!(kind, "No handler registered, dropping message");
                }
            }
        }

        let disconnect = self.disconnect.lock().ok().and_then(|mut d| d.take());
        if let Some(handler) = disconnect {
            debug!("Running disconnect handler");
            handler.disconnected().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HiMessage, PayloadMessage, RouteTableMessage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, msg: Message) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(msg.kind());
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingDisconnect {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DisconnectHandler for CountingDisconnect {
        async fn disconnected(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_type_in_order() {
        let reactor = Reactor::new();
        let recorder = Arc::new(Recorder::default());
        reactor.register(MessageType::Hi, recorder.clone());
        reactor.register(MessageType::Payload, recorder.clone());

        let (tx, rx) = mpsc::channel(8);
        tx.send(Message::Hi(HiMessage::new("a"))).await.unwrap();
        tx.send(Message::RouteTable(RouteTableMessage::default()))
            .await
            .unwrap();
        tx.send(Message::Payload(PayloadMessage::default()))
            .await
            .unwrap();
        drop(tx);

        reactor.run(rx, CancellationToken::new()).await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["hi", "payload"]);
    }

    #[tokio::test]
    async fn test_disconnect_runs_once_on_channel_close() {
        let reactor = Reactor::new();
        let disconnect = Arc::new(CountingDisconnect::default());
        reactor.register_disconnect(disconnect.clone());

        let (tx, rx) = mpsc::channel::<Message>(1);
        drop(tx);
        reactor.run(rx, CancellationToken::new()).await;

        let (_tx, rx) = mpsc::channel::<Message>(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        reactor.run(rx, cancel).await;

        assert_eq!(disconnect.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_stops_run() {
        let reactor = Reactor::new();
        let disconnect = Arc::new(CountingDisconnect::default());
        reactor.register_disconnect(disconnect.clone());

        let (_tx, rx) = mpsc::channel::<Message>(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let reactor = reactor.clone();
            let cancel = cancel.clone();
            async move { reactor.run(rx, cancel).await }
        });
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(disconnect.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_replaced() {
        let reactor = Reactor::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        reactor.register(MessageType::Hi, first.clone());
        reactor.register(MessageType::Hi, second.clone());

        let (tx, rx) = mpsc::channel(1);
        tx.send(Message::Hi(HiMessage::new("a"))).await.unwrap();
        drop(tx);
        reactor.run(rx, CancellationToken::new()).await;

        assert!(first.seen.lock().unwrap().is_empty());
        assert_eq!(second.seen.lock().unwrap().len(), 1);
    }
}
