//! Document context: one engine session per logical space.
//!
//! The context owns the session's [`DocRepo`] and, when this process is not
//! the durable host for the space, bridges it to a remote peer's document
//! service over a [`RelayTransport`]. The bridge treats the remote service as
//! just another CRDT network participant: inbound messages are applied as
//! remote updates, locally produced updates are pushed outbound.
//!
//! Bridge failures are logged and surfaced as a [`BridgeEvent::Closed`]
//! event, never thrown to callers; after close, no further messages are
//! delivered in either direction.

use std::sync::{Arc, Mutex};

use super::BoxFuture;
use super::handle::{DocHandle, DocUpdated};
use super::repo::DocRepo;
use super::storage::DocStorage;
use crate::config::SpaceConfig;
use crate::error::Result;
use crate::event::{Callback, CallbackRegistry, CallbackSubscription};
use crate::scope::Scope;
use crate::types::DocUrl;

/// One CRDT wire message relayed between peers.
#[derive(Debug, Clone)]
pub struct RelayMessage {
    /// URL of the document the payload belongs to.
    pub doc_url: DocUrl,
    /// Binary update payload.
    pub payload: Vec<u8>,
}

/// Opaque transport adapter carrying relay messages.
///
/// Object-safe: methods return boxed futures. `recv` returning `Ok(None)`
/// means the transport closed cleanly.
pub trait RelayTransport: Send + Sync {
    /// Send one message to the remote peer.
    fn send(&self, message: RelayMessage) -> BoxFuture<'_, Result<()>>;

    /// Receive the next message from the remote peer.
    fn recv(&self) -> BoxFuture<'_, Result<Option<RelayMessage>>>;
}

/// Lifecycle events of the relay bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The bridge stopped, cleanly or after a transport error.
    Closed,
}

struct RelayBridge {
    task: tokio::task::JoinHandle<()>,
    scope: Scope,
    _outbound: CallbackSubscription<DocUpdated>,
}

/// Owns one engine session for a space, with an optional relay bridge.
pub struct DocumentContext {
    repo: DocRepo,
    config: SpaceConfig,
    bridge: Mutex<Option<RelayBridge>>,
    bridge_events: CallbackRegistry<BridgeEvent>,
}

impl DocumentContext {
    /// Create a context over a storage backend.
    pub fn new(storage: Arc<dyn DocStorage>, config: SpaceConfig) -> Self {
        Self::from_repo(DocRepo::new(storage), config)
    }

    /// Create a context over an existing repo (used to inject custom
    /// fetchers).
    pub fn from_repo(repo: DocRepo, config: SpaceConfig) -> Self {
        Self {
            repo,
            config,
            bridge: Mutex::new(None),
            bridge_events: CallbackRegistry::new(),
        }
    }

    /// Create a context bridged to a remote document service.
    pub fn with_relay(
        storage: Arc<dyn DocStorage>,
        config: SpaceConfig,
        transport: Arc<dyn RelayTransport>,
    ) -> Self {
        let context = Self::new(storage, config);
        context.attach_relay(transport);
        context
    }

    /// Attach a relay bridge to the session.
    ///
    /// Must be called within a tokio runtime. Replaces any previous bridge
    /// without closing it; call [`close`](DocumentContext::close) first to
    /// tear one down cleanly.
    pub fn attach_relay(&self, transport: Arc<dyn RelayTransport>) {
        self.repo.set_network_backed(true);
        let scope = Scope::new();

        // Outbound: push locally produced updates to the peer.
        let outbound_transport = Arc::clone(&transport);
        let outbound_scope = scope.clone();
        let outbound = self.repo.on_local_update(Arc::new(move |update: &DocUpdated| {
            if outbound_scope.is_disposed() {
                return;
            }
            let transport = Arc::clone(&outbound_transport);
            let message = RelayMessage {
                doc_url: update.url.clone(),
                payload: update.payload.clone(),
            };
            tokio::spawn(async move {
                if let Err(err) = transport.send(message).await {
                    log::error!("relay send failed: {}", err);
                }
            });
        }));

        // Inbound: pump peer messages into the repo.
        let repo = self.repo.clone();
        let events = self.bridge_events.clone();
        let pump_scope = scope.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_scope.cancelled() => break,
                    received = transport.recv() => match received {
                        Ok(Some(message)) => {
                            if let Err(err) = repo.apply_remote(&message.doc_url, &message.payload) {
                                log::warn!(
                                    "failed to apply relayed update for {}: {}",
                                    message.doc_url,
                                    err
                                );
                            }
                        }
                        Ok(None) => {
                            log::debug!("relay transport closed");
                            break;
                        }
                        Err(err) => {
                            log::error!("relay transport error: {}", err);
                            break;
                        }
                    }
                }
            }
            events.emit(&BridgeEvent::Closed);
        });

        *self.bridge.lock().unwrap() = Some(RelayBridge {
            task,
            scope,
            _outbound: outbound,
        });
    }

    /// The session's repo.
    pub fn repo(&self) -> &DocRepo {
        &self.repo
    }

    /// The space configuration this context carries.
    pub fn config(&self) -> &SpaceConfig {
        &self.config
    }

    /// Allocate a fresh empty document.
    pub fn create(&self) -> Result<DocHandle> {
        self.repo.create()
    }

    /// Resolve a document handle by URL.
    pub fn find(&self, url: &DocUrl) -> DocHandle {
        self.repo.find(url)
    }

    /// Subscribe to bridge lifecycle events.
    pub fn on_bridge_event(
        &self,
        callback: Callback<BridgeEvent>,
    ) -> CallbackSubscription<BridgeEvent> {
        self.bridge_events.subscribe(callback)
    }

    /// Tear down the relay bridge, if any.
    ///
    /// No messages are delivered in either direction after this returns.
    pub async fn close(&self) {
        let bridge = self.bridge.lock().unwrap().take();
        if let Some(bridge) = bridge {
            bridge.scope.dispose();
            if let Err(err) = bridge.task.await {
                if !err.is_cancelled() {
                    log::warn!("relay bridge task failed: {}", err);
                }
            }
            // Unresolved finds can no longer be delivered over the relay.
            self.repo.set_network_backed(false);
        }
    }
}

impl std::fmt::Debug for DocumentContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentContext")
            .field("repo", &self.repo)
            .field("bridged", &self.bridge.lock().unwrap().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemoryStorage;
    use crate::error::LatticeError;
    use crate::types::{ObjectId, ObjectStructure};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;
    use tokio::sync::mpsc;

    struct ChannelTransport {
        outgoing: mpsc::UnboundedSender<RelayMessage>,
        incoming: AsyncMutex<mpsc::UnboundedReceiver<RelayMessage>>,
    }

    impl RelayTransport for ChannelTransport {
        fn send(&self, message: RelayMessage) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.outgoing
                    .send(message)
                    .map_err(|_| LatticeError::Transport("peer gone".to_string()))
            })
        }

        fn recv(&self) -> BoxFuture<'_, Result<Option<RelayMessage>>> {
            Box::pin(async move { Ok(self.incoming.lock().await.recv().await) })
        }
    }

    fn transport_pair() -> (Arc<ChannelTransport>, Arc<ChannelTransport>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (
            Arc::new(ChannelTransport {
                outgoing: tx_a,
                incoming: AsyncMutex::new(rx_b),
            }),
            Arc::new(ChannelTransport {
                outgoing: tx_b,
                incoming: AsyncMutex::new(rx_a),
            }),
        )
    }

    #[tokio::test]
    async fn test_updates_flow_across_bridge() {
        let (transport_a, transport_b) = transport_pair();
        let context_a = DocumentContext::with_relay(
            Arc::new(MemoryStorage::new()),
            SpaceConfig::default(),
            transport_a,
        );
        let context_b = DocumentContext::with_relay(
            Arc::new(MemoryStorage::new()),
            SpaceConfig::default(),
            transport_b,
        );

        let id = ObjectId::random();
        let handle = context_a.create().unwrap();
        handle
            .change(|doc| doc.set_object(&id, &ObjectStructure::default()))
            .unwrap();

        let mirrored = context_b.find(handle.url());
        tokio::time::timeout(std::time::Duration::from_secs(1), mirrored.when_ready())
            .await
            .expect("replication timed out")
            .unwrap();
        assert!(mirrored.doc_sync().unwrap().objects.contains_key(&id));

        context_a.close().await;
        context_b.close().await;
    }

    #[tokio::test]
    async fn test_transport_end_emits_closed() {
        let (transport_a, transport_b) = transport_pair();
        let context = DocumentContext::with_relay(
            Arc::new(MemoryStorage::new()),
            SpaceConfig::default(),
            transport_a,
        );

        let closed = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&closed);
        let _sub = context.on_bridge_event(Arc::new(move |event: &BridgeEvent| {
            assert_eq!(*event, BridgeEvent::Closed);
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        // Dropping the peer closes the channel; the pump should notice.
        drop(transport_b);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        context.close().await;
    }

    #[tokio::test]
    async fn test_close_is_clean_without_bridge() {
        let context =
            DocumentContext::new(Arc::new(MemoryStorage::new()), SpaceConfig::default());
        context.close().await;
        let _ = context.create().unwrap();
    }
}
