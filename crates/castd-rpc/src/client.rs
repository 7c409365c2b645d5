//! Client-side bus connection.
//!
//! Provides [`BusConnection`] for issuing destination-routed method calls
//! and installing notification match rules. A background reader task owns
//! the receive half of the socket: replies are matched to pending calls by
//! request id, notifications are dispatched to whichever subscriptions'
//! match rules accept them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{trace, warn};

use crate::error::Error;
use crate::protocol::{
    JSONRPC_VERSION, METHOD_ADD_MATCH, MatchRule, Message, Notification, Request, RequestId,
    Response,
};
use crate::transport::BusCodec;

/// How long a call may stay unanswered before it fails.
const CALL_TIMEOUT: Duration = Duration::from_secs(30);

fn runtime_dir() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(|_| std::env::temp_dir(), PathBuf::from)
}

/// Default socket path of the bus broker.
///
/// On Linux, prefers `$XDG_RUNTIME_DIR` for proper runtime file handling.
/// Falls back to the system temp directory otherwise.
#[must_use]
pub fn bus_socket_path() -> PathBuf {
    runtime_dir().join("castd-bus.sock")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pending call waiting for its reply
type PendingReply = oneshot::Sender<Result<Response, Error>>;

struct SubscriptionEntry {
    rule: MatchRule,
    tx: mpsc::UnboundedSender<Notification>,
}

type SubscriptionMap = Arc<Mutex<HashMap<u64, SubscriptionEntry>>>;

/// One connection to the bus broker.
///
/// Dropping the connection tears down the reader task and closes the
/// socket; pending calls fail with [`Error::Disconnected`] and open
/// subscription channels end.
pub struct BusConnection {
    sink: AsyncMutex<SplitSink<Framed<UnixStream, BusCodec>, Message>>,
    pending: Arc<Mutex<HashMap<RequestId, PendingReply>>>,
    subscriptions: SubscriptionMap,
    next_id: AtomicU64,
    next_subscription: AtomicU64,
    reader: JoinHandle<()>,
}

impl BusConnection {
    /// Connect to the broker at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the socket connection fails.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let framed = Framed::new(stream, BusCodec::new());
        let (sink, stream) = framed.split();

        let pending: Arc<Mutex<HashMap<RequestId, PendingReply>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let subscriptions: SubscriptionMap = Arc::new(Mutex::new(HashMap::new()));

        let reader = tokio::spawn(read_loop(
            stream,
            Arc::clone(&pending),
            Arc::clone(&subscriptions),
        ));

        Ok(Self {
            sink: AsyncMutex::new(sink),
            pending,
            subscriptions,
            next_id: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
            reader,
        })
    }

    /// Call `method` on the encoder object of the peer named `destination`
    /// and wait for the reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Call`] carrying the remote error code and message
    /// when the peer rejects the call, [`Error::Timeout`] when no reply
    /// arrives in time, or [`Error::Disconnected`] when the connection
    /// drops while waiting.
    pub async fn call(
        &self,
        destination: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, Error> {
        trace!("calling {} on {}", method, destination);
        self.request(Request::to_encoder(destination, method, params, 0.into()))
            .await
    }

    /// Install `rule` on the broker and return the matching notification
    /// stream. The subscription is removed again when the returned handle
    /// is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the `add_match` call fails.
    pub async fn subscribe(&self, rule: MatchRule) -> Result<Subscription, Error> {
        let params = serde_json::to_value(&rule)?;
        self.request(Request::to_bus(METHOD_ADD_MATCH, Some(params), 0.into()))
            .await?;

        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.subscriptions).insert(id, SubscriptionEntry { rule, tx });

        Ok(Subscription {
            id,
            rx,
            subscriptions: Arc::clone(&self.subscriptions),
        })
    }

    async fn request(&self, mut req: Request) -> Result<Value, Error> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        req.id = Some(id.clone());

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id.clone(), tx);

        {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.send(Message::Request(req)).await {
                lock(&self.pending).remove(&id);
                return Err(e.into());
            }
        }

        let response = match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(received) => received.map_err(|_| Error::Disconnected)??,
            Err(_) => {
                lock(&self.pending).remove(&id);
                return Err(Error::Timeout);
            }
        };

        if let Some(error) = response.error {
            return Err(Error::Call {
                code: error.code,
                message: error.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }
}

impl Drop for BusConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Live notification stream for one installed match rule.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Notification>,
    subscriptions: SubscriptionMap,
}

impl Subscription {
    /// Receive the next matching notification. Returns `None` once the
    /// connection is gone.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        lock(&self.subscriptions).remove(&self.id);
    }
}

async fn read_loop(
    mut stream: SplitStream<Framed<UnixStream, BusCodec>>,
    pending: Arc<Mutex<HashMap<RequestId, PendingReply>>>,
    subscriptions: SubscriptionMap,
) {
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Response(resp)) => {
                if let Some(tx) = lock(&pending).remove(&resp.id) {
                    let _ = tx.send(Ok(resp));
                } else {
                    warn!("reply for unknown request {}", resp.id);
                }
            }
            Ok(Message::Notification(n)) => {
                dispatch_notification(&subscriptions, &n);
            }
            Ok(Message::Request(req)) => {
                if req.id.is_none() {
                    // A bare notification without a sender decodes as an
                    // id-less request; route it like any other event.
                    let n = Notification {
                        jsonrpc: JSONRPC_VERSION.to_string(),
                        sender: None,
                        path: req.path,
                        interface: req.interface,
                        method: req.method,
                        params: req.params,
                    };
                    dispatch_notification(&subscriptions, &n);
                } else {
                    warn!("unexpected incoming call: {}", req.method);
                }
            }
            Err(e) => {
                warn!("bus stream error: {}", e);
                break;
            }
        }
    }

    // The connection is gone: fail every pending call and end every
    // subscription stream.
    for (_, tx) in lock(&pending).drain() {
        let _ = tx.send(Err(Error::Disconnected));
    }
    lock(&subscriptions).clear();
}

fn dispatch_notification(subscriptions: &SubscriptionMap, n: &Notification) {
    let map = lock(subscriptions);
    let mut delivered = false;
    for entry in map.values() {
        if entry.rule.matches(n) {
            delivered |= entry.tx.send(n.clone()).is_ok();
        }
    }
    if !delivered {
        trace!("unmatched notification: {}", n.method);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        ENCODER_INTERFACE, MEMBER_PROPERTIES_CHANGED, METHOD_START, RpcError, BUS_SENDER,
        MEMBER_PRESENCE_CHANGED,
    };
    use tokio::net::UnixListener;

    fn test_socket() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.sock");
        (dir, path)
    }

    #[test]
    fn test_bus_socket_path() {
        let path = bus_socket_path();
        assert!(path.ends_with("castd-bus.sock"));
    }

    #[tokio::test]
    async fn test_call_returns_result() {
        let (_dir, path) = test_socket();
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, BusCodec::new());
            if let Some(Ok(Message::Request(req))) = framed.next().await {
                assert_eq!(req.method, METHOD_START);
                assert_eq!(req.destination.as_deref(), Some("worker.1"));
                let resp = Response::success(req.id.unwrap(), serde_json::json!({"ok": true}));
                framed.send(Message::Response(resp)).await.unwrap();
            }
        });

        let conn = BusConnection::open(&path).await.unwrap();
        let result = conn.call("worker.1", METHOD_START, None).await.unwrap();
        assert_eq!(result["ok"], true);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_surfaces_code_and_message() {
        let (_dir, path) = test_socket();
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, BusCodec::new());
            if let Some(Ok(Message::Request(req))) = framed.next().await {
                let resp = Response::error(
                    req.id.unwrap(),
                    RpcError::internal_error("pipeline refused to start"),
                );
                framed.send(Message::Response(resp)).await.unwrap();
            }
            // keep the connection open until the client is done
            let _ = framed.next().await;
        });

        let conn = BusConnection::open(&path).await.unwrap();
        let err = conn.call("worker.1", METHOD_START, None).await.unwrap_err();
        match err {
            Error::Call { code, message } => {
                assert_eq!(code, crate::protocol::INTERNAL_ERROR);
                assert!(message.contains("pipeline refused"));
            }
            other => panic!("Expected Call error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscription_receives_only_matching_notifications() {
        let (_dir, path) = test_socket();
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, BusCodec::new());
            // ack the add_match
            if let Some(Ok(Message::Request(req))) = framed.next().await {
                assert_eq!(req.method, METHOD_ADD_MATCH);
                let resp = Response::success(req.id.unwrap(), serde_json::json!({"match_id": 1}));
                framed.send(Message::Response(resp)).await.unwrap();
            }
            // a notification from the wrong sender, then the right one
            let wrong = Notification::new(
                "worker.2",
                ENCODER_INTERFACE,
                MEMBER_PROPERTIES_CHANGED,
                Some(serde_json::json!({"interface": ENCODER_INTERFACE, "changed": {"State": 1}})),
            );
            framed.send(Message::Notification(wrong)).await.unwrap();
            let right = Notification::new(
                "worker.1",
                ENCODER_INTERFACE,
                MEMBER_PROPERTIES_CHANGED,
                Some(serde_json::json!({"interface": ENCODER_INTERFACE, "changed": {"State": 3}})),
            );
            framed.send(Message::Notification(right)).await.unwrap();
            let _ = framed.next().await;
        });

        let conn = BusConnection::open(&path).await.unwrap();
        let mut sub = conn
            .subscribe(MatchRule::properties_changed("worker.1"))
            .await
            .unwrap();

        let n = sub.recv().await.unwrap();
        assert_eq!(n.sender.as_deref(), Some("worker.1"));
        let params = n.params.unwrap();
        assert_eq!(params["changed"]["State"], 3);
    }

    #[tokio::test]
    async fn test_presence_rule_scopes_by_name() {
        let (_dir, path) = test_socket();
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, BusCodec::new());
            if let Some(Ok(Message::Request(req))) = framed.next().await {
                let resp = Response::success(req.id.unwrap(), serde_json::json!({"match_id": 1}));
                framed.send(Message::Response(resp)).await.unwrap();
            }
            for name in ["worker.9", "worker.1"] {
                let n = Notification::new(
                    BUS_SENDER,
                    "castd.bus",
                    MEMBER_PRESENCE_CHANGED,
                    Some(serde_json::json!({"name": name, "present": false})),
                );
                framed.send(Message::Notification(n)).await.unwrap();
            }
            let _ = framed.next().await;
        });

        let conn = BusConnection::open(&path).await.unwrap();
        let mut sub = conn
            .subscribe(MatchRule::presence_of("worker.1"))
            .await
            .unwrap();

        let n = sub.recv().await.unwrap();
        let params = n.params.unwrap();
        assert_eq!(params["name"], "worker.1");
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_call() {
        let (_dir, path) = test_socket();
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, BusCodec::new());
            // read the request, then hang up without replying
            let _ = framed.next().await;
        });

        let conn = BusConnection::open(&path).await.unwrap();
        let err = conn.call("worker.1", METHOD_START, None).await.unwrap_err();
        assert!(matches!(err, Error::Disconnected));
    }

    #[tokio::test]
    async fn test_dropping_subscription_deregisters_it() {
        let (_dir, path) = test_socket();
        let listener = UnixListener::bind(&path).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, BusCodec::new());
            if let Some(Ok(Message::Request(req))) = framed.next().await {
                let resp = Response::success(req.id.unwrap(), serde_json::json!({"match_id": 1}));
                framed.send(Message::Response(resp)).await.unwrap();
            }
            let _ = framed.next().await;
        });

        let conn = BusConnection::open(&path).await.unwrap();
        let sub = conn
            .subscribe(MatchRule::properties_changed("worker.1"))
            .await
            .unwrap();
        assert_eq!(lock(&conn.subscriptions).len(), 1);

        drop(sub);
        assert!(lock(&conn.subscriptions).is_empty());
    }
}
