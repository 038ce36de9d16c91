//! KRPC engine
//!
//! Owns the UDP socket. Outbound queries are fanned out to one or more
//! remotes under a single transaction id and resolve once every remote
//! has answered or the deadline passes. Inbound datagrams are decoded and
//! either settle a transaction or are dispatched to a registered handler.

use crate::dht::events::{DhtEvent, EventSink};
use crate::dht::message::{Dict, DictExt, KrpcMessage, MessageBody, TransactionId, ERROR_METHOD_UNKNOWN};
use crate::error::{DhtError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};

/// How many resolved transaction ids are remembered to recognise late replies
const RESOLVED_HISTORY: usize = 1024;

/// Attempts at drawing a transaction id not already in flight
const TRANSACTION_ID_ATTEMPTS: usize = 16;

/// A successful answer from one remote
#[derive(Debug, Clone)]
pub struct Response {
    pub message: KrpcMessage,
    pub from: SocketAddr,
}

impl Response {
    /// Return values of the response; empty for anything else
    pub fn values(&self) -> Option<&Dict> {
        match &self.message.body {
            MessageBody::Response { values } => Some(values),
            _ => None,
        }
    }
}

type Completion = oneshot::Sender<Result<Vec<Response>>>;

/// Bookkeeping of one outstanding query
#[derive(Debug)]
pub struct Transaction {
    pub id: TransactionId,
    pub message: KrpcMessage,
    pub remotes: Vec<SocketAddr>,
    pub responses: Vec<Response>,
    pub errors: Vec<DhtError>,
    answered: Vec<SocketAddr>,
    timer: Option<AbortHandle>,
    completion: Option<Completion>,
}

impl Transaction {
    fn new(message: KrpcMessage, remotes: Vec<SocketAddr>, completion: Completion) -> Self {
        Self {
            id: message.transaction_id.clone(),
            message,
            remotes,
            responses: Vec::new(),
            errors: Vec::new(),
            answered: Vec::new(),
            timer: None,
            completion: Some(completion),
        }
    }

    /// Responses plus errors received so far
    pub fn tally(&self) -> usize {
        self.responses.len() + self.errors.len()
    }

    pub fn is_complete(&self) -> bool {
        self.tally() >= self.remotes.len()
    }

    fn record(&mut self, from: SocketAddr, outcome: std::result::Result<Response, DhtError>) {
        self.answered.push(from);
        match outcome {
            Ok(response) => self.responses.push(response),
            Err(err) => self.errors.push(err),
        }
    }

    /// Fold a timeout error for every remote that has not answered, then resolve
    fn expire(mut self) {
        // The timer is the caller here; nothing left to disarm.
        self.timer = None;
        let missing = self.remotes.len().saturating_sub(self.tally());
        let unanswered: Vec<SocketAddr> = self
            .remotes
            .iter()
            .filter(|r| !self.answered.contains(r))
            .take(missing)
            .copied()
            .collect();
        for remote in unanswered {
            self.errors.push(DhtError::timeout(self.id.to_hex(), remote.to_string()));
        }
        debug!(
            "Transaction #{} timed out with {}/{} answers",
            self.id,
            self.responses.len(),
            self.remotes.len()
        );
        self.resolve();
    }

    /// Consume the transaction and fire its completion.
    ///
    /// Resolves with every successful response if there is at least one,
    /// otherwise rejects with the accumulated errors.
    fn resolve(mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let outcome = if self.responses.is_empty() {
            Err(DhtError::query_failed(self.id.to_hex(), std::mem::take(&mut self.errors)))
        } else {
            Ok(std::mem::take(&mut self.responses))
        };
        if let Some(completion) = self.completion.take() {
            // The caller may have stopped waiting; that is not an error.
            let _ = completion.send(outcome);
        }
    }
}

/// What happened to a reply that referenced a transaction id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Counted toward an open transaction
    Accepted,
    /// The transaction already resolved; dropped
    Late,
    /// Never ours
    Unknown,
}

#[derive(Debug, Default)]
struct PendingTable {
    open: HashMap<TransactionId, Transaction>,
    resolved: VecDeque<TransactionId>,
}

impl PendingTable {
    fn remember_resolved(&mut self, id: TransactionId) {
        if self.resolved.len() >= RESOLVED_HISTORY {
            self.resolved.pop_front();
        }
        self.resolved.push_back(id);
    }

    /// A transaction id not currently in flight. Falls back to a linear
    /// scan after a few random draws; `None` once every id is taken.
    fn fresh_id(&self) -> Option<TransactionId> {
        for _ in 0..TRANSACTION_ID_ATTEMPTS {
            let id = TransactionId::random();
            if !self.open.contains_key(&id) {
                return Some(id);
            }
        }
        (0..=u16::MAX)
            .map(|n| TransactionId::from(n.to_be_bytes().as_slice()))
            .find(|id| !self.open.contains_key(id))
    }
}

/// An inbound query handed to a handler
#[derive(Debug, Clone)]
pub struct InboundQuery {
    pub method: String,
    pub args: Dict,
    pub from: SocketAddr,
    pub message: KrpcMessage,
}

/// Reply channel bound to one inbound query's transaction id and sender
#[derive(Clone)]
pub struct Responder {
    engine: Arc<RpcEngine>,
    transaction_id: TransactionId,
    remote: SocketAddr,
}

impl Responder {
    /// Send `{t, y: "r", r: values}` back to the querier
    pub async fn respond(&self, values: Dict) -> Result<KrpcMessage> {
        self.engine.respond(self.remote, &self.transaction_id, values).await
    }

    /// Send a KRPC error back to the querier
    pub async fn reject(&self, code: i64, message: &str) -> Result<()> {
        let msg = KrpcMessage::error(self.transaction_id.clone(), code, message);
        self.engine.send_message(&msg, self.remote).await
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

/// Server side of one query method
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Handle a query; an error is surfaced on the event channel and no
    /// reply is sent unless the handler already sent one.
    async fn handle(&self, query: InboundQuery, responder: Responder) -> Result<()>;
}

/// Notified of every inbound response, matched or not
#[async_trait]
pub trait ResponseObserver: Send + Sync {
    async fn on_response(&self, message: &KrpcMessage, from: SocketAddr);
}

/// Transaction-tracked KRPC over UDP
pub struct RpcEngine {
    socket: UdpSocket,
    local_addr: SocketAddr,
    timeout: Duration,
    pending: Arc<Mutex<PendingTable>>,
    handlers: RwLock<HashMap<String, Arc<dyn QueryHandler>>>,
    observers: RwLock<Vec<Arc<dyn ResponseObserver>>>,
    events: EventSink,
}

impl RpcEngine {
    /// Bind the UDP socket
    pub async fn bind(bind_addr: SocketAddr, timeout: Duration, events: EventSink) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            error!("Failed to bind UDP socket to {}: {}", bind_addr, e);
            DhtError::network_error_full("Failed to bind UDP socket", bind_addr.to_string(), e.to_string())
        })?;
        let local_addr = socket.local_addr()?;
        info!("KRPC engine listening on {}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            timeout,
            pending: Arc::new(Mutex::new(PendingTable::default())),
            handlers: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
            events,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Register the handler for a query method, replacing any previous one
    pub async fn register(&self, method: &str, handler: Arc<dyn QueryHandler>) {
        self.handlers.write().await.insert(method.to_string(), handler);
    }

    /// Add a response observer
    pub async fn observe(&self, observer: Arc<dyn ResponseObserver>) {
        self.observers.write().await.push(observer);
    }

    /// Number of transactions still waiting for answers
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.open.len()
    }

    /// Issue a query to every remote under one transaction
    pub async fn query(&self, method: &str, args: Dict, remotes: &[SocketAddr]) -> Result<Vec<Response>> {
        let message = KrpcMessage::query(TransactionId::random(), method, args);
        self.send_rpc(message, remotes).await
    }

    /// Reply to a query; resolves immediately with the sent message
    pub async fn respond(&self, remote: SocketAddr, transaction_id: &TransactionId, values: Dict) -> Result<KrpcMessage> {
        let message = KrpcMessage::response(transaction_id.clone(), values);
        let mut sent = self.send_rpc(message, &[remote]).await?;
        sent.pop()
            .map(|r| r.message)
            .ok_or_else(|| DhtError::network_error("response was not sent"))
    }

    /// Send a message through the transaction machinery.
    ///
    /// Queries get a fresh transaction id and wait for their remotes.
    /// A message that is already a response does not wait on the network:
    /// it resolves at once with itself as the only value.
    pub async fn send_rpc(&self, mut message: KrpcMessage, remotes: &[SocketAddr]) -> Result<Vec<Response>> {
        if !matches!(message.body, MessageBody::Query { .. }) {
            for remote in remotes {
                self.send_message(&message, *remote).await?;
            }
            return Ok(vec![Response {
                message,
                from: self.local_addr,
            }]);
        }

        if remotes.is_empty() {
            return Err(DhtError::query_failed(message.transaction_id.to_hex(), Vec::new()));
        }

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.pending.lock().await;
            let Some(id) = pending.fresh_id() else {
                warn!("No free transaction id, {} queries in flight", pending.open.len());
                return Err(DhtError::network_error("no free transaction id"));
            };
            message.transaction_id = id.clone();
            let mut transaction = Transaction::new(message.clone(), remotes.to_vec(), tx);
            transaction.timer = Some(self.arm_timer(id.clone()));
            pending.open.insert(id.clone(), transaction);
            id
        };

        let data = message.encode()?;
        for remote in remotes {
            match self.socket.send_to(&data, remote).await {
                Ok(_) => trace!("Sent {} #{} to {}", message.message_type(), id, remote),
                Err(e) => {
                    warn!("Failed to send query #{} to {}: {}", id, remote, e);
                    let err = DhtError::network_error_full("Failed to send query", remote.to_string(), e.to_string());
                    self.settle(&id, *remote, Err(err)).await;
                }
            }
        }

        rx.await
            .map_err(|_| DhtError::network_error(format!("transaction #{} dropped", id)))?
    }

    /// Encode and send one message to one remote, no bookkeeping
    pub async fn send_message(&self, message: &KrpcMessage, remote: SocketAddr) -> Result<()> {
        let data = message.encode()?;
        self.socket.send_to(&data, remote).await.map_err(|e| {
            DhtError::network_error_full("Failed to send message", remote.to_string(), e.to_string())
        })?;
        trace!("Sent {} #{} to {}", message.message_type(), message.transaction_id, remote);
        Ok(())
    }

    /// Receive one datagram from the socket
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }

    fn arm_timer(&self, id: TransactionId) -> AbortHandle {
        let pending = Arc::clone(&self.pending);
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let mut pending = pending.lock().await;
                let expired = pending.open.remove(&id);
                if expired.is_some() {
                    pending.remember_resolved(id);
                }
                expired
            };
            if let Some(transaction) = expired {
                transaction.expire();
            }
        });
        handle.abort_handle()
    }

    /// Count one answer toward a transaction and resolve it if complete
    async fn settle(&self, id: &TransactionId, from: SocketAddr, outcome: std::result::Result<Response, DhtError>) -> Delivery {
        let (delivery, completed) = {
            let mut pending = self.pending.lock().await;
            let table = &mut *pending;
            if let Some(transaction) = table.open.get_mut(id) {
                transaction.record(from, outcome);
                if transaction.is_complete() {
                    let completed = table.open.remove(id);
                    table.remember_resolved(id.clone());
                    (Delivery::Accepted, completed)
                } else {
                    (Delivery::Accepted, None)
                }
            } else if table.resolved.contains(id) {
                (Delivery::Late, None)
            } else {
                (Delivery::Unknown, None)
            }
        };
        if let Some(transaction) = completed {
            trace!("Transaction #{} complete", transaction.id);
            transaction.resolve();
        }
        delivery
    }

    /// Decode and dispatch one inbound datagram. Never fails: every problem
    /// is reported on the event channel.
    pub async fn handle_datagram(self: &Arc<Self>, data: &[u8], from: SocketAddr) {
        trace!("Handling message from {} ({} bytes)", from, data.len());
        let message = match KrpcMessage::decode(data) {
            Ok(message) => message,
            Err(err) => {
                self.events.error(err.with_node(format!("{} ({} bytes)", from, data.len())));
                return;
            }
        };

        match &message.body {
            MessageBody::Response { .. } => {
                let id = message.transaction_id.clone();
                let response = Response {
                    message: message.clone(),
                    from,
                };
                match self.settle(&id, from, Ok(response)).await {
                    Delivery::Accepted => {}
                    Delivery::Late => trace!("Dropping late response #{} from {}", id, from),
                    Delivery::Unknown => {
                        self.events.error(DhtError::unknown_transaction(
                            id.to_hex(),
                            message.message_type(),
                            data,
                            from.to_string(),
                        ));
                    }
                }
                self.events.emit(DhtEvent::Response {
                    transaction_id: id,
                    from,
                });
                let observers = self.observers.read().await.clone();
                for observer in observers {
                    observer.on_response(&message, from).await;
                }
            }
            MessageBody::Query { method, args } => {
                debug!("Received {} query from {}", method, from);
                self.events.emit(DhtEvent::Query {
                    method: method.clone(),
                    transaction_id: message.transaction_id.clone(),
                    from,
                    info_hash: args.get_id("info_hash"),
                });
                let handler = self.handlers.read().await.get(method).cloned();
                let Some(handler) = handler else {
                    self.events.error(DhtError::node_not_found(
                        method.clone(),
                        message.sender_id().map(|id| id.to_hex()),
                        from.to_string(),
                    ));
                    let reply =
                        KrpcMessage::error(message.transaction_id.clone(), ERROR_METHOD_UNKNOWN, "Method Unknown");
                    if let Err(e) = self.send_message(&reply, from).await {
                        warn!("Failed to send method-unknown error to {}: {}", from, e);
                    }
                    return;
                };
                let query = InboundQuery {
                    method: method.clone(),
                    args: args.clone(),
                    from,
                    message: message.clone(),
                };
                let responder = Responder {
                    engine: Arc::clone(self),
                    transaction_id: message.transaction_id.clone(),
                    remote: from,
                };
                if let Err(err) = handler.handle(query, responder).await {
                    self.events.error(err);
                }
            }
            MessageBody::Error { code, message: text } => {
                let err = DhtError::protocol_error_with_node(*code, text.clone(), from.to_string());
                debug!("Received error #{} from {}: {}", message.transaction_id, from, err);
                self.settle(&message.transaction_id, from, Err(err.clone())).await;
                self.events.error(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::events::DhtEvent;
    use tokio::time::timeout;

    async fn engine(timeout_ms: u64) -> Arc<RpcEngine> {
        let engine = RpcEngine::bind(
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_millis(timeout_ms),
            EventSink::new(),
        )
        .await
        .unwrap();
        let engine = Arc::new(engine);
        let receiver = Arc::clone(&engine);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                if let Ok((len, from)) = receiver.recv_from(&mut buf).await {
                    receiver.handle_datagram(&buf[..len], from).await;
                }
            }
        });
        engine
    }

    async fn remote() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    /// Read one query off a fake remote
    async fn recv_query(socket: &UdpSocket) -> (KrpcMessage, SocketAddr) {
        let mut buf = vec![0u8; 4096];
        let (len, from) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (KrpcMessage::decode(&buf[..len]).unwrap(), from)
    }

    async fn reply(socket: &UdpSocket, query: &KrpcMessage, to: SocketAddr, id: u8) {
        let msg = KrpcMessage::response(query.transaction_id.clone(), Dict::new().with_bytes("id", vec![id; 20]));
        socket.send_to(&msg.encode().unwrap(), to).await.unwrap();
    }

    #[tokio::test]
    async fn test_fan_out_resolves_when_all_answer_out_of_order() {
        let engine = engine(2000).await;
        let (r1, a1) = remote().await;
        let (r2, a2) = remote().await;
        let (r3, a3) = remote().await;

        let q = Arc::clone(&engine);
        let task = tokio::spawn(async move {
            q.query("ping", Dict::new().with_bytes("id", vec![0u8; 20]), &[a1, a2, a3]).await
        });

        let (m1, from) = recv_query(&r1).await;
        let (m2, _) = recv_query(&r2).await;
        let (m3, _) = recv_query(&r3).await;
        assert_eq!(m1.transaction_id, m2.transaction_id);
        assert_eq!(m2.transaction_id, m3.transaction_id);

        reply(&r3, &m3, from, 3).await;
        reply(&r1, &m1, from, 1).await;
        reply(&r2, &m2, from, 2).await;

        let responses = timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();
        assert_eq!(responses.len(), 3);
        assert_eq!(engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_total_timeout_rejects_with_one_error_per_remote() {
        let engine = engine(150).await;
        let (_r1, a1) = remote().await;
        let (_r2, a2) = remote().await;
        let (_r3, a3) = remote().await;

        let err = engine.query("ping", Dict::new(), &[a1, a2, a3]).await.unwrap_err();
        let errors = err.errors();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(DhtError::is_timeout));
        assert_eq!(engine.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_partial_answers_resolve_successfully_at_timeout() {
        let engine = engine(300).await;
        let (r1, a1) = remote().await;
        let (_r2, a2) = remote().await;

        let q = Arc::clone(&engine);
        let task = tokio::spawn(async move { q.query("ping", Dict::new(), &[a1, a2]).await });
        let (m1, from) = recv_query(&r1).await;
        reply(&r1, &m1, from, 1).await;

        let responses = task.await.unwrap().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].from, a1);
        assert_eq!(responses[0].values().unwrap().get_id("id").unwrap().0, [1u8; 20]);
    }

    #[tokio::test]
    async fn test_duplicate_response_after_resolution_is_dropped() {
        let engine = engine(2000).await;
        let mut events = engine.events().subscribe();
        let (r1, a1) = remote().await;

        let q = Arc::clone(&engine);
        let task = tokio::spawn(async move { q.query("ping", Dict::new(), &[a1]).await });
        let (m1, from) = recv_query(&r1).await;
        reply(&r1, &m1, from, 1).await;
        let responses = task.await.unwrap().unwrap();
        assert_eq!(responses.len(), 1);

        reply(&r1, &m1, from, 1).await;

        // The duplicate is observed as a response but never reported as unknown.
        let mut responses_seen = 0;
        while let Ok(Ok(event)) = timeout(Duration::from_millis(300), events.recv()).await {
            match event {
                DhtEvent::Response { .. } => responses_seen += 1,
                DhtEvent::Error(err) => panic!("unexpected error event {}", err),
                _ => {}
            }
        }
        assert_eq!(responses_seen, 2);
    }

    #[tokio::test]
    async fn test_error_reply_counts_toward_transaction() {
        let engine = engine(2000).await;
        let (r1, a1) = remote().await;

        let q = Arc::clone(&engine);
        let task = tokio::spawn(async move { q.query("get_peers", Dict::new(), &[a1]).await });
        let (m1, from) = recv_query(&r1).await;
        let err = KrpcMessage::error(m1.transaction_id.clone(), 201, "A Generic Error Ocurred");
        r1.send_to(&err.encode().unwrap(), from).await.unwrap();

        let err = timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err.errors(), [DhtError::ProtocolError { code: 201, .. }]));
    }

    #[tokio::test]
    async fn test_unknown_transaction_and_garbage_are_reported() {
        let engine = engine(2000).await;
        let mut events = engine.events().subscribe();
        let (r1, _) = remote().await;

        r1.send_to(b"garbage", engine.local_addr()).await.unwrap();
        let stray = KrpcMessage::response(TransactionId::from(b"zz".as_slice()), Dict::new());
        r1.send_to(&stray.encode().unwrap(), engine.local_addr()).await.unwrap();

        let mut decode_errors = 0;
        let mut unknown = 0;
        while let Ok(Ok(event)) = timeout(Duration::from_millis(300), events.recv()).await {
            match event {
                DhtEvent::Error(DhtError::DecodeError { .. }) => decode_errors += 1,
                DhtEvent::Error(DhtError::UnknownTransaction { message_type, raw, .. }) => {
                    assert_eq!(message_type, "r");
                    assert_eq!(raw, hex::encode(stray.encode().unwrap()));
                    unknown += 1;
                }
                _ => {}
            }
        }
        assert_eq!(decode_errors, 1);
        assert_eq!(unknown, 1);
    }

    #[tokio::test]
    async fn test_respond_resolves_without_waiting() {
        let engine = engine(60_000).await;
        let (r1, a1) = remote().await;
        let tid = TransactionId::from(b"ab".as_slice());

        let sent = timeout(Duration::from_millis(500), engine.respond(a1, &tid, Dict::new().with_bytes("id", vec![5u8; 20])))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent.transaction_id, tid);
        assert_eq!(engine.pending_count().await, 0);

        let (received, _) = recv_query(&r1).await;
        assert_eq!(received, sent);
    }

    struct Echo;

    #[async_trait]
    impl QueryHandler for Echo {
        async fn handle(&self, query: InboundQuery, responder: Responder) -> Result<()> {
            responder.respond(query.args).await.map(|_| ())
        }
    }

    #[tokio::test]
    async fn test_query_dispatch_to_registered_handler() {
        let server = engine(2000).await;
        server.register("echo", Arc::new(Echo)).await;
        let client = engine(2000).await;

        let responses = client
            .query("echo", Dict::new().with_bytes("word", b"hello".to_vec()), &[server.local_addr()])
            .await
            .unwrap();
        assert_eq!(responses[0].values().unwrap().get_bytes("word"), Some(b"hello".as_slice()));

        let err = client
            .query("missing", Dict::new(), &[server.local_addr()])
            .await
            .unwrap_err();
        assert!(matches!(err.errors(), [DhtError::ProtocolError { code: 204, .. }]));
    }

    #[tokio::test]
    async fn test_mixed_answers_resolve_before_timeout() {
        let engine = engine(5000).await;
        let (r1, a1) = remote().await;
        let (r2, a2) = remote().await;
        let (r3, a3) = remote().await;

        let q = Arc::clone(&engine);
        let task = tokio::spawn(async move { q.query("get_peers", Dict::new(), &[a1, a2, a3]).await });
        let (m1, from) = recv_query(&r1).await;
        let (m2, _) = recv_query(&r2).await;
        let (m3, _) = recv_query(&r3).await;

        reply(&r1, &m1, from, 1).await;
        let err = KrpcMessage::error(m2.transaction_id.clone(), 201, "A Generic Error Ocurred");
        r2.send_to(&err.encode().unwrap(), from).await.unwrap();
        reply(&r3, &m3, from, 3).await;

        // Two successes plus one error settle all three remotes well before the deadline.
        let responses = timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();
        let mut senders: Vec<SocketAddr> = responses.iter().map(|r| r.from).collect();
        senders.sort();
        let mut expected = vec![a1, a3];
        expected.sort();
        assert_eq!(senders, expected);
        assert_eq!(engine.pending_count().await, 0);
    }

    #[test]
    fn test_fresh_id_exhaustion() {
        let mut pending = PendingTable::default();
        let message = KrpcMessage::query(TransactionId::random(), "ping", Dict::new());
        for n in 0..=u16::MAX {
            let id = TransactionId::from(n.to_be_bytes().as_slice());
            let (tx, _rx) = oneshot::channel();
            pending.open.insert(id, Transaction::new(message.clone(), Vec::new(), tx));
            if n == u16::MAX - 1 {
                let last = TransactionId::from(u16::MAX.to_be_bytes().as_slice());
                assert_eq!(pending.fresh_id(), Some(last));
            }
        }
        assert_eq!(pending.fresh_id(), None);
    }
}
