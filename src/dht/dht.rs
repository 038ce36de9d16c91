//! DHT main module
//!
//! One DHT instance: the KRPC engine, the routing table, the server-side
//! handlers and the client side of the four BEP-5 queries.

use crate::dht::config::DhtConfig;
use crate::dht::events::{DhtEvent, EventSink};
use crate::dht::handlers::{register_all, HandlerContext, IdentityPolicy, StrictIdentity};
use crate::dht::id::NodeId;
use crate::dht::message::{decode_peers, Dict, DictExt, QueryMethod};
use crate::dht::node::{decode_nodes, Node, NodeRecord, NodeSnapshot};
use crate::dht::routing::{RoutingTable, SharedTable, StatusChange, TableRefresher};
use crate::dht::rpc::{Response, RpcEngine};
use crate::dht::token::TokenCache;
use crate::error::{DhtError, Result};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::interval_at;
use tracing::{debug, error, info, trace, warn};

/// Below this many known nodes the crawler keeps joining instead of
/// querying its neighbours
pub const NEIGHBOR_THRESHOLD: usize = 50;

/// A successful ping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingReply {
    pub id: NodeId,
    pub addr: SocketAddr,
}

/// Outcome of an iterative get_peers lookup
#[derive(Debug, Clone, Default)]
pub struct PeerLookup {
    /// Peers returned in `values` lists
    pub peers: Vec<SocketAddr>,
    /// Closest nodes learned along the way, nearest first
    pub nodes: Vec<Node>,
    /// Nodes that answered with a token, nearest first
    pub responders: Vec<Node>,
    /// Rounds of queries issued
    pub hops: usize,
}

/// Main DHT struct
pub struct Dht {
    config: DhtConfig,
    engine: Arc<RpcEngine>,
    table: SharedTable,
    context: Arc<HandlerContext>,
    /// Last token each remote handed us in a get_peers response
    tokens: RwLock<TokenCache>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Dht {
    /// Bind a DHT instance that answers known nodes with its own id
    pub async fn bind(config: DhtConfig) -> Result<Arc<Self>> {
        Self::with_policy(config, Arc::new(StrictIdentity)).await
    }

    /// Bind a DHT instance with an explicit identity policy
    pub async fn with_policy(config: DhtConfig, policy: Arc<dyn IdentityPolicy>) -> Result<Arc<Self>> {
        config.validate()?;
        info!("Creating DHT instance on {}", config.bind_addr);

        let engine = Arc::new(RpcEngine::bind(config.bind_addr, config.timeout, EventSink::new()).await?);
        let table: SharedTable = Arc::new(RwLock::new(RoutingTable::new(config.id, config.stale_after)));
        engine.observe(Arc::new(TableRefresher(Arc::clone(&table)))).await;

        let context = Arc::new(HandlerContext::new(config.id, config.k, Arc::clone(&table), policy));
        register_all(&engine, Arc::clone(&context)).await;

        info!("DHT initialized with ID: {}", config.id);
        // A responder accepts its token for one rotation after issuing it.
        let tokens = RwLock::new(TokenCache::new(config.token_rotation * 2));
        Ok(Arc::new(Self {
            config,
            engine,
            table,
            context,
            tokens,
            task: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.config.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.engine.local_addr()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub fn table(&self) -> SharedTable {
        Arc::clone(&self.table)
    }

    /// Subscribe to diagnostic events
    pub fn subscribe(&self) -> broadcast::Receiver<DhtEvent> {
        self.engine.events().subscribe()
    }

    /// Start the receive loop and the periodic timers. Calling it twice is a no-op.
    pub async fn listen(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("DHT is already listening");
            return;
        }
        let dht = Arc::clone(self);
        *task = Some(tokio::spawn(dht.run()));
        info!("DHT listening on {}", self.local_addr());
    }

    /// Stop the receive loop; outstanding queries still resolve by timeout
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            info!("DHT service stopped");
        }
    }

    pub async fn is_listening(&self) -> bool {
        self.task.lock().await.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Main DHT event loop
    async fn run(self: Arc<Self>) {
        let mut buffer = vec![0u8; self.config.max_datagram];
        let start = tokio::time::Instant::now();
        let mut check_interval = interval_at(start + self.config.check_interval, self.config.check_interval);
        let mut rotate_interval = interval_at(start + self.config.token_rotation, self.config.token_rotation);

        loop {
            tokio::select! {
                result = self.engine.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, from)) => self.engine.handle_datagram(&buffer[..len], from).await,
                        Err(e) => {
                            error!("Error receiving datagram: {}", e);
                            self.engine.events().error(e);
                        }
                    }
                }
                _ = check_interval.tick() => {
                    self.check();
                }
                _ = rotate_interval.tick() => {
                    self.context.tokens.write().await.rotate();
                    let expired_tokens = self.tokens.write().await.prune(Instant::now());
                    let expired_hashes = self.context.peers.write().await.purge_expired();
                    trace!(
                        "Rotated announce token secret; dropped {} token(s), {} infohash(es)",
                        expired_tokens,
                        expired_hashes
                    );
                }
            }
        }
    }

    /// Add a node to the routing table
    pub async fn add(&self, node: Node) -> bool {
        self.table.write().await.add(node)
    }

    pub async fn add_all(&self, nodes: impl IntoIterator<Item = Node>) -> usize {
        self.table.write().await.add_all(nodes)
    }

    pub async fn add_record(&self, record: NodeRecord) -> bool {
        self.table.write().await.add_record(record)
    }

    pub async fn has(&self, id: &NodeId) -> bool {
        self.table.read().await.has(id)
    }

    /// The `k` known nodes closest to `target`
    pub async fn get(&self, target: &NodeId, k: usize) -> Vec<Node> {
        self.table.read().await.get(target, k)
    }

    /// Get the number of nodes in routing table
    pub async fn node_count(&self) -> usize {
        self.table.read().await.len()
    }

    /// Diagnostic view of every node in the table
    pub async fn snapshot(&self) -> Vec<NodeSnapshot> {
        self.table.read().await.nodes().iter().map(Node::snapshot).collect()
    }

    /// Number of infohashes we hold announced peers for
    pub async fn stored_infohashes(&self) -> usize {
        self.context.peers.read().await.len()
    }

    /// Default remotes for a query toward `target`: the closest known nodes,
    /// topped up with the bootstrap nodes while the table is still small.
    pub async fn remotes_for(&self, target: &NodeId) -> Vec<SocketAddr> {
        let table = self.table.read().await;
        let mut remotes: Vec<SocketAddr> = table.get(target, self.config.k).iter().map(|n| n.addr).collect();
        if table.len() < self.config.k {
            for addr in &self.config.bootstrap_nodes {
                if !remotes.contains(addr) {
                    remotes.push(*addr);
                }
            }
        }
        remotes
    }

    fn base_args(&self) -> Dict {
        args_for(&self.config.id)
    }

    /// Ping one remote and return the id it reports
    pub async fn ping(&self, remote: SocketAddr) -> Result<PingReply> {
        let responses = self
            .engine
            .query(QueryMethod::Ping.as_str(), self.base_args(), &[remote])
            .await?;
        let id = responses
            .iter()
            .find_map(|r| r.values().and_then(|v| v.get_id("id")))
            .ok_or_else(|| DhtError::validation_error_with_field("ping response without id", "id"))?;
        debug!("Ping to {} answered by {}", remote, id);
        Ok(PingReply { id, addr: remote })
    }

    /// Ask `remotes` (default: [`Dht::remotes_for`]) for the nodes closest
    /// to `target`. The merged answer is sorted by distance and never
    /// contains our own id.
    pub async fn find_node(&self, target: &NodeId, remotes: Option<&[SocketAddr]>) -> Result<Vec<Node>> {
        let remotes = match remotes {
            Some(r) => r.to_vec(),
            None => self.remotes_for(target).await,
        };
        self.find_node_as(&self.config.id, target, &remotes).await
    }

    /// find_node that presents `id` as the querier
    async fn find_node_as(&self, id: &NodeId, target: &NodeId, remotes: &[SocketAddr]) -> Result<Vec<Node>> {
        let args = args_for(id).with_bytes("target", target.as_bytes().to_vec());
        let responses = self.engine.query(QueryMethod::FindNode.as_str(), args, remotes).await?;

        let mut nodes: Vec<Node> = Vec::new();
        for values in responses.iter().filter_map(Response::values) {
            let Some(compact) = values.get_bytes("nodes") else {
                continue;
            };
            for node in decode_nodes(compact) {
                if node.identifies(&self.config.id) || nodes.iter().any(|n| n.identifies(&node.id)) {
                    continue;
                }
                nodes.push(node);
            }
        }
        nodes.sort_by_key(|n| n.distance_to(target));
        debug!("find_node {} returned {} node(s) from {} response(s)", target, nodes.len(), responses.len());
        Ok(nodes)
    }

    /// Iterative get_peers lookup.
    ///
    /// Each round queries the closest not-yet-queried nodes learned so far.
    /// Stops when peers are found, when no new nodes turn up, or after
    /// `max_lookup_hops` rounds. Tokens are remembered per responder for a
    /// later [`Dht::announce_peer`].
    pub async fn get_peers(&self, info_hash: &NodeId, remotes: Option<&[SocketAddr]>) -> Result<PeerLookup> {
        let mut frontier = match remotes {
            Some(r) => r.to_vec(),
            None => self.remotes_for(info_hash).await,
        };
        if frontier.is_empty() {
            return Err(DhtError::query_failed("get_peers", Vec::new()));
        }
        let args = self.base_args().with_bytes("info_hash", info_hash.as_bytes().to_vec());
        let mut seen: HashSet<SocketAddr> = HashSet::new();
        let mut lookup = PeerLookup::default();

        while !frontier.is_empty() && lookup.hops < self.config.max_lookup_hops {
            seen.extend(frontier.iter().copied());
            lookup.hops += 1;

            let responses = match self
                .engine
                .query(QueryMethod::GetPeers.as_str(), args.clone(), &frontier)
                .await
            {
                Ok(responses) => responses,
                Err(e) if lookup.hops == 1 => return Err(e),
                Err(e) => {
                    debug!("get_peers round {} for {} failed: {}", lookup.hops, info_hash, e);
                    break;
                }
            };
            self.absorb_get_peers(&responses, &mut lookup).await;

            if !lookup.peers.is_empty() {
                break;
            }
            lookup.nodes.sort_by_key(|n| n.distance_to(info_hash));
            frontier = lookup
                .nodes
                .iter()
                .filter(|n| n.is_valid() && !seen.contains(&n.addr))
                .take(self.config.k)
                .map(|n| n.addr)
                .collect();
        }

        lookup.nodes.sort_by_key(|n| n.distance_to(info_hash));
        lookup.nodes.truncate(self.config.k);
        lookup.responders.sort_by_key(|n| n.distance_to(info_hash));
        info!(
            "get_peers {} finished after {} hop(s): {} peer(s), {} node(s)",
            info_hash,
            lookup.hops,
            lookup.peers.len(),
            lookup.nodes.len()
        );
        Ok(lookup)
    }

    async fn absorb_get_peers(&self, responses: &[Response], lookup: &mut PeerLookup) {
        let now = Instant::now();
        let mut tokens = self.tokens.write().await;
        for response in responses {
            let Some(values) = response.values() else {
                continue;
            };
            if let Some(token) = values.get_bytes("token") {
                tokens.insert(response.from, token.to_vec(), now);
                if let Some(id) = values.get_id("id") {
                    lookup.responders.push(Node::new(id, response.from));
                }
            }
            if let Some(list) = values.get_list("values") {
                for peer in decode_peers(list) {
                    if !lookup.peers.contains(&peer) {
                        lookup.peers.push(peer);
                    }
                }
            }
            if let Some(compact) = values.get_bytes("nodes") {
                for node in decode_nodes(compact) {
                    if node.identifies(&self.config.id) || lookup.nodes.iter().any(|n| n.identifies(&node.id)) {
                        continue;
                    }
                    lookup.nodes.push(node);
                }
            }
        }
    }

    /// Announce that we serve `info_hash` on `port`.
    ///
    /// Every remote gets its own transaction carrying the token it issued
    /// us. Without explicit remotes a get_peers lookup runs first and the
    /// closest `k` token holders are used.
    pub async fn announce_peer(
        &self,
        info_hash: &NodeId,
        port: u16,
        implied_port: bool,
        remotes: Option<&[SocketAddr]>,
    ) -> Result<Vec<Response>> {
        let remotes = match remotes {
            Some(r) => r.to_vec(),
            None => {
                let lookup = self.get_peers(info_hash, None).await?;
                lookup.responders.iter().take(self.config.k).map(|n| n.addr).collect()
            }
        };
        if remotes.is_empty() {
            return Err(DhtError::query_failed("announce_peer", Vec::new()));
        }

        let now = Instant::now();
        let tokens = self.tokens.read().await;
        let mut set = JoinSet::new();
        for remote in remotes {
            let token = tokens.get(&remote, now).unwrap_or_default();
            let args = self
                .base_args()
                .with_bytes("info_hash", info_hash.as_bytes().to_vec())
                .with_int("port", i64::from(port))
                .with_int("implied_port", i64::from(implied_port))
                .with_bytes("token", token);
            let engine = Arc::clone(&self.engine);
            set.spawn(async move { engine.query(QueryMethod::AnnouncePeer.as_str(), args, &[remote]).await });
        }
        drop(tokens);

        let mut responses = Vec::new();
        let mut errors = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(r)) => responses.extend(r),
                Ok(Err(DhtError::QueryFailed { errors: e, .. })) => errors.extend(e),
                Ok(Err(e)) => errors.push(e),
                Err(e) => errors.push(DhtError::network_error(format!("announce task failed: {}", e))),
            }
        }

        if responses.is_empty() {
            return Err(DhtError::query_failed("announce_peer", errors));
        }
        info!("Announced {} on port {} to {} node(s)", info_hash, port, responses.len());
        Ok(responses)
    }

    /// Populate the table with a find_node toward a random target through
    /// whatever remotes we know. Returns the number of nodes added.
    pub async fn join(&self) -> usize {
        let target = NodeId::random();
        match self.find_node(&target, None).await {
            Ok(nodes) => {
                let added = self.add_all(nodes).await;
                info!("Joined the DHT: {} node(s) added, {} known", added, self.node_count().await);
                added
            }
            Err(e) => {
                warn!("Failed to join the DHT: {}", e);
                self.engine.events().warning(e);
                0
            }
        }
    }

    /// One crawl step.
    ///
    /// While the table is small this is a [`Dht::join`]. Once it holds
    /// [`NEIGHBOR_THRESHOLD`] nodes, each of the `k` nodes closest to a
    /// random target is sent a find_node under the id the identity policy
    /// reports to it, so a crawler introduces itself as that node's
    /// neighbour. Returns the number of nodes added.
    pub async fn make_neighbors(self: &Arc<Self>) -> usize {
        if self.node_count().await < NEIGHBOR_THRESHOLD {
            return self.join().await;
        }

        let target = NodeId::random();
        let mut set = JoinSet::new();
        for node in self.get(&target, self.config.k).await {
            let id = self.context.policy.reported_id(&self.config.id, Some(&node.id));
            let dht = Arc::clone(self);
            set.spawn(async move { dht.find_node_as(&id, &target, &[node.addr]).await });
        }

        let mut added = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(nodes)) => added += self.add_all(nodes).await,
                Ok(Err(e)) => self.engine.events().warning(e),
                Err(e) => error!("Neighbour query task failed: {}", e),
            }
        }
        debug!("Crawl step toward {} added {} node(s)", target, added);
        added
    }

    /// Run one liveness sweep now
    pub fn check(self: &Arc<Self>) {
        let dht = Arc::clone(self);
        tokio::spawn(async move { dht.check_at(Instant::now()).await });
    }

    /// Run one liveness sweep as of `now`.
    ///
    /// Every node whose status changed is announced on the event channel
    /// and pinged in the background; a matching reply restores it to good.
    pub async fn check_at(self: &Arc<Self>, now: Instant) -> Vec<StatusChange> {
        let changes = self.table.write().await.sweep(now);
        for change in &changes {
            debug!("Node {} at {} is now {}", change.id, change.addr, change.status);
            self.engine.events().emit(DhtEvent::Status {
                id: change.id,
                addr: change.addr,
                status: change.status,
            });
            let dht = Arc::clone(self);
            let change = change.clone();
            tokio::spawn(async move { dht.confirm_alive(change).await });
        }
        changes
    }

    async fn confirm_alive(&self, change: StatusChange) {
        match self.ping(change.addr).await {
            Ok(reply) if reply.id == change.id => {
                self.table.write().await.confirm(&change.id, Instant::now());
                trace!("Node {} confirmed alive", change.id);
            }
            Ok(reply) => {
                self.engine.events().warning(
                    DhtError::validation_error_with_field(
                        format!("expected {} but {} answered", change.id, reply.id),
                        "id",
                    )
                    .with_node(change.addr.to_string()),
                );
            }
            Err(e) => self.engine.events().warning(e),
        }
    }
}

fn args_for(id: &NodeId) -> Dict {
    Dict::new().with_bytes("id", id.as_bytes().to_vec())
}
