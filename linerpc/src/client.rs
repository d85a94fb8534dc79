use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use foldhash::fast::RandomState;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_inline_default::serde_inline_default;
use tokio::{
    net::TcpStream,
    sync::{Mutex, oneshot},
};

use crate::{
    Balance, ConnectionPool, Frame, PendingCallTable, Request, Response, Stub, TaskSupervisor,
    error::{Error, ErrorKind, Result},
    registry::{ServiceNode, ServiceRegistry, WatchEvent, WatchEventKind},
    tcp::{self, Connection, FrameReader},
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ClientConfig {
    /// Default per-call timeout.
    #[serde_inline_default(Duration::from_secs(120))]
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// How often abandoned calls are swept out of the pending table.
    #[serde_inline_default(Duration::from_secs(1))]
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
    #[serde_inline_default(Duration::from_secs(3))]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde_inline_default(8 << 20)]
    pub max_frame_size: usize,
    #[serde_inline_default(1024)]
    pub channel_capacity: usize,
    #[serde_inline_default(Balance::WrapToFirst)]
    pub balance: Balance,
    /// First delay before re-installing a registry watch that failed.
    #[serde_inline_default(Duration::from_millis(100))]
    #[serde(with = "humantime_serde")]
    pub watch_retry_interval: Duration,
    #[serde_inline_default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub max_watch_retry_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default()))
            .expect("every client config field has a default")
    }
}

/// Connections currently opened to one registered server.
struct Member {
    node: ServiceNode,
    conns: Vec<Arc<Connection>>,
}

/// RPC client over a registry-discovered, round-robin connection pool.
///
/// [`start`](Self::start) lists the servers under a service path and keeps
/// following that path: each server gets `weight` connections in the pool, a
/// server that leaves has its connections closed, and a connection whose peer
/// goes away drops out on its own.
pub struct RpcClient {
    config: ClientConfig,
    registry: ServiceRegistry,
    pool: Arc<ConnectionPool<Arc<Connection>>>,
    calls: Arc<PendingCallTable>,
    members: Mutex<HashMap<String, Member, RandomState>>,
    next_id: AtomicI64,
    task_supervisor: TaskSupervisor,
}

impl RpcClient {
    #[must_use]
    pub fn create(config: ClientConfig, registry: ServiceRegistry) -> Arc<Self> {
        let task_supervisor = TaskSupervisor::create();
        let calls = Arc::new(PendingCallTable::default());
        calls.start_reaper(config.reap_interval, &task_supervisor);

        Arc::new(Self {
            pool: Arc::new(ConnectionPool::new(config.balance)),
            config,
            registry,
            calls,
            members: Mutex::default(),
            next_id: AtomicI64::new(1),
            task_supervisor,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects to every server under `service_path` and keeps the pool in
    /// step with later joins and leaves.
    ///
    /// # Errors
    ///
    /// Fails if the initial watch or listing cannot be obtained. Servers that
    /// refuse connections are only logged.
    pub async fn start(self: &Arc<Self>, service_path: &str) -> Result<()> {
        // watch before listing so a change during the listing is not lost.
        let fired = self.registry.watch_events(service_path).await?;
        let nodes = self.registry.list_nodes(service_path).await?;
        self.reconcile(nodes).await;

        let this = Arc::downgrade(self);
        let registry = self.registry.clone();
        let retry = (
            self.config.watch_retry_interval,
            self.config.max_watch_retry_interval,
        );
        let service_path = service_path.to_string();
        self.task_supervisor.spawn(async move {
            let mut fired = fired;
            loop {
                match fired.await {
                    Ok(WatchEvent {
                        kind: WatchEventKind::SessionClosed,
                        ..
                    }) => {
                        tracing::warn!("registry session closed, stop following {service_path}");
                        break;
                    }
                    Ok(event) => tracing::debug!("registry event: {event:?}"),
                    Err(_) => tracing::debug!("watch on {service_path} dropped"),
                }
                fired = rearm_watch(&registry, &service_path, retry).await;
                let nodes = match registry.list_nodes(&service_path).await {
                    Ok(nodes) => nodes,
                    Err(e) => {
                        tracing::error!("list {service_path} failed: {e}");
                        continue;
                    }
                };
                let Some(this) = Weak::upgrade(&this) else {
                    break;
                };
                this.reconcile(nodes).await;
            }
        });
        Ok(())
    }

    /// Makes the pool match `nodes`: opens connections to new servers, closes
    /// those of vanished ones and reopens a server whose weight changed or
    /// whose connections have all died.
    pub async fn reconcile(&self, nodes: Vec<ServiceNode>) {
        let desired: HashMap<String, ServiceNode, RandomState> = nodes
            .into_iter()
            .filter(|node| node.weight > 0)
            .map(|node| (node.key(), node))
            .collect();

        let mut members = self.members.lock().await;

        let stale: Vec<String> = members
            .iter()
            .filter(|(key, member)| {
                desired.get(*key) != Some(&member.node)
                    || member.conns.iter().all(|c| c.is_closed())
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(member) = members.remove(&key) {
                tracing::info!("server {} left", member.node);
                self.pool.remove_where(|conn| member.conns.contains(conn));
                for conn in &member.conns {
                    conn.close();
                }
            }
        }

        for (key, node) in desired {
            if members.contains_key(&key) {
                continue;
            }
            let mut conns = Vec::with_capacity(node.weight as usize);
            for _ in 0..node.weight {
                match self.connect(&node).await {
                    Ok(conn) => {
                        self.pool.add(conn.clone());
                        conns.push(conn);
                    }
                    Err(e) => tracing::error!("connect to {node} failed: {e}"),
                }
            }
            if !conns.is_empty() {
                tracing::info!("server {node} joined with {} connections", conns.len());
                members.insert(key, Member { node, conns });
            }
        }
    }

    async fn connect(&self, node: &ServiceNode) -> Result<Arc<Connection>> {
        let connect = TcpStream::connect(node.address());
        let stream = tokio::time::timeout(self.config.connect_timeout, connect)
            .await
            .map_err(|_| {
                Error::new(
                    ErrorKind::TcpConnectFailed,
                    format!("connect to {node} timed out"),
                )
            })?
            .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, e.to_string()))?;
        let peer = stream
            .peer_addr()
            .map_err(|e| Error::new(ErrorKind::TcpConnectFailed, e.to_string()))?;

        let (conn, reader) = Connection::open(
            stream,
            peer,
            &self.task_supervisor,
            self.config.channel_capacity,
            self.config.max_frame_size,
        );

        self.task_supervisor.spawn({
            let conn = conn.clone();
            let pool = self.pool.clone();
            let calls = self.calls.clone();
            async move {
                tokio::select! {
                    () = conn.closed() => {}
                    r = Self::start_recv_loop(&conn, reader, &calls) => {
                        if let Err(e) = r {
                            tracing::warn!("connection to {peer} lost: {e}");
                        }
                    }
                }
                pool.remove(&conn);
                conn.close();
            }
        });
        Ok(conn)
    }

    async fn start_recv_loop(
        conn: &Connection,
        mut reader: FrameReader,
        calls: &PendingCallTable,
    ) -> Result<()> {
        loop {
            let frame = reader.next_frame().await?;
            match Frame::<Response>::parse(&frame) {
                Ok(Frame::Ping) => conn.send_ping().await?,
                Ok(Frame::Message(response)) => {
                    calls.complete(response);
                }
                Err(e) => tracing::warn!("drop malformed response from {}: {e}", conn.peer_addr()),
            }
        }
    }

    /// A fresh request id, unique for this client.
    pub fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends `request` and waits for its response, at most the configured
    /// timeout.
    pub async fn send(&self, request: Request) -> Response {
        self.send_timeout(request, self.config.timeout).await
    }

    /// Sends `request` over the next pooled connection and waits up to
    /// `timeout` for the response with the same id.
    ///
    /// Always yields a response: local failures are reported through its code
    /// (transport failure, invalid request, link timeout) instead of an error.
    pub async fn send_timeout(&self, request: Request, timeout: Duration) -> Response {
        let id = request.id;
        let conn = match self.pool.select() {
            Ok(conn) => conn,
            Err(e) => return Response::from_error(id, &e),
        };
        let bytes = match tcp::encode_frame(&request, self.config.max_frame_size) {
            Ok(bytes) => bytes,
            Err(e) => return Response::from_error(id, &e),
        };
        let handle = match self.calls.register(id, timeout) {
            Ok(handle) => handle,
            Err(e) => return Response::from_error(id, &e),
        };

        if let Err(e) = conn.send(bytes).await {
            tracing::warn!("send request {id} to {} failed: {e}", conn.peer_addr());
            drop(handle);
            self.pool.remove(&conn);
            return Response::from_error(id, &e);
        }
        handle.wait(timeout).await
    }

    /// A typed handle for `command`.
    #[must_use]
    pub fn stub<Req, Rsp>(self: &Arc<Self>, command: impl Into<String>) -> Stub<Req, Rsp>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        Stub::new(self.clone(), command)
    }

    #[must_use]
    pub fn pool(&self) -> &ConnectionPool<Arc<Connection>> {
        &self.pool
    }

    #[must_use]
    pub fn pending_calls(&self) -> &PendingCallTable {
        &self.calls
    }

    /// Closes every connection and stops following the registry.
    pub fn stop(&self) {
        self.task_supervisor.stop();
        self.pool.clear();
    }

    pub async fn join(&self) {
        self.task_supervisor.all_stopped().await;
    }
}

/// Re-installs the watch on `path`, backing off exponentially between failed
/// attempts until the coordination service accepts it.
async fn rearm_watch(
    registry: &ServiceRegistry,
    path: &str,
    (mut backoff, max_backoff): (Duration, Duration),
) -> oneshot::Receiver<WatchEvent> {
    loop {
        match registry.watch_events(path).await {
            Ok(fired) => return fired,
            Err(e) => {
                tracing::error!("watch {path} failed, retry in {backoff:?}: {e}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("pool", &self.pool.len())
            .field("pending", &self.calls.len())
            .finish()
    }
}
