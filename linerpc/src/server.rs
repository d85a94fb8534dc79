use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use serde_json::Value;
use tokio::{net::TcpStream, sync::Semaphore, time::Instant};

use crate::{
    DispatchRegistry, Frame, Listener, Response, ServerDispatcher, ServerRequest, TaskSupervisor,
    error::{Error, ErrorKind, Result},
    msg::code,
    registry::{CreateMode, ServiceNode, ServiceRegistry},
    tcp::{self, Connection, FrameReader},
};

#[serde_inline_default]
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct ServerConfig {
    /// Requests processed concurrently across all connections.
    #[serde_inline_default(10)]
    pub workers: usize,
    #[serde_inline_default(8 << 20)]
    pub max_frame_size: usize,
    #[serde_inline_default(1024)]
    pub channel_capacity: usize,
    /// A connection silent for this long is sent a ping.
    #[serde_inline_default(Duration::from_secs(20))]
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// A connection silent for this long is closed.
    #[serde_inline_default(Duration::from_secs(60))]
    #[serde(with = "humantime_serde")]
    pub read_idle_timeout: Duration,
    #[serde_inline_default(1)]
    pub weight: u32,
    #[serde_inline_default("/servers".to_string())]
    pub service_path: String,
    /// Host published in the registry. Defaults to the bound IP, or loopback
    /// when bound to an unspecified address.
    #[serde_inline_default(None)]
    pub advertise_host: Option<String>,
    /// Register with a sequential suffix so restarts never collide with a
    /// node that has not expired yet.
    #[serde_inline_default(false)]
    pub sequential: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        serde_json::from_value(Value::Object(serde_json::Map::default()))
            .expect("every server config field has a default")
    }
}

/// RPC server: accepts connections, dispatches each request to its command
/// handler on a bounded set of workers and writes the response back on the
/// connection the request came in on.
///
/// ```rust,no_run
/// # use linerpc::{DispatchRegistry, RpcServer, ServerConfig};
/// # use std::sync::Arc;
/// # #[tokio::main]
/// # async fn main() {
/// let mut registry = DispatchRegistry::default();
/// registry
///     .register("echo", |s: String| async move { Ok::<_, linerpc::Error>(s) })
///     .unwrap();
///
/// let server = Arc::new(RpcServer::create(registry, ServerConfig::default()));
/// let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
/// println!("listening on {addr}");
/// server.join().await;
/// # }
/// ```
pub struct RpcServer {
    config: ServerConfig,
    dispatcher: Arc<ServerDispatcher>,
    workers: Arc<Semaphore>,
    registry: Option<ServiceRegistry>,
    listener: Listener,
    task_supervisor: TaskSupervisor,
    registered: Mutex<Vec<String>>,
}

impl RpcServer {
    #[must_use]
    pub fn create(registry: DispatchRegistry, config: ServerConfig) -> Self {
        Self {
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            dispatcher: Arc::new(ServerDispatcher::new(registry)),
            config,
            registry: None,
            listener: Listener::default(),
            task_supervisor: TaskSupervisor::create(),
            registered: Mutex::default(),
        }
    }

    /// Publishes this server in `registry` once it listens.
    #[must_use]
    pub fn with_registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn dispatcher(&self) -> &ServerDispatcher {
        &self.dispatcher
    }

    /// Registry paths this server created.
    #[must_use]
    pub fn registered_paths(&self) -> Vec<String> {
        match self.registered.lock() {
            Ok(paths) => paths.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Binds `addr`, starts accepting connections and, if a registry is
    /// attached, publishes `host#port#weight#` under the service path.
    ///
    /// Returns the bound address, which differs from `addr` when port 0 was
    /// requested.
    ///
    /// # Errors
    ///
    /// Fails if `addr` cannot be bound or the registry node cannot be created.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let this = self.clone();
        let bound = self
            .listener
            .start_listen(addr, move |stream, peer| this.handle_new_stream(stream, peer))
            .await?;

        if let Some(registry) = &self.registry {
            let host = match &self.config.advertise_host {
                Some(host) => host.clone(),
                None if bound.ip().is_unspecified() => "127.0.0.1".to_string(),
                None => bound.ip().to_string(),
            };
            let node = ServiceNode::new(host, bound.port(), self.config.weight);
            let mode = if self.config.sequential {
                CreateMode::EphemeralSequential
            } else {
                CreateMode::Ephemeral
            };
            let path = registry
                .register_node(&self.config.service_path, &node, mode)
                .await
                .inspect_err(|e| tracing::error!("register {node} failed: {e}"))?;
            match self.registered.lock() {
                Ok(mut paths) => paths.push(path),
                Err(poisoned) => poisoned.into_inner().push(path),
            }
        }
        Ok(bound)
    }

    /// Withdraws this server from the registry, then stops it. Clients drop
    /// their connections to it on the resulting watch event instead of on
    /// the connection reset.
    pub async fn shutdown(&self) {
        let paths = match self.registered.lock() {
            Ok(mut paths) => std::mem::take(&mut *paths),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if let Some(registry) = &self.registry {
            for path in paths {
                if let Err(e) = registry.unregister(&path).await {
                    tracing::error!("unregister {path} failed: {e}");
                }
            }
        }
        self.stop();
    }

    /// Stops accepting and closes every connection.
    pub fn stop(&self) {
        self.listener.stop();
        self.task_supervisor.stop();
    }

    pub async fn join(&self) {
        self.listener.join().await;
        self.task_supervisor.all_stopped().await;
    }

    fn handle_new_stream(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (conn, reader) = Connection::open(
            stream,
            peer,
            &self.task_supervisor,
            self.config.channel_capacity,
            self.config.max_frame_size,
        );
        tracing::debug!("accepted connection {} from {peer}", conn.id());

        let this = self.clone();
        self.task_supervisor.spawn(async move {
            tokio::select! {
                () = conn.closed() => {}
                r = this.start_recv_loop(&conn, reader) => {
                    if let Err(e) = r {
                        tracing::info!("connection from {peer} closed: {e}");
                    }
                }
            }
            conn.close();
        });
    }

    async fn start_recv_loop(
        &self,
        conn: &Arc<Connection>,
        mut reader: FrameReader,
    ) -> Result<()> {
        let mut last_read = Instant::now();
        loop {
            let next = tokio::time::timeout(self.config.ping_interval, reader.next_frame());
            let frame = match next.await {
                Ok(frame) => frame?,
                Err(_) => {
                    if last_read.elapsed() >= self.config.read_idle_timeout {
                        return Err(Error::new(
                            ErrorKind::Timeout,
                            format!("nothing read for {:?}", last_read.elapsed()),
                        ));
                    }
                    conn.send_ping().await?;
                    continue;
                }
            };
            last_read = Instant::now();
            self.handle_frame(conn, &frame).await?;
        }
    }

    async fn handle_frame(&self, conn: &Arc<Connection>, frame: &Bytes) -> Result<()> {
        let request = match Frame::<ServerRequest>::parse(frame) {
            Ok(Frame::Ping) => return Ok(()),
            Ok(Frame::Message(request)) => request,
            Err(e) => {
                // answer malformed requests whose id is still readable.
                let id = serde_json::from_slice::<Value>(frame)
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_i64));
                match id {
                    Some(id) => {
                        tracing::warn!("bad request {id} from {}: {e}", conn.peer_addr());
                        let response = Response::failure(id, code::BAD_ARGUMENT, e.to_string());
                        write_response(conn, &response, self.config.max_frame_size).await;
                    }
                    None => tracing::warn!("drop malformed frame from {}: {e}", conn.peer_addr()),
                }
                return Ok(());
            }
        };

        let permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| Error::new(ErrorKind::HandlerFailed, e.to_string()))?;
        let dispatcher = self.dispatcher.clone();
        let conn = conn.clone();
        let max_frame_size = self.config.max_frame_size;
        self.task_supervisor.spawn(async move {
            let response = dispatcher.process(request).await;
            drop(permit);
            write_response(&conn, &response, max_frame_size).await;
        });
        Ok(())
    }
}

async fn write_response(conn: &Connection, response: &Response, max_frame_size: usize) {
    let bytes = match tcp::encode_frame(response, max_frame_size) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("encode response {} failed: {e}", response.id);
            let fallback = Response::failure(response.id, code::HANDLER_FAILED, e.to_string());
            match tcp::encode_frame(&fallback, max_frame_size) {
                Ok(bytes) => bytes,
                Err(_) => return,
            }
        }
    };
    if let Err(e) = conn.send(bytes).await {
        tracing::warn!("write response {} to {} failed: {e}", response.id, conn.peer_addr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.workers, 10);
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.read_idle_timeout, Duration::from_secs(60));
        assert_eq!(config.service_path, "/servers");
        assert_eq!(config.advertise_host, None);

        let config: ServerConfig =
            serde_json::from_str(r#"{"workers": 2, "ping_interval": "500ms"}"#).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.ping_interval, Duration::from_millis(500));
        assert_eq!(config.weight, 1);
    }
}
