//! Service discovery on top of a hierarchical coordination service.
//!
//! Every live server creates a node named `host#port#weight#` under a base path
//! such as `/servers`; clients list that path and keep a one-shot watch on it.

use std::{str::FromStr, sync::Arc};

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{
    TaskSupervisor,
    error::{Error, ErrorKind, Result},
};

mod memory;
pub use memory::{MemoryCoordinator, Session};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    /// Removed when the creating session closes.
    Ephemeral,
    /// Ephemeral, with a monotonically increasing suffix appended to the name.
    EphemeralSequential,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum WatchEventKind {
    ChildrenChanged,
    SessionClosed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

/// The primitives the core needs from a coordination service.
pub trait Coordinator: Send + Sync {
    /// Names (not full paths) of the children of `path`.
    fn children<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;

    /// Creates `path`, creating missing parents as persistent nodes. Returns the
    /// full path actually created.
    fn create<'a>(&'a self, path: &'a str, mode: CreateMode) -> BoxFuture<'a, Result<String>>;

    /// Deletes `path`, which must have no children.
    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Fires once, on the next change to the children of `path`, or with
    /// [`WatchEventKind::SessionClosed`] if the session ends first.
    fn watch_children<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<oneshot::Receiver<WatchEvent>>>;
}

/// One registered server instance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceNode {
    pub host: String,
    pub port: u16,
    /// Number of pool slots this node gets on each client; 0 keeps it out.
    pub weight: u32,
}

impl ServiceNode {
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
        }
    }

    /// Identity used to match joins and leaves: `host#port`.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}#{}", self.host, self.port)
    }

    /// The registry node name, `host#port#weight#`.
    #[must_use]
    pub fn node_name(&self) -> String {
        format!("{}#{}#{}#", self.host, self.port, self.weight)
    }

    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for ServiceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}#{}", self.host, self.port, self.weight)
    }
}

impl FromStr for ServiceNode {
    type Err = Error;

    /// Parses `host#port#weight[#suffix]`. A missing or empty weight means 1.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| Error::new(ErrorKind::InvalidArgument, format!("{why}: {s}"));

        let mut fields = s.split('#');
        let host = fields
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?;
        let port = fields
            .next()
            .ok_or_else(|| invalid("missing port"))?
            .parse::<u16>()
            .map_err(|_| invalid("invalid port"))?;
        let weight = match fields.next() {
            None | Some("") => 1,
            Some(w) => w.parse::<u32>().map_err(|_| invalid("invalid weight"))?,
        };
        Ok(Self::new(host, port, weight))
    }
}

/// Client and server view of the registry for one coordination session.
#[derive(Clone)]
pub struct ServiceRegistry {
    coordinator: Arc<dyn Coordinator>,
}

impl ServiceRegistry {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self { coordinator }
    }

    /// Current server instances under `path`, in name order. A path nobody has
    /// registered under yet has no nodes.
    ///
    /// # Errors
    ///
    /// Fails if the coordination service cannot list `path`.
    pub async fn list_nodes(&self, path: &str) -> Result<Vec<ServiceNode>> {
        let mut children = match self.coordinator.children(path).await {
            Ok(children) => children,
            Err(e) if e.kind == ErrorKind::NoNode => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        children.sort();

        Ok(children
            .into_iter()
            .filter_map(|name| match name.parse::<ServiceNode>() {
                Ok(node) => Some(node),
                Err(e) => {
                    tracing::warn!("skip registry entry {path}/{name}: {e}");
                    None
                }
            })
            .collect())
    }

    /// Installs a one-shot watch on `path` and returns the receiver of its
    /// single event.
    ///
    /// # Errors
    ///
    /// Fails if the watch cannot be installed, e.g. on a closed session.
    pub async fn watch_events(&self, path: &str) -> Result<oneshot::Receiver<WatchEvent>> {
        self.coordinator.watch_children(path).await
    }

    /// Installs a one-shot watch on `path`. `on_change` runs at most once, when
    /// the children change; the caller re-lists and re-installs the watch.
    /// The wait runs under `supervisor` and is dropped when it stops.
    ///
    /// # Errors
    ///
    /// Fails if the watch cannot be installed.
    pub async fn watch<F>(
        &self,
        path: &str,
        supervisor: &TaskSupervisor,
        on_change: F,
    ) -> Result<()>
    where
        F: FnOnce(WatchEvent) + Send + 'static,
    {
        let fired = self.watch_events(path).await?;
        supervisor.spawn(async move {
            if let Ok(event) = fired.await {
                on_change(event);
            }
        });
        Ok(())
    }

    /// Publishes `node` under `path`. Ephemeral nodes vanish with this session.
    ///
    /// # Errors
    ///
    /// Fails if the node cannot be created, e.g. because it already exists.
    pub async fn register_self(
        &self,
        path: &str,
        node: &ServiceNode,
        ephemeral: bool,
    ) -> Result<String> {
        let mode = if ephemeral {
            CreateMode::Ephemeral
        } else {
            CreateMode::Persistent
        };
        self.register_node(path, node, mode).await
    }

    /// Publishes `node` under `path` with an explicit create mode. Returns
    /// the full path created, including any sequential suffix.
    ///
    /// # Errors
    ///
    /// Fails if the node cannot be created.
    pub async fn register_node(
        &self,
        path: &str,
        node: &ServiceNode,
        mode: CreateMode,
    ) -> Result<String> {
        let full_path = format!("{}/{}", path.trim_end_matches('/'), node.node_name());
        let created = self.coordinator.create(&full_path, mode).await?;
        tracing::info!("registered {node} at {created}");
        Ok(created)
    }

    /// Removes a node created by [`register_node`](Self::register_node). An
    /// already missing node is not an error.
    ///
    /// # Errors
    ///
    /// Fails if the coordination service rejects the delete.
    pub async fn unregister(&self, full_path: &str) -> Result<()> {
        match self.coordinator.delete(full_path).await {
            Ok(()) => {
                tracing::info!("unregistered {full_path}");
                Ok(())
            }
            Err(e) if e.kind == ErrorKind::NoNode => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_node() {
        let node: ServiceNode = "10.0.0.1#8080#2#".parse().unwrap();
        assert_eq!(node, ServiceNode::new("10.0.0.1", 8080, 2));
        assert_eq!(node.key(), "10.0.0.1#8080");
        assert_eq!(node.node_name(), "10.0.0.1#8080#2#");
        assert_eq!(node.address(), "10.0.0.1:8080");

        let node: ServiceNode = "10.0.0.1#8080#3#0000000007".parse().unwrap();
        assert_eq!(node.weight, 3);
        let node: ServiceNode = "localhost#9000#".parse().unwrap();
        assert_eq!(node.weight, 1);
        let node: ServiceNode = "localhost#9000#0#".parse().unwrap();
        assert_eq!(node.weight, 0);

        assert!("#9000#1#".parse::<ServiceNode>().is_err());
        assert!("localhost#http#1#".parse::<ServiceNode>().is_err());
        assert!("localhost".parse::<ServiceNode>().is_err());
        assert!("localhost#1#heavy#".parse::<ServiceNode>().is_err());
    }

    #[tokio::test]
    async fn test_register_list_and_watch() {
        let coordinator = MemoryCoordinator::new();
        let server = ServiceRegistry::new(coordinator.session());
        let client = ServiceRegistry::new(coordinator.session());

        assert!(client.list_nodes("/servers").await.unwrap().is_empty());

        let supervisor = TaskSupervisor::create();
        let (tx, rx) = oneshot::channel();
        client
            .watch("/servers", &supervisor, move |event| {
                let _ = tx.send(event);
            })
            .await
            .unwrap();

        server
            .register_self("/servers", &ServiceNode::new("127.0.0.1", 9000, 2), true)
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path, "/servers");
        assert_eq!(event.kind, WatchEventKind::ChildrenChanged);

        let nodes = client.list_nodes("/servers").await.unwrap();
        assert_eq!(nodes, vec![ServiceNode::new("127.0.0.1", 9000, 2)]);
    }

    #[tokio::test]
    async fn test_watch_stops_with_supervisor() {
        let coordinator = MemoryCoordinator::new();
        let server = ServiceRegistry::new(coordinator.session());
        let client = ServiceRegistry::new(coordinator.session());

        let supervisor = TaskSupervisor::create();
        let (tx, mut rx) = oneshot::channel();
        client
            .watch("/servers", &supervisor, move |event| {
                let _ = tx.send(event);
            })
            .await
            .unwrap();
        supervisor.stop();
        tokio::time::timeout(Duration::from_secs(5), supervisor.all_stopped())
            .await
            .unwrap();

        server
            .register_self("/servers", &ServiceNode::new("127.0.0.1", 9000, 1), true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // the callback was dropped without running.
        assert!(matches!(rx.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
    }

    #[tokio::test]
    async fn test_unregister() {
        let coordinator = MemoryCoordinator::new();
        let registry = ServiceRegistry::new(coordinator.session());
        let path = registry
            .register_self("/servers", &ServiceNode::new("127.0.0.1", 9000, 1), true)
            .await
            .unwrap();
        assert!(coordinator.exists(&path));

        registry.unregister(&path).await.unwrap();
        assert!(!coordinator.exists(&path));
        assert!(registry.list_nodes("/servers").await.unwrap().is_empty());
        registry.unregister(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_skips_garbage() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.session();
        session.create("/servers/not-a-node", CreateMode::Persistent).await.unwrap();
        session.create("/servers/b#2#1#", CreateMode::Persistent).await.unwrap();
        session.create("/servers/a#1#1#", CreateMode::Persistent).await.unwrap();

        let registry = ServiceRegistry::new(session);
        let nodes = registry.list_nodes("/servers").await.unwrap();
        assert_eq!(
            nodes,
            vec![ServiceNode::new("a", 1, 1), ServiceNode::new("b", 2, 1)]
        );
    }
}
