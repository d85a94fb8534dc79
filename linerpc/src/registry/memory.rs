use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
};

use futures_util::{FutureExt, future::BoxFuture};
use tokio::sync::oneshot;

use super::{Coordinator, CreateMode, WatchEvent, WatchEventKind};
use crate::error::{Error, ErrorKind, Result};

#[derive(Debug)]
struct Node {
    /// Session owning an ephemeral node.
    owner: Option<u64>,
    /// Next suffix handed to a sequential child.
    next_seq: u64,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    /// Pending one-shot watches per path, with the session that set each.
    watches: HashMap<String, Vec<(u64, oneshot::Sender<WatchEvent>)>>,
    next_session: u64,
}

/// In-process coordination service.
///
/// Holds a path tree with persistent, ephemeral and sequential nodes and
/// one-shot children watches. Clients talk to it through a [`Session`]; closing
/// (or dropping) the session deletes the ephemeral nodes it created, the way a
/// lost connection does on a real ensemble.
#[derive(Default)]
pub struct MemoryCoordinator {
    tree: Mutex<Tree>,
}

/// A client session on a [`MemoryCoordinator`].
pub struct Session {
    coordinator: Arc<MemoryCoordinator>,
    id: u64,
    closed: AtomicBool,
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn validate(path: &str) -> Result<()> {
    if !path.starts_with('/') || (path.len() > 1 && path.ends_with('/')) || path.contains("//") {
        return Err(Error::new(
            ErrorKind::InvalidArgument,
            format!("invalid path: {path}"),
        ));
    }
    Ok(())
}

impl Tree {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| parent(key) == path)
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect()
    }

    fn fire(&mut self, path: &str, kind: WatchEventKind) {
        if let Some(watchers) = self.watches.remove(path) {
            for (_, tx) in watchers {
                let _ = tx.send(WatchEvent {
                    path: path.to_string(),
                    kind: kind.clone(),
                });
            }
        }
    }

    fn create(&mut self, path: &str, mode: CreateMode, session: u64) -> Result<String> {
        validate(path)?;
        if path == "/" {
            return Err(Error::new(ErrorKind::NodeExists, "/".to_string()));
        }

        // create missing ancestors as persistent nodes.
        let mut missing = vec![];
        let mut ancestor = parent(path);
        while !self.exists(ancestor) {
            missing.push(ancestor.to_string());
            ancestor = parent(ancestor);
        }
        for ancestor in missing.into_iter().rev() {
            self.nodes.insert(
                ancestor.clone(),
                Node {
                    owner: None,
                    next_seq: 0,
                },
            );
            let grandparent = parent(&ancestor).to_string();
            self.fire(&grandparent, WatchEventKind::ChildrenChanged);
        }

        let parent_path = parent(path).to_string();
        let full_path = if mode == CreateMode::EphemeralSequential {
            let seq = match self.nodes.get_mut(&parent_path) {
                Some(node) => {
                    node.next_seq += 1;
                    node.next_seq - 1
                }
                None => 0,
            };
            format!("{path}{seq:010}")
        } else {
            path.to_string()
        };

        if self.nodes.contains_key(&full_path) {
            return Err(Error::new(ErrorKind::NodeExists, full_path));
        }
        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral | CreateMode::EphemeralSequential => Some(session),
        };
        self.nodes.insert(
            full_path.clone(),
            Node { owner, next_seq: 0 },
        );
        self.fire(&parent_path, WatchEventKind::ChildrenChanged);
        Ok(full_path)
    }

    fn delete(&mut self, path: &str) -> Result<()> {
        if !self.nodes.contains_key(path) {
            return Err(Error::new(ErrorKind::NoNode, path.to_string()));
        }
        if !self.children(path).is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("node has children: {path}"),
            ));
        }
        self.nodes.remove(path);
        self.fire(parent(path), WatchEventKind::ChildrenChanged);
        Ok(())
    }

    /// Ends `session`: its own watches learn about it, then its ephemeral
    /// nodes go away.
    fn close_session(&mut self, session: u64) {
        for (path, watchers) in &mut self.watches {
            let (own, others) = std::mem::take(watchers)
                .into_iter()
                .partition::<Vec<_>, _>(|(owner, _)| *owner == session);
            *watchers = others;
            for (_, tx) in own {
                let _ = tx.send(WatchEvent {
                    path: path.clone(),
                    kind: WatchEventKind::SessionClosed,
                });
            }
        }
        self.watches.retain(|_, watchers| !watchers.is_empty());
        self.expire(session);
    }

    fn expire(&mut self, session: u64) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.nodes.remove(&path);
            self.fire(parent(&path), WatchEventKind::ChildrenChanged);
        }
    }
}

impl MemoryCoordinator {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        match self.tree.lock() {
            Ok(tree) => tree,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Opens a new session.
    #[must_use]
    pub fn session(self: &Arc<Self>) -> Arc<Session> {
        let id = {
            let mut tree = self.lock();
            tree.next_session += 1;
            tree.next_session
        };
        Arc::new(Session {
            coordinator: self.clone(),
            id,
            closed: AtomicBool::new(false),
        })
    }

    /// Deletes a childless node regardless of its owner.
    ///
    /// # Errors
    ///
    /// Fails with `NoNode` if `path` does not exist, or `InvalidArgument` if it
    /// still has children.
    pub fn delete(&self, path: &str) -> Result<()> {
        self.lock().delete(path)
    }

    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        self.lock().exists(path)
    }
}

impl Session {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Ends the session: its pending watches fire with
    /// [`SessionClosed`](WatchEventKind::SessionClosed) and its ephemeral nodes
    /// are deleted. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.coordinator.lock().close_session(self.id);
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::new(
                ErrorKind::RegistryFailed,
                format!("session {} is closed", self.id),
            ))
        } else {
            Ok(())
        }
    }
}

impl Coordinator for Session {
    fn children<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        async move {
            self.check_open()?;
            validate(path)?;
            let tree = self.coordinator.lock();
            if !tree.exists(path) {
                return Err(Error::new(ErrorKind::NoNode, path.to_string()));
            }
            Ok(tree.children(path))
        }
        .boxed()
    }

    fn create<'a>(&'a self, path: &'a str, mode: CreateMode) -> BoxFuture<'a, Result<String>> {
        async move {
            self.check_open()?;
            self.coordinator.lock().create(path, mode, self.id)
        }
        .boxed()
    }

    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            self.check_open()?;
            validate(path)?;
            self.coordinator.lock().delete(path)
        }
        .boxed()
    }

    fn watch_children<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<oneshot::Receiver<WatchEvent>>> {
        async move {
            self.check_open()?;
            validate(path)?;
            let (tx, rx) = oneshot::channel();
            self.coordinator
                .lock()
                .watches
                .entry(path.to_string())
                .or_default()
                .push((self.id, tx));
            Ok(rx)
        }
        .boxed()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for MemoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCoordinator").finish()
    }
}
