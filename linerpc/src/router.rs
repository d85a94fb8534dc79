use std::{collections::HashMap, future::Future, sync::Arc};

use foldhash::fast::RandomState;
use futures_util::{FutureExt, future::BoxFuture};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::{
    ServerRequest,
    error::{Error, ErrorKind, Result},
};

pub type Handler = Box<dyn Fn(&ServerRequest) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A registered command: the type-erased handler plus the name of the single
/// argument type it decodes `content` into.
pub struct DispatchEntry {
    handler: Handler,
    param_type: &'static str,
}

impl DispatchEntry {
    #[must_use]
    pub fn param_type(&self) -> &'static str {
        self.param_type
    }

    pub(crate) fn invoke(&self, request: &ServerRequest) -> BoxFuture<'static, Result<Value>> {
        (self.handler)(request)
    }
}

/// Something that publishes its methods as commands during startup.
pub trait Remote: Send + Sync + 'static {
    /// # Errors
    ///
    /// Fails if one of the commands is already registered.
    fn export(self: Arc<Self>, registry: &mut DispatchRegistry) -> Result<()>;
}

/// Command name to handler table, filled once at startup.
///
/// Every handler takes exactly one argument, decoded from the request
/// `content`; several values travel as one struct or tuple.
#[derive(Default)]
pub struct DispatchRegistry {
    entries: HashMap<String, DispatchEntry, RandomState>,
}

impl DispatchRegistry {
    /// Registers a free-standing handler for `command`.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` if `command` is already registered.
    pub fn register<Req, Rsp, F, Fut>(
        &mut self,
        command: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        Req: DeserializeOwned + 'static,
        Rsp: Serialize + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let handler: Handler = Box::new(move |request: &ServerRequest| {
            match request.argument::<Req>() {
                Ok(arg) => handler(arg)
                    .map(|rsp| {
                        serde_json::to_value(rsp?)
                            .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))
                    })
                    .boxed(),
                Err(e) => futures_util::future::ready(Err(e)).boxed(),
            }
        });
        self.insert(command.into(), handler, std::any::type_name::<Req>())
    }

    /// Registers a method of `target`, which is shared by every call.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` if `command` is already registered.
    pub fn register_method<T, Req, Rsp, F, Fut>(
        &mut self,
        target: &Arc<T>,
        command: impl Into<String>,
        method: F,
    ) -> Result<()>
    where
        T: Send + Sync + 'static,
        Req: DeserializeOwned + 'static,
        Rsp: Serialize + 'static,
        F: Fn(Arc<T>, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Rsp>> + Send + 'static,
    {
        let target = target.clone();
        self.register(command, move |req: Req| method(target.clone(), req))
    }

    /// Lets `remote` register all of its commands.
    ///
    /// # Errors
    ///
    /// Propagates the first registration failure of `remote`.
    pub fn export<R: Remote>(&mut self, remote: Arc<R>) -> Result<()> {
        remote.export(self)
    }

    fn insert(
        &mut self,
        command: String,
        handler: Handler,
        param_type: &'static str,
    ) -> Result<()> {
        if self.entries.contains_key(&command) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("command already registered: {command}"),
            ));
        }
        self.entries.insert(command, DispatchEntry {
            handler,
            param_type,
        });
        Ok(())
    }

    #[must_use]
    pub fn get(&self, command: &str) -> Option<&DispatchEntry> {
        self.entries.get(command)
    }

    pub fn commands(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchRegistry")
            .field("commands", &self.entries.keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_invoke() {
        let mut registry = DispatchRegistry::default();
        registry
            .register("double", |x: u64| async move { Ok::<_, Error>(x * 2) })
            .unwrap();
        assert_eq!(registry.len(), 1);

        let entry = registry.get("double").unwrap();
        assert_eq!(entry.param_type(), "u64");

        let request = ServerRequest {
            id: 1,
            command: "double".into(),
            content: json!(21),
        };
        assert_eq!(entry.invoke(&request).await.unwrap(), json!(42));

        let request = ServerRequest {
            content: json!("21"),
            ..request
        };
        let err = entry.invoke(&request).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeserializeFailed);
    }

    #[test]
    fn test_duplicate_command() {
        let mut registry = DispatchRegistry::default();
        registry
            .register("ping", |(): ()| async { Ok::<_, Error>("pong") })
            .unwrap();
        let err = registry
            .register("ping", |(): ()| async { Ok::<_, Error>("again") })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert_eq!(registry.commands().collect::<Vec<_>>(), vec!["ping"]);
    }

    #[tokio::test]
    async fn test_register_method() {
        struct Counter(std::sync::atomic::AtomicU64);

        let counter = Arc::new(Counter(Default::default()));
        let mut registry = DispatchRegistry::default();
        registry
            .register_method(&counter, "add", |this: Arc<Counter>, n: u64| async move {
                let prev = this.0.fetch_add(n, std::sync::atomic::Ordering::AcqRel);
                Ok::<_, Error>(prev + n)
            })
            .unwrap();

        let request = ServerRequest {
            id: 1,
            command: "add".into(),
            content: json!(5),
        };
        let entry = registry.get("add").unwrap();
        assert_eq!(entry.invoke(&request).await.unwrap(), json!(5));
        assert_eq!(entry.invoke(&request).await.unwrap(), json!(10));
    }
}
