use std::{marker::PhantomData, sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};

use crate::{Request, Response, RpcClient, Result};

/// Typed caller for one command.
///
/// Encodes the argument into the request content, picks a fresh id and
/// decodes the result on success:
///
/// ```rust,no_run
/// # use linerpc::{ClientConfig, MemoryCoordinator, RpcClient, registry::ServiceRegistry};
/// # #[derive(serde::Serialize, serde::Deserialize)]
/// # struct User { id: u64, name: String }
/// # #[tokio::main]
/// # async fn main() -> linerpc::Result<()> {
/// # let coordinator = MemoryCoordinator::new();
/// let registry = ServiceRegistry::new(coordinator.session());
/// let client = RpcClient::create(ClientConfig::default(), registry);
/// client.start("/servers").await?;
///
/// let save_user = client.stub::<User, User>("saveUser");
/// let saved = save_user.invoke(&User { id: 1, name: "John doe".into() }).await?;
/// # Ok(())
/// # }
/// ```
pub struct Stub<Req, Rsp> {
    client: Arc<RpcClient>,
    command: String,
    timeout: Option<Duration>,
    _marker: PhantomData<fn(&Req) -> Rsp>,
}

impl<Req, Rsp> Stub<Req, Rsp>
where
    Req: Serialize,
    Rsp: DeserializeOwned,
{
    pub fn new(client: Arc<RpcClient>, command: impl Into<String>) -> Self {
        Self {
            client,
            command: command.into(),
            timeout: None,
            _marker: PhantomData,
        }
    }

    /// Overrides the client's default timeout for calls made through this stub.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Sends one call and returns the raw response.
    pub async fn call(&self, req: &Req) -> Response {
        let id = self.client.next_id();
        let request = match Request::with_payload(id, &self.command, req) {
            Ok(request) => request,
            Err(e) => return Response::from_error(id, &e),
        };
        match self.timeout {
            Some(timeout) => self.client.send_timeout(request, timeout).await,
            None => self.client.send(request).await,
        }
    }

    /// Sends one call and decodes a successful result.
    ///
    /// # Errors
    ///
    /// Any failure code comes back as the matching [`ErrorKind`](crate::ErrorKind).
    pub async fn invoke(&self, req: &Req) -> Result<Rsp> {
        self.call(req).await.into_result()
    }
}

impl<Req, Rsp> Clone for Stub<Req, Rsp> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            command: self.command.clone(),
            timeout: self.timeout,
            _marker: PhantomData,
        }
    }
}

impl<Req, Rsp> std::fmt::Debug for Stub<Req, Rsp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stub")
            .field("command", &self.command)
            .field("timeout", &self.timeout)
            .finish()
    }
}
