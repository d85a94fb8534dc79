#![forbid(unsafe_code)]

mod error;
pub use error::{Error, ErrorKind, Result};

mod msg;
pub use msg::{Frame, Request, Response, ServerRequest, code};

mod tcp;
pub use tcp::Connection;

mod pool;
pub use pool::{Balance, ConnectionPool};

mod waiter;
pub use waiter::{PendingCallHandle, PendingCallTable};

mod task_supervisor;
pub use task_supervisor::{TaskSupervisor, TaskSupervisorGuard};

pub mod registry;
pub use registry::{MemoryCoordinator, ServiceRegistry};

mod router;
pub use router::{DispatchEntry, DispatchRegistry, Handler, Remote};

mod dispatcher;
pub use dispatcher::ServerDispatcher;

mod listener;
pub use listener::Listener;

mod client;
pub use client::{ClientConfig, RpcClient};

mod stub;
pub use stub::Stub;

mod server;
pub use server::{RpcServer, ServerConfig};
