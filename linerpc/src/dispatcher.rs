use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;

use crate::{
    DispatchRegistry, Response, ServerRequest,
    error::{Error, ErrorKind},
    msg::code,
};

/// Turns a decoded [`ServerRequest`] into a [`Response`].
///
/// Every outcome produces a response carrying the request id: an unknown
/// command, content that does not fit the handler's argument, and a failing or
/// panicking handler each map to their own failure code, so a caller never has
/// to wait out its timeout to learn about them.
#[derive(Debug, Default)]
pub struct ServerDispatcher {
    registry: DispatchRegistry,
}

impl ServerDispatcher {
    #[must_use]
    pub fn new(registry: DispatchRegistry) -> Self {
        Self { registry }
    }

    #[must_use]
    pub fn registry(&self) -> &DispatchRegistry {
        &self.registry
    }

    pub async fn process(&self, request: ServerRequest) -> Response {
        let Some(entry) = self.registry.get(&request.command) else {
            let m = format!("command not found: {}", request.command);
            tracing::error!("{m}");
            return Response::failure(request.id, code::COMMAND_NOT_FOUND, m);
        };

        let result = AssertUnwindSafe(async { entry.invoke(&request).await })
            .catch_unwind()
            .await;
        match result {
            Ok(Ok(value)) => Response::success(request.id, value),
            Ok(Err(e)) => {
                tracing::error!("command {} (id {}) failed: {e}", request.command, request.id);
                let e = match e.kind {
                    ErrorKind::DeserializeFailed | ErrorKind::HandlerFailed => e,
                    _ => Error::new(ErrorKind::HandlerFailed, e.to_string()),
                };
                Response::from_error(request.id, &e)
            }
            Err(_) => {
                tracing::error!("command {} (id {}) panicked", request.command, request.id);
                Response::failure(
                    request.id,
                    code::HANDLER_FAILED,
                    format!("handler for {} panicked", request.command),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
    struct User {
        id: u64,
        name: String,
    }

    fn dispatcher() -> ServerDispatcher {
        let mut registry = DispatchRegistry::default();
        registry
            .register("saveUser", |user: User| async move { Ok::<_, Error>(user) })
            .unwrap();
        registry
            .register("reject", |(): ()| async {
                Err::<(), _>(Error::new(ErrorKind::InvalidArgument, "rejected"))
            })
            .unwrap();
        registry
            .register("explode", |(): ()| async {
                if true {
                    panic!("boom");
                }
                Ok::<_, Error>(())
            })
            .unwrap();
        registry
            .register("check", |x: u64| {
                assert!(x > 0, "x must be positive");
                async move { Ok::<_, Error>(x) }
            })
            .unwrap();
        ServerDispatcher::new(registry)
    }

    fn request(id: i64, command: &str, content: serde_json::Value) -> ServerRequest {
        ServerRequest {
            id,
            command: command.into(),
            content,
        }
    }

    #[tokio::test]
    async fn test_process_success() {
        let rsp = dispatcher()
            .process(request(1, "saveUser", json!({"id": 1, "name": "John doe"})))
            .await;
        assert_eq!(rsp.id, 1);
        assert_eq!(rsp.code, code::SUCCESS);
        assert_eq!(rsp.result, json!({"id": 1, "name": "John doe"}));
    }

    #[tokio::test]
    async fn test_process_failures() {
        let dispatcher = dispatcher();

        let rsp = dispatcher.process(request(2, "deleteUser", json!(null))).await;
        assert_eq!((rsp.id, rsp.code.as_str()), (2, code::COMMAND_NOT_FOUND));

        let rsp = dispatcher.process(request(3, "saveUser", json!([1, 2]))).await;
        assert_eq!((rsp.id, rsp.code.as_str()), (3, code::BAD_ARGUMENT));

        let rsp = dispatcher.process(request(4, "reject", json!(null))).await;
        assert_eq!((rsp.id, rsp.code.as_str()), (4, code::HANDLER_FAILED));
        assert!(rsp.msg.contains("rejected"));

        let rsp = dispatcher.process(request(5, "explode", json!(null))).await;
        assert_eq!((rsp.id, rsp.code.as_str()), (5, code::HANDLER_FAILED));
    }

    #[tokio::test]
    async fn test_panic_before_future_is_built() {
        let dispatcher = dispatcher();

        let rsp = dispatcher.process(request(6, "check", json!(0))).await;
        assert_eq!((rsp.id, rsp.code.as_str()), (6, code::HANDLER_FAILED));
        assert!(rsp.msg.contains("panicked"));

        let rsp = dispatcher.process(request(7, "check", json!(3))).await;
        assert_eq!((rsp.id, rsp.code.as_str()), (7, code::SUCCESS));
        assert_eq!(rsp.result, json!(3));
    }
}
