use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::{Error, ErrorKind, Result};

/// Result codes carried in [`Response::code`].
pub mod code {
    pub const SUCCESS: &str = "00000";
    pub const TRANSPORT_FAILED: &str = "11111";
    pub const INVALID_REQUEST: &str = "22222";
    pub const LINK_TIMEOUT: &str = "33333";
    pub const COMMAND_NOT_FOUND: &str = "44444";
    pub const BAD_ARGUMENT: &str = "55555";
    pub const HANDLER_FAILED: &str = "66666";
}

/// An outbound call, as written by the client.
///
/// `id` is chosen by the caller and is the only thing that ties the eventual
/// [`Response`] back to this request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Request {
    pub id: i64,
    pub command: String,
    #[serde(default)]
    pub content: Value,
}

impl Request {
    pub fn new(id: i64, command: impl Into<String>, content: Value) -> Self {
        Self {
            id,
            command: command.into(),
            content,
        }
    }

    /// Builds a request whose content is `payload` encoded as JSON.
    ///
    /// # Errors
    ///
    /// Fails with `SerializeFailed` if `payload` cannot be encoded.
    pub fn with_payload<P: Serialize>(
        id: i64,
        command: impl Into<String>,
        payload: &P,
    ) -> Result<Self> {
        let content = serde_json::to_value(payload)
            .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))?;
        Ok(Self::new(id, command, content))
    }
}

/// A request as the server sees it after decoding a frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerRequest {
    pub id: i64,
    pub command: String,
    #[serde(default)]
    pub content: Value,
}

impl ServerRequest {
    /// Deserializes `content` into the handler's argument type.
    ///
    /// A missing content is treated as JSON `null`.
    ///
    /// # Errors
    ///
    /// Fails with `DeserializeFailed` if the content does not fit `P`.
    pub fn argument<P: DeserializeOwned>(&self) -> Result<P> {
        P::deserialize(&self.content).map_err(|e| {
            Error::new(
                ErrorKind::DeserializeFailed,
                format!("{} for {}: {e}", std::any::type_name::<P>(), self.command),
            )
        })
    }
}

fn default_code() -> String {
    code::SUCCESS.to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Response {
    pub id: i64,
    #[serde(default)]
    pub result: Value,
    #[serde(default = "default_code")]
    pub code: String,
    #[serde(default)]
    pub msg: String,
}

impl Response {
    pub fn success(id: i64, result: Value) -> Self {
        Self {
            id,
            result,
            code: default_code(),
            msg: String::new(),
        }
    }

    pub fn failure(id: i64, code: &str, msg: impl Into<String>) -> Self {
        Self {
            id,
            result: Value::Null,
            code: code.to_string(),
            msg: msg.into(),
        }
    }

    pub fn link_timeout(id: i64) -> Self {
        Self::failure(id, code::LINK_TIMEOUT, "link timeout")
    }

    /// Builds the failure response matching a local or remote error.
    pub fn from_error(id: i64, error: &Error) -> Self {
        let code = match error.kind {
            ErrorKind::Timeout => code::LINK_TIMEOUT,
            ErrorKind::CommandNotFound => code::COMMAND_NOT_FOUND,
            ErrorKind::DeserializeFailed => code::BAD_ARGUMENT,
            ErrorKind::HandlerFailed => code::HANDLER_FAILED,
            ErrorKind::DuplicateRequestId
            | ErrorKind::InvalidArgument
            | ErrorKind::SerializeFailed => code::INVALID_REQUEST,
            ErrorKind::PoolExhausted
            | ErrorKind::TcpConnectFailed
            | ErrorKind::TcpSendMsgFailed
            | ErrorKind::TcpRecvMsgFailed
            | ErrorKind::TcpParseMsgFailed => code::TRANSPORT_FAILED,
            _ => code::HANDLER_FAILED,
        };
        Self::failure(id, code, error.to_string())
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == code::SUCCESS
    }

    /// Decodes `result` on success, otherwise turns the code back into an error.
    ///
    /// # Errors
    ///
    /// A failure code maps back to its [`ErrorKind`]. A success whose result
    /// does not fit `T` fails with `DeserializeFailed`.
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T> {
        let kind = match self.code.as_str() {
            code::SUCCESS => return Ok(serde_json::from_value(self.result)?),
            code::TRANSPORT_FAILED => ErrorKind::TcpSendMsgFailed,
            code::INVALID_REQUEST => ErrorKind::InvalidArgument,
            code::LINK_TIMEOUT => ErrorKind::Timeout,
            code::COMMAND_NOT_FOUND => ErrorKind::CommandNotFound,
            code::BAD_ARGUMENT => ErrorKind::DeserializeFailed,
            code::HANDLER_FAILED => ErrorKind::HandlerFailed,
            other => ErrorKind::Unknown(other.to_string()),
        };
        Err(Error::new(kind, self.msg))
    }
}

/// One decoded frame from either direction of a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<T> {
    Ping,
    Message(T),
}

impl<T: DeserializeOwned> Frame<T> {
    /// Decodes one frame body, recognising the `ping` keepalive.
    ///
    /// # Errors
    ///
    /// Fails with `DeserializeFailed` if the body is not a valid JSON message.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes == crate::tcp::PING {
            Ok(Frame::Ping)
        } else {
            Ok(Frame::Message(serde_json::from_slice(bytes)?))
        }
    }
}
