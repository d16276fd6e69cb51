use std::{collections::BTreeMap, time::SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{Error, ErrorKind, Result};

/// Kind of frame carried on the wire.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 1,
    Response = 2,
    HeartbeatReq = 3,
    HeartbeatRsp = 4,
}

impl MessageType {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::HeartbeatReq),
            4 => Some(Self::HeartbeatRsp),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn is_heartbeat(self) -> bool {
        matches!(self, Self::HeartbeatReq | Self::HeartbeatRsp)
    }
}

/// Frame header.
///
/// `checksum` and `length` describe the encoded frame. The encoder ignores
/// the values in the header and writes the computed ones to the wire only;
/// the decoder fills them from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub checksum: u32,
    pub length: u32,
    /// Identifies the connection session a frame belongs to.
    pub session_id: u64,
    pub msg_type: MessageType,
    /// Reserved for scheduling; carried but not interpreted.
    pub priority: u8,
    pub attachment: BTreeMap<String, String>,
}

impl Header {
    #[must_use]
    pub fn new(msg_type: MessageType, session_id: u64) -> Self {
        Self {
            checksum: 0,
            length: 0,
            session_id,
            msg_type,
            priority: 0,
            attachment: BTreeMap::new(),
        }
    }
}

/// Request body: a call of `method_name` on `class_name`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BizRequest {
    pub request_id: String,
    pub class_name: String,
    pub method_name: String,
    #[serde(default)]
    pub parameter_types: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<serde_json::Value>,
}

impl BizRequest {
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        class_name: impl Into<String>,
        method_name: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            class_name: class_name.into(),
            method_name: method_name.into(),
            parameter_types: Vec::new(),
            parameters: Vec::new(),
        }
    }

    /// Appends one argument together with its type descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented as a structured value.
    pub fn with_param<P: Serialize>(
        mut self,
        type_name: impl Into<String>,
        value: &P,
    ) -> Result<Self> {
        self.parameter_types.push(type_name.into());
        self.parameters.push(serde_json::to_value(value)?);
        Ok(self)
    }
}

/// Response body. `result` holds either the method's return value or the
/// failure the remote side reported.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BizResponse {
    pub request_id: String,
    pub result: std::result::Result<serde_json::Value, Error>,
    /// Milliseconds since the unix epoch at which the client received the
    /// response. Stamped locally on delivery.
    #[serde(default)]
    pub receive_time: Option<u64>,
}

impl BizResponse {
    #[must_use]
    pub fn ok(request_id: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            request_id: request_id.into(),
            result: Ok(value),
            receive_time: None,
        }
    }

    #[must_use]
    pub fn err(request_id: impl Into<String>, error: Error) -> Self {
        Self {
            request_id: request_id.into(),
            result: Err(error),
            receive_time: None,
        }
    }

    pub(crate) fn stamp_receive_time(&mut self) {
        self.receive_time = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .ok()
            .and_then(|d| u64::try_from(d.as_millis()).ok());
    }

    /// Converts the response into the caller's return type. Every failure
    /// reported by the server becomes `RemoteFailure`.
    ///
    /// # Errors
    pub fn into_result<R: DeserializeOwned>(self) -> Result<R> {
        match self.result {
            Ok(value) => serde_json::from_value(value).map_err(|e| {
                Error::new(
                    ErrorKind::DeserializeFailed,
                    format!("response {}: {e}", self.request_id),
                )
            }),
            Err(err) => match err.kind {
                ErrorKind::RemoteFailure => Err(err),
                ErrorKind::Unknown(name) => Err(Error::new(
                    ErrorKind::RemoteFailure,
                    format!("{name}: {}", err.msg),
                )),
                kind => Err(Error::new(
                    ErrorKind::RemoteFailure,
                    format!("{kind:?}: {}", err.msg),
                )),
            },
        }
    }
}

/// Decoded view of a message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Request(BizRequest),
    Response(BizResponse),
    Heartbeat,
}

/// One protocol frame: header plus opaque body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub body: Bytes,
}

impl Message {
    #[must_use]
    pub fn new(header: Header, body: Bytes) -> Self {
        Self { header, body }
    }

    /// # Errors
    pub fn request(session_id: u64, request: &BizRequest, use_msgpack: bool) -> Result<Self> {
        Ok(Self::new(
            Header::new(MessageType::Request, session_id),
            serialize_body(request, use_msgpack)?,
        ))
    }

    /// # Errors
    pub fn response(session_id: u64, response: &BizResponse, use_msgpack: bool) -> Result<Self> {
        Ok(Self::new(
            Header::new(MessageType::Response, session_id),
            serialize_body(response, use_msgpack)?,
        ))
    }

    #[must_use]
    pub fn heartbeat(session_id: u64, msg_type: MessageType) -> Self {
        Self::new(Header::new(msg_type, session_id), Bytes::new())
    }

    /// Decodes the body according to the header's message type.
    ///
    /// The serialization format is detected from the first byte: JSON bodies
    /// are objects and start with `{`, anything else is MessagePack.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not match the message type.
    pub fn body(&self) -> Result<Body> {
        match self.header.msg_type {
            MessageType::Request => deserialize_body(&self.body).map(Body::Request),
            MessageType::Response => deserialize_body(&self.body).map(Body::Response),
            MessageType::HeartbeatReq | MessageType::HeartbeatRsp => Ok(Body::Heartbeat),
        }
    }
}

fn serialize_body<T: Serialize>(value: &T, use_msgpack: bool) -> Result<Bytes> {
    if use_msgpack {
        Ok(rmp_serde::to_vec_named(value)?.into())
    } else {
        Ok(serde_json::to_vec(value)?.into())
    }
}

fn deserialize_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    match body.first() {
        None => Err(Error::new(ErrorKind::DeserializeFailed, "empty body")),
        Some(b'{') => Ok(serde_json::from_slice(body)?),
        Some(_) => Ok(rmp_serde::from_slice(body)?),
    }
}
