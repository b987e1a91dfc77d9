//! Typed request and response envelopes
//!
//! The typed frame variant carries one of these, serialized with the
//! configured [`Serializer`], as its payload. Bodies are themselves
//! serialized application values.

use codec::Serializer;
use network::{unix_millis, Result};
use queue_config::RouteDescriptor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub client_name: String,
    /// Intended server; a mismatch is logged by the receiving server
    pub server_name: Option<String>,
    /// Where the response goes; stamped by the client when left empty
    pub reply_routes: Vec<RouteDescriptor>,
    pub response_expected: bool,
    pub method: Option<String>,
    pub sent_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub header: RequestHeader,
    pub body: Vec<u8>,
}

impl RequestMessage {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            header: RequestHeader {
                client_name: String::new(),
                server_name: None,
                reply_routes: Vec::new(),
                response_expected: true,
                method: None,
                sent_at_ms: 0,
            },
            body,
        }
    }

    /// Request whose body is `value` serialized with `serializer`
    pub fn with_body<T: Serialize + ?Sized>(serializer: Serializer, value: &T) -> Result<Self> {
        Ok(Self::new(serializer.serialize(value)?.to_vec()))
    }

    /// No response will be sent or awaited
    pub fn fire_and_forget(mut self) -> Self {
        self.header.response_expected = false;
        self
    }

    pub fn with_server(mut self, server_name: impl Into<String>) -> Self {
        self.header.server_name = Some(server_name.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.header.method = Some(method.into());
        self
    }

    /// Pre-assign a reply route; the client then leaves the reply path alone
    pub fn with_reply_route(mut self, route: RouteDescriptor) -> Self {
        self.header.reply_routes.push(route);
        self
    }

    pub fn body_as<T: DeserializeOwned>(&self, serializer: Serializer) -> Result<T> {
        Ok(serializer.deserialize(&self.body)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub client_name: String,
    pub server_name: String,
    /// Set when the request handler failed
    pub error: Option<String>,
    pub sent_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub header: ResponseHeader,
    pub body: Vec<u8>,
}

impl ResponseMessage {
    pub fn new(server_name: &str, client_name: &str, body: Vec<u8>) -> Self {
        Self {
            header: ResponseHeader {
                client_name: client_name.to_string(),
                server_name: server_name.to_string(),
                error: None,
                sent_at_ms: unix_millis(),
            },
            body,
        }
    }

    pub fn failed(server_name: &str, client_name: &str, error: impl Into<String>) -> Self {
        let mut response = Self::new(server_name, client_name, Vec::new());
        response.header.error = Some(error.into());
        response
    }

    pub fn is_error(&self) -> bool {
        self.header.error.is_some()
    }

    pub fn body_as<T: DeserializeOwned>(&self, serializer: Serializer) -> Result<T> {
        Ok(serializer.deserialize(&self.body)?)
    }
}
