//! Client, server, sender and receiver options
//!
//! Durations are kept as `*_ms` integers so they read naturally in TOML and
//! environment overrides; accessors hand out `Duration`s.

use crate::routes::{ClientRouteSet, ServerRouteSet};
use anyhow::{bail, Context, Result};
use codec::{FrameVariant, Serializer};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_serializer() -> String {
    codec::serializer::JSON_MIME.to_string()
}

/// Receive-side tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverOptions {
    /// How long a caller waits for a correlated reply
    pub timeout_ms: u64,
    /// Backpressure ceiling per listener
    pub max_simultaneous_messages_per_queue: usize,
    /// Listener pause after a processing failure
    pub sleep_on_exception_ms: u64,
    /// Monitor loop polling interval
    pub monitor_interval_ms: u64,
    /// Delay between connect attempts
    pub connect_retry_delay_ms: u64,
    /// Upper bound on waiting for in-flight work during shutdown
    pub drain_timeout_ms: u64,
}

impl Default for ReceiverOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 20_000,
            max_simultaneous_messages_per_queue: 100,
            sleep_on_exception_ms: 5_000,
            monitor_interval_ms: 100,
            connect_retry_delay_ms: 5_000,
            drain_timeout_ms: 10_000,
        }
    }
}

impl ReceiverOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn sleep_on_exception(&self) -> Duration {
        Duration::from_millis(self.sleep_on_exception_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_simultaneous_messages_per_queue == 0 {
            bail!("receiver.max_simultaneous_messages_per_queue must be at least 1");
        }
        if self.monitor_interval_ms == 0 {
            bail!("receiver.monitor_interval_ms must be at least 1");
        }
        Ok(())
    }
}

/// Send-side tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderOptions {
    /// Connections per send route
    pub pool_size: usize,
    pub connect_retry_delay_ms: u64,
    /// `None` retries forever
    pub connect_max_attempts: Option<u32>,
}

impl Default for SenderOptions {
    fn default() -> Self {
        Self {
            pool_size: 1,
            connect_retry_delay_ms: 5_000,
            connect_max_attempts: None,
        }
    }
}

impl SenderOptions {
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            bail!("sender.pool_size must be at least 1");
        }
        if self.connect_max_attempts == Some(0) {
            bail!("sender.connect_max_attempts must be at least 1 when set");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    /// Receives requests and sends responses
    #[default]
    Request,
    /// Receives responses published by some other service
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOptions {
    pub name: String,
    #[serde(default = "default_serializer")]
    pub serializer: String,
    /// Share one reply subscription across all outstanding requests
    #[serde(default)]
    pub single_response_queue: bool,
    #[serde(default)]
    pub sender: Option<SenderOptions>,
    #[serde(default)]
    pub receiver: Option<ReceiverOptions>,
    #[serde(default)]
    pub routes: Vec<ClientRouteSet>,
}

impl ClientOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            serializer: default_serializer(),
            single_response_queue: false,
            sender: Some(SenderOptions::default()),
            receiver: Some(ReceiverOptions::default()),
            routes: Vec::new(),
        }
    }

    pub fn serializer(&self) -> Result<Serializer> {
        Serializer::from_mime(&self.serializer)
            .with_context(|| format!("client '{}' serializer", self.name))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("client name must not be empty");
        }
        self.serializer()?;
        if let Some(sender) = &self.sender {
            sender.validate()?;
        }
        if let Some(receiver) = &self.receiver {
            receiver.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerOptions {
    pub name: String,
    #[serde(default = "default_serializer")]
    pub serializer: String,
    #[serde(default)]
    pub role: ServerRole,
    #[serde(default)]
    pub variant: FrameVariant,
    #[serde(default)]
    pub sender: Option<SenderOptions>,
    #[serde(default)]
    pub receiver: Option<ReceiverOptions>,
    #[serde(default)]
    pub routes: Vec<ServerRouteSet>,
}

impl ServerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            serializer: default_serializer(),
            role: ServerRole::Request,
            variant: FrameVariant::Typed,
            sender: Some(SenderOptions::default()),
            receiver: Some(ReceiverOptions::default()),
            routes: Vec::new(),
        }
    }

    pub fn serializer(&self) -> Result<Serializer> {
        Serializer::from_mime(&self.serializer)
            .with_context(|| format!("server '{}' serializer", self.name))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("server name must not be empty");
        }
        self.serializer()?;
        if let Some(sender) = &self.sender {
            sender.validate()?;
        }
        if let Some(receiver) = &self.receiver {
            receiver.validate()?;
        }
        Ok(())
    }
}
