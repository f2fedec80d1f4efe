//! Operator client for the control endpoint.
//!
//! One command per connection: connect (with retry), write the command line,
//! read until the controller closes the connection, decode what was read.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::bridge::protocol::{Command, StatusReply, StopReply};
use crate::bridge::transport::{ControlAddress, TransportError, connect_with_retry};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Connect(#[from] TransportError),
    #[error("control connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("controller closed the connection without replying")]
    EmptyReply,
    #[error("could not decode reply: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct Client {
    address: ControlAddress,
}

impl Client {
    pub fn new(address: ControlAddress) -> Self {
        Self { address }
    }

    pub fn address(&self) -> &ControlAddress {
        &self.address
    }

    /// Send one command and return the decoded reply.
    pub async fn request(&self, command: &Command) -> Result<Value, ClientError> {
        let mut stream = connect_with_retry(&self.address).await?;

        let mut line = serde_json::to_vec(command)?;
        line.push(b'\n');
        stream.write_all(&line).await?;
        stream.flush().await?;

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        if reply.iter().all(u8::is_ascii_whitespace) {
            return Err(ClientError::EmptyReply);
        }
        tracing::trace!(address = %self.address, bytes = reply.len(), "Received reply");
        Ok(serde_json::from_slice(&reply)?)
    }

    pub async fn status(&self) -> Result<StatusReply, ClientError> {
        self.typed(&Command::Status).await
    }

    pub async fn stop(&self) -> Result<StopReply, ClientError> {
        self.typed(&Command::Stop).await
    }

    async fn typed<T: DeserializeOwned>(&self, command: &Command) -> Result<T, ClientError> {
        let value = self.request(command).await?;
        Ok(serde_json::from_value(value)?)
    }
}
