//! JSON-RPC client: used by the CLI against the daemon, and by the daemon
//! against the pool manager and the pools.

use std::net::SocketAddr;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::protocol::{Request, Response, RpcError};

#[derive(Debug, Clone)]
pub struct RpcClient {
    addr: SocketAddr,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to {0}: {1}")]
    Connect(SocketAddr, #[source] std::io::Error),
    #[error("Communication error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize request: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("Failed to parse response: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("Connection closed before a response arrived")]
    Closed,
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send(&self, request: &Request) -> Result<TcpStream, ClientError> {
        let mut stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| ClientError::Connect(self.addr, e))?;

        let mut line = serde_json::to_string(request).map_err(ClientError::Serialize)?;
        line.push('\n');
        stream.write_all(line.as_bytes()).await?;
        Ok(stream)
    }

    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let request = Request::new(method, params, Value::Number(1.into()));
        let stream = self.send(&request).await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(ClientError::Closed);
        }

        let response: Response = serde_json::from_str(&line).map_err(ClientError::Parse)?;
        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }

        let result = response.result.unwrap_or(Value::Null);
        serde_json::from_value(result).map_err(ClientError::Parse)
    }

    pub async fn call_no_params<T: DeserializeOwned>(&self, method: &str) -> Result<T, ClientError> {
        self.call(method, None).await
    }

    /// Fire and forget: the peer sends no response.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let request = Request::notification(method, params);
        let mut stream = self.send(&request).await?;
        stream.shutdown().await?;
        Ok(())
    }
}
