//! Coordination client
//!
//! A small poll-on-retry client for the JSON-lines protocol: the
//! reference implementation for test-side bindings. Production workers
//! speak the protocol from inside their own subprocess; this client is
//! exercised by the server's integration tests.

#![allow(dead_code)]

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::coordination::protocol::{decode, encode, ErrorKind, Request, Response};

/// Interval between polls while a value set is contended.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct CoordinationClient {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl CoordinationClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("failed to connect to coordination server")?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read).lines(),
            writer,
        })
    }

    /// Send one request and read one response.
    pub async fn call(&mut self, request: &Request) -> Result<Response> {
        let mut line = encode(request);
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        let reply = self
            .reader
            .next_line()
            .await?
            .context("server closed the connection")?;
        Ok(decode(&reply)?)
    }

    /// Send a raw line; exercised by protocol tests.
    pub async fn call_raw(&mut self, line: &str) -> Result<Response> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        let reply = self
            .reader
            .next_line()
            .await?
            .context("server closed the connection")?;
        Ok(decode(&reply)?)
    }

    /// One non-blocking acquire attempt.
    pub async fn acquire_lock_once(&mut self, name: &str, caller: &str) -> Result<Response> {
        self.call(&Request::AcquireLock {
            name: name.to_string(),
            caller: caller.to_string(),
        })
        .await
    }

    pub async fn release_lock(&mut self, name: &str, caller: &str) -> Result<Response> {
        self.call(&Request::ReleaseLock {
            name: name.to_string(),
            caller: caller.to_string(),
        })
        .await
    }

    /// Block until a matching value set is leased; returns its name.
    /// `NoValueSetAvailable` is treated as contention and retried.
    pub async fn acquire_value_set(&mut self, caller: &str, tag: Option<&str>) -> Result<String> {
        let request = Request::AcquireValueSet {
            caller: caller.to_string(),
            tag: tag.map(str::to_string),
        };
        loop {
            match self.call(&request).await? {
                Response::Value { value } => return Ok(value),
                Response::Retry
                | Response::Error {
                    kind: ErrorKind::NoValueSetAvailable,
                    ..
                } => tokio::time::sleep(POLL_INTERVAL).await,
                other => bail!("acquire_value_set failed: {other:?}"),
            }
        }
    }

    pub async fn get_value_from_set(&mut self, key: &str, caller: &str) -> Result<String> {
        match self
            .call(&Request::GetValueFromSet {
                key: key.to_string(),
                caller: caller.to_string(),
            })
            .await?
        {
            Response::Value { value } => Ok(value),
            other => bail!("get_value_from_set('{key}') failed: {other:?}"),
        }
    }

    pub async fn release_value_set(&mut self, caller: &str) -> Result<Response> {
        self.call(&Request::ReleaseValueSet {
            caller: caller.to_string(),
        })
        .await
    }
}
