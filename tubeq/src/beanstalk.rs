//! beanstalkd adapter for the [`Broker`] seam.
//!
//! A thin call-level client for the beanstalkd text protocol over one
//! persistent TCP connection. Commands are serialized through a mutex, so a
//! blocking `reserve` holds the connection until it returns; processes that
//! reserve and administer concurrently should open one connection for each.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::broker::Broker;
use crate::error::{QueueError, Result};
use crate::job::{Job, JobId, JobPriority};
use crate::stats::{parse_yaml, JobStats, ServerStats, TubeStats};

/// Default beanstalkd port.
pub const DEFAULT_PORT: u16 = 11300;

/// Replies that report a server-side failure rather than a protocol mismatch.
const SERVER_ERRORS: &[&str] = &[
    "OUT_OF_MEMORY",
    "INTERNAL_ERROR",
    "BAD_FORMAT",
    "UNKNOWN_COMMAND",
    "DRAINING",
    "JOB_TOO_BIG",
    "EXPECTED_CRLF",
    "NOT_IGNORED",
];

/// Live connection to a beanstalkd server.
#[derive(Debug)]
pub struct BeanstalkConnection {
    addr: String,
    inner: Mutex<Connection>,
}

#[derive(Debug)]
struct Connection {
    stream: BufReader<TcpStream>,
    using: String,
}

#[derive(Debug)]
struct Reply {
    command: String,
    status: String,
    args: Vec<String>,
}

impl Reply {
    fn arg<T: std::str::FromStr>(&self, index: usize) -> Result<T> {
        self.args
            .get(index)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| {
                QueueError::malformed(
                    &self.command,
                    format!("missing or invalid argument {index} in `{} {}`", self.status, self.args.join(" ")),
                )
            })
    }

    fn unexpected(self) -> QueueError {
        if SERVER_ERRORS.contains(&self.status.as_str()) {
            QueueError::BrokerRejected {
                command: self.command,
                reply: self.status,
            }
        } else {
            let detail = format!("unexpected reply `{} {}`", self.status, self.args.join(" "));
            QueueError::malformed(self.command, detail.trim_end())
        }
    }
}

impl BeanstalkConnection {
    /// Connect to `host:port`.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|err| QueueError::BrokerUnavailable(format!("{addr}: {err}")))?;
        stream.set_nodelay(true)?;
        tracing::debug!(%addr, "connected to beanstalkd");
        Ok(Self {
            addr,
            inner: Mutex::new(Connection {
                stream: BufReader::new(stream),
                using: "default".to_string(),
            }),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl Connection {
    async fn round_trip(&mut self, line: &str, body: Option<&[u8]>) -> Result<Reply> {
        let command = line.split_whitespace().next().unwrap_or_default().to_string();

        let stream = self.stream.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        if let Some(body) = body {
            stream.write_all(body).await?;
            stream.write_all(b"\r\n").await?;
        }
        stream.flush().await?;

        let mut raw = String::new();
        if self.stream.read_line(&mut raw).await? == 0 {
            return Err(QueueError::BrokerUnavailable("connection closed by broker".into()));
        }
        let mut parts = raw.split_whitespace().map(str::to_string);
        let status = parts
            .next()
            .ok_or_else(|| QueueError::malformed(&command, "empty reply"))?;
        Ok(Reply {
            command,
            status,
            args: parts.collect(),
        })
    }

    async fn read_body(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len + 2];
        self.stream.read_exact(&mut buf).await?;
        if !buf.ends_with(b"\r\n") {
            return Err(QueueError::malformed("body", "missing trailing CRLF"));
        }
        buf.truncate(len);
        Ok(buf)
    }

    async fn use_tube(&mut self, tube: &str) -> Result<()> {
        if self.using == tube {
            return Ok(());
        }
        let reply = self.round_trip(&format!("use {tube}"), None).await?;
        match reply.status.as_str() {
            "USING" => {
                self.using = tube.to_string();
                Ok(())
            }
            _ => Err(reply.unexpected()),
        }
    }

    /// Read a `FOUND <id> <bytes>` / `RESERVED <id> <bytes>` job payload.
    async fn job_reply(&mut self, reply: &Reply) -> Result<Job> {
        let id: u64 = reply.arg(0)?;
        let len: usize = reply.arg(1)?;
        let body = self.read_body(len).await?;
        Ok(Job::new(JobId(id), body))
    }

    async fn yaml_reply<T: serde::de::DeserializeOwned>(&mut self, reply: &Reply) -> Result<T> {
        let len: usize = reply.arg(0)?;
        let body = self.read_body(len).await?;
        parse_yaml(&reply.command, &body)
    }

    async fn peek_state(&mut self, tube: &str, command: &str) -> Result<Job> {
        self.use_tube(tube).await?;
        let reply = self.round_trip(command, None).await?;
        match reply.status.as_str() {
            "FOUND" => self.job_reply(&reply).await,
            "NOT_FOUND" => Err(QueueError::TubeNotFound(tube.to_string())),
            _ => Err(reply.unexpected()),
        }
    }

    async fn simple(&mut self, line: &str, ok: &str, id: JobId) -> Result<()> {
        let reply = self.round_trip(line, None).await?;
        match reply.status.as_str() {
            status if status == ok => Ok(()),
            "NOT_FOUND" => Err(QueueError::JobNotFound(id)),
            _ => Err(reply.unexpected()),
        }
    }

    async fn watching(&mut self, line: &str) -> Result<usize> {
        let reply = self.round_trip(line, None).await?;
        match reply.status.as_str() {
            "WATCHING" => reply.arg(0),
            _ => Err(reply.unexpected()),
        }
    }

    async fn list(&mut self, line: &str) -> Result<Vec<String>> {
        let reply = self.round_trip(line, None).await?;
        match reply.status.as_str() {
            "OK" => self.yaml_reply(&reply).await,
            _ => Err(reply.unexpected()),
        }
    }
}

#[async_trait]
impl Broker for BeanstalkConnection {
    async fn put(
        &self,
        tube: &str,
        body: &[u8],
        priority: JobPriority,
        delay_secs: u32,
        ttr_secs: u32,
    ) -> Result<JobId> {
        let mut conn = self.inner.lock().await;
        conn.use_tube(tube).await?;
        let line = format!("put {} {} {} {}", priority.0, delay_secs, ttr_secs, body.len());
        let reply = conn.round_trip(&line, Some(body)).await?;
        match reply.status.as_str() {
            "INSERTED" => Ok(JobId(reply.arg(0)?)),
            "BURIED" => {
                let id = JobId(reply.arg(0)?);
                tracing::warn!(job_id = %id, tube, "broker out of memory, job inserted buried");
                Ok(id)
            }
            _ => Err(reply.unexpected()),
        }
    }

    async fn reserve(&self, timeout: Duration) -> Result<Option<Job>> {
        let mut conn = self.inner.lock().await;
        let line = format!("reserve-with-timeout {}", timeout.as_secs());
        let reply = conn.round_trip(&line, None).await?;
        match reply.status.as_str() {
            "RESERVED" => conn.job_reply(&reply).await.map(Some),
            "TIMED_OUT" | "DEADLINE_SOON" => Ok(None),
            _ => Err(reply.unexpected()),
        }
    }

    async fn delete(&self, id: JobId) -> Result<()> {
        let mut conn = self.inner.lock().await;
        conn.simple(&format!("delete {id}"), "DELETED", id).await
    }

    async fn release(&self, id: JobId, priority: JobPriority, delay_secs: u32) -> Result<()> {
        let mut conn = self.inner.lock().await;
        conn.simple(&format!("release {id} {} {delay_secs}", priority.0), "RELEASED", id)
            .await
    }

    async fn bury(&self, id: JobId, priority: JobPriority) -> Result<()> {
        let mut conn = self.inner.lock().await;
        conn.simple(&format!("bury {id} {}", priority.0), "BURIED", id).await
    }

    async fn kick(&self, id: JobId) -> Result<()> {
        let mut conn = self.inner.lock().await;
        conn.simple(&format!("kick-job {id}"), "KICKED", id).await
    }

    async fn peek(&self, id: JobId) -> Result<Job> {
        let mut conn = self.inner.lock().await;
        let reply = conn.round_trip(&format!("peek {id}"), None).await?;
        match reply.status.as_str() {
            "FOUND" => conn.job_reply(&reply).await,
            "NOT_FOUND" => Err(QueueError::JobNotFound(id)),
            _ => Err(reply.unexpected()),
        }
    }

    async fn peek_ready(&self, tube: &str) -> Result<Job> {
        self.inner.lock().await.peek_state(tube, "peek-ready").await
    }

    async fn peek_delayed(&self, tube: &str) -> Result<Job> {
        self.inner.lock().await.peek_state(tube, "peek-delayed").await
    }

    async fn peek_buried(&self, tube: &str) -> Result<Job> {
        self.inner.lock().await.peek_state(tube, "peek-buried").await
    }

    async fn stats_job(&self, id: JobId) -> Result<JobStats> {
        let mut conn = self.inner.lock().await;
        let reply = conn.round_trip(&format!("stats-job {id}"), None).await?;
        match reply.status.as_str() {
            "OK" => conn.yaml_reply(&reply).await,
            "NOT_FOUND" => Err(QueueError::JobNotFound(id)),
            _ => Err(reply.unexpected()),
        }
    }

    async fn stats_tube(&self, tube: &str) -> Result<TubeStats> {
        let mut conn = self.inner.lock().await;
        let reply = conn.round_trip(&format!("stats-tube {tube}"), None).await?;
        match reply.status.as_str() {
            "OK" => conn.yaml_reply(&reply).await,
            "NOT_FOUND" => Err(QueueError::TubeNotFound(tube.to_string())),
            _ => Err(reply.unexpected()),
        }
    }

    async fn server_stats(&self) -> Result<ServerStats> {
        let mut conn = self.inner.lock().await;
        let reply = conn.round_trip("stats", None).await?;
        match reply.status.as_str() {
            "OK" => conn.yaml_reply(&reply).await,
            _ => Err(reply.unexpected()),
        }
    }

    async fn watch(&self, tube: &str) -> Result<usize> {
        self.inner.lock().await.watching(&format!("watch {tube}")).await
    }

    async fn ignore(&self, tube: &str) -> Result<usize> {
        self.inner.lock().await.watching(&format!("ignore {tube}")).await
    }

    async fn pause_tube(&self, tube: &str, secs: u32) -> Result<()> {
        let mut conn = self.inner.lock().await;
        let reply = conn.round_trip(&format!("pause-tube {tube} {secs}"), None).await?;
        match reply.status.as_str() {
            "PAUSED" => Ok(()),
            "NOT_FOUND" => Err(QueueError::TubeNotFound(tube.to_string())),
            _ => Err(reply.unexpected()),
        }
    }

    async fn list_tubes(&self) -> Result<Vec<String>> {
        self.inner.lock().await.list("list-tubes").await
    }

    async fn list_watched_tubes(&self) -> Result<Vec<String>> {
        self.inner.lock().await.list("list-tubes-watched").await
    }
}
