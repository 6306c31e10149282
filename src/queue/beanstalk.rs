use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::{Broker, Consumer, Job, JobId};
use crate::core::host::Host;
use crate::core::messages::Tube;
use crate::errors::QueueError;

/// Default timeout for connecting and for every reply except `reserve`.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// beanstalkd's default job priority (lower is more urgent).
pub const DEFAULT_PRIORITY: u32 = 1 << 16;

/// Largest job body we are willing to read back.
const MAX_JOB_SIZE: usize = 64 * 1024 * 1024;

/// Connects to beanstalkd on demand: one short-lived connection per `put`,
/// one long-lived connection per consumer.
#[derive(Debug, Clone)]
pub struct BeanstalkBroker {
    timeout: Duration,
}

impl BeanstalkBroker {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Default for BeanstalkBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for BeanstalkBroker {
    async fn put(
        &self,
        host: &Host,
        tube: Tube,
        body: &[u8],
        ttr: u64,
    ) -> Result<JobId, QueueError> {
        let mut conn = BeanstalkConnection::connect(host, self.timeout).await?;
        conn.use_tube(tube).await?;
        let id = conn.put(body, DEFAULT_PRIORITY, 0, ttr).await?;
        conn.quit().await;
        Ok(id)
    }

    async fn watch(&self, host: &Host, tube: Tube) -> Result<Box<dyn Consumer>, QueueError> {
        let mut conn = BeanstalkConnection::connect(host, self.timeout).await?;
        conn.watch(tube).await?;
        // Every connection starts out watching "default"; we only want our own tube.
        conn.ignore("default").await?;
        Ok(Box::new(conn))
    }
}

/// One beanstalkd protocol session.
///
/// # Wire Protocol
///
/// Commands are single CRLF-terminated text lines; `put` is followed by the
/// job body and another CRLF, `RESERVED` replies likewise carry the body:
///
/// ```text
/// put <pri> <delay> <ttr> <bytes>\r\n<data>\r\n   ->  INSERTED <id>\r\n
/// reserve\r\n                                     ->  RESERVED <id> <bytes>\r\n<data>\r\n
/// delete <id>\r\n                                 ->  DELETED\r\n
/// ```
pub struct BeanstalkConnection {
    stream: BufReader<TcpStream>,
    host: Host,
    timeout: Duration,
}

impl BeanstalkConnection {
    pub async fn connect(host: &Host, limit: Duration) -> Result<Self, QueueError> {
        debug!(%host, "Connecting");
        let connect_err = |source: io::Error| QueueError::Connect {
            host: host.clone(),
            source,
        };

        let stream = timeout(limit, TcpStream::connect(host.socket_addr()))
            .await
            .map_err(|_| connect_err(io::Error::from(io::ErrorKind::TimedOut)))?
            .map_err(connect_err)?;

        Ok(Self {
            stream: BufReader::new(stream),
            host: host.clone(),
            timeout: limit,
        })
    }

    pub async fn use_tube(&mut self, tube: Tube) -> Result<(), QueueError> {
        let command = format!("use {tube}");
        let reply = self.round_trip(&command, None, true).await?;
        expect_word(&command, &reply, "USING").map(|_| ())
    }

    pub async fn put(
        &mut self,
        body: &[u8],
        priority: u32,
        delay: u64,
        ttr: u64,
    ) -> Result<JobId, QueueError> {
        let command = format!("put {priority} {delay} {ttr} {}", body.len());
        let reply = self.round_trip(&command, Some(body), true).await?;
        let rest = expect_word(&command, &reply, "INSERTED")?;
        parse_id(&command, &reply, rest)
    }

    pub async fn watch(&mut self, tube: Tube) -> Result<(), QueueError> {
        let command = format!("watch {tube}");
        let reply = self.round_trip(&command, None, true).await?;
        expect_word(&command, &reply, "WATCHING").map(|_| ())
    }

    pub async fn ignore(&mut self, tube: &str) -> Result<(), QueueError> {
        let command = format!("ignore {tube}");
        let reply = self.round_trip(&command, None, true).await?;
        expect_word(&command, &reply, "WATCHING").map(|_| ())
    }

    pub async fn reserve_job(&mut self) -> Result<Job, QueueError> {
        let command = "reserve";
        // Blocks for as long as the tube stays empty.
        let reply = self.round_trip(command, None, false).await?;
        let rest = expect_word(command, &reply, "RESERVED")?;

        let mut parts = rest.split_whitespace();
        let (Some(id), Some(len), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(protocol(command, &reply));
        };
        let id = parse_id(command, &reply, id)?;
        let len: usize = len.parse().map_err(|_| protocol(command, &reply))?;
        if len > MAX_JOB_SIZE {
            return Err(protocol(command, &reply));
        }

        let mut body = vec![0u8; len + 2];
        timeout(self.timeout, self.stream.read_exact(&mut body))
            .await
            .map_err(|_| timed_out())??;
        if !body.ends_with(b"\r\n") {
            return Err(protocol(command, "job body not terminated by CRLF"));
        }
        body.truncate(len);

        debug!(host = %self.host, job = id, bytes = len, "Reserved");
        Ok(Job { id, body })
    }

    pub async fn delete_job(&mut self, id: JobId) -> Result<(), QueueError> {
        let command = format!("delete {id}");
        let reply = self.round_trip(&command, None, true).await?;
        expect_word(&command, &reply, "DELETED").map(|_| ())
    }

    /// Politely close the session; errors are irrelevant at this point.
    pub async fn quit(mut self) {
        let _ = self.stream.get_mut().write_all(b"quit\r\n").await;
        let _ = self.stream.get_mut().shutdown().await;
    }

    async fn round_trip(
        &mut self,
        command: &str,
        body: Option<&[u8]>,
        bounded: bool,
    ) -> Result<String, QueueError> {
        let mut frame = Vec::with_capacity(command.len() + body.map_or(0, |b| b.len() + 2) + 2);
        frame.extend_from_slice(command.as_bytes());
        frame.extend_from_slice(b"\r\n");
        if let Some(body) = body {
            frame.extend_from_slice(body);
            frame.extend_from_slice(b"\r\n");
        }

        let stream = self.stream.get_mut();
        stream.write_all(&frame).await?;
        stream.flush().await?;

        let mut line = String::new();
        let read = if bounded {
            timeout(self.timeout, self.stream.read_line(&mut line))
                .await
                .map_err(|_| timed_out())??
        } else {
            self.stream.read_line(&mut line).await?
        };
        if read == 0 {
            return Err(QueueError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
        }

        Ok(line.trim_end().to_string())
    }
}

#[async_trait]
impl Consumer for BeanstalkConnection {
    async fn reserve(&mut self) -> Result<Job, QueueError> {
        self.reserve_job().await
    }

    async fn delete(&mut self, id: JobId) -> Result<(), QueueError> {
        self.delete_job(id).await
    }
}

fn timed_out() -> QueueError {
    QueueError::Io(io::Error::from(io::ErrorKind::TimedOut))
}

fn protocol(command: &str, reply: &str) -> QueueError {
    QueueError::Protocol {
        command: command.to_string(),
        reply: reply.to_string(),
    }
}

/// Check that `reply` starts with `word`, returning the remainder. Known
/// broker-side refusals become `Rejected`, anything else is a protocol error.
fn expect_word<'r>(command: &str, reply: &'r str, word: &str) -> Result<&'r str, QueueError> {
    let (head, rest) = reply.split_once(' ').unwrap_or((reply, ""));
    if head == word {
        return Ok(rest);
    }

    match head {
        "BURIED" | "JOB_TOO_BIG" | "DRAINING" | "EXPECTED_CRLF" | "NOT_FOUND" | "NOT_IGNORED"
        | "OUT_OF_MEMORY" | "INTERNAL_ERROR" | "BAD_FORMAT" | "UNKNOWN_COMMAND" => {
            Err(QueueError::Rejected {
                command: command.to_string(),
                reply: reply.to_string(),
            })
        }
        _ => Err(protocol(command, reply)),
    }
}

fn parse_id(command: &str, reply: &str, raw: &str) -> Result<JobId, QueueError> {
    raw.trim().parse().map_err(|_| protocol(command, reply))
}
