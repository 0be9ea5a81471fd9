//! Fire-and-forget reporting of transfer rates to a telemetry endpoint.
//!
//! Each report is one text command,
//! `exec <role> monitorTransfer <id> <k1> <v1> <k2> <v2> ...`, sent over a
//! request/response connection. Report failures are logged at `debug` and
//! never reach the transfer path.

use crate::rate::RateSnapshot;
use std::fmt::{self, Display, Write as _};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Largest response accepted from the telemetry endpoint
const MAX_RESPONSE_LEN: u32 = 1024 * 1024;

/// Which side of a transfer is reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The side that initiated the transfer
    Client,
    /// The side that accepted it
    Server,
}

impl Role {
    /// Name used in report commands
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Client => "FdxClient",
            Role::Server => "FdxServer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render a report command; parameters keep their order
pub fn format_command<I, K, V>(role: Role, id: impl Display, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: Display,
    V: Display,
{
    let mut cmd = format!("exec {role} monitorTransfer {id}");
    for (k, v) in params {
        let _ = write!(cmd, " {k} {v}");
    }
    cmd
}

/// Transport for report commands
pub trait CommandSink: Send {
    /// Send one command and return the endpoint's response
    fn send_command(&mut self, cmd: &str) -> impl Future<Output = io::Result<String>> + Send;
}

/// Sends commands over TCP, each framed with a 4-byte big-endian length.
///
/// The connection is opened on first use and re-opened after any failure.
#[derive(Debug)]
pub struct TcpCommandSink {
    addr: SocketAddr,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpCommandSink {
    /// Create a sink for `addr`; nothing is connected yet
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            stream: None,
        }
    }

    async fn exchange(&mut self, cmd: &str) -> io::Result<String> {
        if self.stream.is_none() {
            let stream = tokio::time::timeout(self.timeout, TcpStream::connect(self.addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
            stream.set_nodelay(true)?;
            self.stream = Some(stream);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no connection"));
        };

        let len = u32::try_from(cmd.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "command too long"))?;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(cmd.as_bytes()).await?;
        stream.flush().await?;

        let resp_len = stream.read_u32().await?;
        if resp_len > MAX_RESPONSE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("response of {resp_len} bytes exceeds limit"),
            ));
        }
        let mut buf = vec![0u8; resp_len as usize];
        stream.read_exact(&mut buf).await?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl CommandSink for TcpCommandSink {
    async fn send_command(&mut self, cmd: &str) -> io::Result<String> {
        let result = tokio::time::timeout(self.timeout, self.exchange(cmd))
            .await
            .unwrap_or_else(|_| {
                Err(io::Error::new(io::ErrorKind::TimedOut, "command timed out"))
            });
        if result.is_err() {
            self.stream = None;
        }
        result
    }
}

/// Sends rate reports for one role
#[derive(Debug)]
pub struct Reporter<S> {
    role: Role,
    sink: S,
}

impl<S: CommandSink> Reporter<S> {
    /// Create a reporter
    pub fn new(role: Role, sink: S) -> Self {
        Self { role, sink }
    }

    /// Send a report; failures are logged and dropped
    pub async fn report<I, K, V>(&mut self, id: impl Display, params: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Display,
        V: Display,
    {
        let cmd = format_command(self.role, id, params);
        match self.sink.send_command(&cmd).await {
            Ok(resp) => debug!(role = %self.role, response = %resp, "Report sent"),
            Err(e) => debug!(role = %self.role, error = %e, "Failed to send report"),
        }
    }

    /// Report the rates of one entity
    pub async fn report_rates(&mut self, id: impl Display, snapshot: &RateSnapshot) {
        let params = [
            ("TotalRate", snapshot.total_rate),
            ("UtilRate", snapshot.util_rate),
            ("AvgTotalRate", snapshot.avg_total_rate),
            ("AvgUtilRate", snapshot.avg_util_rate),
            ("TotalBytes", snapshot.total_bytes as f64),
        ];
        self.report(id, params).await;
    }

    /// The underlying sink
    pub fn sink(&self) -> &S {
        &self.sink
    }
}
