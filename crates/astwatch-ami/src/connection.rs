//! AMI session: TCP connect, login, block reads and keepalive

use std::time::Duration;

use astwatch_core::config::AmiConfig;
use astwatch_core::models::ExtenStatus;
use astwatch_core::{WatchError, WatchResult};
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{
    ACTION_EXTENSION_STATE, ACTION_LOGIN, ACTION_PING, BANNER_PREFIX, MAX_LINE_LENGTH,
};
use crate::message::{encode_action, AmiMessage};

/// Result of one bounded read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete block arrived
    Message(AmiMessage),
    /// Nothing complete arrived before the timeout
    Timeout,
}

/// An open manager session over any byte stream
pub struct AmiConnection<S> {
    framed: FramedRead<S, LinesCodec>,
    /// Lines of a block still being assembled; kept here so that a timed-out
    /// read loses nothing
    pending: Vec<String>,
    peer: String,
}

impl AmiConnection<TcpStream> {
    /// Connect and log in, both bounded by the configured connect timeout
    pub async fn connect(config: &AmiConfig) -> WatchResult<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let timeout_ms = config.connect_timeout_ms;
        info!("Connecting to Asterisk AMI: {}", addr);

        let stream = match timeout(
            Duration::from_millis(timeout_ms),
            TcpStream::connect(addr.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("TCP connect to {} failed: {}", addr, e);
                return Err(WatchError::Connection(format!("{}: {}", addr, e)));
            }
            Err(_) => {
                warn!("TCP connect to {} timed out after {}ms", addr, timeout_ms);
                return Err(WatchError::Timeout { timeout_ms });
            }
        };

        let mut conn = Self::from_stream(stream, addr);
        let action_id = Uuid::new_v4().to_string();
        match timeout(
            Duration::from_millis(timeout_ms),
            conn.authenticate(&config.username, &config.secret, &config.events, &action_id),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(WatchError::Timeout { timeout_ms }),
        }

        Ok(conn)
    }
}

impl<S> AmiConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn from_stream(stream: S, peer: impl Into<String>) -> Self {
        Self {
            framed: FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            pending: Vec::new(),
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Consume the banner, send `Login` and wait for the reply carrying our
    /// `ActionID`. Unrelated blocks arriving meanwhile are skipped.
    pub async fn authenticate(
        &mut self,
        username: &str,
        secret: &str,
        events: &str,
        action_id: &str,
    ) -> WatchResult<()> {
        let banner = self.next_line().await?;
        if banner.starts_with(BANNER_PREFIX) {
            debug!("AMI banner from {}: {}", self.peer, banner);
        } else if !banner.is_empty() {
            warn!("Unexpected AMI banner from {}: {}", self.peer, banner);
            self.pending.push(banner);
        }

        self.send_action(
            ACTION_LOGIN,
            &[
                ("Username", username),
                ("Secret", secret),
                ("Events", events),
                ("ActionID", action_id),
            ],
        )
        .await?;

        let reply = self.reply_to(action_id).await?;
        if reply.is_success() {
            info!("✅ Authenticated to Asterisk AMI: {}", self.peer);
            return Ok(());
        }
        let reason = reply.get("Message").unwrap_or("login rejected").to_string();
        warn!("❌ AMI login rejected by {}: {}", self.peer, reason);
        Err(WatchError::AuthenticationFailed(reason))
    }

    /// Read the next complete block, waiting at most `wait`
    pub async fn next_message(&mut self, wait: Duration) -> WatchResult<ReadOutcome> {
        match timeout(wait, self.read_block()).await {
            Ok(block) => block.map(ReadOutcome::Message),
            Err(_) => Ok(ReadOutcome::Timeout),
        }
    }

    /// Query the hint state of one extension, waiting at most `wait` for the
    /// reply carrying `action_id`. Events arriving meanwhile are dropped.
    ///
    /// A rejected query or a reply without a usable `Status` reads as
    /// [`ExtenStatus::NAN`].
    pub async fn extension_state(
        &mut self,
        exten: &str,
        action_id: &str,
        wait: Duration,
    ) -> WatchResult<ExtenStatus> {
        self.send_action(
            ACTION_EXTENSION_STATE,
            &[("ActionID", action_id), ("Exten", exten)],
        )
        .await?;

        let reply = match timeout(wait, self.reply_to(action_id)).await {
            Ok(reply) => reply?,
            Err(_) => {
                return Err(WatchError::Timeout {
                    timeout_ms: wait.as_millis() as u64,
                })
            }
        };

        let status = reply
            .get("Status")
            .and_then(|s| s.parse::<i32>().ok())
            .filter(|_| reply.is_success())
            .map(ExtenStatus::from_bits);
        match status {
            Some(status) => {
                debug!("Extension {} state on {}: {}", exten, self.peer, status);
                Ok(status)
            }
            None => {
                warn!(
                    "No state for extension {} from {}: {}",
                    exten,
                    self.peer,
                    reply.get("Message").unwrap_or("no status")
                );
                Ok(ExtenStatus::NAN)
            }
        }
    }

    /// Keepalive probe; the reply is an ordinary block and is ignored
    pub async fn ping(&mut self) -> WatchResult<()> {
        self.send_action(ACTION_PING, &[]).await
    }

    pub async fn send_action(&mut self, action: &str, fields: &[(&str, &str)]) -> WatchResult<()> {
        let raw = encode_action(action, fields);
        let stream = self.framed.get_mut();
        stream.write_all(raw.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn reply_to(&mut self, action_id: &str) -> WatchResult<AmiMessage> {
        loop {
            let block = self.read_block().await?;
            if block.action_id() == Some(action_id) {
                return Ok(block);
            }
            debug!("Skipping block while waiting for reply {}", action_id);
        }
    }

    async fn read_block(&mut self) -> WatchResult<AmiMessage> {
        loop {
            let line = self.next_line().await?;
            if !line.is_empty() {
                self.pending.push(line);
                continue;
            }
            if self.pending.is_empty() {
                continue;
            }
            let lines = std::mem::take(&mut self.pending);
            return Ok(AmiMessage::from_lines(lines));
        }
    }

    async fn next_line(&mut self) -> WatchResult<String> {
        match self.framed.next().await {
            Some(Ok(line)) => Ok(line),
            Some(Err(LinesCodecError::Io(e))) => Err(WatchError::Io(e)),
            Some(Err(e)) => Err(WatchError::Framing(e.to_string())),
            None => Err(WatchError::ConnectionClosed),
        }
    }
}
