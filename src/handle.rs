//! Controller-side handles for remote commands.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::DistexpError;
use crate::rpc::{AgentCall, RpcWriter, Token};

/// How a remote command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    /// The agent reported this exit code. Signal deaths are `128 + signal`.
    Exited(i32),
    /// The controller-side timeout fired before any exit code arrived.
    Timeout,
    /// The connection to the agent closed before any exit code arrived.
    Disconnected,
}

impl ReturnCode {
    pub fn success(&self) -> bool {
        matches!(self, ReturnCode::Exited(0))
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ReturnCode::Exited(code) => Some(*code),
            ReturnCode::Timeout | ReturnCode::Disconnected => None,
        }
    }
}

impl PartialEq<i32> for ReturnCode {
    fn eq(&self, other: &i32) -> bool {
        self.code() == Some(*other)
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReturnCode::Exited(code) => write!(f, "{}", code),
            ReturnCode::Timeout => f.write_str("timeout"),
            ReturnCode::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Set-once result slot. The first writer wins; later writes are ignored.
#[derive(Clone)]
pub struct RcCell(Arc<watch::Sender<Option<ReturnCode>>>);

impl RcCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self(Arc::new(tx))
    }

    /// Stores `rc` unless a value is already present. Returns whether it won.
    pub fn set(&self, rc: ReturnCode) -> bool {
        self.0.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(rc);
                true
            } else {
                false
            }
        })
    }

    pub fn get(&self) -> Option<ReturnCode> {
        *self.0.borrow()
    }

    pub async fn wait(&self) -> ReturnCode {
        let mut rx = self.0.subscribe();
        loop {
            if let Some(rc) = *rx.borrow_and_update() {
                return rc;
            }
            if rx.changed().await.is_err() {
                // Unreachable while `self` keeps the sender alive.
                futures::future::pending::<()>().await;
            }
        }
    }
}

impl Default for RcCell {
    fn default() -> Self {
        Self::new()
    }
}

/// A command running on one server.
///
/// Dropping the handle does not touch the remote process.
pub struct RemoteProcess {
    server: String,
    command: String,
    token: Token,
    rc: RcCell,
    writer: RpcWriter<AgentCall>,
}

impl RemoteProcess {
    pub(crate) fn new(
        server: String,
        command: String,
        token: Token,
        rc: RcCell,
        writer: RpcWriter<AgentCall>,
    ) -> Self {
        Self {
            server,
            command,
            token,
            rc,
            writer,
        }
    }

    /// Resolves the result to `Timeout` and kills the command if nothing
    /// arrived within `timeout`.
    pub(crate) fn arm_timeout(&self, timeout: Duration) {
        let rc = self.rc.clone();
        let writer = self.writer.clone();
        let token = self.token.clone();
        let server = self.server.clone();
        let command = self.command.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if rc.set(ReturnCode::Timeout) {
                info!("{}: TIMEOUT {:?} uuid={}", server, command, token);
                if let Err(e) = writer.call(AgentCall::KillCmd { token }).await {
                    warn!("{}: failed to kill timed out command: {}", server, e);
                }
            }
        });
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Waits until the command finished or timed out.
    pub async fn wait(&self) -> ReturnCode {
        self.rc.wait().await
    }

    /// The result if it is already known.
    pub fn try_wait(&self) -> Option<ReturnCode> {
        self.rc.get()
    }

    /// Waits and turns anything but exit code 0 into an error.
    pub async fn wait_success(&self) -> Result<(), DistexpError> {
        match self.wait().await {
            ReturnCode::Exited(0) => Ok(()),
            ReturnCode::Exited(code) => Err(DistexpError::RemoteExit {
                server: self.server.clone(),
                command: self.command.clone(),
                code,
            }),
            ReturnCode::Timeout => Err(DistexpError::Timeout {
                server: self.server.clone(),
                command: self.command.clone(),
            }),
            ReturnCode::Disconnected => Err(DistexpError::NotConnected(self.server.clone())),
        }
    }

    /// Kills the remote process group and waits for the final result.
    ///
    /// Fails with `NotConnected` if the agent can no longer be reached.
    pub async fn kill(&self) -> Result<ReturnCode, DistexpError> {
        let sent = self
            .writer
            .call(AgentCall::KillCmd {
                token: self.token.clone(),
            })
            .await?;
        if !sent {
            return Err(DistexpError::NotConnected(self.server.clone()));
        }
        Ok(self.wait().await)
    }

    /// Writes `line` to the command's stdin, closing it afterwards if `close`.
    pub async fn stdin(&self, line: &str, close: bool) -> Result<(), DistexpError> {
        self.writer
            .call(AgentCall::StdinCmd {
                token: self.token.clone(),
                line: line.to_string(),
                close,
            })
            .await?;
        Ok(())
    }
}

impl fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProcess")
            .field("server", &self.server)
            .field("command", &self.command)
            .field("token", &self.token)
            .field("rc", &self.rc.get())
            .finish()
    }
}

/// Waits for every process, preserving order.
pub async fn wait_all(processes: &[RemoteProcess]) -> Vec<ReturnCode> {
    join_all(processes.iter().map(|p| p.wait())).await
}

/// Polls until some process failed or all succeeded.
///
/// Returns the first failure seen, or `None` once every process exited 0.
pub async fn any_failed(processes: &[RemoteProcess], poll_interval: Duration) -> Option<ReturnCode> {
    loop {
        let rcs: Vec<Option<ReturnCode>> = processes.iter().map(|p| p.try_wait()).collect();
        if let Some(failed) = rcs.iter().flatten().find(|rc| !rc.success()) {
            return Some(*failed);
        }
        if rcs.iter().all(|rc| rc.is_some()) {
            return None;
        }
        tokio::time::sleep(poll_interval).await;
    }
}
