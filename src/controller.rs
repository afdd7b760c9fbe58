//! Controller side of one agent connection.
//!
//! The agent calls back with output lines and exit codes. Those calls are
//! cheap and must keep per-stream order, so they run inline in the read loop
//! instead of in spawned tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::DistexpError;
use crate::handle::{RcCell, ReturnCode};
use crate::output::OutputHandler;
use crate::rpc::{ControllerCall, Dispatch, Token};

/// A nonzero exit seen on some connection, reported to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteExit {
    pub server: String,
    pub command: String,
    pub code: i32,
}

impl From<RemoteExit> for DistexpError {
    fn from(exit: RemoteExit) -> Self {
        DistexpError::RemoteExit {
            server: exit.server,
            command: exit.command,
            code: exit.code,
        }
    }
}

/// Controller-side state for one command still in flight.
pub(crate) struct CommandState {
    pub command: String,
    pub rc: RcCell,
    pub stdout: Vec<Box<dyn OutputHandler>>,
    pub stderr: Vec<Box<dyn OutputHandler>>,
}

pub struct ControllerHandler {
    server: String,
    commands: Mutex<HashMap<Token, CommandState>>,
    exits: Option<flume::Sender<RemoteExit>>,
    pongs: AtomicU64,
    pong: Notify,
    last_pong: Mutex<Option<Value>>,
}

impl ControllerHandler {
    pub(crate) fn new(server: String, exits: Option<flume::Sender<RemoteExit>>) -> Self {
        Self {
            server,
            commands: Mutex::new(HashMap::new()),
            exits,
            pongs: AtomicU64::new(0),
            pong: Notify::new(),
            last_pong: Mutex::new(None),
        }
    }

    /// Installs handlers for `token`. Must happen before `run_cmd` is sent.
    pub(crate) fn register(&self, token: Token, state: CommandState) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.insert(token, state);
        }
    }

    /// Drops the state of a command whose `run_cmd` never left this side.
    pub(crate) fn forget(&self, token: &Token) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.remove(token);
        }
    }

    /// Number of commands that have not reported an exit code yet.
    pub fn in_flight(&self) -> usize {
        self.commands.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn pongs(&self) -> u64 {
        self.pongs.load(Ordering::Relaxed)
    }

    /// Registers interest in the next `pong` before the `ping` is sent.
    pub(crate) fn pong_notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.pong.notified()
    }

    pub(crate) fn last_pong(&self) -> Option<Value> {
        self.last_pong.lock().ok().and_then(|v| v.clone())
    }

    fn on_output(&self, token: &Token, line: &str, stderr: bool) {
        let Ok(mut commands) = self.commands.lock() else {
            return;
        };
        let Some(state) = commands.get_mut(token) else {
            debug!("{}: output for unknown command {}", self.server, token);
            return;
        };
        let handlers = if stderr {
            &mut state.stderr
        } else {
            &mut state.stdout
        };
        for handler in handlers.iter_mut() {
            handler.on_line(line);
        }
    }

    fn on_rc(&self, token: &Token, code: i32) {
        let state = match self.commands.lock() {
            Ok(mut commands) => commands.remove(token),
            Err(_) => None,
        };
        let Some(state) = state else {
            debug!("{}: rc for unknown command {}", self.server, token);
            return;
        };
        if code != 0 {
            // Reported before the cell is set so the scheduler sees the
            // failure no later than whoever awaits the handle.
            if let Some(exits) = &self.exits {
                let _ = exits.send(RemoteExit {
                    server: self.server.clone(),
                    command: state.command.clone(),
                    code,
                });
            }
        }
        if state.rc.set(ReturnCode::Exited(code)) {
            info!("{}: rc={} for {:?}", self.server, code, state.command);
        } else {
            debug!(
                "{}: late rc={} for {:?} ignored",
                self.server, code, state.command
            );
        }
    }
}

#[async_trait]
impl Dispatch for ControllerHandler {
    type Call = ControllerCall;

    fn dispatch(self: Arc<Self>, call: ControllerCall) {
        match call {
            ControllerCall::Pong(x) => {
                self.pongs.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut last) = self.last_pong.lock() {
                    *last = Some(x);
                }
                self.pong.notify_waiters();
            }
            ControllerCall::Stdout { token, line } => self.on_output(&token, &line, false),
            ControllerCall::Stderr { token, line } => self.on_output(&token, &line, true),
            ControllerCall::Rc { token, code } => self.on_rc(&token, code),
        }
    }

    async fn on_disconnect(&self) {
        let pending: Vec<CommandState> = self
            .commands
            .lock()
            .map(|mut commands| commands.drain().map(|(_, state)| state).collect())
            .unwrap_or_default();
        for state in pending {
            if state.rc.set(ReturnCode::Disconnected) {
                warn!(
                    "{}: connection closed while {:?} was running",
                    self.server, state.command
                );
            }
        }
    }
}
