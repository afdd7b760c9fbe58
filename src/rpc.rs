//! Line-delimited JSON RPC between the controller and an agent.
//!
//! Every call is one record `{method, args, kwargs}` on one line. Calls are
//! one-way: results travel back as separate calls on the reverse interface,
//! correlated by a [`Token`] inside the arguments.
//!
//! The read loop never waits for a callee. Each decoded call is handed to
//! [`Dispatch::dispatch`], which either finishes synchronously or spawns its
//! own task, so a slow `run_cmd` can never stall a `kill_cmd` behind it.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::error::DistexpError;

/// Correlates one controller-issued command with agent-side state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// A fresh, process-unique token.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One wire record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Message {
    pub fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.to_string(), value.into());
        self
    }

    /// Serializes to one frame, including the trailing newline.
    ///
    /// JSON escapes control characters inside strings, so the only raw
    /// newline in the frame is the terminator.
    pub fn encode(&self) -> Result<String, DistexpError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parses one frame without its terminator.
    pub fn decode(line: &[u8]) -> Result<Self, DistexpError> {
        Ok(serde_json::from_slice(line)?)
    }

    /// Looks up an argument passed either positionally or by name.
    fn lookup(&self, index: usize, name: &str) -> Option<&Value> {
        self.args.get(index).or_else(|| self.kwargs.get(name))
    }

    pub fn param<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, DistexpError> {
        let value = self.lookup(index, name).ok_or_else(|| {
            DistexpError::Protocol(format!("{}: missing argument '{}'", self.method, name))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            DistexpError::Protocol(format!("{}: bad argument '{}': {}", self.method, name, e))
        })
    }

    pub fn param_or<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
        default: T,
    ) -> Result<T, DistexpError> {
        match self.lookup(index, name) {
            None | Some(Value::Null) => Ok(default),
            Some(_) => self.param(index, name),
        }
    }
}

/// A closed set of remotely callable methods.
pub trait RemoteCall: fmt::Debug + Send + Sized + 'static {
    fn to_message(&self) -> Message;
    fn from_message(message: Message) -> Result<Self, DistexpError>;
}

/// Methods the agent exposes to the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCall {
    Ping(Value),
    Cd(Option<String>),
    RunCmd {
        token: Token,
        command: String,
        env: HashMap<String, String>,
    },
    KillCmd {
        token: Token,
    },
    StdinCmd {
        token: Token,
        line: String,
        close: bool,
    },
}

impl RemoteCall for AgentCall {
    fn to_message(&self) -> Message {
        match self {
            AgentCall::Ping(x) => Message::new("ping").arg(x.clone()),
            AgentCall::Cd(directory) => Message::new("cd").arg(directory.clone()),
            AgentCall::RunCmd {
                token,
                command,
                env,
            } => {
                let env: Map<String, Value> = env
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                    .collect();
                Message::new("run_cmd")
                    .arg(token.as_str())
                    .arg(command.as_str())
                    .kwarg("env", env)
            }
            AgentCall::KillCmd { token } => Message::new("kill_cmd").arg(token.as_str()),
            AgentCall::StdinCmd { token, line, close } => Message::new("stdin_cmd")
                .arg(token.as_str())
                .arg(line.as_str())
                .kwarg("close", *close),
        }
    }

    fn from_message(message: Message) -> Result<Self, DistexpError> {
        match message.method.as_str() {
            "ping" => Ok(AgentCall::Ping(message.param_or(0, "x", Value::Null)?)),
            "cd" => Ok(AgentCall::Cd(message.param_or(0, "directory", None)?)),
            "run_cmd" => Ok(AgentCall::RunCmd {
                token: message.param(0, "uuid")?,
                command: message.param(1, "cmd")?,
                env: message.param_or(2, "env", HashMap::new())?,
            }),
            "kill_cmd" => Ok(AgentCall::KillCmd {
                token: message.param(0, "uuid")?,
            }),
            "stdin_cmd" => Ok(AgentCall::StdinCmd {
                token: message.param(0, "uuid")?,
                line: message.param(1, "line")?,
                close: message.param_or(2, "close", false)?,
            }),
            other => Err(DistexpError::Protocol(format!(
                "agent has no method '{}'",
                other
            ))),
        }
    }
}

/// Methods the controller exposes to the agent.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerCall {
    Pong(Value),
    Stdout { token: Token, line: String },
    Stderr { token: Token, line: String },
    Rc { token: Token, code: i32 },
}

impl RemoteCall for ControllerCall {
    fn to_message(&self) -> Message {
        match self {
            ControllerCall::Pong(x) => Message::new("pong").arg(x.clone()),
            ControllerCall::Stdout { token, line } => {
                Message::new("stdout").arg(token.as_str()).arg(line.as_str())
            }
            ControllerCall::Stderr { token, line } => {
                Message::new("stderr").arg(token.as_str()).arg(line.as_str())
            }
            ControllerCall::Rc { token, code } => {
                Message::new("rc").arg(token.as_str()).arg(*code)
            }
        }
    }

    fn from_message(message: Message) -> Result<Self, DistexpError> {
        match message.method.as_str() {
            "pong" => Ok(ControllerCall::Pong(message.param_or(0, "x", Value::Null)?)),
            "stdout" => Ok(ControllerCall::Stdout {
                token: message.param(0, "uuid")?,
                line: message.param(1, "line")?,
            }),
            "stderr" => Ok(ControllerCall::Stderr {
                token: message.param(0, "uuid")?,
                line: message.param(1, "line")?,
            }),
            "rc" => Ok(ControllerCall::Rc {
                token: message.param(0, "uuid")?,
                code: message.param(1, "rc")?,
            }),
            other => Err(DistexpError::Protocol(format!(
                "controller has no method '{}'",
                other
            ))),
        }
    }
}

/// Sending half of a connection, typed by the peer's interface.
pub struct RpcWriter<C> {
    inner: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    closed: Arc<AtomicBool>,
    _calls: PhantomData<fn(C)>,
}

impl<C> Clone for RpcWriter<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            closed: Arc::clone(&self.closed),
            _calls: PhantomData,
        }
    }
}

impl<C: RemoteCall> RpcWriter<C> {
    pub fn new<W: AsyncWrite + Send + Unpin + 'static>(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
            closed: Arc::new(AtomicBool::new(false)),
            _calls: PhantomData,
        }
    }

    /// Writes one call.
    ///
    /// Returns `Ok(false)` when the peer is gone: the call is dropped and not
    /// retried.
    pub async fn call(&self, call: C) -> Result<bool, DistexpError> {
        if self.closed.load(Ordering::Acquire) {
            debug!("Dropping {:?}: connection closed", call);
            return Ok(false);
        }
        let frame = call.to_message().encode()?;
        trace!("call: {}", frame.trim_end());
        let mut writer = self.inner.lock().await;
        let result = match writer.write_all(frame.as_bytes()).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(true),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::NotConnected
                ) =>
            {
                debug!("Dropping {:?}: {}", call, e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Shuts down the write side. Later calls are dropped.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut writer = self.inner.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Error while closing connection: {}", e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// The local side of a connection: receives the peer's calls.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    type Call: RemoteCall;

    /// Handles one inbound call without blocking the read loop.
    fn dispatch(self: Arc<Self>, call: Self::Call);

    /// Runs once after the connection is gone.
    async fn on_disconnect(&self);
}

/// Reads calls until the peer hangs up, then closes `writer` and runs the
/// disconnect hook.
pub async fn read_loop<R, H, C>(reader: R, writer: RpcWriter<C>, handler: Arc<H>, peer: String)
where
    R: AsyncRead + Unpin,
    H: Dispatch,
    C: RemoteCall,
{
    info!("Initiated connection with {}", peer);
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read from {} failed: {}", peer, e);
                break;
            }
        }
        if buf.last() != Some(&b'\n') {
            debug!("Truncated frame from {}", peer);
            break;
        }
        let call = Message::decode(&buf[..buf.len() - 1]).and_then(H::Call::from_message);
        match call {
            Ok(call) => {
                trace!("{} -> {:?}", peer, call);
                Arc::clone(&handler).dispatch(call);
            }
            Err(e) => warn!("Ignoring call from {}: {}", peer, e),
        }
    }
    writer.close().await;
    info!("Lost connection with {}", peer);
    handler.on_disconnect().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    #[test]
    fn test_frame_has_single_trailing_newline() {
        let call = AgentCall::StdinCmd {
            token: Token::from("t1"),
            line: "first\nsecond\n".to_string(),
            close: true,
        };
        let frame = call.to_message().encode().unwrap();
        assert!(frame.ends_with('\n'));
        assert_eq!(frame.matches('\n').count(), 1);
    }

    #[test]
    fn test_agent_call_wire_shape() {
        let mut env = HashMap::new();
        env.insert("OMP_NUM_THREADS".to_string(), "4".to_string());
        let call = AgentCall::RunCmd {
            token: Token::from("abc"),
            command: "make -j".to_string(),
            env,
        };
        let frame = call.to_message().encode().unwrap();
        let value: Value = serde_json::from_str(frame.trim_end()).unwrap();
        assert_eq!(value["method"], "run_cmd");
        assert_eq!(value["args"][0], "abc");
        assert_eq!(value["args"][1], "make -j");
        assert_eq!(value["kwargs"]["env"]["OMP_NUM_THREADS"], "4");

        let decoded = AgentCall::from_message(Message::decode(frame.trim_end().as_bytes()).unwrap());
        assert_eq!(decoded.unwrap(), call);
    }

    #[test]
    fn test_keyword_arguments_are_accepted() {
        let line = br#"{"method": "stdin_cmd", "args": [], "kwargs": {"uuid": "u", "line": "y\n", "close": true}}"#;
        let call = AgentCall::from_message(Message::decode(line).unwrap()).unwrap();
        assert_eq!(
            call,
            AgentCall::StdinCmd {
                token: Token::from("u"),
                line: "y\n".to_string(),
                close: true
            }
        );
    }

    #[test]
    fn test_optional_arguments_default() {
        let line = br#"{"method": "run_cmd", "args": ["u", "ls"]}"#;
        match AgentCall::from_message(Message::decode(line).unwrap()).unwrap() {
            AgentCall::RunCmd { env, .. } => assert!(env.is_empty()),
            other => panic!("unexpected call {:?}", other),
        }
        let line = br#"{"method": "cd", "args": [null]}"#;
        assert_eq!(
            AgentCall::from_message(Message::decode(line).unwrap()).unwrap(),
            AgentCall::Cd(None)
        );
    }

    #[test]
    fn test_unknown_method_is_rejected() {
        let line = br#"{"method": "format_disk", "args": []}"#;
        let err = AgentCall::from_message(Message::decode(line).unwrap()).unwrap_err();
        assert!(matches!(err, DistexpError::Protocol(_)));
    }

    #[test]
    fn test_missing_argument_is_rejected() {
        let line = br#"{"method": "rc", "args": ["u"]}"#;
        let err = ControllerCall::from_message(Message::decode(line).unwrap()).unwrap_err();
        assert!(matches!(err, DistexpError::Protocol(_)));
    }

    struct Recorder {
        calls: StdMutex<Vec<ControllerCall>>,
        disconnected: Notify,
    }

    #[async_trait]
    impl Dispatch for Recorder {
        type Call = ControllerCall;

        fn dispatch(self: Arc<Self>, call: ControllerCall) {
            self.calls.lock().unwrap().push(call);
        }

        async fn on_disconnect(&self) {
            self.disconnected.notify_one();
        }
    }

    #[tokio::test]
    async fn test_read_loop_dispatches_in_order_and_runs_hook() {
        let (local, remote) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(local);
        let recorder = Arc::new(Recorder {
            calls: StdMutex::new(Vec::new()),
            disconnected: Notify::new(),
        });
        let loop_task = tokio::spawn(read_loop(
            read_half,
            RpcWriter::<AgentCall>::new(write_half),
            Arc::clone(&recorder),
            "test-peer".to_string(),
        ));

        let peer = RpcWriter::<ControllerCall>::new(remote);
        for i in 0..3 {
            let sent = peer
                .call(ControllerCall::Stdout {
                    token: Token::from("t"),
                    line: format!("line {}", i),
                })
                .await
                .unwrap();
            assert!(sent);
        }
        peer.call(ControllerCall::Rc {
            token: Token::from("t"),
            code: 0,
        })
        .await
        .unwrap();
        peer.close().await;

        recorder.disconnected.notified().await;
        loop_task.await.unwrap();

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(calls.len(), 4);
        assert_eq!(
            calls[1],
            ControllerCall::Stdout {
                token: Token::from("t"),
                line: "line 1".to_string()
            }
        );
        assert!(matches!(calls[3], ControllerCall::Rc { code: 0, .. }));
    }

    #[tokio::test]
    async fn test_calls_after_close_are_dropped() {
        let (local, _remote) = tokio::io::duplex(64);
        let writer = RpcWriter::<AgentCall>::new(local);
        writer.close().await;
        assert!(writer.is_closed());
        let sent = writer.call(AgentCall::Ping(Value::Null)).await.unwrap();
        assert!(!sent);
    }
}
