//! Agent-side process supervision.
//!
//! One `Supervisor` exists per controller connection. It spawns commands in
//! their own process group, streams their output back line by line, and
//! kills every group it still tracks once the controller goes away.

use std::collections::{HashMap, HashSet};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, error, info, warn};

use crate::rpc::{AgentCall, ControllerCall, Dispatch, RpcWriter, Token};

/// How often `kill_cmd`/`stdin_cmd` look for a process that is still starting.
const REGISTRATION_ATTEMPTS: usize = 10;
const REGISTRATION_INTERVAL: Duration = Duration::from_millis(100);

/// Reported when the shell itself could not be started.
pub const SPAWN_FAILED: i32 = 127;

/// Forces line-buffered stdout in children via coreutils' `libstdbuf`.
#[derive(Debug, Clone)]
pub struct LineBuffering {
    preload: String,
}

impl LineBuffering {
    /// Finds the `libstdbuf` shim by asking `stdbuf` which library it preloads.
    pub fn detect() -> Option<Self> {
        let output = std::process::Command::new("stdbuf")
            .args(["-oL", "env"])
            .output()
            .ok()?;
        let env = String::from_utf8_lossy(&output.stdout);
        let preload = env
            .lines()
            .filter_map(|line| line.strip_prefix("LD_PRELOAD="))
            .flat_map(|value| value.split([':', ' ']))
            .find(|lib| lib.contains("stdbuf"))?;
        Some(Self {
            preload: preload.to_string(),
        })
    }

    pub fn new(preload: impl Into<String>) -> Self {
        Self {
            preload: preload.into(),
        }
    }

    /// The environment entries to inject, given the child's own `LD_PRELOAD`.
    pub fn env(&self, existing_preload: Option<&str>) -> [(&'static str, String); 2] {
        let preload = match existing_preload {
            Some(existing) if !existing.is_empty() => format!("{}:{}", existing, self.preload),
            _ => self.preload.clone(),
        };
        [("_STDBUF_O", "L".to_string()), ("LD_PRELOAD", preload)]
    }
}

/// A spawned process as tracked by the supervisor.
struct Process {
    pid: u32,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    running: AtomicBool,
}

impl Process {
    /// Sends SIGKILL to the whole process group.
    ///
    /// The group can outlive its leader, so this signals even after the shell
    /// exited. Linux does not hand out a pid that is still a live process
    /// group id. Returns whether any member was left to signal.
    fn kill(&self, token: &Token) -> bool {
        // SAFETY: killpg has no memory-safety preconditions.
        let ret = unsafe { libc::killpg(self.pid as libc::pid_t, libc::SIGKILL) };
        if ret == 0 {
            info!("killed: {} {}", token, self.pid);
            return true;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!("{} (pid {}) already gone", token, self.pid);
        } else {
            error!("Failed to kill {} (pid {}): {}", token, self.pid, err);
        }
        false
    }

    /// Whether any process of the group is still around.
    fn group_alive(&self) -> bool {
        // SAFETY: signal 0 only checks for existence.
        unsafe { libc::killpg(self.pid as libc::pid_t, 0) == 0 }
    }
}

pub struct Supervisor {
    peer: String,
    writer: RpcWriter<ControllerCall>,
    processes: Mutex<HashMap<Token, Arc<Process>>>,
    /// Commands whose whole group is gone. Late kills and writes for them are no-ops.
    finished: Mutex<HashSet<Token>>,
    cwd: Mutex<Option<PathBuf>>,
    line_buffering: Option<LineBuffering>,
    pings: AtomicU64,
}

impl Supervisor {
    pub fn new(
        peer: String,
        writer: RpcWriter<ControllerCall>,
        line_buffering: Option<LineBuffering>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer,
            writer,
            processes: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashSet::new()),
            cwd: Mutex::new(None),
            line_buffering,
            pings: AtomicU64::new(0),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::Relaxed)
    }

    /// Whether `token` is registered and its process has not exited yet.
    pub fn is_running(&self, token: &Token) -> bool {
        self.lookup(token)
            .map(|p| p.running.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Process ids of everything still running on this connection.
    pub fn running_pids(&self) -> Vec<u32> {
        self.processes
            .lock()
            .map(|processes| {
                processes
                    .values()
                    .filter(|p| p.running.load(Ordering::Acquire))
                    .map(|p| p.pid)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of process groups still tracked, including ones whose shell
    /// exited but left descendants behind.
    pub fn tracked(&self) -> usize {
        self.processes.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Kills every tracked process group. Returns how many still had members.
    pub fn kill_all(&self) -> usize {
        let processes: Vec<(Token, Arc<Process>)> = match self.processes.lock() {
            Ok(processes) => processes
                .iter()
                .map(|(token, p)| (token.clone(), Arc::clone(p)))
                .collect(),
            Err(_) => return 0,
        };
        let mut killed = 0;
        for (token, process) in processes {
            if process.kill(&token) {
                killed += 1;
            }
            if !process.running.load(Ordering::Acquire) {
                self.untrack(&token);
            }
        }
        killed
    }

    /// Forgets `token` along with its stdin pipe.
    fn untrack(&self, token: &Token) {
        if let Ok(mut processes) = self.processes.lock() {
            processes.remove(token);
        }
        if let Ok(mut finished) = self.finished.lock() {
            finished.insert(token.clone());
        }
    }

    pub async fn handle(&self, call: AgentCall) {
        match call {
            AgentCall::Ping(x) => {
                self.pings.fetch_add(1, Ordering::Relaxed);
                self.send(ControllerCall::Pong(x)).await;
            }
            AgentCall::Cd(directory) => {
                debug!("cd {:?}", directory);
                if let Ok(mut cwd) = self.cwd.lock() {
                    *cwd = directory.map(PathBuf::from);
                }
            }
            AgentCall::RunCmd {
                token,
                command,
                env,
            } => self.run_cmd(token, command, env).await,
            AgentCall::KillCmd { token } => self.kill_cmd(&token).await,
            AgentCall::StdinCmd { token, line, close } => {
                self.stdin_cmd(&token, &line, close).await
            }
        }
    }

    async fn run_cmd(&self, token: Token, command: String, env: HashMap<String, String>) {
        info!("uuid={} cmd={}", token, command);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .envs(&env);
        if let Some(line_buffering) = &self.line_buffering {
            let existing = env
                .get("LD_PRELOAD")
                .cloned()
                .or_else(|| std::env::var("LD_PRELOAD").ok());
            cmd.envs(line_buffering.env(existing.as_deref()));
        }
        if let Some(cwd) = self.cwd.lock().ok().and_then(|cwd| cwd.clone()) {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn {:?}: {}", command, e);
                self.send(ControllerCall::Rc {
                    token,
                    code: SPAWN_FAILED,
                })
                .await;
                return;
            }
        };
        let Some(pid) = child.id() else {
            error!("{:?} exited before it could be registered", command);
            self.send(ControllerCall::Rc {
                token,
                code: SPAWN_FAILED,
            })
            .await;
            return;
        };

        let process = Arc::new(Process {
            pid,
            stdin: tokio::sync::Mutex::new(child.stdin.take()),
            running: AtomicBool::new(true),
        });
        if let Ok(mut processes) = self.processes.lock() {
            processes.insert(token.clone(), Arc::clone(&process));
        }
        info!("Attach gdb: gdb -p {}", pid);

        join(
            self.stream(&token, child.stdout.take(), Stream::Stdout),
            self.stream(&token, child.stderr.take(), Stream::Stderr),
        )
        .await;

        let code = match child.wait().await {
            Ok(status) => exit_code(status),
            Err(e) => {
                error!("Failed to wait for {:?}: {}", command, e);
                -1
            }
        };
        process.running.store(false, Ordering::Release);
        if process.group_alive() {
            debug!("{} left processes behind in group {}", token, pid);
        } else {
            self.untrack(&token);
        }
        info!("Got rc={} for: {:?}", code, command);
        self.send(ControllerCall::Rc { token, code }).await;
    }

    /// Forwards every line of `stream` until EOF.
    async fn stream<B: AsyncRead + Unpin>(&self, token: &Token, stream: Option<B>, kind: Stream) {
        let Some(stream) = stream else {
            return;
        };
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if let Err(e) = read_line(&mut reader, &mut buf).await {
                warn!("Failed to read {:?} of {}: {}", kind, token, e);
                break;
            }
            // An empty buffer means that EOF was reached.
            if buf.is_empty() {
                break;
            }
            let line = String::from_utf8_lossy(trim_newline(&buf)).into_owned();
            self.send(kind.call(token.clone(), line)).await;
        }
    }

    async fn kill_cmd(&self, token: &Token) {
        if let Some(process) = self.await_registration(token).await {
            process.kill(token);
            if !process.running.load(Ordering::Acquire) {
                self.untrack(token);
            }
        }
    }

    async fn stdin_cmd(&self, token: &Token, line: &str, close: bool) {
        let Some(process) = self.await_registration(token).await else {
            return;
        };
        let mut stdin = process.stdin.lock().await;
        let Some(pipe) = stdin.as_mut() else {
            error!("{} has stdin closed", token);
            return;
        };
        let result = match pipe.write_all(line.as_bytes()).await {
            Ok(()) => pipe.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!("Failed to write stdin of {}: {}", token, e);
        }
        if close {
            // Dropping the pipe delivers EOF to the child.
            *stdin = None;
        }
    }

    /// Waits a bounded time for `token` to show up in the process table.
    ///
    /// A `kill_cmd` or `stdin_cmd` may overtake the `run_cmd` that registers
    /// the process, since each call runs in its own task.
    async fn await_registration(&self, token: &Token) -> Option<Arc<Process>> {
        for _ in 0..REGISTRATION_ATTEMPTS {
            if let Some(process) = self.lookup(token) {
                return Some(process);
            }
            if self.is_finished(token) {
                debug!("{} already finished", token);
                return None;
            }
            tokio::time::sleep(REGISTRATION_INTERVAL).await;
        }
        let process = self.lookup(token);
        if process.is_none() {
            error!("{} never started", token);
        }
        process
    }

    fn is_finished(&self, token: &Token) -> bool {
        self.finished
            .lock()
            .map(|finished| finished.contains(token))
            .unwrap_or(false)
    }

    fn lookup(&self, token: &Token) -> Option<Arc<Process>> {
        self.processes
            .lock()
            .ok()
            .and_then(|processes| processes.get(token).cloned())
    }

    async fn send(&self, call: ControllerCall) {
        if let Err(e) = self.writer.call(call).await {
            warn!("Failed to reach controller {}: {}", self.peer, e);
        }
    }
}

#[async_trait]
impl Dispatch for Supervisor {
    type Call = AgentCall;

    fn dispatch(self: Arc<Self>, call: AgentCall) {
        tokio::spawn(async move { self.handle(call).await });
    }

    async fn on_disconnect(&self) {
        let killed = self.kill_all();
        if killed > 0 {
            info!("Killed {} running processes of {}", killed, self.peer);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn call(self, token: Token, line: String) -> ControllerCall {
        match self {
            Stream::Stdout => ControllerCall::Stdout { token, line },
            Stream::Stderr => ControllerCall::Stderr { token, line },
        }
    }
}

/// Shell convention: death by signal N reports 128 + N.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

fn trim_newline(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

/// Reads into `buf` up to and including the next `\n`, or to EOF.
async fn read_line<B: AsyncRead + Unpin>(
    reader: &mut BufReader<B>,
    buf: &mut Vec<u8>,
) -> std::io::Result<()> {
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if let Some(i) = memchr::memchr(b'\n', available) {
                buf.extend_from_slice(&available[..=i]);
                (true, i + 1)
            } else {
                buf.extend_from_slice(available);
                (false, available.len())
            }
        };
        reader.consume(used);
        if done || used == 0 {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Message, RemoteCall};
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines};

    fn supervisor() -> (Arc<Supervisor>, Lines<BufReader<DuplexStream>>) {
        let (local, remote) = tokio::io::duplex(1 << 16);
        let supervisor = Supervisor::new(
            "test-controller".to_string(),
            RpcWriter::new(local),
            None,
        );
        (supervisor, BufReader::new(remote).lines())
    }

    async fn next_call(lines: &mut Lines<BufReader<DuplexStream>>) -> ControllerCall {
        let line = tokio::time::timeout(Duration::from_secs(10), lines.next_line())
            .await
            .expect("timed out waiting for a call")
            .unwrap()
            .expect("connection closed");
        ControllerCall::from_message(Message::decode(line.as_bytes()).unwrap()).unwrap()
    }

    async fn until_rc(lines: &mut Lines<BufReader<DuplexStream>>) -> (Vec<ControllerCall>, i32) {
        let mut seen = Vec::new();
        loop {
            match next_call(lines).await {
                ControllerCall::Rc { code, .. } => return (seen, code),
                other => seen.push(other),
            }
        }
    }

    /// Zombies count as dead: nobody may be around to reap an orphan.
    pub(crate) fn alive(pid: libc::pid_t) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .map(|rest| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    fn run(token: &str, command: &str) -> AgentCall {
        AgentCall::RunCmd {
            token: Token::from(token),
            command: command.to_string(),
            env: HashMap::new(),
        }
    }

    #[test]
    fn test_exit_code_for_signal_death() {
        let status = ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(exit_code(status), 137);
        let status = ExitStatus::from_raw(3 << 8);
        assert_eq!(exit_code(status), 3);
    }

    #[test]
    fn test_line_buffering_env() {
        let shim = LineBuffering::new("/usr/lib/coreutils/libstdbuf.so");
        let [opt, preload] = shim.env(None);
        assert_eq!(opt, ("_STDBUF_O", "L".to_string()));
        assert_eq!(preload.1, "/usr/lib/coreutils/libstdbuf.so");
        let [_, preload] = shim.env(Some("/opt/libfoo.so"));
        assert_eq!(preload.1, "/opt/libfoo.so:/usr/lib/coreutils/libstdbuf.so");
    }

    #[tokio::test]
    async fn test_run_streams_lines_and_rc() {
        let (supervisor, mut lines) = supervisor();
        Arc::clone(&supervisor).dispatch(run("t1", "echo hello; echo oops >&2; exit 3"));

        let (seen, code) = until_rc(&mut lines).await;
        assert_eq!(code, 3);
        assert!(seen.contains(&ControllerCall::Stdout {
            token: Token::from("t1"),
            line: "hello".to_string()
        }));
        assert!(seen.contains(&ControllerCall::Stderr {
            token: Token::from("t1"),
            line: "oops".to_string()
        }));
        assert!(!supervisor.is_running(&Token::from("t1")));
    }

    #[tokio::test]
    async fn test_env_and_cwd_are_applied() {
        let (supervisor, mut lines) = supervisor();
        let dir = tempfile::tempdir().unwrap();
        supervisor
            .handle(AgentCall::Cd(Some(dir.path().to_string_lossy().into_owned())))
            .await;
        let mut env = HashMap::new();
        env.insert("DISTEXP_VALUE".to_string(), "42".to_string());
        Arc::clone(&supervisor).dispatch(AgentCall::RunCmd {
            token: Token::from("t2"),
            command: "echo $DISTEXP_VALUE; pwd".to_string(),
            env,
        });

        let (seen, code) = until_rc(&mut lines).await;
        assert_eq!(code, 0);
        let stdout: Vec<String> = seen
            .into_iter()
            .filter_map(|call| match call {
                ControllerCall::Stdout { line, .. } => Some(line),
                _ => None,
            })
            .collect();
        assert_eq!(stdout[0], "42");
        let cwd = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(std::fs::canonicalize(&stdout[1]).unwrap(), cwd);
    }

    #[tokio::test]
    async fn test_kill_before_registration_still_kills() {
        let (supervisor, mut lines) = supervisor();
        // The kill is dispatched first and has to wait for the run to register.
        Arc::clone(&supervisor).dispatch(AgentCall::KillCmd {
            token: Token::from("t3"),
        });
        Arc::clone(&supervisor).dispatch(run("t3", "sleep 30"));

        let (_, code) = until_rc(&mut lines).await;
        assert_eq!(code, 137);
    }

    #[tokio::test]
    async fn test_kill_of_unknown_token_gives_up() {
        let (supervisor, _lines) = supervisor();
        let started = std::time::Instant::now();
        supervisor
            .handle(AgentCall::KillCmd {
                token: Token::from("never"),
            })
            .await;
        assert!(started.elapsed() >= REGISTRATION_INTERVAL * (REGISTRATION_ATTEMPTS as u32));
        // Still serving afterwards.
        supervisor.handle(AgentCall::Ping(serde_json::json!(1))).await;
        assert_eq!(supervisor.pings(), 1);
    }

    #[tokio::test]
    async fn test_stdin_for_unknown_token_gives_up() {
        let (supervisor, _lines) = supervisor();
        let started = std::time::Instant::now();
        supervisor
            .handle(AgentCall::StdinCmd {
                token: Token::from("never"),
                line: "hello\n".to_string(),
                close: true,
            })
            .await;
        assert!(started.elapsed() >= REGISTRATION_INTERVAL * (REGISTRATION_ATTEMPTS as u32));
        supervisor.handle(AgentCall::Ping(serde_json::json!(2))).await;
        assert_eq!(supervisor.pings(), 1);
    }

    #[tokio::test]
    async fn test_finished_command_is_untracked() {
        let (supervisor, mut lines) = supervisor();
        Arc::clone(&supervisor).dispatch(run("t7", "true"));
        let (_, code) = until_rc(&mut lines).await;
        assert_eq!(code, 0);
        assert_eq!(supervisor.tracked(), 0);

        // A late kill does not wait for a registration that will never come.
        let started = std::time::Instant::now();
        supervisor
            .handle(AgentCall::KillCmd {
                token: Token::from("t7"),
            })
            .await;
        assert!(started.elapsed() < REGISTRATION_INTERVAL);
    }

    #[tokio::test]
    async fn test_second_kill_is_a_no_op() {
        let (supervisor, mut lines) = supervisor();
        Arc::clone(&supervisor).dispatch(run("t4", "sleep 30"));
        supervisor
            .handle(AgentCall::KillCmd {
                token: Token::from("t4"),
            })
            .await;
        let (_, code) = until_rc(&mut lines).await;
        assert_eq!(code, 137);
        supervisor
            .handle(AgentCall::KillCmd {
                token: Token::from("t4"),
            })
            .await;
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded_and_closed() {
        let (supervisor, mut lines) = supervisor();
        Arc::clone(&supervisor).dispatch(run("t5", "cat"));
        supervisor
            .handle(AgentCall::StdinCmd {
                token: Token::from("t5"),
                line: "ping\n".to_string(),
                close: false,
            })
            .await;
        supervisor
            .handle(AgentCall::StdinCmd {
                token: Token::from("t5"),
                line: "pong\n".to_string(),
                close: true,
            })
            .await;

        let (seen, code) = until_rc(&mut lines).await;
        assert_eq!(code, 0);
        assert_eq!(
            seen,
            vec![
                ControllerCall::Stdout {
                    token: Token::from("t5"),
                    line: "ping".to_string()
                },
                ControllerCall::Stdout {
                    token: Token::from("t5"),
                    line: "pong".to_string()
                },
            ]
        );

        // Writing after close is logged, not fatal.
        supervisor
            .handle(AgentCall::StdinCmd {
                token: Token::from("t5"),
                line: "late\n".to_string(),
                close: false,
            })
            .await;
    }

    #[tokio::test]
    async fn test_disconnect_kills_whole_process_group() {
        let (supervisor, mut lines) = supervisor();
        // The background sleep shares the shell's process group.
        Arc::clone(&supervisor).dispatch(run("t6", "sleep 30 & echo $!; wait"));
        let child_pid: libc::pid_t = match next_call(&mut lines).await {
            ControllerCall::Stdout { line, .. } => line.parse().unwrap(),
            other => panic!("unexpected call {:?}", other),
        };
        assert_eq!(supervisor.running_pids().len(), 1);

        supervisor.on_disconnect().await;

        let (_, code) = until_rc(&mut lines).await;
        assert_eq!(code, 137);
        let mut gone = false;
        for _ in 0..50 {
            if !alive(child_pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(gone, "background child {} survived", child_pid);
        assert!(supervisor.running_pids().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_kills_detached_grandchild() {
        let (supervisor, mut lines) = supervisor();
        // The shell exits right away and leaves the sleep behind in its group.
        Arc::clone(&supervisor).dispatch(run("t8", "sleep 30 >/dev/null 2>&1 & echo $!"));
        let (seen, code) = until_rc(&mut lines).await;
        assert_eq!(code, 0);
        let grandchild: libc::pid_t = match &seen[..] {
            [ControllerCall::Stdout { line, .. }] => line.parse().unwrap(),
            other => panic!("unexpected calls {:?}", other),
        };
        assert!(alive(grandchild));
        assert!(supervisor.running_pids().is_empty());
        assert_eq!(supervisor.tracked(), 1);

        supervisor.on_disconnect().await;

        let mut gone = false;
        for _ in 0..50 {
            if !alive(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(gone, "detached child {} survived", grandchild);
        assert_eq!(supervisor.tracked(), 0);
    }
}
