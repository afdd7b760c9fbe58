//! Agent endpoints.
//!
//! A `Server` is configured once, long before any network I/O, and then
//! connected and disconnected by the scheduler around every experiment. While
//! connected it owns one TCP connection to the agent and the read loop task
//! serving that connection.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use colored::{ColoredString, Colorize};
use colourado::{ColorPalette, PaletteType};
use handlebars::Handlebars;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use void::Void;

use crate::controller::{CommandState, ControllerHandler, RemoteExit};
use crate::error::DistexpError;
use crate::grid::Params;
use crate::group::ServerGroup;
use crate::handle::{RcCell, RemoteProcess};
use crate::output::{Console, OutputHandler};
use crate::rpc::{read_loop, AgentCall, RpcWriter, Token};
use crate::serde::hostname_or_mapping;

pub const DEFAULT_PORT: u16 = 20000;

/// How long `disconnect` waits for the agent to close its side.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Names that attributes may not shadow.
const BUILTIN_FIELDS: [&str; 3] = ["id", "ip", "port"];

struct Connection {
    writer: RpcWriter<AgentCall>,
    handler: Arc<ControllerHandler>,
    reader: JoinHandle<()>,
}

pub struct Server {
    pub id: String,
    pub ip: String,
    pub port: u16,
    attributes: BTreeMap<String, Value>,
    color: (u8, u8, u8),
    connection: Mutex<Option<Connection>>,
    pings: AtomicU64,
}

impl Server {
    pub fn new(id: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
            port,
            attributes: BTreeMap::new(),
            color: (255, 255, 255),
            connection: Mutex::new(None),
            pings: AtomicU64::new(0),
        }
    }

    /// Attaches a named attribute, available to templates and to experiments.
    pub fn attribute(mut self, name: &str, value: impl Into<Value>) -> Result<Self, DistexpError> {
        if name.starts_with('_') {
            return Err(DistexpError::Config(format!(
                "{}: attribute '{}' starts with '_'",
                self.id, name
            )));
        }
        if BUILTIN_FIELDS.contains(&name) || self.attributes.contains_key(name) {
            return Err(DistexpError::Config(format!(
                "{}: attribute '{}' already exists",
                self.id, name
            )));
        }
        self.attributes.insert(name.to_string(), value.into());
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    pub fn with_color(mut self, color: (u8, u8, u8)) -> Self {
        self.color = color;
        self
    }

    /// For pretty-printing the server id.
    /// Surrounds with brackets and colors it with the server's color.
    pub fn prettify(&self) -> ColoredString {
        let (r, g, b) = self.color;
        format!("{}", self).truecolor(r, g, b)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .map(|c| c.is_some())
            .unwrap_or(false)
    }

    pub async fn connect(&self) -> Result<(), DistexpError> {
        self.connect_reporting(None).await
    }

    /// Connects and reports every nonzero exit on this connection to `exits`.
    pub(crate) async fn connect_reporting(
        &self,
        exits: Option<flume::Sender<RemoteExit>>,
    ) -> Result<(), DistexpError> {
        let address = self.address();
        let stream =
            TcpStream::connect(&address)
                .await
                .map_err(|source| DistexpError::Connection {
                    server: self.id.clone(),
                    address: address.clone(),
                    source,
                })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("{}: failed to set TCP_NODELAY: {}", self.id, e);
        }
        let (read_half, write_half) = stream.into_split();
        let writer = RpcWriter::<AgentCall>::new(write_half);
        let handler = Arc::new(ControllerHandler::new(self.id.clone(), exits));
        let reader = tokio::spawn(read_loop(
            read_half,
            writer.clone(),
            Arc::clone(&handler),
            self.id.clone(),
        ));

        let previous = self.connection.lock().ok().and_then(|mut c| {
            c.replace(Connection {
                writer,
                handler,
                reader,
            })
        });
        if let Some(previous) = previous {
            warn!("{} Replacing an open connection", self.prettify());
            previous.writer.close().await;
        }
        info!("{} Connected to agent at {}", self.prettify(), address);
        Ok(())
    }

    /// Closes the connection and waits for the agent to hang up.
    ///
    /// Commands still running on the agent are killed by its disconnect hook.
    pub async fn disconnect(&self) {
        let connection = self.connection.lock().ok().and_then(|mut c| c.take());
        let Some(connection) = connection else {
            return;
        };
        connection.writer.close().await;
        let mut reader = connection.reader;
        if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            warn!("{} Agent did not hang up, dropping connection", self.prettify());
            reader.abort();
        }
        info!("{} Disconnected", self.prettify());
    }

    fn connection(&self) -> Result<(RpcWriter<AgentCall>, Arc<ControllerHandler>), DistexpError> {
        self.connection
            .lock()
            .ok()
            .and_then(|c| {
                c.as_ref()
                    .map(|c| (c.writer.clone(), Arc::clone(&c.handler)))
            })
            .ok_or_else(|| DistexpError::NotConnected(self.id.clone()))
    }

    /// Sets the working directory for commands started after this call.
    /// `None` restores the agent's own directory.
    pub async fn cd(&self, directory: Option<&str>) -> Result<(), DistexpError> {
        let (writer, _) = self.connection()?;
        writer
            .call(AgentCall::Cd(directory.map(str::to_string)))
            .await?;
        Ok(())
    }

    /// Sends a heartbeat and waits up to `timeout` for the answer.
    /// Returns the round-trip time.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, DistexpError> {
        let (writer, handler) = self.connection()?;
        let nonce = self.pings.fetch_add(1, Ordering::Relaxed);
        let pong = handler.pong_notified();
        let started = Instant::now();
        if !writer.call(AgentCall::Ping(Value::from(nonce))).await? {
            return Err(DistexpError::NotConnected(self.id.clone()));
        }
        tokio::time::timeout(timeout, pong)
            .await
            .map_err(|_| DistexpError::Timeout {
                server: self.id.clone(),
                command: "ping".to_string(),
            })?;
        debug!(
            "{}: pong {:?} after {:?}",
            self.id,
            handler.last_pong(),
            started.elapsed()
        );
        Ok(started.elapsed())
    }

    /// Starts building a command to run on this server.
    pub fn command(&self, command: impl Into<String>) -> CommandBuilder<'_> {
        CommandBuilder {
            server: self,
            command: command.into(),
            env: HashMap::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            timeout: None,
        }
    }

    /// Runs `command` with no output handlers and no timeout.
    pub async fn run_cmd(&self, command: impl Into<String>) -> Result<RemoteProcess, DistexpError> {
        self.command(command).spawn().await
    }

    /// Fills a handlebars template with this server's fields and `params`.
    ///
    /// Parameters take precedence over attributes of the same name. Unknown
    /// names are an error.
    pub fn render(&self, template: &str, params: &Params) -> Result<String, DistexpError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        handlebars_misc_helpers::register(&mut registry);

        let mut context = Map::new();
        context.insert("id".to_string(), Value::from(self.id.as_str()));
        context.insert("ip".to_string(), Value::from(self.ip.as_str()));
        context.insert("port".to_string(), Value::from(self.port));
        for (name, value) in self.attributes.iter() {
            context.insert(name.clone(), value.clone());
        }
        for (name, value) in params.iter() {
            context.insert(name.to_string(), value.clone());
        }
        Ok(registry.render_template(template, &Value::Object(context))?)
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self.id)
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("attributes", &self.attributes)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Options for one `run_cmd`. Consumed by [`CommandBuilder::spawn`].
pub struct CommandBuilder<'a> {
    server: &'a Server,
    command: String,
    env: HashMap<String, String>,
    stdout: Vec<Box<dyn OutputHandler>>,
    stderr: Vec<Box<dyn OutputHandler>>,
    timeout: Option<Duration>,
}

impl<'a> CommandBuilder<'a> {
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    pub fn stdout(mut self, handler: impl OutputHandler) -> Self {
        self.stdout.push(Box::new(handler));
        self
    }

    pub fn stderr(mut self, handler: impl OutputHandler) -> Self {
        self.stderr.push(Box::new(handler));
        self
    }

    /// Prints both streams to the terminal behind the server's prefix.
    pub fn echo(self) -> Self {
        let prefix = self.server.prettify();
        self.stdout(Console::new(prefix.clone()))
            .stderr(Console::new(prefix))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sends `run_cmd` and returns a handle to the remote process.
    ///
    /// Output handlers are installed before the request leaves, so no line
    /// can arrive ahead of them.
    pub async fn spawn(self) -> Result<RemoteProcess, DistexpError> {
        let server = self.server;
        let (writer, handler) = server.connection()?;
        let token = Token::new();
        let rc = RcCell::new();
        handler.register(
            token.clone(),
            CommandState {
                command: self.command.clone(),
                rc: rc.clone(),
                stdout: self.stdout,
                stderr: self.stderr,
            },
        );

        let sent = writer
            .call(AgentCall::RunCmd {
                token: token.clone(),
                command: self.command.clone(),
                env: self.env,
            })
            .await;
        match sent {
            Ok(true) => {}
            Ok(false) => {
                handler.forget(&token);
                return Err(DistexpError::NotConnected(server.id.clone()));
            }
            Err(e) => {
                handler.forget(&token);
                return Err(e);
            }
        }
        info!("{}: {:?} uuid={}", server.id, self.command, token);

        let process = RemoteProcess::new(server.id.clone(), self.command, token, rc, writer);
        if let Some(timeout) = self.timeout {
            process.arm_timeout(timeout);
        }
        Ok(process)
    }
}

#[derive(Debug, Deserialize)]
struct ServerSpec(#[serde(deserialize_with = "hostname_or_mapping")] ServerSpecInner);

#[derive(Debug, Deserialize)]
struct ServerSpecInner {
    id: Option<String>,
    ip: String,
    port: Option<u16>,
    #[serde(flatten)]
    attributes: BTreeMap<String, Value>,
}

impl FromStr for ServerSpecInner {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self {
            id: None,
            ip: s.to_string(),
            port: None,
            attributes: BTreeMap::new(),
        })
    }
}

impl ServerSpecInner {
    fn into_server(self) -> Result<Server, DistexpError> {
        let id = self.id.unwrap_or_else(|| self.ip.clone());
        let mut server = Server::new(id, self.ip, self.port.unwrap_or(DEFAULT_PORT));
        for (name, value) in self.attributes {
            server = server.attribute(&name, value)?;
        }
        Ok(server)
    }
}

/// Parses a servers file: a YAML list whose entries are either a bare
/// hostname or a mapping with `id`, `ip`, optional `port` and attributes.
pub fn parse_servers(yaml: &str) -> Result<ServerGroup, DistexpError> {
    let specs: Vec<ServerSpec> = serde_yaml::from_str(yaml)?;
    build_group(specs)
}

pub fn load_servers(path: impl AsRef<Path>) -> Result<ServerGroup, DistexpError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| {
        DistexpError::Config(format!("Failed to open {}: {}", path.display(), e))
    })?;
    let specs: Vec<ServerSpec> = serde_yaml::from_reader(file)?;
    let group = build_group(specs)?;
    info!("Servers loaded from {}: {}", path.display(), group);
    Ok(group)
}

fn build_group(specs: Vec<ServerSpec>) -> Result<ServerGroup, DistexpError> {
    let colors = ColorPalette::new(specs.len() as u32, PaletteType::Pastel, false).colors;
    let mut servers = Vec::with_capacity(specs.len());
    for (color, ServerSpec(spec)) in colors.into_iter().zip(specs) {
        let rgb = (
            (color.red * 255.0) as u8,
            (color.green * 255.0) as u8,
            (color.blue * 255.0) as u8,
        );
        servers.push(spec.into_server()?.with_color(rgb));
    }
    ServerGroup::new(servers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_rules() {
        let server = Server::new("node01", "10.0.0.1", DEFAULT_PORT)
            .attribute("numa_nodes", 2)
            .unwrap();
        assert_eq!(server.get("numa_nodes"), Some(&Value::from(2)));

        let err = Server::new("n", "h", 1).attribute("_secret", 1).unwrap_err();
        assert!(matches!(err, DistexpError::Config(_)));
        let err = Server::new("n", "h", 1).attribute("ip", "x").unwrap_err();
        assert!(matches!(err, DistexpError::Config(_)));
        let err = server.attribute("numa_nodes", 4).unwrap_err();
        assert!(matches!(err, DistexpError::Config(_)));
    }

    #[test]
    fn test_parse_servers_file() {
        let yaml = r#"
- node01
- id: node02
  ip: 10.0.0.2
  port: 20001
  ib_ip: 192.168.0.2
  numa: 2
"#;
        let group = parse_servers(yaml).unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group[0].id, "node01");
        assert_eq!(group[0].ip, "node01");
        assert_eq!(group[0].port, DEFAULT_PORT);
        let node02 = &group["node02"];
        assert_eq!(node02.port, 20001);
        assert_eq!(node02.get("ib_ip"), Some(&Value::from("192.168.0.2")));
        assert_eq!(node02.get("numa"), Some(&Value::from(2)));
    }

    #[test]
    fn test_parse_servers_rejects_duplicates_and_private_keys() {
        assert!(matches!(
            parse_servers("- node01\n- node01\n"),
            Err(DistexpError::Config(_))
        ));
        assert!(matches!(
            parse_servers("- id: a\n  ip: h\n  _x: 1\n"),
            Err(DistexpError::Config(_))
        ));
    }

    #[test]
    fn test_parse_servers_rejects_blank_hostname() {
        assert!(matches!(
            parse_servers("- node01\n- \"  \"\n"),
            Err(DistexpError::Yaml(_))
        ));
        let group = parse_servers("- \" node03 \"\n").unwrap();
        assert_eq!(group[0].ip, "node03");
    }

    #[test]
    fn test_render_template() {
        let server = Server::new("node02", "10.0.0.2", DEFAULT_PORT)
            .attribute("ib_ip", "192.168.0.2")
            .unwrap();
        let params: Params = vec![("threads".to_string(), Value::from(8))]
            .into_iter()
            .collect();
        let command = server
            .render("./bench --id {{id}} --bind {{ib_ip}} -t {{threads}}", &params)
            .unwrap();
        assert_eq!(command, "./bench --id node02 --bind 192.168.0.2 -t 8");

        let err = server.render("{{missing}}", &params).unwrap_err();
        assert!(matches!(err, DistexpError::Template(_)));
    }

    #[tokio::test]
    async fn test_commands_need_a_connection() {
        let server = Server::new("node01", "127.0.0.1", DEFAULT_PORT);
        assert!(!server.is_connected());
        let err = server.run_cmd("true").await.unwrap_err();
        assert!(matches!(err, DistexpError::NotConnected(_)));
        server.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_failure_names_the_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let server = Server::new("gone", "127.0.0.1", port);
        match server.connect().await {
            Err(DistexpError::Connection { server, .. }) => assert_eq!(server, "gone"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
