//! The agent's TCP listener.
//!
//! Every accepted controller connection gets its own [`Supervisor`]. The
//! agent exits on request or after being idle for too long, and kills every
//! process group still tracked by any connection on the way out.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, info, warn};

use crate::error::DistexpError;
use crate::rpc::{read_loop, ControllerCall, RpcWriter};
use crate::supervisor::{LineBuffering, Supervisor};

/// How often the idle limit is checked.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub struct Agent {
    listener: TcpListener,
    line_buffering: Option<LineBuffering>,
    idle_limit: Option<Duration>,
    supervisors: Mutex<Vec<Weak<Supervisor>>>,
    connections: Arc<AtomicUsize>,
}

impl Agent {
    pub async fn bind(address: impl ToSocketAddrs) -> Result<Self, DistexpError> {
        Ok(Self {
            listener: TcpListener::bind(address).await?,
            line_buffering: None,
            idle_limit: None,
            supervisors: Mutex::new(Vec::new()),
            connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Exit after this long without any controller connection.
    pub fn with_idle_limit(mut self, idle_limit: Option<Duration>) -> Self {
        self.idle_limit = idle_limit;
        self
    }

    pub fn with_line_buffering(mut self, line_buffering: Option<LineBuffering>) -> Self {
        self.line_buffering = line_buffering;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DistexpError> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of open controller connections.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    /// Accepts controllers until `shutdown` resolves or the idle limit passes.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<(), DistexpError> {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(IDLE_CHECK_INTERVAL);
        let mut idle_since = Instant::now();
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                _ = ticker.tick() => {
                    if self.connections() > 0 {
                        idle_since = Instant::now();
                    } else if let Some(limit) = self.idle_limit {
                        if idle_since.elapsed() >= limit {
                            info!("No controller connected for {:?}, exiting", limit);
                            break;
                        }
                    }
                }
            }
        }
        let killed = self.kill_all();
        if killed > 0 {
            info!("Killed {} process group(s) on shutdown", killed);
        }
        Ok(())
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        let (read_half, write_half) = stream.into_split();
        let writer = RpcWriter::<ControllerCall>::new(write_half);
        let supervisor = Supervisor::new(peer.to_string(), writer.clone(), self.line_buffering.clone());
        if let Ok(mut supervisors) = self.supervisors.lock() {
            supervisors.retain(|s| s.strong_count() > 0);
            supervisors.push(Arc::downgrade(&supervisor));
        }

        let connections = Arc::clone(&self.connections);
        connections.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(async move {
            read_loop(read_half, writer, supervisor, peer.to_string()).await;
            connections.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Kills every process group still tracked by any connection.
    pub fn kill_all(&self) -> usize {
        let supervisors: Vec<Arc<Supervisor>> = match self.supervisors.lock() {
            Ok(supervisors) => supervisors.iter().filter_map(Weak::upgrade).collect(),
            Err(_) => return 0,
        };
        supervisors.iter().map(|s| s.kill_all()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_idle_agent_exits() {
        let agent = Agent::bind("127.0.0.1:0")
            .await
            .unwrap()
            .with_idle_limit(Some(Duration::from_millis(10)));
        let served = tokio::time::timeout(
            Duration::from_secs(5),
            agent.serve(std::future::pending()),
        )
        .await;
        assert!(matches!(served, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_shutdown_future_stops_agent() {
        let agent = Agent::bind("127.0.0.1:0").await.unwrap();
        let address = agent.local_addr().unwrap();
        assert_ne!(address.port(), 0);
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(agent.serve(async move {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
