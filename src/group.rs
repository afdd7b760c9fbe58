//! Ordered, id-unique collections of servers.
//!
//! Every view (`slice`, `select`, `filter`) is a new group sharing the same
//! `Server` objects, so connecting a view connects those servers for every
//! group that contains them.

use std::collections::HashSet;
use std::fmt;
use std::ops::{Bound, Index, RangeBounds};
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use itertools::Itertools;

use crate::controller::RemoteExit;
use crate::error::DistexpError;
use crate::server::Server;

#[derive(Clone, Default)]
pub struct ServerGroup {
    servers: Vec<Arc<Server>>,
    working_directory: Option<String>,
}

impl ServerGroup {
    /// Fails if two servers share an id.
    pub fn new<S: Into<Arc<Server>>>(servers: impl IntoIterator<Item = S>) -> Result<Self, DistexpError> {
        let servers: Vec<Arc<Server>> = servers.into_iter().map(Into::into).collect();
        let mut seen = HashSet::with_capacity(servers.len());
        for server in &servers {
            if !seen.insert(server.id.as_str()) {
                return Err(DistexpError::Config(format!(
                    "server id '{}' appears more than once",
                    server.id
                )));
            }
        }
        Ok(Self {
            servers,
            working_directory: None,
        })
    }

    /// Directory applied with `cd` to every member at connect time.
    pub fn with_working_directory(mut self, directory: impl Into<String>) -> Self {
        self.working_directory = Some(directory.into());
        self
    }

    pub fn working_directory(&self) -> Option<&str> {
        self.working_directory.as_deref()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Server>> {
        self.servers.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Server>> {
        self.servers.get(index)
    }

    pub fn by_id(&self, id: &str) -> Option<&Arc<Server>> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Members in `range`, clamped to the group. The working directory is not
    /// carried over.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> ServerGroup {
        let len = self.servers.len();
        let start = match range.start_bound() {
            Bound::Included(&i) => i,
            Bound::Excluded(&i) => i + 1,
            Bound::Unbounded => 0,
        }
        .min(len);
        let end = match range.end_bound() {
            Bound::Included(&i) => i + 1,
            Bound::Excluded(&i) => i,
            Bound::Unbounded => len,
        }
        .clamp(start, len);
        self.view(self.servers[start..end].to_vec())
    }

    /// The servers with the given ids, in the order given.
    pub fn select(&self, ids: &[&str]) -> Result<ServerGroup, DistexpError> {
        let servers = ids
            .iter()
            .map(|id| {
                self.by_id(id)
                    .cloned()
                    .ok_or_else(|| DistexpError::Config(format!("no server with id '{}'", id)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        ServerGroup::new(servers)
    }

    pub fn filter(&self, predicate: impl Fn(&Server) -> bool) -> ServerGroup {
        self.view(
            self.servers
                .iter()
                .filter(|s| predicate(s))
                .cloned()
                .collect(),
        )
    }

    fn view(&self, servers: Vec<Arc<Server>>) -> ServerGroup {
        ServerGroup {
            servers,
            working_directory: None,
        }
    }

    /// Sets the working directory of every member, concurrently.
    pub async fn cd(&self, directory: Option<&str>) -> Result<(), DistexpError> {
        try_join_all(self.servers.iter().map(|s| s.cd(directory))).await?;
        Ok(())
    }

    pub async fn connect_all(&self) -> Result<(), DistexpError> {
        self.connect_reporting(None).await
    }

    /// Connects every member concurrently, then applies the working
    /// directory. On any failure the members that did connect are
    /// disconnected again.
    pub(crate) async fn connect_reporting(
        &self,
        exits: Option<flume::Sender<RemoteExit>>,
    ) -> Result<(), DistexpError> {
        let connected = try_join_all(
            self.servers
                .iter()
                .map(|s| s.connect_reporting(exits.clone())),
        )
        .await;
        let result = match connected {
            Ok(_) => self.cd(self.working_directory.as_deref()).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.disconnect_all().await;
        }
        result
    }

    pub async fn disconnect_all(&self) {
        join_all(self.servers.iter().map(|s| s.disconnect())).await;
    }
}

impl Index<usize> for ServerGroup {
    type Output = Server;

    fn index(&self, index: usize) -> &Server {
        &self.servers[index]
    }
}

impl Index<&str> for ServerGroup {
    type Output = Server;

    /// Panics if no member has the id, like slice indexing does.
    fn index(&self, id: &str) -> &Server {
        match self.by_id(id) {
            Some(server) => server,
            None => panic!("no server with id '{}'", id),
        }
    }
}

impl<'a> IntoIterator for &'a ServerGroup {
    type Item = &'a Arc<Server>;
    type IntoIter = std::slice::Iter<'a, Arc<Server>>;

    fn into_iter(self) -> Self::IntoIter {
        self.servers.iter()
    }
}

impl fmt::Display for ServerGroup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.servers.iter().map(|s| s.id.as_str()).join(", "))
    }
}

impl fmt::Debug for ServerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerGroup")
            .field("servers", &self.servers)
            .field("working_directory", &self.working_directory)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::DEFAULT_PORT;

    fn group() -> ServerGroup {
        ServerGroup::new(
            ["node01", "node02", "node03", "node04"]
                .iter()
                .map(|id| Server::new(*id, "127.0.0.1", DEFAULT_PORT)),
        )
        .unwrap()
        .with_working_directory("/tmp")
    }

    fn ids(group: &ServerGroup) -> Vec<&str> {
        group.iter().map(|s| s.id.as_str()).collect()
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let servers = vec![
            Server::new("a", "h1", DEFAULT_PORT),
            Server::new("a", "h2", DEFAULT_PORT),
        ];
        assert!(matches!(ServerGroup::new(servers), Err(DistexpError::Config(_))));
    }

    #[test]
    fn test_indexing() {
        let group = group();
        assert_eq!(group[1].id, "node02");
        assert_eq!(group["node04"].id, "node04");
        assert!(group.by_id("node09").is_none());
        assert!(group.get(4).is_none());
    }

    #[test]
    #[should_panic(expected = "no server with id")]
    fn test_index_by_unknown_id_panics() {
        let group = group();
        let _ = &group["missing"];
    }

    #[test]
    fn test_views_share_servers() {
        let group = group();
        let head = group.slice(..2);
        assert_eq!(ids(&head), vec!["node01", "node02"]);
        assert_eq!(head.working_directory(), None);
        assert!(Arc::ptr_eq(&head.servers[0], &group.servers[0]));

        assert_eq!(ids(&group.slice(2..)), vec!["node03", "node04"]);
        assert_eq!(ids(&group.slice(3..10)), vec!["node04"]);
        assert!(group.slice(5..).is_empty());

        let odd = group.filter(|s| s.id.ends_with('1') || s.id.ends_with('3'));
        assert_eq!(ids(&odd), vec!["node01", "node03"]);

        let picked = group.select(&["node03", "node01"]).unwrap();
        assert_eq!(ids(&picked), vec!["node03", "node01"]);
        assert!(group.select(&["node01", "node01"]).is_err());
        assert!(group.select(&["nope"]).is_err());
    }

    #[test]
    fn test_display_lists_ids() {
        assert_eq!(group().to_string(), "node01, node02, node03, node04");
    }
}
