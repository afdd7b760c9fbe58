//! Experiment registrations.
//!
//! A `Registry` is built once by the controller program and handed to the
//! scheduler, which reads it in declaration order.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DistexpError;
use crate::grid::{ParameterGrid, Params};
use crate::group::ServerGroup;

/// What the scheduler should do after an experiment returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    Continue,
    /// Run the same experiment again with the same parameters.
    Restart,
}

#[async_trait]
pub trait Experiment: Send + Sync + 'static {
    async fn run(&self, servers: ServerGroup, params: Params) -> Result<Action, DistexpError>;
}

/// Adapts an async function or closure to [`Experiment`].
pub struct FnExperiment<F>(pub F);

#[async_trait]
impl<F, Fut> Experiment for FnExperiment<F>
where
    F: Fn(ServerGroup, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Action, DistexpError>> + Send + 'static,
{
    async fn run(&self, servers: ServerGroup, params: Params) -> Result<Action, DistexpError> {
        (self.0)(servers, params).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunPolicy {
    /// Maximum number of attempts. 0 means unlimited.
    pub max_restarts: usize,
    /// Whether a nonzero exit of any command halts the whole batch.
    pub raise_on_rc: bool,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 0,
            raise_on_rc: true,
        }
    }
}

impl RunPolicy {
    pub fn max_restarts(mut self, max_restarts: usize) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn raise_on_rc(mut self, raise_on_rc: bool) -> Self {
        self.raise_on_rc = raise_on_rc;
        self
    }
}

#[derive(Clone)]
pub struct Registration {
    /// Unique display name, the function name plus the grid suffix.
    pub name: String,
    /// The function name as declared. Checkpoints are keyed on this.
    pub function: String,
    pub servers: ServerGroup,
    pub experiment: Arc<dyn Experiment>,
    pub params: Params,
    pub policy: RunPolicy,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("servers", &self.servers.to_string())
            .field("params", &self.params)
            .field("policy", &self.policy)
            .finish()
    }
}

#[derive(Default, Clone)]
pub struct Registry {
    registrations: Vec<Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one run of `experiment` with no parameters.
    pub fn register(
        &mut self,
        name: &str,
        servers: &ServerGroup,
        policy: RunPolicy,
        experiment: impl Experiment,
    ) {
        self.registrations.push(Registration {
            name: name.to_string(),
            function: name.to_string(),
            servers: servers.clone(),
            experiment: Arc::new(experiment),
            params: Params::new(),
            policy,
        });
    }

    /// Registers one run per parameter set of `grid`, named
    /// `<name>_<key>=<value>_...`.
    pub fn register_grid(
        &mut self,
        name: &str,
        servers: &ServerGroup,
        grid: &ParameterGrid,
        policy: RunPolicy,
        experiment: impl Experiment,
    ) -> Result<usize, DistexpError> {
        let experiment: Arc<dyn Experiment> = Arc::new(experiment);
        let expanded = grid.expand()?;
        let count = expanded.len();
        for params in expanded {
            let suffix = params.suffix();
            let full_name = if suffix.is_empty() {
                name.to_string()
            } else {
                format!("{}_{}", name, suffix)
            };
            self.registrations.push(Registration {
                name: full_name,
                function: name.to_string(),
                servers: servers.clone(),
                experiment: Arc::clone(&experiment),
                params,
                policy,
            });
        }
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.registrations.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.registrations.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn noop(_: ServerGroup, _: Params) -> Result<Action, DistexpError> {
        Ok(Action::Continue)
    }

    #[test]
    fn test_grid_names() {
        let mut registry = Registry::new();
        let servers = ServerGroup::default();
        let grid = ParameterGrid::new().param("x", [1, 2]).param("y", [10]);
        let count = registry
            .register_grid("f", &servers, &grid, RunPolicy::default(), FnExperiment(noop))
            .unwrap();
        registry.register("cleanup", &servers, RunPolicy::default(), FnExperiment(noop));

        assert_eq!(count, 2);
        assert_eq!(registry.names(), vec!["f_x=1_y=10", "f_x=2_y=10", "cleanup"]);
        assert!(registry.iter().take(2).all(|r| r.function == "f"));
    }

    #[tokio::test]
    async fn test_closures_are_experiments() {
        let experiment = FnExperiment(|_servers: ServerGroup, params: Params| async move {
            match params.get("restart") {
                Some(_) => Ok::<_, DistexpError>(Action::Restart),
                None => Ok(Action::Continue),
            }
        });
        let params: Params = vec![("restart", true)].into_iter().collect();
        assert_eq!(
            experiment.run(ServerGroup::default(), params).await.unwrap(),
            Action::Restart
        );
        assert_eq!(
            experiment
                .run(ServerGroup::default(), Params::new())
                .await
                .unwrap(),
            Action::Continue
        );
    }
}
