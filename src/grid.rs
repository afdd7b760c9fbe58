//! Parameter grids.
//!
//! A grid is an ordered list of named parameters. Plain parameters list their
//! values; computed parameters derive theirs from parameters declared before
//! them. Expansion is the cartesian product in declaration order.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::DistexpError;

/// One bound parameter set, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Vec<(String, Value)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Looks up `name` and converts it to `T`.
    pub fn value<T: DeserializeOwned>(&self, name: &str) -> Result<T, DistexpError> {
        let value = self
            .get(name)
            .ok_or_else(|| DistexpError::Grid(format!("parameter '{}' is not bound", name)))?;
        serde_json::from_value(value.clone())
            .map_err(|e| DistexpError::Grid(format!("parameter '{}': {}", name, e)))
    }

    /// Binds `name`, replacing an earlier value in place.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// `key=value` pairs joined by `_`, in declaration order.
    pub fn suffix(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{}={}", k, s),
                other => format!("{}={}", k, other),
            })
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Only the parameters named in `names`.
    fn subset(&self, names: &[String]) -> Params {
        Params(
            self.0
                .iter()
                .filter(|(k, _)| names.contains(k))
                .cloned()
                .collect(),
        )
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.suffix())
    }
}

/// Serializes as a map with sorted keys, regardless of binding order.
impl Serialize for Params {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let sorted: BTreeMap<&str, &Value> = self.iter().collect();
        sorted.serialize(serializer)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

type ComputeFn = Box<dyn Fn(&Params) -> Value + Send + Sync>;

enum Source {
    Values(Vec<Value>),
    Computed { args: Vec<String>, compute: ComputeFn },
}

#[derive(Default)]
pub struct ParameterGrid {
    entries: Vec<(String, Source)>,
}

impl ParameterGrid {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a parameter taking each of `values`. An empty list is skipped
    /// during expansion instead of emptying the grid.
    pub fn param<V: Into<Value>>(mut self, name: &str, values: impl IntoIterator<Item = V>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.entries.push((name.to_string(), Source::Values(values)));
        self
    }

    /// Declares a parameter computed from the earlier parameters in `args`.
    ///
    /// `compute` sees only those parameters. A JSON array result branches
    /// over its elements; an empty array leaves the parameter unbound; any
    /// other value is a single choice.
    pub fn computed<F, R>(mut self, name: &str, args: &[&str], compute: F) -> Self
    where
        F: Fn(&Params) -> R + Send + Sync + 'static,
        R: Into<Value>,
    {
        let compute: ComputeFn = Box::new(move |params| compute(params).into());
        self.entries.push((
            name.to_string(),
            Source::Computed {
                args: args.iter().map(|a| a.to_string()).collect(),
                compute,
            },
        ));
        self
    }

    fn validate(&self) -> Result<(), DistexpError> {
        for (i, (name, source)) in self.entries.iter().enumerate() {
            let earlier = &self.entries[..i];
            if earlier.iter().any(|(n, _)| n == name) {
                return Err(DistexpError::Grid(format!(
                    "parameter '{}' is declared twice",
                    name
                )));
            }
            if let Source::Computed { args, .. } = source {
                for arg in args {
                    if !earlier.iter().any(|(n, _)| n == arg) {
                        return Err(DistexpError::Grid(format!(
                            "computed parameter '{}' depends on '{}', which is not declared before it",
                            name, arg
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Every parameter set of the grid, in declaration order.
    pub fn expand(&self) -> Result<Vec<Params>, DistexpError> {
        self.validate()?;
        let mut partials = vec![Params::new()];
        for (name, source) in &self.entries {
            partials = match source {
                Source::Values(values) if values.is_empty() => continue,
                Source::Values(values) => {
                    let mut next = Vec::with_capacity(partials.len() * values.len());
                    for partial in partials {
                        for value in values {
                            let mut params = partial.clone();
                            params.insert(name.as_str(), value.clone());
                            next.push(params);
                        }
                    }
                    next
                }
                Source::Computed { args, compute } => {
                    let mut next = Vec::with_capacity(partials.len());
                    for partial in partials {
                        let values = match compute(&partial.subset(args)) {
                            Value::Array(values) => values,
                            value => vec![value],
                        };
                        if values.is_empty() {
                            next.push(partial);
                            continue;
                        }
                        for value in values {
                            let mut params = partial.clone();
                            params.insert(name.as_str(), value);
                            next.push(params);
                        }
                    }
                    next
                }
            };
        }
        Ok(partials)
    }
}
