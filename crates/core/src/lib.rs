use serde::{Serialize, Deserialize};
use serde_json::Value as Json;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use petgraph::algo::toposort;

/// Logical id of a declaration inside a stack (CloudFormation rules: ASCII alphanumerics only).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LogicalId(String);

impl LogicalId {
    pub fn new(id: impl Into<String>) -> Result<Self, GraphError> {
        let id = id.into();
        if id.is_empty() || id.len() > 255 || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(GraphError::InvalidLogicalId(id));
        }
        Ok(Self(id))
    }

    /// Id of a construct nested under this one, e.g. `SecureResources` + `GitHubOIDCRole`.
    pub fn child(&self, name: &str) -> Result<Self, GraphError> {
        Self::new(format!("{}{}", self.0, name))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl TryFrom<String> for LogicalId {
    type Error = GraphError;
    fn try_from(s: String) -> Result<Self, Self::Error> { Self::new(s) }
}

impl From<LogicalId> for String {
    fn from(id: LogicalId) -> Self { id.0 }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle detected at {0}")]
    Cycle(LogicalId),
    #[error("duplicate logical id {0}")]
    DuplicateId(LogicalId),
    #[error("{from} depends on unknown resource {to}")]
    UnknownDependency { from: LogicalId, to: LogicalId },
    #[error("invalid logical id '{0}': use 1-255 ASCII letters and digits")]
    InvalidLogicalId(String),
}

/// A declared cloud resource. Rendering is pure: the same declaration always yields the same JSON.
pub trait Resource: fmt::Debug + Send + Sync {
    fn id(&self) -> &LogicalId;
    fn deps(&self) -> BTreeSet<LogicalId> { BTreeSet::new() }
    /// CloudFormation type, e.g. `AWS::S3::Bucket`.
    fn cfn_type(&self) -> &'static str;
    fn cfn_properties(&self) -> Json;
    /// Terraform JSON fragment (`{"resource": {...}}`), merged by the caller.
    fn tf_json(&self) -> Json;
}

/// A named value published once the stack is deployed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub id: LogicalId,
    pub value: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Ambient deployment context, passed explicitly into every provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackContext {
    pub stack_name: String,
    pub account: String,
    pub region: String,
    #[serde(default)]
    pub partition: Option<String>,
}

impl StackContext {
    pub fn new(stack_name: impl Into<String>, account: impl Into<String>, region: impl Into<String>) -> Self {
        Self { stack_name: stack_name.into(), account: account.into(), region: region.into(), partition: None }
    }

    /// Explicit partition, or the one implied by the region.
    pub fn partition(&self) -> &str {
        if let Some(p) = &self.partition { return p; }
        if self.region.starts_with("cn-") { "aws-cn" }
        else if self.region.starts_with("us-gov-") { "aws-us-gov" }
        else { "aws" }
    }

    /// ARN of a global IAM entity in this account, e.g. `role/name`.
    pub fn iam_arn(&self, resource: &str) -> String {
        format!("arn:{}:iam::{}:{}", self.partition(), self.account, resource)
    }

    /// S3 ARNs carry neither region nor account.
    pub fn s3_arn(&self, resource: &str) -> String {
        format!("arn:{}:s3:::{}", self.partition(), resource)
    }

    pub fn account_is_valid(&self) -> bool {
        self.account.len() == 12 && self.account.chars().all(|c| c.is_ascii_digit())
    }
}

#[derive(Debug, Default)]
pub struct ResourceGraph {
    resources: Vec<Box<dyn Resource>>,
    outputs: Vec<Output>,
}

impl ResourceGraph {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, r: impl Resource + 'static) -> Result<(), GraphError> {
        if self.get(r.id()).is_some() {
            return Err(GraphError::DuplicateId(r.id().clone()));
        }
        self.resources.push(Box::new(r));
        Ok(())
    }

    pub fn add_output(&mut self, out: Output) -> Result<(), GraphError> {
        if self.outputs.iter().any(|o| o.id == out.id) {
            return Err(GraphError::DuplicateId(out.id));
        }
        self.outputs.push(out);
        Ok(())
    }

    pub fn get(&self, id: &LogicalId) -> Option<&dyn Resource> {
        self.resources.iter().find(|r| r.id() == id).map(|r| r.as_ref())
    }

    pub fn resources(&self) -> impl Iterator<Item = &dyn Resource> {
        self.resources.iter().map(|r| r.as_ref())
    }

    pub fn outputs(&self) -> &[Output] { &self.outputs }

    pub fn len(&self) -> usize { self.resources.len() }

    pub fn is_empty(&self) -> bool { self.resources.is_empty() && self.outputs.is_empty() }

    /// Moves every declaration of `other` into `self`. Nothing is moved if any id collides.
    pub fn merge(&mut self, other: ResourceGraph) -> Result<(), GraphError> {
        for r in &other.resources {
            if self.get(r.id()).is_some() {
                return Err(GraphError::DuplicateId(r.id().clone()));
            }
        }
        for o in &other.outputs {
            if self.outputs.iter().any(|x| x.id == o.id) {
                return Err(GraphError::DuplicateId(o.id.clone()));
            }
        }
        self.resources.extend(other.resources);
        self.outputs.extend(other.outputs);
        Ok(())
    }

    /// Resources in dependency order; independent resources keep declaration order.
    pub fn ordered(&self) -> Result<Vec<&dyn Resource>, GraphError> {
        let mut g: DiGraph<usize, ()> = DiGraph::new();
        let mut id_to_ix = HashMap::new();
        for (i, r) in self.resources.iter().enumerate() {
            let ix = g.add_node(i);
            id_to_ix.insert(r.id().clone(), ix);
        }
        for r in &self.resources {
            let to_ix = id_to_ix[r.id()];
            for d in r.deps() {
                let from_ix = *id_to_ix.get(&d).ok_or_else(|| GraphError::UnknownDependency {
                    from: r.id().clone(),
                    to: d.clone(),
                })?;
                g.add_edge(from_ix, to_ix, ());
            }
        }
        toposort(&g, None)
            .map_err(|c| GraphError::Cycle(self.resources[g[c.node_id()]].id().clone()))?;

        // Acyclic: emit the earliest-declared ready node first.
        let mut pending: Vec<usize> = g.node_indices()
            .map(|ix| g.neighbors_directed(ix, Direction::Incoming).count())
            .collect();
        let mut ready: BTreeSet<usize> = (0..pending.len()).filter(|&i| pending[i] == 0).collect();
        let mut out = Vec::with_capacity(self.resources.len());
        while let Some(i) = ready.pop_first() {
            out.push(self.resources[i].as_ref());
            for next in g.neighbors_directed(NodeIndex::new(i), Direction::Outgoing) {
                pending[next.index()] -= 1;
                if pending[next.index()] == 0 { ready.insert(next.index()); }
            }
        }
        Ok(out)
    }
}
