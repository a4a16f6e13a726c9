//! Resource dependency graph
//!
//! The graph itself is supplied from outside (configuration or a JSON file).
//! The orchestrator only needs prerequisite and dependent lookups and a
//! guarantee that the gates it builds cannot wait on each other forever.

use apipub_common::{PublisherError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Resource -> resources that must be processed before it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    prerequisites: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new(prerequisites: BTreeMap<String, Vec<String>>) -> Self {
        Self { prerequisites }
    }

    pub fn prerequisites_of(&self, resource: &str) -> &[String] {
        self.prerequisites
            .get(resource)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Resources that list `resource` as a prerequisite.
    pub fn dependents_of(&self, resource: &str) -> Vec<String> {
        self.prerequisites
            .iter()
            .filter(|(_, prereqs)| prereqs.iter().any(|p| p == resource))
            .map(|(dependent, _)| dependent.clone())
            .collect()
    }

    /// Fail if the edges restricted to `members` contain a cycle.
    pub fn ensure_acyclic(&self, members: &BTreeSet<String>) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            graph: &DependencyGraph,
            members: &BTreeSet<String>,
            node: &str,
            marks: &mut BTreeMap<String, Mark>,
            path: &mut Vec<String>,
        ) -> Result<()> {
            match marks.get(node) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    path.push(node.to_string());
                    return Err(PublisherError::dependency(format!(
                        "dependency cycle: {}",
                        path.join(" -> ")
                    )));
                },
                None => {},
            }

            marks.insert(node.to_string(), Mark::Visiting);
            path.push(node.to_string());
            for prereq in graph.prerequisites_of(node) {
                if members.contains(prereq) {
                    visit(graph, members, prereq, marks, path)?;
                }
            }
            path.pop();
            marks.insert(node.to_string(), Mark::Done);
            Ok(())
        }

        let mut marks = BTreeMap::new();
        for member in members {
            visit(self, members, member, &mut marks, &mut Vec::new())?;
        }
        Ok(())
    }
}

#[async_trait]
pub trait DependencyProvider: Send + Sync {
    async fn get_dependencies(&self) -> Result<DependencyGraph>;
}

/// Provider backed by a fixed map.
#[derive(Debug, Clone, Default)]
pub struct StaticDependencyProvider {
    graph: DependencyGraph,
}

impl StaticDependencyProvider {
    pub fn new(prerequisites: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            graph: DependencyGraph::new(prerequisites),
        }
    }

    /// Load `{ "<resource>": ["<prerequisite>", ...] }` from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::new(serde_json::from_str(&text)?))
    }
}

#[async_trait]
impl DependencyProvider for StaticDependencyProvider {
    async fn get_dependencies(&self) -> Result<DependencyGraph> {
        Ok(self.graph.clone())
    }
}
