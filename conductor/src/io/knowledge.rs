//! Knowledge graph the memory writer applies operations to.
//!
//! Entities carry a kind and ordered observations; relations are directed
//! `(from, relation, to)` triples. Entity names are matched exactly.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{MemoryOperation, SessionId};

/// Mutable store owned by exactly one writer.
pub trait KnowledgeBase: Send {
    /// Apply one operation proposed by `source`.
    fn apply(&mut self, operation: &MemoryOperation, source: SessionId) -> Result<()>;
    fn snapshot(&self) -> KnowledgeGraph;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    pub kind: String,
    pub observations: Vec<String>,
    /// Sessions whose proposals shaped this entity.
    #[serde(default)]
    pub sources: BTreeSet<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relation {
    pub from: String,
    pub relation: String,
    pub to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    pub entities: BTreeMap<String, Entity>,
    pub relations: BTreeSet<Relation>,
}

impl KnowledgeGraph {
    pub fn apply(&mut self, operation: &MemoryOperation, source: SessionId) -> Result<()> {
        match operation {
            MemoryOperation::Create {
                entity,
                kind,
                observations,
            } => {
                let entry = self
                    .entities
                    .entry(entity.clone())
                    .or_insert_with(|| Entity {
                        name: entity.clone(),
                        kind: kind.clone(),
                        observations: Vec::new(),
                        sources: BTreeSet::new(),
                    });
                if entry.kind != *kind {
                    bail!(
                        "entity '{entity}' already exists with kind '{}'",
                        entry.kind
                    );
                }
                merge_observations(&mut entry.observations, observations);
                entry.sources.insert(source);
            }
            MemoryOperation::Append {
                entity,
                observations,
            } => {
                let entry = self
                    .entities
                    .get_mut(entity)
                    .ok_or_else(|| anyhow!("cannot append to unknown entity '{entity}'"))?;
                merge_observations(&mut entry.observations, observations);
                entry.sources.insert(source);
            }
            MemoryOperation::Relate { from, relation, to } => {
                for endpoint in [from, to] {
                    if !self.entities.contains_key(endpoint) {
                        bail!("cannot relate unknown entity '{endpoint}'");
                    }
                }
                self.relations.insert(Relation {
                    from: from.clone(),
                    relation: relation.clone(),
                    to: to.clone(),
                });
            }
            MemoryOperation::Retract { entity } => {
                if self.entities.remove(entity).is_none() {
                    bail!("cannot retract unknown entity '{entity}'");
                }
                self.relations
                    .retain(|rel| rel.from != *entity && rel.to != *entity);
            }
        }
        Ok(())
    }
}

fn merge_observations(existing: &mut Vec<String>, incoming: &[String]) {
    for observation in incoming {
        if !existing.contains(observation) {
            existing.push(observation.clone());
        }
    }
}

impl KnowledgeBase for KnowledgeGraph {
    fn apply(&mut self, operation: &MemoryOperation, source: SessionId) -> Result<()> {
        KnowledgeGraph::apply(self, operation, source)
    }

    fn snapshot(&self) -> KnowledgeGraph {
        self.clone()
    }
}

/// Knowledge graph persisted as one JSON file after every applied operation.
#[derive(Debug)]
pub struct JsonKnowledgeBase {
    path: PathBuf,
    graph: KnowledgeGraph,
}

impl JsonKnowledgeBase {
    /// Open `path`, starting empty when the file does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        let graph = if path.exists() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
        } else {
            KnowledgeGraph::default()
        };
        debug!(path = %path.display(), entities = graph.entities.len(), "knowledge base opened");
        Ok(Self {
            path: path.to_path_buf(),
            graph,
        })
    }
}

impl KnowledgeBase for JsonKnowledgeBase {
    fn apply(&mut self, operation: &MemoryOperation, source: SessionId) -> Result<()> {
        let mut next = self.graph.clone();
        next.apply(operation, source)?;
        let mut buf = serde_json::to_string_pretty(&next)?;
        buf.push('\n');
        super::write_atomic(&self.path, &buf)?;
        self.graph = next;
        Ok(())
    }

    fn snapshot(&self) -> KnowledgeGraph {
        self.graph.clone()
    }
}
