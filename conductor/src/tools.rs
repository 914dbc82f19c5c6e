//! Tool-invocation boundary.
//!
//! Every agent type that declares an `operation` is exposed as one tool whose
//! parameters are its input schema. Invocation never fails at the boundary:
//! the caller gets the agent's output or a structured error body.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::core::types::{ExecutionContext, TaskRequest, ToolAccess, ToolScope};
use crate::error::{ConductorError, Result};
use crate::io::catalog::Catalog;
use crate::spawner::AgentSpawner;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub agent_type: String,
    pub description: String,
    pub parameters: Value,
}

pub struct ToolRegistry {
    tools: BTreeMap<String, ToolDescriptor>,
    spawner: Arc<AgentSpawner>,
}

impl ToolRegistry {
    pub fn new(spawner: Arc<AgentSpawner>) -> Self {
        let tools = descriptors(&spawner.runtime().catalog);
        Self { tools, spawner }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tools an agent with `access` may call in `scope`, in name order.
    pub fn visible_to(&self, access: &ToolAccess, scope: ToolScope) -> Vec<&ToolDescriptor> {
        self.tools
            .values()
            .filter(|tool| access.allows(scope, &tool.name))
            .collect()
    }

    /// JSON listing of [`visible_to`](Self::visible_to).
    pub fn describe(&self, access: &ToolAccess, scope: ToolScope) -> Value {
        json!(self.visible_to(access, scope))
    }

    /// Call tool `name` with `args` as the agent input.
    #[instrument(skip_all, fields(tool = name, root = %context.root))]
    pub async fn invoke(&self, name: &str, args: Value, context: ExecutionContext) -> Value {
        match self.try_invoke(name, args, context).await {
            Ok(output) => output,
            Err(err) => {
                debug!(kind = err.kind(), error = %err, "tool invocation failed");
                err.to_json()
            }
        }
    }

    async fn try_invoke(&self, name: &str, args: Value, context: ExecutionContext) -> Result<Value> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ConductorError::NotFound(name.to_string()))?;
        let Value::Object(input) = args else {
            return Err(ConductorError::InvalidRequest(format!(
                "arguments for '{name}' must be a JSON object"
            )));
        };
        let request = TaskRequest {
            agent_type: tool.agent_type.clone(),
            description: tool.description.clone(),
            input,
            subject: None,
            deliverables: Vec::new(),
            refinement: None,
            context,
        };
        let result = self.spawner.spawn(&tool.agent_type, request).await?;
        Ok(result.output)
    }
}

fn descriptors(catalog: &Catalog) -> BTreeMap<String, ToolDescriptor> {
    catalog
        .iter()
        .filter_map(|agent| {
            let spec = &agent.spec;
            let name = spec.operation.clone()?;
            let description = spec
                .instructions
                .first()
                .cloned()
                .unwrap_or_else(|| format!("Run the '{}' agent", spec.id));
            Some((
                name.clone(),
                ToolDescriptor {
                    name,
                    agent_type: spec.id.clone(),
                    description,
                    parameters: spec.input_schema.clone(),
                },
            ))
        })
        .collect()
}
