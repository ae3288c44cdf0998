use crate::Result;
use crate::protocol::models::Tool;
use schemars::JsonSchema;
use schemars::schema::RootSchema;

use super::gateway::{AGENT_NETWORK_TOOL, AgentNetworkArgs};

#[derive(Clone, Debug)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub schema: RootSchema,
}

/// Tools advertised to the model in `session.update`.
///
/// Execution is never local: every call is routed to the agent gateway, so the
/// catalog only carries names, descriptions and argument schemas.
#[derive(Clone, Debug, Default)]
pub struct ToolCatalog {
    defs: Vec<ToolDefinition>,
}

impl ToolCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the single agent-network tool.
    #[must_use]
    pub fn agent_network() -> Self {
        let mut catalog = Self::new();
        catalog.tool::<AgentNetworkArgs>(
            AGENT_NETWORK_TOOL,
            "Send a request to the external agent network. Use it for anything that needs \
             live data or actions outside this conversation. Results arrive later; tell the \
             user the request is in progress.",
        );
        catalog
    }

    #[must_use]
    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.defs
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.defs.iter().any(|def| def.name == name)
    }

    /// Register a tool whose arguments are described by `TArgs`. Re-registering
    /// a name replaces the previous definition.
    pub fn tool<TArgs: JsonSchema>(&mut self, name: &str, description: impl Into<String>) {
        let schema = schemars::schema_for!(TArgs);
        self.defs.retain(|def| def.name != name);
        self.defs.push(ToolDefinition {
            name: name.to_string(),
            description: Some(description.into()),
            schema,
        });
    }

    /// Convert all registered tools into protocol-level tool definitions.
    ///
    /// # Errors
    /// Returns an error if schema serialization fails.
    #[allow(clippy::result_large_err)]
    pub fn try_as_tools(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::with_capacity(self.defs.len());
        for def in &self.defs {
            let parameters = serde_json::to_value(&def.schema)?;
            tools.push(Tool::Function {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters,
            });
        }
        Ok(tools)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_network_tool_requires_request() {
        let catalog = ToolCatalog::agent_network();
        let tools = catalog.try_as_tools().unwrap();
        assert_eq!(tools.len(), 1);
        let Tool::Function { name, parameters, .. } = &tools[0];
        assert_eq!(name, AGENT_NETWORK_TOOL);
        assert_eq!(parameters["type"], "object");
        assert_eq!(parameters["required"][0], "request");
        assert_eq!(parameters["properties"]["request"]["type"], "string");
    }

    #[test]
    fn reregistering_replaces_definition() {
        let mut catalog = ToolCatalog::agent_network();
        catalog.tool::<AgentNetworkArgs>(AGENT_NETWORK_TOOL, "shorter");
        assert_eq!(catalog.definitions().len(), 1);
        assert_eq!(catalog.definitions()[0].description.as_deref(), Some("shorter"));
        assert!(catalog.contains(AGENT_NETWORK_TOOL));
    }
}
