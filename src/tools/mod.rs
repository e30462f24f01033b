// src/tools/mod.rs
// Tool Registry: name -> descriptor + handler, rendered to provider schemas
// on demand (spec.md §4.3). Populated at startup; read-only afterwards.

use crate::llm::types::{RenderedFunction, RenderedTool};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Context handed to a handler alongside its parsed arguments.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub user_id: String,
    pub channel: String,
}

/// A tool handler: `(args, ctx) -> result`. Implementations may perform I/O;
/// unhandled errors are caught by the caller and turned into `{"error": ...}`
/// (spec.md §6).
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value, ctx: &SessionContext) -> anyhow::Result<Value>;
}

/// Blanket impl so a plain async closure can be registered directly.
#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Value, SessionContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Value, ctx: &SessionContext) -> anyhow::Result<Value> {
        (self)(args, ctx.clone()).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    String,
    Integer,
    Boolean,
    Number,
    Array,
}

impl ParamType {
    fn to_json_schema(&self) -> Value {
        match self {
            ParamType::String => json!({"type": "string"}),
            ParamType::Integer => json!({"type": "integer"}),
            ParamType::Boolean => json!({"type": "boolean"}),
            ParamType::Number => json!({"type": "number"}),
            ParamType::Array => json!({"type": "array", "items": {"type": "string"}}),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolParameter {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub default: Option<Value>,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub category: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
    pub examples: Vec<String>,
    pub notes: Option<String>,
}

impl ToolDescriptor {
    /// Renders this descriptor to the JSON-Schema-Draft-7 function-calling
    /// shape consumed directly by OpenAI/Anthropic/OpenRouter (spec.md §6).
    pub fn render(&self) -> RenderedTool {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut schema = param.param_type.to_json_schema();
            if let Value::Object(ref mut obj) = schema {
                obj.insert("description".to_string(), json!(param.description));
                if let Some(default) = &param.default {
                    if !default.is_null() {
                        obj.insert("default".to_string(), default.clone());
                    }
                }
            }
            properties.insert(param.name.clone(), schema);
            if param.required {
                required.push(param.name.clone());
            }
        }

        RenderedTool {
            kind: "function".to_string(),
            function: RenderedFunction {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: json!({
                    "type": "object",
                    "properties": Value::Object(properties),
                    "required": required,
                }),
            },
        }
    }
}

struct ToolEntry {
    descriptor: ToolDescriptor,
    handler: Arc<dyn ToolHandler>,
}

/// Table-driven registry, populated once at startup and read-only at
/// runtime (spec.md §4.3).
#[derive(Default)]
pub struct ToolRegistry {
    entries: HashMap<String, ToolEntry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ToolDescriptor, handler: Arc<dyn ToolHandler>) {
        self.entries.insert(descriptor.name.clone(), ToolEntry { descriptor, handler });
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.entries.get(name).map(|e| &e.descriptor)
    }

    pub fn get_handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.entries.get(name).map(|e| e.handler.clone())
    }

    pub fn list_all(&self) -> Vec<&ToolDescriptor> {
        self.entries.values().map(|e| &e.descriptor).collect()
    }

    pub fn list_by_category(&self, category: &str) -> Vec<&ToolDescriptor> {
        self.entries
            .values()
            .map(|e| &e.descriptor)
            .filter(|d| d.category == category)
            .collect()
    }

    pub fn search(&self, substring: &str) -> Vec<&ToolDescriptor> {
        let needle = substring.to_lowercase();
        self.entries
            .values()
            .map(|e| &e.descriptor)
            .filter(|d| {
                d.name.to_lowercase().contains(&needle) || d.description.to_lowercase().contains(&needle)
            })
            .collect()
    }

    pub fn categories(&self) -> Vec<String> {
        let mut cats: Vec<String> = self
            .entries
            .values()
            .map(|e| e.descriptor.category.clone())
            .collect();
        cats.sort();
        cats.dedup();
        cats
    }

    pub fn render_schemas(&self) -> Vec<RenderedTool> {
        self.entries.values().map(|e| e.descriptor.render()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_descriptor() -> ToolDescriptor {
        ToolDescriptor {
            name: "search_memory".to_string(),
            category: "memory".to_string(),
            description: "Search semantic memory".to_string(),
            parameters: vec![
                ToolParameter {
                    name: "query".to_string(),
                    param_type: ParamType::String,
                    required: true,
                    default: None,
                    description: "search text".to_string(),
                },
                ToolParameter {
                    name: "limit".to_string(),
                    param_type: ParamType::Integer,
                    required: false,
                    default: Some(json!(5)),
                    description: "max results".to_string(),
                },
            ],
            examples: vec![],
            notes: None,
        }
    }

    fn echo_handler() -> Arc<dyn ToolHandler> {
        Arc::new(|args: Value, _ctx: SessionContext| async move { Ok(args) })
    }

    #[test]
    fn render_schemas_marks_required_and_defaults() {
        let mut registry = ToolRegistry::new();
        registry.register(sample_descriptor(), echo_handler());
        let rendered = registry.render_schemas();
        assert_eq!(rendered.len(), 1);
        let params = &rendered[0].function.parameters;
        assert_eq!(params["required"], json!(["query"]));
        assert_eq!(params["properties"]["limit"]["default"], json!(5));
        assert!(params["properties"]["limit"].get("default").is_some());
        assert!(params["properties"]["query"].get("default").is_none());
    }

    #[test]
    fn search_matches_name_and_description() {
        let mut registry = ToolRegistry::new();
        registry.register(sample_descriptor(), echo_handler());
        assert_eq!(registry.search("memory").len(), 1);
        assert_eq!(registry.search("nonexistent").len(), 0);
    }

    #[tokio::test]
    async fn get_handler_round_trips_args() {
        let mut registry = ToolRegistry::new();
        registry.register(sample_descriptor(), echo_handler());
        let handler = registry.get_handler("search_memory").unwrap();
        let ctx = SessionContext { user_id: "u1".to_string(), channel: "test".to_string() };
        let result = handler.call(json!({"query": "x"}), &ctx).await.unwrap();
        assert_eq!(result, json!({"query": "x"}));
    }
}
