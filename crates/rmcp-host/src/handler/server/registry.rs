use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{PoisonError, RwLock},
};

use futures::FutureExt;
use serde_json::json;
use thiserror::Error;

use super::{
    prompt::{PromptError, PromptRoute},
    resource::ResourceRoute,
    tool::{ToolCallError, ToolRoute},
};
use crate::{
    model::{
        CallToolResult, Content, ErrorData, GetPromptResult, JsonObject, Prompt,
        PromptsCapability, ReadResourceResult, Resource, ResourcesCapability, ServerCapabilities,
        Tool, ToolsCapability,
    },
    service::RequestContext,
};

pub const MAX_NAME_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{kind} `{name}` is already registered")]
    AlreadyRegistered { kind: &'static str, name: String },
}

/// What to do when a name (or URI) is registered twice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RegistrationPolicy {
    /// Replace the previous registration.
    #[default]
    Overwrite,
    /// Keep the previous registration and fail with [`RegistryError::AlreadyRegistered`].
    Reject,
}

/// Something that contributes capabilities in bulk, see [`Registry::register`].
pub trait CapabilityProvider {
    fn tool_routes(&self) -> Vec<ToolRoute> {
        Vec::new()
    }
    fn resource_routes(&self) -> Vec<ResourceRoute> {
        Vec::new()
    }
    fn prompt_routes(&self) -> Vec<PromptRoute> {
        Vec::new()
    }
}

/// Tool and prompt names are 1 to 128 characters of `[A-Za-z0-9_./-]`.
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() {
        return Err(RegistryError::InvalidArgument("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(RegistryError::InvalidArgument(format!(
            "name `{name}` is longer than {MAX_NAME_LEN} characters"
        )));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-')))
    {
        return Err(RegistryError::InvalidArgument(format!(
            "name `{name}` contains invalid character {c:?}"
        )));
    }
    Ok(())
}

/// The capability surface of a server: tools, resources and prompts.
///
/// One registry is shared by every session of a server. Registration may
/// happen at any time; lookups clone the route out of the lock before
/// running the handler.
#[derive(Debug, Default)]
pub struct Registry {
    policy: RegistrationPolicy,
    tools: RwLock<HashMap<String, ToolRoute>>,
    resources: RwLock<HashMap<String, ResourceRoute>>,
    prompts: RwLock<HashMap<String, PromptRoute>>,
}

fn insert<R>(
    map: &RwLock<HashMap<String, R>>,
    policy: RegistrationPolicy,
    kind: &'static str,
    key: String,
    route: R,
) -> Result<(), RegistryError> {
    let mut map = map.write().unwrap_or_else(PoisonError::into_inner);
    if policy == RegistrationPolicy::Reject && map.contains_key(&key) {
        return Err(RegistryError::AlreadyRegistered { kind, name: key });
    }
    if map.insert(key.clone(), route).is_some() {
        tracing::debug!(kind, name = %key, "registration replaced");
    }
    Ok(())
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: RegistrationPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> RegistrationPolicy {
        self.policy
    }

    pub fn register_tool(&self, route: ToolRoute) -> Result<(), RegistryError> {
        validate_name(route.name())?;
        match route.attr.input_schema.get("type") {
            Some(serde_json::Value::String(t)) if t == "object" => {}
            _ => {
                return Err(RegistryError::InvalidArgument(format!(
                    "input schema of tool `{}` must have root type \"object\"",
                    route.name()
                )));
            }
        }
        insert(&self.tools, self.policy, "tool", route.name().to_owned(), route)
    }

    /// Register a resource keyed by its URI. A resource without a name is
    /// listed under its URI.
    pub fn register_resource(&self, mut route: ResourceRoute) -> Result<(), RegistryError> {
        url::Url::parse(route.uri()).map_err(|e| {
            RegistryError::InvalidArgument(format!("invalid resource uri `{}`: {e}", route.uri()))
        })?;
        if route.attr.name.is_empty() {
            route.attr.name = route.attr.uri.clone();
        }
        insert(
            &self.resources,
            self.policy,
            "resource",
            route.uri().to_owned(),
            route,
        )
    }

    pub fn register_prompt(&self, route: PromptRoute) -> Result<(), RegistryError> {
        validate_name(route.name())?;
        insert(&self.prompts, self.policy, "prompt", route.name().to_owned(), route)
    }

    /// Register everything a provider contributes, stopping at the first failure.
    pub fn register<P: CapabilityProvider + ?Sized>(&self, provider: &P) -> Result<(), RegistryError> {
        for route in provider.tool_routes() {
            self.register_tool(route)?;
        }
        for route in provider.resource_routes() {
            self.register_resource(route)?;
        }
        for route in provider.prompt_routes() {
            self.register_prompt(route)?;
        }
        Ok(())
    }

    pub fn list_tools(&self) -> Vec<Tool> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        let mut tools: Vec<Tool> = tools.values().map(|route| route.attr.clone()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn list_resources(&self) -> Vec<Resource> {
        let resources = self.resources.read().unwrap_or_else(PoisonError::into_inner);
        let mut resources: Vec<Resource> =
            resources.values().map(|route| route.attr.clone()).collect();
        resources.sort_by(|a, b| a.uri.cmp(&b.uri));
        resources
    }

    pub fn list_prompts(&self) -> Vec<Prompt> {
        let prompts = self.prompts.read().unwrap_or_else(PoisonError::into_inner);
        let mut prompts: Vec<Prompt> = prompts.values().map(|route| route.attr.clone()).collect();
        prompts.sort_by(|a, b| a.name.cmp(&b.name));
        prompts
    }

    pub fn get_tool(&self, name: &str) -> Option<ToolRoute> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn get_resource(&self, uri: &str) -> Option<ResourceRoute> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uri)
            .cloned()
    }

    pub fn get_prompt_route(&self, name: &str) -> Option<PromptRoute> {
        self.prompts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// The capabilities this registry can serve.
    pub fn capabilities(&self) -> ServerCapabilities {
        ServerCapabilities {
            tools: Some(ToolsCapability::default()),
            resources: Some(ResourcesCapability::default()),
            prompts: Some(PromptsCapability::default()),
            logging: Some(JsonObject::new()),
        }
    }

    /// Run a tool.
    ///
    /// An unknown tool is a protocol error. Validation failures, handler
    /// errors and handler panics come back as `isError: true` results.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
        context: RequestContext,
    ) -> Result<CallToolResult, ErrorData> {
        let route = self.get_tool(name).ok_or_else(|| {
            ErrorData::invalid_params("tool not found", Some(json!({ "name": name })))
        })?;
        let call = (route.call)(arguments.unwrap_or_default(), context);
        let outcome = match AssertUnwindSafe(call).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(ToolCallError::Execution("tool handler panicked".into())),
        };
        match outcome {
            Ok(result) => Ok(result),
            Err(error @ ToolCallError::Validation(_)) => {
                tracing::warn!(tool = name, %error, "tool arguments rejected");
                Ok(CallToolResult::error(vec![Content::text(error.to_string())]))
            }
            Err(ToolCallError::Execution(error)) => {
                tracing::warn!(tool = name, %error, "tool execution failed");
                Ok(CallToolResult::error(vec![Content::text(format!(
                    "Error executing tool {name}: {error}"
                ))]))
            }
        }
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        context: RequestContext,
    ) -> Result<ReadResourceResult, ErrorData> {
        let route = self.get_resource(uri).ok_or_else(|| {
            ErrorData::resource_not_found("resource not found", Some(json!({ "uri": uri })))
        })?;
        let read = (route.read)(uri.to_owned(), context);
        match AssertUnwindSafe(read).catch_unwind().await {
            Ok(Ok(contents)) => Ok(ReadResourceResult { contents }),
            Ok(Err(error)) => {
                tracing::error!(uri, %error, "resource read failed");
                Err(ErrorData::internal_error(
                    format!("Error reading resource {uri}: {error}"),
                    None,
                ))
            }
            Err(_) => {
                tracing::error!(uri, "resource handler panicked");
                Err(ErrorData::internal_error(
                    format!("Error reading resource {uri}"),
                    None,
                ))
            }
        }
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
        context: RequestContext,
    ) -> Result<GetPromptResult, ErrorData> {
        let route = self.get_prompt_route(name).ok_or_else(|| {
            ErrorData::invalid_params("prompt not found", Some(json!({ "name": name })))
        })?;
        let get = (route.get)(arguments.unwrap_or_default(), context);
        match AssertUnwindSafe(get).catch_unwind().await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(PromptError::InvalidArguments(error))) => {
                tracing::warn!(prompt = name, %error, "prompt arguments rejected");
                Err(ErrorData::invalid_params(
                    format!("Invalid arguments for prompt {name}: {error}"),
                    None,
                ))
            }
            Ok(Err(PromptError::Execution(error))) => {
                tracing::error!(prompt = name, %error, "prompt rendering failed");
                Err(ErrorData::internal_error(
                    format!("Error rendering prompt {name}: {error}"),
                    None,
                ))
            }
            Err(_) => {
                tracing::error!(prompt = name, "prompt handler panicked");
                Err(ErrorData::internal_error(
                    format!("Error rendering prompt {name}"),
                    None,
                ))
            }
        }
    }
}
