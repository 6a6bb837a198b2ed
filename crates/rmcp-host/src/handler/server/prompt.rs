//! Prompt handling infrastructure for MCP servers
//!
//! Prompts are reusable message templates. A [`PromptRoute`] pairs the
//! advertised [`Prompt`] with a handler that renders it from string arguments.

use std::{fmt::Display, future::Future, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::common::schema_for_type;
use crate::{
    model::{GetPromptResult, JsonObject, Prompt, PromptArgument, PromptMessage},
    service::RequestContext,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PromptError {
    #[error("Invalid prompt arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Execution(String),
}

/// Wrapper for parsing prompt arguments
pub struct Arguments<T>(pub T);

impl<T> Arguments<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

/// Convert a JSON schema into prompt arguments
pub fn arguments_from_schema<T: JsonSchema>() -> Option<Vec<PromptArgument>> {
    let schema = schema_for_type::<T>();
    let properties = schema.get("properties")?.as_object()?;

    let required = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .collect::<std::collections::HashSet<_>>()
        })
        .unwrap_or_default();

    let mut arguments = Vec::new();
    for (name, prop_schema) in properties {
        let description = prop_schema
            .get("description")
            .and_then(|d| d.as_str())
            .map(String::from);

        arguments.push(PromptArgument {
            name: name.clone(),
            description,
            required: Some(required.contains(name.as_str())),
        });
    }

    if arguments.is_empty() {
        None
    } else {
        Some(arguments)
    }
}

pub trait IntoGetPromptResult {
    fn into_get_prompt_result(self) -> Result<GetPromptResult, PromptError>;
}

impl IntoGetPromptResult for GetPromptResult {
    fn into_get_prompt_result(self) -> Result<GetPromptResult, PromptError> {
        Ok(self)
    }
}

impl IntoGetPromptResult for Vec<PromptMessage> {
    fn into_get_prompt_result(self) -> Result<GetPromptResult, PromptError> {
        Ok(self.into())
    }
}

impl<T: IntoGetPromptResult, E: Display> IntoGetPromptResult for Result<T, E> {
    fn into_get_prompt_result(self) -> Result<GetPromptResult, PromptError> {
        match self {
            Ok(value) => value.into_get_prompt_result(),
            Err(error) => Err(PromptError::Execution(error.to_string())),
        }
    }
}

pub type DynGetPromptHandler = dyn Fn(JsonObject, RequestContext) -> BoxFuture<'static, Result<GetPromptResult, PromptError>>
    + Send
    + Sync;

#[derive(Clone)]
pub struct PromptRoute {
    pub attr: Prompt,
    pub get: Arc<DynGetPromptHandler>,
}

impl std::fmt::Debug for PromptRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptRoute")
            .field("name", &self.attr.name)
            .field("arguments", &self.attr.arguments)
            .finish()
    }
}

impl PromptRoute {
    /// A prompt whose arguments are described by, and parsed into, `T`.
    pub fn new<T, F, Fut, R>(name: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        T: DeserializeOwned + JsonSchema + 'static,
        F: Fn(Arguments<T>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoGetPromptResult + 'static,
    {
        let attr = Prompt::new(name, Some(description), arguments_from_schema::<T>());
        Self {
            attr,
            get: Arc::new(move |arguments: JsonObject, context: RequestContext| {
                match serde_json::from_value::<T>(Value::Object(arguments)) {
                    Ok(arguments) => handler(Arguments(arguments), context)
                        .map(IntoGetPromptResult::into_get_prompt_result)
                        .boxed(),
                    Err(error) => futures::future::ready(Err(PromptError::InvalidArguments(
                        error.to_string(),
                    )))
                    .boxed(),
                }
            }),
        }
    }

    /// A prompt with explicitly declared arguments. Missing required
    /// arguments are rejected before the handler runs.
    pub fn with_arguments<F, Fut, R>(attr: Prompt, handler: F) -> Self
    where
        F: Fn(JsonObject, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoGetPromptResult + 'static,
    {
        let required: Vec<String> = attr
            .arguments
            .iter()
            .flatten()
            .filter(|argument| argument.required.unwrap_or(false))
            .map(|argument| argument.name.clone())
            .collect();
        Self {
            attr,
            get: Arc::new(move |arguments: JsonObject, context: RequestContext| {
                if let Some(missing) = required.iter().find(|name| !arguments.contains_key(*name)) {
                    return futures::future::ready(Err(PromptError::InvalidArguments(format!(
                        "missing required argument `{missing}`"
                    ))))
                    .boxed();
                }
                handler(arguments, context)
                    .map(IntoGetPromptResult::into_get_prompt_result)
                    .boxed()
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.attr.name
    }
}
