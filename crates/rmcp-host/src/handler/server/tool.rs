//! Tool routes: a [`Tool`] descriptor paired with a type-erased handler.

use std::{borrow::Cow, fmt::Display, future::Future, sync::Arc};

use futures::{FutureExt, future::BoxFuture};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use super::common::{
    cached_schema_for_type, schema_for_type, validate_against_schema, validate_arguments,
};
use crate::{
    model::{CallToolResult, IntoContents, JsonObject, Tool, ToolAnnotations},
    service::RequestContext,
};

/// A tool call that failed without being a protocol fault.
///
/// Both variants are reported to the client as a `CallToolResult` with
/// `isError: true`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolCallError {
    /// The arguments did not satisfy the input schema; the handler never ran.
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("{0}")]
    Execution(String),
}

/// Parameter Extractor
///
/// The arguments of a tool call, deserialized into `P`.
pub struct Parameters<P>(pub P);

impl<P> Parameters<P> {
    pub fn into_inner(self) -> P {
        self.0
    }
}

pub trait IntoCallToolResult {
    fn into_call_tool_result(self) -> Result<CallToolResult, ToolCallError>;
}

impl<T: IntoContents> IntoCallToolResult for T {
    fn into_call_tool_result(self) -> Result<CallToolResult, ToolCallError> {
        Ok(CallToolResult::success(self.into_contents()))
    }
}

impl IntoCallToolResult for CallToolResult {
    fn into_call_tool_result(self) -> Result<CallToolResult, ToolCallError> {
        Ok(self)
    }
}

impl<T: IntoContents, E: Display> IntoCallToolResult for Result<T, E> {
    fn into_call_tool_result(self) -> Result<CallToolResult, ToolCallError> {
        match self {
            Ok(value) => value.into_call_tool_result(),
            Err(error) => Err(ToolCallError::Execution(error.to_string())),
        }
    }
}

impl<E: Display> IntoCallToolResult for Result<CallToolResult, E> {
    fn into_call_tool_result(self) -> Result<CallToolResult, ToolCallError> {
        self.map_err(|error| ToolCallError::Execution(error.to_string()))
    }
}

pub type DynCallToolHandler = dyn Fn(JsonObject, RequestContext) -> BoxFuture<'static, Result<CallToolResult, ToolCallError>>
    + Send
    + Sync;

#[derive(Clone)]
pub struct ToolRoute {
    pub attr: Tool,
    pub call: Arc<DynCallToolHandler>,
}

impl std::fmt::Debug for ToolRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRoute")
            .field("name", &self.attr.name)
            .field("description", &self.attr.description)
            .field("input_schema", &self.attr.input_schema)
            .finish()
    }
}

impl ToolRoute {
    /// A tool whose input schema is derived from `P`.
    ///
    /// Arguments are deserialized into `P` before the handler runs; a failure
    /// is reported as [`ToolCallError::Validation`].
    pub fn new<P, F, Fut, R>(
        name: impl Into<Cow<'static, str>>,
        description: impl Into<Cow<'static, str>>,
        handler: F,
    ) -> Self
    where
        P: DeserializeOwned + JsonSchema + 'static,
        F: Fn(Parameters<P>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoCallToolResult + 'static,
    {
        let attr = Tool::new(name, description, cached_schema_for_type::<P>());
        Self {
            attr,
            call: Arc::new(move |arguments: JsonObject, context: RequestContext| {
                match serde_json::from_value::<P>(Value::Object(arguments)) {
                    Ok(parameters) => handler(Parameters(parameters), context)
                        .map(IntoCallToolResult::into_call_tool_result)
                        .boxed(),
                    Err(error) => {
                        futures::future::ready(Err(ToolCallError::Validation(error.to_string())))
                            .boxed()
                    }
                }
            }),
        }
    }

    /// A tool with a hand-written input schema; arguments are checked with
    /// [`validate_arguments`] before the handler runs.
    pub fn with_schema<F, Fut, R>(attr: Tool, handler: F) -> Self
    where
        F: Fn(JsonObject, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoCallToolResult + 'static,
    {
        let schema = attr.input_schema.clone();
        Self {
            attr,
            call: Arc::new(move |arguments: JsonObject, context: RequestContext| {
                if let Err(error) = validate_arguments(&schema, &arguments) {
                    return futures::future::ready(Err(ToolCallError::Validation(error))).boxed();
                }
                handler(arguments, context)
                    .map(IntoCallToolResult::into_call_tool_result)
                    .boxed()
            }),
        }
    }

    pub fn annotate(mut self, annotations: ToolAnnotations) -> Self {
        self.attr = self.attr.annotate(annotations);
        self
    }

    pub fn name(&self) -> &str {
        &self.attr.name
    }
}
