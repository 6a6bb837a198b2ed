use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};

use super::Registry;
use crate::{
    model::{
        CallToolRequestParam, ErrorData, GetPromptRequestParam, JsonRpcRequest,
        ListPromptsResult, ListResourcesResult, ListToolsResult, PaginatedRequestParam,
        ReadResourceRequestParam, method,
    },
    service::RequestContext,
};

/// Maps capability methods (`tools/*`, `resources/*`, `prompts/*`) onto a
/// [`Registry`] and shapes the results for the wire.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

fn to_result<T: Serialize>(value: T) -> Result<Value, ErrorData> {
    serde_json::to_value(value).map_err(|e| {
        ErrorData::internal_error(
            "fail to serialize result",
            Some(json!({"reason": e.to_string()})),
        )
    })
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn handles(method: &str) -> bool {
        matches!(
            method,
            method::LIST_TOOLS
                | method::CALL_TOOL
                | method::LIST_RESOURCES
                | method::READ_RESOURCE
                | method::LIST_PROMPTS
                | method::GET_PROMPT
        )
    }

    pub async fn dispatch(
        &self,
        request: &JsonRpcRequest,
        context: RequestContext,
    ) -> Result<Value, ErrorData> {
        tracing::debug!(request_id = %request.id, method = %request.method, "dispatch");
        match request.method.as_str() {
            method::LIST_TOOLS => {
                let _: PaginatedRequestParam = request.parse_params()?;
                to_result(ListToolsResult {
                    tools: self.registry.list_tools(),
                    next_cursor: None,
                })
            }
            method::CALL_TOOL => {
                let CallToolRequestParam { name, arguments } = request.parse_params()?;
                to_result(self.registry.call_tool(&name, arguments, context).await?)
            }
            method::LIST_RESOURCES => {
                let _: PaginatedRequestParam = request.parse_params()?;
                to_result(ListResourcesResult {
                    resources: self.registry.list_resources(),
                    next_cursor: None,
                })
            }
            method::READ_RESOURCE => {
                let ReadResourceRequestParam { uri } = request.parse_params()?;
                to_result(self.registry.read_resource(&uri, context).await?)
            }
            method::LIST_PROMPTS => {
                let _: PaginatedRequestParam = request.parse_params()?;
                to_result(ListPromptsResult {
                    prompts: self.registry.list_prompts(),
                    next_cursor: None,
                })
            }
            method::GET_PROMPT => {
                let GetPromptRequestParam { name, arguments } = request.parse_params()?;
                to_result(self.registry.get_prompt(&name, arguments, context).await?)
            }
            other => Err(ErrorData::method_not_found(other)),
        }
    }
}
