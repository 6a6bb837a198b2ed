use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use rmcp_host::{
    CapabilityProvider, PromptRoute, RequestContext, ResourceRoute, ToolRoute,
    handler::server::{Arguments, Parameters},
    model::{
        LoggingLevel, LoggingMessageNotificationParam, PromptMessage, PromptMessageRole,
        ResourceContents,
    },
    schemars,
};

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct AddRequest {
    #[schemars(description = "the left hand side number")]
    pub a: f64,
    #[schemars(description = "the right hand side number")]
    pub b: f64,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct CountRequest {
    pub to: u32,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
pub struct ExplainArgs {
    /// The expression to explain
    pub expression: String,
}

/// Counts how often the `add` handler actually ran.
#[derive(Debug, Clone, Default)]
pub struct Calculator {
    pub add_calls: Arc<AtomicUsize>,
}

impl Calculator {
    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }
}

impl CapabilityProvider for Calculator {
    fn tool_routes(&self) -> Vec<ToolRoute> {
        let add_calls = self.add_calls.clone();
        vec![
            ToolRoute::new(
                "add",
                "Add two numbers",
                move |Parameters(AddRequest { a, b }), _: RequestContext| {
                    add_calls.fetch_add(1, Ordering::SeqCst);
                    async move { format!("{a} + {b} = {}", a + b) }
                },
            ),
            ToolRoute::new(
                "divide",
                "Divide two numbers",
                |Parameters(AddRequest { a, b }), _: RequestContext| async move {
                    if b == 0.0 {
                        Err("division by zero")
                    } else {
                        Ok(format!("{a} / {b} = {}", a / b))
                    }
                },
            ),
            ToolRoute::new(
                "count",
                "Count up, reporting progress and logging each step",
                |Parameters(CountRequest { to }), context: RequestContext| async move {
                    for step in 1..=to {
                        let _ = context
                            .notify_progress(step as f64, Some(to as f64), None)
                            .await;
                        let _ = context
                            .peer
                            .notify_logging_message(LoggingMessageNotificationParam {
                                level: LoggingLevel::Info,
                                logger: Some("count".into()),
                                data: serde_json::json!(step),
                            })
                            .await;
                    }
                    format!("counted to {to}")
                },
            ),
        ]
    }

    fn resource_routes(&self) -> Vec<ResourceRoute> {
        vec![
            ResourceRoute::new("calc://constants/pi", "pi", |uri: String, _| async move {
                Ok::<_, std::convert::Infallible>(vec![ResourceContents::text(
                    std::f64::consts::PI.to_string(),
                    uri,
                )])
            })
            .with_mime_type("text/plain"),
        ]
    }

    fn prompt_routes(&self) -> Vec<PromptRoute> {
        vec![PromptRoute::new(
            "explain",
            "Explain an arithmetic expression step by step",
            |Arguments(ExplainArgs { expression }), _: RequestContext| async move {
                vec![PromptMessage::new_text(
                    PromptMessageRole::User,
                    format!("Explain how to evaluate {expression} step by step."),
                )]
            },
        )]
    }
}
