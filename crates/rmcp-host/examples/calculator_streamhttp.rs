use std::sync::Arc;

use rmcp_host::{
    CapabilityProvider, Registry, RequestContext, ResourceRoute, ToolRoute,
    handler::server::Parameters,
    model::{Implementation, ResourceContents, ServerInfo},
    schemars,
    transport::{HttpServer, HttpServerConfig, StreamableHttpService},
};

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
struct AddRequest {
    #[schemars(description = "the left hand side number")]
    a: f64,
    #[schemars(description = "the right hand side number")]
    b: f64,
}

struct Calculator;

impl CapabilityProvider for Calculator {
    fn tool_routes(&self) -> Vec<ToolRoute> {
        vec![ToolRoute::new(
            "add",
            "Add two numbers",
            |Parameters(AddRequest { a, b }), _: RequestContext| async move {
                format!("{a} + {b} = {}", a + b)
            },
        )]
    }

    fn resource_routes(&self) -> Vec<ResourceRoute> {
        vec![
            ResourceRoute::new("calc://constants/pi", "pi", |uri: String, _| async move {
                Ok::<_, std::convert::Infallible>(vec![ResourceContents::text(
                    std::f64::consts::PI.to_string(),
                    uri,
                )])
            })
            .with_description("The ratio of a circle's circumference to its diameter"),
        ]
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".to_string().into()),
        )
        .init();

    let registry = Registry::new();
    registry.register(&Calculator)?;

    let info = ServerInfo {
        server_info: Implementation {
            name: "calculator".into(),
            title: Some("Calculator".into()),
            version: env!("CARGO_PKG_VERSION").into(),
        },
        instructions: Some("Use the add tool to sum two numbers.".into()),
        ..Default::default()
    };
    let service = StreamableHttpService::new(Arc::new(registry), info, Default::default());
    let server =
        HttpServer::serve_with_config(HttpServerConfig::new([127, 0, 0, 1], 8000), service).await?;

    println!("MCP endpoint: http://{}/mcp", server.local_addr());
    println!("POST /mcp - Send JSON-RPC requests");
    println!("GET /mcp - Open or resume the SSE stream of a session");
    println!("DELETE /mcp - Close session");

    server.waiting().await?;
    Ok(())
}
