use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use rmcp_host::{
    RegistrationPolicy, Registry, ToolRoute,
    handler::server::RegistryError,
    model::{ErrorCode, Tool},
    object,
};

mod common;
use common::{calculator::Calculator, calculator_registry, context, init};

#[tokio::test]
async fn test_add_returns_formatted_sum() -> anyhow::Result<()> {
    init();
    let calculator = Calculator::default();
    let registry = calculator_registry(&calculator);

    let result = registry
        .call_tool("add", Some(object!({"a": 5, "b": 3})), context(1))
        .await?;
    assert!(!result.is_error);
    assert_eq!(result.text(), "5 + 3 = 8");
    assert_eq!(calculator.add_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_invalid_arguments_never_reach_the_handler() -> anyhow::Result<()> {
    init();
    let calculator = Calculator::default();
    let registry = calculator_registry(&calculator);

    let result = registry
        .call_tool("add", Some(object!({"a": "x", "b": 3})), context(2))
        .await?;
    assert!(result.is_error);
    assert!(result.text().starts_with("Validation error"), "{}", result.text());
    assert_eq!(calculator.add_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_raw_schema_validation_precedes_execution() -> anyhow::Result<()> {
    init();
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = Registry::new();
    registry.register_tool(ToolRoute::with_schema(
        Tool::new(
            "scale",
            "Scale a vector",
            object!({
                "type": "object",
                "properties": {
                    "factor": {"type": "number"},
                    "vector": {"type": "array", "items": {"type": "number"}}
                },
                "required": ["factor", "vector"]
            }),
        ),
        {
            let calls = calls.clone();
            move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { "scaled" }
            }
        },
    ))?;

    let rejected = registry
        .call_tool(
            "scale",
            Some(object!({"factor": 2, "vector": [1, "two"]})),
            context(1),
        )
        .await?;
    assert!(rejected.is_error);
    assert!(rejected.text().contains("$.vector[1]"), "{}", rejected.text());

    let missing = registry.call_tool("scale", None, context(2)).await?;
    assert!(missing.is_error);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let accepted = registry
        .call_tool(
            "scale",
            Some(object!({"factor": 2, "vector": [1, 2]})),
            context(3),
        )
        .await?;
    assert!(!accepted.is_error);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_execution_errors_stay_soft() -> anyhow::Result<()> {
    init();
    let calculator = Calculator::default();
    let registry = calculator_registry(&calculator);

    let failed = registry
        .call_tool("divide", Some(object!({"a": 1, "b": 0})), context(1))
        .await?;
    assert!(failed.is_error);
    assert_eq!(failed.text(), "Error executing tool divide: division by zero");

    let next = registry
        .call_tool("add", Some(object!({"a": 1, "b": 2})), context(2))
        .await?;
    assert!(!next.is_error);
    assert_eq!(next.text(), "1 + 2 = 3");
    Ok(())
}

#[tokio::test]
async fn test_unknown_capabilities_are_protocol_errors() {
    init();
    let registry = calculator_registry(&Calculator::default());

    let tool = registry
        .call_tool("subtract", None, context(1))
        .await
        .unwrap_err();
    assert_eq!(tool.code, ErrorCode::INVALID_PARAMS);

    let resource = registry
        .read_resource("calc://constants/e", context(2))
        .await
        .unwrap_err();
    assert_eq!(resource.code, ErrorCode::RESOURCE_NOT_FOUND);

    let prompt = registry
        .get_prompt("summarize", None, context(3))
        .await
        .unwrap_err();
    assert_eq!(prompt.code, ErrorCode::INVALID_PARAMS);
}

#[tokio::test]
async fn test_resources_and_prompts() -> anyhow::Result<()> {
    init();
    let registry = calculator_registry(&Calculator::default());

    let read = registry.read_resource("calc://constants/pi", context(1)).await?;
    assert_eq!(read.contents.len(), 1);
    assert_eq!(read.contents[0].uri(), "calc://constants/pi");

    let prompt = registry
        .get_prompt("explain", Some(object!({"expression": "2 * (3 + 4)"})), context(2))
        .await?;
    assert_eq!(prompt.messages.len(), 1);

    let missing = registry
        .get_prompt("explain", Some(object!({})), context(3))
        .await
        .unwrap_err();
    assert_eq!(missing.code, ErrorCode::INVALID_PARAMS);
    Ok(())
}

#[test]
fn test_bulk_registration_and_listing() {
    let registry = calculator_registry(&Calculator::default());
    let tools: Vec<_> = registry
        .list_tools()
        .into_iter()
        .map(|tool| tool.name.to_string())
        .collect();
    assert_eq!(tools, ["add", "count", "divide"]);
    assert_eq!(registry.list_resources().len(), 1);
    assert_eq!(registry.list_prompts()[0].name, "explain");

    let capabilities = registry.capabilities();
    assert!(capabilities.tools.is_some());
    assert!(capabilities.resources.is_some());
    assert!(capabilities.prompts.is_some());
}

#[test]
fn test_registration_policy() {
    let tool = || {
        ToolRoute::with_schema(
            Tool::new("noop", "does nothing", object!({"type": "object"})),
            |_, _| async {},
        )
    };

    let overwrite = Registry::new();
    assert_eq!(overwrite.policy(), RegistrationPolicy::Overwrite);
    overwrite.register_tool(tool()).unwrap();
    overwrite.register_tool(tool()).unwrap();
    assert_eq!(overwrite.list_tools().len(), 1);

    let reject = Registry::with_policy(RegistrationPolicy::Reject);
    reject.register_tool(tool()).unwrap();
    assert!(matches!(
        reject.register_tool(tool()),
        Err(RegistryError::AlreadyRegistered { kind: "tool", .. })
    ));
}

#[test]
fn test_registration_contract() {
    let registry = Registry::new();
    let named = |name: &str| {
        ToolRoute::with_schema(
            Tool::new(name.to_owned(), "test", object!({"type": "object"})),
            |_, _| async {},
        )
    };
    assert!(registry.register_tool(named("")).is_err());
    assert!(registry.register_tool(named("has space")).is_err());
    assert!(registry.register_tool(named(&"x".repeat(129))).is_err());
    assert!(registry.register_tool(named("ns/tool.v2-beta_1")).is_ok());

    let not_object = ToolRoute::with_schema(
        Tool::new("array_tool", "test", object!({"type": "array"})),
        |_, _| async {},
    );
    assert!(matches!(
        registry.register_tool(not_object),
        Err(RegistryError::InvalidArgument(_))
    ));

    let bad_uri = rmcp_host::ResourceRoute::new("not a uri", "bad", |_, _| async {
        Ok::<_, std::convert::Infallible>(vec![])
    });
    assert!(registry.register_resource(bad_uri).is_err());
}
