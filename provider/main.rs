#![forbid(unsafe_code)]

//! `echo-provider` — a small stdio tool provider.
//!
//! Serves two tools (`echo`, `sleep`), two resources (`memo://greeting`,
//! `memo://empty`) and one prompt (`greet`). Used as the process-level test
//! target and as a smoke target for `provider-session`.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use provider_session::protocol::message::{Message, MessageKind, RpcError, INVALID_PARAMS};
use provider_session::protocol::methods;
use provider_session::protocol::model::{
    Content, Prompt, PromptArgument, PromptMessage, PromptResult, ReadResourceResult, Resource,
    ResourceContent, Tool, ToolResult, DEFAULT_PROTOCOL_VERSION,
};
use provider_session::transport::codec::FrameCodec;
use provider_session::transport::writer::FrameWriter;
use provider_session::{AppError, Result};

const GREETING: &str = "hello from echo-provider";

#[derive(Debug, Clone, Copy, Parser)]
#[command(name = "echo-provider", about = "Reference stdio tool provider", version)]
struct Cli {
    /// Never answer `ping`.
    #[arg(long)]
    hang_on_ping: bool,

    /// Ignore SIGINT and stdin EOF; only a kill stops the process.
    #[arg(long)]
    linger: bool,

    /// Send `notifications/tools/list_changed` before answering each `tools/call`.
    #[arg(long)]
    notify_on_call: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?;

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(serve(cli))
}

async fn serve(cli: Cli) -> Result<()> {
    if cli.linger {
        ignore_interrupts()?;
    }

    let writer = Arc::new(FrameWriter::new("echo-provider", Box::new(tokio::io::stdout())));
    let mut frames = FramedRead::new(tokio::io::stdin(), FrameCodec::new());
    info!(pid = std::process::id(), "echo-provider started");

    while let Some(frame) = frames.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "unreadable input, stopping");
                break;
            }
        };
        match message.into_kind() {
            Ok(MessageKind::Request { id, method, params }) => {
                let writer = Arc::clone(&writer);
                // Each request runs on its own task so `sleep` never blocks
                // the requests behind it.
                tokio::spawn(async move {
                    let Some(outcome) = handle(cli, &writer, &method, params).await else {
                        debug!(method = %method, "request left unanswered");
                        return;
                    };
                    let reply = match outcome {
                        Ok(result) => Message::response(id, result),
                        Err(error) => Message::error_response(id, error),
                    };
                    if let Err(err) = writer.send(&reply).await {
                        warn!(%err, "failed to write reply");
                    }
                });
            }
            Ok(MessageKind::Notification { method, .. }) => debug!(method = %method, "notification"),
            Ok(MessageKind::Response { id, .. }) => debug!(%id, "ignoring response"),
            Err(err) => warn!(%err, "ignoring malformed envelope"),
        }
    }

    if cli.linger {
        info!("input closed, lingering");
        std::future::pending::<()>().await;
    }
    info!("echo-provider exiting");
    Ok(())
}

/// `None` means the request is deliberately never answered.
async fn handle(
    cli: Cli,
    writer: &FrameWriter,
    method: &str,
    params: Option<Value>,
) -> Option<std::result::Result<Value, RpcError>> {
    let params = params.unwrap_or(Value::Null);
    let outcome = match method {
        methods::INITIALIZE => Ok(initialize(&params)),
        methods::PING if cli.hang_on_ping => return None,
        methods::PING => Ok(json!({})),
        methods::TOOLS_LIST => Ok(json!({ "tools": tools() })),
        methods::TOOLS_CALL => {
            if cli.notify_on_call {
                let notice = Message::notification(methods::TOOLS_LIST_CHANGED, None);
                if let Err(err) = writer.send(&notice).await {
                    warn!(%err, "failed to write list_changed");
                }
            }
            call_tool(&params).await
        }
        methods::RESOURCES_LIST => Ok(json!({ "resources": resources() })),
        methods::RESOURCES_READ => read_resource(&params),
        methods::PROMPTS_LIST => Ok(json!({ "prompts": prompts() })),
        methods::PROMPTS_GET => get_prompt(&params),
        other => Err(RpcError::method_not_found(other)),
    };
    Some(outcome)
}

fn initialize(params: &Value) -> Value {
    let version = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_PROTOCOL_VERSION);
    json!({
        "protocolVersion": version,
        "capabilities": {
            "tools": { "listChanged": true },
            "resources": {},
            "prompts": {}
        },
        "serverInfo": { "name": "echo-provider", "version": env!("CARGO_PKG_VERSION") },
        "instructions": "Test provider; every tool is side-effect free."
    })
}

fn tools() -> Vec<Tool> {
    vec![
        Tool {
            name: "echo".into(),
            description: "Return the given text".into(),
            input_schema: json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
        },
        Tool {
            name: "sleep".into(),
            description: "Wait for the given number of milliseconds".into(),
            input_schema: json!({
                "type": "object",
                "properties": { "ms": { "type": "integer", "minimum": 0 } },
                "required": ["ms"]
            }),
        },
    ]
}

fn resources() -> Vec<Resource> {
    vec![
        Resource {
            uri: "memo://greeting".into(),
            name: "greeting".into(),
            description: Some("A fixed greeting".into()),
            mime_type: Some("text/plain".into()),
        },
        Resource {
            uri: "memo://empty".into(),
            name: "empty".into(),
            description: None,
            mime_type: None,
        },
    ]
}

fn prompts() -> Vec<Prompt> {
    vec![Prompt {
        name: "greet".into(),
        description: Some("Greet someone by name".into()),
        arguments: vec![PromptArgument {
            name: "name".into(),
            description: None,
            required: true,
        }],
    }]
}

async fn call_tool(params: &Value) -> std::result::Result<Value, RpcError> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
    let text = match name {
        "echo" => arguments
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::new(INVALID_PARAMS, "echo requires a string 'text'"))?
            .to_owned(),
        "sleep" => {
            let ms = arguments
                .get("ms")
                .and_then(Value::as_u64)
                .ok_or_else(|| RpcError::new(INVALID_PARAMS, "sleep requires an integer 'ms'"))?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            format!("slept {ms}ms")
        }
        other => {
            return Err(RpcError::new(INVALID_PARAMS, format!("unknown tool: {other}")));
        }
    };
    to_value(&ToolResult {
        content: vec![Content::text(text)],
        is_error: false,
    })
}

fn read_resource(params: &Value) -> std::result::Result<Value, RpcError> {
    let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
    let contents = match uri {
        "memo://greeting" => vec![ResourceContent {
            uri: uri.into(),
            mime_type: Some("text/plain".into()),
            text: Some(GREETING.into()),
            blob: None,
        }],
        "memo://empty" => Vec::new(),
        other => {
            return Err(RpcError::new(INVALID_PARAMS, format!("unknown resource: {other}")));
        }
    };
    to_value(&ReadResourceResult { contents })
}

fn get_prompt(params: &Value) -> std::result::Result<Value, RpcError> {
    if params.get("name").and_then(Value::as_str) != Some("greet") {
        return Err(RpcError::new(INVALID_PARAMS, "unknown prompt"));
    }
    let who = params
        .pointer("/arguments/name")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::new(INVALID_PARAMS, "greet requires 'name'"))?;
    to_value(&PromptResult {
        description: None,
        messages: vec![PromptMessage {
            role: "user".into(),
            content: Content::text(format!("Say hello to {who}.")),
        }],
    })
}

fn to_value<T: serde::Serialize>(value: &T) -> std::result::Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|err| {
        RpcError::new(
            provider_session::protocol::message::INTERNAL_ERROR,
            err.to_string(),
        )
    })
}

#[cfg(unix)]
fn ignore_interrupts() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    // Installing a handler replaces the default terminate-on-SIGINT action.
    let mut interrupts = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        while interrupts.recv().await.is_some() {
            info!("interrupt ignored");
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn ignore_interrupts() -> Result<()> {
    Ok(())
}
