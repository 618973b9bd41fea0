//! recipe-bus-call: issue one RPC call and print the response.
//!
//! ```text
//! recipe-bus-call [--config <path>] [--timeout-ms <ms>] <target-queue> <action> [json-payload]
//! ```
//!
//! Broker and service identity come from the usual configuration sources
//! (`config.yaml`, `RECIPE_BUS_CONFIG`, `RECIPE_BUS__*`, `AMQP_URL`,
//! `SERVICE_NAME`). The response body is printed as JSON; the exit code is
//! non-zero when the response carries an error.

use std::process::ExitCode;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info};

use recipe_bus::bus::{CallOptions, RpcCaller, RpcRequest};
use recipe_bus::config::Config;
use recipe_bus::transport::{init_transport, ChannelManager};

const USAGE: &str =
    "usage: recipe-bus-call [--config <path>] [--timeout-ms <ms>] <target-queue> <action> [json-payload]";

struct Args {
    config_path: Option<String>,
    timeout: Option<Duration>,
    target_queue: String,
    action: String,
    payload: Value,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
    let mut config_path = None;
    let mut timeout = None;
    let mut positional = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                config_path = Some(args.next().ok_or("--config needs a path")?);
            }
            "--timeout-ms" => {
                let ms = args.next().ok_or("--timeout-ms needs a value")?;
                let ms: u64 = ms
                    .parse()
                    .map_err(|e| format!("invalid --timeout-ms '{}': {}", ms, e))?;
                timeout = Some(Duration::from_millis(ms));
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let (Some(target_queue), Some(action)) = (positional.next(), positional.next()) else {
        return Err(USAGE.to_string());
    };
    let payload = match positional.next() {
        Some(raw) => serde_json::from_str(&raw).map_err(|e| format!("invalid JSON payload: {}", e))?,
        None => Value::Object(Default::default()),
    };
    if positional.next().is_some() {
        return Err(USAGE.to_string());
    }

    Ok(Args {
        config_path,
        timeout,
        target_queue,
        action,
        payload,
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    recipe_bus::utils::bootstrap::init_tracing();

    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            return Ok(ExitCode::from(2));
        }
    };

    let config = Config::load(args.config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    let messaging = config.messaging;

    let transport = init_transport(&messaging)?;
    let caller = RpcCaller::new(&messaging, ChannelManager::new(transport));

    info!(
        target = %args.target_queue,
        action = %args.action,
        source = %messaging.service,
        "Calling"
    );

    let request = RpcRequest::new(messaging.service.as_str(), args.action, args.payload);
    let options = CallOptions {
        timeout: args.timeout,
        cancel: None,
    };
    let response = caller.call(&args.target_queue, &request, options).await?;
    caller.close().await;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(if response.is_ok() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_minimal() {
        let parsed = parse_args(args(&["auth-rpc", "rpcGetUserById"])).unwrap();
        assert_eq!(parsed.target_queue, "auth-rpc");
        assert_eq!(parsed.action, "rpcGetUserById");
        assert_eq!(parsed.payload, json!({}));
        assert!(parsed.config_path.is_none());
    }

    #[test]
    fn test_parse_full() {
        let parsed = parse_args(args(&[
            "--config",
            "bus.yaml",
            "auth-rpc",
            "rpcGetUserById",
            r#"{"_id":"u1"}"#,
            "--timeout-ms",
            "200",
        ]))
        .unwrap();
        assert_eq!(parsed.config_path.as_deref(), Some("bus.yaml"));
        assert_eq!(parsed.timeout, Some(Duration::from_millis(200)));
        assert_eq!(parsed.payload, json!({"_id": "u1"}));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(args(&["auth-rpc"])).is_err());
        assert!(parse_args(args(&["auth-rpc", "rpcGetUserById", "{not json"])).is_err());
        assert!(parse_args(args(&["--timeout-ms", "soon", "a", "b"])).is_err());
        assert!(parse_args(args(&["a", "b", "{}", "extra"])).is_err());
    }
}
