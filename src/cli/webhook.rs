use std::time::Duration;

use serde_json::Value;

use super::http_client::{TriggerError, WebhookClient};
use crate::types::OperationRequest;
use crate::webhook::TriggerRequest;

pub struct TriggerArgs {
    pub url: Option<String>,
    pub webhook_id: Option<i64>,
    pub api_key: Option<String>,
    pub server_id: Option<i64>,
    pub stack: Option<String>,
    pub command: Option<String>,
    pub options: Vec<String>,
    pub services: Vec<String>,
    pub operations: Option<String>,
    pub timeout: u64,
}

fn required<T>(value: Option<T>, flag: &str) -> Result<T, TriggerError> {
    value.ok_or_else(|| TriggerError::Internal(format!("missing required flag --{flag}")))
}

/// Builds the trigger body from the flags.
fn build_request(args: TriggerArgs) -> Result<(String, i64, Duration, TriggerRequest), TriggerError> {
    let url = required(args.url, "url")?;
    let webhook_id = required(args.webhook_id, "webhook-id")?;
    let api_key = required(args.api_key, "api-key")?;
    let server_id = required(args.server_id, "server-id")?;
    let stack_name = required(args.stack, "stack")?;

    let operations = args
        .operations
        .map(|raw| {
            serde_json::from_str::<Vec<OperationRequest>>(&raw)
                .map_err(|e| TriggerError::Invalid(format!("--operations is not valid JSON: {e}")))
        })
        .transpose()?;
    if args.command.is_none() && operations.is_none() {
        return Err(TriggerError::Internal(
            "one of --command or --operations is required".into(),
        ));
    }

    let request = TriggerRequest {
        api_key,
        server_id,
        stack_name,
        command: args.command,
        options: args.options,
        services: args.services,
        operations,
    };
    Ok((url, webhook_id, Duration::from_secs(args.timeout), request))
}

fn describe(data: &Value) -> String {
    if let Some(batch_id) = data.get("batchId").and_then(Value::as_str) {
        let ids: Vec<&str> = data
            .get("operations")
            .and_then(Value::as_array)
            .map(|ops| {
                ops.iter()
                    .filter_map(|op| op.get("operationId").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();
        return format!("Queued batch {batch_id}: {}", ids.join(", "));
    }
    let operation_id = data
        .get("operationId")
        .and_then(Value::as_str)
        .unwrap_or("?");
    let position = data
        .get("positionInQueue")
        .and_then(Value::as_i64)
        .unwrap_or_default();
    format!("Queued operation {operation_id} (position {position})")
}

/// Runs the trigger and returns the process exit code.
pub fn run_webhook_trigger(args: TriggerArgs) -> i32 {
    let result = build_request(args).and_then(|(url, webhook_id, timeout, request)| {
        WebhookClient::new(&url, timeout)?.trigger(webhook_id, &request)
    });
    match result {
        Ok(data) => {
            println!("{}", describe(&data));
            0
        }
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> TriggerArgs {
        TriggerArgs {
            url: Some("http://localhost:8080".into()),
            webhook_id: Some(3),
            api_key: Some("wh_abc".into()),
            server_id: Some(1),
            stack: Some("prod-web".into()),
            command: None,
            options: Vec::new(),
            services: Vec::new(),
            operations: None,
            timeout: 30,
        }
    }

    #[test]
    fn test_missing_flags_exit_seven() {
        let mut missing_key = args();
        missing_key.api_key = None;
        missing_key.command = Some("up".into());
        assert_eq!(run_webhook_trigger(missing_key), 7);

        assert_eq!(run_webhook_trigger(args()), 7);
    }

    #[test]
    fn test_bad_operations_json_is_validation() {
        let mut bad = args();
        bad.operations = Some("[{".into());
        assert_eq!(build_request(bad).unwrap_err().exit_code(), 4);
    }

    #[test]
    fn test_batch_request_body() {
        let mut batch = args();
        batch.operations = Some(r#"[{"command":"pull"},{"command":"up","options":["-d"]}]"#.into());
        let (_, webhook_id, _, request) = build_request(batch).unwrap();
        assert_eq!(webhook_id, 3);
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["operations"][1]["options"][0], "-d");
        assert!(body.get("command").is_none());
    }

    #[test]
    fn test_describe_batch() {
        let data = serde_json::json!({
            "batchId": "b1",
            "operations": [{"operationId": "a", "order": 0}, {"operationId": "b", "order": 1}],
            "positionInQueue": 1
        });
        assert_eq!(describe(&data), "Queued batch b1: a, b");
    }

    #[test]
    fn test_unreachable_server_is_network_error() {
        let mut unreachable = args();
        unreachable.url = Some("http://127.0.0.1:1".into());
        unreachable.command = Some("up".into());
        assert_eq!(run_webhook_trigger(unreachable), 5);
    }
}
