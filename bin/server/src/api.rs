//! The `api` block: an outbound HTTP request.
//!
//! Inputs: `url` (required), `method` (default `GET`), `headers` and
//! `params` (an object or a table of `{key, value}` rows), and `body`.
//! Output: `{ data, status, headers }`, with `data` parsed as JSON when the
//! response body is JSON and kept as text otherwise.

use async_trait::async_trait;
use blockflow_executor::{BlockHandler, HandlerContext, HandlerError, HandlerInputs};
use reqwest::Method;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::time::Duration;

const SERVICE: &str = "http";

/// Sends the request described by an `api` block.
#[derive(Debug, Clone)]
pub struct ApiHandler {
    client: reqwest::Client,
}

impl ApiHandler {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BlockHandler for ApiHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        inputs: HandlerInputs,
    ) -> Result<JsonValue, HandlerError> {
        let request = ApiRequest::from_inputs(&inputs)?;
        tracing::debug!(block_id = %ctx.block_id, method = %request.method, url = %request.url, "sending api request");

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&request.params);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        builder = match request.body {
            Some(JsonValue::String(text)) => builder.body(text),
            Some(body) => builder.json(&body),
            None => builder,
        };

        let response = builder.send().await.map_err(|e| HandlerError::ExternalServiceError {
            service: SERVICE.to_string(),
            message: e.to_string(),
        })?;

        let status = response.status();
        let headers: JsonMap<String, JsonValue> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.to_string(), JsonValue::from(value)))
            })
            .collect();
        let text = response.text().await.map_err(|e| HandlerError::ExternalServiceError {
            service: SERVICE.to_string(),
            message: format!("reading response body: {e}"),
        })?;
        let data = serde_json::from_str(&text).unwrap_or(JsonValue::String(text));

        if !status.is_success() {
            return Err(HandlerError::ExternalServiceError {
                service: SERVICE.to_string(),
                message: format!("{} {} returned {status}: {data}", request.method, request.url),
            });
        }

        Ok(json!({ "data": data, "status": status.as_u16(), "headers": headers }))
    }
}

/// A request read from block inputs.
#[derive(Debug, PartialEq)]
struct ApiRequest {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    params: Vec<(String, String)>,
    body: Option<JsonValue>,
}

impl ApiRequest {
    fn from_inputs(inputs: &HandlerInputs) -> Result<Self, HandlerError> {
        let url = inputs
            .get("url")
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| HandlerError::invalid_input("url is required"))?;

        let method = match inputs.get("method").and_then(JsonValue::as_str) {
            Some(method) if !method.trim().is_empty() => {
                Method::from_bytes(method.trim().to_uppercase().as_bytes())
                    .map_err(|_| HandlerError::invalid_input(format!("unsupported method {method}")))?
            }
            _ => Method::GET,
        };

        let body = inputs
            .get("body")
            .filter(|body| !body.is_null())
            .filter(|body| body.as_str().is_none_or(|text| !text.trim().is_empty()))
            .filter(|_| method != Method::GET)
            .cloned();

        Ok(Self {
            method,
            url: url.to_string(),
            headers: key_value_rows(inputs.get("headers")),
            params: key_value_rows(inputs.get("params")),
            body,
        })
    }
}

/// Reads an object or a table of rows into key/value pairs.
///
/// Rows are `{key, value}` or `{cells: {Key, Value}}`; rows with an empty
/// key are dropped.
fn key_value_rows(value: Option<&JsonValue>) -> Vec<(String, String)> {
    let text = |value: &JsonValue| match value {
        JsonValue::String(text) => text.clone(),
        other => other.to_string(),
    };
    let pairs: Vec<(String, String)> = match value {
        Some(JsonValue::Object(entries)) => entries
            .iter()
            .map(|(key, value)| (key.clone(), text(value)))
            .collect(),
        Some(JsonValue::Array(rows)) => rows
            .iter()
            .filter_map(|row| {
                let row = row.get("cells").unwrap_or(row);
                let key = row.get("key").or_else(|| row.get("Key"))?.as_str()?;
                let value = row.get("value").or_else(|| row.get("Value"));
                Some((key.to_string(), value.map(text).unwrap_or_default()))
            })
            .collect(),
        _ => Vec::new(),
    };
    pairs
        .into_iter()
        .filter(|(key, _)| !key.trim().is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(value: JsonValue) -> HandlerInputs {
        match value {
            JsonValue::Object(map) => map,
            _ => unreachable!("test inputs are objects"),
        }
    }

    #[test]
    fn request_defaults_to_get_without_body() {
        let request =
            ApiRequest::from_inputs(&inputs(json!({"url": " https://example.com ", "body": {"a": 1}})))
                .expect("request");
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.url, "https://example.com");
        assert_eq!(request.body, None);
    }

    #[test]
    fn table_rows_become_headers_and_params() {
        let request = ApiRequest::from_inputs(&inputs(json!({
            "url": "https://example.com",
            "method": "post",
            "headers": [{"cells": {"Key": "X-Id", "Value": "7"}}, {"key": "", "value": "dropped"}],
            "params": {"page": 2},
            "body": {"name": "Ada"},
        })))
        .expect("request");

        assert_eq!(request.method, Method::POST);
        assert_eq!(request.headers, [("X-Id".to_string(), "7".to_string())]);
        assert_eq!(request.params, [("page".to_string(), "2".to_string())]);
        assert_eq!(request.body, Some(json!({"name": "Ada"})));
    }

    #[test]
    fn missing_url_is_invalid_input() {
        assert!(matches!(
            ApiRequest::from_inputs(&inputs(json!({"url": ""}))),
            Err(HandlerError::InvalidInput { .. })
        ));
    }
}
