//! Concurrent fan-out for endpoints that accept several identifiers
//!
//! Each identifier is fetched independently; one failing does not affect the
//! others. Results and failures are collected into two maps keyed by
//! identifier.

use std::future::Future;

use futures::future::join_all;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::error::ApiError;
use crate::data::CimaError;

/// Per-identifier results of a fan-out
#[derive(Debug, Default)]
pub struct FanOut {
    pub data: Map<String, Value>,
    pub errors: Map<String, Value>,
}

impl FanOut {
    /// Fails with 404 when no identifier produced data
    ///
    /// The error details list the identifiers and their individual errors.
    pub fn require_any(self, message: &str) -> Result<Self, ApiError> {
        if !self.data.is_empty() {
            return Ok(self);
        }
        let not_found: Vec<&String> = self.errors.keys().collect();
        Err(ApiError::not_found(
            message,
            Some(json!({"not_found": not_found, "errors": self.errors})),
        ))
    }
}

/// Runs `fetch` for every key concurrently
///
/// `Ok(Some(value))` lands in `data`; `Ok(None)` and errors land in `errors`
/// (the former with `empty_message`). Duplicate keys are fetched once.
pub async fn fan_out<F, Fut>(keys: &[String], empty_message: &str, fetch: F) -> FanOut
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Option<Value>, CimaError>>,
{
    let mut unique: Vec<String> = Vec::with_capacity(keys.len());
    for key in keys {
        if !unique.contains(key) {
            unique.push(key.clone());
        }
    }

    let results = join_all(unique.iter().cloned().map(&fetch)).await;

    let mut out = FanOut::default();
    for (key, result) in unique.into_iter().zip(results) {
        match result {
            Ok(Some(value)) => {
                out.data.insert(key, value);
            }
            Ok(None) => {
                out.errors.insert(key, json!({"detail": empty_message}));
            }
            Err(e) => {
                debug!(%key, error = %e, "fan-out item failed");
                out.errors.insert(key, json!({"detail": e.to_string()}));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    fn keys(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_partial_failure_is_isolated() {
        let out = fan_out(&keys(&["1", "2", "3"]), "sin datos", |key| async move {
            match key.as_str() {
                "1" => Ok(Some(json!({"cn": "1"}))),
                "2" => Ok(None),
                _ => Err(CimaError::Status { status: 500, url: "u".to_string() }),
            }
        })
        .await;

        assert_eq!(out.data.len(), 1);
        assert_eq!(out.data["1"], json!({"cn": "1"}));
        assert_eq!(out.errors["2"], json!({"detail": "sin datos"}));
        assert!(out.errors["3"]["detail"].as_str().is_some_and(|d| d.contains("500")));
        assert!(out.require_any("nada").is_ok());
    }

    #[tokio::test]
    async fn test_all_failed_is_not_found() {
        let out = fan_out(&keys(&["9"]), "sin datos", |_| async { Ok::<Option<Value>, CimaError>(None) }).await;
        let err = out.require_any("Ningún resultado").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_duplicate_keys_fetched_once() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let out = fan_out(&keys(&["1", "1", "2"]), "sin datos", |key| {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move { Ok::<_, CimaError>(Some(Value::String(key))) }
        })
        .await;

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(out.data.len(), 2);
    }
}
