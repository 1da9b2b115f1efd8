//! Query string extractors
//!
//! [`ApiQuery`] wraps axum's `Query` so that rejections come back in the
//! service's JSON error shape. [`MultiQuery`] keeps every occurrence of a
//! key, for parameters that may be repeated (`?cn=1&cn=2`) or given as a
//! comma-separated list (`?cn=1,2`).

use axum::async_trait;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use serde::de::DeserializeOwned;

use super::error::ApiError;

/// `Query<T>` with [`ApiError`] as its rejection
#[derive(Debug, Clone)]
pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

/// Every key/value pair of the query string, in order
#[derive(Debug, Clone, Default)]
pub struct MultiQuery {
    pairs: Vec<(String, String)>,
}

impl MultiQuery {
    /// Parses a raw (still percent-encoded) query string
    pub fn parse(query: &str) -> Self {
        Self {
            pairs: url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
        }
    }

    /// Every value of `key`, split on commas, trimmed, blanks dropped
    pub fn list(&self, key: &str) -> Vec<String> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .flat_map(|(_, v)| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// First non-blank value of `key`
    pub fn first(&self, key: &str) -> Option<String> {
        self.pairs
            .iter()
            .find(|(k, v)| k == key && !v.trim().is_empty())
            .map(|(_, v)| v.trim().to_string())
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for MultiQuery
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::parse(parts.uri.query().unwrap_or_default()))
    }
}

/// Splits a comma-separated path segment into trimmed, non-blank items
pub fn split_list(segment: &str) -> Vec<String> {
    segment
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}
