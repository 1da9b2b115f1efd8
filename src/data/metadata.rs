//! Metadata envelope attached to every response
//!
//! Responses carry a `metadata` block naming the source, the query time, the
//! search parameters that were actually supplied, the upstream API version
//! and a disclaimer. The block is built as a typed value and merged into the
//! upstream payload only when the response is serialized.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use super::reshape::SUPPLY_PROBLEM_TYPES;

/// Name of the upstream source
pub const SOURCE: &str = "CIMA (AEMPS)";

/// Version of the CIMA REST API being wrapped
pub const CIMA_API_VERSION: &str = "1.23";

/// Version of the supply problems API
pub const SUPPLY_API_VERSION: &str = "2.0";

/// Disclaimer texts included in every response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Disclaimer {
    pub texto: &'static str,
    pub uso_responsable: &'static str,
}

impl Default for Disclaimer {
    fn default() -> Self {
        Self {
            texto: "Esta información no constituye consejo médico; se proporciona solo a efectos informativos.",
            uso_responsable: "Consulte siempre con un profesional sanitario antes de tomar decisiones médicas.",
        }
    }
}

/// The `metadata` block of a response
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metadata {
    pub fuente: &'static str,
    /// Query time formatted as `dd/mm/YYYY HH:MM UTC`
    pub fecha_consulta: String,
    /// Only the parameters the caller supplied
    pub parametros_busqueda: Map<String, Value>,
    pub version_api: &'static str,
    pub descargo_responsabilidad: Disclaimer,
    /// Supply problem code table, present on supply problem responses
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tipo_problema_suministros: Option<BTreeMap<u8, &'static str>>,
}

impl Metadata {
    /// Builds metadata for a CIMA query with the given parameters
    pub fn new<P: Serialize>(params: &P) -> Self {
        Self::at(params, Utc::now())
    }

    /// Builds metadata with an explicit query time
    pub fn at<P: Serialize>(params: &P, now: DateTime<Utc>) -> Self {
        Self {
            fuente: SOURCE,
            fecha_consulta: now.format("%d/%m/%Y %H:%M UTC").to_string(),
            parametros_busqueda: supplied_params(params),
            version_api: CIMA_API_VERSION,
            descargo_responsabilidad: Disclaimer::default(),
            tipo_problema_suministros: None,
        }
    }

    /// Builds metadata for the supply problems API, including its code table
    pub fn supply<P: Serialize>(params: &P) -> Self {
        Self {
            version_api: SUPPLY_API_VERSION,
            tipo_problema_suministros: Some(SUPPLY_PROBLEM_TYPES.iter().copied().collect()),
            ..Self::new(params)
        }
    }

    /// Serializes the block on its own
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Merges the block into an upstream payload
    ///
    /// - objects gain a `metadata` key
    /// - arrays get the key on each object element; other elements are
    ///   wrapped as `{"data": element, "metadata": ...}`
    /// - anything else becomes `{"data": value, "metadata": ...}`
    pub fn attach(&self, result: Value) -> Value {
        let metadata = self.to_value();
        match result {
            Value::Object(mut object) => {
                object.insert("metadata".to_string(), metadata);
                Value::Object(object)
            }
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::Object(mut object) => {
                            object.insert("metadata".to_string(), metadata.clone());
                            Value::Object(object)
                        }
                        other => wrap(other, metadata.clone()),
                    })
                    .collect(),
            ),
            other => wrap(other, metadata),
        }
    }
}

/// `{data, metadata, errors?}` response shape used by listing and bulk endpoints
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T> {
    pub data: T,
    pub metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Map<String, Value>>,
}

impl<T> Envelope<T> {
    pub fn new(data: T, metadata: Metadata) -> Self {
        Self {
            data,
            metadata,
            errors: None,
        }
    }

    /// Attaches a per-key error map; an empty map is omitted
    pub fn with_errors(mut self, errors: Map<String, Value>) -> Self {
        self.errors = if errors.is_empty() { None } else { Some(errors) };
        self
    }
}

fn wrap(data: Value, metadata: Value) -> Value {
    let mut object = Map::new();
    object.insert("data".to_string(), data);
    object.insert("metadata".to_string(), metadata);
    Value::Object(object)
}

/// Serializes query parameters, keeping only those that were supplied
fn supplied_params<P: Serialize>(params: &P) -> Map<String, Value> {
    match serde_json::to_value(params) {
        Ok(Value::Object(object)) => object
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .collect(),
        _ => Map::new(),
    }
}
