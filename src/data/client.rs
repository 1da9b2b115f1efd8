//! CIMA REST API client
//!
//! One method per upstream endpoint. Responses come back as [`Payload`]s:
//! JSON when the upstream says so (or when an untyped body looks like JSON),
//! text otherwise. Date reshaping is left to callers, except for supply
//! problems whose records are enriched here.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::reshape::enrich_supply_problem;

/// Default upstream base URL
pub const DEFAULT_BASE_URL: &str = "https://cima.aemps.es/cima/rest";

/// Timeout applied to every upstream call
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Page size requested for the global supply problems listing
const SUPPLY_PAGE_SIZE: u32 = 20;

/// `docs[].tipo` of a Therapeutic Positioning Report
const IPT_DOC_TYPE: u64 = 3;

/// Errors that can occur when calling the CIMA API
#[derive(Debug, Error)]
pub enum CimaError {
    /// Upstream answered with a non-success status
    #[error("CIMA returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    /// HTTP request failed before a response was read
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Upstream declared JSON but sent something else
    #[error("Invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    /// Neither of the accepted identifiers was supplied
    #[error("Se requiere {0}")]
    MissingIdentifier(&'static str),

    /// A parameter was present but not acceptable
    #[error("{0}")]
    InvalidArgument(String),

    /// A base or document URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl CimaError {
    /// Upstream status code, when the error came from a response
    pub fn status(&self) -> Option<u16> {
        match self {
            CimaError::Status { status, .. } => Some(*status),
            CimaError::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether upstream reported the resource as missing
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND.as_u16())
    }
}

/// A decoded upstream body
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
}

impl Payload {
    /// Converts the payload into a JSON value; text becomes a JSON string
    pub fn into_value(self) -> Value {
        match self {
            Payload::Json(value) => value,
            Payload::Text(text) => Value::String(text),
        }
    }

    /// Whether the payload carries nothing useful (empty object, list or text)
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Json(Value::Null) => true,
            Payload::Json(Value::Object(object)) => object.is_empty(),
            Payload::Json(Value::Array(items)) => items.is_empty(),
            Payload::Json(_) => false,
            Payload::Text(text) => text.trim().is_empty(),
        }
    }
}

/// Converts an optional payload into JSON, `null` when there was no body
pub fn payload_value(payload: Option<Payload>) -> Value {
    payload.map(Payload::into_value).unwrap_or(Value::Null)
}

/// Decides how to read an upstream body
///
/// # Behavior
/// - An empty body is `None`.
/// - A content type mentioning `json` must parse as JSON; failure is an error.
/// - Without a content type, or with a generic one (`text/plain`,
///   `application/octet-stream`), a body starting with `{` or `[` is parsed
///   as JSON and kept as text if that fails.
/// - Everything else is text.
pub fn decode_body(
    content_type: Option<&str>,
    body: &[u8],
) -> Result<Option<Payload>, serde_json::Error> {
    if body.is_empty() {
        return Ok(None);
    }

    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());

    if mime.as_deref().is_some_and(|m| m.contains("json")) {
        return serde_json::from_slice(body).map(|v| Some(Payload::Json(v)));
    }

    let generic = matches!(
        mime.as_deref(),
        None | Some("") | Some("text/plain") | Some("application/octet-stream")
    );
    if generic && looks_like_json(body) {
        if let Ok(value) = serde_json::from_slice(body) {
            return Ok(Some(Payload::Json(value)));
        }
    }

    Ok(Some(Payload::Text(String::from_utf8_lossy(body).into_owned())))
}

fn looks_like_json(body: &[u8]) -> bool {
    body.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{' || *b == b'[')
}

/// Filters for `GET /medicamentos`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MedicamentosQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nombre: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub laboratorio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub practiv1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub practiv2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idpractiv1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idpractiv2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nregistro: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub npactiv: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triangulo: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub huerfano: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub biosimilar: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sust: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vmp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comerc: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub autorizados: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receta: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estupefaciente: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psicotropo: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estuopsico: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagina: Option<u32>,
}

/// Identifies a single medicine by national code or registration number
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MedicamentoQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nregistro: Option<String>,
}

impl MedicamentoQuery {
    /// Trims both identifiers, dropping blank ones
    pub fn cleaned(&self) -> Self {
        Self {
            cn: non_blank(self.cn.as_deref()),
            nregistro: non_blank(self.nregistro.as_deref()),
        }
    }

    pub fn is_empty(&self) -> bool {
        let cleaned = self.cleaned();
        cleaned.cn.is_none() && cleaned.nregistro.is_none()
    }
}

/// One rule of a technical sheet text search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FichaRule {
    /// Section in `N` or `N.N` form
    pub seccion: String,
    pub texto: String,
    /// 1 to require the text, 0 to exclude it
    pub contiene: u8,
}

/// Filters for `GET /presentaciones`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresentacionesQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nregistro: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vmp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vmpp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idpractiv1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comerc: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estupefaciente: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psicotropo: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estuopsico: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagina: Option<u32>,
}

/// Filters for `GET /vmpp`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmppQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub practiv1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idpractiv1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dosis: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forma: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nombre: Option<String>,
    #[serde(rename = "modoArbol", skip_serializing_if = "Option::is_none")]
    pub modo_arbol: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagina: Option<u32>,
}

impl VmppQuery {
    /// Whether at least one search criterion (anything but `pagina`) is set
    pub fn has_criteria(&self) -> bool {
        [
            &self.practiv1,
            &self.idpractiv1,
            &self.dosis,
            &self.forma,
            &self.atc,
            &self.nombre,
        ]
        .iter()
        .any(|field| field.as_deref().is_some_and(|v| !v.trim().is_empty()))
            || self.modo_arbol.is_some_and(|m| m != 0)
    }
}

/// Filters for `GET /maestras`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaestrasQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maestra: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nombre: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codigo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estupefaciente: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub psicotropo: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estuopsico: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enuso: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagina: Option<u32>,
}

/// HTTP method used for the change log query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeLogMethod {
    #[default]
    Get,
    Post,
}

/// Parameters of `registroCambios`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeLogQuery {
    /// Date in `dd/mm/yyyy` form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fecha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nregistro: Option<Vec<String>>,
}

impl ChangeLogQuery {
    /// Query-string form; repeated `nregistro` keys for a list
    fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(fecha) = &self.fecha {
            pairs.push(("fecha", fecha.clone()));
        }
        for nregistro in self.nregistro.iter().flatten() {
            pairs.push(("nregistro", nregistro.clone()));
        }
        pairs
    }
}

/// Identifier and section of a segmented document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nregistro: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seccion: Option<String>,
}

impl DocQuery {
    fn has_identifier(&self) -> bool {
        non_blank(self.nregistro.as_deref()).is_some() || non_blank(self.cn.as_deref()).is_some()
    }
}

/// Output format for segmented document content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocFormat {
    #[default]
    Json,
    Html,
    Txt,
}

/// Segmented document content in the requested format
#[derive(Debug, Clone, PartialEq)]
pub enum DocContent {
    Json(Option<Payload>),
    Html(String),
    Text(String),
}

impl DocContent {
    /// Renders an upstream result in the requested format
    ///
    /// HTML concatenates the `contenido` of every section. Text emits each
    /// section's `titulo` followed by its tag-stripped `contenido`.
    pub fn render(result: Option<Payload>, format: DocFormat) -> Self {
        match format {
            DocFormat::Json => DocContent::Json(result),
            DocFormat::Html => DocContent::Html(match &result {
                Some(Payload::Json(Value::Array(sections))) if !sections.is_empty() => sections
                    .iter()
                    .filter_map(|s| s.get("contenido").and_then(Value::as_str))
                    .collect(),
                Some(Payload::Json(object @ Value::Object(_))) if object.get("contenido").is_some() => {
                    text_of(&object["contenido"])
                }
                other => fallback_text(other.as_ref()),
            }),
            DocFormat::Txt => DocContent::Text(match &result {
                Some(Payload::Json(Value::Array(sections))) if !sections.is_empty() => {
                    let mut out = String::new();
                    for section in sections.iter().filter(|s| s.is_object()) {
                        if let Some(titulo) = section.get("titulo") {
                            out.push_str(&text_of(titulo));
                            out.push('\n');
                        }
                        if let Some(contenido) = section.get("contenido") {
                            out.push_str(&strip_tags(&text_of(contenido)));
                            out.push_str("\n\n");
                        }
                    }
                    out.trim().to_string()
                }
                Some(Payload::Json(object @ Value::Object(_))) if object.get("contenido").is_some() => {
                    strip_tags(&text_of(&object["contenido"]))
                }
                other => fallback_text(other.as_ref()),
            }),
        }
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn fallback_text(result: Option<&Payload>) -> String {
    match result {
        None => String::new(),
        Some(Payload::Text(text)) => text.clone(),
        Some(Payload::Json(value)) => text_of(value),
    }
}

/// Removes `<...>` tags from HTML, leaving the text between them
pub fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find(['<', '>']) {
            Some(end) if end > 0 && after.as_bytes()[end] == b'>' => {
                rest = &after[end + 1..];
            }
            _ => {
                out.push('<');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Appends `segments` to `base`, each percent-encoded as a single segment
///
/// `/`, `?` and `#` inside a segment are escaped; `.` and `..` are refused.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, CimaError> {
    if let Some(bad) = segments
        .iter()
        .find(|s| s.is_empty() || **s == "." || **s == "..")
    {
        return Err(CimaError::InvalidArgument(format!(
            "Identificador inválido: '{bad}'"
        )));
    }
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| CimaError::InvalidArgument(format!("URL base inválida: {base}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// HTML documents live next to the REST root: `.../cima/rest` -> `.../cima`
fn html_base(base: &Url) -> Url {
    let mut html = base.clone();
    let ends_in_rest = base.path_segments().and_then(|mut s| s.next_back()) == Some("rest");
    if ends_in_rest {
        if let Ok(mut segments) = html.path_segments_mut() {
            segments.pop();
        }
    }
    html
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Full HTML documents published under `dochtml/`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HtmlDoc {
    /// Ficha técnica
    Ft,
    /// Prospecto
    P,
}

impl HtmlDoc {
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "ft" => Some(HtmlDoc::Ft),
            "p" => Some(HtmlDoc::P),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HtmlDoc::Ft => "ft",
            HtmlDoc::P => "p",
        }
    }

    /// Human-readable name used in error messages
    pub fn label(self) -> &'static str {
        match self {
            HtmlDoc::Ft => "Ficha técnica",
            HtmlDoc::P => "Prospecto",
        }
    }
}

/// Picture kinds listed in `fotos[].tipo`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    /// Pharmaceutical form
    Formafarmac,
    /// Box material
    Materialas,
}

impl ImageKind {
    pub const ALL: [ImageKind; 2] = [ImageKind::Formafarmac, ImageKind::Materialas];

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "formafarmac" => Some(ImageKind::Formafarmac),
            "materialas" => Some(ImageKind::Materialas),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImageKind::Formafarmac => "formafarmac",
            ImageKind::Materialas => "materialas",
        }
    }
}

/// An upstream body passed through as it arrives
pub struct DocStream {
    pub content_type: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, reqwest::Error>>,
}

impl std::fmt::Debug for DocStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocStream")
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// A document or picture fetched whole
#[derive(Debug, Clone)]
pub struct Download {
    /// Last segment of the source URL
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Array `field` of a medicine record, also looked up under `data`
fn record_list<'a>(record: &'a Value, field: &str) -> &'a [Value] {
    record
        .get(field)
        .or_else(|| record.get("data").and_then(|data| data.get(field)))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn content_type_of(response: &Response) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Client for the CIMA REST API
#[derive(Debug, Clone)]
pub struct CimaClient {
    /// HTTP client for making requests
    http_client: Client,
    /// Base URL for the API (overridable for tests and mirrors)
    base_url: Url,
    /// Base URL of the HTML documents (`dochtml/...`)
    html_base_url: Url,
}

impl CimaClient {
    /// Creates a client against the public CIMA API
    pub fn new() -> Result<Self, CimaError> {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    /// Creates a client against a custom base URL
    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, CimaError> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(crate::cache::USER_AGENT)
            .build()?;
        let base_url = Url::parse(base_url.into().trim_end_matches('/'))?;
        if base_url.cannot_be_a_base() {
            return Err(CimaError::InvalidArgument(format!(
                "URL base inválida: {base_url}"
            )));
        }
        let html_base_url = html_base(&base_url);
        Ok(Self {
            http_client,
            base_url,
            html_base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Sends a request and decodes the body
    ///
    /// # Returns
    /// * `Ok(None)` - upstream answered with an empty body
    /// * `Ok(Some(payload))` - JSON or text, see [`decode_body`]
    /// * `Err(CimaError::Status)` - any non-2xx answer
    async fn request<Q: Serialize + ?Sized>(
        &self,
        method: Method,
        segments: &[&str],
        query: Option<&Q>,
        body: Option<&Value>,
    ) -> Result<Option<Payload>, CimaError> {
        let endpoint = endpoint(&self.base_url, segments)?;
        let url = endpoint.to_string();
        debug!(%method, %url, "calling CIMA");

        let mut request = self.http_client.request(method, endpoint);
        if let Some(query) = query {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CimaError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let content_type = content_type_of(&response);
        let bytes = response.bytes().await?;

        decode_body(content_type.as_deref(), &bytes).map_err(|source| CimaError::Decode { url, source })
    }

    async fn get<Q: Serialize + ?Sized>(
        &self,
        segments: &[&str],
        query: &Q,
    ) -> Result<Option<Payload>, CimaError> {
        self.request(Method::GET, segments, Some(query), None).await
    }

    /// `GET /medicamentos` - paginated medicine search
    pub async fn medicamentos(
        &self,
        query: &MedicamentosQuery,
    ) -> Result<Option<Payload>, CimaError> {
        self.get(&["medicamentos"], query).await
    }

    /// `GET /medicamento` - full record of one medicine
    ///
    /// Requires `cn` or `nregistro`; blank values count as missing.
    pub async fn medicamento(
        &self,
        query: &MedicamentoQuery,
    ) -> Result<Option<Payload>, CimaError> {
        let query = query.cleaned();
        if query.cn.is_none() && query.nregistro.is_none() {
            return Err(CimaError::MissingIdentifier("'cn' o 'nregistro'"));
        }
        self.get(&["medicamento"], &query).await
    }

    /// `POST /buscarEnFichaTecnica` - search technical sheets by section text
    pub async fn buscar_en_ficha_tecnica(
        &self,
        rules: &[FichaRule],
    ) -> Result<Option<Payload>, CimaError> {
        if rules.is_empty() {
            return Err(CimaError::InvalidArgument(
                "Debe proporcionar al menos una regla de búsqueda.".to_string(),
            ));
        }
        if rules.iter().any(|rule| rule.contiene > 1) {
            return Err(CimaError::InvalidArgument(
                "El campo 'contiene' debe ser 1 (incluir) o 0 (excluir).".to_string(),
            ));
        }
        let body = serde_json::to_value(rules).map_err(|e| CimaError::InvalidArgument(e.to_string()))?;
        self.request::<()>(Method::POST, &["buscarEnFichaTecnica"], None, Some(&body))
            .await
    }

    /// `GET /presentaciones` - presentation listing
    pub async fn presentaciones(
        &self,
        query: &PresentacionesQuery,
    ) -> Result<Option<Payload>, CimaError> {
        self.get(&["presentaciones"], query).await
    }

    /// `GET /presentacion/{cn}` - one presentation
    pub async fn presentacion(&self, cn: &str) -> Result<Option<Payload>, CimaError> {
        let cn = non_blank(Some(cn)).ok_or(CimaError::MissingIdentifier("'cn'"))?;
        self.request::<()>(Method::GET, &["presentacion", cn.as_str()], None, None)
            .await
    }

    /// `GET /vmpp` - clinical descriptions; at least one criterion required
    pub async fn vmpp(&self, query: &VmppQuery) -> Result<Option<Payload>, CimaError> {
        if !query.has_criteria() {
            return Err(CimaError::InvalidArgument(
                "Se requiere al menos uno de los parámetros: practiv1, idpractiv1, dosis, forma, atc, nombre, modoArbol".to_string(),
            ));
        }
        self.get(&["vmpp"], query).await
    }

    /// `GET /maestras` - master catalogues
    pub async fn maestras(&self, query: &MaestrasQuery) -> Result<Option<Payload>, CimaError> {
        self.get(&["maestras"], query).await
    }

    /// `registroCambios` - change log, as a query string or a JSON body
    pub async fn registro_cambios(
        &self,
        query: &ChangeLogQuery,
        method: ChangeLogMethod,
    ) -> Result<Option<Payload>, CimaError> {
        match method {
            ChangeLogMethod::Get => self.get(&["registroCambios"], &query.pairs()).await,
            ChangeLogMethod::Post => {
                let body = serde_json::to_value(query)
                    .map_err(|e| CimaError::InvalidArgument(e.to_string()))?;
                self.request::<()>(Method::POST, &["registroCambios"], None, Some(&body))
                    .await
            }
        }
    }

    /// Supply problems
    ///
    /// # Behavior
    /// - Without `cn`: first page of the global listing (`psuministro`), with
    ///   every item of `resultados` enriched
    /// - With `cn`: `psuministro/v2/cn/{cn}`; a 404 yields an empty list
    /// - Records gain a type description and normalized start/end dates
    pub async fn psuministro(&self, cn: Option<&str>) -> Result<Value, CimaError> {
        let cn = non_blank(cn);
        let result = match &cn {
            Some(cn) => {
                self.request::<()>(Method::GET, &["psuministro", "v2", "cn", cn.as_str()], None, None)
                    .await
            }
            None => {
                self.get(
                    &["psuministro"],
                    &[("pagina", 1), ("tamanioPagina", SUPPLY_PAGE_SIZE)],
                )
                .await
            }
        };

        let mut raw = match result {
            Ok(payload) => payload_value(payload),
            Err(e) if cn.is_some() && e.is_not_found() => return Ok(Value::Array(Vec::new())),
            Err(CimaError::Status { status: 400, url }) => {
                return Err(CimaError::InvalidArgument(format!(
                    "Parámetros inválidos para {url}"
                )))
            }
            Err(e) => return Err(e),
        };

        if cn.is_some() {
            match &mut raw {
                Value::Array(items) => items.iter_mut().for_each(enrich_supply_problem),
                item => enrich_supply_problem(item),
            }
        } else if let Some(object) = raw.as_object_mut() {
            let resultados = object
                .entry("resultados")
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Some(items) = resultados.as_array_mut() {
                items.iter_mut().for_each(enrich_supply_problem);
            }
        }

        Ok(raw)
    }

    /// `GET /docSegmentado/secciones/{tipo_doc}` - sections of a document
    ///
    /// `tipo_doc` must be 1 to 4.
    pub async fn doc_secciones(
        &self,
        tipo_doc: u8,
        query: &DocQuery,
    ) -> Result<Option<Payload>, CimaError> {
        if !(1..=4).contains(&tipo_doc) {
            return Err(CimaError::InvalidArgument(format!(
                "tipo_doc debe estar entre 1 y 4, recibido: {tipo_doc}"
            )));
        }
        if !query.has_identifier() {
            return Err(CimaError::MissingIdentifier("'nregistro' o 'cn'"));
        }
        let query = DocQuery {
            nregistro: non_blank(query.nregistro.as_deref()),
            cn: non_blank(query.cn.as_deref()),
            seccion: None,
        };
        self.get(&["docSegmentado", "secciones", tipo_doc.to_string().as_str()], &query)
            .await
    }

    /// `GET /docSegmentado/contenido/{tipo_doc}` - section content
    ///
    /// `tipo_doc` must be 1 (technical sheet) or 2 (leaflet).
    pub async fn doc_contenido(
        &self,
        tipo_doc: u8,
        query: &DocQuery,
        format: DocFormat,
    ) -> Result<DocContent, CimaError> {
        if !query.has_identifier() {
            return Err(CimaError::MissingIdentifier("'nregistro' o 'cn'"));
        }
        if !(1..=2).contains(&tipo_doc) {
            return Err(CimaError::InvalidArgument(format!(
                "tipo_doc debe ser 1 o 2, recibido: {tipo_doc}"
            )));
        }
        let query = DocQuery {
            nregistro: non_blank(query.nregistro.as_deref()),
            cn: non_blank(query.cn.as_deref()),
            seccion: non_blank(query.seccion.as_deref()),
        };
        let result = self
            .get(&["docSegmentado", "contenido", tipo_doc.to_string().as_str()], &query)
            .await?;
        Ok(DocContent::render(result, format))
    }

    /// Safety notes of a medicine
    ///
    /// Tries `notas?nregistro=` first and falls back to `notas/{nregistro}`
    /// when that comes back empty.
    pub async fn notas(&self, nregistro: &str) -> Result<Option<Payload>, CimaError> {
        let nregistro = non_blank(Some(nregistro)).ok_or(CimaError::MissingIdentifier("'nregistro'"))?;
        let data = self.get(&["notas"], &[("nregistro", &nregistro)]).await?;
        if data.as_ref().map_or(true, Payload::is_empty) {
            debug!(%nregistro, "empty notes listing, trying path form");
            return self
                .request::<()>(Method::GET, &["notas", nregistro.as_str()], None, None)
                .await;
        }
        Ok(data)
    }

    /// Informative materials of a medicine, as a list
    ///
    /// Tries the query form, then the path form. A 404 means no materials.
    /// Returns `None` when nothing was found.
    pub async fn materiales(&self, nregistro: &str) -> Result<Option<Vec<Value>>, CimaError> {
        let nregistro = non_blank(Some(nregistro)).ok_or(CimaError::MissingIdentifier("'nregistro'"))?;

        let data = match self.fetch_materiales(&nregistro).await {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        let materials = match data {
            None => Vec::new(),
            Some(Payload::Json(Value::Object(mut object))) => match object.remove("materiales") {
                Some(Value::Array(items)) => items,
                Some(other) => {
                    object.insert("materiales".to_string(), other);
                    vec![Value::Object(object)]
                }
                None => vec![Value::Object(object)],
            },
            Some(Payload::Json(Value::Array(items))) => items,
            Some(Payload::Json(Value::Null)) => Vec::new(),
            Some(other) => vec![other.into_value()],
        };

        Ok(if materials.is_empty() { None } else { Some(materials) })
    }

    async fn fetch_materiales(&self, nregistro: &str) -> Result<Option<Payload>, CimaError> {
        let data = self.get(&["materiales"], &[("nregistro", nregistro)]).await?;
        if data.as_ref().map_or(true, Payload::is_empty) {
            return self
                .request::<()>(Method::GET, &["materiales", nregistro], None, None)
                .await;
        }
        Ok(data)
    }

    /// Full HTML of a technical sheet or leaflet, streamed
    ///
    /// `filename` may name a sub-directory (`1/FichaTecnica.html`). The
    /// status is checked before any byte is handed over.
    pub async fn doc_html(
        &self,
        doc: HtmlDoc,
        nregistro: &str,
        filename: &str,
    ) -> Result<DocStream, CimaError> {
        let nregistro = non_blank(Some(nregistro)).ok_or(CimaError::MissingIdentifier("'nregistro'"))?;
        let mut segments = vec!["dochtml", doc.as_str(), nregistro.as_str()];
        segments.extend(filename.split('/'));
        let url = endpoint(&self.html_base_url, &segments)?;
        debug!(%url, "streaming HTML document");

        let response = self.http_client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(CimaError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        Ok(DocStream {
            content_type: content_type_of(&response),
            body: response.bytes_stream().boxed(),
        })
    }

    /// URLs of the IPT documents listed in the record of `cn`
    pub async fn ipt_urls(&self, cn: &str) -> Result<Vec<String>, CimaError> {
        let record = self.record_by_cn(cn).await?;
        Ok(record_list(&record, "docs")
            .iter()
            .filter(|doc| doc.get("tipo").and_then(Value::as_u64) == Some(IPT_DOC_TYPE))
            .filter_map(|doc| doc.get("url").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Full-size picture URLs of the given kinds in the record of `cn`
    ///
    /// The record lists thumbnails; `/thumbnails/` is swapped for `/full/`.
    pub async fn imagen_urls(&self, cn: &str, kinds: &[ImageKind]) -> Result<Vec<String>, CimaError> {
        let record = self.record_by_cn(cn).await?;
        Ok(record_list(&record, "fotos")
            .iter()
            .filter(|foto| {
                foto.get("tipo")
                    .and_then(Value::as_str)
                    .and_then(ImageKind::parse)
                    .is_some_and(|kind| kinds.contains(&kind))
            })
            .filter_map(|foto| foto.get("url").and_then(Value::as_str))
            .map(|url| url.replace("/thumbnails/", "/full/"))
            .collect())
    }

    async fn record_by_cn(&self, cn: &str) -> Result<Value, CimaError> {
        let query = MedicamentoQuery {
            cn: Some(cn.to_string()),
            nregistro: None,
        };
        Ok(payload_value(self.medicamento(&query).await?))
    }

    /// Fetches a document or picture URL taken from an upstream record
    pub async fn download(&self, url: &str) -> Result<Download, CimaError> {
        let url = Url::parse(url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CimaError::InvalidArgument(format!("URL no soportada: {url}")));
        }
        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .unwrap_or("documento")
            .to_string();

        let response = self.http_client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(CimaError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        let content_type = content_type_of(&response);
        let bytes = response.bytes().await?;
        Ok(Download {
            file_name,
            content_type,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::{header, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    /// Serves `router` on an ephemeral local port and returns a client for it
    async fn client_for(router: Router) -> CimaClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Should bind");
        let addr = listener.local_addr().expect("Should have address");
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        CimaClient::with_base_url(format!("http://{addr}")).expect("Should build client")
    }

    #[test]
    fn test_decode_empty_body() {
        assert_eq!(decode_body(Some("application/json"), b"").unwrap(), None);
        assert_eq!(decode_body(None, b"").unwrap(), None);
    }

    #[test]
    fn test_decode_json_content_type() {
        let payload = decode_body(Some("application/json;charset=UTF-8"), br#"{"a":1}"#).unwrap();
        assert_eq!(payload, Some(Payload::Json(json!({"a": 1}))));
    }

    #[test]
    fn test_decode_malformed_json_is_error() {
        assert!(decode_body(Some("application/json"), b"{oops").is_err());
    }

    #[test]
    fn test_decode_sniffs_untyped_json() {
        let payload = decode_body(None, b"  [1, 2]").unwrap();
        assert_eq!(payload, Some(Payload::Json(json!([1, 2]))));

        let payload = decode_body(Some("text/plain"), b"{\"x\":true}").unwrap();
        assert_eq!(payload, Some(Payload::Json(json!({"x": true}))));
    }

    #[test]
    fn test_decode_untyped_broken_json_stays_text() {
        let payload = decode_body(None, b"{no es json").unwrap();
        assert_eq!(payload, Some(Payload::Text("{no es json".to_string())));
    }

    #[test]
    fn test_decode_html_is_text() {
        let payload = decode_body(Some("text/html"), b"[<p>hola</p>]").unwrap();
        assert_eq!(payload, Some(Payload::Text("[<p>hola</p>]".to_string())));
    }

    #[test]
    fn test_strip_tags() {
        assert_eq!(strip_tags("<p>Uno <b>dos</b></p>"), "Uno dos");
        assert_eq!(strip_tags("a < b y <> c"), "a < b y <> c");
        assert_eq!(strip_tags("sin etiquetas"), "sin etiquetas");
    }

    #[test]
    fn test_render_html_concatenates_sections() {
        let result = Some(Payload::Json(json!([
            {"seccion": "4.1", "contenido": "<p>A</p>"},
            {"seccion": "4.2", "contenido": "<p>B</p>"}
        ])));
        assert_eq!(
            DocContent::render(result, DocFormat::Html),
            DocContent::Html("<p>A</p><p>B</p>".to_string())
        );
    }

    #[test]
    fn test_render_txt_strips_tags() {
        let result = Some(Payload::Json(json!([
            {"titulo": "4.1 Indicaciones", "contenido": "<p>Dolor leve</p>"},
            {"titulo": "4.2 Posología", "contenido": "<ul><li>1 comprimido</li></ul>"}
        ])));
        assert_eq!(
            DocContent::render(result, DocFormat::Txt),
            DocContent::Text("4.1 Indicaciones\nDolor leve\n\n4.2 Posología\n1 comprimido".to_string())
        );

        let single = Some(Payload::Json(json!({"contenido": "<b>x</b>"})));
        assert_eq!(DocContent::render(single, DocFormat::Txt), DocContent::Text("x".to_string()));
    }

    #[test]
    fn test_vmpp_requires_criteria() {
        assert!(!VmppQuery::default().has_criteria());
        assert!(!VmppQuery { pagina: Some(2), ..Default::default() }.has_criteria());
        assert!(VmppQuery { atc: Some("N02".to_string()), ..Default::default() }.has_criteria());
        assert!(VmppQuery { modo_arbol: Some(1), ..Default::default() }.has_criteria());
    }

    #[test]
    fn test_query_serialization_skips_missing() {
        let query = MedicamentosQuery {
            nombre: Some("ibuprofeno".to_string()),
            comerc: Some(1),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&query).unwrap(),
            json!({"nombre": "ibuprofeno", "comerc": 1})
        );
    }

    #[test]
    fn test_change_log_pairs_repeat_nregistro() {
        let query = ChangeLogQuery {
            fecha: Some("01/06/2021".to_string()),
            nregistro: Some(vec!["1".to_string(), "2".to_string()]),
        };
        assert_eq!(
            query.pairs(),
            vec![
                ("fecha", "01/06/2021".to_string()),
                ("nregistro", "1".to_string()),
                ("nregistro", "2".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn test_medicamento_requires_identifier() {
        let client = CimaClient::with_base_url("http://127.0.0.1:9").expect("Should build client");
        let err = client
            .medicamento(&MedicamentoQuery { cn: Some("  ".to_string()), nregistro: None })
            .await
            .unwrap_err();
        assert!(matches!(err, CimaError::MissingIdentifier(_)));
    }

    #[tokio::test]
    async fn test_ficha_rules_validated_before_request() {
        let client = CimaClient::with_base_url("http://127.0.0.1:9").expect("Should build client");
        assert!(matches!(
            client.buscar_en_ficha_tecnica(&[]).await.unwrap_err(),
            CimaError::InvalidArgument(_)
        ));
        let rule = FichaRule { seccion: "4.1".to_string(), texto: "dolor".to_string(), contiene: 2 };
        assert!(matches!(
            client.buscar_en_ficha_tecnica(&[rule]).await.unwrap_err(),
            CimaError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_medicamento_sends_query_and_decodes_json() {
        let router = Router::new().route(
            "/medicamento",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                Json(json!({"cn": params.get("cn"), "nregistro": params.get("nregistro")}))
            }),
        );
        let client = client_for(router).await;

        let payload = client
            .medicamento(&MedicamentoQuery { cn: Some(" 712345 ".to_string()), nregistro: None })
            .await
            .expect("Should succeed");

        assert_eq!(
            payload,
            Some(Payload::Json(json!({"cn": "712345", "nregistro": null})))
        );
    }

    #[tokio::test]
    async fn test_status_error_carries_code() {
        let router = Router::new().route(
            "/presentacion/:cn",
            get(|| async { AxumStatus::NOT_FOUND }),
        );
        let client = client_for(router).await;

        let err = client.presentacion("000000").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    async fn test_empty_body_is_none() {
        let router = Router::new().route("/maestras", get(|| async { AxumStatus::OK }));
        let client = client_for(router).await;

        let payload = client.maestras(&MaestrasQuery::default()).await.expect("Should succeed");
        assert_eq!(payload, None);
    }

    #[tokio::test]
    async fn test_psuministro_detail_enriched_and_missing_is_empty() {
        let router = Router::new().route(
            "/psuministro/v2/cn/:cn",
            get(|Path(cn): Path<String>| async move {
                if cn == "404404" {
                    return AxumStatus::NOT_FOUND.into_response();
                }
                Json(json!({"cn": cn, "tipoProblemaSuministro": 2, "fini": 1622505600000_i64}))
                    .into_response()
            }),
        );
        let client = client_for(router).await;

        let detail = client.psuministro(Some("712345")).await.expect("Should succeed");
        assert_eq!(detail["tipoProblemaSuministro_descripcion"], json!("Suministro solo a hospitales"));
        assert_eq!(detail["fecha_inicio"], json!("2021-06-01T00:00:00+00:00"));

        let missing = client.psuministro(Some("404404")).await.expect("Should succeed");
        assert_eq!(missing, json!([]));
    }

    #[tokio::test]
    async fn test_psuministro_listing_requests_first_page() {
        let router = Router::new().route(
            "/psuministro",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                Json(json!({
                    "pagina": params.get("pagina"),
                    "tamanioPagina": params.get("tamanioPagina"),
                    "resultados": [{"tipoProblemaSuministro": 99, "ffin": 1625097600}]
                }))
            }),
        );
        let client = client_for(router).await;

        let listing = client.psuministro(None).await.expect("Should succeed");
        assert_eq!(listing["pagina"], json!("1"));
        assert_eq!(listing["tamanioPagina"], json!("20"));
        assert_eq!(listing["resultados"][0]["tipoProblemaSuministro_descripcion"], json!("Desconocido"));
        assert_eq!(listing["resultados"][0]["fecha_fin"], json!("2021-07-01T00:00:00+00:00"));
    }

    #[tokio::test]
    async fn test_notas_falls_back_to_path_form() {
        let router = Router::new()
            .route("/notas", get(|| async { Json(json!([])) }))
            .route(
                "/notas/:nregistro",
                get(|Path(nr): Path<String>| async move { Json(json!([{"nregistro": nr, "num": "MUH 1/2021"}])) }),
            );
        let client = client_for(router).await;

        let notes = client.notas("12345").await.expect("Should succeed");
        assert_eq!(
            notes,
            Some(Payload::Json(json!([{"nregistro": "12345", "num": "MUH 1/2021"}])))
        );
    }

    #[tokio::test]
    async fn test_materiales_unwraps_nested_list_and_404_is_none() {
        let router = Router::new()
            .route(
                "/materiales",
                get(|Query(params): Query<HashMap<String, String>>| async move {
                    match params.get("nregistro").map(String::as_str) {
                        Some("1") => Json(json!({"materiales": [{"nombre": "Guía"}]})).into_response(),
                        _ => (AxumStatus::NOT_FOUND, [(header::CONTENT_TYPE, "text/plain")], "").into_response(),
                    }
                }),
            );
        let client = client_for(router).await;

        let found = client.materiales("1").await.expect("Should succeed");
        assert_eq!(found, Some(vec![json!({"nombre": "Guía"})]));

        let missing = client.materiales("2").await.expect("Should succeed");
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn test_doc_contenido_rejects_bad_type() {
        let client = CimaClient::with_base_url("http://127.0.0.1:9").expect("Should build client");
        let query = DocQuery { nregistro: Some("1".to_string()), ..Default::default() };
        let err = client.doc_contenido(3, &query, DocFormat::Json).await.unwrap_err();
        assert!(matches!(err, CimaError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_identifiers_stay_inside_their_path_segment() {
        let router = Router::new()
            .route(
                "/presentacion/:cn",
                get(|Path(cn): Path<String>| async move { Json(json!({"cn": cn})) }),
            )
            .route("/maestras", get(|| async { Json(json!({"hit": "maestras"})) }));
        let client = client_for(router).await;

        let traversal = client.presentacion("../maestras").await.expect("Should succeed");
        assert_eq!(traversal, Some(Payload::Json(json!({"cn": "../maestras"}))));

        let query = client.presentacion("1?x=y").await.expect("Should succeed");
        assert_eq!(query, Some(Payload::Json(json!({"cn": "1?x=y"}))));

        let err = client.presentacion("..").await.unwrap_err();
        assert!(matches!(err, CimaError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_doc_html_refuses_dot_segments() {
        let client = CimaClient::with_base_url("http://127.0.0.1:9").expect("Should build client");
        let err = client
            .doc_html(HtmlDoc::Ft, "1", "../../rest/maestras")
            .await
            .unwrap_err();
        assert!(matches!(err, CimaError::InvalidArgument(_)));
    }

    #[test]
    fn test_endpoint_escapes_reserved_characters() {
        let base = Url::parse("https://cima.aemps.es/cima/rest/").expect("Should parse");
        let url = endpoint(&base, &["presentacion", "a/b?c#d"]).expect("Should build");
        assert_eq!(url.as_str(), "https://cima.aemps.es/cima/rest/presentacion/a%2Fb%3Fc%23d");
    }

    #[test]
    fn test_html_base_drops_rest_segment() {
        let base = Url::parse("https://cima.aemps.es/cima/rest").expect("Should parse");
        assert_eq!(html_base(&base).as_str(), "https://cima.aemps.es/cima");

        let other = Url::parse("http://127.0.0.1:8080").expect("Should parse");
        assert_eq!(html_base(&other).as_str(), "http://127.0.0.1:8080/");
    }
}
