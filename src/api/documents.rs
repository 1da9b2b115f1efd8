//! Binary and HTML documents proxied from CIMA
//!
//! HTML sheets are streamed through untouched. IPT reports and pictures are
//! fetched whole per national code; one file is returned as is, several as
//! a `multipart/mixed` body.

use axum::body::Body;
use axum::extract::rejection::PathRejection;
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use super::error::{ApiError, ApiResult};
use super::params::MultiQuery;
use super::AppState;
use crate::data::{CimaClient, CimaError, Download, HtmlDoc, ImageKind};

/// Per-code failures attached to a successful download response
pub const ERRORS_HEADER: HeaderName = HeaderName::from_static("x-cima-errors");

/// `GET /doc-html/:tipo/:nregistro/*filename` - full HTML sheet, streamed
pub async fn doc_html(
    State(state): State<AppState>,
    path: Result<Path<(String, String, String)>, PathRejection>,
) -> ApiResult<Response> {
    let Path((tipo, nregistro, filename)) =
        path.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let doc = HtmlDoc::parse(&tipo)
        .ok_or_else(|| ApiError::bad_request(format!("tipo debe ser 'ft' o 'p', recibido: {tipo}")))?;

    let stream = match state.client.doc_html(doc, &nregistro, &filename).await {
        Ok(stream) => stream,
        Err(e) if e.is_not_found() => {
            return Err(ApiError::not_found(
                format!("{} {nregistro} sección '{filename}' no encontrada", doc.label()),
                None,
            ))
        }
        Err(e) => return Err(e.into()),
    };

    let content_type = stream
        .content_type
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
        .unwrap_or_else(|| HeaderValue::from_static("text/html; charset=utf-8"));
    let mut response = Body::from_stream(stream.body).into_response();
    response.headers_mut().insert(CONTENT_TYPE, content_type);
    Ok(response)
}

/// A file ready to be returned, tagged with the code it belongs to
#[derive(Debug)]
struct Attachment {
    cn: String,
    download: Download,
    fallback_type: &'static str,
}

impl Attachment {
    fn content_type(&self) -> &str {
        self.download
            .content_type
            .as_deref()
            .unwrap_or(self.fallback_type)
    }
}

fn unique(codes: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(codes.len());
    for code in codes {
        if !out.contains(&code) {
            out.push(code);
        }
    }
    out
}

fn header_value(text: &str) -> Option<HeaderValue> {
    HeaderValue::from_bytes(text.as_bytes()).ok()
}

/// Builds the response for the collected files
///
/// No file is a 404 carrying the per-code errors. A single file is sent
/// with its own content type; several go out as `multipart/mixed`, with the
/// errors as a trailing JSON part.
fn attachments_response(
    attachments: Vec<Attachment>,
    errors: Map<String, Value>,
    bundle: &str,
    not_found: &str,
) -> ApiResult<Response> {
    if attachments.is_empty() {
        let codes: Vec<&String> = errors.keys().collect();
        return Err(ApiError::not_found(
            not_found,
            Some(json!({"not_found": codes, "errors": errors})),
        ));
    }

    if let [single] = attachments.as_slice() {
        let disposition = format!("attachment; filename=\"{}\"", single.download.file_name);
        let content_type = header_value(single.content_type());
        let mut response = (StatusCode::OK, single.download.bytes.clone()).into_response();
        let headers = response.headers_mut();
        if let Some(value) = content_type {
            headers.insert(CONTENT_TYPE, value);
        }
        if let Some(value) = header_value(&disposition) {
            headers.insert(CONTENT_DISPOSITION, value);
        }
        if !errors.is_empty() {
            if let Some(value) = header_value(&Value::Object(errors).to_string()) {
                headers.insert(ERRORS_HEADER, value);
            }
        }
        return Ok(response);
    }

    let boundary = format!("{bundle}-{:x}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
    let mut body: Vec<u8> = Vec::new();
    for attachment in &attachments {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(format!("Content-Type: {}\r\n", attachment.content_type()).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: attachment; filename=\"{}_{}\"\r\n\r\n",
                attachment.cn, attachment.download.file_name
            )
            .as_bytes(),
        );
        body.extend_from_slice(&attachment.download.bytes);
        body.extend_from_slice(b"\r\n");
    }
    if !errors.is_empty() {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(b"Content-Type: application/json\r\n");
        body.extend_from_slice(b"Content-Disposition: attachment; filename=\"errores.json\"\r\n\r\n");
        body.extend_from_slice(Value::Object(errors).to_string().as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    if let Some(value) = header_value(&format!("multipart/mixed; boundary={boundary}")) {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Some(value) = header_value(&format!("attachment; filename=\"{bundle}.multipart\"")) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn ipt_for(client: &CimaClient, cn: &str) -> Result<Option<Download>, CimaError> {
    let Some(url) = client.ipt_urls(cn).await?.into_iter().next() else {
        return Ok(None);
    };
    client.download(&url).await.map(Some)
}

/// `GET /descargar-ipt?cn=...` - IPT report of one or more codes
///
/// Codes are fetched one after another to stay gentle with upstream.
pub async fn descargar_ipt(
    State(state): State<AppState>,
    query: MultiQuery,
) -> ApiResult<Response> {
    let codes = unique(query.list("cn"));
    if codes.is_empty() {
        return Err(ApiError::bad_request("Debe proporcionar al menos un CN"));
    }
    info!(?codes, "descargar IPT");

    let mut attachments = Vec::new();
    let mut errors = Map::new();
    for cn in codes {
        match ipt_for(&state.client, &cn).await {
            Ok(Some(download)) => attachments.push(Attachment {
                cn,
                download,
                fallback_type: "application/pdf",
            }),
            Ok(None) => {
                errors.insert(cn, json!({"detail": "sin IPT"}));
            }
            Err(e) => {
                debug!(%cn, error = %e, "IPT download failed");
                errors.insert(cn, json!({"detail": e.to_string()}));
            }
        }
    }

    attachments_response(attachments, errors, "ipts", "No se encontró ningún IPT")
}

async fn images_for(
    client: &CimaClient,
    cn: &str,
    kinds: &[ImageKind],
) -> Result<Vec<Download>, CimaError> {
    let mut downloads = Vec::new();
    for url in client.imagen_urls(cn, kinds).await? {
        downloads.push(client.download(&url).await?);
    }
    Ok(downloads)
}

/// `GET /descargar-imagenes?cn=...&tipos=formafarmac,materialas`
pub async fn descargar_imagenes(
    State(state): State<AppState>,
    query: MultiQuery,
) -> ApiResult<Response> {
    let codes = unique(query.list("cn"));
    if codes.is_empty() {
        return Err(ApiError::bad_request("Debe proporcionar al menos un CN"));
    }
    let requested = query.list("tipos");
    let kinds: Vec<ImageKind> = if requested.is_empty() {
        ImageKind::ALL.to_vec()
    } else {
        requested.iter().filter_map(|t| ImageKind::parse(t)).collect()
    };
    if kinds.is_empty() {
        return Err(ApiError::bad_request(
            "tipos debe contener 'formafarmac' o 'materialas'",
        ));
    }

    let mut attachments = Vec::new();
    let mut errors = Map::new();
    for cn in codes {
        match images_for(&state.client, &cn, &kinds).await {
            Ok(downloads) if downloads.is_empty() => {
                errors.insert(cn, json!({"detail": "sin imágenes"}));
            }
            Ok(downloads) => attachments.extend(downloads.into_iter().map(|download| Attachment {
                cn: cn.clone(),
                download,
                fallback_type: "image/jpeg",
            })),
            Err(e) => {
                debug!(%cn, error = %e, "image download failed");
                errors.insert(cn, json!({"detail": e.to_string()}));
            }
        }
    }

    attachments_response(
        attachments,
        errors,
        "imagenes",
        "No se encontró ninguna imagen para los CN proporcionados",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn attachment(cn: &str, name: &str) -> Attachment {
        Attachment {
            cn: cn.to_string(),
            download: Download {
                file_name: name.to_string(),
                content_type: None,
                bytes: Bytes::from(format!("%PDF-{name}")),
            },
            fallback_type: "application/pdf",
        }
    }

    #[test]
    fn test_unique_keeps_order() {
        let codes = vec!["2".to_string(), "1".to_string(), "2".to_string()];
        assert_eq!(unique(codes), vec!["2", "1"]);
    }

    #[test]
    fn test_no_attachments_is_not_found() {
        let mut errors = Map::new();
        errors.insert("9".to_string(), json!({"detail": "sin IPT"}));

        let err = attachments_response(Vec::new(), errors, "ipts", "nada").unwrap_err();

        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_single_attachment_carries_errors_header() {
        let mut errors = Map::new();
        errors.insert("9".to_string(), json!({"detail": "sin IPT"}));

        let response =
            attachments_response(vec![attachment("1", "a.pdf")], errors, "ipts", "nada").expect("Should respond");

        assert_eq!(response.headers()[CONTENT_TYPE], "application/pdf");
        assert_eq!(
            response.headers()[CONTENT_DISPOSITION],
            "attachment; filename=\"a.pdf\""
        );
        assert!(response.headers().contains_key(ERRORS_HEADER));
    }

    #[tokio::test]
    async fn test_several_attachments_are_multipart() {
        let response = attachments_response(
            vec![attachment("1", "a.pdf"), attachment("2", "b.pdf")],
            Map::new(),
            "ipts",
            "nada",
        )
        .expect("Should respond");

        let content_type = response.headers()[CONTENT_TYPE].to_str().expect("ascii").to_string();
        assert!(content_type.starts_with("multipart/mixed; boundary=ipts-"));
        let boundary = content_type.trim_start_matches("multipart/mixed; boundary=");

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Should read body");
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("filename=\"1_a.pdf\""));
        assert!(body.contains("%PDF-b.pdf"));
        assert!(body.ends_with(&format!("--{boundary}--\r\n")));
        assert!(!body.contains("errores.json"));
    }
}
