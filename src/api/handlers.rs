//! Handlers for the endpoints that proxy the CIMA API

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::bulk::fan_out;
use super::error::{ApiError, ApiResult};
use super::params::{split_list, ApiQuery, MultiQuery};
use super::AppState;
use crate::data::reshape::{annotate_change, normalize_listing_dates, normalize_record_dates};
use crate::data::{
    payload_value, ChangeLogMethod, ChangeLogQuery, CimaError, DocContent, DocFormat, DocQuery, Envelope,
    FichaRule, MaestrasQuery, MedicamentoQuery, MedicamentosQuery, Metadata, Payload,
    PresentacionesQuery, VmppQuery,
};

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// Empty listing returned when upstream sends no body
fn empty_listing(pagina: u32) -> Value {
    json!({"totalFilas": 0, "pagina": pagina, "tamanioPagina": 0, "resultados": []})
}

fn tipo_doc(path: Result<Path<u8>, PathRejection>) -> ApiResult<u8> {
    path.map(|Path(tipo)| tipo)
        .map_err(|e| ApiError::bad_request(format!("tipo_doc inválido: {}", e.body_text())))
}

/// `GET /medicamento?cn=&nregistro=`
pub async fn medicamento(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<MedicamentoQuery>,
) -> ApiResult<Json<Value>> {
    let query = query.cleaned();
    if query.is_empty() {
        return Err(ApiError::bad_request(
            "Debe indicar al menos 'cn' o 'nregistro'.",
        ));
    }
    info!(cn = ?query.cn, nregistro = ?query.nregistro, "medicamento");

    let mut record = payload_value(state.client.medicamento(&query).await?);
    normalize_record_dates(&mut record);
    Ok(Json(Metadata::new(&query).attach(record)))
}

/// `GET /medicamentos`
pub async fn medicamentos(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<MedicamentosQuery>,
) -> ApiResult<Json<Value>> {
    let mut listing = payload_value(state.client.medicamentos(&query).await?);
    normalize_listing_dates(&mut listing);
    Ok(Json(Metadata::new(&query).attach(listing)))
}

/// `POST /ficha-tecnica/buscar` with a JSON array of rules
pub async fn buscar_en_ficha_tecnica(
    State(state): State<AppState>,
    rules: Result<Json<Vec<FichaRule>>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(rules) = rules?;
    let result = payload_value(state.client.buscar_en_ficha_tecnica(&rules).await?);
    Ok(Json(Metadata::new(&json!({"reglas": rules})).attach(result)))
}

/// `GET /presentaciones`
pub async fn presentaciones(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<PresentacionesQuery>,
) -> ApiResult<Json<Value>> {
    let mut listing = match state.client.presentaciones(&query).await? {
        Some(payload) => payload.into_value(),
        None => empty_listing(query.pagina.unwrap_or(1)),
    };
    normalize_listing_dates(&mut listing);
    Ok(Json(Metadata::new(&query).attach(listing)))
}

/// `GET /presentacion?cn=...` with one or more national codes
///
/// A single code returns the record itself; several return `{data, errors}`
/// keyed by code.
pub async fn presentacion(
    State(state): State<AppState>,
    query: MultiQuery,
) -> ApiResult<Response> {
    let codes = query.list("cn");
    match codes.as_slice() {
        [] => Err(ApiError::bad_request("Debe indicar al menos un 'cn'.")),
        [cn] => {
            let mut record = payload_value(state.client.presentacion(cn).await?);
            normalize_record_dates(&mut record);
            Ok(Json(Metadata::new(&json!({"cn": cn})).attach(record)).into_response())
        }
        _ => {
            let client = &state.client;
            let out = fan_out(&codes, "sin datos", |cn| async move {
                let Some(payload) = client.presentacion(&cn).await? else {
                    return Ok(None);
                };
                let mut record = payload.into_value();
                normalize_record_dates(&mut record);
                Ok::<_, CimaError>(Some(record))
            })
            .await
            .require_any("Ninguna presentación encontrada")?;

            let envelope = Envelope::new(out.data, Metadata::new(&json!({"cn": codes})))
                .with_errors(out.errors);
            Ok(Json(envelope).into_response())
        }
    }
}

/// `GET /vmpp`
pub async fn vmpp(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<VmppQuery>,
) -> ApiResult<Json<Value>> {
    let result = payload_value(state.client.vmpp(&query).await?);
    Ok(Json(Metadata::new(&query).attach(result)))
}

/// `GET /maestras`
pub async fn maestras(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<MaestrasQuery>,
) -> ApiResult<Json<Value>> {
    let result = payload_value(state.client.maestras(&query).await?);
    Ok(Json(Metadata::new(&query).attach(result)))
}

#[derive(Serialize)]
struct ChangeLogParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    fecha: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nregistro: Option<&'a [String]>,
    metodo: ChangeLogMethod,
}

/// `GET /registro-cambios?fecha=&nregistro=...&metodo=GET|POST`
pub async fn registro_cambios(
    State(state): State<AppState>,
    query: MultiQuery,
) -> ApiResult<Json<Value>> {
    let method = match query.first("metodo").map(|m| m.to_ascii_uppercase()) {
        None => ChangeLogMethod::Get,
        Some(m) if m == "GET" => ChangeLogMethod::Get,
        Some(m) if m == "POST" => ChangeLogMethod::Post,
        Some(m) => {
            return Err(ApiError::bad_request(format!(
                "metodo debe ser GET o POST, recibido: {m}"
            )))
        }
    };
    let nregistro = query.list("nregistro");
    let change_query = ChangeLogQuery {
        fecha: query.first("fecha"),
        nregistro: (!nregistro.is_empty()).then_some(nregistro),
    };

    let mut listing = match state.client.registro_cambios(&change_query, method).await? {
        Some(payload) => payload.into_value(),
        None => empty_listing(1),
    };
    if let Some(items) = listing.get_mut("resultados").and_then(Value::as_array_mut) {
        items.iter_mut().for_each(annotate_change);
    }

    let params = ChangeLogParams {
        fecha: change_query.fecha.as_deref(),
        nregistro: change_query.nregistro.as_deref(),
        metodo: method,
    };
    Ok(Json(Metadata::new(&params).attach(listing)))
}

/// `GET /problemas-suministro[?cn=...]`
///
/// Without codes returns the first page of the global listing; with codes
/// returns `{data, errors}` keyed by code.
pub async fn problemas_suministro(
    State(state): State<AppState>,
    query: MultiQuery,
) -> ApiResult<Json<Envelope<Value>>> {
    let codes = query.list("cn");
    let cn_param = if codes.is_empty() { Value::Null } else { json!(codes) };
    let metadata = Metadata::supply(&json!({"cn": cn_param}));

    if codes.is_empty() {
        let mut listing = state.client.psuministro(None).await?;
        let data = listing
            .get_mut("resultados")
            .map(Value::take)
            .unwrap_or_else(|| Value::Array(Vec::new()));
        return Ok(Json(Envelope::new(data, metadata)));
    }

    let client = &state.client;
    let out = fan_out(&codes, "sin datos", |cn| async move {
        client.psuministro(Some(&cn)).await.map(Some)
    })
    .await
    .require_any("Ningún problema de suministro encontrado")?;

    Ok(Json(
        Envelope::new(Value::Object(out.data), metadata).with_errors(out.errors),
    ))
}

/// `GET /doc-secciones/:tipo_doc?nregistro=&cn=`
pub async fn doc_secciones(
    State(state): State<AppState>,
    path: Result<Path<u8>, PathRejection>,
    ApiQuery(query): ApiQuery<DocQuery>,
) -> ApiResult<Json<Value>> {
    let tipo_doc = tipo_doc(path)?;
    let result = payload_value(state.client.doc_secciones(tipo_doc, &query).await?);
    let params = json!({"tipo_doc": tipo_doc, "nregistro": query.nregistro, "cn": query.cn});
    Ok(Json(Metadata::new(&params).attach(result)))
}

/// Query of `GET /doc-contenido/:tipo_doc`
#[derive(Debug, Default, Deserialize)]
pub struct DocContentQuery {
    pub nregistro: Option<String>,
    pub cn: Option<String>,
    pub seccion: Option<String>,
    #[serde(default)]
    pub format: DocFormat,
}

/// `GET /doc-contenido/:tipo_doc?nregistro=&cn=&seccion=&format=json|html|txt`
pub async fn doc_contenido(
    State(state): State<AppState>,
    path: Result<Path<u8>, PathRejection>,
    ApiQuery(query): ApiQuery<DocContentQuery>,
) -> ApiResult<Response> {
    let tipo_doc = tipo_doc(path)?;
    let doc_query = DocQuery {
        nregistro: query.nregistro,
        cn: query.cn,
        seccion: query.seccion,
    };

    let content = state
        .client
        .doc_contenido(tipo_doc, &doc_query, query.format)
        .await?;

    Ok(match content {
        DocContent::Json(result) => {
            let mut params = serde_json::to_value(&doc_query).unwrap_or_else(|_| json!({}));
            if let Some(object) = params.as_object_mut() {
                object.insert("tipo_doc".to_string(), json!(tipo_doc));
            }
            Json(Metadata::new(&params).attach(payload_value(result))).into_response()
        }
        DocContent::Html(html) => {
            ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], html).into_response()
        }
        DocContent::Text(text) => {
            ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], text).into_response()
        }
    })
}

async fn notas_for(state: &AppState, registros: Vec<String>) -> ApiResult<Json<Envelope<Value>>> {
    if registros.is_empty() {
        return Err(ApiError::bad_request("Se requiere al menos un 'nregistro'."));
    }
    let client = &state.client;
    let out = fan_out(&registros, "sin notas", |nregistro| async move {
        let notes = client.notas(&nregistro).await?;
        Ok::<_, CimaError>(notes.filter(|n| !n.is_empty()).map(Payload::into_value))
    })
    .await
    .require_any("Ninguna nota encontrada")?;

    let metadata = Metadata::new(&json!({"nregistro": registros}));
    Ok(Json(
        Envelope::new(Value::Object(out.data), metadata).with_errors(out.errors),
    ))
}

/// `GET /notas?nregistro=...`
pub async fn notas(
    State(state): State<AppState>,
    query: MultiQuery,
) -> ApiResult<Json<Envelope<Value>>> {
    notas_for(&state, query.list("nregistro")).await
}

/// `GET /notas/:nregistros` with a comma-separated list
pub async fn notas_path(
    State(state): State<AppState>,
    Path(nregistros): Path<String>,
) -> ApiResult<Json<Envelope<Value>>> {
    notas_for(&state, split_list(&nregistros)).await
}

/// `GET /materiales?nregistro=...`
pub async fn materiales(
    State(state): State<AppState>,
    query: MultiQuery,
) -> ApiResult<Json<Envelope<Value>>> {
    let registros = query.list("nregistro");
    if registros.is_empty() {
        return Err(ApiError::bad_request("Se requiere al menos un 'nregistro'."));
    }

    let client = &state.client;
    let out = fan_out(&registros, "sin materiales", |nregistro| async move {
        Ok::<_, CimaError>(client.materiales(&nregistro).await?.map(Value::Array))
    })
    .await
    .require_any("Ningún material asociado")?;

    let metadata = Metadata::new(&json!({"nregistro": registros}));
    Ok(Json(
        Envelope::new(Value::Object(out.data), metadata).with_errors(out.errors),
    ))
}

/// `GET /materiales/:nregistro`
pub async fn materiales_path(
    State(state): State<AppState>,
    Path(nregistro): Path<String>,
) -> ApiResult<Json<Value>> {
    let materials = state
        .client
        .materiales(&nregistro)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(
                "Ningún material asociado",
                Some(json!({"not_found_nregistro": [nregistro]})),
            )
        })?;

    let result = json!({"nregistro": nregistro, "materiales": materials});
    Ok(Json(Metadata::new(&json!({"nregistro": nregistro})).attach(result)))
}
