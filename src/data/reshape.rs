//! In-place rewriting of upstream records
//!
//! Upstream records are passed through untouched except for their date
//! fields, which go through the timestamp normalizer, and a few coded fields
//! that gain a human-readable description next to them.

use serde_json::Value;

use super::timestamp::{normalize_in_place, normalize_timestamp, parse_date_string};

/// Supply problem type codes and their descriptions
pub const SUPPLY_PROBLEM_TYPES: [(u8, &str); 9] = [
    (1, "Consultar Nota Informativa"),
    (2, "Suministro solo a hospitales"),
    (3, "El médico prescriptor deberá determinar la posibilidad de utilizar otros tratamientos comercializados"),
    (4, "Desabastecimiento temporal"),
    (5, "Existe/n otro/s medicamento/s con el mismo principio activo y para la misma vía de administración"),
    (6, "Existe/n otro/s medicamento/s con los mismos principios activos y para la misma vía de administración"),
    (7, "Se puede solicitar como medicamento extranjero"),
    (8, "Se recomienda restringir su prescripción reservándolo para casos en que no exista una alternativa apropiada"),
    (9, "El titular de autorización de comercialización está realizando una distribución controlada al existir unidades limitadas"),
];

/// Change log `tipoCambio` codes
const CHANGE_TYPES: [(u64, &str); 3] = [(1, "Nuevo"), (2, "Baja"), (3, "Modificado")];

/// Change log `cambio` codes
const CHANGE_CODES: [(&str, &str); 8] = [
    ("estado", "Estado de autorización"),
    ("comerc", "Estado de comercialización"),
    ("prosp", "Prospecto"),
    ("ft", "Ficha técnica"),
    ("psum", "Problemas de suministro"),
    ("notasSeguridad", "Notas de seguridad"),
    ("matinf", "Materiales informativos"),
    ("otros", "Otros"),
];

/// Looks up a supply problem description, `"Desconocido"` when unknown
pub fn supply_problem_description(code: &Value) -> &'static str {
    code.as_u64()
        .and_then(|code| SUPPLY_PROBLEM_TYPES.iter().find(|(c, _)| u64::from(*c) == code))
        .map(|(_, text)| *text)
        .unwrap_or("Desconocido")
}

/// Normalizes every value of an `estado` object (`aut`, `susp`, `rev`, ...)
fn normalize_estado(record: &mut Value) {
    if let Some(estado) = record.get_mut("estado").and_then(Value::as_object_mut) {
        for value in estado.values_mut() {
            normalize_in_place(value);
        }
    }
}

/// Normalizes the `fecha` field of every element of an array field
fn normalize_dated_list(record: &mut Value, field: &str) {
    if let Some(items) = record.get_mut(field).and_then(Value::as_array_mut) {
        for item in items {
            if let Some(fecha) = item.get_mut("fecha") {
                normalize_in_place(fecha);
            }
        }
    }
}

/// Rewrites the date fields of a medicine or presentation record
///
/// Covers `estado.*`, `docs[].fecha`, `fotos[].fecha`,
/// `presentaciones[].estado.*` and `detalleProblemaSuministro.{ini,fini}`.
/// Non-object input is left alone.
pub fn normalize_record_dates(record: &mut Value) {
    if !record.is_object() {
        return;
    }

    normalize_estado(record);
    normalize_dated_list(record, "docs");
    normalize_dated_list(record, "fotos");

    if let Some(presentaciones) = record.get_mut("presentaciones").and_then(Value::as_array_mut) {
        for presentacion in presentaciones {
            normalize_estado(presentacion);
        }
    }

    if let Some(detail) = record
        .get_mut("detalleProblemaSuministro")
        .and_then(Value::as_object_mut)
    {
        for key in ["ini", "fini"] {
            if let Some(value) = detail.get_mut(key) {
                normalize_in_place(value);
            }
        }
    }
}

/// Applies [`normalize_record_dates`] to every item of a `resultados` listing
pub fn normalize_listing_dates(listing: &mut Value) {
    if let Some(items) = listing.get_mut("resultados").and_then(Value::as_array_mut) {
        for item in items {
            normalize_record_dates(item);
        }
    }
}

/// Enriches a supply problem record
///
/// Adds `tipoProblemaSuministro_descripcion` and replaces `fini`/`ffin` with
/// normalized `fecha_inicio`/`fecha_fin`.
pub fn enrich_supply_problem(item: &mut Value) {
    let Some(object) = item.as_object_mut() else {
        return;
    };

    let description = supply_problem_description(
        object.get("tipoProblemaSuministro").unwrap_or(&Value::Null),
    );
    object.insert(
        "tipoProblemaSuministro_descripcion".to_string(),
        Value::String(description.to_string()),
    );

    if let Some(start) = object.remove("fini") {
        object.insert("fecha_inicio".to_string(), normalize_timestamp(&start));
    }
    if let Some(end) = object.remove("ffin") {
        object.insert("fecha_fin".to_string(), normalize_timestamp(&end));
    }
}

/// Annotates a change log entry with readable descriptions
///
/// Adds `tipoCambioDesc` for known codes, `cambioDesc` mirroring the `cambio`
/// list, and `fechaStr` as `dd/mm/YYYY HH:MM:SS` (null when the date cannot
/// be read).
pub fn annotate_change(item: &mut Value) {
    let Some(object) = item.as_object_mut() else {
        return;
    };

    if let Some(text) = object
        .get("tipoCambio")
        .and_then(Value::as_u64)
        .and_then(|code| CHANGE_TYPES.iter().find(|(c, _)| *c == code))
        .map(|(_, text)| *text)
    {
        object.insert("tipoCambioDesc".to_string(), Value::String(text.to_string()));
    }

    if let Some(codes) = object.get("cambio").and_then(Value::as_array) {
        let descriptions: Vec<Value> = codes
            .iter()
            .map(|code| match code.as_str() {
                Some(code) => Value::String(
                    CHANGE_CODES
                        .iter()
                        .find(|(c, _)| *c == code)
                        .map(|(_, text)| text.to_string())
                        .unwrap_or_else(|| code.to_string()),
                ),
                None => code.clone(),
            })
            .collect();
        object.insert("cambioDesc".to_string(), Value::Array(descriptions));
    }

    let fecha_str = object
        .get("fecha")
        .map(normalize_timestamp)
        .as_ref()
        .and_then(Value::as_str)
        .and_then(parse_date_string)
        .map(|dt| Value::String(dt.format("%d/%m/%Y %H:%M:%S").to_string()))
        .unwrap_or(Value::Null);
    object.insert("fechaStr".to_string(), fecha_str);
}
