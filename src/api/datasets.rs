//! Searches over the locally cached reference tables

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{ApiError, ApiResult};
use super::params::ApiQuery;
use super::AppState;
use crate::data::{nomenclator_columns as nom, presentaciones_columns as pres};
use crate::data::{Envelope, Metadata, Selection};

/// Default page size of the table searches
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Largest page size accepted
pub const MAX_PAGE_SIZE: usize = 100;

/// Result page of a table search
pub type TablePage = Envelope<Vec<Map<String, Value>>>;

/// Validates pagination, returning `(page, page_size)`
fn pagination(pagina: Option<usize>, page_size: Option<usize>) -> ApiResult<(usize, usize)> {
    let pagina = pagina.unwrap_or(1);
    let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if pagina < 1 {
        return Err(ApiError::bad_request("pagina debe ser mayor o igual que 1"));
    }
    if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(ApiError::bad_request(format!(
            "page_size debe estar entre 1 y {MAX_PAGE_SIZE}"
        )));
    }
    Ok((pagina, page_size))
}

fn filled(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Search parameters of `GET /identificar-medicamento`
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct IdentificarQuery {
    pub nregistro: Option<String>,
    pub cn: Option<String>,
    pub nombre: Option<String>,
    pub laboratorio: Option<String>,
    pub atc: Option<String>,
    pub estado: Option<String>,
    pub comercializado: Option<bool>,
    pub pagina: Option<usize>,
    pub page_size: Option<usize>,
}

/// `GET /identificar-medicamento` - search the presentations spreadsheet
///
/// `nregistro` and `cn` match exactly; `laboratorio`, `atc` and `estado` by
/// substring; `nombre` ignores case and accents.
pub async fn identificar_medicamento(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<IdentificarQuery>,
) -> ApiResult<Json<TablePage>> {
    let (pagina, page_size) = pagination(query.pagina, query.page_size)?;

    let mut selection: Selection<'_> = state.datasets.presentaciones.select();
    if let Some(nregistro) = filled(&query.nregistro) {
        selection = selection.exact(pres::NREGISTRO, nregistro)?;
    }
    if let Some(cn) = filled(&query.cn) {
        selection = selection.exact(pres::CN, cn)?;
    }
    if let Some(laboratorio) = filled(&query.laboratorio) {
        selection = selection.contains(pres::LABORATORIO, laboratorio)?;
    }
    if let Some(atc) = filled(&query.atc) {
        selection = selection.contains(pres::ATC, atc)?;
    }
    if let Some(estado) = filled(&query.estado) {
        selection = selection.contains(pres::ESTADO, estado)?;
    }
    if let Some(comercializado) = query.comercializado {
        selection = selection.flag(pres::COMERCIALIZADO, comercializado)?;
    }
    if let Some(nombre) = filled(&query.nombre) {
        selection = selection.name_matches(pres::PRESENTACION, nombre, page_size)?;
    }

    let total = selection.total();
    let data = selection.page(pagina, page_size);
    let params = IdentificarParams {
        query: IdentificarQuery {
            pagina: Some(pagina),
            page_size: Some(page_size),
            ..query
        },
        total,
    };
    Ok(Json(Envelope::new(data, Metadata::new(&params))))
}

#[derive(Serialize)]
struct IdentificarParams {
    #[serde(flatten)]
    query: IdentificarQuery,
    total: usize,
}

/// Search parameters of `GET /nomenclator`
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct NomenclatorQuery {
    pub codigo_nacional: Option<String>,
    pub nombre_producto: Option<String>,
    pub tipo_farmaco: Option<String>,
    pub principio_activo: Option<String>,
    pub codigo_laboratorio: Option<String>,
    pub nombre_laboratorio: Option<String>,
    pub estado: Option<String>,
    /// `dd/mm/yyyy`
    pub fecha_alta_desde: Option<String>,
    pub fecha_alta_hasta: Option<String>,
    pub fecha_baja_desde: Option<String>,
    pub fecha_baja_hasta: Option<String>,
    pub aportacion_beneficiario: Option<String>,
    pub precio_min_iva: Option<f64>,
    pub precio_max_iva: Option<f64>,
    pub agrupacion_codigo: Option<String>,
    pub agrupacion_nombre: Option<String>,
    pub diagnostico_hospitalario: Option<bool>,
    pub larga_duracion: Option<bool>,
    pub especial_control: Option<bool>,
    pub medicamento_huerfano: Option<bool>,
    pub pagina: Option<usize>,
    pub page_size: Option<usize>,
}

/// `GET /nomenclator` - search the billing nomenclátor
pub async fn buscar_nomenclator(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<NomenclatorQuery>,
) -> ApiResult<Json<TablePage>> {
    let (pagina, page_size) = pagination(query.pagina, query.page_size)?;

    let mut selection: Selection<'_> = state.datasets.nomenclator.select();

    let exact = [
        (&query.codigo_nacional, nom::CODIGO_NACIONAL),
        (&query.codigo_laboratorio, nom::CODIGO_LABORATORIO),
        (&query.agrupacion_codigo, nom::AGRUPACION_CODIGO),
    ];
    for (value, column) in exact {
        if let Some(value) = filled(value) {
            selection = selection.exact(column, value)?;
        }
    }

    let partial = [
        (&query.nombre_producto, nom::NOMBRE_PRODUCTO),
        (&query.tipo_farmaco, nom::TIPO_FARMACO),
        (&query.principio_activo, nom::PRINCIPIO_ACTIVO),
        (&query.nombre_laboratorio, nom::NOMBRE_LABORATORIO),
        (&query.estado, nom::ESTADO),
        (&query.aportacion_beneficiario, nom::APORTACION),
        (&query.agrupacion_nombre, nom::AGRUPACION_NOMBRE),
    ];
    for (value, column) in partial {
        if let Some(value) = filled(value) {
            selection = selection.contains(column, value)?;
        }
    }

    if query.precio_min_iva.is_some() || query.precio_max_iva.is_some() {
        selection = selection.numeric_range(nom::PRECIO_IVA, query.precio_min_iva, query.precio_max_iva)?;
    }

    let flags = [
        (query.diagnostico_hospitalario, nom::DIAGNOSTICO_HOSPITALARIO),
        (query.larga_duracion, nom::LARGA_DURACION),
        (query.especial_control, nom::ESPECIAL_CONTROL),
        (query.medicamento_huerfano, nom::HUERFANO),
    ];
    for (flag, column) in flags {
        if let Some(flag) = flag {
            selection = selection.flag(column, flag)?;
        }
    }

    let alta = (filled(&query.fecha_alta_desde), filled(&query.fecha_alta_hasta));
    if alta.0.is_some() || alta.1.is_some() {
        selection = selection.date_range(nom::FECHA_ALTA, alta.0, alta.1)?;
    }
    let baja = (filled(&query.fecha_baja_desde), filled(&query.fecha_baja_hasta));
    if baja.0.is_some() || baja.1.is_some() {
        selection = selection.date_range(nom::FECHA_BAJA, baja.0, baja.1)?;
    }

    let total = selection.total();
    let data = selection.page(pagina, page_size);
    let params = NomenclatorParams {
        query: NomenclatorQuery {
            pagina: Some(pagina),
            page_size: Some(page_size),
            ..query
        },
        total,
    };
    Ok(Json(Envelope::new(data, Metadata::new(&params))))
}

#[derive(Serialize)]
struct NomenclatorParams {
    #[serde(flatten)]
    query: NomenclatorQuery,
    total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_defaults_and_bounds() {
        assert_eq!(pagination(None, None).unwrap(), (1, 10));
        assert_eq!(pagination(Some(3), Some(100)).unwrap(), (3, 100));
        assert!(pagination(Some(0), None).is_err());
        assert!(pagination(None, Some(0)).is_err());
        assert!(pagination(None, Some(101)).is_err());
    }

    #[test]
    fn test_filled_ignores_blank() {
        assert_eq!(filled(&Some("  ".to_string())), None);
        assert_eq!(filled(&Some(" x ".to_string())), Some("x"));
        assert_eq!(filled(&None), None);
    }
}
