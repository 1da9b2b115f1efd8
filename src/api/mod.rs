//! REST surface of the service
//!
//! Every route answers JSON except `/doc-contenido` in `html`/`txt` format,
//! `/doc-html` and the file downloads.

mod bulk;
mod datasets;
mod documents;
mod error;
mod handlers;
mod params;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::data::{CimaClient, Datasets};

pub use datasets::{IdentificarQuery, NomenclatorQuery, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
pub use documents::ERRORS_HEADER;
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use params::MultiQuery;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub client: Arc<CimaClient>,
    pub datasets: Arc<Datasets>,
}

impl AppState {
    pub fn new(client: CimaClient, datasets: Datasets) -> Self {
        Self {
            client: Arc::new(client),
            datasets: Arc::new(datasets),
        }
    }
}

/// Builds the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/medicamento", get(handlers::medicamento))
        .route("/medicamentos", get(handlers::medicamentos))
        .route("/ficha-tecnica/buscar", post(handlers::buscar_en_ficha_tecnica))
        .route("/presentaciones", get(handlers::presentaciones))
        .route("/presentacion", get(handlers::presentacion))
        .route("/vmpp", get(handlers::vmpp))
        .route("/maestras", get(handlers::maestras))
        .route("/registro-cambios", get(handlers::registro_cambios))
        .route("/problemas-suministro", get(handlers::problemas_suministro))
        .route("/doc-secciones/:tipo_doc", get(handlers::doc_secciones))
        .route("/doc-contenido/:tipo_doc", get(handlers::doc_contenido))
        .route("/notas", get(handlers::notas))
        .route("/notas/:nregistros", get(handlers::notas_path))
        .route("/materiales", get(handlers::materiales))
        .route("/materiales/:nregistro", get(handlers::materiales_path))
        .route("/doc-html/:tipo/:nregistro/*filename", get(documents::doc_html))
        .route("/descargar-ipt", get(documents::descargar_ipt))
        .route("/descargar-imagenes", get(documents::descargar_imagenes))
        .route("/identificar-medicamento", get(datasets::identificar_medicamento))
        .route("/nomenclator", get(datasets::buscar_nomenclator))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
