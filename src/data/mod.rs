//! Upstream data access and response shaping
//!
//! This module contains the CIMA client, the helpers that rewrite upstream
//! records, the metadata envelope and the in-memory reference tables.

pub mod client;
pub mod metadata;
pub mod reshape;
pub mod tabular;
pub mod timestamp;

pub use client::{
    payload_value, ChangeLogMethod, ChangeLogQuery, CimaClient, CimaError, DocContent, DocFormat,
    DocQuery, DocStream, Download, FichaRule, HtmlDoc, ImageKind, MaestrasQuery, MedicamentoQuery,
    MedicamentosQuery, Payload, PresentacionesQuery, VmppQuery,
};
pub use metadata::{Envelope, Metadata};
pub use tabular::{Selection, Table, TableError};
pub use timestamp::normalize_timestamp;

/// Column names of the `Presentaciones.xls` spreadsheet
pub mod presentaciones_columns {
    pub const NREGISTRO: &str = "Nº Registro";
    pub const CN: &str = "Cod. Nacional";
    pub const LABORATORIO: &str = "Laboratorio";
    pub const ATC: &str = "Cód. ATC";
    pub const ESTADO: &str = "Estado";
    pub const COMERCIALIZADO: &str = "¿Comercializado?";
    pub const PRESENTACION: &str = "Presentación";
}

/// Column names of the nomenclátor CSV
pub mod nomenclator_columns {
    pub const CODIGO_NACIONAL: &str = "Código Nacional";
    pub const NOMBRE_PRODUCTO: &str = "Nombre del producto farmacéutico";
    pub const TIPO_FARMACO: &str = "Tipo de fármaco";
    pub const PRINCIPIO_ACTIVO: &str = "Principio activo o asociación de principios activos";
    pub const CODIGO_LABORATORIO: &str = "Código del laboratorio ofertante";
    pub const NOMBRE_LABORATORIO: &str = "Nombre del laboratorio ofertante";
    pub const ESTADO: &str = "Estado";
    pub const APORTACION: &str = "Aportación del beneficiario";
    pub const AGRUPACION_CODIGO: &str = "Código de la agrupación homogénea del producto sanitario";
    pub const AGRUPACION_NOMBRE: &str = "Nombre de la agrupación homogénea del producto sanitario";
    pub const PRECIO_IVA: &str = "Precio venta al público con IVA";
    pub const DIAGNOSTICO_HOSPITALARIO: &str = "Diagnóstico hospitalario";
    pub const LARGA_DURACION: &str = "Tratamiento de larga duración";
    pub const ESPECIAL_CONTROL: &str = "Especial control médico";
    pub const HUERFANO: &str = "Medicamento huérfano";
    pub const FECHA_ALTA: &str = "Fecha de alta en el nomenclátor";
    pub const FECHA_BAJA: &str = "Fecha de baja en el nomenclátor";
}

/// The reference tables loaded at startup, shared read-only by all handlers
#[derive(Debug, Clone, Default)]
pub struct Datasets {
    pub presentaciones: Table,
    pub nomenclator: Table,
}

impl Datasets {
    pub fn new(presentaciones: Table, nomenclator: Table) -> Self {
        Self {
            presentaciones,
            nomenclator,
        }
    }
}
