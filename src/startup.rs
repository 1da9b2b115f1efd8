//! Dataset preparation at startup
//!
//! Refreshes the two reference files concurrently, then parses them on
//! blocking worker threads into the shared [`Datasets`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, info};

use crate::cache::{DatedCache, DatedDownloader, DatedFile, FetchError, Transport};
use crate::data::{Datasets, Table, TableError};

/// Source of the presentations spreadsheet
pub const PRESENTACIONES_URL: &str = "https://listadomedicamentos.aemps.gob.es/Presentaciones.xls";

/// Source of the nomenclátor CSV export
pub const NOMENCLATOR_URL: &str = "https://listadomedicamentos.aemps.gob.es/nomenclator.do?metodo=buscarProductos&especialidad=%%%&d-4015021-e=1&6578706f7274=1";

/// Errors that abort startup
#[derive(Debug, Error)]
pub enum StartupError {
    /// A dataset could not be downloaded
    #[error("Failed to download {dataset}: {source}")]
    Download {
        dataset: &'static str,
        #[source]
        source: FetchError,
    },

    /// A dataset file could not be parsed
    #[error("Failed to read {dataset} from {path}: {source}")]
    Load {
        dataset: &'static str,
        path: PathBuf,
        #[source]
        source: TableError,
    },

    /// `--skip-refresh` was given but nothing is cached yet
    #[error("No cached {dataset} file in {dir}")]
    MissingCache { dataset: &'static str, dir: PathBuf },

    /// Filesystem error while inspecting the cache
    #[error("Cache error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking loader panicked or was cancelled
    #[error("Loader task failed: {0}")]
    Join(#[from] JoinError),
}

/// Where the datasets come from and where they are kept
#[derive(Debug, Clone)]
pub struct DatasetConfig {
    pub dir: PathBuf,
    pub presentaciones_url: String,
    pub nomenclator_url: String,
}

impl DatasetConfig {
    /// Uses the public AEMPS sources with files kept in `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            presentaciones_url: PRESENTACIONES_URL.to_string(),
            nomenclator_url: NOMENCLATOR_URL.to_string(),
        }
    }

    pub fn presentaciones(&self) -> DatedFile {
        DatedFile::new(&self.presentaciones_url, &self.dir, "Presentaciones.xls")
    }

    pub fn nomenclator(&self) -> DatedFile {
        DatedFile::new(&self.nomenclator_url, &self.dir, "nomenclator.csv")
    }
}

/// Builds the HTTP downloader used at startup
pub fn http_downloader(read_timeout: Duration, max_retries: u32) -> Result<DatedDownloader, FetchError> {
    Ok(DatedDownloader::http(read_timeout)?.with_max_retries(max_retries))
}

/// Refreshes both datasets and loads them
///
/// Downloads run concurrently; a failure in either aborts startup.
pub async fn prepare_datasets<T: Transport>(
    config: &DatasetConfig,
    downloader: &DatedDownloader<T>,
) -> Result<Datasets, StartupError> {
    let presentaciones = config.presentaciones();
    let nomenclator = config.nomenclator();

    let (xls_path, csv_path) = tokio::try_join!(
        async {
            downloader
                .fetch(&presentaciones)
                .await
                .map_err(|source| StartupError::Download {
                    dataset: "Presentaciones.xls",
                    source,
                })
        },
        async {
            downloader
                .fetch(&nomenclator)
                .await
                .map_err(|source| StartupError::Download {
                    dataset: "nomenclátor",
                    source,
                })
        },
    )?;

    info!(presentaciones = %xls_path.display(), nomenclator = %csv_path.display(), "datasets ready");
    load_datasets(xls_path, csv_path).await
}

/// Loads the newest cached copy of each dataset without touching the network
pub async fn cached_datasets(config: &DatasetConfig) -> Result<Datasets, StartupError> {
    let cache = DatedCache::with_dir(&config.dir);
    let newest = |file: &DatedFile, dataset: &'static str| -> Result<PathBuf, StartupError> {
        cache
            .latest(file.extension())?
            .map(|cached| cached.path)
            .ok_or_else(|| StartupError::MissingCache {
                dataset,
                dir: config.dir.clone(),
            })
    };

    let xls_path = newest(&config.presentaciones(), "Presentaciones.xls")?;
    let csv_path = newest(&config.nomenclator(), "nomenclátor")?;
    info!(presentaciones = %xls_path.display(), nomenclator = %csv_path.display(), "using cached datasets");
    load_datasets(xls_path, csv_path).await
}

/// Parses both files on blocking worker threads
pub async fn load_datasets(xls_path: PathBuf, csv_path: PathBuf) -> Result<Datasets, StartupError> {
    let presentaciones = tokio::task::spawn_blocking(move || {
        load(&xls_path, "Presentaciones.xls", Table::load_spreadsheet)
    });
    let nomenclator =
        tokio::task::spawn_blocking(move || load(&csv_path, "nomenclátor", Table::load_csv));

    let (presentaciones, nomenclator) = tokio::try_join!(presentaciones, nomenclator)?;
    let (presentaciones, nomenclator) = (presentaciones?, nomenclator?);

    debug!(
        presentaciones = presentaciones.len(),
        nomenclator = nomenclator.len(),
        "datasets loaded"
    );
    Ok(Datasets::new(presentaciones, nomenclator))
}

fn load(
    path: &Path,
    dataset: &'static str,
    loader: fn(&Path) -> Result<Table, TableError>,
) -> Result<Table, StartupError> {
    loader(path).map_err(|source| StartupError::Load {
        dataset,
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{RemoteBody, RemoteHeaders};
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use std::fs;
    use tempfile::TempDir;

    /// Serves fixed bodies keyed by URL, with a fixed last-modified date
    struct FixedTransport;

    #[async_trait]
    impl Transport for FixedTransport {
        async fn probe(&self, _url: &str) -> Result<RemoteHeaders, FetchError> {
            Ok(RemoteHeaders::default())
        }

        async fn open(&self, url: &str) -> Result<RemoteBody, FetchError> {
            if url.ends_with(".xls") {
                return Err(FetchError::Status {
                    status: 500,
                    url: url.to_string(),
                });
            }
            Ok(RemoteBody {
                headers: RemoteHeaders {
                    content_disposition: None,
                    last_modified: Some("Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
                },
                chunks: Box::pin(stream::iter(vec![Ok(Bytes::from_static(
                    b"C\xc3\xb3digo Nacional,Estado\n712345,ALTA\n",
                ))])),
            })
        }
    }

    #[tokio::test]
    async fn test_download_failure_aborts_startup() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = DatasetConfig::new(temp_dir.path());
        let downloader = DatedDownloader::new(FixedTransport);

        let err = prepare_datasets(&config, &downloader).await.unwrap_err();

        assert!(matches!(
            err,
            StartupError::Download { dataset: "Presentaciones.xls", .. }
        ));
    }

    #[tokio::test]
    async fn test_skip_refresh_without_cache_fails() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = DatasetConfig::new(temp_dir.path());

        let err = cached_datasets(&config).await.unwrap_err();

        assert!(matches!(err, StartupError::MissingCache { .. }));
    }

    #[tokio::test]
    async fn test_broken_spreadsheet_reports_path() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let xls = temp_dir.path().join("20240101_Presentaciones.xls");
        let csv = temp_dir.path().join("20240101_nomenclator.csv");
        fs::write(&xls, b"not a spreadsheet").expect("Should write file");
        fs::write(&csv, "a,b\n1,2\n").expect("Should write file");

        let err = cached_datasets(&DatasetConfig::new(temp_dir.path()))
            .await
            .unwrap_err();

        match err {
            StartupError::Load { dataset, path, .. } => {
                assert_eq!(dataset, "Presentaciones.xls");
                assert_eq!(path, xls);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_dataset_files_use_expected_extensions() {
        let config = DatasetConfig::new("/tmp/cima");
        assert_eq!(config.presentaciones().extension(), "xls");
        assert_eq!(config.nomenclator().extension(), "csv");
    }
}
