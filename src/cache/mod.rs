//! Cache module for downloaded reference datasets
//!
//! This module keeps dated copies of remote files on disk. The manager answers
//! freshness questions from the `YYYYMMDD` prefix embedded in each filename,
//! and the downloader refreshes a dataset only when upstream has something
//! newer, retrying timeouts with exponential backoff.

mod downloader;
mod manager;

pub use downloader::{
    disposition_file_name, resolve_file_name, DatedDownloader, DatedFile, FetchError, HttpTransport,
    RemoteBody, RemoteHeaders, Transport, CONNECT_TIMEOUT, DEFAULT_BACKOFF, DEFAULT_MAX_RETRIES,
    MAX_BACKOFF, USER_AGENT,
};
pub use manager::{date_prefix, CachedFile, DatedCache};
