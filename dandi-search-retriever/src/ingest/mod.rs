//! Corpus ingestion: archive adapters and the ingestor that turns their raw
//! documents into normalized [`RecordChange`](crate::record::RecordChange)s.

pub mod archive;
pub mod ingestor;

pub use archive::{
    Archive, ArchiveSnapshot, ChangeFeed, CursorChange, FileArchive, HttpArchive, MemoryArchive,
    RawChange,
};
pub use ingestor::{CorpusIngestor, IngestBatch};

use crate::config::{ArchiveConfig, ArchiveKind};
use crate::error::ArchiveError;
use std::sync::Arc;

/// Build the archive adapter selected by `config`.
pub fn build_archive(config: &ArchiveConfig) -> Result<Arc<dyn Archive>, ArchiveError> {
    let archive: Arc<dyn Archive> = match config.kind {
        ArchiveKind::File => Arc::new(FileArchive::new(
            config.path.clone(),
            std::time::Duration::from_millis(config.watch_debounce_ms),
        )),
        ArchiveKind::Http => {
            let base_url = config
                .base_url
                .clone()
                .ok_or_else(|| ArchiveError::permanent("archive.base_url is not set"))?;
            Arc::new(HttpArchive::new(base_url, config.request_timeout())?)
        }
    };
    tracing::info!("Using {} archive", archive.name());
    Ok(archive)
}
