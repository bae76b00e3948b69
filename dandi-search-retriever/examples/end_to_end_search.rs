//! End-to-end example over a file-backed archive
//!
//! This example shows how to:
//! 1. Write an archive snapshot file with a few datasets
//! 2. Open a SearchEngine on it with the default hashing model
//! 3. Run a refresh cycle and query the index
//! 4. Append a change to the archive and pick it up incrementally

use anyhow::Result;
use dandi_search_retriever::config::ArchiveKind;
use dandi_search_retriever::{EngineConfig, SearchEngine};
use serde_json::json;
use tempfile::tempdir;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let dir = tempdir()?;
    let archive_path = dir.path().join("archive.json");
    let mut archive = json!({
        "cursor": 3,
        "records": [
            {"identifier": "DANDI:000001", "version": "1", "name": "Olfactory bulb recordings in rat"},
            {"identifier": "DANDI:000002", "version": "1", "name": "Visual cortex imaging in mouse"},
            {"identifier": "DANDI:000003", "version": "1", "name": "Rat hippocampus electrophysiology"}
        ],
        "changes": []
    });
    std::fs::write(&archive_path, serde_json::to_string_pretty(&archive)?)?;

    let mut config = EngineConfig::in_memory();
    config.archive.kind = ArchiveKind::File;
    config.archive.path = archive_path.clone();
    let engine = SearchEngine::open(config).await?;

    let report = engine.refresh_now().await?;
    println!(
        "Published generation {} with {} records",
        report.generation, report.inserted
    );

    for query in ["olfactory bulb rat", "mouse cortex", "place cells"] {
        let ids = engine.dandi_semantic_search(query).await?;
        println!("{query:>20} -> {ids:?}");
    }

    archive["changes"] = json!([
        {"cursor": 4, "op": "upsert", "record":
            {"identifier": "DANDI:000004", "version": "1", "name": "Hippocampal place cells in freely moving mice"}},
        {"cursor": 5, "op": "delete", "id": "DANDI:000002"}
    ]);
    std::fs::write(&archive_path, serde_json::to_string_pretty(&archive)?)?;

    let report = engine.refresh_now().await?;
    println!(
        "Incremental cycle: {} inserted, {} deleted, cursor {}",
        report.inserted, report.deleted, report.cursor.0
    );
    println!(
        "{:>20} -> {:?}",
        "place cells",
        engine.dandi_semantic_search("place cells").await?
    );

    println!("{}", engine.status().await?.summary());
    engine.shutdown().await;
    Ok(())
}
