//! Queries running concurrently with rebuilds and incremental applies only
//! ever observe complete generations.

use dandi_search_embed::ModelDescriptor;
use dandi_search_retriever::config::IndexConfig;
use dandi_search_retriever::index::IndexOp;
use dandi_search_retriever::record::Payload;
use dandi_search_retriever::storage::StoredEmbedding;
use dandi_search_retriever::{IndexError, VectorIndex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const DIMENSION: usize = 8;
const PER_CORPUS: usize = 200;

/// Points on a circle in the first two axes, with the corpus tag in the id.
fn corpus(tag: &str, phase: f32) -> Vec<StoredEmbedding> {
    (0..PER_CORPUS)
        .map(|i| {
            let theta = phase + i as f32 * 0.01;
            let mut vector = vec![0.0; DIMENSION];
            vector[0] = theta.cos();
            vector[1] = theta.sin();
            vector[2] = 0.1;
            StoredEmbedding {
                record_id: format!("{tag}-{i:04}"),
                vector,
                payload: Payload::new(),
            }
        })
        .collect()
}

fn descriptor() -> ModelDescriptor {
    ModelDescriptor::new("test", "circle", "1", DIMENSION)
}

fn config() -> IndexConfig {
    IndexConfig {
        shards: 4,
        exact_search_threshold: 64,
        ..IndexConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queries_never_see_mixed_generations() {
    let index = Arc::new(VectorIndex::new(config(), descriptor().model_id(), DIMENSION));
    index.rebuild(corpus("a", 0.0), &descriptor()).unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let mut readers = Vec::new();
    for r in 0..4 {
        let index = index.clone();
        let done = done.clone();
        readers.push(tokio::spawn(async move {
            let mut query = vec![0.0; DIMENSION];
            query[0] = 1.0;
            query[1] = r as f32 * 0.2;
            let mut observed = 0usize;
            while !done.load(Ordering::SeqCst) {
                let generation = index.snapshot();
                let hits = generation.search(&query, 25, None, None).unwrap();
                assert_eq!(hits.len(), 25);
                let tag = &hits[0].id[..1];
                assert!(
                    hits.iter().all(|h| h.id.starts_with(tag)),
                    "generation {} mixes corpora",
                    generation.number()
                );
                assert_eq!(generation.len(), PER_CORPUS);
                observed += 1;
                tokio::task::yield_now().await;
            }
            observed
        }));
    }

    let writer = {
        let index = index.clone();
        tokio::task::spawn_blocking(move || {
            for round in 0..20 {
                let (tag, phase) = if round % 2 == 0 { ("b", 0.5) } else { ("a", 0.0) };
                index.rebuild(corpus(tag, phase), &descriptor()).unwrap();
            }
        })
    };
    writer.await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    done.store(true, Ordering::SeqCst);

    for reader in readers {
        assert!(reader.await.unwrap() > 0);
    }
    assert_eq!(index.snapshot().number(), 21);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_applies_are_all_published() {
    let index = Arc::new(VectorIndex::new(config(), descriptor().model_id(), DIMENSION));
    index.rebuild(corpus("a", 0.0), &descriptor()).unwrap();

    let mut writers = Vec::new();
    for w in 0..4 {
        let index = index.clone();
        writers.push(tokio::task::spawn_blocking(move || {
            for i in 0..25 {
                let mut vector = vec![0.0; DIMENSION];
                vector[3] = 1.0;
                vector[4] = (w * 25 + i) as f32 * 0.001;
                index
                    .apply(vec![IndexOp::Upsert {
                        id: format!("w{w}-{i:02}"),
                        vector,
                        payload: Payload::new(),
                    }])
                    .unwrap();
            }
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }

    let generation = index.snapshot();
    assert_eq!(generation.len(), PER_CORPUS + 100);
    assert_eq!(generation.number(), 101);
    assert!(generation.contains("w3-24"));
    generation.validate().unwrap();
}

#[test]
fn test_rejected_apply_keeps_previous_generation() {
    let index = VectorIndex::new(config(), descriptor().model_id(), DIMENSION);
    index.rebuild(corpus("a", 0.0), &descriptor()).unwrap();
    let before = index.snapshot();

    let err = index
        .apply(vec![
            IndexOp::Delete {
                id: "a-0000".into(),
            },
            IndexOp::Upsert {
                id: "bad".into(),
                vector: vec![1.0; DIMENSION + 1],
                payload: Payload::new(),
            },
        ])
        .unwrap_err();
    assert!(matches!(err, IndexError::DimensionMismatch { .. }));

    let after = index.snapshot();
    assert_eq!(after.number(), before.number());
    assert!(after.contains("a-0000"));
    assert!(!after.contains("bad"));

    let err = index
        .rebuild(
            vec![StoredEmbedding {
                record_id: "zero".into(),
                vector: vec![0.0; DIMENSION],
                payload: Payload::new(),
            }],
            &descriptor(),
        )
        .unwrap_err();
    assert!(matches!(err, IndexError::Corruption(_)));
    assert_eq!(index.snapshot().len(), PER_CORPUS);
}
