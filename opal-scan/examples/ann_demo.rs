//! Example: Approximate nearest neighbor search over both access methods
//!
//! Builds an IVFFlat and an HNSW index over the same synthetic embedding
//! set, then runs the three ordering operators against them.

use std::sync::Arc;

use opal_core::host::{BuildContext, Interrupt, MemoryBudget, VecScan};
use opal_core::progress::LogProgress;
use opal_hnsw::HnswOptions;
use opal_ivfflat::IvfflatOptions;
use opal_pages::MemoryPageStore;
use opal_scan::{AnnIndex, Operator, OperatorClass, SessionSettings};
use opal_vector::Vector;

fn synthetic_embeddings(n: u64, dim: usize) -> Vec<(u64, Vec<f32>)> {
    (0..n)
        .map(|i| {
            (
                i,
                (0..dim as u64)
                    .map(|j| {
                        let h = (i * 2_654_435_761 + j * 40_503) % 10_007;
                        h as f32 / 10_007.0
                    })
                    .collect(),
            )
        })
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("Opal ANN demo\n");

    let dim = 64;
    let rows = synthetic_embeddings(5_000, dim);
    let scan = VecScan::new(rows.clone());
    let budget = MemoryBudget::unlimited();
    let progress = LogProgress;
    let ctx = BuildContext::new(Interrupt::new(), &progress, &budget, 4);

    println!("Building IVFFlat (lists=32)...");
    let (ivf, ivf_summary) = AnnIndex::build_ivfflat(
        Arc::new(MemoryPageStore::new()),
        &scan,
        dim,
        OperatorClass::VectorL2Ops,
        &IvfflatOptions {
            lists: 32,
            seed: Some(1),
        },
        &ctx,
    )?;
    println!(
        "  {} tuples, {} k-means iterations, {} pages",
        ivf_summary.tuples, ivf_summary.kmeans_iterations, ivf_summary.pages
    );

    println!("Building HNSW (m=16, ef_construction=64)...");
    let (hnsw, hnsw_summary) = AnnIndex::build_hnsw(
        Arc::new(MemoryPageStore::new()),
        &scan,
        dim,
        OperatorClass::VectorL2Ops,
        &HnswOptions {
            m: 16,
            ef_construction: 64,
            seed: Some(1),
        },
        &ctx,
    )?;
    println!(
        "  {} tuples, {} pages, spilled: {}",
        hnsw_summary.tuples,
        hnsw_summary.pages,
        hnsw_summary.spilled_at.is_some()
    );

    let query = Vector::new(rows[123].1.clone())?;
    let ivf = Arc::new(ivf);
    let hnsw = Arc::new(hnsw);

    println!("\nTop 5 by {} (IVFFlat, probes=4):", Operator::L2.symbol());
    let settings = SessionSettings {
        probes: 4,
        ..SessionSettings::default()
    };
    for hit in opal_scan::knn(&ivf, query.clone(), Operator::L2, 5, settings.clone()).await? {
        println!("  tuple {:>4}  distance {:.4}", hit.tuple, hit.distance);
    }

    println!("\nTop 5 by {} (HNSW, ef_search=80):", Operator::L2.symbol());
    let settings = SessionSettings {
        ef_search: 80,
        ..SessionSettings::default()
    };
    for hit in opal_scan::knn(&hnsw, query, Operator::L2, 5, settings).await? {
        println!("  tuple {:>4}  distance {:.4}", hit.tuple, hit.distance);
    }

    Ok(())
}
