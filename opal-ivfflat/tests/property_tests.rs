//! Property-based tests for the IVFFlat index
//!
//! Uses proptest to verify probe semantics against brute-force scans

use std::sync::Arc;

use opal_core::host::{BuildContext, Interrupt, MemoryBudget, VecScan};
use opal_core::progress::NoProgress;
use opal_core::types::{SearchHit, TupleId};
use opal_ivfflat::{IvfflatIndex, IvfflatOptions};
use opal_pages::MemoryPageStore;
use opal_vector::{DistanceKind, Vector};
use proptest::prelude::*;

fn component() -> impl Strategy<Value = f32> {
    -1.0f32..1.0f32
}

fn row_strategy(dim: usize) -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(component(), dim..=dim)
}

fn brute_force(
    tuples: &[(TupleId, Vec<f32>)],
    query: &[f32],
    distance: DistanceKind,
) -> Vec<SearchHit> {
    let mut hits: Vec<SearchHit> = tuples
        .iter()
        .map(|(tuple, data)| SearchHit {
            tuple: *tuple,
            distance: distance.from_comparison(distance.comparison_distance(query, data)),
        })
        .collect();
    hits.sort_unstable_by(SearchHit::cmp_by_distance);
    hits
}

fn build_index(
    tuples: &[(TupleId, Vec<f32>)],
    dim: usize,
    distance: DistanceKind,
    lists: usize,
) -> IvfflatIndex {
    let scan = VecScan::new(tuples.to_vec());
    let budget = MemoryBudget::unlimited();
    let progress = NoProgress;
    let ctx = BuildContext::new(Interrupt::new(), &progress, &budget, 2);
    let options = IvfflatOptions {
        lists,
        seed: Some(1234),
    };
    let store = Arc::new(MemoryPageStore::new());
    IvfflatIndex::build(store, &scan, dim, distance, &options, &ctx)
        .unwrap()
        .0
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Probing every list returns the same ordered answer set as a
    /// sequential scan (ties compare by distance, not id).
    #[test]
    fn exhaustive_probes_match_sequential_scan(
        rows in prop::collection::vec(row_strategy(8), 20..80),
        query in row_strategy(8)
    ) {
        let tuples: Vec<(TupleId, Vec<f32>)> = rows
            .into_iter()
            .enumerate()
            .map(|(i, data)| (i as TupleId, data))
            .collect();
        let index = build_index(&tuples, 8, DistanceKind::L2, 4);
        let query_v = Vector::new(query.clone()).unwrap();

        let expected = brute_force(&tuples, &query, DistanceKind::L2);
        let got: Vec<SearchHit> = index
            .search(&query_v, index.lists(), &Interrupt::new())
            .unwrap()
            .collect();

        prop_assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(&expected) {
            prop_assert!((g.distance - e.distance).abs() < 1e-5);
        }
        let mut got_ids: Vec<TupleId> = got.iter().map(|h| h.tuple).collect();
        let mut expected_ids: Vec<TupleId> = expected.iter().map(|h| h.tuple).collect();
        got_ids.sort_unstable();
        expected_ids.sort_unstable();
        prop_assert_eq!(got_ids, expected_ids);
    }

    /// Recall@10 never decreases as `probes` grows: each probe level
    /// scans a superset of the lists the previous level scanned.
    #[test]
    fn recall_is_monotone_in_probes(
        rows in prop::collection::vec(row_strategy(6), 60..120),
        query in row_strategy(6)
    ) {
        let tuples: Vec<(TupleId, Vec<f32>)> = rows
            .into_iter()
            .enumerate()
            .map(|(i, data)| (i as TupleId, data))
            .collect();
        let index = build_index(&tuples, 6, DistanceKind::L2, 6);
        let query_v = Vector::new(query.clone()).unwrap();

        let exact: Vec<TupleId> = brute_force(&tuples, &query, DistanceKind::L2)
            .into_iter()
            .take(10)
            .map(|h| h.tuple)
            .collect();

        let mut previous = 0usize;
        for probes in 1..=index.lists() {
            let found: Vec<TupleId> = index
                .search(&query_v, probes, &Interrupt::new())
                .unwrap()
                .take(10)
                .map(|h| h.tuple)
                .collect();
            let recalled = exact.iter().filter(|id| found.contains(id)).count();
            prop_assert!(
                recalled >= previous,
                "recall dropped from {previous} to {recalled} at probes={probes}"
            );
            previous = recalled;
        }
        prop_assert_eq!(previous, exact.len());
    }
}

mod deterministic_tests {
    use super::*;

    fn clustered_rows(per_cluster: usize, dim: usize) -> Vec<(TupleId, Vec<f32>)> {
        let mut tuples = Vec::new();
        for i in 0..per_cluster {
            let jitter = |j: usize, salt: usize| {
                (((i * 31 + j * 17 + salt) % 101) as f32 / 101.0) - 0.5
            };
            tuples.push((
                tuples.len() as TupleId,
                (0..dim).map(|j| jitter(j, 0)).collect(),
            ));
            tuples.push((
                tuples.len() as TupleId,
                (0..dim).map(|j| 20.0 + jitter(j, 7)).collect(),
            ));
        }
        tuples
    }

    /// Two well-separated clusters, `lists = 2`: one probe already finds
    /// the whole true top-10 for an in-cluster query.
    #[test]
    fn single_probe_recall_on_separated_clusters() {
        let tuples = clustered_rows(150, 16);
        let index = build_index(&tuples, 16, DistanceKind::L2, 2);

        let query_data: Vec<f32> = vec![0.05; 16];
        let query = Vector::new(query_data.clone()).unwrap();
        let exact: Vec<TupleId> = brute_force(&tuples, &query_data, DistanceKind::L2)
            .into_iter()
            .take(10)
            .map(|h| h.tuple)
            .collect();

        let found: Vec<TupleId> = index
            .search(&query, 1, &Interrupt::new())
            .unwrap()
            .take(10)
            .map(|h| h.tuple)
            .collect();
        let recalled = exact.iter().filter(|id| found.contains(id)).count();
        assert!(
            recalled * 2 >= exact.len(),
            "recall@10 {recalled}/10 below 0.5"
        );
    }

    /// Inner-product ordering surfaces the most aligned row first.
    #[test]
    fn inner_product_ordering() {
        let tuples = vec![
            (1u64, vec![1.0f32, 0.0]),
            (2u64, vec![0.0f32, 1.0]),
            (3u64, vec![1.0f32, 1.0]),
        ];
        let index = build_index(&tuples, 2, DistanceKind::InnerProduct, 1);
        let query = Vector::new(vec![1.0, 1.0]).unwrap();
        let hits: Vec<SearchHit> = index.search(&query, 1, &Interrupt::new()).unwrap().collect();
        assert_eq!(hits[0].tuple, 3);
        assert_eq!(hits[0].distance, -2.0);
        assert_eq!(hits[1].distance, -1.0);
        assert_eq!(hits[2].distance, -1.0);
    }
}
