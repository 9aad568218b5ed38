//! Opal Scan Module
//!
//! Translates a "nearest K to `q` under distance `D`" request into index
//! calls and surfaces a distance-ordered tuple-id stream. This is the
//! boundary the host's operator and planner layers bind to:
//! - [`Operator`]: the ordering operators `<->`, `<#>`, `<=>` (plus the
//!   index-less L1 form)
//! - [`OperatorClass`]: `vector_l2_ops` / `vector_ip_ops` /
//!   `vector_cosine_ops`, each binding one distance to both access methods
//! - [`SessionSettings`]: explicit per-query configuration the host's
//!   session layer writes into (`ivfflat.probes`, `hnsw.ef_search`)
//! - [`AnnIndex`]: one handle over either access method, with a blocking
//!   scan and an async facade

use std::sync::Arc;

use opal_core::host::{BuildContext, Interrupt, TupleScan};
use opal_core::types::{OrderedHits, SearchHit, TupleId};
use opal_core::{Error, Result};
use opal_hnsw::{DEFAULT_EF_SEARCH, HnswBuildSummary, HnswIndex, HnswOptions};
use opal_ivfflat::{IvfflatBuildSummary, IvfflatIndex, IvfflatOptions};
use opal_pages::PageStore;
use opal_vector::{DistanceKind, Vector};
use serde::{Deserialize, Serialize};

pub const MIN_EF_SEARCH: usize = 1;
pub const MAX_EF_SEARCH: usize = 1_000;

/// Binary ordering operators, ascending distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    /// `<->`: Euclidean distance.
    L2,
    /// `<#>`: negative inner product.
    NegInnerProduct,
    /// `<=>`: cosine distance.
    Cosine,
    /// `<+>`: taxicab distance. Function form only; no index support.
    L1,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::L2 => "<->",
            Operator::NegInnerProduct => "<#>",
            Operator::Cosine => "<=>",
            Operator::L1 => "<+>",
        }
    }

    /// The distance an index must be bound to for this operator; `None`
    /// when no index can serve it.
    pub fn index_distance(&self) -> Option<DistanceKind> {
        match self {
            Operator::L2 => Some(DistanceKind::L2),
            Operator::NegInnerProduct => Some(DistanceKind::InnerProduct),
            Operator::Cosine => Some(DistanceKind::Cosine),
            Operator::L1 => None,
        }
    }
}

/// Operator classes; each binds one distance to both index types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatorClass {
    VectorL2Ops,
    VectorIpOps,
    VectorCosineOps,
}

impl OperatorClass {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorClass::VectorL2Ops => "vector_l2_ops",
            OperatorClass::VectorIpOps => "vector_ip_ops",
            OperatorClass::VectorCosineOps => "vector_cosine_ops",
        }
    }

    pub fn distance(&self) -> DistanceKind {
        match self {
            OperatorClass::VectorL2Ops => DistanceKind::L2,
            OperatorClass::VectorIpOps => DistanceKind::InnerProduct,
            OperatorClass::VectorCosineOps => DistanceKind::Cosine,
        }
    }

    pub fn supports(&self, operator: Operator) -> bool {
        operator.index_distance() == Some(self.distance())
    }
}

/// Per-query configuration. The host session layer owns the values
/// (`SET LOCAL` scoping included) and passes them down explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// `ivfflat.probes`: lists scanned per query, clamped to the list
    /// count at scan time.
    pub probes: usize,
    /// `hnsw.ef_search`: layer-0 beam width.
    pub ef_search: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            probes: 1,
            ef_search: DEFAULT_EF_SEARCH,
        }
    }
}

impl SessionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.probes < 1 {
            return Err(Error::BadInput("probes must be at least 1".into()));
        }
        if self.ef_search < MIN_EF_SEARCH || self.ef_search > MAX_EF_SEARCH {
            return Err(Error::BadInput(format!(
                "ef_search must be between {MIN_EF_SEARCH} and {MAX_EF_SEARCH}"
            )));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| Error::BadInput(format!("malformed session settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Parses host-supplied `WITH (...)` options for an HNSW index.
pub fn parse_hnsw_options(json: &str) -> Result<HnswOptions> {
    let options: HnswOptions = serde_json::from_str(json)
        .map_err(|e| Error::BadInput(format!("malformed index options: {e}")))?;
    options.validate()?;
    Ok(options)
}

/// Parses host-supplied `WITH (...)` options for an IVFFlat index.
pub fn parse_ivfflat_options(json: &str) -> Result<IvfflatOptions> {
    let options: IvfflatOptions = serde_json::from_str(json)
        .map_err(|e| Error::BadInput(format!("malformed index options: {e}")))?;
    options.validate()?;
    Ok(options)
}

/// One handle over either access method.
pub enum AnnIndex {
    Ivfflat(IvfflatIndex),
    Hnsw(HnswIndex),
}

impl AnnIndex {
    pub fn build_ivfflat(
        store: Arc<dyn PageStore>,
        scan: &dyn TupleScan,
        dim: usize,
        class: OperatorClass,
        options: &IvfflatOptions,
        ctx: &BuildContext<'_>,
    ) -> Result<(Self, IvfflatBuildSummary)> {
        let (index, summary) =
            IvfflatIndex::build(store, scan, dim, class.distance(), options, ctx)?;
        Ok((AnnIndex::Ivfflat(index), summary))
    }

    pub fn build_hnsw(
        store: Arc<dyn PageStore>,
        scan: &dyn TupleScan,
        dim: usize,
        class: OperatorClass,
        options: &HnswOptions,
        ctx: &BuildContext<'_>,
    ) -> Result<(Self, HnswBuildSummary)> {
        let (index, summary) = HnswIndex::build(store, scan, dim, class.distance(), options, ctx)?;
        Ok((AnnIndex::Hnsw(index), summary))
    }

    pub fn distance(&self) -> DistanceKind {
        match self {
            AnnIndex::Ivfflat(index) => index.distance(),
            AnnIndex::Hnsw(index) => index.distance(),
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            AnnIndex::Ivfflat(index) => index.dim(),
            AnnIndex::Hnsw(index) => index.dim(),
        }
    }

    pub fn insert(&self, tuple: TupleId, data: &[f32]) -> Result<()> {
        match self {
            AnnIndex::Ivfflat(index) => index.insert(tuple, data),
            AnnIndex::Hnsw(index) => index.insert(tuple, data),
        }
    }

    /// Runs one index scan: nearest tuples to `query` under `operator`,
    /// ascending, at most `limit` of them when a limit is given. Returned
    /// tuple ids still need host-side visibility checks.
    pub fn scan(
        &self,
        query: &Vector,
        operator: Operator,
        limit: Option<usize>,
        settings: &SessionSettings,
        interrupt: &Interrupt,
    ) -> Result<OrderedHits> {
        settings.validate()?;
        let wanted = operator.index_distance().ok_or_else(|| {
            Error::Unsupported(format!(
                "operator {} has no index support",
                operator.symbol()
            ))
        })?;
        if wanted != self.distance() {
            return Err(Error::Unsupported(format!(
                "operator {} is not bound to this index's distance",
                operator.symbol()
            )));
        }

        tracing::debug!(
            operator = operator.symbol(),
            limit,
            probes = settings.probes,
            ef_search = settings.ef_search,
            "index scan"
        );
        match self {
            AnnIndex::Ivfflat(index) => {
                let hits = index.search(query, settings.probes, interrupt)?;
                match limit {
                    Some(limit) => Ok(OrderedHits::from_unsorted(
                        hits.take(limit).collect::<Vec<SearchHit>>(),
                    )),
                    None => Ok(hits),
                }
            }
            AnnIndex::Hnsw(index) => {
                let k = limit.unwrap_or(settings.ef_search);
                index.search(query, k, settings.ef_search, interrupt)
            }
        }
    }
}

/// Async facade over [`AnnIndex::scan`]; the blocking graph and list
/// walks run on the blocking pool.
pub async fn knn(
    index: &Arc<AnnIndex>,
    query: Vector,
    operator: Operator,
    k: usize,
    settings: SessionSettings,
) -> Result<Vec<SearchHit>> {
    let index = Arc::clone(index);
    tokio::task::spawn_blocking(move || {
        let interrupt = Interrupt::new();
        index
            .scan(&query, operator, Some(k), &settings, &interrupt)
            .map(|hits| hits.collect::<Vec<SearchHit>>())
    })
    .await
    .map_err(|e| Error::Page(format!("scan worker failed: {e}")))?
}

/// The same results as [`knn`], surfaced as a stream.
pub async fn knn_stream(
    index: &Arc<AnnIndex>,
    query: Vector,
    operator: Operator,
    k: usize,
    settings: SessionSettings,
) -> Result<futures::stream::Iter<std::vec::IntoIter<SearchHit>>> {
    let hits = knn(index, query, operator, k, settings).await?;
    Ok(futures::stream::iter(hits))
}
