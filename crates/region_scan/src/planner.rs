//! Region-aligned partition planning.
//!
//! The planner reads a table's region layout once, clips every region to the
//! requested key range and emits one [`Partition`] per non-empty intersection,
//! in key order. Partitions are independent units of work: each one is handed
//! to exactly one reader.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Result, ScanContext, ScanError};
use crate::metrics::ScanMetrics;
use crate::spec::{KeyRange, ScanSpec, ScanTemplate};
use crate::store::StoreSession;
use crate::topology::{fetch_topology, RegionBoundary, TableTopology};

/// Consumer hook that can exclude regions from a scan.
pub trait RegionFilter: Send + Sync + 'static {
    fn include_region(&self, region: &RegionBoundary) -> bool;
}

impl<F> RegionFilter for F
where
    F: Fn(&RegionBoundary) -> bool + Send + Sync + 'static,
{
    fn include_region(&self, region: &RegionBoundary) -> bool {
        self(region)
    }
}

/// One independently executable slice of a table scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Position in key order among the partitions of one plan.
    pub index: usize,
    pub spec: ScanSpec,
    /// Server hosting the region, for locality-aware scheduling.
    pub owner_hint: Option<String>,
    pub region_id: u64,
}

impl Partition {
    pub fn table(&self) -> &str {
        self.spec.table_id()
    }

    pub fn range(&self) -> &KeyRange {
        self.spec.range()
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} region={}",
            self.index,
            self.table(),
            self.range(),
            self.region_id
        )?;
        if let Some(owner) = &self.owner_hint {
            write!(f, " owner={owner}")?;
        }
        Ok(())
    }
}

/// Turns a table's region layout into region-aligned scan partitions.
pub struct SplitPlanner {
    template: ScanTemplate,
    filter: Option<Arc<dyn RegionFilter>>,
    metrics: Arc<ScanMetrics>,
}

impl SplitPlanner {
    pub fn new(template: ScanTemplate) -> Self {
        Self {
            template,
            filter: None,
            metrics: Arc::new(ScanMetrics::default()),
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn RegionFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<ScanMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn template(&self) -> &ScanTemplate {
        &self.template
    }

    /// Plans partitions for `requested` over `table` using live region metadata.
    ///
    /// A table without regions yields no partitions. An unknown table fails
    /// with [`ScanError::TableNotFound`].
    pub async fn plan(
        &self,
        session: &dyn StoreSession,
        table: &str,
        requested: &KeyRange,
        target_parallelism: usize,
    ) -> Result<Vec<Partition>> {
        validate_parallelism(target_parallelism)?;
        let topology = fetch_topology(session, table).await.map_err(|err| {
            ScanError::from_store(
                ScanContext {
                    table: table.to_string(),
                    start_key: requested.start().to_vec(),
                    stop_key: requested.stop().to_vec(),
                    last_row_key: None,
                },
                err,
            )
        })?;
        self.plan_from_regions(&topology, requested, target_parallelism)
    }

    /// Pure planning step over an already normalised layout.
    pub fn plan_from_regions(
        &self,
        topology: &TableTopology,
        requested: &KeyRange,
        target_parallelism: usize,
    ) -> Result<Vec<Partition>> {
        validate_parallelism(target_parallelism)?;
        let last = topology.regions.len().saturating_sub(1);

        let mut partitions = Vec::new();
        for (position, region) in topology.regions.iter().enumerate() {
            if let Some(filter) = &self.filter {
                if !filter.include_region(region) {
                    debug!(
                        table = %topology.table,
                        region = region.region_id,
                        "region excluded by filter"
                    );
                    continue;
                }
            }

            // The outermost regions extend to the ends of the key space even
            // when metadata reports concrete first/last keys.
            let start = if position == 0 {
                Vec::new()
            } else {
                region.start_key.clone()
            };
            let stop = if position == last {
                Vec::new()
            } else {
                region.end_key.clone()
            };
            let Some(clipped) = requested.intersect(&KeyRange::new(start, stop)?) else {
                continue;
            };

            partitions.push(Partition {
                index: partitions.len(),
                spec: self.template.spec_for(&topology.table, clipped)?,
                owner_hint: region.owner.clone(),
                region_id: region.region_id,
            });
        }

        self.metrics.record_partitions_planned(partitions.len());
        info!(
            table = %topology.table,
            requested = %requested,
            regions = topology.regions.len(),
            partitions = partitions.len(),
            "planned table scan"
        );
        if partitions.len() != target_parallelism {
            info!(
                table = %topology.table,
                target_parallelism,
                achievable = partitions.len(),
                "parallelism bounded by region count"
            );
        }
        Ok(partitions)
    }
}

impl fmt::Debug for SplitPlanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitPlanner")
            .field("template", &self.template)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

fn validate_parallelism(target_parallelism: usize) -> Result<()> {
    if target_parallelism == 0 {
        return Err(ScanError::InvalidArgument(
            "target parallelism must be at least 1".to_string(),
        ));
    }
    Ok(())
}
