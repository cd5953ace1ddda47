//! Region layout helpers for range-aware partition planning.
//!
//! A table is sharded into contiguous key-range regions. The helpers here
//! normalise the layout reported by the store and provide the byte-bound
//! arithmetic shared by the planner and `KeyRange`.

use anyhow::Context;

use crate::error::StoreError;
use crate::store::StoreSession;

/// One region of a table as reported by store metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionBoundary {
    /// Store-assigned region identifier.
    pub region_id: u64,
    /// Inclusive start key (empty means unbounded).
    pub start_key: Vec<u8>,
    /// Exclusive end key (empty means unbounded).
    pub end_key: Vec<u8>,
    /// Server currently hosting the region.
    pub owner: Option<String>,
}

impl RegionBoundary {
    pub fn new(region_id: u64, start_key: impl Into<Vec<u8>>, end_key: impl Into<Vec<u8>>) -> Self {
        Self {
            region_id,
            start_key: start_key.into(),
            end_key: end_key.into(),
            owner: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Materialized, key-ordered region layout of one table.
#[derive(Debug, Clone)]
pub struct TableTopology {
    pub table: String,
    /// Regions sorted by start key; contiguous, without overlaps.
    pub regions: Vec<RegionBoundary>,
}

impl TableTopology {
    /// Sorts regions by start key and rejects overlapping or gapped layouts.
    pub fn from_regions(
        table: impl Into<String>,
        mut regions: Vec<RegionBoundary>,
    ) -> Result<Self, StoreError> {
        let table = table.into();
        // Empty start keys sort first, which is where an unbounded start belongs.
        regions.sort_by(|left, right| left.start_key.cmp(&right.start_key));

        for region in &regions {
            if !region.end_key.is_empty() && region.start_key >= region.end_key {
                return Err(StoreError::InvalidMetadata {
                    table,
                    reason: format!(
                        "region {} has start {} not below end {}",
                        region.region_id,
                        hex::encode(&region.start_key),
                        hex::encode(&region.end_key)
                    ),
                });
            }
        }

        for pair in regions.windows(2) {
            let (left, right) = (&pair[0], &pair[1]);
            if left.end_key.is_empty() || left.end_key > right.start_key {
                return Err(StoreError::InvalidMetadata {
                    table,
                    reason: format!(
                        "regions {} and {} overlap",
                        left.region_id, right.region_id
                    ),
                });
            }
            if left.end_key < right.start_key {
                return Err(StoreError::InvalidMetadata {
                    table,
                    reason: format!(
                        "gap between regions {} and {} ({}..{})",
                        left.region_id,
                        right.region_id,
                        hex::encode(&left.end_key),
                        hex::encode(&right.start_key)
                    ),
                });
            }
        }

        Ok(Self { table, regions })
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Fetches and normalises region metadata for `table` through a session.
pub async fn fetch_topology(
    session: &dyn StoreSession,
    table: &str,
) -> Result<TableTopology, StoreError> {
    let regions = session.region_boundaries(table).await?;
    TableTopology::from_regions(table, regions)
}

/// Builds a contiguous region layout from sorted split points.
///
/// `n` split keys produce `n + 1` regions; owners are assigned round-robin.
pub fn regions_from_splits(
    split_keys: &[Vec<u8>],
    owners: &[String],
) -> anyhow::Result<Vec<RegionBoundary>> {
    for pair in split_keys.windows(2) {
        anyhow::ensure!(
            pair[0] < pair[1],
            "split keys must be strictly increasing ({} then {})",
            hex::encode(&pair[0]),
            hex::encode(&pair[1])
        );
    }
    anyhow::ensure!(
        split_keys.iter().all(|key| !key.is_empty()),
        "split keys must not be empty"
    );

    let mut bounds = Vec::with_capacity(split_keys.len() + 2);
    bounds.push(Vec::new());
    bounds.extend(split_keys.iter().cloned());
    bounds.push(Vec::new());

    let regions = bounds
        .windows(2)
        .enumerate()
        .map(|(idx, pair)| {
            let region = RegionBoundary::new(idx as u64 + 1, pair[0].clone(), pair[1].clone());
            match owners.get(idx % owners.len().max(1)) {
                Some(owner) => region.with_owner(owner.clone()),
                None => region,
            }
        })
        .collect::<Vec<_>>();
    TableTopology::from_regions("<splits>", regions.clone()).context("build region layout")?;
    Ok(regions)
}

/// Returns the lexicographically larger of two start bounds.
pub fn max_bytes(left: &[u8], right: &[u8]) -> Vec<u8> {
    // Empty `right` is unbounded, so `left` is at least as tight.
    if right.is_empty() || left >= right {
        left.to_vec()
    } else {
        right.to_vec()
    }
}

/// Returns the tighter exclusive end bound across two optional bounds.
pub fn min_end_bound(left: &[u8], right: &[u8]) -> Vec<u8> {
    match (left.is_empty(), right.is_empty()) {
        (true, true) => Vec::new(),
        (true, false) => right.to_vec(),
        (false, true) => left.to_vec(),
        (false, false) => {
            if left <= right {
                left.to_vec()
            } else {
                right.to_vec()
            }
        }
    }
}

/// Checks whether `key` is within `[start, end)` where empty bounds are open.
pub fn key_in_range(key: &[u8], start: &[u8], end: &[u8]) -> bool {
    let in_start = start.is_empty() || key >= start;
    let in_end = end.is_empty() || key < end;
    in_start && in_end
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: u64, start: &str, end: &str) -> RegionBoundary {
        RegionBoundary::new(id, start.as_bytes(), end.as_bytes())
    }

    #[test]
    fn layout_is_sorted_by_start_key() {
        let topology = TableTopology::from_regions(
            "t",
            vec![region(3, "m", ""), region(1, "", "f"), region(2, "f", "m")],
        )
        .expect("valid layout");
        let ids = topology
            .regions
            .iter()
            .map(|region| region.region_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn overlapping_and_gapped_layouts_are_rejected() {
        let overlap = TableTopology::from_regions("t", vec![region(1, "a", "g"), region(2, "f", "m")]);
        assert!(matches!(overlap, Err(StoreError::InvalidMetadata { .. })));

        let open_middle = TableTopology::from_regions("t", vec![region(1, "a", ""), region(2, "f", "m")]);
        assert!(open_middle.is_err());

        let gap = TableTopology::from_regions("t", vec![region(1, "a", "f"), region(2, "g", "m")]);
        assert!(gap.is_err());

        let inverted = TableTopology::from_regions("t", vec![region(1, "m", "a")]);
        assert!(inverted.is_err());
    }

    #[test]
    fn splits_produce_contiguous_regions() {
        let regions = regions_from_splits(
            &[b"f".to_vec(), b"m".to_vec()],
            &["node-a".to_string(), "node-b".to_string()],
        )
        .expect("regions");
        assert_eq!(regions.len(), 3);
        assert!(regions[0].start_key.is_empty());
        assert_eq!(regions[1].start_key, b"f".to_vec());
        assert!(regions[2].end_key.is_empty());
        assert_eq!(regions[2].owner.as_deref(), Some("node-a"));

        assert!(regions_from_splits(&[b"m".to_vec(), b"f".to_vec()], &[]).is_err());
    }

    #[test]
    fn bound_helpers_respect_open_ends() {
        assert_eq!(max_bytes(b"c", b""), b"c".to_vec());
        assert_eq!(max_bytes(b"", b"f"), b"f".to_vec());
        assert_eq!(min_end_bound(b"", b"t"), b"t".to_vec());
        assert_eq!(min_end_bound(b"m", b"t"), b"m".to_vec());
        assert!(key_in_range(b"p5", b"m", b"t"));
        assert!(!key_in_range(b"t", b"m", b"t"));
        assert!(key_in_range(b"zzz", b"m", b""));
    }
}
