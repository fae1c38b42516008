use bytes::Bytes;
use dashmap::DashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::error::{ControllerError, Result};
use crate::geometry::GeometricRegion;
use crate::model::{JobId, LdoId, LogicalObject, PartitionId};

/// Registry of partitions and logical data definitions.
///
/// Definitions are immutable once accepted; the registry stores geometry
/// without interpreting it.
pub struct DataRegistry {
    partitions: DashMap<PartitionId, GeometricRegion>,
    objects: DashMap<LdoId, LogicalObject>,
    by_partition: DashMap<PartitionId, Vec<LdoId>>,
}

impl DataRegistry {
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            objects: DashMap::new(),
            by_partition: DashMap::new(),
        }
    }

    pub fn define_partition(&self, id: PartitionId, region: GeometricRegion) {
        debug!(partition = id, "partition defined");
        self.partitions.insert(id, region);
    }

    pub fn partition_region(&self, id: PartitionId) -> Option<GeometricRegion> {
        self.partitions.get(&id).map(|r| *r)
    }

    /// Accepts a new logical datum. Fails on duplicate ids or an unknown
    /// partition.
    pub fn define_data(
        &self,
        name: String,
        ldo_id: LdoId,
        partition: PartitionId,
        neighbor_partitions: SmallVec<[PartitionId; 6]>,
        parent_job: JobId,
        params: Bytes,
    ) -> Result<()> {
        if self.objects.contains_key(&ldo_id) {
            return Err(ControllerError::DataAlreadyDefined(ldo_id));
        }
        let region = self
            .partitions
            .get(&partition)
            .map(|r| *r)
            .ok_or(ControllerError::UnknownPartition(partition))?;

        self.objects.insert(
            ldo_id,
            LogicalObject {
                id: ldo_id,
                name,
                partition,
                neighbor_partitions,
                region,
                parent_job,
                params,
            },
        );
        self.by_partition.entry(partition).or_default().push(ldo_id);
        debug!(ldo = ldo_id, partition, "logical data defined");
        Ok(())
    }

    pub fn get(&self, id: LdoId) -> Result<LogicalObject> {
        self.objects
            .get(&id)
            .map(|o| o.clone())
            .ok_or(ControllerError::UnknownData(id))
    }

    pub fn contains(&self, id: LdoId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn ids(&self) -> Vec<LdoId> {
        self.objects.iter().map(|o| *o.key()).collect()
    }

    pub fn in_partition(&self, partition: PartitionId) -> Vec<LdoId> {
        self.by_partition
            .get(&partition)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Logical data whose region overlaps `region`.
    pub fn intersecting(&self, region: &GeometricRegion) -> Vec<LdoId> {
        self.objects
            .iter()
            .filter(|o| o.region.intersects(region))
            .map(|o| o.id)
            .collect()
    }
}

impl Default for DataRegistry {
    fn default() -> Self {
        Self::new()
    }
}
