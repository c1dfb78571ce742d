/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Partitioning of a job's workers into communicator rings.
//!
//! Workers are laid out as a row-major `[mp_group_count,
//! inner_parallelism]` [`RankSlice`]. Each row is a model-parallel
//! group (a contiguous block of ranks that jointly holds one instance
//! of the sharded model) and becomes one model ring. Each column links
//! the ranks holding the same shard position in every group and becomes
//! one data-parallel ring:
//!
//! ```text
//!              local rank 0   local rank 1
//!   group 0        0              1          <- model ring (id 0)
//!   group 1        2              3          <- model ring (id 0)
//!                  ^              ^
//!               ring 1         ring 2        (data-parallel rings)
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::endpoint::Endpoint;
use crate::endpoint::workers_per_node;
use crate::error::ConfigurationError;
use crate::ring::Ring;
use crate::ring::RingId;
use crate::ring::RingKind;
use crate::slice::RankSlice;

/// The rings of a job. Computed once at job start and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    inner_parallelism: usize,
    layout: RankSlice,
    /// One per model-parallel group, in group order. All carry
    /// [`RingId::MODEL`].
    model_rings: Vec<Ring>,
    /// Keyed by local rank. Empty when there is a single model-parallel
    /// group.
    data_rings: BTreeMap<usize, Ring>,
}

/// Where one worker sits in a [`Topology`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement<'a> {
    pub rank: usize,
    /// Index of the worker's model-parallel group.
    pub mp_group: usize,
    /// The worker's rank within its model ring, which is also its
    /// shard position.
    pub mp_rank: usize,
    pub model_ring: &'a Ring,
    pub data_ring: Option<&'a Ring>,
}

/// Compute the rings for `endpoints` with model-parallel groups of
/// `inner_parallelism` consecutive ranks.
///
/// Fails if the hosts do not carry equal worker counts or if
/// `inner_parallelism` does not divide the worker count.
pub fn build_topology(
    endpoints: &[Endpoint],
    inner_parallelism: usize,
) -> Result<Topology, ConfigurationError> {
    let workers = endpoints.len();
    let per_node = workers_per_node(endpoints)?;
    if inner_parallelism == 0 {
        return Err(ConfigurationError::ZeroParallelism);
    }
    if workers % inner_parallelism != 0 {
        return Err(ConfigurationError::IndivisibleParallelism {
            workers,
            inner_parallelism,
        });
    }

    let mp_group_count = workers / inner_parallelism;
    let layout = RankSlice::new_row_major([mp_group_count, inner_parallelism]);

    let model_rings = (0..mp_group_count)
        .map(|group| -> Result<Ring, ConfigurationError> {
            let ranks = layout.at(0, group)?.iter().collect();
            Ok(Ring::new(RingId::MODEL, RingKind::ModelParallel, ranks))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut data_rings = BTreeMap::new();
    if mp_group_count > 1 {
        for local_rank in 0..inner_parallelism {
            let ranks = layout.at(1, local_rank)?.iter().collect();
            data_rings.insert(
                local_rank,
                Ring::new(RingId::data(local_rank), RingKind::DataParallel, ranks),
            );
        }
    }

    tracing::info!(
        workers,
        nodes = workers / per_node,
        workers_per_node = per_node,
        inner_parallelism,
        mp_group_count,
        data_rings = data_rings.len(),
        "built model parallel topology"
    );

    Ok(Topology {
        inner_parallelism,
        layout,
        model_rings,
        data_rings,
    })
}

impl Topology {
    pub fn inner_parallelism(&self) -> usize {
        self.inner_parallelism
    }

    pub fn world_size(&self) -> usize {
        self.layout.len()
    }

    /// The number of model-parallel groups, which is also the number of
    /// data-parallel replicas.
    pub fn mp_group_count(&self) -> usize {
        self.model_rings.len()
    }

    /// With a single model-parallel group there is nothing to replicate
    /// across and no data-parallel ring exists.
    pub fn is_pure_model_parallel(&self) -> bool {
        self.data_rings.is_empty()
    }

    pub fn model_rings(&self) -> &[Ring] {
        &self.model_rings
    }

    pub fn data_rings(&self) -> &BTreeMap<usize, Ring> {
        &self.data_rings
    }

    /// The ids of all data-parallel rings, in local-rank order.
    pub fn data_ring_ids(&self) -> Vec<RingId> {
        self.data_rings.values().map(Ring::id).collect()
    }

    pub fn placement(&self, rank: usize) -> Result<Placement<'_>, ConfigurationError> {
        if rank >= self.world_size() {
            return Err(ConfigurationError::RankOutOfRange {
                rank,
                workers: self.world_size(),
            });
        }
        let coords = self.layout.coordinates(rank)?;
        let (mp_group, mp_rank) = (coords[0], coords[1]);
        Ok(Placement {
            rank,
            mp_group,
            mp_rank,
            model_ring: &self.model_rings[mp_group],
            data_ring: self.data_rings.get(&mp_rank),
        })
    }
}
