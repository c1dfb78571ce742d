/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;

use derive_more::Display;
use derive_more::From;
use serde::Deserialize;
use serde::Serialize;

/// Identifies a communicator group within a job. Ring 0 is the
/// model-parallel ring; ring `l + 1` is the data-parallel ring of the
/// workers with local rank `l` in their model-parallel group.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    From,
    Display
)]
#[display("ring{_0}")]
pub struct RingId(pub u32);

impl RingId {
    /// Every model-parallel group uses this id; the groups are disjoint
    /// and initialized independently.
    pub const MODEL: RingId = RingId(0);

    /// The data-parallel ring for workers at `local_rank` within their
    /// model-parallel group.
    pub fn data(local_rank: usize) -> RingId {
        RingId(local_rank as u32 + 1)
    }

    pub fn is_model(&self) -> bool {
        *self == Self::MODEL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RingKind {
    ModelParallel,
    DataParallel,
}

/// An ordered set of global ranks that participate in collectives
/// together. A worker's rank within the ring is its position in
/// `ranks`; position 0 is the ring root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ring {
    id: RingId,
    kind: RingKind,
    ranks: Vec<usize>,
}

impl Ring {
    pub(crate) fn new(id: RingId, kind: RingKind, ranks: Vec<usize>) -> Self {
        Self { id, kind, ranks }
    }

    pub fn id(&self) -> RingId {
        self.id
    }

    pub fn kind(&self) -> RingKind {
        self.kind
    }

    pub fn ranks(&self) -> &[usize] {
        &self.ranks
    }

    pub fn nranks(&self) -> usize {
        self.ranks.len()
    }

    pub fn contains(&self, rank: usize) -> bool {
        self.ranks.contains(&rank)
    }

    /// The position of global `rank` within this ring.
    pub fn rank_in_ring(&self, rank: usize) -> Option<usize> {
        self.ranks.iter().position(|&r| r == rank)
    }

    /// The global rank of the ring root.
    pub fn root(&self) -> Option<usize> {
        self.ranks.first().copied()
    }
}

impl fmt::Display for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.id, self.ranks)
    }
}
