/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Communicator topology for hybrid model-parallel and data-parallel
//! training.
//!
//! Given the ordered worker endpoints of a job and the size of one
//! model-parallel group, [`build_topology`] computes the rings every
//! worker joins. [`RoleMaker`] tells a worker who it is within the job
//! and [`ReadinessWaiter`] lets ring roots hold off communicator
//! bootstrap until every member is listening.

mod endpoint;
mod error;
mod readiness;
mod ring;
mod role;
mod slice;
mod topology;

pub use endpoint::Endpoint;
pub use endpoint::check_unique;
pub use endpoint::local_rank;
pub use endpoint::node_count;
pub use endpoint::workers_per_node;
pub use error::BootstrapTimeoutError;
pub use error::ConfigurationError;
pub use readiness::ReadinessWaiter;
pub use readiness::TcpReadiness;
pub use ring::Ring;
pub use ring::RingId;
pub use ring::RingKind;
pub use role::RoleMaker;
pub use role::StaticRoleMaker;
pub use role::TRAINER_ENDPOINTS_ENV;
pub use role::TRAINER_ID_ENV;
pub use slice::RankIter;
pub use slice::RankSlice;
pub use slice::SliceError;
pub use topology::Placement;
pub use topology::Topology;
pub use topology::build_topology;
