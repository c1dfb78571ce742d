/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::time::Duration;

use itertools::Itertools;

use crate::endpoint::Endpoint;
use crate::slice::SliceError;

/// The job description cannot be turned into a topology. Raised before
/// any program is mutated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigurationError {
    #[error("no worker endpoints provided")]
    NoEndpoints,

    #[error("invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("{workers} workers are not spread evenly over {nodes} nodes: {counts:?}")]
    UnevenNodes {
        workers: usize,
        nodes: usize,
        counts: Vec<(String, usize)>,
    },

    #[error("inner parallelism must be at least 1")]
    ZeroParallelism,

    #[error("inner parallelism {inner_parallelism} does not divide worker count {workers}")]
    IndivisibleParallelism {
        workers: usize,
        inner_parallelism: usize,
    },

    #[error("rank {rank} out of range for {workers} workers")]
    RankOutOfRange { rank: usize, workers: usize },

    #[error("rank {rank} is not a member of {ring}")]
    NotRingMember { rank: usize, ring: String },

    #[error("job reports {workers} workers but lists {endpoints} endpoints")]
    WorkerCountMismatch { workers: usize, endpoints: usize },

    #[error("endpoint {endpoint} is listed more than once")]
    DuplicateEndpoint { endpoint: Endpoint },

    #[error("missing environment variable {name}")]
    MissingEnv { name: String },

    #[error("invalid value `{value}` for environment variable {name}: {reason}")]
    InvalidEnv {
        name: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Slice(#[from] SliceError),
}

/// Ring members did not become reachable within the readiness timeout.
/// The ring is left uninitialized and the job cannot proceed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("endpoints {} not reachable after {waited:?}", .pending.iter().join(","))]
pub struct BootstrapTimeoutError {
    pub pending: Vec<Endpoint>,
    pub waited: Duration,
}
