/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use megatron_graph::GraphError;
use megatron_topology::BootstrapTimeoutError;
use megatron_topology::ConfigurationError;

use crate::grad_sync::RewriteInvariantError;

/// Everything that can abort model-parallel setup. All of these are
/// fatal: a half-connected topology or half-rewritten program would
/// train with silently wrong numerics.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("communicator bootstrap failed: {0}")]
    BootstrapTimeout(#[from] BootstrapTimeoutError),

    #[error(transparent)]
    RewriteInvariant(#[from] RewriteInvariantError),

    #[error("program edit failed: {0}")]
    Graph(#[from] GraphError),

    #[error("model parallel setup was already applied for this job")]
    AlreadyApplied,
}
