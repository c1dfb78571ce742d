/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Hybrid model-parallel and data-parallel training setup.
//!
//! Workers are grouped into model-parallel groups of consecutive ranks;
//! workers holding the same shard position in different groups form a
//! data-parallel ring. This crate rewrites a job's programs accordingly:
//!
//! - [`bootstrap`] emits communicator initialization for every ring a
//!   worker joins into the startup program;
//! - [`broadcast`] makes replicated parameters start out identical on
//!   every replica;
//! - [`grad_sync`] makes the main program average gradients of
//!   replicated parameters across replicas before the optimizer runs.
//!
//! [`ModelParallelOptimizer`] composes the three.

pub mod bootstrap;
pub mod broadcast;
pub mod config;
mod error;
pub mod grad_sync;
pub mod logging;
pub mod optimizer;
pub mod test_utils;

pub use bootstrap::CommInitializer;
pub use bootstrap::RingBootstrap;
pub use broadcast::broadcast_parameters;
pub use config::Config;
pub use error::Error;
pub use grad_sync::GradientSyncRewriter;
pub use grad_sync::RewriteInvariantError;
pub use grad_sync::RewriteSummary;
pub use grad_sync::rewrite_for_data_parallelism;
pub use optimizer::ModelParallelOptimizer;
pub use optimizer::SetupReport;
