/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The model-parallel setup pipeline.
//!
//! [`ModelParallelOptimizer::apply`] runs once per worker before the
//! first training iteration. It connects the worker to its rings in the
//! startup program and, when the job has more than one model-parallel
//! group, makes the main program average gradients across groups.

use std::sync::Arc;

use megatron_graph::Program;
use megatron_topology::ConfigurationError;
use megatron_topology::ReadinessWaiter;
use megatron_topology::RoleMaker;
use megatron_topology::StaticRoleMaker;
use megatron_topology::build_topology;
use megatron_topology::check_unique;
use megatron_topology::local_rank;
use megatron_topology::node_count;
use megatron_topology::workers_per_node;
use serde::Serialize;

use crate::bootstrap::CommInitializer;
use crate::bootstrap::RingBootstrap;
use crate::broadcast::broadcast_parameters;
use crate::config::Config;
use crate::error::Error;
use crate::grad_sync::GradientSyncRewriter;
use crate::grad_sync::RewriteSummary;

/// What [`ModelParallelOptimizer::apply`] did for this worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetupReport {
    pub rank: usize,
    pub node_count: usize,
    pub workers_per_node: usize,
    /// The worker's device index on its node.
    pub local_rank: usize,
    pub mp_group: usize,
    pub mp_rank: usize,
    pub mp_group_count: usize,
    pub model_ring: RingBootstrap,
    pub data_ring: Option<RingBootstrap>,
    /// Replicated parameters broadcast from the data ring root.
    pub broadcast: Vec<String>,
    /// `None` under pure model parallelism.
    pub rewrite: Option<RewriteSummary>,
}

/// Sets a worker up for hybrid model-parallel and data-parallel
/// training.
#[derive(Debug)]
pub struct ModelParallelOptimizer {
    config: Config,
    role: Arc<dyn RoleMaker>,
    waiter: Arc<dyn ReadinessWaiter>,
    applied: bool,
}

impl ModelParallelOptimizer {
    pub fn new(
        config: Config,
        role: Arc<dyn RoleMaker>,
        waiter: Arc<dyn ReadinessWaiter>,
    ) -> Self {
        Self {
            config,
            role,
            waiter,
            applied: false,
        }
    }

    /// Configuration and membership from the environment, waiting for
    /// peers over TCP.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let config = Config::from_env();
        config.validate()?;
        let role = StaticRoleMaker::from_env()?;
        let waiter = config.tcp_readiness();
        Ok(Self::new(config, Arc::new(role), Arc::new(waiter)))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Emit communicator bootstrap and parameter broadcast into
    /// `startup` and gradient synchronization into `main`.
    ///
    /// Configuration and program contract violations are reported
    /// before either program is touched. May only succeed once.
    pub async fn apply(
        &mut self,
        startup: &mut Program,
        main: &mut Program,
    ) -> Result<SetupReport, Error> {
        if self.applied {
            return Err(Error::AlreadyApplied);
        }
        self.config.validate()?;

        let endpoints = self.role.endpoint_list();
        let workers = self.role.worker_count();
        let rank = self.role.worker_rank();
        if workers != endpoints.len() {
            return Err(ConfigurationError::WorkerCountMismatch {
                workers,
                endpoints: endpoints.len(),
            }
            .into());
        }
        check_unique(endpoints)?;

        let topology = build_topology(endpoints, self.config.inner_parallelism())?;
        let placement = topology.placement(rank)?;
        let nodes = node_count(endpoints);
        let per_node = workers_per_node(endpoints)?;
        let device = local_rank(&endpoints[rank], endpoints)
            .ok_or(ConfigurationError::RankOutOfRange { rank, workers })?;
        tracing::info!(
            rank,
            nodes,
            workers_per_node = per_node,
            local_rank = device,
            mp_group = placement.mp_group,
            mp_rank = placement.mp_rank,
            "model ring {}, data ring {}",
            placement.model_ring,
            placement
                .data_ring
                .map_or_else(|| "none".to_string(), ToString::to_string)
        );

        let rewriter = placement.data_ring.map(|ring| {
            GradientSyncRewriter::new(vec![ring.id()])
                .with_replica_count(topology.mp_group_count())
                .sync_sharded_grads(self.config.sync_sharded_grads())
        });
        if let Some(rewriter) = &rewriter {
            rewriter.validate(main)?;
        }

        self.applied = true;
        let mut init = CommInitializer::new(self.waiter.as_ref(), self.config.wait_port());
        let model_ring = init
            .init_ring(startup, placement.model_ring, rank, endpoints)
            .await?;

        let (data_ring, broadcast, rewrite) = match (placement.data_ring, &rewriter) {
            (Some(ring), Some(rewriter)) => {
                let bootstrap = init.init_ring(startup, ring, rank, endpoints).await?;
                let broadcast = broadcast_parameters(startup, ring.id());
                let summary = rewriter.rewrite(main)?;
                (Some(bootstrap), broadcast, Some(summary))
            }
            _ => {
                tracing::info!("single model parallel group, no data parallel synchronization");
                (None, Vec::new(), None)
            }
        };

        Ok(SetupReport {
            rank,
            node_count: nodes,
            workers_per_node: per_node,
            local_rank: device,
            mp_group: placement.mp_group,
            mp_rank: placement.mp_rank,
            mp_group_count: topology.mp_group_count(),
            model_ring,
            data_ring,
            broadcast,
            rewrite,
        })
    }
}
