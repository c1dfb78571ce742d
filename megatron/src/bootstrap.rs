/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Emission of communicator bootstrap operators into the startup
//! program.
//!
//! Every ring a worker belongs to gets a pair of operators: one that
//! generates the communicator id (the root creates it and ships it to
//! the other members) and one that initializes the communicator from
//! that id. Rings must be initialized one after the other, model ring
//! first: a member still busy with an earlier communicator would
//! otherwise miss the id exchange of the next one.

use itertools::Itertools;
use megatron_graph::OpRole;
use megatron_graph::OpType;
use megatron_graph::Operator;
use megatron_graph::Program;
use megatron_graph::UniqueNameGenerator;
use megatron_graph::Variable;
use megatron_topology::ConfigurationError;
use megatron_topology::Endpoint;
use megatron_topology::ReadinessWaiter;
use megatron_topology::Ring;
use megatron_topology::RingId;
use serde::Serialize;

use crate::error::Error;

const COMM_ID_PREFIX: &str = "nccl_id";

/// What was emitted for one ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RingBootstrap {
    pub ring_id: RingId,
    pub nranks: usize,
    /// This worker's rank within the ring.
    pub rank: usize,
    /// The variable carrying the communicator id.
    pub comm_id_var: String,
    /// Whether this worker waited for the other members first.
    pub waited: bool,
}

/// Emits communicator bootstrap operators for the rings of one worker.
#[derive(Debug)]
pub struct CommInitializer<'a> {
    waiter: &'a dyn ReadinessWaiter,
    wait_port: bool,
    names: UniqueNameGenerator,
}

impl<'a> CommInitializer<'a> {
    pub fn new(waiter: &'a dyn ReadinessWaiter, wait_port: bool) -> Self {
        Self {
            waiter,
            wait_port,
            names: UniqueNameGenerator::new(),
        }
    }

    /// Append the bootstrap operators of `ring` for global rank `rank`
    /// to `startup`. `endpoints` is the job's endpoint list, indexed by
    /// global rank.
    ///
    /// The ring root waits for the other members before anything is
    /// emitted, so a readiness timeout leaves `startup` untouched.
    pub async fn init_ring(
        &mut self,
        startup: &mut Program,
        ring: &Ring,
        rank: usize,
        endpoints: &[Endpoint],
    ) -> Result<RingBootstrap, Error> {
        let ring_rank = ring
            .rank_in_ring(rank)
            .ok_or_else(|| ConfigurationError::NotRingMember {
                rank,
                ring: ring.to_string(),
            })?;
        let members = ring
            .ranks()
            .iter()
            .map(|&member| {
                endpoints
                    .get(member)
                    .cloned()
                    .ok_or(ConfigurationError::RankOutOfRange {
                        rank: member,
                        workers: endpoints.len(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let current = &members[ring_rank];
        let others: Vec<Endpoint> = members
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != ring_rank)
            .map(|(_, ep)| ep.clone())
            .collect();

        let waited = ring_rank == 0 && self.wait_port && !others.is_empty();
        if waited {
            tracing::info!(
                "{} root {} waiting for {}",
                ring,
                current,
                others.iter().join(",")
            );
            self.waiter.wait_until_reachable(&others).await?;
        }

        let block = startup.global_block_mut();
        let comm_id_var = loop {
            let name = self.names.generate(COMM_ID_PREFIX);
            if !block.has_var(&name) {
                break name;
            }
        };
        block.create_var(Variable::raw(&comm_id_var).persistable(true))?;

        let ring_id = ring.id().0;
        block.append_op(
            Operator::new(OpType::GenCommId, OpRole::Forward)
                .with_output("Out", &comm_id_var)
                .with_attr("rank", ring_rank)
                .with_attr("endpoint", current.to_string())
                .with_attr(
                    "other_endpoints",
                    others.iter().map(Endpoint::to_string).collect::<Vec<_>>(),
                )
                .with_attr("ring_id", ring_id),
        );
        block.append_op(
            Operator::new(OpType::CommInit, OpRole::Forward)
                .with_input("X", &comm_id_var)
                .with_attr("nranks", ring.nranks())
                .with_attr("rank", ring_rank)
                .with_attr("ring_id", ring_id),
        );
        tracing::debug!(
            "emitted bootstrap for {} as ring rank {} of {} via {}",
            ring,
            ring_rank,
            ring.nranks(),
            comm_id_var
        );

        Ok(RingBootstrap {
            ring_id: ring.id(),
            nranks: ring.nranks(),
            rank: ring_rank,
            comm_id_var,
            waited,
        })
    }
}
