/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Data-parallel gradient synchronization for a differentiated program.
//!
//! The rewrite splices three kinds of operators into the main program:
//!
//! 1. a `scale` right after the loss-gradient operator, dividing the
//!    loss gradient by the replica count so that the summed gradients
//!    come out averaged;
//! 2. after every backward operator that produces gradients of
//!    replicated parameters, a compute-stream sync followed by one
//!    `c_allreduce_sum` per gradient, on each data-parallel ring;
//! 3. one communication-stream sync per ring right before the first
//!    optimizer operator, so no update reads a gradient still in flight.
//!
//! Insertion points are found by scanning for [`OpRole`] markers and
//! every splice goes behind the scanned operator, so positions that are
//! still to be visited by a reverse scan never move.

use std::collections::BTreeMap;

use megatron_graph::GraphError;
use megatron_graph::OpRole;
use megatron_graph::OpType;
use megatron_graph::Operator;
use megatron_graph::Program;
use megatron_topology::RingId;
use serde::Deserialize;
use serde::Serialize;

/// The program handed to the rewrite breaks the contract of the pass
/// that differentiated it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RewriteInvariantError {
    #[error("no loss gradient operator in program")]
    MissingLossGradient,

    #[error("loss gradient operator `{op_type}` has no output")]
    LossGradientWithoutOutput { op_type: String },

    #[error("no optimizer operator in program to synchronize gradients before")]
    MissingOptimizer,

    #[error("no data parallel rings to synchronize over")]
    EmptyRingList,

    #[error("replica count must be at least 1")]
    ZeroReplicaCount,

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// What a rewrite inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewriteSummary {
    /// The loss gradient variable that was scaled.
    pub loss_grad: String,
    pub scale: f64,
    /// Reduced gradients per ring, in program order.
    pub reduced: BTreeMap<RingId, Vec<String>>,
    /// Gradients of sharded parameters left out of the reduction.
    pub skipped_sharded: Vec<String>,
}

/// A backward operator with gradients to reduce, and those gradients.
struct ReductionSite {
    index: usize,
    grads: Vec<String>,
}

/// Rewrites a differentiated program for data-parallel training.
#[derive(Debug, Clone)]
pub struct GradientSyncRewriter {
    ring_ids: Vec<RingId>,
    replica_count: usize,
    sync_sharded_grads: bool,
}

impl GradientSyncRewriter {
    /// Reduce over each of `ring_ids`, treating every ring as one
    /// replica.
    pub fn new(ring_ids: Vec<RingId>) -> Self {
        let replica_count = ring_ids.len();
        Self {
            ring_ids,
            replica_count,
            sync_sharded_grads: false,
        }
    }

    /// Scale the loss gradient by `1 / replica_count` instead.
    pub fn with_replica_count(mut self, replica_count: usize) -> Self {
        self.replica_count = replica_count;
        self
    }

    /// Also reduce gradients of sharded parameters.
    pub fn sync_sharded_grads(mut self, sync: bool) -> Self {
        self.sync_sharded_grads = sync;
        self
    }

    pub fn ring_ids(&self) -> &[RingId] {
        &self.ring_ids
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    /// Check that `program` can be rewritten, without touching it.
    pub fn validate(&self, program: &Program) -> Result<(), RewriteInvariantError> {
        self.check(program).map(|_| ())
    }

    /// Rewrite `program` in place. Fails before inserting anything if
    /// the program is missing an insertion point.
    pub fn rewrite(&self, program: &mut Program) -> Result<RewriteSummary, RewriteInvariantError> {
        let (loss_index, loss_grad) = self.check(program)?;

        let scale = 1.0 / self.replica_count as f64;
        let block = program.global_block_mut();
        block.insert_op(
            loss_index + 1,
            Operator::new(OpType::Scale, OpRole::Backward)
                .with_input("X", &loss_grad)
                .with_output("Out", &loss_grad)
                .with_attr("scale", scale),
        )?;
        tracing::debug!("scaled {} by {} at op {}", loss_grad, scale, loss_index + 1);

        let mut skipped_sharded = Vec::new();
        let mut reduced = BTreeMap::new();
        for &ring_id in &self.ring_ids {
            let sites = self.reduction_sites(program, &mut skipped_sharded)?;
            let grads = insert_allreduce_ops(program, ring_id, &sites)?;
            reduced.insert(ring_id, grads);
        }

        skipped_sharded.sort();
        skipped_sharded.dedup();
        if !skipped_sharded.is_empty() {
            tracing::warn!(
                "gradients of sharded parameters are not reduced across data parallel replicas: {}",
                skipped_sharded.join(",")
            );
        }

        Ok(RewriteSummary {
            loss_grad,
            scale,
            reduced,
            skipped_sharded,
        })
    }

    /// Verify every precondition and return the position and output of
    /// the loss gradient operator.
    fn check(&self, program: &Program) -> Result<(usize, String), RewriteInvariantError> {
        if self.ring_ids.is_empty() {
            return Err(RewriteInvariantError::EmptyRingList);
        }
        if self.replica_count == 0 {
            return Err(RewriteInvariantError::ZeroReplicaCount);
        }

        let block = program.global_block();
        let (loss_index, loss_op) = block
            .ops()
            .iter()
            .enumerate()
            .rev()
            .find(|(_, op)| op.role() == OpRole::LossGradient)
            .ok_or(RewriteInvariantError::MissingLossGradient)?;
        let loss_grad = loss_op.output_arg_names().next().ok_or_else(|| {
            RewriteInvariantError::LossGradientWithoutOutput {
                op_type: loss_op.op_type().to_string(),
            }
        })?;
        block.require_var(loss_grad)?;

        let sites = self.reduction_sites(program, &mut Vec::new())?;
        if !sites.is_empty() && first_optimizer(program).is_none() {
            return Err(RewriteInvariantError::MissingOptimizer);
        }
        Ok((loss_index, loss_grad.to_string()))
    }

    /// Backward operators carrying gradients to reduce, last operator
    /// first. Gradients of sharded parameters that are left out are
    /// appended to `skipped`.
    fn reduction_sites(
        &self,
        program: &Program,
        skipped: &mut Vec<String>,
    ) -> Result<Vec<ReductionSite>, RewriteInvariantError> {
        let block = program.global_block();
        let mut sites = Vec::new();
        for (index, op) in block.ops().iter().enumerate().rev() {
            match op.role() {
                OpRole::Backward => {}
                OpRole::Forward | OpRole::LossGradient | OpRole::Optimizer => continue,
            }
            let mut grads = Vec::new();
            for (param, grad) in op.role_vars() {
                let param = block.require_var(param)?;
                block.require_var(grad)?;
                if param.is_distributed() && !self.sync_sharded_grads {
                    skipped.push(grad.clone());
                    continue;
                }
                grads.push(grad.clone());
            }
            if !grads.is_empty() {
                sites.push(ReductionSite { index, grads });
            }
        }
        Ok(sites)
    }
}

fn first_optimizer(program: &Program) -> Option<usize> {
    program
        .global_block()
        .ops()
        .iter()
        .position(|op| op.role() == OpRole::Optimizer)
}

/// Splice the reductions for one ring after each site, then the
/// pre-optimizer sync. Sites must be ordered last operator first.
/// Returns the reduced gradients in program order.
fn insert_allreduce_ops(
    program: &mut Program,
    ring_id: RingId,
    sites: &[ReductionSite],
) -> Result<Vec<String>, RewriteInvariantError> {
    let block = program.global_block_mut();
    for site in sites {
        let mut offset = site.index + 1;
        let first = &site.grads[0];
        block.insert_op(
            offset,
            Operator::new(OpType::SyncCalcStream, OpRole::Backward)
                .with_input("X", first)
                .with_output("Out", first),
        )?;
        for grad in &site.grads {
            offset += 1;
            block.insert_op(
                offset,
                Operator::new(OpType::AllReduceSum, OpRole::Backward)
                    .with_input("X", grad)
                    .with_output("Out", grad)
                    .with_attr("ring_id", ring_id.0),
            )?;
        }
        tracing::debug!(
            "reduce {} on {} after op {}",
            site.grads.join(","),
            ring_id,
            site.index
        );
    }

    // The earliest reduced gradient is the last one the reverse scan
    // touched.
    let Some(last_touched) = sites.last().and_then(|site| site.grads.last()) else {
        tracing::debug!("no gradients to reduce on {}", ring_id);
        return Ok(Vec::new());
    };
    let index = first_optimizer(program).ok_or(RewriteInvariantError::MissingOptimizer)?;
    program.global_block_mut().insert_op(
        index,
        Operator::new(OpType::SyncCommStream, OpRole::Backward)
            .with_input("X", last_touched)
            .with_output("Out", last_touched)
            .with_attr("ring_id", ring_id.0),
    )?;
    tracing::debug!("sync {} before optimizer op {}", ring_id, index);

    Ok(sites
        .iter()
        .rev()
        .flat_map(|site| site.grads.iter().cloned())
        .collect())
}

/// Rewrite `program` for data-parallel training over `ring_ids`, with
/// one replica per ring.
pub fn rewrite_for_data_parallelism(
    program: &mut Program,
    ring_ids: &[RingId],
) -> Result<RewriteSummary, RewriteInvariantError> {
    GradientSyncRewriter::new(ring_ids.to_vec()).rewrite(program)
}
