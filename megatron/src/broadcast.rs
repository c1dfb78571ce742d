/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use megatron_graph::OpRole;
use megatron_graph::OpType;
use megatron_graph::Operator;
use megatron_graph::Program;
use megatron_topology::RingId;

/// Append a root-0 broadcast over `ring_id` for every replicated
/// parameter of `startup`, followed by one communication-stream sync.
///
/// Sharded parameters are left alone: each rank already holds its own
/// shard. Returns the broadcast parameters in creation order; when
/// there are none, no sync is emitted either.
pub fn broadcast_parameters(startup: &mut Program, ring_id: RingId) -> Vec<String> {
    let block = startup.global_block_mut();
    let replicated: Vec<String> = block
        .parameters()
        .filter(|param| !param.is_distributed())
        .map(|param| param.name().to_string())
        .collect();

    for param in &replicated {
        block.append_op(
            Operator::new(OpType::Broadcast, OpRole::Forward)
                .with_input("X", param)
                .with_output("Out", param)
                .with_attr("ring_id", ring_id.0)
                .with_attr("root", 0usize),
        );
    }

    if let Some(last) = replicated.last() {
        block.append_op(
            Operator::new(OpType::SyncCommStream, OpRole::Forward)
                .with_input("X", last)
                .with_output("Out", last)
                .with_attr("ring_id", ring_id.0),
        );
    }
    tracing::debug!(
        "broadcast {} replicated parameters on {}",
        replicated.len(),
        ring_id
    );
    replicated
}
