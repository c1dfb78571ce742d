/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end model-parallel setup of whole jobs.

use std::sync::Arc;
use std::time::Duration;

use megatron::Config;
use megatron::Error;
use megatron::ModelParallelOptimizer;
use megatron::RewriteInvariantError;
use megatron::SetupReport;
use megatron::test_utils::RecordingReadiness;
use megatron::test_utils::TrainingProgram;
use megatron::test_utils::TrainingProgramBuilder;
use megatron::test_utils::op_names;
use megatron_graph::AttrValue;
use megatron_graph::OpType;
use megatron_graph::Program;
use megatron_topology::ConfigurationError;
use megatron_topology::Endpoint;
use megatron_topology::RingId;
use megatron_topology::StaticRoleMaker;
use tokio::net::TcpListener;

async fn setup(
    endpoints: &str,
    rank: usize,
    config: Config,
    programs: &mut TrainingProgram,
) -> (Result<SetupReport, Error>, Arc<RecordingReadiness>) {
    let role = StaticRoleMaker::new(Endpoint::parse_list(endpoints).unwrap(), rank).unwrap();
    let waiter = Arc::new(RecordingReadiness::new());
    let mut opt = ModelParallelOptimizer::new(config, Arc::new(role), waiter.clone());
    let result = opt.apply(&mut programs.startup, &mut programs.main).await;
    (result, waiter)
}

fn two_layers() -> TrainingProgram {
    TrainingProgramBuilder::new()
        .parameter("w1", false)
        .parameter("w2", false)
        .build()
}

fn count(program: &Program, op_type: OpType) -> usize {
    program
        .global_block()
        .ops()
        .iter()
        .filter(|op| *op.op_type() == op_type)
        .count()
}

fn ring_ids(program: &Program, op_type: OpType) -> Vec<AttrValue> {
    program
        .global_block()
        .ops()
        .iter()
        .filter(|op| *op.op_type() == op_type)
        .filter_map(|op| op.attr("ring_id").cloned())
        .collect()
}

const FOUR_ON_ONE_NODE: &str = "h1:0,h1:1,h1:2,h1:3";

#[tokio::test]
async fn test_two_groups_of_two() {
    let config = Config::new().with_inner_parallelism(2);
    let expected = [
        // (rank, model ring rank, data ring, data ring rank)
        (0, 0, RingId(1), 0),
        (1, 1, RingId(2), 0),
        (2, 0, RingId(1), 1),
        (3, 1, RingId(2), 1),
    ];
    for (rank, mp_rank, data_ring, data_rank) in expected {
        let mut programs = two_layers();
        let (report, waiter) = setup(FOUR_ON_ONE_NODE, rank, config.clone(), &mut programs).await;
        let report = report.unwrap();

        assert_eq!(report.mp_group_count, 2);
        assert_eq!(report.mp_group, rank / 2);
        assert_eq!(report.mp_rank, mp_rank);
        assert_eq!(report.node_count, 1);
        assert_eq!(report.workers_per_node, 4);
        assert_eq!(report.local_rank, rank);

        assert_eq!(report.model_ring.ring_id, RingId::MODEL);
        assert_eq!(report.model_ring.rank, mp_rank);
        let data = report.data_ring.unwrap();
        assert_eq!(data.ring_id, data_ring);
        assert_eq!(data.rank, data_rank);
        assert_eq!(data.nranks, 2);

        // Model ring first, then the data ring.
        assert_eq!(
            ring_ids(&programs.startup, OpType::CommInit),
            vec![AttrValue::Int(0), AttrValue::Int(data_ring.0 as i64)]
        );
        assert_eq!(report.broadcast, vec!["w1", "w2"]);
        assert_eq!(count(&programs.startup, OpType::Broadcast), 2);
        assert_eq!(count(&programs.startup, OpType::SyncCommStream), 1);

        assert_eq!(count(&programs.main, OpType::Scale), 1);
        assert_eq!(count(&programs.main, OpType::AllReduceSum), 2);
        assert_eq!(
            ring_ids(&programs.main, OpType::AllReduceSum),
            vec![AttrValue::Int(data_ring.0 as i64); 2]
        );

        let waits = waiter.calls();
        match rank {
            0 => assert_eq!(
                waits,
                vec![vec![Endpoint::new("h1", 1)], vec![Endpoint::new("h1", 2)]]
            ),
            1 => assert_eq!(waits, vec![vec![Endpoint::new("h1", 3)]]),
            2 => assert_eq!(waits, vec![vec![Endpoint::new("h1", 3)]]),
            _ => assert!(waits.is_empty()),
        }
    }
}

#[tokio::test]
async fn test_rank_zero_startup_layout() {
    let mut programs = two_layers();
    let (report, _) = setup(
        FOUR_ON_ONE_NODE,
        0,
        Config::new().with_inner_parallelism(2),
        &mut programs,
    )
    .await;
    report.unwrap();
    assert_eq!(
        op_names(&programs.startup),
        vec![
            "uniform_random",
            "uniform_random",
            "c_gen_nccl_id",
            "c_comm_init",
            "c_gen_nccl_id",
            "c_comm_init",
            "c_broadcast",
            "c_broadcast",
            "c_sync_comm_stream",
        ]
    );
    let gen = &programs.startup.global_block().ops()[4];
    assert_eq!(gen.attr("endpoint"), Some(&AttrValue::from("h1:0")));
    assert_eq!(
        gen.attr("other_endpoints"),
        Some(&AttrValue::Strings(vec!["h1:2".to_string()]))
    );
    assert_eq!(gen.output("Out"), ["nccl_id_1".to_string()]);
}

#[tokio::test]
async fn test_single_group_is_pure_model_parallel() {
    let mut programs = two_layers();
    let untouched_main = programs.main.clone();
    let (report, waiter) = setup(
        FOUR_ON_ONE_NODE,
        0,
        Config::new().with_inner_parallelism(4),
        &mut programs,
    )
    .await;
    let report = report.unwrap();

    assert_eq!(report.mp_group_count, 1);
    assert_eq!(report.model_ring.nranks, 4);
    assert_eq!(report.data_ring, None);
    assert!(report.broadcast.is_empty());
    assert_eq!(report.rewrite, None);

    assert_eq!(programs.main, untouched_main);
    assert_eq!(count(&programs.startup, OpType::GenCommId), 1);
    assert_eq!(count(&programs.startup, OpType::CommInit), 1);
    assert_eq!(count(&programs.startup, OpType::Broadcast), 0);
    assert_eq!(count(&programs.startup, OpType::SyncCommStream), 0);
    assert_eq!(
        waiter.calls(),
        vec![Endpoint::parse_list("h1:1,h1:2,h1:3").unwrap()]
    );
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_sharded_parameter_is_neither_broadcast_nor_reduced() {
    let mut programs = TrainingProgramBuilder::new()
        .parameter("p1", false)
        .parameter("p2", true)
        .build();
    let (report, _) = setup("h1:0,h1:1", 0, Config::new(), &mut programs).await;
    let report = report.unwrap();

    assert_eq!(report.broadcast, vec!["p1"]);
    let broadcasts: Vec<_> = programs
        .startup
        .global_block()
        .ops()
        .iter()
        .filter(|op| *op.op_type() == OpType::Broadcast)
        .map(|op| op.input("X").to_vec())
        .collect();
    assert_eq!(broadcasts, vec![vec!["p1".to_string()]]);
    assert_eq!(count(&programs.startup, OpType::SyncCommStream), 1);

    let rewrite = report.rewrite.unwrap();
    assert_eq!(rewrite.scale, 0.5);
    assert_eq!(rewrite.reduced[&RingId(1)], vec!["p1@GRAD"]);
    assert_eq!(rewrite.skipped_sharded, vec!["p2@GRAD"]);
    assert_eq!(count(&programs.main, OpType::SyncCalcStream), 1);
    assert_eq!(count(&programs.main, OpType::AllReduceSum), 1);
    assert!(logs_contain("p2@GRAD"));
}

#[tokio::test]
async fn test_sharded_parameter_reduced_when_enabled() {
    let mut programs = TrainingProgramBuilder::new()
        .parameter("p1", false)
        .parameter("p2", true)
        .build();
    let config = Config::new().with_sync_sharded_grads(true);
    let (report, _) = setup("h1:0,h1:1", 1, config, &mut programs).await;
    let report = report.unwrap();

    // Broadcasting would still clobber the local shard.
    assert_eq!(report.broadcast, vec!["p1"]);
    assert_eq!(count(&programs.main, OpType::AllReduceSum), 2);
}

#[tokio::test]
async fn test_missing_loss_gradient_aborts_before_any_edit() {
    let mut programs = TrainingProgramBuilder::new()
        .parameter("w", false)
        .without_loss_gradient()
        .build();
    let before = programs.clone();
    let (result, waiter) = setup(
        FOUR_ON_ONE_NODE,
        0,
        Config::new().with_inner_parallelism(2),
        &mut programs,
    )
    .await;
    assert!(matches!(
        result,
        Err(Error::RewriteInvariant(
            RewriteInvariantError::MissingLossGradient
        ))
    ));
    assert_eq!(programs, before);
    assert!(waiter.calls().is_empty());
}

#[tokio::test]
async fn test_uneven_nodes_abort_before_any_edit() {
    let mut programs = two_layers();
    let before = programs.clone();
    let (result, _) = setup(
        "h1:0,h1:1,h1:2,h2:0",
        0,
        Config::new().with_inner_parallelism(2),
        &mut programs,
    )
    .await;
    assert!(matches!(
        result,
        Err(Error::Configuration(ConfigurationError::UnevenNodes { .. }))
    ));
    assert_eq!(programs, before);
}

#[tokio::test]
async fn test_two_nodes() {
    let endpoints = "10.0.0.1:6170,10.0.0.1:6171,10.0.0.2:6170,10.0.0.2:6171";
    let mut programs = two_layers();
    let (report, _) = setup(
        endpoints,
        3,
        Config::new().with_inner_parallelism(2),
        &mut programs,
    )
    .await;
    let report = report.unwrap();
    assert_eq!(report.node_count, 2);
    assert_eq!(report.workers_per_node, 2);
    assert_eq!(report.local_rank, 1);
    assert_eq!(report.data_ring.unwrap().ring_id, RingId(2));
}

#[tokio::test]
async fn test_bootstrap_timeout_is_fatal() {
    let role = StaticRoleMaker::new(Endpoint::parse_list(FOUR_ON_ONE_NODE).unwrap(), 0).unwrap();
    let mut opt = ModelParallelOptimizer::new(
        Config::new().with_inner_parallelism(2),
        Arc::new(role),
        Arc::new(RecordingReadiness::unreachable()),
    );
    let mut programs = two_layers();
    let before = programs.clone();
    let result = opt.apply(&mut programs.startup, &mut programs.main).await;
    assert!(matches!(result, Err(Error::BootstrapTimeout(_))));
    // The model ring was never initialized.
    assert_eq!(programs, before);
}

#[tokio::test]
async fn test_tcp_readiness() {
    let root = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoints = format!(
        "127.0.0.1:{},127.0.0.1:{}",
        root.local_addr().unwrap().port(),
        peer.local_addr().unwrap().port()
    );
    let role = StaticRoleMaker::new(Endpoint::parse_list(&endpoints).unwrap(), 0).unwrap();
    let config = Config::new().with_readiness_timeout(Duration::from_secs(10));
    let waiter = config.tcp_readiness();
    let mut opt = ModelParallelOptimizer::new(config, Arc::new(role), Arc::new(waiter));

    let mut programs = two_layers();
    let report = opt
        .apply(&mut programs.startup, &mut programs.main)
        .await
        .unwrap();
    assert!(report.data_ring.unwrap().waited);
    assert!(!report.model_ring.waited);
}
