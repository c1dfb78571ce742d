/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fixtures shared by unit and integration tests.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use megatron_graph::OpRole;
use megatron_graph::Operator;
use megatron_graph::Program;
use megatron_graph::Variable;
use megatron_topology::BootstrapTimeoutError;
use megatron_topology::Endpoint;
use megatron_topology::ReadinessWaiter;

/// A startup program and the differentiated main program it initializes.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingProgram {
    pub startup: Program,
    pub main: Program,
}

/// Builds a small multi-layer training program: one `mul` per
/// parameter, a `mean` loss, a `fill_constant` loss gradient, backward
/// operators in reverse layer order and one `sgd` per parameter.
#[derive(Debug, Clone)]
pub struct TrainingProgramBuilder {
    params: Vec<(String, bool)>,
    fuse_backward: bool,
    loss_gradient: bool,
    optimizer: bool,
}

impl Default for TrainingProgramBuilder {
    fn default() -> Self {
        Self {
            params: Vec::new(),
            fuse_backward: false,
            loss_gradient: true,
            optimizer: true,
        }
    }
}

impl TrainingProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer with parameter `name`, sharded if `distributed`.
    pub fn parameter(mut self, name: &str, distributed: bool) -> Self {
        self.params.push((name.to_string(), distributed));
        self
    }

    /// Produce every parameter gradient from a single `fused_grad`
    /// operator.
    pub fn fuse_backward(mut self, fuse: bool) -> Self {
        self.fuse_backward = fuse;
        self
    }

    pub fn without_loss_gradient(mut self) -> Self {
        self.loss_gradient = false;
        self
    }

    pub fn without_optimizer(mut self) -> Self {
        self.optimizer = false;
        self
    }

    pub fn build(&self) -> TrainingProgram {
        TrainingProgram {
            startup: self.build_startup(),
            main: self.build_main(),
        }
    }

    fn parameter_var(name: &str, distributed: bool) -> Variable {
        Variable::parameter(name).distributed(distributed)
    }

    fn build_startup(&self) -> Program {
        let mut program = Program::new();
        let block = program.global_block_mut();
        for (name, distributed) in &self.params {
            block
                .create_var(Self::parameter_var(name, *distributed))
                .map(|_| ())
                .unwrap_or_else(|err| panic!("duplicate parameter {}: {}", name, err));
            block.append_op(
                Operator::new("uniform_random", OpRole::Forward).with_output("Out", name),
            );
        }
        program
    }

    fn build_main(&self) -> Program {
        let mut program = Program::new();
        let block = program.global_block_mut();
        let mut vars = vec![Variable::tensor("x")];
        for (i, (name, distributed)) in self.params.iter().enumerate() {
            vars.push(Self::parameter_var(name, *distributed));
            vars.push(Variable::tensor(format!("fc_{}.out", i)));
            vars.push(Variable::tensor(format!("{}@GRAD", name)));
        }
        vars.push(Variable::tensor("loss"));
        vars.push(Variable::tensor("loss@GRAD"));
        for var in vars {
            block
                .create_var(var)
                .map(|_| ())
                .unwrap_or_else(|err| panic!("bad training program: {}", err));
        }

        let mut input = "x".to_string();
        for (i, (name, _)) in self.params.iter().enumerate() {
            let out = format!("fc_{}.out", i);
            block.append_op(
                Operator::new("mul", OpRole::Forward)
                    .with_input("X", &input)
                    .with_input("Y", name)
                    .with_output("Out", &out),
            );
            input = out;
        }
        block.append_op(
            Operator::new("mean", OpRole::Forward)
                .with_input("X", &input)
                .with_output("Out", "loss"),
        );
        if self.loss_gradient {
            block.append_op(
                Operator::new("fill_constant", OpRole::LossGradient)
                    .with_output("Out", "loss@GRAD")
                    .with_attr("value", 1.0),
            );
        }

        if self.fuse_backward {
            let mut op =
                Operator::new("fused_grad", OpRole::Backward).with_input("Out@GRAD", "loss@GRAD");
            for (name, _) in &self.params {
                op = op
                    .with_output("Y@GRAD", format!("{}@GRAD", name))
                    .with_role_var(name, format!("{}@GRAD", name));
            }
            block.append_op(op);
        } else {
            for (name, _) in self.params.iter().rev() {
                block.append_op(
                    Operator::new("mul_grad", OpRole::Backward)
                        .with_input("Y", name)
                        .with_input("Out@GRAD", "loss@GRAD")
                        .with_output("Y@GRAD", format!("{}@GRAD", name))
                        .with_role_var(name, format!("{}@GRAD", name)),
                );
            }
        }

        if self.optimizer {
            for (name, _) in &self.params {
                block.append_op(
                    Operator::new("sgd", OpRole::Optimizer)
                        .with_input("Param", name)
                        .with_input("Grad", format!("{}@GRAD", name))
                        .with_output("ParamOut", name),
                );
            }
        }
        program
    }
}

/// The operator type names of `program`, in order.
pub fn op_names(program: &Program) -> Vec<String> {
    program
        .global_block()
        .ops()
        .iter()
        .map(|op| op.op_type().name().to_string())
        .collect()
}

/// A readiness waiter that records every wait and either succeeds at
/// once or times out at once.
#[derive(Debug, Default)]
pub struct RecordingReadiness {
    calls: Mutex<Vec<Vec<Endpoint>>>,
    unreachable: bool,
}

impl RecordingReadiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// A waiter for which no endpoint ever becomes reachable.
    pub fn unreachable() -> Self {
        Self {
            calls: Mutex::default(),
            unreachable: true,
        }
    }

    /// The endpoint lists waited on, in call order.
    pub fn calls(&self) -> Vec<Vec<Endpoint>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ReadinessWaiter for RecordingReadiness {
    async fn wait_until_reachable(
        &self,
        endpoints: &[Endpoint],
    ) -> Result<(), BootstrapTimeoutError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(endpoints.to_vec());
        if self.unreachable {
            return Err(BootstrapTimeoutError {
                pending: endpoints.to_vec(),
                waited: Duration::ZERO,
            });
        }
        Ok(())
    }
}
