/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use derive_more::From;
use enum_as_inner::EnumAsInner;
use serde::Deserialize;
use serde::Serialize;

/// The type of error for program mutations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum GraphError {
    #[error("variable `{name}` already exists")]
    DuplicateVariable { name: String },

    #[error("insertion index {index} out of range for block of {len} operators")]
    InsertOutOfRange { index: usize, len: usize },

    #[error("unknown variable `{name}`")]
    UnknownVariable { name: String },
}

/// The execution phase an operator belongs to. Passes dispatch on this
/// tag to find insertion points; in a well formed program all
/// `Forward` operators precede `Backward` ones, which precede
/// `Optimizer` ones.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize
)]
pub enum OpRole {
    Forward,
    Backward,
    /// The backward operator producing the gradient of the loss itself.
    /// Exactly one exists per differentiated program.
    LossGradient,
    Optimizer,
}

impl fmt::Display for OpRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpRole::Forward => write!(f, "forward"),
            OpRole::Backward => write!(f, "backward"),
            OpRole::LossGradient => write!(f, "loss_grad"),
            OpRole::Optimizer => write!(f, "optimize"),
        }
    }
}

/// Operator type tag. The communication operators emitted by the
/// megatron passes are enumerated; everything produced upstream is
/// carried as [`OpType::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    /// Generates a communicator unique id on the ring root and exchanges
    /// it with the other members.
    GenCommId,
    /// Initializes a communicator from a unique id.
    CommInit,
    Broadcast,
    /// Makes the communication stream wait for the compute stream.
    SyncCalcStream,
    AllReduceSum,
    /// Makes the compute stream wait for the communication stream.
    SyncCommStream,
    Scale,
    Other(String),
}

impl OpType {
    /// The wire name understood by the runtime.
    pub fn name(&self) -> &str {
        match self {
            OpType::GenCommId => "c_gen_nccl_id",
            OpType::CommInit => "c_comm_init",
            OpType::Broadcast => "c_broadcast",
            OpType::SyncCalcStream => "c_sync_calc_stream",
            OpType::AllReduceSum => "c_allreduce_sum",
            OpType::SyncCommStream => "c_sync_comm_stream",
            OpType::Scale => "scale",
            OpType::Other(name) => name,
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OpType {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "c_gen_nccl_id" => OpType::GenCommId,
            "c_comm_init" => OpType::CommInit,
            "c_broadcast" => OpType::Broadcast,
            "c_sync_calc_stream" => OpType::SyncCalcStream,
            "c_allreduce_sum" => OpType::AllReduceSum,
            "c_sync_comm_stream" => OpType::SyncCommStream,
            "scale" => OpType::Scale,
            other => OpType::Other(other.to_string()),
        })
    }
}

impl From<&str> for OpType {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(op_type) => op_type,
            Err(never) => match never {},
        }
    }
}

/// An operator attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From, EnumAsInner)]
pub enum AttrValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Strings(Vec<String>),
}

impl From<usize> for AttrValue {
    fn from(v: usize) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        AttrValue::Int(v.into())
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Int(v) => write!(f, "{}", v),
            AttrValue::Float(v) => write!(f, "{}", v),
            AttrValue::Bool(v) => write!(f, "{}", v),
            AttrValue::Str(v) => write!(f, "{:?}", v),
            AttrValue::Strings(v) => write!(f, "{:?}", v),
        }
    }
}

/// A node in the program. Inputs and outputs bind named slots (for
/// example `X` and `Out`) to variable names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operator {
    op_type: OpType,
    role: OpRole,
    inputs: BTreeMap<String, Vec<String>>,
    outputs: BTreeMap<String, Vec<String>>,
    attrs: BTreeMap<String, AttrValue>,
    /// `(parameter, gradient)` pairs produced by a backward operator.
    role_vars: Vec<(String, String)>,
}

impl Operator {
    pub fn new(op_type: impl Into<OpType>, role: OpRole) -> Self {
        Self {
            op_type: op_type.into(),
            role,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            attrs: BTreeMap::new(),
            role_vars: Vec::new(),
        }
    }

    pub fn with_input(mut self, slot: &str, var: impl Into<String>) -> Self {
        self.inputs
            .entry(slot.to_string())
            .or_default()
            .push(var.into());
        self
    }

    pub fn with_output(mut self, slot: &str, var: impl Into<String>) -> Self {
        self.outputs
            .entry(slot.to_string())
            .or_default()
            .push(var.into());
        self
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    /// Record that this operator produces `grad` for `param`.
    pub fn with_role_var(mut self, param: impl Into<String>, grad: impl Into<String>) -> Self {
        self.role_vars.push((param.into(), grad.into()));
        self
    }

    pub fn op_type(&self) -> &OpType {
        &self.op_type
    }

    pub fn role(&self) -> OpRole {
        self.role
    }

    pub fn input(&self, slot: &str) -> &[String] {
        self.inputs.get(slot).map_or(&[], Vec::as_slice)
    }

    pub fn output(&self, slot: &str) -> &[String] {
        self.outputs.get(slot).map_or(&[], Vec::as_slice)
    }

    /// All input variable names, in slot order.
    pub fn input_arg_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.values().flatten().map(String::as_str)
    }

    /// All output variable names, in slot order.
    pub fn output_arg_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.values().flatten().map(String::as_str)
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    pub fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        &self.attrs
    }

    pub fn role_vars(&self) -> &[(String, String)] {
        &self.role_vars
    }
}

fn fmt_slots(f: &mut fmt::Formatter<'_>, slots: &BTreeMap<String, Vec<String>>) -> fmt::Result {
    write!(f, "(")?;
    for (i, (slot, vars)) in slots.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}=[{}]", slot, vars.join(", "))?;
    }
    write!(f, ")")
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.op_type)?;
        fmt_slots(f, &self.inputs)?;
        write!(f, " -> ")?;
        fmt_slots(f, &self.outputs)?;
        if !self.attrs.is_empty() {
            write!(f, " {{")?;
            for (i, (key, value)) in self.attrs.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}={}", key, value)?;
            }
            write!(f, "}}")?;
        }
        write!(f, " @{}", self.role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarType {
    /// A dense tensor value.
    Tensor,
    /// Opaque bytes, such as a communicator unique id.
    Raw,
}

/// A named value in a block's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    name: String,
    var_type: VarType,
    persistable: bool,
    is_parameter: bool,
    /// Set on parameters sharded across the model-parallel ring: every
    /// rank holds a different shard.
    is_distributed: bool,
}

impl Variable {
    pub fn tensor(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            var_type: VarType::Tensor,
            persistable: false,
            is_parameter: false,
            is_distributed: false,
        }
    }

    pub fn raw(name: impl Into<String>) -> Self {
        Self {
            var_type: VarType::Raw,
            ..Self::tensor(name)
        }
    }

    /// A replicated, persistable parameter.
    pub fn parameter(name: impl Into<String>) -> Self {
        Self {
            persistable: true,
            is_parameter: true,
            ..Self::tensor(name)
        }
    }

    pub fn persistable(mut self, persistable: bool) -> Self {
        self.persistable = persistable;
        self
    }

    pub fn distributed(mut self, is_distributed: bool) -> Self {
        self.is_distributed = is_distributed;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn var_type(&self) -> VarType {
        self.var_type
    }

    pub fn is_persistable(&self) -> bool {
        self.persistable
    }

    pub fn is_parameter(&self) -> bool {
        self.is_parameter
    }

    pub fn is_distributed(&self) -> bool {
        self.is_distributed
    }
}

/// An ordered list of operators plus the variables they reference.
/// Variables are kept in creation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    ops: Vec<Operator>,
    vars: BTreeMap<String, Variable>,
    var_order: Vec<String>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self) -> &[Operator] {
        &self.ops
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// Append `op` and return its index.
    pub fn append_op(&mut self, op: Operator) -> usize {
        tracing::trace!("append op {}: {}", self.ops.len(), op);
        self.ops.push(op);
        self.ops.len() - 1
    }

    /// Insert `op` so that it ends up at `index`; the operator currently
    /// at `index` and everything after it shift back by one. `index` may
    /// equal the number of operators, which appends.
    pub fn insert_op(&mut self, index: usize, op: Operator) -> Result<(), GraphError> {
        if index > self.ops.len() {
            return Err(GraphError::InsertOutOfRange {
                index,
                len: self.ops.len(),
            });
        }
        tracing::trace!("insert op {}: {}", index, op);
        self.ops.insert(index, op);
        Ok(())
    }

    pub fn create_var(&mut self, var: Variable) -> Result<&Variable, GraphError> {
        if self.vars.contains_key(var.name()) {
            return Err(GraphError::DuplicateVariable {
                name: var.name().to_string(),
            });
        }
        let name = var.name().to_string();
        self.var_order.push(name.clone());
        Ok(self.vars.entry(name).or_insert(var))
    }

    pub fn var(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    /// Like [`Block::var`], but a missing variable is an error.
    pub fn require_var(&self, name: &str) -> Result<&Variable, GraphError> {
        self.var(name).ok_or_else(|| GraphError::UnknownVariable {
            name: name.to_string(),
        })
    }

    pub fn has_var(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Variables in creation order.
    pub fn vars(&self) -> impl Iterator<Item = &Variable> {
        self.var_order.iter().filter_map(|name| self.vars.get(name))
    }

    /// Parameters in creation order.
    pub fn parameters(&self) -> impl Iterator<Item = &Variable> {
        self.vars().filter(|var| var.is_parameter())
    }
}

/// A program: the unit the rewrite passes mutate. Only the global block
/// is rewritten.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    global: Block,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global_block(&self) -> &Block {
        &self.global
    }

    pub fn global_block_mut(&mut self) -> &mut Block {
        &mut self.global
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, op) in self.global.ops().iter().enumerate() {
            writeln!(f, "{:4}: {}", idx, op)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::*;

    fn op(name: &str) -> Operator {
        Operator::new(name, OpRole::Forward)
    }

    #[test]
    fn test_insert_op_is_insert_before() {
        let mut block = Block::new();
        block.append_op(op("a"));
        block.append_op(op("c"));
        block.insert_op(1, op("b")).unwrap();
        block.insert_op(3, op("d")).unwrap();

        let names: Vec<_> = block.ops().iter().map(|o| o.op_type().name()).collect();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_insert_op_out_of_range() {
        let mut block = Block::new();
        block.append_op(op("a"));
        assert_eq!(
            block.insert_op(2, op("b")),
            Err(GraphError::InsertOutOfRange { index: 2, len: 1 })
        );
        assert_eq!(block.num_ops(), 1);
    }

    #[test]
    fn test_vars_keep_creation_order() {
        let mut block = Block::new();
        block.create_var(Variable::parameter("w2")).unwrap();
        block.create_var(Variable::tensor("x")).unwrap();
        block
            .create_var(Variable::parameter("w1").distributed(true))
            .unwrap();

        let names: Vec<_> = block.vars().map(Variable::name).collect();
        assert_eq!(names, vec!["w2", "x", "w1"]);
        let params: Vec<_> = block.parameters().map(Variable::name).collect();
        assert_eq!(params, vec!["w2", "w1"]);
        assert!(block.var("w1").unwrap().is_distributed());
    }

    #[test]
    fn test_duplicate_var() {
        let mut block = Block::new();
        block.create_var(Variable::tensor("x")).unwrap();
        assert_eq!(
            block.create_var(Variable::raw("x")).unwrap_err(),
            GraphError::DuplicateVariable {
                name: "x".to_string()
            }
        );
        assert_eq!(block.var("x").unwrap().var_type(), VarType::Tensor);
        assert!(block.require_var("y").is_err());
    }

    #[test]
    fn test_op_type_names() {
        for op_type in [
            OpType::GenCommId,
            OpType::CommInit,
            OpType::Broadcast,
            OpType::SyncCalcStream,
            OpType::AllReduceSum,
            OpType::SyncCommStream,
            OpType::Scale,
        ] {
            assert_eq!(OpType::from(op_type.name()), op_type);
        }
        assert_eq!(
            OpType::from("mul_grad"),
            OpType::Other("mul_grad".to_string())
        );
    }

    #[test]
    fn test_operator_accessors() {
        let op = Operator::new(OpType::AllReduceSum, OpRole::Backward)
            .with_input("X", "w@GRAD")
            .with_output("Out", "w@GRAD")
            .with_attr("ring_id", 1usize)
            .with_attr("use_calc_stream", false);

        assert_eq!(op.input("X"), &["w@GRAD".to_string()]);
        assert!(op.input("Y").is_empty());
        assert_eq!(op.output_arg_names().collect::<Vec<_>>(), vec!["w@GRAD"]);
        assert_eq!(op.attr("ring_id").and_then(AttrValue::as_int), Some(&1));
        assert_eq!(
            op.attrs(),
            &btreemap! {
                "ring_id".to_string() => AttrValue::Int(1),
                "use_calc_stream".to_string() => AttrValue::Bool(false),
            }
        );
        assert_eq!(
            op.to_string(),
            "c_allreduce_sum(X=[w@GRAD]) -> (Out=[w@GRAD]) {ring_id=1, use_calc_stream=false} @backward"
        );
    }

    #[test]
    fn test_program_serde() {
        let mut program = Program::new();
        let block = program.global_block_mut();
        block.create_var(Variable::parameter("w")).unwrap();
        block.append_op(
            Operator::new("sgd", OpRole::Optimizer)
                .with_input("Param", "w")
                .with_role_var("w", "w@GRAD"),
        );

        let json = serde_json::to_string(&program).unwrap();
        let parsed: Program = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, program);
        assert_eq!(
            parsed.global_block().ops()[0].role_vars(),
            &[("w".to_string(), "w@GRAD".to_string())]
        );
    }
}
