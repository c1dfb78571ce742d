/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Static program representation rewritten by the megatron passes.
//!
//! A [`Program`] is an ordered list of [`Operator`]s together with a
//! variable namespace. Operators execute in list order, so the position
//! at which a pass splices a new operator is part of its meaning. The
//! passes never hold references into the list across an insertion;
//! they locate insertion points by scanning for [`OpRole`] markers and
//! splice by index via [`Block::insert_op`].

mod names;
mod program;

pub use names::UniqueNameGenerator;
pub use program::AttrValue;
pub use program::Block;
pub use program::GraphError;
pub use program::OpRole;
pub use program::OpType;
pub use program::Operator;
pub use program::Program;
pub use program::VarType;
pub use program::Variable;
