/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::collections::HashMap;

/// Generates variable names that are unique within one namespace,
/// typically a single program. Each prefix has its own counter, so
/// `generate("nccl_id")` yields `nccl_id_0`, `nccl_id_1`, ...
#[derive(Debug, Default, Clone)]
pub struct UniqueNameGenerator {
    counters: HashMap<String, usize>,
}

impl UniqueNameGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&mut self, prefix: &str) -> String {
        let counter = self.counters.entry(prefix.to_string()).or_insert(0);
        let name = format!("{}_{}", prefix, counter);
        *counter += 1;
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_per_prefix() {
        let mut names = UniqueNameGenerator::new();
        assert_eq!(names.generate("nccl_id"), "nccl_id_0");
        assert_eq!(names.generate("nccl_id"), "nccl_id_1");
        assert_eq!(names.generate("tmp"), "tmp_0");
        assert_eq!(names.generate("nccl_id"), "nccl_id_2");
    }

    #[test]
    fn test_generators_are_independent() {
        let mut a = UniqueNameGenerator::new();
        let mut b = UniqueNameGenerator::new();
        assert_eq!(a.generate("x"), b.generate("x"));
    }
}
