/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Job membership: how many workers there are, who this worker is and
//! where everybody listens.

use std::env;
use std::fmt::Debug;

use crate::endpoint::Endpoint;
use crate::endpoint::check_unique;
use crate::error::ConfigurationError;

/// Comma separated `host:port` list of every worker, in rank order.
pub const TRAINER_ENDPOINTS_ENV: &str = "TRAINER_ENDPOINTS";
/// This worker's rank in [`TRAINER_ENDPOINTS_ENV`].
pub const TRAINER_ID_ENV: &str = "TRAINER_ID";

/// Provides the membership of the job this worker belongs to.
pub trait RoleMaker: Send + Sync + Debug {
    fn worker_count(&self) -> usize;

    fn worker_rank(&self) -> usize;

    /// Every worker's endpoint, indexed by rank.
    fn endpoint_list(&self) -> &[Endpoint];

    /// This worker's own endpoint.
    fn current_endpoint(&self) -> Option<&Endpoint> {
        self.endpoint_list().get(self.worker_rank())
    }
}

/// Membership fixed at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoleMaker {
    endpoints: Vec<Endpoint>,
    rank: usize,
}

impl StaticRoleMaker {
    pub fn new(endpoints: Vec<Endpoint>, rank: usize) -> Result<Self, ConfigurationError> {
        if endpoints.is_empty() {
            return Err(ConfigurationError::NoEndpoints);
        }
        check_unique(&endpoints)?;
        if rank >= endpoints.len() {
            return Err(ConfigurationError::RankOutOfRange {
                rank,
                workers: endpoints.len(),
            });
        }
        Ok(Self { endpoints, rank })
    }

    /// Read membership from `TRAINER_ENDPOINTS` and `TRAINER_ID`.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`StaticRoleMaker::from_env`], resolving variables through
    /// `lookup`.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        let require = |name: &str| {
            lookup(name).ok_or_else(|| ConfigurationError::MissingEnv {
                name: name.to_string(),
            })
        };
        let endpoints = Endpoint::parse_list(&require(TRAINER_ENDPOINTS_ENV)?)?;
        let id = require(TRAINER_ID_ENV)?;
        let rank = id
            .trim()
            .parse::<usize>()
            .map_err(|err| ConfigurationError::InvalidEnv {
                name: TRAINER_ID_ENV.to_string(),
                value: id.clone(),
                reason: err.to_string(),
            })?;
        Self::new(endpoints, rank)
    }
}

impl RoleMaker for StaticRoleMaker {
    fn worker_count(&self) -> usize {
        self.endpoints.len()
    }

    fn worker_rank(&self) -> usize {
        self.rank
    }

    fn endpoint_list(&self) -> &[Endpoint] {
        &self.endpoints
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use maplit::hashmap;

    use super::*;

    fn lookup(vars: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        move |name| vars.get(name).map(|v| v.to_string())
    }

    #[test]
    fn test_static_role_maker() {
        let endpoints = Endpoint::parse_list("h1:0,h1:1,h2:0,h2:1").unwrap();
        let role = StaticRoleMaker::new(endpoints.clone(), 2).unwrap();
        assert_eq!(role.worker_count(), 4);
        assert_eq!(role.worker_rank(), 2);
        assert_eq!(role.endpoint_list(), endpoints.as_slice());
        assert_eq!(role.current_endpoint(), Some(&Endpoint::new("h2", 0)));
    }

    #[test]
    fn test_static_role_maker_rejects() {
        assert_eq!(
            StaticRoleMaker::new(vec![], 0),
            Err(ConfigurationError::NoEndpoints)
        );
        assert_eq!(
            StaticRoleMaker::new(Endpoint::parse_list("h1:0,h1:1").unwrap(), 2),
            Err(ConfigurationError::RankOutOfRange {
                rank: 2,
                workers: 2
            })
        );
        assert!(matches!(
            StaticRoleMaker::new(Endpoint::parse_list("h1:0,h1:0").unwrap(), 0),
            Err(ConfigurationError::DuplicateEndpoint { .. })
        ));
    }

    #[test]
    fn test_from_lookup() {
        let role = StaticRoleMaker::from_lookup(lookup(hashmap! {
            "TRAINER_ENDPOINTS" => "10.0.0.1:6170,10.0.0.1:6171",
            "TRAINER_ID" => " 1 ",
        }))
        .unwrap();
        assert_eq!(role.worker_rank(), 1);
        assert_eq!(
            role.current_endpoint(),
            Some(&Endpoint::new("10.0.0.1", 6171))
        );
    }

    #[test]
    fn test_from_lookup_missing_or_invalid() {
        assert_eq!(
            StaticRoleMaker::from_lookup(lookup(hashmap! {"TRAINER_ID" => "0"})),
            Err(ConfigurationError::MissingEnv {
                name: "TRAINER_ENDPOINTS".to_string()
            })
        );
        assert!(matches!(
            StaticRoleMaker::from_lookup(lookup(hashmap! {
                "TRAINER_ENDPOINTS" => "h1:0",
                "TRAINER_ID" => "first",
            })),
            Err(ConfigurationError::InvalidEnv { .. })
        ));
    }
}
