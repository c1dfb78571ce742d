/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Worker endpoints and the per-node accounting derived from them.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use itertools::Itertools;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigurationError;

/// The `host:port` identity of one worker process. Two endpoints with
/// the same host live on the same physical node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse a comma separated endpoint list, ignoring empty entries.
    pub fn parse_list(s: &str) -> Result<Vec<Endpoint>, ConfigurationError> {
        s.split(',')
            .map(str::trim)
            .filter(|ep| !ep.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigurationError::InvalidEndpoint {
            endpoint: s.to_string(),
            reason: reason.to_string(),
        };
        let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("expected host:port"))?;
        let host = host.trim();
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|err| invalid(&err.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// The number of distinct hosts among `endpoints`.
pub fn node_count(endpoints: &[Endpoint]) -> usize {
    endpoints
        .iter()
        .map(Endpoint::host)
        .collect::<HashSet<_>>()
        .len()
}

/// The number of workers on every node. All nodes must carry the same
/// number of workers.
pub fn workers_per_node(endpoints: &[Endpoint]) -> Result<usize, ConfigurationError> {
    if endpoints.is_empty() {
        return Err(ConfigurationError::NoEndpoints);
    }
    let counts: Vec<(String, usize)> = endpoints
        .iter()
        .map(|ep| ep.host().to_string())
        .counts()
        .into_iter()
        .sorted()
        .collect();
    let nodes = counts.len();
    if endpoints.len() % nodes != 0 || !counts.iter().map(|(_, n)| n).all_equal() {
        return Err(ConfigurationError::UnevenNodes {
            workers: endpoints.len(),
            nodes,
            counts,
        });
    }
    Ok(endpoints.len() / nodes)
}

/// The position of `current` among the endpoints sharing its host,
/// i.e. the device index of that worker on its node.
pub fn local_rank(current: &Endpoint, endpoints: &[Endpoint]) -> Option<usize> {
    endpoints
        .iter()
        .filter(|ep| ep.host() == current.host())
        .position(|ep| ep == current)
}

/// Reject endpoint lists naming the same worker twice.
pub fn check_unique(endpoints: &[Endpoint]) -> Result<(), ConfigurationError> {
    match endpoints.iter().duplicates().next() {
        Some(endpoint) => Err(ConfigurationError::DuplicateEndpoint {
            endpoint: endpoint.clone(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eps(s: &str) -> Vec<Endpoint> {
        Endpoint::parse_list(s).unwrap()
    }

    #[test]
    fn test_parse() {
        let ep: Endpoint = " 10.0.0.1 :6170".parse().unwrap();
        assert_eq!(ep, Endpoint::new("10.0.0.1", 6170));
        assert_eq!(ep.to_string(), "10.0.0.1:6170");

        assert!("10.0.0.1".parse::<Endpoint>().is_err());
        assert!(":6170".parse::<Endpoint>().is_err());
        assert!("h:notaport".parse::<Endpoint>().is_err());
        assert!("h:70000".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(
            eps("h1:0, h1:1,,h2:0"),
            vec![
                Endpoint::new("h1", 0),
                Endpoint::new("h1", 1),
                Endpoint::new("h2", 0)
            ]
        );
        assert!(Endpoint::parse_list("h1:0,bad").is_err());
    }

    #[test]
    fn test_node_accounting() {
        let even = eps("h1:0,h1:1,h2:0,h2:1");
        assert_eq!(node_count(&even), 2);
        assert_eq!(workers_per_node(&even).unwrap(), 2);

        let single = eps("h1:0,h1:1,h1:2,h1:3");
        assert_eq!(node_count(&single), 1);
        assert_eq!(workers_per_node(&single).unwrap(), 4);
    }

    #[test]
    fn test_uneven_nodes() {
        // 4 % 2 == 0, but the hosts still carry different worker counts.
        let uneven = eps("h1:0,h1:1,h1:2,h2:0");
        assert_eq!(
            workers_per_node(&uneven),
            Err(ConfigurationError::UnevenNodes {
                workers: 4,
                nodes: 2,
                counts: vec![("h1".to_string(), 3), ("h2".to_string(), 1)],
            })
        );
        assert_eq!(workers_per_node(&[]), Err(ConfigurationError::NoEndpoints));
    }

    #[test]
    fn test_local_rank() {
        let all = eps("h1:0,h2:0,h1:1,h2:1");
        assert_eq!(local_rank(&Endpoint::new("h1", 1), &all), Some(1));
        assert_eq!(local_rank(&Endpoint::new("h2", 0), &all), Some(0));
        assert_eq!(local_rank(&Endpoint::new("h3", 0), &all), None);
    }

    #[test]
    fn test_check_unique() {
        assert!(check_unique(&eps("h1:0,h1:1")).is_ok());
        assert_eq!(
            check_unique(&eps("h1:0,h1:1,h1:0")),
            Err(ConfigurationError::DuplicateEndpoint {
                endpoint: Endpoint::new("h1", 0)
            })
        );
    }
}
