/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Readiness handshake used to serialize communicator bootstrap.
//!
//! A ring root must not start initializing a communicator before every
//! other member is listening, otherwise a member still busy with an
//! earlier communicator can miss the exchange.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::endpoint::Endpoint;
use crate::error::BootstrapTimeoutError;

/// Blocks until a set of endpoints accept connections.
#[async_trait]
pub trait ReadinessWaiter: Send + Sync + Debug {
    /// Wait until every endpoint in `endpoints` is reachable, or fail
    /// once the waiter's patience runs out.
    async fn wait_until_reachable(&self, endpoints: &[Endpoint])
    -> Result<(), BootstrapTimeoutError>;
}

/// Polls endpoints with plain TCP connects until all of them accept.
#[derive(Debug, Clone)]
pub struct TcpReadiness {
    timeout: Duration,
    retry_interval: Duration,
    connect_timeout: Duration,
}

impl TcpReadiness {
    pub fn new(timeout: Duration, retry_interval: Duration) -> Self {
        Self {
            timeout,
            retry_interval,
            connect_timeout: Duration::from_secs(1).min(timeout),
        }
    }

    async fn is_reachable(&self, endpoint: &Endpoint) -> bool {
        let addr = (endpoint.host(), endpoint.port());
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(err)) => {
                tracing::trace!("endpoint {} not ready: {}", endpoint, err);
                false
            }
            Err(_elapsed) => {
                tracing::trace!("endpoint {} not ready: connect timed out", endpoint);
                false
            }
        }
    }
}

#[async_trait]
impl ReadinessWaiter for TcpReadiness {
    async fn wait_until_reachable(
        &self,
        endpoints: &[Endpoint],
    ) -> Result<(), BootstrapTimeoutError> {
        let start = Instant::now();
        let mut pending: Vec<Endpoint> = endpoints.to_vec();
        loop {
            let mut still_pending = Vec::with_capacity(pending.len());
            for endpoint in pending {
                if !self.is_reachable(&endpoint).await {
                    still_pending.push(endpoint);
                }
            }
            pending = still_pending;
            if pending.is_empty() {
                tracing::debug!(
                    "all {} endpoints ready after {}",
                    endpoints.len(),
                    humantime::format_duration(start.elapsed())
                );
                return Ok(());
            }

            let waited = start.elapsed();
            if waited >= self.timeout {
                let err = BootstrapTimeoutError { pending, waited };
                tracing::error!("{}", err);
                return Err(err);
            }
            tracing::info!(
                "waiting for {} endpoints to become ready: {}",
                pending.len(),
                pending.iter().join(",")
            );
            tokio::time::sleep(self.retry_interval.min(self.timeout - waited)).await;
        }
    }
}
