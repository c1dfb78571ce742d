/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Process-wide tracing setup.

use std::str::FromStr;

use tracing_glog::Glog;
use tracing_glog::GlogFields;
use tracing_glog::LocalTime;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::fmt::FormatFields;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::Config;

/// Environment variable whose value prefixes every log line, typically
/// set by the launcher to the worker's rank.
pub const LOG_PREFIX_ENV: &str = "MEGATRON_LOG_PREFIX";

/// Glog formatter that prepends `[prefix]` read from an environment
/// variable, or `[-]` when it is unset.
struct PrefixedFormatter {
    formatter: Glog<LocalTime>,
    prefix_env_var: Option<String>,
}

impl PrefixedFormatter {
    fn new(prefix_env_var: Option<String>) -> Self {
        Self {
            formatter: Glog::default().with_timer(LocalTime::default()),
            prefix_env_var,
        }
    }

    fn prefix(&self) -> String {
        let prefix = self
            .prefix_env_var
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .unwrap_or_default();
        if prefix.is_empty() {
            "[-]".to_string()
        } else {
            format!("[{}]", prefix)
        }
    }
}

impl<S, N> FormatEvent<S, N> for PrefixedFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        write!(writer, "{}", self.prefix())?;
        self.formatter.format_event(ctx, writer, event)
    }
}

fn level_filter(log_level: &str) -> LevelFilter {
    match tracing::Level::from_str(log_level) {
        Ok(level) => LevelFilter::from_level(level),
        Err(_) => LevelFilter::INFO,
    }
}

/// Install a glog-formatted stderr subscriber at the configured level.
/// Calling this more than once is harmless.
pub fn initialize_logging(config: &Config) {
    initialize_logging_with_log_prefix(config, Some(LOG_PREFIX_ENV.to_string()));
}

/// testing
pub fn initialize_logging_for_test() {
    initialize_logging(&Config::default().with_log_level("debug"));
}

pub fn initialize_logging_with_log_prefix(config: &Config, prefix_env_var: Option<String>) {
    let layer = fmt::Layer::default()
        .with_writer(std::io::stderr)
        .event_format(PrefixedFormatter::new(prefix_env_var))
        .fmt_fields(GlogFields::default().compact())
        .with_ansi(false)
        .with_filter(Targets::new().with_default(level_filter(config.log_level())));

    if let Err(err) = Registry::default().with(layer).try_init() {
        tracing::debug!("logging already initialized for this process: {}", err);
    }
}
