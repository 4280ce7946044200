// SPDX-FileCopyrightText: 2025 cotype contributors
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, EnvFilter, FmtSubscriber};

/// Sets up the global tracing subscriber. The level defaults to `info` and
/// can be changed through `RUST_LOG`.
pub fn initialize() -> Result<()> {
    let timer = time::format_description::parse("[hour]:[minute]:[second]")
        .context("Could not create time format description")?;
    let time_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = fmt::time::OffsetTime::new(time_offset, timer);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_timer(timer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Setting default log subscriber failed")
}
