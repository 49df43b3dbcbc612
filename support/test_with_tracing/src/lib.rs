// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tracing setup shared by the firmware vmbus tests.
//!
//! Call [`init`] at the top of a test to route `tracing` output through the
//! test harness's captured writer.

use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// Initializes `tracing` for tests. Safe to call from every test.
///
/// `RUST_LOG` selects targets when set; otherwise everything at `DEBUG` and
/// above is shown.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = std::env::var("RUST_LOG")
            .ok()
            .and_then(|var| var.parse::<Targets>().ok())
            .unwrap_or_else(|| Targets::new().with_default(LevelFilter::DEBUG));

        // Another harness may have installed a global subscriber already.
        let _ = tracing_subscriber::fmt()
            .with_ansi(false)
            .log_internal_errors(true)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .try_init();
    });
}
