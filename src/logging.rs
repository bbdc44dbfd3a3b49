// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Trace-logging toggle (spec.md §6 "Environment"): tracing is enabled
//! when either `RUST_LOG` or `DEMI_EPOLL_LOG` is set to `"trace"`. Uses
//! `flexi_logger`, the same crate the teacher depends on, rather than
//! hand-rolling a logger.

use flexi_logger::{Logger, LoggerHandle};

fn trace_requested() -> bool {
    for var in ["RUST_LOG", "DEMI_EPOLL_LOG"] {
        if let Ok(value) = std::env::var(var) {
            if value.eq_ignore_ascii_case("trace") {
                return true;
            }
        }
    }
    false
}

/// Initialises process-wide tracing if requested by the environment.
/// Idempotent: safe to call from every `Shim::new`.
pub fn init_tracing() -> Option<LoggerHandle> {
    if !trace_requested() {
        return None;
    }
    Logger::try_with_str("trace")
        .ok()
        .and_then(|logger| logger.start().ok())
}
