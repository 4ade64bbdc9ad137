// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//==============================================================================
// Imports
//==============================================================================

use ::flexi_logger::Logger;
use ::std::sync::Once;

//==============================================================================
// Constants
//==============================================================================

/// Log specification used when neither `RUST_LOG` nor the configuration provide one.
pub const DEFAULT_LOG_SPEC: &str = "info";

//==============================================================================
// Static Variables
//==============================================================================

/// Guardian to the logging initialize function.
static INIT_LOG: Once = Once::new();

//==============================================================================
// Standalone Functions
//==============================================================================

/// Initializes logging features.
pub fn initialize() {
    initialize_with(DEFAULT_LOG_SPEC)
}

/// Initializes logging features, falling back to `spec` when `RUST_LOG` is not set. Only the first call has an effect.
pub fn initialize_with(spec: &str) {
    INIT_LOG.call_once(|| match Logger::try_with_env_or_str(spec).and_then(|logger| logger.start()) {
        // The handle flushes and detaches the logger when dropped, so it has to live as long as the process.
        Ok(handle) => ::std::mem::forget(handle),
        Err(e) => eprintln!("initialize_with(): failed to start logger (spec={:?}): {:?}", spec, e),
    });
}
