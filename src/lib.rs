// Public API - probe engine, checks and report types
pub mod check;
pub mod config;
pub mod error;
pub mod export;
pub mod probe;

// Command line surface, public only for the binary
#[doc(hidden)]
pub mod cli;
