//! Supervision components.
//!
//! Covers the agent registry, the spawn ledger state machine, failure
//! detection, transcript linking with its finalizer pool, and the launch
//! orchestrator that ties them to a real worker process.

pub mod failure_detector;
pub mod finalizer;
pub mod ledger;
pub mod process;
pub mod registry;
pub mod session_linker;
pub mod spawner;
