//! The process-wide unit registry, environment indices, and cleanup engine.
//!
//! This crate ties the store together: the dense table of loaded units, the
//! two on-disk environment indices used to find and validate units without
//! loading their payload, pin counting for units backing open documents, the
//! periodic cleanup pass that persists dirty units and evicts unreferenced
//! ones without ever unloading a unit that a live unit still transitively
//! imports, and the session lifecycle (explicit open/shutdown, no lazy
//! statics).

#![warn(missing_docs)]

pub mod cleanup;
pub mod environment;
pub mod registry;
pub mod session;

pub use cleanup::{ParsePause, PauseMode};
pub use environment::{EnvEntry, EnvRecord, EnvironmentManager};
pub use registry::Registry;
pub use session::{Session, SessionConfig};
