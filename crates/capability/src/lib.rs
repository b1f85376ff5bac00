//! `capability` crate: the registry contract workflow steps invoke.
//!
//! The engine dispatches every action-call and script step through
//! [`CapabilityRegistry`]. [`ActionRegistry`] is the in-process registry
//! keyed by action id; `mock` holds test doubles.

pub mod error;
pub mod traits;
pub mod registry;
pub mod mock;

pub use error::CapabilityError;
pub use registry::ActionRegistry;
pub use traits::{Action, ActionResult, CapabilityRegistry};
