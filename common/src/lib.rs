//! Abanex Common Types
//!
//! Shared types used across the Abanex treasury engine: identifiers,
//! currencies and fixed-point amounts, and the workspace error type.

pub mod identifiers;
pub mod monetary;
pub mod error;

pub use identifiers::*;
pub use monetary::*;
pub use error::*;
