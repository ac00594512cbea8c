//! # livewire-core - Core Domain Types
//!
//! Foundation crate for livewire. Provides the error taxonomy shared by every
//! layer of the connector, the type-erased [`DynamicValue`] payload model, and
//! logging initialization.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, serde_json, thiserror, tracing and the subscriber/appender
//! pair used for file logging).
//!
//! ## Public API
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Connector error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ### Dynamic Values (`value`)
//! - [`DynamicValue`] - Tagged union over the JSON data model
//! - [`Payload`] - String-keyed map of dynamic values
//! - [`encode()`](value::encode) / [`decode()`](value::decode) - JSON byte codec
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use livewire_core::prelude::*;
//! ```

pub mod error;
pub mod logging;
pub mod value;

/// Prelude for common imports used throughout all livewire crates
pub mod prelude {
    pub use super::error::{Error, Result, ResultExt};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

// Re-export commonly used types at crate root for convenience
pub use error::{Error, Result, ResultExt};
pub use value::{DynamicValue, Payload};
