//! livewire library
//!
//! The command-line front end for the livewire streaming connector. The
//! engine lives in `livewire-link`; this crate only wires settings, the CLI
//! and NDJSON output together.

pub mod headless;

pub use headless::runner::{run_call, run_turn, run_watch, RunOptions};
pub use headless::{HeadlessEvent, Output};
