//! Command-line interface definitions and handlers for the tabprep CLI.

pub mod args;
pub mod generate;
pub mod helpers;
pub mod inspect;
pub mod run;
pub mod stats;

pub use args::{Cli, Commands};
pub use generate::generate_dataset;
pub use inspect::inspect_output;
pub use run::run_pipeline;
pub use stats::print_statistics;
