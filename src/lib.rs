//! Voxelized anatomical phantom for Monte Carlo transport: material grid,
//! source-position sampling and sparse per-voxel tallies.

pub mod config;
pub mod context;
pub mod error;
pub mod export;
pub mod index_codec;
pub mod material;
pub mod parser_registry;
pub mod parsers;
pub mod phantom;
pub mod run;
pub mod scoring;
pub mod source;
pub mod spectrum;
pub mod tally;
pub mod utils;
pub mod voxel_grid;

pub use config::PhantomConfig;
pub use context::PhantomContext;
pub use error::{PhantomError, PhantomResult};
pub use run::{RunCoordinator, RunResult, Worker};
