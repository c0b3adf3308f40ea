//! ubench-core — shared types for the ubench control plane.
//!
//! Recipes describe what to deploy (an inference server, a monitoring
//! collector, or a benchmark client). The [`RecipeCatalog`] finds them on
//! disk and [`UbenchConfig`] carries the scheduler defaults and paths that
//! every command needs.

pub mod catalog;
pub mod config;
pub mod duration;
pub mod error;
pub mod recipe;

pub use catalog::{RecipeCatalog, RecipeSummary};
pub use config::UbenchConfig;
pub use duration::parse_duration;
pub use error::{ConfigError, RecipeError, RecipeResult};
pub use recipe::*;
