pub mod annotation_pipeline;
pub mod batch;
pub mod builtin;
pub mod cache;
pub mod config;
pub mod dependency;
pub mod error;
pub mod lockfile;
pub mod observability;
pub mod pipeline;
pub mod prompt_pipeline;
pub mod records;
pub mod registry;
pub mod targets;
pub mod validation;

pub use cache::{Cache, CacheExt, Cacheable, NoCache, SqliteCache};
pub use config::RunConfig;
pub use dependency::DependencyResolver;
pub use pipeline::{Pipeline, PipelineConfig, PipelineReport};
pub use registry::TargetRegistry;
