#![allow(async_fn_in_trait)]
//! Convenience operations on top of the `stac` object model: a concurrent
//! asset-fetch engine, STAC API item search and simple STAC IO.
pub mod asset;
pub mod batch;
pub mod config;
pub mod context;
pub mod error;
mod executor;
pub mod layout;
pub mod plan;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod s3;
mod scheduler;
pub mod search;
pub mod selection;
pub mod source;
pub mod stac_io;
pub mod task;

pub use asset::{AssetDescriptor, Checksum, ChecksumAlgorithm};
pub use batch::{fetch_batch, fetch_items, spawn_batch, spawn_batch_with_token, Batch, BatchHandle};
pub use config::{FetchConfig, OverwritePolicy};
pub use context::FetchContext;
pub use error::{ErrorKind, ErrorRecord, FetchError, ResolutionError};
pub use layout::{Layout, PathTemplate};
pub use plan::FetchPlan;
pub use report::{BatchOutcome, BatchReport, FetchResult, ResultStatus, Summary};
pub use resolver::{AssetSource, ResolveOptions};
pub use retry::{FixedJitter, JitterSource, RandomJitter};
pub use search::{SearchParameters, SearchProvider, StacApiClient};
pub use selection::Selection;
pub use stac_io::StacIo;
