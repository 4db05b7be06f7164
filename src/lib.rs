pub mod backend;
pub mod backoff;
pub mod config;
pub mod feed;
pub mod instruments;
pub mod pipeline;
pub mod shutdown;
