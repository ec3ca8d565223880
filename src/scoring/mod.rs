pub mod classifier;
pub mod fallback;
pub mod summary;
pub mod timeline;
pub mod types;
