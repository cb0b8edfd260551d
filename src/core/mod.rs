pub mod config;
pub mod crop;
pub mod detector;
pub mod hash;
pub mod region;
pub mod report;
#[cfg(feature = "rustface")]
pub mod rustface_backend;
pub mod scanner;
pub mod store;
