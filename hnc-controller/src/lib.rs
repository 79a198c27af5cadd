//! hnc-controller: runs the hierarchy controller over a YAML forest manifest.

pub mod config;
pub mod manifest;

pub use config::Config;
pub use manifest::Manifest;
