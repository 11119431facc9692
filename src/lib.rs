//! SignLingo inference service.
//!
//! Two prediction modes share one hand-landmark front end:
//! `letters` classifies a single frame, `gestures` classifies a rolling
//! 30-frame window with a sequence network loaded through a
//! compatibility-aware loader.

pub mod args;
pub mod artifact;
pub mod compat;
pub mod config;
pub mod gestures;
pub mod landmarks;
pub mod letters;
pub mod model_loader;
pub mod sequence_model;
pub mod server;
pub mod service;
pub mod static_features;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;
