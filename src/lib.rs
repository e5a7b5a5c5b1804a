//! Library exports for the server binary, tools, benchmarks and tests.
/// Application directory resolution.
pub mod app_dirs;
/// TOML configuration.
pub mod config;
/// Training tiles listed in a CSV index.
pub mod dataset;
/// Request counters and random tokens.
pub mod ids;
/// Sliding-window inference over whole tiles.
pub mod inference;
/// Imagery layer registry.
pub mod layers;
/// Tracing setup with rotating log files.
pub mod logging;
/// Logistic regression head and metrics.
pub mod ml;
/// `.npy` array serialization.
pub mod npy;
/// Class encodings and prediction colouring.
pub mod render;
/// Interactive labelling and retraining state.
pub mod session;
