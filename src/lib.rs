//! posterkit library
//!
//! Composes poster images from a background, image layers, rules, and anchored
//! text. Remote sources and rendered output are cached in a persistent TTL
//! store, and image sources are resolved concurrently with a first-error-wins
//! fan-out.

pub mod assets;
pub mod cache;
pub mod canvas;
pub mod cli;
pub mod parallel;
pub mod remote;
pub mod render;
