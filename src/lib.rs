//! Versioned cache coherence over pluggable storage and remote downloaders.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod event;
pub mod remote;
