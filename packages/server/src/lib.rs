//! Core library for the music-generation worker.
//!
//! Layout follows a kernel/domains split: `kernel` holds the durable
//! job queue and the provider slot manager, `domains` holds the song
//! generation logic built on top of them.

pub mod config;
pub mod domains;
pub mod kernel;

pub use config::Config;
