//! Business domains built on the kernel.

pub mod songs;
