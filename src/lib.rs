//! fileinfo library
//!
//! Fetches remote files into transient storage, runs a pipeline of analyzers
//! over them (MIME type, digests, EXIF metadata, ffprobe stream data), and
//! reports usage statistics aggregated from CloudWatch Logs.

pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod media;
pub mod server;
pub mod service;
pub mod usage;
