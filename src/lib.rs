//! pack - Build container images from source with Cloud Native Buildpacks
//!
//! Assembles builder images, drives the lifecycle phases of a build in
//! containers, and rebases app images onto new run images.

pub mod api;
pub mod archive;
pub mod auth;
pub mod build;
pub mod builder;
pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod dist;
pub mod download;
pub mod error;
pub mod image;
pub mod layer;
pub mod lifecycle;
pub mod logging;
pub mod rebase;
pub mod runtime;
pub mod ui;

pub use error::{PackError, PackResult};
