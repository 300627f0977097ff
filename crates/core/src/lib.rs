//! Core crate for the pixelscale upscaling service.

pub mod backend;
pub mod config;
pub mod enhancer;
pub mod imaging;
pub mod logging;
pub mod model_pool;
pub mod model_registry;
pub mod pipeline;
pub mod runtime;
pub mod server;
pub mod tier;
