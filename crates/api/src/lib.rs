//! HTTP trigger for the enrichment queue controller.

pub mod app;
pub mod config;
pub mod continuation;
