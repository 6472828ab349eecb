//! `enrichq-pipeline`: the pluggable enrichment contract.
//!
//! The controller never scrapes, extracts or looks anything up itself. It hands
//! a target id to an [`EnrichmentPipeline`] and interprets the result. This
//! crate stays storage-agnostic: target records are read through
//! [`TargetLookup`], implemented by callers (infra).

pub mod http;
pub mod outcome;
pub mod pipeline;
pub mod target;

pub use http::{HttpEnrichmentPipeline, HttpPipelineConfig};
pub use outcome::{Enriched, PipelineError};
pub use pipeline::{EnrichRequest, EnrichmentPipeline};
pub use target::{InMemoryTargets, TargetLookup, TargetRecord};
