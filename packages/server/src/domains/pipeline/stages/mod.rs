//! The four pipeline stages. Query expansion and vector search run strictly
//! in order; enrichment and scoring interleave per batch.

pub mod enrichment;
pub mod query_expansion;
pub mod scoring;
pub mod vector_search;
