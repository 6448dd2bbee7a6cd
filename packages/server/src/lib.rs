// Creator Scout - API Core
//
// Backend for ranked creator discovery: an admission service accepts
// natural-language business descriptions, a queue-backed execution engine
// runs the four-stage pipeline (query expansion, vector search, enrichment,
// scoring) against external providers and publishes progressive results.

pub mod common;
pub mod domains;
pub mod kernel;
pub mod server;
