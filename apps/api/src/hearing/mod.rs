// Hearing pipeline: voice recording → transcript → validated résumé fields.
// All model calls go through llm_client via the chains in this module.

pub mod audio;
pub mod chains;
pub mod error;
pub mod handlers;
pub mod machine;
pub mod orchestrator;
pub mod prompts;
pub mod schema;
pub mod store;
