pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod generation;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod orchestrator;
pub mod response_packer;
pub mod schema_rag;
pub mod security;
pub mod service;
pub mod types;

pub use error::{PipelineError, Result, StageFailure};
pub use orchestrator::{FailureEnvelope, Orchestrator, ResponseEnvelope};
pub use service::QueryService;
