//! COI Assist: certificate-of-insurance request automation.

pub mod channels;
pub mod config;
pub mod documents;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod routes;
pub mod store;
