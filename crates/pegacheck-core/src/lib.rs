pub mod common;
pub mod config;
pub mod consistency;
pub mod hub;
pub mod integration;
pub mod lengths;
pub mod seq2seq;
pub mod tokenizers;

pub use consistency::{CheckError, ConfigConsistencyCheck, FailureReport};
pub use hub::{HubClient, MetadataSource};
pub use lengths::{DatasetLengthSpec, DatasetLengths};
