pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod fasta;
pub mod freshness;
pub mod fs_util;
pub mod graph;
pub mod lock;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod stages;
