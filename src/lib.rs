pub mod config;
pub mod llm;
pub mod model;
pub mod patterns;
pub mod pipeline;
pub mod review;
pub mod scoring;
pub mod strategies;
