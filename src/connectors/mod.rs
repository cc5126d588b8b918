//! Concrete `FsOps` implementations (specification §4.5).

pub mod microfreak;
pub mod sds;
pub mod system;
pub mod volca_sample;
pub mod volca_sample2;
