//! racebud: a static determinacy-race detector for fork-join procedures.
pub mod analysis;
pub mod callbacks;
pub mod config;
pub mod detector;
pub mod interest;
pub mod ir;
pub mod options;
