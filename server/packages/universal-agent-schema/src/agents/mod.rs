//! Per-vendor record converters.

pub mod claude;
pub mod codex;
