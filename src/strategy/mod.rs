//! Strategy layer: deterministic risk review and the learning memory that
//! feeds experiment results back into planning.

pub mod learning;
pub mod risk;
