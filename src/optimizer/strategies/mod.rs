//! Dispatch strategies
//!
//! - Quadratic: weighted squared shortfall, solved by ADMM
//! - Linear: weighted shortfall, solved with good_lp

pub mod linear;
pub mod quadratic;

pub use linear::*;
pub use quadratic::*;
