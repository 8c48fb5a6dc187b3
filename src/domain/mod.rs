pub mod dispatch;
pub mod grid;
pub mod observation;
pub mod types;

pub use dispatch::*;
pub use grid::*;
pub use observation::*;
pub use types::*;
