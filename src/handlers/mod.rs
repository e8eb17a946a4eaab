pub mod health;
pub mod rooms;
pub mod stats;

pub use health::*;
pub use rooms::*;
pub use stats::*;
