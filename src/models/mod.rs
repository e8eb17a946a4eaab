pub mod error;
pub mod health;
pub mod messages;
pub mod participant;
pub mod room;
pub mod snapshot;
pub mod stats;

pub use error::*;
pub use health::*;
pub use messages::*;
pub use participant::*;
pub use room::*;
pub use snapshot::*;
pub use stats::*;
