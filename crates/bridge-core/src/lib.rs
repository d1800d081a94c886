pub mod error;
pub mod events;
pub mod model;

pub use error::*;
pub use events::*;
pub use model::*;
