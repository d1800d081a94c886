pub mod airplay;
pub mod airplay_lib;
pub mod airplay_sink;
pub mod local;

pub use airplay_lib::{AirPlayLibrary, RaopAirPlayLibrary};
pub use airplay_sink::AirPlaySink;
pub use local::LocalSink;
