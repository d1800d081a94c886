mod alac;
mod auth;
mod discovery;
mod rtsp;
mod rtp;

pub use alac::{AlacConfig, AlacEncoder, f64_to_i16};
pub use auth::AirPlayAuth;
pub use discovery::{AirPlayDevice, discover_devices, find_device_by_name};
pub use rtsp::{RtspClient, RtspResponse, generate_sdp};
pub use rtp::{RtpStream, RtcpStream, get_ntp_timestamp};
