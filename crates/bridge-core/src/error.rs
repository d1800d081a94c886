use thiserror::Error;

/// Typed error kinds a device boundary can surface to SOAP faults or Web API responses.
///
/// Every variant corresponds to one row of the error-handling table: the bridge never lets
/// an error escape a device boundary in any other shape.
#[derive(Debug, Error, Clone)]
pub enum BridgeError {
    #[error("malformed command: {0}")]
    CommandMalformed(String),

    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),

    #[error("decoder failed: {0}")]
    DecoderFailure(String),

    #[error("sink failed: {0}")]
    SinkFailure(String),

    #[error("invalid dsp config: {0}")]
    DspConfigInvalid(String),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("discovery error: {0}")]
    DiscoveryTransient(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),
}

impl BridgeError {
    /// HTTP status code this error maps to at the Web API boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            BridgeError::CommandMalformed(_) => 400,
            BridgeError::DspConfigInvalid(_) => 400,
            BridgeError::DeviceNotFound(_) => 404,
            BridgeError::UpstreamFetch(_)
            | BridgeError::DecoderFailure(_)
            | BridgeError::SinkFailure(_)
            | BridgeError::Subscription(_)
            | BridgeError::DiscoveryTransient(_) => 500,
        }
    }

    /// UPnP-ish error code to report in a SOAP fault detail block.
    pub fn soap_fault_code(&self) -> u32 {
        match self {
            BridgeError::CommandMalformed(_) => 402, // Invalid Args
            BridgeError::DeviceNotFound(_) => 701,    // Transition not available
            BridgeError::DspConfigInvalid(_) => 402,
            _ => 501, // Action Failed
        }
    }
}
