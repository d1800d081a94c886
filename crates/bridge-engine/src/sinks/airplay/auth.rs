use anyhow::Result;
use base64::Engine;
use tracing::warn;

/// AirPlay authentication (simplified)
///
/// Note: This is a basic implementation. Full AirPlay authentication involves:
/// - RSA key exchange
/// - AES encryption
/// - Fairplay DRM (for AirPlay 2)
///
/// This implementation provides basic setup for AirPlay 1 (RAOP)
pub struct AirPlayAuth {
    aes_key: Option<Vec<u8>>,
    aes_iv: Option<Vec<u8>>,
}

impl AirPlayAuth {
    pub fn new() -> Self {
        Self {
            aes_key: None,
            aes_iv: None,
        }
    }

    /// Generate AES key and IV for audio encryption
    pub fn generate_encryption_keys(&mut self) {
        // Generate random 128-bit AES key
        let mut key = vec![0u8; 16];
        for byte in &mut key {
            *byte = rand::random();
        }

        // Generate random 128-bit IV
        let mut iv = vec![0u8; 16];
        for byte in &mut iv {
            *byte = rand::random();
        }

        self.aes_key = Some(key);
        self.aes_iv = Some(iv);
    }

    /// Get base64-encoded AES key for RTSP ANNOUNCE
    pub fn get_aes_key_base64(&self) -> Option<String> {
        self.aes_key.as_ref().map(|key| {
            base64::engine::general_purpose::STANDARD.encode(key)
        })
    }

    /// Get base64-encoded AES IV for RTSP ANNOUNCE
    pub fn get_aes_iv_base64(&self) -> Option<String> {
        self.aes_iv.as_ref().map(|iv| {
            base64::engine::general_purpose::STANDARD.encode(iv)
        })
    }

    /// Encrypt audio data with AES (stub implementation)
    ///
    /// Note: Real implementation would use AES-128 in CBC or CTR mode
    pub fn encrypt_audio(&self, data: &[u8]) -> Result<Vec<u8>> {
        if self.aes_key.is_none() || self.aes_iv.is_none() {
            warn!("Encryption keys not initialized, returning unencrypted data");
            return Ok(data.to_vec());
        }

        // Stub: In a real implementation, use the `aes` and `cbc` crates
        // to encrypt the audio data
        warn!("Using stub encryption - data is not actually encrypted");

        Ok(data.to_vec())
    }
}

impl Default for AirPlayAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_keys() {
        let mut auth = AirPlayAuth::new();
        assert!(auth.get_aes_key_base64().is_none());
        assert!(auth.get_aes_iv_base64().is_none());

        auth.generate_encryption_keys();

        assert!(auth.get_aes_key_base64().is_some());
        assert!(auth.get_aes_iv_base64().is_some());

        // Keys should be base64 encoded
        let key = auth.get_aes_key_base64().unwrap();
        let iv = auth.get_aes_iv_base64().unwrap();

        assert!(!key.is_empty());
        assert!(!iv.is_empty());
    }

    #[test]
    fn test_encrypt_without_keys() {
        let auth = AirPlayAuth::new();
        let data = vec![1, 2, 3, 4];

        let encrypted = auth.encrypt_audio(&data).unwrap();
        assert_eq!(encrypted, data); // Should return unencrypted
    }

    #[test]
    fn test_encrypt_with_keys() {
        let mut auth = AirPlayAuth::new();
        auth.generate_encryption_keys();

        let data = vec![1, 2, 3, 4];
        let encrypted = auth.encrypt_audio(&data).unwrap();

        // Stub implementation returns data as-is
        assert_eq!(encrypted, data);
    }
}
