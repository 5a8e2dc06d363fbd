//! Websafe base64 (RFC 4648 §5, unpadded), as exchanged with FIDO
//! collaborators.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::{DecodeError, Engine as _};

/// Encode bytes as unpadded websafe base64.
pub fn encode(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode unpadded websafe base64.
pub fn decode(s: impl AsRef<[u8]>) -> Result<Vec<u8>, DecodeError> {
    URL_SAFE_NO_PAD.decode(s)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn websafe_alphabet_no_padding() {
        assert_eq!(encode([0xFB, 0xFF]), "-_8");
        assert_eq!(decode("-_8").unwrap(), vec![0xFB, 0xFF]);
    }

    #[test]
    fn padding_rejected() {
        assert!(decode("AAE=").is_err());
    }
}
