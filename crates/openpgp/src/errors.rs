use hwsec_transport::TransportError;
use thiserror::Error;

/// Errors from the OpenPGP card application layer.
///
/// Recognised status words map to named variants; anything else is
/// carried verbatim in [`OpenPgpError::ApduStatus`].
#[derive(Debug, Error)]
pub enum OpenPgpError {
    /// The transport below us failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// SELECT of the OpenPGP AID answered 6A82.
    #[error("OpenPGP applet not present on this card")]
    AppletNotPresent,

    /// Wrong PIN (63Cx); `retries` attempts remain.
    #[error("wrong PIN, {retries} retries remaining")]
    PinIncorrect {
        /// Remaining verification attempts.
        retries: u8,
    },

    /// The PIN's retry counter is exhausted (6983).
    #[error("PIN is blocked")]
    PinBlocked,

    /// Security status not satisfied (6982): PIN verification required.
    #[error("security status not satisfied")]
    SecurityNotSatisfied,

    /// Conditions of use not satisfied (6985).
    #[error("conditions of use not satisfied")]
    ConditionsNotSatisfied,

    /// Wrong data in the command field (6A80).
    #[error("card rejected the command data")]
    WrongData,

    /// Referenced data not found (6A88).
    #[error("referenced data not found")]
    RefNotFound,

    /// A status word without a dedicated variant.
    #[error("card returned status 0x{sw:04x}")]
    ApduStatus {
        /// The raw status word.
        sw: u16,
    },

    /// The key's algorithm attributes name a format we cannot handle.
    #[error("unsupported key format: {0}")]
    UnsupportedKeyFormat(&'static str),

    /// The card accepted the import APDUs but the read-back state does
    /// not match what was written.
    #[error("card rejected key import: {0}")]
    KeyImportRejected(&'static str),

    /// Application Related Data could not be parsed into capabilities.
    #[error("could not parse card capabilities: {0}")]
    CapabilityParse(&'static str),

    /// Host-side key generation failed (entropy or parameter error).
    #[error("host key generation failed: {0}")]
    KeyGeneration(String),

    /// The pairing flow failed; the card may be partially set up and
    /// should be wiped before retrying.
    #[error("pairing aborted: {cause}")]
    PairingAborted {
        /// The underlying failure.
        #[source]
        cause: Box<OpenPgpError>,
    },
}

impl OpenPgpError {
    /// Map a non-9000 status word onto the taxonomy.
    pub fn from_status(sw: u16) -> Self {
        match sw {
            0x6A82 => OpenPgpError::AppletNotPresent,
            0x6982 => OpenPgpError::SecurityNotSatisfied,
            0x6983 => OpenPgpError::PinBlocked,
            0x6985 => OpenPgpError::ConditionsNotSatisfied,
            0x6A80 => OpenPgpError::WrongData,
            0x6A88 => OpenPgpError::RefNotFound,
            sw if sw & 0xFFF0 == 0x63C0 => OpenPgpError::PinIncorrect {
                retries: (sw & 0x0F) as u8,
            },
            sw => OpenPgpError::ApduStatus { sw },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_words_map() {
        assert!(matches!(
            OpenPgpError::from_status(0x6A82),
            OpenPgpError::AppletNotPresent
        ));
        assert!(matches!(
            OpenPgpError::from_status(0x63C2),
            OpenPgpError::PinIncorrect { retries: 2 }
        ));
        assert!(matches!(
            OpenPgpError::from_status(0x6983),
            OpenPgpError::PinBlocked
        ));
        assert!(matches!(
            OpenPgpError::from_status(0x6F00),
            OpenPgpError::ApduStatus { sw: 0x6F00 }
        ));
    }
}
