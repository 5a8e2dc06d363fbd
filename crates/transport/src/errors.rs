use std::time::Duration;

use thiserror::Error;

/// Errors produced by the transport stack.
///
/// Each layer translates one level up: a USB bulk failure surfaces as
/// [`TransportError::Io`], an exhausted T=1 retransmission budget as
/// [`TransportError::T1RetransmitExhausted`], and so on. Callers above the
/// transport see this taxonomy, never the raw backend error.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport was released; all further operations fail.
    #[error("transport has been released")]
    Released,

    /// A second exchange was attempted while one was in flight.
    #[error("another exchange is in flight on this transport")]
    Busy,

    /// A link-layer deadline elapsed.
    #[error("transport deadline of {0:?} elapsed")]
    Timeout(Duration),

    /// The underlying USB/NFC backend failed.
    #[error("transport I/O failed: {0}")]
    Io(String),

    /// The reader returned a CCID message we could not make sense of.
    #[error("malformed CCID response: {0}")]
    CcidBadResponse(&'static str),

    /// The reader echoed the wrong sequence number.
    #[error("CCID sequence mismatch, got {got} expected {expected}")]
    CcidSeqMismatch { got: u8, expected: u8 },

    /// The reader reported a slot-level hardware error.
    #[error("CCID reader error 0x{code:02x}")]
    CcidHwError { code: u8 },

    /// A received T=1 block violated the framing rules.
    #[error("T=1 framing violation: {0}")]
    T1Framing(&'static str),

    /// A received T=1 block failed its EDC check.
    #[error("T=1 block failed the EDC check")]
    T1BadEdc,

    /// The card did not produce a valid block within three retransmissions.
    #[error("T=1 retransmission budget exhausted")]
    T1RetransmitExhausted,

    /// The card answered with a block that is illegal in the current state.
    #[error("T=1 protocol violation: {0}")]
    T1Protocol(&'static str),

    /// The key reported an error on the U2F HID channel.
    #[error("U2F HID device error: {0}")]
    U2fHidError(U2fHidErrorCode),

    /// The key reported the channel busy; retry after the current
    /// transaction completes.
    #[error("U2F HID channel is busy")]
    U2fHidChannelBusy,

    /// Channel setup via INIT failed.
    #[error("U2F HID INIT failed: {0}")]
    U2fHidBadInit(&'static str),

    /// An APDU could not be encoded or decoded.
    #[error("malformed APDU: {0}")]
    ApduMalformed(&'static str),

    /// TLV input ended in the middle of a tag, length or value.
    #[error("truncated TLV input")]
    TlvTruncated,

    /// TLV length octets are not a supported definite form.
    #[error("bad TLV length encoding")]
    TlvBadLength,

    /// TLV tag uses more octets than this stack supports.
    #[error("TLV tag longer than two octets")]
    TlvTagTooLong,
}

/// Error codes carried by a U2F HID `ERROR (0xBF)` response, per the FIDO
/// U2F HID framing spec. Unassigned codes map to [`U2fHidErrorCode::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum U2fHidErrorCode {
    /// The command in the request is invalid.
    InvalidCmd,
    /// The parameters of the command are invalid.
    InvalidPar,
    /// The length field of the request is invalid.
    InvalidLen,
    /// A continuation frame arrived out of sequence.
    InvalidSeq,
    /// The transaction timed out on the device side.
    MessageTimeout,
    /// Another transaction holds the device.
    ChannelBusy,
    /// The command requires a channel lock.
    LockRequired,
    /// The channel ID is not recognised by the device.
    InvalidChannel,
    /// Unspecified device error.
    Other(u8),
}

impl U2fHidErrorCode {
    /// Map the byte-1 payload of an ERROR response.
    pub fn from_byte(code: u8) -> Self {
        match code {
            0x01 => Self::InvalidCmd,
            0x02 => Self::InvalidPar,
            0x03 => Self::InvalidLen,
            0x04 => Self::InvalidSeq,
            0x05 => Self::MessageTimeout,
            0x06 => Self::ChannelBusy,
            0x0A => Self::LockRequired,
            0x0B => Self::InvalidChannel,
            other => Self::Other(other),
        }
    }
}

impl std::fmt::Display for U2fHidErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCmd => write!(f, "invalid command"),
            Self::InvalidPar => write!(f, "invalid parameter"),
            Self::InvalidLen => write!(f, "invalid length"),
            Self::InvalidSeq => write!(f, "invalid frame sequence"),
            Self::MessageTimeout => write!(f, "message timeout"),
            Self::ChannelBusy => write!(f, "channel busy"),
            Self::LockRequired => write!(f, "lock required"),
            Self::InvalidChannel => write!(f, "invalid channel"),
            Self::Other(code) => write!(f, "error 0x{code:02x}"),
        }
    }
}

impl From<hidapi_rusb::HidError> for TransportError {
    fn from(e: hidapi_rusb::HidError) -> Self {
        TransportError::Io(e.to_string())
    }
}

impl From<rusb::Error> for TransportError {
    fn from(e: rusb::Error) -> Self {
        match e {
            rusb::Error::Timeout => TransportError::Timeout(Duration::ZERO),
            rusb::Error::NoDevice | rusb::Error::NotFound => {
                TransportError::Io("device is gone".into())
            }
            other => TransportError::Io(other.to_string()),
        }
    }
}
