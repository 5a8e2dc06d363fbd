//! Uniform APDU transport over the supported link layers.

pub mod ccid;
pub mod nfc;
pub mod u2fhid;

pub use ccid::CcidTransport;
pub use nfc::{NfcIsoDepTransport, NfcTag};
pub use u2fhid::{HidReportPipe, U2fHidDeviceInfo, U2fHidTransport};

use crate::apdu::{CommandApdu, ResponseApdu};
use crate::errors::TransportError;

/// The link layer a transport runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// CCID reader exchanging short APDUs (or T=1 TPDUs).
    CcidShort,
    /// CCID reader exchanging extended APDUs.
    CcidExtended,
    /// APDUs encapsulated in U2F HID MSG transactions.
    U2fHid,
    /// NFC ISO-DEP.
    NfcIsoDep,
}

/// A connected security key carrying APDUs.
///
/// At most one APDU is in flight per transport: a concurrent
/// [`transceive`](SecurityKeyTransport::transceive) fails fast with
/// [`TransportError::Busy`]. Timeouts, retries and power cycling are the
/// transport's private matter; callers see either a response APDU or a
/// taxonomy error.
///
/// [`release`](SecurityKeyTransport::release) is idempotent and makes an
/// in-flight exchange fail with [`TransportError::Released`] at the next
/// frame boundary; every later call fails the same way.
pub trait SecurityKeyTransport: Send + Sync {
    /// Exchange one command APDU for one response APDU.
    fn transceive(&self, cmd: &CommandApdu) -> Result<ResponseApdu, TransportError>;

    /// True if the link can carry extended-length APDUs.
    fn is_extended_length_supported(&self) -> bool;

    /// Cheap liveness probe; false once the device stopped answering.
    fn ping(&self) -> bool;

    /// Release the transport and its device handles.
    fn release(&self);

    /// Which link layer this is.
    fn kind(&self) -> TransportKind;
}
