//! NFC ISO-DEP transport over a platform-provided tag handle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{SecurityKeyTransport, TransportKind};
use crate::apdu::{CommandApdu, ResponseApdu};
use crate::errors::TransportError;
use crate::manager::Clock;

/// Collaborator interface to a discovered ISO-DEP tag. The platform owns
/// connection setup and teardown; the core only exchanges frames.
pub trait NfcTag: Send + Sync {
    /// Exchange one ISO-DEP frame.
    fn transceive(&self, data: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// True if the tag advertises extended-length support (from its ATS).
    fn is_extended_length_supported(&self) -> bool {
        false
    }

    /// True while the tag is still in the field.
    fn is_connected(&self) -> bool;
}

/// A security key reached over NFC ISO-DEP.
///
/// Tracks the time of the last successful exchange for the liveness
/// monitor in the device manager.
pub struct NfcIsoDepTransport {
    tag: Arc<dyn NfcTag>,
    clock: Arc<dyn Clock>,
    busy: Mutex<()>,
    released: AtomicBool,
    last_rx_ms: AtomicU64,
}

impl NfcIsoDepTransport {
    /// Wrap a discovered tag.
    pub fn new(tag: Arc<dyn NfcTag>, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        NfcIsoDepTransport {
            tag,
            clock,
            busy: Mutex::new(()),
            released: AtomicBool::new(false),
            last_rx_ms: AtomicU64::new(now),
        }
    }

    /// Milliseconds since the last frame was received from the tag.
    pub fn millis_since_last_rx(&self) -> u64 {
        self.clock
            .now_ms()
            .saturating_sub(self.last_rx_ms.load(Ordering::SeqCst))
    }
}

impl SecurityKeyTransport for NfcIsoDepTransport {
    fn transceive(&self, cmd: &CommandApdu) -> Result<ResponseApdu, TransportError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(TransportError::Released);
        }
        let _guard = self.busy.try_lock().map_err(|_| TransportError::Busy)?;
        let wire = cmd.serialize()?;
        let raw = self.tag.transceive(&wire)?;
        self.last_rx_ms.store(self.clock.now_ms(), Ordering::SeqCst);
        ResponseApdu::parse(&raw)
    }

    fn is_extended_length_supported(&self) -> bool {
        self.tag.is_extended_length_supported()
    }

    fn ping(&self) -> bool {
        !self.released.load(Ordering::SeqCst) && self.tag.is_connected()
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn kind(&self) -> TransportKind {
        TransportKind::NfcIsoDep
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::manager::Clock;
    use std::sync::atomic::AtomicU64;

    pub(crate) struct ManualClock(pub AtomicU64);

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct EchoTag {
        connected: AtomicBool,
    }

    impl NfcTag for EchoTag {
        fn transceive(&self, _data: &[u8]) -> Result<Vec<u8>, TransportError> {
            Ok(vec![0x90, 0x00])
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn tracks_last_rx() {
        let clock = Arc::new(ManualClock(AtomicU64::new(1_000)));
        let tag = Arc::new(EchoTag {
            connected: AtomicBool::new(true),
        });
        let transport = NfcIsoDepTransport::new(tag, Arc::clone(&clock) as Arc<dyn Clock>);

        clock.0.store(1_400, Ordering::SeqCst);
        assert_eq!(transport.millis_since_last_rx(), 400);

        let cmd = CommandApdu::new(0x00, 0xA4, 0x04, 0x00, vec![], 0);
        transport.transceive(&cmd).unwrap();
        assert_eq!(transport.millis_since_last_rx(), 0);
    }

    #[test]
    fn release_is_terminal() {
        let clock = Arc::new(ManualClock(AtomicU64::new(0)));
        let tag = Arc::new(EchoTag {
            connected: AtomicBool::new(true),
        });
        let transport = NfcIsoDepTransport::new(tag, clock);
        assert!(transport.ping());
        transport.release();
        assert!(!transport.ping());
        let cmd = CommandApdu::new(0x00, 0xA4, 0x04, 0x00, vec![], 0);
        assert!(matches!(
            transport.transceive(&cmd),
            Err(TransportError::Released)
        ));
    }
}
