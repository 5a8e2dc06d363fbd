//! CCID transport: powers the card, picks the exchange protocol the
//! reader supports and carries APDUs over it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use super::{SecurityKeyTransport, TransportKind};
use crate::apdu::{CommandApdu, ResponseApdu};
use crate::ccid::t1::T1Protocol;
use crate::ccid::{AtrInfo, CcidTransceiver, UsbBulkPipe, BULK_DEADLINE};
use crate::errors::TransportError;

/// dwFeatures: reader exchanges short APDUs itself.
pub const FEATURE_SHORT_APDU: u32 = 0x0002_0000;
/// dwFeatures: reader exchanges short and extended APDUs itself.
pub const FEATURE_EXTENDED_APDU: u32 = 0x0004_0000;

/// Reader capabilities from the CCID class descriptor.
#[derive(Debug, Clone, Copy)]
pub struct CcidReaderProfile {
    /// The dwFeatures word.
    pub features: u32,
    /// dwMaxCCIDMessageLength: largest bulk message either direction.
    pub max_message_len: usize,
}

impl CcidReaderProfile {
    /// Find the class-specific CCID functional descriptor (type 0x21)
    /// in an interface's extra descriptor bytes.
    pub fn parse_class_descriptor(extra: &[u8]) -> Option<CcidReaderProfile> {
        let mut rest = extra;
        while rest.len() >= 2 {
            let len = usize::from(rest[0]);
            if len < 2 || len > rest.len() {
                return None;
            }
            if rest[1] == 0x21 && len >= 0x36 {
                return Some(CcidReaderProfile {
                    features: LittleEndian::read_u32(&rest[40..44]),
                    max_message_len: LittleEndian::read_u32(&rest[44..48]) as usize,
                });
            }
            rest = &rest[len..];
        }
        None
    }
}

enum Protocol {
    /// Reader handles (short or extended) APDUs; we speak data blocks.
    Apdu(CcidTransceiver),
    /// Reader forwards TPDUs; we frame T=1 blocks ourselves.
    T1(Box<T1Protocol>),
}

/// A smartcard behind a CCID reader.
pub struct CcidTransport {
    inner: Mutex<Protocol>,
    released: Arc<AtomicBool>,
    extended: bool,
    max_block_data: usize,
}

impl CcidTransport {
    /// Power the card on and negotiate the link: extended-APDU level when
    /// the reader offers it, short-APDU level otherwise, and T=1 TPDU
    /// framing as the fallback for plain TPDU readers.
    pub fn open(
        pipe: Box<dyn UsbBulkPipe>,
        profile: CcidReaderProfile,
    ) -> Result<Self, TransportError> {
        let released = Arc::new(AtomicBool::new(false));
        let mut xcvr = CcidTransceiver::new(pipe, Arc::clone(&released));
        let atr_bytes = xcvr.icc_power_on()?;
        let atr = AtrInfo::parse(&atr_bytes)?;
        let max_block_data = profile.max_message_len.saturating_sub(10).max(16);

        let (inner, extended) = if profile.features & FEATURE_EXTENDED_APDU != 0 {
            debug!("reader exchanges extended APDUs");
            (Protocol::Apdu(xcvr), true)
        } else if profile.features & FEATURE_SHORT_APDU != 0 {
            debug!("reader exchanges short APDUs");
            (Protocol::Apdu(xcvr), false)
        } else {
            if !atr.t1_supported {
                return Err(TransportError::T1Protocol("card does not offer T=1"));
            }
            debug!(ifsc = atr.ifsc, crc = atr.crc_edc, "falling back to T=1 TPDU framing");
            xcvr.set_parameters_t1(atr.ifsc, atr.crc_edc)?;
            let mut t1 = T1Protocol::new(xcvr, &atr);
            t1.negotiate_ifsd()?;
            (Protocol::T1(Box::new(t1)), false)
        };

        Ok(CcidTransport {
            inner: Mutex::new(inner),
            released,
            extended,
            max_block_data,
        })
    }
}

impl SecurityKeyTransport for CcidTransport {
    fn transceive(&self, cmd: &CommandApdu) -> Result<ResponseApdu, TransportError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(TransportError::Released);
        }
        let mut inner = self.inner.try_lock().map_err(|_| TransportError::Busy)?;
        let wire = cmd.serialize()?;
        let raw = match &mut *inner {
            Protocol::Apdu(xcvr) => {
                xcvr.xfr_block_chained(&wire, self.max_block_data, BULK_DEADLINE)?
            }
            Protocol::T1(t1) => t1.transmit(&wire)?,
        };
        ResponseApdu::parse(&raw)
    }

    fn is_extended_length_supported(&self) -> bool {
        self.extended
    }

    fn ping(&self) -> bool {
        if self.released.load(Ordering::SeqCst) {
            return false;
        }
        match self.inner.try_lock() {
            // An exchange in flight means the reader is certainly there.
            Err(_) => true,
            Ok(mut inner) => {
                let xcvr = match &mut *inner {
                    Protocol::Apdu(xcvr) => xcvr,
                    Protocol::T1(t1) => t1.transceiver_mut(),
                };
                xcvr.get_parameters().is_ok()
            }
        }
    }

    fn release(&self) {
        if let Ok(mut inner) = self.inner.try_lock() {
            if !self.released.load(Ordering::SeqCst) {
                let xcvr = match &mut *inner {
                    Protocol::Apdu(xcvr) => xcvr,
                    Protocol::T1(t1) => t1.transceiver_mut(),
                };
                let _ = xcvr.icc_power_off();
            }
        }
        self.released.store(true, Ordering::SeqCst);
    }

    fn kind(&self) -> TransportKind {
        if self.extended {
            TransportKind::CcidExtended
        } else {
            TransportKind::CcidShort
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn class_descriptor_parse() {
        // 54-byte CCID functional descriptor with dwFeatures 0x00040840
        // and dwMaxCCIDMessageLength 0x0000010F at their fixed offsets.
        let mut desc = vec![0x36, 0x21];
        desc.extend_from_slice(&[0u8; 38]);
        desc.extend_from_slice(&0x0004_0840u32.to_le_bytes());
        desc.extend_from_slice(&0x0000_010Fu32.to_le_bytes());
        desc.extend_from_slice(&[0u8; 6]);
        assert_eq!(desc.len(), 0x36);

        let profile = CcidReaderProfile::parse_class_descriptor(&desc).unwrap();
        assert_eq!(profile.features, 0x0004_0840);
        assert_eq!(profile.max_message_len, 271);
        assert!(profile.features & FEATURE_EXTENDED_APDU != 0);
    }

    #[test]
    fn class_descriptor_skips_other_descriptors() {
        // An endpoint descriptor first, then the CCID one.
        let mut extra = vec![0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00];
        let mut desc = vec![0x36, 0x21];
        desc.extend_from_slice(&[0u8; 38]);
        desc.extend_from_slice(&0x0002_0000u32.to_le_bytes());
        desc.extend_from_slice(&271u32.to_le_bytes());
        desc.extend_from_slice(&[0u8; 6]);
        extra.extend_from_slice(&desc);

        let profile = CcidReaderProfile::parse_class_descriptor(&extra).unwrap();
        assert_eq!(profile.features, FEATURE_SHORT_APDU);
    }

    #[test]
    fn class_descriptor_absent() {
        assert!(CcidReaderProfile::parse_class_descriptor(&hex!("070581024000")).is_none());
    }
}
