//! The capability snapshot of a selected OpenPGP card application.
//!
//! Built once from the AID, historical bytes and DO 6E after SELECT, and
//! rebuilt by `refresh()`; consumers treat a snapshot as immutable and
//! must re-read after any destructive admin operation.

use hwsec_transport::tlv;

use crate::errors::OpenPgpError;
use crate::keys::{KeyFormat, KeyType};

/// Command data limit when extended length is unavailable.
pub const SHORT_MAX_CMD_LEN: usize = 255;
/// Response limit when extended length is unavailable.
pub const SHORT_MAX_RSP_LEN: usize = 256;

/// Card-capabilities bit: the card accepts command chaining.
pub const FEATURE_COMMAND_CHAINING: u8 = 0x80;
/// Card-capabilities bit: the card accepts extended Lc/Le.
pub const FEATURE_EXTENDED_LENGTH: u8 = 0x40;

/// Immutable snapshot of a card's application state and limits.
#[derive(Debug, Clone)]
pub struct OpenPgpCapabilities {
    aid: [u8; 16],
    spec_version: (u8, u8),
    extended_length: bool,
    max_cmd_apdu_len: usize,
    max_rsp_apdu_len: usize,
    max_cardholder_cert_len: usize,
    features: u8,
    algorithm_attrs: [KeyFormat; 3],
    fingerprints: [Option<[u8; 20]>; 3],
    pin_retries: [u8; 3],
}

impl OpenPgpCapabilities {
    /// Parse DO 6E (Application Related Data). `transport_extended` is
    /// whether the underlying link can carry extended APDUs; the
    /// snapshot only reports extended length when both sides support it.
    pub fn parse(
        transport_extended: bool,
        application_related_data: &[u8],
    ) -> Result<OpenPgpCapabilities, OpenPgpError> {
        let root = tlv::parse_single(application_related_data, false)?;
        if root.tag() != 0x6E {
            return Err(OpenPgpError::CapabilityParse("expected DO 6E"));
        }

        let aid_do = root
            .find(0x4F)
            .ok_or(OpenPgpError::CapabilityParse("missing AID"))?;
        if aid_do.value().len() != 16 {
            return Err(OpenPgpError::CapabilityParse("AID is not 16 bytes"));
        }
        let mut aid = [0u8; 16];
        aid.copy_from_slice(aid_do.value());
        // AID bytes 6..8 carry the BCD spec version.
        let spec_version = (aid[6], aid[7]);

        let features = root
            .find(0x5F52)
            .and_then(|h| card_capabilities(h.value()))
            .unwrap_or(0);

        let ext_caps = root
            .find(0xC0)
            .ok_or(OpenPgpError::CapabilityParse("missing extended capabilities"))?;
        let ext_caps = ext_caps.value();
        let card_extended = ext_caps.first().copied().unwrap_or(0) & 0x01 != 0;
        let extended_length = transport_extended && card_extended;

        let read_u16 = |range: std::ops::Range<usize>| -> usize {
            ext_caps
                .get(range)
                .map(|b| usize::from(b[0]) << 8 | usize::from(b[1]))
                .unwrap_or(0)
        };
        let max_cardholder_cert_len = read_u16(4..6);
        let (max_cmd_apdu_len, max_rsp_apdu_len) = if extended_length {
            let cmd = read_u16(6..8);
            let rsp = read_u16(8..10);
            (
                if cmd == 0 { SHORT_MAX_CMD_LEN } else { cmd },
                if rsp == 0 { SHORT_MAX_RSP_LEN } else { rsp },
            )
        } else {
            (SHORT_MAX_CMD_LEN, SHORT_MAX_RSP_LEN)
        };

        let mut attrs = Vec::with_capacity(3);
        for kt in KeyType::ALL {
            let attr_do = root.find(kt.algorithm_attrs_do()).ok_or(
                OpenPgpError::CapabilityParse("missing algorithm attributes"),
            )?;
            attrs.push(KeyFormat::parse(attr_do.value())?);
        }
        let algorithm_attrs: [KeyFormat; 3] = attrs
            .try_into()
            .map_err(|_| OpenPgpError::CapabilityParse("algorithm attributes"))?;

        let pw_status = root
            .find(0xC4)
            .ok_or(OpenPgpError::CapabilityParse("missing PW status bytes"))?;
        let pw_status = pw_status.value();
        if pw_status.len() < 7 {
            return Err(OpenPgpError::CapabilityParse("short PW status bytes"));
        }
        let pin_retries = [pw_status[4], pw_status[5], pw_status[6]];

        let fp_do = root
            .find(0xC5)
            .ok_or(OpenPgpError::CapabilityParse("missing fingerprints"))?;
        let fp_bytes = fp_do.value();
        if fp_bytes.len() < 60 {
            return Err(OpenPgpError::CapabilityParse("short fingerprint DO"));
        }
        let mut fingerprints = [None; 3];
        for kt in KeyType::ALL {
            let chunk = &fp_bytes[kt.index() * 20..kt.index() * 20 + 20];
            if chunk.iter().any(|&b| b != 0) {
                let mut fp = [0u8; 20];
                fp.copy_from_slice(chunk);
                fingerprints[kt.index()] = Some(fp);
            }
        }

        Ok(OpenPgpCapabilities {
            aid,
            spec_version,
            extended_length,
            max_cmd_apdu_len,
            max_rsp_apdu_len,
            max_cardholder_cert_len,
            features,
            algorithm_attrs,
            fingerprints,
            pin_retries,
        })
    }

    /// The full 16-byte AID.
    pub fn aid(&self) -> &[u8; 16] {
        &self.aid
    }

    /// OpenPGP application version from the AID (major, minor).
    pub fn spec_version(&self) -> (u8, u8) {
        self.spec_version
    }

    /// Both link and card support extended-length APDUs.
    pub fn is_extended_length(&self) -> bool {
        self.extended_length
    }

    /// Largest command data field one APDU may carry.
    pub fn max_cmd_apdu_len(&self) -> usize {
        self.max_cmd_apdu_len
    }

    /// Largest response one APDU may return.
    pub fn max_rsp_apdu_len(&self) -> usize {
        self.max_rsp_apdu_len
    }

    /// Size limit of the cardholder certificate DO.
    pub fn max_cardholder_cert_len(&self) -> usize {
        self.max_cardholder_cert_len
    }

    /// Card-capabilities byte from the historical bytes.
    pub fn features(&self) -> u8 {
        self.features
    }

    /// The card accepts chained commands.
    pub fn supports_command_chaining(&self) -> bool {
        self.features & FEATURE_COMMAND_CHAINING != 0
    }

    /// The slot's algorithm attributes.
    pub fn key_format(&self, kt: KeyType) -> &KeyFormat {
        &self.algorithm_attrs[kt.index()]
    }

    /// The slot's fingerprint, if a key is present.
    pub fn fingerprint(&self, kt: KeyType) -> Option<&[u8; 20]> {
        self.fingerprints[kt.index()].as_ref()
    }

    /// True if the slot holds a key (non-zero fingerprint).
    pub fn has_key(&self, kt: KeyType) -> bool {
        self.fingerprints[kt.index()].is_some()
    }

    /// Remaining verification attempts for PW1, the resetting code and
    /// PW3, in that order.
    pub fn pin_retries(&self) -> [u8; 3] {
        self.pin_retries
    }
}

/// Extract the card-capabilities byte from historical bytes: COMPACT-TLV
/// after the category indicator, tag 7 with length 3, third value byte.
fn card_capabilities(historical: &[u8]) -> Option<u8> {
    let mut rest = historical.get(1..)?;
    while let Some((&head, tail)) = rest.split_first() {
        let tag = head >> 4;
        let len = usize::from(head & 0x0F);
        if tail.len() < len {
            return None;
        }
        if tag == 0x7 && len == 3 {
            return Some(tail[2]);
        }
        rest = &tail[len..];
    }
    None
}
