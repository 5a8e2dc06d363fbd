//! Card operations on top of the session: key import and generation,
//! fingerprint and timestamp bookkeeping, administrative reset.

use num_bigint_dig::{BigUint, ModInverse};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::RsaPrivateKey;
use tracing::debug;
use zeroize::Zeroize;

use hwsec_transport::tlv;
use hwsec_transport::{ByteSecret, CommandApdu};

use crate::connection::OpenPgpConnection;
use crate::errors::OpenPgpError;
use crate::keys::{
    parse_public_key, rsa_fingerprint, KeyFormat, KeyType, PublicKey, RsaImportFormat,
};

/// RSA private-key components as big-endian byte strings. All buffers
/// are overwritten when the value is dropped.
pub struct RsaKeyComponents {
    /// Modulus n.
    pub n: Vec<u8>,
    /// Public exponent e.
    pub e: Vec<u8>,
    /// Private exponent d.
    pub d: Vec<u8>,
    /// First prime p.
    pub p: Vec<u8>,
    /// Second prime q.
    pub q: Vec<u8>,
}

impl Drop for RsaKeyComponents {
    fn drop(&mut self) {
        self.n.zeroize();
        self.e.zeroize();
        self.d.zeroize();
        self.p.zeroize();
        self.q.zeroize();
    }
}

impl std::fmt::Debug for RsaKeyComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RsaKeyComponents(<{} bit>)", bit_length(&self.n))
    }
}

impl RsaKeyComponents {
    /// Extract the components of a two-prime [`RsaPrivateKey`].
    pub fn from_private_key(key: &RsaPrivateKey) -> Result<RsaKeyComponents, OpenPgpError> {
        let primes = key.primes();
        if primes.len() != 2 {
            return Err(OpenPgpError::UnsupportedKeyFormat("multi-prime RSA"));
        }
        Ok(RsaKeyComponents {
            n: key.n().to_bytes_be(),
            e: key.e().to_bytes_be(),
            d: key.d().to_bytes_be(),
            p: primes[0].to_bytes_be(),
            q: primes[1].to_bytes_be(),
        })
    }

    /// CRT components in card order: u = p⁻¹ mod q, dp = d mod (p-1),
    /// dq = d mod (q-1).
    fn crt(&self) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), OpenPgpError> {
        let p = BigUint::from_bytes_be(&self.p);
        let q = BigUint::from_bytes_be(&self.q);
        let d = BigUint::from_bytes_be(&self.d);
        let u = (&p)
            .mod_inverse(&q)
            .and_then(|u| u.to_biguint())
            .ok_or(OpenPgpError::KeyImportRejected("p has no inverse mod q"))?;
        let dp = &d % (&p - 1u32);
        let dq = &d % (&q - 1u32);
        Ok((u.to_bytes_be(), dp.to_bytes_be(), dq.to_bytes_be()))
    }
}

fn bit_length(bytes: &[u8]) -> usize {
    match bytes.iter().position(|&b| b != 0) {
        None => 0,
        Some(first) => (bytes.len() - first - 1) * 8 + (8 - bytes[first].leading_zeros() as usize),
    }
}

/// Append a BER tag and length without a value, as the 7F48 template
/// lists its components.
fn push_tag_len(out: &mut Vec<u8>, tag: u8, len: usize) {
    out.push(tag);
    match len {
        0..=0x7F => out.push(len as u8),
        0x80..=0xFF => {
            out.push(0x81);
            out.push(len as u8);
        }
        _ => {
            out.push(0x82);
            out.push((len >> 8) as u8);
            out.push((len & 0xFF) as u8);
        }
    }
}

/// Build the extended header list (DO 4D) for an RSA import into `slot`,
/// honouring the card's declared import format.
fn build_import_payload(
    slot: KeyType,
    key: &RsaKeyComponents,
    format: RsaImportFormat,
) -> Result<Vec<u8>, OpenPgpError> {
    let crt;
    let mut fields: Vec<(u8, &[u8])> = vec![(0x91, &key.e), (0x92, &key.p), (0x93, &key.q)];
    if format.with_crt() {
        crt = key.crt()?;
        fields.push((0x94, &crt.0));
        fields.push((0x95, &crt.1));
        fields.push((0x96, &crt.2));
    }
    if format.with_modulus() {
        fields.push((0x97, &key.n));
    }

    let mut template = Vec::new();
    let mut cryptogram = Vec::new();
    for (tag, value) in &fields {
        push_tag_len(&mut template, *tag, value.len());
        cryptogram.extend_from_slice(value);
    }

    let mut inner = vec![slot.crt_tag(), 0x00];
    inner.extend_from_slice(&tlv::encode(0x7F48, &template));
    inner.extend_from_slice(&tlv::encode(0x5F48, &cryptogram));
    let payload = tlv::encode(0x4D, &inner);
    cryptogram.zeroize();
    Ok(payload)
}

impl OpenPgpConnection {
    /// Import a host-generated RSA key into `slot`.
    ///
    /// Sends the extended header list through PUT DATA (chained as
    /// needed), writes the fingerprint and generation-time DOs, then
    /// refreshes capabilities and checks the card took the key. Requires
    /// prior PW3 verification.
    pub fn import_rsa_key(
        &self,
        slot: KeyType,
        key: &RsaKeyComponents,
        created_at: u32,
    ) -> Result<[u8; 20], OpenPgpError> {
        let caps = self.capabilities();
        let format = match caps.key_format(slot) {
            KeyFormat::Rsa {
                modulus_bits,
                import_format,
                ..
            } => {
                if usize::from(*modulus_bits) != bit_length(&key.n) {
                    return Err(OpenPgpError::UnsupportedKeyFormat(
                        "modulus size differs from slot attributes",
                    ));
                }
                *import_format
            }
            _ => {
                // EC import is planned; the attribute parse already
                // understands the formats.
                return Err(OpenPgpError::UnsupportedKeyFormat("slot expects an EC key"));
            }
        };

        debug!(slot = ?slot, bits = bit_length(&key.n), "importing RSA key");
        let payload = build_import_payload(slot, key, format)?;
        self.put_key_template(payload)?;

        let fingerprint = rsa_fingerprint(created_at, &key.n, &key.e);
        self.put_data(slot.fingerprint_do(), fingerprint.to_vec())?;
        self.put_data(slot.generation_time_do(), created_at.to_be_bytes().to_vec())?;

        let caps = self.refresh()?;
        if caps.fingerprint(slot) != Some(&fingerprint) {
            return Err(OpenPgpError::KeyImportRejected(
                "fingerprint read-back mismatch",
            ));
        }
        Ok(fingerprint)
    }

    /// Generate a key pair on the card in `slot` and register its
    /// fingerprint and generation time. Requires prior PW3 verification.
    pub fn generate_key_on_card(
        &self,
        slot: KeyType,
        created_at: u32,
    ) -> Result<(PublicKey, [u8; 20]), OpenPgpError> {
        let caps = self.capabilities();
        let format = caps.key_format(slot).clone();
        if !matches!(format, KeyFormat::Rsa { .. }) {
            return Err(OpenPgpError::UnsupportedKeyFormat(
                "on-card generation implemented for RSA slots",
            ));
        }

        let cmd = CommandApdu::new(
            0x00,
            0x47,
            0x80,
            0x00,
            vec![slot.crt_tag(), 0x00],
            caps.max_rsp_apdu_len(),
        );
        let rsp = self.communicate(&cmd)?;
        let public = parse_public_key(&rsp.data, &format)?;

        let PublicKey::Rsa { modulus, exponent } = &public else {
            return Err(OpenPgpError::UnsupportedKeyFormat(
                "card returned a non-RSA public key",
            ));
        };
        let fingerprint = rsa_fingerprint(created_at, modulus, exponent);
        self.put_data(slot.fingerprint_do(), fingerprint.to_vec())?;
        self.put_data(slot.generation_time_do(), created_at.to_be_bytes().to_vec())?;
        self.refresh()?;
        Ok((public, fingerprint))
    }

    /// Read the public half of the key in `slot`.
    pub fn read_public_key(&self, slot: KeyType) -> Result<PublicKey, OpenPgpError> {
        let caps = self.capabilities();
        let cmd = CommandApdu::new(
            0x00,
            0x47,
            0x81,
            0x00,
            vec![slot.crt_tag(), 0x00],
            caps.max_rsp_apdu_len(),
        );
        let rsp = self.communicate(&cmd)?;
        parse_public_key(&rsp.data, caps.key_format(slot))
    }

    /// TERMINATE DF followed by ACTIVATE FILE: erase all keys, restore
    /// factory PINs and retry counters, then re-select and re-probe.
    ///
    /// TERMINATE is only allowed with PW3 verified or blocked; when the
    /// card refuses and no admin PIN is at hand, PW3 is deliberately
    /// blocked with bogus verifications to force the reset through.
    pub fn reset_and_wipe(&self) -> Result<(), OpenPgpError> {
        debug!("terminating and reactivating the applet");
        match self.terminate_df() {
            Ok(()) => {}
            Err(OpenPgpError::ConditionsNotSatisfied) => {
                self.block_pw3()?;
                self.terminate_df()?;
            }
            Err(e) => return Err(e),
        }
        self.communicate(&CommandApdu::new(0x00, 0x44, 0x00, 0x00, vec![], 0))?;
        self.clear_pin_cache();
        self.reselect()?;
        self.refresh()?;
        Ok(())
    }

    fn terminate_df(&self) -> Result<(), OpenPgpError> {
        self.communicate(&CommandApdu::new(0x00, 0xE6, 0x00, 0x00, vec![], 0))
            .map(drop)
    }

    /// Exhaust the PW3 retry counter with verifications that cannot
    /// match any real PIN.
    fn block_pw3(&self) -> Result<(), OpenPgpError> {
        let bogus = ByteSecret::from_slice(&[0xFF; 8]);
        for _ in 0..12 {
            match self.verify_pw3(&bogus) {
                Err(OpenPgpError::PinIncorrect { .. }) => continue,
                Err(OpenPgpError::PinBlocked) => return Ok(()),
                // A card that accepts 0xFF.. as PW3 clears the way too.
                Ok(()) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Err(OpenPgpError::PinBlocked)
    }
}
