//! Key slots, algorithm-attribute records, public keys and OpenPGP v4
//! fingerprints.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use hwsec_transport::tlv;

use crate::errors::OpenPgpError;

/// The three key slots of the OpenPGP card application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    /// Signature key, control reference template 0xB6.
    Sign,
    /// Decryption key, control reference template 0xB8.
    Encrypt,
    /// Authentication key, control reference template 0xA4.
    Auth,
}

impl KeyType {
    /// All slots, in the order the card lays out grouped data objects.
    pub const ALL: [KeyType; 3] = [KeyType::Sign, KeyType::Encrypt, KeyType::Auth];

    /// The control reference template tag naming this slot in commands.
    pub fn crt_tag(self) -> u8 {
        match self {
            KeyType::Sign => 0xB6,
            KeyType::Encrypt => 0xB8,
            KeyType::Auth => 0xA4,
        }
    }

    /// Position of this slot in grouped DOs (fingerprints, timestamps).
    pub(crate) fn index(self) -> usize {
        match self {
            KeyType::Sign => 0,
            KeyType::Encrypt => 1,
            KeyType::Auth => 2,
        }
    }

    /// DO carrying this slot's algorithm attributes.
    pub(crate) fn algorithm_attrs_do(self) -> u16 {
        match self {
            KeyType::Sign => 0xC1,
            KeyType::Encrypt => 0xC2,
            KeyType::Auth => 0xC3,
        }
    }

    /// DO the host writes this slot's fingerprint to.
    pub(crate) fn fingerprint_do(self) -> u16 {
        match self {
            KeyType::Sign => 0xC7,
            KeyType::Encrypt => 0xC8,
            KeyType::Auth => 0xC9,
        }
    }

    /// DO the host writes this slot's generation timestamp to.
    pub(crate) fn generation_time_do(self) -> u16 {
        match self {
            KeyType::Sign => 0xCE,
            KeyType::Encrypt => 0xCF,
            KeyType::Auth => 0xD0,
        }
    }
}

/// RSA private-key import format, byte 5 of the algorithm attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RsaImportFormat {
    /// e, p, q.
    Standard,
    /// e, p, q, n.
    StandardWithModulus,
    /// e, p, q, u, dp, dq.
    Crt,
    /// e, p, q, u, dp, dq, n.
    CrtWithModulus,
}

impl RsaImportFormat {
    fn from_byte(b: u8) -> Result<Self, OpenPgpError> {
        match b {
            0x00 => Ok(RsaImportFormat::Standard),
            0x01 => Ok(RsaImportFormat::StandardWithModulus),
            0x02 => Ok(RsaImportFormat::Crt),
            0x03 => Ok(RsaImportFormat::CrtWithModulus),
            _ => Err(OpenPgpError::UnsupportedKeyFormat("unknown RSA import format")),
        }
    }

    /// The CRT components (u, dp, dq) are part of the template.
    pub(crate) fn with_crt(self) -> bool {
        matches!(self, RsaImportFormat::Crt | RsaImportFormat::CrtWithModulus)
    }

    /// The modulus is part of the template.
    pub(crate) fn with_modulus(self) -> bool {
        matches!(
            self,
            RsaImportFormat::StandardWithModulus | RsaImportFormat::CrtWithModulus
        )
    }
}

/// A slot's key format, from its algorithm-attributes DO.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyFormat {
    /// RSA with the given modulus and public-exponent sizes.
    Rsa {
        /// Modulus length in bits.
        modulus_bits: u16,
        /// Public exponent length in bits.
        exponent_bits: u16,
        /// Private-key import format.
        import_format: RsaImportFormat,
    },
    /// ECDSA on the named curve.
    Ecdsa {
        /// DER-encoded curve OID, without tag and length.
        curve_oid: Vec<u8>,
        /// Import format includes the public key.
        with_pubkey: bool,
    },
    /// ECDH on the named curve.
    Ecdh {
        /// DER-encoded curve OID, without tag and length.
        curve_oid: Vec<u8>,
        /// Import format includes the public key.
        with_pubkey: bool,
    },
    /// EdDSA on the named curve.
    Eddsa {
        /// DER-encoded curve OID, without tag and length.
        curve_oid: Vec<u8>,
    },
}

impl KeyFormat {
    /// Parse an algorithm-attributes DO value.
    pub fn parse(attrs: &[u8]) -> Result<KeyFormat, OpenPgpError> {
        let (&id, rest) = attrs
            .split_first()
            .ok_or(OpenPgpError::CapabilityParse("empty algorithm attributes"))?;
        match id {
            0x01 => {
                if rest.len() < 5 {
                    return Err(OpenPgpError::CapabilityParse("short RSA attributes"));
                }
                Ok(KeyFormat::Rsa {
                    modulus_bits: u16::from(rest[0]) << 8 | u16::from(rest[1]),
                    exponent_bits: u16::from(rest[2]) << 8 | u16::from(rest[3]),
                    import_format: RsaImportFormat::from_byte(rest[4])?,
                })
            }
            0x12 | 0x13 => {
                let (oid, with_pubkey) = split_curve_oid(rest)?;
                if id == 0x13 {
                    Ok(KeyFormat::Ecdsa {
                        curve_oid: oid,
                        with_pubkey,
                    })
                } else {
                    Ok(KeyFormat::Ecdh {
                        curve_oid: oid,
                        with_pubkey,
                    })
                }
            }
            0x16 => {
                let (oid, _) = split_curve_oid(rest)?;
                Ok(KeyFormat::Eddsa { curve_oid: oid })
            }
            _ => Err(OpenPgpError::UnsupportedKeyFormat("unknown algorithm id")),
        }
    }
}

/// Split an EC attribute tail into curve OID and the optional trailing
/// import-format flag (0xFF = with public key).
fn split_curve_oid(rest: &[u8]) -> Result<(Vec<u8>, bool), OpenPgpError> {
    if rest.is_empty() {
        return Err(OpenPgpError::CapabilityParse("missing curve OID"));
    }
    if *rest.last().unwrap() == 0xFF && rest.len() > 1 {
        Ok((rest[..rest.len() - 1].to_vec(), true))
    } else {
        Ok((rest.to_vec(), false))
    }
}

/// A public key read from the card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublicKey {
    /// RSA modulus and exponent, big-endian without leading zeros.
    Rsa {
        /// The modulus n.
        modulus: Vec<u8>,
        /// The public exponent e.
        exponent: Vec<u8>,
    },
    /// An EC point on the slot's curve.
    Ec {
        /// DER-encoded curve OID, from the algorithm attributes.
        curve_oid: Vec<u8>,
        /// Uncompressed point (0x04 || x || y), or compressed per curve.
        point: Vec<u8>,
    },
}

/// Parse a GENERATE ASYMMETRIC KEY PAIR response body (tag 7F49).
pub(crate) fn parse_public_key(
    body: &[u8],
    format: &KeyFormat,
) -> Result<PublicKey, OpenPgpError> {
    let root = tlv::parse_single(body, false)?;
    if root.tag() != 0x7F49 {
        return Err(OpenPgpError::CapabilityParse("missing public key template"));
    }
    match format {
        KeyFormat::Rsa { .. } => {
            let modulus = root
                .find(0x81)
                .ok_or(OpenPgpError::CapabilityParse("RSA response without modulus"))?;
            let exponent = root
                .find(0x82)
                .ok_or(OpenPgpError::CapabilityParse("RSA response without exponent"))?;
            Ok(PublicKey::Rsa {
                modulus: strip_leading_zeros(modulus.value()).to_vec(),
                exponent: strip_leading_zeros(exponent.value()).to_vec(),
            })
        }
        KeyFormat::Ecdsa { curve_oid, .. }
        | KeyFormat::Ecdh { curve_oid, .. }
        | KeyFormat::Eddsa { curve_oid } => {
            let point = root
                .find(0x86)
                .ok_or(OpenPgpError::CapabilityParse("EC response without point"))?;
            Ok(PublicKey::Ec {
                curve_oid: curve_oid.clone(),
                point: point.value().to_vec(),
            })
        }
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Append an OpenPGP MPI: 2-byte big-endian bit count, then the value
/// without leading zero octets.
pub(crate) fn mpi_encode(out: &mut Vec<u8>, bytes: &[u8]) {
    let bytes = strip_leading_zeros(bytes);
    let bits = match bytes.first() {
        None => 0usize,
        Some(first) => (bytes.len() - 1) * 8 + (8 - first.leading_zeros() as usize),
    };
    out.push((bits >> 8) as u8);
    out.push((bits & 0xFF) as u8);
    out.extend_from_slice(bytes);
}

/// SHA-1 over the canonical OpenPGP v4 public-key packet for an RSA key:
/// `99 <len> 04 <created_at> 01 MPI(n) MPI(e)`.
pub fn rsa_fingerprint(created_at: u32, modulus: &[u8], exponent: &[u8]) -> [u8; 20] {
    let mut body = Vec::with_capacity(10 + modulus.len() + exponent.len());
    body.push(0x04);
    body.extend_from_slice(&created_at.to_be_bytes());
    body.push(0x01); // public-key algorithm: RSA
    mpi_encode(&mut body, modulus);
    mpi_encode(&mut body, exponent);

    let mut hasher = Sha1::new();
    hasher.update([0x99, (body.len() >> 8) as u8, (body.len() & 0xFF) as u8]);
    hasher.update(&body);
    hasher.finalize().into()
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn rsa_attributes_parse() {
        // RSA-2048, 17-bit exponent, standard import format.
        let format = KeyFormat::parse(&hex!("010800001100")).unwrap();
        assert_eq!(
            format,
            KeyFormat::Rsa {
                modulus_bits: 2048,
                exponent_bits: 17,
                import_format: RsaImportFormat::Standard,
            }
        );

        let format = KeyFormat::parse(&hex!("010800001103")).unwrap();
        assert!(matches!(
            format,
            KeyFormat::Rsa {
                import_format: RsaImportFormat::CrtWithModulus,
                ..
            }
        ));
    }

    #[test]
    fn ec_attributes_parse() {
        // ECDSA on P-256 with public-key import flag.
        let p256 = hex!("2A8648CE3D030107");
        let mut attrs = vec![0x13];
        attrs.extend_from_slice(&p256);
        attrs.push(0xFF);
        let format = KeyFormat::parse(&attrs).unwrap();
        assert_eq!(
            format,
            KeyFormat::Ecdsa {
                curve_oid: p256.to_vec(),
                with_pubkey: true,
            }
        );

        // EdDSA on Ed25519.
        let ed25519 = hex!("2B06010401DA470F01");
        let mut attrs = vec![0x16];
        attrs.extend_from_slice(&ed25519);
        let format = KeyFormat::parse(&attrs).unwrap();
        assert_eq!(
            format,
            KeyFormat::Eddsa {
                curve_oid: ed25519.to_vec()
            }
        );
    }

    #[test]
    fn unknown_algorithm_rejected() {
        assert!(matches!(
            KeyFormat::parse(&hex!("7F0800001100")),
            Err(OpenPgpError::UnsupportedKeyFormat(_))
        ));
    }

    #[test]
    fn mpi_strips_and_counts_bits() {
        let mut out = Vec::new();
        mpi_encode(&mut out, &hex!("000001"));
        assert_eq!(out, hex!("000101"));

        let mut out = Vec::new();
        mpi_encode(&mut out, &hex!("010001"));
        assert_eq!(out, hex!("0011010001"));

        let mut out = Vec::new();
        mpi_encode(&mut out, &hex!("FF"));
        assert_eq!(out, hex!("0008FF"));
    }

    #[test]
    fn fingerprint_matches_canonical_packet() {
        // Cross-check against an independently assembled v4 packet.
        let n = hex!("C2B4D5E6F708192A3B4C5D6E7F8091A2B3C4D5E6");
        let e = hex!("010001");
        let t: u32 = 0x5E00_0000;

        let mut packet = Vec::new();
        let body: Vec<u8> = {
            let mut b = vec![0x04];
            b.extend_from_slice(&hex!("5E000000"));
            b.push(0x01);
            // 160-bit modulus, 17-bit exponent, both MSB-aligned.
            b.extend_from_slice(&hex!("00A0"));
            b.extend_from_slice(&n);
            b.extend_from_slice(&hex!("0011"));
            b.extend_from_slice(&e);
            b
        };
        packet.push(0x99);
        packet.push((body.len() >> 8) as u8);
        packet.push((body.len() & 0xFF) as u8);
        packet.extend_from_slice(&body);

        let mut hasher = Sha1::new();
        hasher.update(&packet);
        let expected: [u8; 20] = hasher.finalize().into();

        assert_eq!(rsa_fingerprint(t, &n, &e), expected);
    }

    #[test]
    fn public_key_parse_rsa() {
        let mut inner = tlv::encode(0x81, &hex!("00C2B4D5"));
        inner.extend_from_slice(&tlv::encode(0x82, &hex!("010001")));
        let body = tlv::encode(0x7F49, &inner);

        let format = KeyFormat::Rsa {
            modulus_bits: 24,
            exponent_bits: 17,
            import_format: RsaImportFormat::Standard,
        };
        let key = parse_public_key(&body, &format).unwrap();
        assert_eq!(
            key,
            PublicKey::Rsa {
                modulus: hex!("C2B4D5").to_vec(),
                exponent: hex!("010001").to_vec(),
            }
        );
    }

    #[test]
    fn public_key_parse_ec() {
        let point = hex!("04AABB");
        let body = tlv::encode(0x7F49, &tlv::encode(0x86, &point));
        let format = KeyFormat::Ecdsa {
            curve_oid: hex!("2A8648CE3D030107").to_vec(),
            with_pubkey: false,
        };
        let key = parse_public_key(&body, &format).unwrap();
        assert_eq!(
            key,
            PublicKey::Ec {
                curve_oid: hex!("2A8648CE3D030107").to_vec(),
                point: point.to_vec(),
            }
        );
    }
}
