//! Pairing flow: wipe-and-provision a card with host-generated keys and
//! fresh PINs, producing the record the caller persists.

use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use hwsec_transport::ByteSecret;

use crate::connection::{OpenPgpConnection, DEFAULT_PW1, DEFAULT_PW3};
use crate::errors::OpenPgpError;
use crate::keys::{KeyFormat, KeyType, PublicKey};
use crate::ops::RsaKeyComponents;

/// What a host persists to recognise a paired card later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairedKey {
    /// The card's AID.
    pub aid: [u8; 16],
    /// Encryption-slot fingerprint.
    pub enc_fp: [u8; 20],
    /// Encryption public key.
    pub enc_pub: PublicKey,
    /// Signature-slot fingerprint, absent for encryption-only setups.
    pub sign_fp: Option<[u8; 20]>,
    /// Signature public key.
    pub sign_pub: Option<PublicKey>,
    /// Authentication-slot fingerprint.
    pub auth_fp: Option<[u8; 20]>,
    /// Authentication public key.
    pub auth_pub: Option<PublicKey>,
}

/// Source of host-side RSA key material for the pairing flow.
pub trait RsaKeyGenerator {
    /// Produce a fresh key of the given modulus size.
    fn generate(&self, bits: usize) -> Result<RsaKeyComponents, OpenPgpError>;
}

/// Generator backed by the `rsa` crate and the operating-system RNG.
#[derive(Debug, Default)]
pub struct HostRsaGenerator;

impl RsaKeyGenerator for HostRsaGenerator {
    fn generate(&self, bits: usize) -> Result<RsaKeyComponents, OpenPgpError> {
        let key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| OpenPgpError::KeyGeneration(e.to_string()))?;
        RsaKeyComponents::from_private_key(&key)
    }
}

/// Provision the card and pair it with this host.
///
/// The card is wiped first: unconditionally when it already holds an
/// encryption key (caller contract), otherwise only when the default
/// admin PIN does not verify. Keys are imported with the common
/// `created_at` timestamp, then PW1 and PW3 are changed from the factory
/// defaults.
///
/// Any failure surfaces as [`OpenPgpError::PairingAborted`] carrying the
/// cause. On failure the card state is undefined — parts of the setup
/// may have been applied — and the caller should wipe and retry.
#[instrument(skip_all, err)]
pub fn setup_paired(
    conn: &OpenPgpConnection,
    new_pw1: &ByteSecret,
    new_pw3: &ByteSecret,
    encryption_only: bool,
    generator: &dyn RsaKeyGenerator,
    created_at: u32,
) -> Result<PairedKey, OpenPgpError> {
    run_setup(conn, new_pw1, new_pw3, encryption_only, generator, created_at).map_err(|cause| {
        OpenPgpError::PairingAborted {
            cause: Box::new(cause),
        }
    })
}

fn run_setup(
    conn: &OpenPgpConnection,
    new_pw1: &ByteSecret,
    new_pw3: &ByteSecret,
    encryption_only: bool,
    generator: &dyn RsaKeyGenerator,
    created_at: u32,
) -> Result<PairedKey, OpenPgpError> {
    let default_pw3 = ByteSecret::from_slice(DEFAULT_PW3);

    if conn.capabilities().has_key(KeyType::Encrypt) {
        // Occupied card: the caller asked for a destructive re-pair.
        debug!("card holds keys, wiping before setup");
        conn.reset_and_wipe()?;
        conn.verify_pw3(&default_pw3)?;
    } else if conn.verify_pw3(&default_pw3).is_err() {
        // Empty slots but a non-default admin PIN: reset to factory
        // state to get a known PIN.
        debug!("default admin PIN rejected, wiping");
        conn.reset_and_wipe()?;
        conn.verify_pw3(&default_pw3)?;
    }

    let enc_key = generator.generate(slot_modulus_bits(conn, KeyType::Encrypt)?)?;
    let enc_fp = conn.import_rsa_key(KeyType::Encrypt, &enc_key, created_at)?;
    let enc_pub = conn.read_public_key(KeyType::Encrypt)?;

    let mut sign_fp = None;
    let mut sign_pub = None;
    let mut auth_fp = None;
    let mut auth_pub = None;
    if !encryption_only {
        let key = generator.generate(slot_modulus_bits(conn, KeyType::Sign)?)?;
        sign_fp = Some(conn.import_rsa_key(KeyType::Sign, &key, created_at)?);
        sign_pub = Some(conn.read_public_key(KeyType::Sign)?);

        let key = generator.generate(slot_modulus_bits(conn, KeyType::Auth)?)?;
        auth_fp = Some(conn.import_rsa_key(KeyType::Auth, &key, created_at)?);
        auth_pub = Some(conn.read_public_key(KeyType::Auth)?);
    }

    conn.change_pw1(&ByteSecret::from_slice(DEFAULT_PW1), new_pw1)?;
    conn.change_pw3(&default_pw3, new_pw3)?;

    let caps = conn.refresh()?;
    Ok(PairedKey {
        aid: *caps.aid(),
        enc_fp,
        enc_pub,
        sign_fp,
        sign_pub,
        auth_fp,
        auth_pub,
    })
}

fn slot_modulus_bits(conn: &OpenPgpConnection, slot: KeyType) -> Result<usize, OpenPgpError> {
    match conn.capabilities().key_format(slot) {
        KeyFormat::Rsa { modulus_bits, .. } => Ok(usize::from(*modulus_bits)),
        _ => Err(OpenPgpError::UnsupportedKeyFormat(
            "pairing generates RSA keys only",
        )),
    }
}
