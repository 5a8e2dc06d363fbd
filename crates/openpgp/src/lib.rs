//! Driver for the OpenPGP card application on hardware security tokens:
//! applet selection, capability discovery, PIN state, key import and
//! generation with fingerprint bookkeeping, and the pairing flow.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(unused_extern_crates)]

/// Capability snapshots from Application Related Data.
pub mod capabilities;
/// The applet session: SELECT, chaining, PINs.
pub mod connection;
/// The error taxonomy.
pub mod errors;
/// Key slots, formats, public keys and fingerprints.
pub mod keys;
/// Card operations: import, generation, reset.
pub mod ops;
/// The pairing flow.
pub mod pairing;

pub use capabilities::OpenPgpCapabilities;
pub use connection::{
    OpenPgpConnection, PinProvider, Pw1Mode, DEFAULT_PW1, DEFAULT_PW3, OPENPGP_AID,
};
pub use errors::OpenPgpError;
pub use keys::{rsa_fingerprint, KeyFormat, KeyType, PublicKey, RsaImportFormat};
pub use ops::RsaKeyComponents;
pub use pairing::{setup_paired, HostRsaGenerator, PairedKey, RsaKeyGenerator};
