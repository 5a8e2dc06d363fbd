//! Zeroisable byte buffers for PINs and PUKs.

use zeroize::Zeroize;

/// A fixed-length byte secret that is overwritten when released.
///
/// Copies are explicit: there is no `Clone` impl, use
/// [`ByteSecret::duplicate`] where a second owner is genuinely needed.
/// Equality on the raw bytes is not constant-time; callers comparing
/// secret material must do so through [`ByteSecret::reveal`] and accept
/// the timing consequences.
pub struct ByteSecret(Vec<u8>);

impl ByteSecret {
    /// Take ownership of `bytes` as secret material.
    pub fn new(bytes: Vec<u8>) -> Self {
        ByteSecret(bytes)
    }

    /// Copy `bytes` into a fresh secret.
    pub fn from_slice(bytes: &[u8]) -> Self {
        ByteSecret(bytes.to_vec())
    }

    /// Explicitly duplicate the secret.
    pub fn duplicate(&self) -> Self {
        ByteSecret(self.0.clone())
    }

    /// Borrow the secret material.
    pub fn reveal(&self) -> &[u8] {
        &self.0
    }

    /// Secret length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for ByteSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for ByteSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ByteSecret(<{} bytes>)", self.0.len())
    }
}

impl From<&str> for ByteSecret {
    fn from(s: &str) -> Self {
        ByteSecret::from_slice(s.as_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duplicate_is_independent() {
        let a = ByteSecret::from_slice(b"123456");
        let b = a.duplicate();
        drop(a);
        assert_eq!(b.reveal(), b"123456");
    }

    #[test]
    fn debug_redacts() {
        let s = ByteSecret::from_slice(b"123456");
        assert_eq!(format!("{s:?}"), "ByteSecret(<6 bytes>)");
    }
}
