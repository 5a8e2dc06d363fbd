//! Session with the OpenPGP card application: selection, capability
//! probing, APDU chaining in both directions and PIN state.

use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use hwsec_transport::apdu::CLA_CHAINING;
use hwsec_transport::{ByteSecret, CommandApdu, ResponseApdu, SecurityKeyTransport};

use crate::capabilities::OpenPgpCapabilities;
use crate::errors::OpenPgpError;

/// The OpenPGP card application AID, as carried in SELECT.
pub const OPENPGP_AID: [u8; 6] = [0xD2, 0x76, 0x00, 0x01, 0x24, 0x01];

/// Factory-default user PIN after TERMINATE/ACTIVATE.
pub const DEFAULT_PW1: &[u8] = b"123456";
/// Factory-default admin PIN after TERMINATE/ACTIVATE.
pub const DEFAULT_PW3: &[u8] = b"12345678";

/// How PW1 verification is scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pw1Mode {
    /// Mode 0x81: valid for one PSO:CDS.
    SignOnce,
    /// Mode 0x82: valid for the rest of the session.
    Session,
}

impl Pw1Mode {
    fn p2(self) -> u8 {
        match self {
            Pw1Mode::SignOnce => 0x81,
            Pw1Mode::Session => 0x82,
        }
    }
}

/// Collaborator that prompts for or looks up the user PIN of a card.
pub trait PinProvider: Send + Sync {
    /// Produce PW1 for the card identified by `aid`, or `None` when the
    /// user declined.
    fn get_pin(&self, aid: &[u8; 16]) -> Option<ByteSecret>;
}

#[derive(Default)]
struct PinCache {
    pw1: Option<(ByteSecret, Pw1Mode)>,
    pw3: Option<ByteSecret>,
}

/// A live session with the OpenPGP applet on one transport.
///
/// The capability snapshot is immutable and swapped atomically on
/// [`refresh`](OpenPgpConnection::refresh); holding a snapshot across a
/// destructive admin operation yields stale data.
///
/// Verified PINs are cached in zeroised buffers and replayed once when
/// the card answers 6982 (it forgets verification state on power cycles
/// and some command sequences); the cache is cleared on PIN change and
/// on [`release`](OpenPgpConnection::release).
pub struct OpenPgpConnection {
    transport: Arc<dyn SecurityKeyTransport>,
    caps: RwLock<Option<Arc<OpenPgpCapabilities>>>,
    pins: Mutex<PinCache>,
}

impl std::fmt::Debug for OpenPgpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenPgpConnection").finish_non_exhaustive()
    }
}

impl OpenPgpConnection {
    /// SELECT the applet and probe its capabilities.
    ///
    /// Fails with [`OpenPgpError::AppletNotPresent`] when the card does
    /// not host the OpenPGP application.
    pub fn open(transport: Arc<dyn SecurityKeyTransport>) -> Result<Self, OpenPgpError> {
        let conn = OpenPgpConnection {
            transport,
            caps: RwLock::new(None),
            pins: Mutex::new(PinCache::default()),
        };
        conn.reselect()?;
        conn.refresh()?;
        Ok(conn)
    }

    /// SELECT the applet again, e.g. after TERMINATE/ACTIVATE.
    pub(crate) fn reselect(&self) -> Result<(), OpenPgpError> {
        let select = CommandApdu::new(0x00, 0xA4, 0x04, 0x00, OPENPGP_AID.to_vec(), 256);
        let rsp = self.exchange(&select)?;
        if !rsp.is_success() {
            return Err(OpenPgpError::from_status(rsp.sw));
        }
        Ok(())
    }

    /// The current capability snapshot.
    pub fn capabilities(&self) -> Arc<OpenPgpCapabilities> {
        self.caps
            .read()
            .unwrap()
            .clone()
            .expect("capabilities probed during open")
    }

    /// Re-read Application Related Data and swap in a fresh snapshot.
    pub fn refresh(&self) -> Result<Arc<OpenPgpCapabilities>, OpenPgpError> {
        let ard = self.get_data(0x6E)?;
        let caps = Arc::new(OpenPgpCapabilities::parse(
            self.transport.is_extended_length_supported(),
            &ard,
        )?);
        *self.caps.write().unwrap() = Some(Arc::clone(&caps));
        Ok(caps)
    }

    /// Read a data object.
    pub fn get_data(&self, tag: u16) -> Result<Vec<u8>, OpenPgpError> {
        let cmd = CommandApdu::new(0x00, 0xCA, (tag >> 8) as u8, (tag & 0xFF) as u8, vec![], self.max_ne());
        Ok(self.communicate(&cmd)?.data)
    }

    /// Write a data object.
    pub fn put_data(&self, tag: u16, data: impl Into<Vec<u8>>) -> Result<(), OpenPgpError> {
        let cmd = CommandApdu::new(0x00, 0xDA, (tag >> 8) as u8, (tag & 0xFF) as u8, data, 0);
        self.communicate(&cmd).map(drop)
    }

    /// Write an extended header list (PUT DATA with odd INS, DO 3FFF),
    /// as key import requires. Needs prior PW3 verification.
    pub fn put_key_template(&self, data: impl Into<Vec<u8>>) -> Result<(), OpenPgpError> {
        let cmd = CommandApdu::new(0x00, 0xDB, 0x3F, 0xFF, data, 0);
        self.communicate(&cmd).map(drop)
    }

    /// Verify the user PIN in the given mode and cache it on success.
    pub fn verify_pw1(&self, pin: &ByteSecret, mode: Pw1Mode) -> Result<(), OpenPgpError> {
        self.send_verify(mode.p2(), pin)?;
        self.pins.lock().unwrap().pw1 = Some((pin.duplicate(), mode));
        Ok(())
    }

    /// Fetch PW1 from a [`PinProvider`] and verify it in the given mode.
    pub fn verify_pw1_from(
        &self,
        provider: &dyn PinProvider,
        mode: Pw1Mode,
    ) -> Result<(), OpenPgpError> {
        let aid = *self.capabilities().aid();
        let pin = provider
            .get_pin(&aid)
            .ok_or(OpenPgpError::SecurityNotSatisfied)?;
        self.verify_pw1(&pin, mode)
    }

    /// Verify the admin PIN and cache it on success.
    pub fn verify_pw3(&self, pin: &ByteSecret) -> Result<(), OpenPgpError> {
        self.send_verify(0x83, pin)?;
        self.pins.lock().unwrap().pw3 = Some(pin.duplicate());
        Ok(())
    }

    /// CHANGE REFERENCE DATA for PW1. Clears the cached PIN.
    pub fn change_pw1(&self, old: &ByteSecret, new: &ByteSecret) -> Result<(), OpenPgpError> {
        self.change_reference_data(0x81, old, new)?;
        self.pins.lock().unwrap().pw1 = None;
        Ok(())
    }

    /// CHANGE REFERENCE DATA for PW3. Clears the cached PIN.
    pub fn change_pw3(&self, old: &ByteSecret, new: &ByteSecret) -> Result<(), OpenPgpError> {
        self.change_reference_data(0x83, old, new)?;
        self.pins.lock().unwrap().pw3 = None;
        Ok(())
    }

    /// RESET RETRY COUNTER: unblock PW1 and set it to `new_pw1`.
    /// Requires prior PW3 verification.
    pub fn reset_retry_counter(&self, new_pw1: &ByteSecret) -> Result<(), OpenPgpError> {
        let cmd = CommandApdu::new(0x00, 0x2C, 0x02, 0x81, new_pw1.reveal().to_vec(), 0);
        let rsp = self.exchange(&cmd)?;
        if !rsp.is_success() {
            return Err(OpenPgpError::from_status(rsp.sw));
        }
        self.pins.lock().unwrap().pw1 = None;
        Ok(())
    }

    /// Drop cached PINs without touching the card.
    pub fn clear_pin_cache(&self) {
        let mut pins = self.pins.lock().unwrap();
        pins.pw1 = None;
        pins.pw3 = None;
    }

    /// Clear the PIN cache and release the underlying transport.
    pub fn release(&self) {
        self.clear_pin_cache();
        self.transport.release();
    }

    /// Exchange a command, retrying once with replayed cached PINs when
    /// the card reports lost verification state. Non-9000 outcomes map
    /// to the error taxonomy.
    pub fn communicate(&self, cmd: &CommandApdu) -> Result<ResponseApdu, OpenPgpError> {
        let rsp = self.exchange(cmd)?;
        if rsp.is_success() {
            return Ok(rsp);
        }
        if rsp.sw == 0x6982 && self.replay_cached_pins()? {
            debug!("verification state lost, re-verified from cache");
            let rsp = self.exchange(cmd)?;
            if rsp.is_success() {
                return Ok(rsp);
            }
            return Err(OpenPgpError::from_status(rsp.sw));
        }
        Err(OpenPgpError::from_status(rsp.sw))
    }

    fn max_ne(&self) -> usize {
        self.caps
            .read()
            .unwrap()
            .as_ref()
            .map_or(256, |c| c.max_rsp_apdu_len())
    }

    fn max_cmd_data(&self) -> usize {
        self.caps
            .read()
            .unwrap()
            .as_ref()
            .map_or(255, |c| c.max_cmd_apdu_len())
    }

    fn change_reference_data(
        &self,
        p2: u8,
        old: &ByteSecret,
        new: &ByteSecret,
    ) -> Result<(), OpenPgpError> {
        let mut data = Vec::with_capacity(old.len() + new.len());
        data.extend_from_slice(old.reveal());
        data.extend_from_slice(new.reveal());
        let cmd = CommandApdu::new(0x00, 0x24, 0x00, p2, data, 0);
        let rsp = self.exchange(&cmd)?;
        if !rsp.is_success() {
            return Err(OpenPgpError::from_status(rsp.sw));
        }
        Ok(())
    }

    fn send_verify(&self, p2: u8, pin: &ByteSecret) -> Result<(), OpenPgpError> {
        let cmd = CommandApdu::new(0x00, 0x20, 0x00, p2, pin.reveal().to_vec(), 0);
        let rsp = self.exchange(&cmd)?;
        if rsp.is_success() {
            Ok(())
        } else {
            Err(OpenPgpError::from_status(rsp.sw))
        }
    }

    /// Re-verify whatever PINs are cached. True if at least one was
    /// replayed. A PIN the card now rejects is dropped from the cache.
    fn replay_cached_pins(&self) -> Result<bool, OpenPgpError> {
        let (pw1, pw3) = {
            let pins = self.pins.lock().unwrap();
            (
                pins.pw1.as_ref().map(|(s, m)| (s.duplicate(), *m)),
                pins.pw3.as_ref().map(ByteSecret::duplicate),
            )
        };
        let mut replayed = false;
        if let Some(pw3) = pw3 {
            match self.send_verify(0x83, &pw3) {
                Ok(()) => replayed = true,
                Err(e) => {
                    warn!(err = %e, "cached PW3 no longer verifies");
                    self.pins.lock().unwrap().pw3 = None;
                }
            }
        }
        if let Some((pw1, mode)) = pw1 {
            match self.send_verify(mode.p2(), &pw1) {
                Ok(()) => replayed = true,
                Err(e) => {
                    warn!(err = %e, "cached PW1 no longer verifies");
                    self.pins.lock().unwrap().pw1 = None;
                }
            }
        }
        Ok(replayed)
    }

    /// One logical APDU exchange: chain the command out when it exceeds
    /// the card's command limit, then drain 61xx/6Cxx continuations.
    /// The returned response carries the final status word.
    fn exchange(&self, cmd: &CommandApdu) -> Result<ResponseApdu, OpenPgpError> {
        let max_data = self.max_cmd_data();
        let rsp = if cmd.data.len() > max_data {
            let chunks: Vec<&[u8]> = cmd.data.chunks(max_data).collect();
            let last = chunks.len() - 1;
            let mut rsp = None;
            for (i, chunk) in chunks.iter().enumerate() {
                let mut part =
                    CommandApdu::new(cmd.cla, cmd.ins, cmd.p1, cmd.p2, chunk.to_vec(), 0);
                if i < last {
                    part.cla |= CLA_CHAINING;
                } else {
                    part.ne = cmd.ne;
                }
                let r = self.transport.transceive(&part)?;
                // Intermediate chunks must be accepted outright.
                if i < last && !r.is_success() {
                    return Err(OpenPgpError::from_status(r.sw));
                }
                rsp = Some(r);
            }
            rsp.expect("at least one chunk")
        } else {
            self.transport.transceive(cmd)?
        };
        self.drain_response(cmd, rsp)
    }

    /// Follow 61xx (GET RESPONSE) and 6Cxx (wrong Le) continuations,
    /// accumulating the body. Intermediate status words are consumed;
    /// the final fragment's SW is returned.
    fn drain_response(
        &self,
        cmd: &CommandApdu,
        mut rsp: ResponseApdu,
    ) -> Result<ResponseApdu, OpenPgpError> {
        let mut acc: Vec<u8> = Vec::new();
        loop {
            if let Some(remaining) = rsp.bytes_remaining() {
                acc.extend_from_slice(&rsp.data);
                let get_response = CommandApdu::new(0x00, 0xC0, 0x00, 0x00, vec![], remaining);
                rsp = self.transport.transceive(&get_response)?;
                continue;
            }
            if rsp.sw1() == 0x6C {
                let ne = match rsp.sw2() {
                    0 => 256,
                    n => usize::from(n),
                };
                rsp = self.transport.transceive(&cmd.with_ne(ne))?;
                continue;
            }
            break;
        }
        if acc.is_empty() {
            Ok(rsp)
        } else {
            acc.extend_from_slice(&rsp.data);
            Ok(ResponseApdu::new(acc, rsp.sw))
        }
    }
}
