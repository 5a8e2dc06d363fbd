//! U2F HID transport: 64-byte report framing, channel allocation via
//! INIT, and APDU encapsulation in MSG transactions (FIDO U2F HID v1.2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use super::{SecurityKeyTransport, TransportKind};
use crate::apdu::{CommandApdu, ResponseApdu};
use crate::errors::{TransportError, U2fHidErrorCode};

/// Fixed HID report size.
pub const REPORT_SIZE: usize = 64;
/// Payload bytes in an init frame.
const INIT_PAYLOAD: usize = REPORT_SIZE - 7;
/// Payload bytes in a continuation frame.
const CONT_PAYLOAD: usize = REPORT_SIZE - 5;

const CID_BROADCAST: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];

const CMD_PING: u8 = 0x81;
const CMD_KEEPALIVE: u8 = 0x82;
const CMD_MSG: u8 = 0x83;
const CMD_INIT: u8 = 0x86;
const CMD_ERROR: u8 = 0xBF;

/// Default transaction deadline.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);
/// Deadline once the key signals it is waiting for user presence.
pub const USER_PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// Collaborator interface over a HID device delivering 64-byte reports.
pub trait HidReportPipe: Send {
    /// Write one output report.
    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<(), TransportError>;
    /// Read one input report; must not return more than `REPORT_SIZE`.
    fn read_report(
        &mut self,
        buf: &mut [u8; REPORT_SIZE],
        deadline: Duration,
    ) -> Result<usize, TransportError>;
}

impl HidReportPipe for hidapi_rusb::HidDevice {
    fn write_report(&mut self, report: &[u8; REPORT_SIZE]) -> Result<(), TransportError> {
        // Leading report number 0x00, as HID stacks expect on all
        // platforms; the device sees exactly 64 bytes.
        let mut buf = [0u8; REPORT_SIZE + 1];
        buf[1..].copy_from_slice(report);
        let written = self.write(&buf)?;
        if written < buf.len() {
            return Err(TransportError::Io("short HID report write".into()));
        }
        Ok(())
    }

    fn read_report(
        &mut self,
        buf: &mut [u8; REPORT_SIZE],
        deadline: Duration,
    ) -> Result<usize, TransportError> {
        let n = self.read_timeout(buf, deadline.as_millis() as i32)?;
        if n == 0 {
            return Err(TransportError::Timeout(deadline));
        }
        Ok(n)
    }
}

/// Split one message into an init frame plus continuation frames.
///
/// For a payload of S bytes this yields exactly one init frame and
/// `ceil((S - 57) / 59)` continuations, SEQ numbered 0, 1, 2, …
fn split_frames(cid: [u8; 4], cmd: u8, payload: &[u8]) -> Vec<[u8; REPORT_SIZE]> {
    let mut frames = Vec::with_capacity(1 + payload.len().saturating_sub(INIT_PAYLOAD) / CONT_PAYLOAD + 1);

    let mut frame = [0u8; REPORT_SIZE];
    frame[..4].copy_from_slice(&cid);
    frame[4] = cmd;
    frame[5] = (payload.len() >> 8) as u8;
    frame[6] = (payload.len() & 0xFF) as u8;
    let first = payload.len().min(INIT_PAYLOAD);
    frame[7..7 + first].copy_from_slice(&payload[..first]);
    frames.push(frame);

    for (seq, chunk) in payload[first..].chunks(CONT_PAYLOAD).enumerate() {
        let mut frame = [0u8; REPORT_SIZE];
        frame[..4].copy_from_slice(&cid);
        frame[4] = seq as u8;
        frame[5..5 + chunk.len()].copy_from_slice(chunk);
        frames.push(frame);
    }
    frames
}

fn write_message(
    pipe: &mut dyn HidReportPipe,
    cid: [u8; 4],
    cmd: u8,
    payload: &[u8],
) -> Result<(), TransportError> {
    for frame in split_frames(cid, cmd, payload) {
        pipe.write_report(&frame)?;
    }
    Ok(())
}

/// Read and reassemble one message addressed to `cid`, skipping traffic
/// for other channels and waiting out KEEPALIVE notifications.
fn read_message(
    pipe: &mut dyn HidReportPipe,
    cid: [u8; 4],
    deadline: Duration,
) -> Result<(u8, Vec<u8>), TransportError> {
    let started = Instant::now();
    let mut deadline = deadline;

    'message: loop {
        let remaining = deadline
            .checked_sub(started.elapsed())
            .ok_or(TransportError::Timeout(deadline))?;

        let mut report = [0u8; REPORT_SIZE];
        pipe.read_report(&mut report, remaining)?;
        if report[..4] != cid {
            trace!("skipping frame for foreign channel");
            continue;
        }
        let cmd = report[4];
        if cmd & 0x80 == 0 {
            // Continuation without a pending transaction; discard.
            continue;
        }

        let bcnt = usize::from(report[5]) << 8 | usize::from(report[6]);
        let mut payload = Vec::with_capacity(bcnt);
        payload.extend_from_slice(&report[7..7 + bcnt.min(INIT_PAYLOAD)]);

        let mut expected_seq = 0u8;
        while payload.len() < bcnt {
            let remaining = deadline
                .checked_sub(started.elapsed())
                .ok_or(TransportError::Timeout(deadline))?;
            let mut report = [0u8; REPORT_SIZE];
            pipe.read_report(&mut report, remaining)?;
            if report[..4] != cid {
                continue;
            }
            if report[4] != expected_seq {
                warn!(got = report[4], expected = expected_seq, "continuation out of sequence");
                return Err(TransportError::U2fHidError(U2fHidErrorCode::InvalidSeq));
            }
            expected_seq += 1;
            let want = (bcnt - payload.len()).min(CONT_PAYLOAD);
            payload.extend_from_slice(&report[5..5 + want]);
        }

        match cmd {
            CMD_KEEPALIVE => {
                // The key is waiting on the user; stretch the deadline.
                debug!("device busy with user presence, extending deadline");
                deadline = USER_PRESENCE_TIMEOUT;
                continue 'message;
            }
            CMD_ERROR => {
                let code = payload.first().copied().unwrap_or(0);
                return Err(match U2fHidErrorCode::from_byte(code) {
                    U2fHidErrorCode::ChannelBusy => TransportError::U2fHidChannelBusy,
                    other => TransportError::U2fHidError(other),
                });
            }
            _ => return Ok((cmd, payload)),
        }
    }
}

/// Version and capability record returned by INIT.
#[derive(Debug, Clone, Copy)]
pub struct U2fHidDeviceInfo {
    /// U2F HID protocol version.
    pub protocol_version: u8,
    /// Device firmware version (major, minor, build).
    pub version: (u8, u8, u8),
    /// Capability flags byte.
    pub capabilities: u8,
}

struct Inner {
    pipe: Box<dyn HidReportPipe>,
    cid: [u8; 4],
}

/// A security key speaking APDUs over U2F HID MSG transactions.
///
/// One transaction is outstanding per channel at any time; the transport
/// enforces this with its exchange lock.
pub struct U2fHidTransport {
    inner: Mutex<Inner>,
    released: AtomicBool,
    info: U2fHidDeviceInfo,
}

impl U2fHidTransport {
    /// Allocate a channel on the key and return the connected transport.
    ///
    /// Issues INIT on the broadcast channel with a random 8-byte nonce;
    /// the response must echo the nonce and carries the allocated CID.
    pub fn connect(mut pipe: Box<dyn HidReportPipe>) -> Result<Self, TransportError> {
        let nonce: [u8; 8] = rand::random();
        write_message(pipe.as_mut(), CID_BROADCAST, CMD_INIT, &nonce)?;
        let (cmd, payload) = read_message(pipe.as_mut(), CID_BROADCAST, COMMAND_TIMEOUT)?;
        if cmd != CMD_INIT {
            return Err(TransportError::U2fHidBadInit("unexpected response command"));
        }
        if payload.len() < 17 {
            return Err(TransportError::U2fHidBadInit("INIT payload too short"));
        }
        if payload[..8] != nonce {
            return Err(TransportError::U2fHidBadInit("nonce mismatch"));
        }
        let cid = [payload[8], payload[9], payload[10], payload[11]];
        if cid == [0; 4] || cid == CID_BROADCAST {
            return Err(TransportError::U2fHidBadInit("unusable channel id"));
        }
        let info = U2fHidDeviceInfo {
            protocol_version: payload[12],
            version: (payload[13], payload[14], payload[15]),
            capabilities: payload[16],
        };
        debug!(cid = %hex::encode(cid), ?info, "U2F HID channel allocated");
        Ok(U2fHidTransport {
            inner: Mutex::new(Inner { pipe, cid }),
            released: AtomicBool::new(false),
            info,
        })
    }

    /// The version/capability record the key returned during INIT.
    pub fn device_info(&self) -> U2fHidDeviceInfo {
        self.info
    }

    fn transaction(&self, cmd: u8, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(TransportError::Released);
        }
        let mut inner = self
            .inner
            .try_lock()
            .map_err(|_| TransportError::Busy)?;
        let cid = inner.cid;
        write_message(inner.pipe.as_mut(), cid, cmd, payload)?;
        loop {
            if self.released.load(Ordering::SeqCst) {
                return Err(TransportError::Released);
            }
            let (rsp_cmd, rsp) = read_message(inner.pipe.as_mut(), cid, COMMAND_TIMEOUT)?;
            if rsp_cmd != cmd {
                // A stale response from a previous transaction; drop it.
                trace!(cmd = rsp_cmd, "discarding unexpected transaction response");
                continue;
            }
            return Ok(rsp);
        }
    }
}

impl SecurityKeyTransport for U2fHidTransport {
    fn transceive(&self, cmd: &CommandApdu) -> Result<ResponseApdu, TransportError> {
        let wire = cmd.serialize()?;
        let rsp = self.transaction(CMD_MSG, &wire)?;
        ResponseApdu::parse(&rsp)
    }

    fn is_extended_length_supported(&self) -> bool {
        // MSG payloads carry up to 7609 bytes, enough for extended APDUs.
        true
    }

    fn ping(&self) -> bool {
        let nonce: [u8; 8] = rand::random();
        matches!(self.transaction(CMD_PING, &nonce), Ok(echo) if echo == nonce)
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn kind(&self) -> TransportKind {
        TransportKind::U2fHid
    }
}
