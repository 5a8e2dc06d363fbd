//! CCID (USB-IF smartcard reader class, rev 1.1) transceiver for a single
//! slot: bulk-endpoint framing of PC_to_RDR / RDR_to_PC messages, sequence
//! numbering, power management and parameter exchange.

pub mod t1;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace};

use crate::errors::TransportError;

const PC_TO_RDR_ICC_POWER_ON: u8 = 0x62;
const PC_TO_RDR_ICC_POWER_OFF: u8 = 0x63;
const PC_TO_RDR_XFR_BLOCK: u8 = 0x6F;
const PC_TO_RDR_GET_PARAMETERS: u8 = 0x6C;
const PC_TO_RDR_SET_PARAMETERS: u8 = 0x61;

const RDR_TO_PC_DATA_BLOCK: u8 = 0x80;
const RDR_TO_PC_SLOT_STATUS: u8 = 0x81;
const RDR_TO_PC_PARAMETERS: u8 = 0x82;

const HEADER_LEN: usize = 10;

/// Deadline for one bulk transfer.
pub const BULK_DEADLINE: Duration = Duration::from_secs(2);

/// `wLevelParameter` values for extended-APDU exchanges.
pub mod level {
    /// The block carries a complete APDU.
    pub const SINGLE: u16 = 0x00;
    /// First block of a multi-block APDU.
    pub const FIRST: u16 = 0x01;
    /// Last block of a multi-block APDU.
    pub const LAST: u16 = 0x02;
    /// Neither first nor last.
    pub const MIDDLE: u16 = 0x03;
    /// Empty block requesting the next part of the response.
    pub const CONTINUE: u16 = 0x10;
}

/// Collaborator interface over the reader's bulk endpoints. One transfer
/// per call; the transceiver owns message reassembly.
pub trait UsbBulkPipe: Send {
    /// Write one message to the bulk-out endpoint.
    fn bulk_out(&mut self, data: &[u8], deadline: Duration) -> Result<usize, TransportError>;
    /// Read one transfer from the bulk-in endpoint into `buf`.
    fn bulk_in(&mut self, buf: &mut [u8], deadline: Duration) -> Result<usize, TransportError>;
}

/// An RDR_to_PC_DataBlock payload.
#[derive(Debug)]
pub struct DataBlock {
    /// `bChainParameter`: response chaining state for extended-APDU level.
    pub chain_parameter: u8,
    /// The abData field.
    pub data: Vec<u8>,
}

/// Protocol parameters as returned by GetParameters.
#[derive(Debug)]
pub struct Parameters {
    /// `bProtocolNum` (0 = T=0, 1 = T=1).
    pub protocol: u8,
    /// The protocol data structure bytes.
    pub data: Vec<u8>,
}

/// What the ATR tells us about the card-side link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtrInfo {
    /// The card offers protocol T=1.
    pub t1_supported: bool,
    /// Card's maximum information field size (IFSC).
    pub ifsc: u8,
    /// T=1 EDC is CRC rather than the default LRC.
    pub crc_edc: bool,
}

impl AtrInfo {
    /// Parse the interface bytes of an Answer-To-Reset.
    pub fn parse(atr: &[u8]) -> Result<AtrInfo, TransportError> {
        if atr.len() < 2 {
            return Err(TransportError::CcidBadResponse("ATR truncated"));
        }
        let mut info = AtrInfo {
            t1_supported: false,
            ifsc: 32,
            crc_edc: false,
        };

        let mut y = atr[1] >> 4;
        let mut idx = 2usize;
        // Protocol selected by the TD byte introducing the current group;
        // the first group's TA/TB/TC are global parameters.
        let mut group_protocol = 0xFFu8;
        loop {
            let mut take = |present: bool| -> Result<Option<u8>, TransportError> {
                if !present {
                    return Ok(None);
                }
                let b = *atr
                    .get(idx)
                    .ok_or(TransportError::CcidBadResponse("ATR truncated"))?;
                idx += 1;
                Ok(Some(b))
            };
            let ta = take(y & 0x1 != 0)?;
            let _tb = take(y & 0x2 != 0)?;
            let tc = take(y & 0x4 != 0)?;
            let td = take(y & 0x8 != 0)?;

            if group_protocol == 1 {
                if let Some(ta) = ta {
                    info.ifsc = ta;
                }
                if let Some(tc) = tc {
                    info.crc_edc = tc & 0x1 != 0;
                }
            }

            match td {
                Some(td) => {
                    let proto = td & 0x0F;
                    if proto == 1 {
                        info.t1_supported = true;
                    }
                    group_protocol = proto;
                    y = td >> 4;
                }
                None => break,
            }
        }
        Ok(info)
    }
}

struct RawResponse {
    msg_type: u8,
    spec: [u8; 3],
    data: Vec<u8>,
}

/// CCID message transceiver over one bulk in/out endpoint pair, slot 0.
///
/// Every PC_to_RDR message carries a monotonically increasing 8-bit
/// sequence number which the reader must echo; a mismatch is fatal for
/// the exchange.
pub struct CcidTransceiver {
    pipe: Box<dyn UsbBulkPipe>,
    released: Arc<AtomicBool>,
    seq: u8,
    slot: u8,
}

impl CcidTransceiver {
    /// Wrap a bulk pipe. `released` is shared with the owning transport so
    /// an in-flight exchange fails at the next message boundary after a
    /// release.
    pub fn new(pipe: Box<dyn UsbBulkPipe>, released: Arc<AtomicBool>) -> Self {
        CcidTransceiver {
            pipe,
            released,
            seq: 0,
            slot: 0,
        }
    }

    /// Power the card on and return its ATR.
    pub fn icc_power_on(&mut self) -> Result<Vec<u8>, TransportError> {
        // bPowerSelect 0 = automatic voltage selection.
        let rsp = self.command(PC_TO_RDR_ICC_POWER_ON, [0, 0, 0], &[], BULK_DEADLINE)?;
        self.expect_type(&rsp, RDR_TO_PC_DATA_BLOCK)?;
        debug!(atr = %hex::encode(&rsp.data), "card powered on");
        Ok(rsp.data)
    }

    /// Power the card off.
    pub fn icc_power_off(&mut self) -> Result<(), TransportError> {
        let rsp = self.command(PC_TO_RDR_ICC_POWER_OFF, [0, 0, 0], &[], BULK_DEADLINE)?;
        self.expect_type(&rsp, RDR_TO_PC_SLOT_STATUS)?;
        Ok(())
    }

    /// Exchange one XfrBlock with the given level parameter.
    pub fn xfr_block(
        &mut self,
        data: &[u8],
        level: u16,
        deadline: Duration,
    ) -> Result<DataBlock, TransportError> {
        // bBWI 0, then the level parameter little-endian.
        let spec = [0, (level & 0xFF) as u8, (level >> 8) as u8];
        let rsp = self.command(PC_TO_RDR_XFR_BLOCK, spec, data, deadline)?;
        self.expect_type(&rsp, RDR_TO_PC_DATA_BLOCK)?;
        Ok(DataBlock {
            chain_parameter: rsp.spec[2],
            data: rsp.data,
        })
    }

    /// Exchange a complete APDU at the extended-APDU data-block level,
    /// splitting the command over `max_data`-sized blocks and re-issuing
    /// empty continuation blocks until the response is complete.
    pub fn xfr_block_chained(
        &mut self,
        apdu: &[u8],
        max_data: usize,
        deadline: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut block = if apdu.len() <= max_data {
            self.xfr_block(apdu, level::SINGLE, deadline)?
        } else {
            let mut chunks = apdu.chunks(max_data).peekable();
            let first = chunks.next().expect("non-empty by length check");
            let mut last = self.xfr_block(first, level::FIRST, deadline)?;
            while let Some(chunk) = chunks.next() {
                let lvl = if chunks.peek().is_some() {
                    level::MIDDLE
                } else {
                    level::LAST
                };
                last = self.xfr_block(chunk, lvl, deadline)?;
            }
            last
        };

        let mut out = block.data;
        while block.chain_parameter != level::SINGLE as u8
            && block.chain_parameter != level::LAST as u8
        {
            block = self.xfr_block(&[], level::CONTINUE, deadline)?;
            out.extend_from_slice(&block.data);
        }
        Ok(out)
    }

    /// Read the active protocol parameters.
    pub fn get_parameters(&mut self) -> Result<Parameters, TransportError> {
        let rsp = self.command(PC_TO_RDR_GET_PARAMETERS, [0, 0, 0], &[], BULK_DEADLINE)?;
        self.expect_type(&rsp, RDR_TO_PC_PARAMETERS)?;
        Ok(Parameters {
            protocol: rsp.spec[0],
            data: rsp.data,
        })
    }

    /// Program the T=1 protocol data structure: default Fi/Di, the EDC
    /// choice from the ATR, and the card's IFSC.
    pub fn set_parameters_t1(&mut self, ifsc: u8, crc: bool) -> Result<(), TransportError> {
        let pds = [
            0x11,                              // bmFindexDindex
            0x10 | u8::from(crc),              // bmTCCKST1
            0x00,                              // bGuardTimeT1
            0x45,                              // bmWaitingIntegersT1
            0x00,                              // bClockStop
            ifsc,                              // bIFSC
            0x00,                              // bNadValue
        ];
        let rsp = self.command(PC_TO_RDR_SET_PARAMETERS, [1, 0, 0], &pds, BULK_DEADLINE)?;
        self.expect_type(&rsp, RDR_TO_PC_PARAMETERS)?;
        Ok(())
    }

    fn expect_type(&self, rsp: &RawResponse, wanted: u8) -> Result<(), TransportError> {
        if rsp.msg_type != wanted {
            return Err(TransportError::CcidBadResponse("unexpected message type"));
        }
        Ok(())
    }

    fn command(
        &mut self,
        msg_type: u8,
        spec: [u8; 3],
        data: &[u8],
        deadline: Duration,
    ) -> Result<RawResponse, TransportError> {
        if self.released.load(Ordering::SeqCst) {
            return Err(TransportError::Released);
        }
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        let mut msg = Vec::with_capacity(HEADER_LEN + data.len());
        msg.push(msg_type);
        let mut len = [0u8; 4];
        LittleEndian::write_u32(&mut len, data.len() as u32);
        msg.extend_from_slice(&len);
        msg.push(self.slot);
        msg.push(seq);
        msg.extend_from_slice(&spec);
        msg.extend_from_slice(data);

        trace!(msg_type, seq, len = data.len(), "PC_to_RDR");
        self.pipe.bulk_out(&msg, deadline)?;

        loop {
            let rsp = self.read_message(deadline)?;
            if rsp.1 != seq {
                return Err(TransportError::CcidSeqMismatch {
                    got: rsp.1,
                    expected: seq,
                });
            }
            let raw = rsp.0;
            let status = raw.spec[0];
            match status >> 6 {
                0 => return Ok(raw),
                // Time extension requested; the reader sends the real
                // response in a follow-up message with the same sequence.
                2 => continue,
                _ => return Err(TransportError::CcidHwError { code: raw.spec[1] }),
            }
        }
    }

    /// Read one complete RDR_to_PC message, reassembling across bulk
    /// transfers as needed. Returns the message and its echoed sequence.
    fn read_message(&mut self, deadline: Duration) -> Result<(RawResponse, u8), TransportError> {
        let mut buf = Vec::with_capacity(HEADER_LEN + 256);
        let mut chunk = [0u8; 4096];
        loop {
            if self.released.load(Ordering::SeqCst) {
                return Err(TransportError::Released);
            }
            let n = match self.pipe.bulk_in(&mut chunk, deadline) {
                Ok(n) => n,
                Err(TransportError::Timeout(_)) => {
                    return Err(TransportError::Timeout(deadline))
                }
                Err(e) => return Err(e),
            };
            buf.extend_from_slice(&chunk[..n]);

            if buf.len() < HEADER_LEN {
                continue;
            }
            let want = LittleEndian::read_u32(&buf[1..5]) as usize;
            if buf.len() < HEADER_LEN + want {
                continue;
            }

            let msg_type = buf[0];
            if buf[5] != self.slot {
                return Err(TransportError::CcidBadResponse("response for wrong slot"));
            }
            let seq = buf[6];
            let spec = [buf[7], buf[8], buf[9]];
            let data = buf[HEADER_LEN..HEADER_LEN + want].to_vec();
            return Ok((RawResponse { msg_type, spec, data }, seq));
        }
    }
}
