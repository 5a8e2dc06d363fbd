//! ISO 7816-3 T=1 block protocol, carried as TPDUs through the CCID
//! transceiver: NAD/PCB/LEN/INF/EDC framing, IFS negotiation, chaining
//! with R-block acknowledgement, WTX handling and retransmission.

use std::time::Duration;

use tracing::{trace, warn};

use crate::ccid::{level, AtrInfo, CcidTransceiver};
use crate::errors::TransportError;

const NAD: u8 = 0x00;
const MAX_RETRANSMITS: u32 = 3;
const IFSD_MAX: u8 = 0xFE;

const S_RESYNCH: u8 = 0x00;
const S_IFS: u8 = 0x01;
const S_ABORT: u8 = 0x02;
const S_WTX: u8 = 0x03;

/// Deadline for one T=1 block exchange.
pub const BLOCK_DEADLINE: Duration = Duration::from_secs(5);

/// Error detection code flavour, selected by the ATR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edc {
    /// Single XOR byte (the T=1 default).
    Lrc,
    /// CRC-16 per ISO 13239.
    Crc,
}

impl Edc {
    fn len(self) -> usize {
        match self {
            Edc::Lrc => 1,
            Edc::Crc => 2,
        }
    }

    fn compute(self, bytes: &[u8]) -> [u8; 2] {
        match self {
            Edc::Lrc => [bytes.iter().fold(0, |acc, b| acc ^ b), 0],
            Edc::Crc => {
                let crc = crc16_x25(bytes);
                [(crc >> 8) as u8, (crc & 0xFF) as u8]
            }
        }
    }
}

fn crc16_x25(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for b in bytes {
        crc ^= u16::from(*b);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// A parsed T=1 block.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Block {
    I { n: u8, more: bool, inf: Vec<u8> },
    R { n: u8, err: u8 },
    S { response: bool, ty: u8, inf: Vec<u8> },
}

fn build(pcb: u8, inf: &[u8], edc: Edc) -> Vec<u8> {
    debug_assert!(inf.len() <= 254);
    let mut block = Vec::with_capacity(5 + inf.len());
    block.push(NAD);
    block.push(pcb);
    block.push(inf.len() as u8);
    block.extend_from_slice(inf);
    let check = edc.compute(&block);
    block.extend_from_slice(&check[..edc.len()]);
    block
}

fn encode_i(n: u8, more: bool, inf: &[u8], edc: Edc) -> Vec<u8> {
    build((n & 1) << 6 | u8::from(more) << 5, inf, edc)
}

fn encode_r(n: u8, err: u8, edc: Edc) -> Vec<u8> {
    build(0x80 | (n & 1) << 4 | (err & 0x3), &[], edc)
}

fn encode_s(response: bool, ty: u8, inf: &[u8], edc: Edc) -> Vec<u8> {
    build(0xC0 | u8::from(response) << 5 | (ty & 0x1F), inf, edc)
}

fn parse(bytes: &[u8], edc: Edc) -> Result<Block, TransportError> {
    if bytes.len() < 3 + edc.len() {
        return Err(TransportError::T1Framing("block shorter than prologue plus EDC"));
    }
    let len = usize::from(bytes[2]);
    if bytes.len() != 3 + len + edc.len() {
        return Err(TransportError::T1Framing("LEN disagrees with block size"));
    }
    let (body, check) = bytes.split_at(3 + len);
    if check != &edc.compute(body)[..edc.len()] {
        return Err(TransportError::T1BadEdc);
    }
    if bytes[0] != NAD {
        return Err(TransportError::T1Framing("unexpected NAD"));
    }

    let pcb = bytes[1];
    let inf = body[3..].to_vec();
    if pcb & 0x80 == 0 {
        Ok(Block::I {
            n: (pcb >> 6) & 1,
            more: pcb & 0x20 != 0,
            inf,
        })
    } else if pcb & 0x40 == 0 {
        Ok(Block::R {
            n: (pcb >> 4) & 1,
            err: pcb & 0x3,
        })
    } else {
        Ok(Block::S {
            response: pcb & 0x20 != 0,
            ty: pcb & 0x1F,
            inf,
        })
    }
}

/// Host side of the T=1 state machine over a CCID transceiver.
///
/// Send sequence numbers alternate independently per side; a
/// retransmitted block keeps its number, a fresh one toggles it.
pub struct T1Protocol {
    xcvr: CcidTransceiver,
    edc: Edc,
    /// Largest INF the card accepts from us.
    ifsc: usize,
    /// Our next send-sequence bit.
    ns: u8,
    /// Next expected card send-sequence bit.
    nr: u8,
}

impl T1Protocol {
    /// Set up over a powered-on card. `atr` selects the EDC flavour and
    /// the initial IFSC.
    pub fn new(xcvr: CcidTransceiver, atr: &AtrInfo) -> Self {
        T1Protocol {
            xcvr,
            edc: if atr.crc_edc { Edc::Crc } else { Edc::Lrc },
            ifsc: usize::from(atr.ifsc.max(1)),
            ns: 0,
            nr: 0,
        }
    }

    /// Announce the largest block the host can receive (IFSD 254).
    pub fn negotiate_ifsd(&mut self) -> Result<(), TransportError> {
        let req = encode_s(false, S_IFS, &[IFSD_MAX], self.edc);
        match self.exchange_with_retry(&req)? {
            Block::S {
                response: true,
                ty: S_IFS,
                ..
            } => Ok(()),
            _ => Err(TransportError::T1Protocol("expected IFS response")),
        }
    }

    /// Give back the underlying transceiver (for power-off on release).
    pub fn transceiver_mut(&mut self) -> &mut CcidTransceiver {
        &mut self.xcvr
    }

    /// Carry one APDU: chain it over I-blocks at the current IFSC and
    /// reassemble the card's chained response.
    pub fn transmit(&mut self, apdu: &[u8]) -> Result<Vec<u8>, TransportError> {
        let chunks: Vec<&[u8]> = if apdu.is_empty() {
            vec![&[][..]]
        } else {
            apdu.chunks(self.ifsc).collect()
        };
        let total = chunks.len();

        let mut rsp = Vec::new();
        let mut more_rsp = false;

        for (idx, chunk) in chunks.iter().enumerate() {
            let sending_more = idx + 1 < total;
            let block = encode_i(self.ns, sending_more, chunk, self.edc);
            trace!(n = self.ns, more = sending_more, len = chunk.len(), "T=1 I-block out");
            let reply = self.exchange_with_retry(&block)?;

            if sending_more {
                match reply {
                    // R-block carrying the next expected sequence acks
                    // this chunk.
                    Block::R { n, .. } if n != self.ns => self.ns ^= 1,
                    Block::R { .. } => {
                        return Err(TransportError::T1Protocol("card re-requested acked block"))
                    }
                    _ => {
                        return Err(TransportError::T1Protocol(
                            "expected R-block ack while chaining",
                        ))
                    }
                }
            } else {
                match reply {
                    Block::I { n, more, inf } => {
                        if n != self.nr {
                            return Err(TransportError::T1Protocol("response sequence error"));
                        }
                        self.nr ^= 1;
                        self.ns ^= 1;
                        rsp.extend_from_slice(&inf);
                        more_rsp = more;
                    }
                    _ => {
                        return Err(TransportError::T1Protocol(
                            "expected I-block response to final chunk",
                        ))
                    }
                }
            }
        }

        while more_rsp {
            let ack = encode_r(self.nr, 0, self.edc);
            match self.exchange_with_retry(&ack)? {
                Block::I { n, more, inf } => {
                    if n != self.nr {
                        return Err(TransportError::T1Protocol("response sequence error"));
                    }
                    self.nr ^= 1;
                    rsp.extend_from_slice(&inf);
                    more_rsp = more;
                }
                _ => {
                    return Err(TransportError::T1Protocol(
                        "expected chained I-block continuation",
                    ))
                }
            }
        }
        Ok(rsp)
    }

    /// Exchange one block, transparently answering WTX and IFS requests
    /// and retransmitting on bad EDC, framing noise or timeout. Returns
    /// the first block that belongs to the caller's state machine.
    fn exchange_with_retry(&mut self, block: &[u8]) -> Result<Block, TransportError> {
        let mut attempts = 0u32;
        let mut tx = block.to_vec();
        loop {
            let raw = match self.xcvr.xfr_block(&tx, level::SINGLE, BLOCK_DEADLINE) {
                Ok(db) => db.data,
                Err(TransportError::Timeout(d)) => {
                    attempts += 1;
                    if attempts > MAX_RETRANSMITS {
                        warn!(deadline = ?d, "T=1 block timed out past retry budget");
                        return Err(TransportError::T1RetransmitExhausted);
                    }
                    tx = block.to_vec();
                    continue;
                }
                Err(e) => return Err(e),
            };

            match parse(&raw, self.edc) {
                Err(TransportError::T1BadEdc) | Err(TransportError::T1Framing(_)) => {
                    attempts += 1;
                    if attempts > MAX_RETRANSMITS {
                        return Err(TransportError::T1RetransmitExhausted);
                    }
                    tx = block.to_vec();
                }
                Err(e) => return Err(e),
                Ok(Block::S {
                    response: false,
                    ty: S_WTX,
                    inf,
                }) => {
                    // Grant the waiting-time extension verbatim.
                    tx = encode_s(true, S_WTX, &inf, self.edc);
                }
                Ok(Block::S {
                    response: false,
                    ty: S_IFS,
                    inf,
                }) => {
                    if let [ifs] = inf[..] {
                        self.ifsc = usize::from(ifs.max(1));
                    }
                    tx = encode_s(true, S_IFS, &inf, self.edc);
                }
                Ok(Block::S {
                    response: false,
                    ty: S_ABORT,
                    ..
                }) => return Err(TransportError::T1Protocol("card aborted the chain")),
                Ok(Block::S {
                    response: false,
                    ty: S_RESYNCH,
                    ..
                }) => return Err(TransportError::T1Protocol("unexpected RESYNCH request")),
                // R-block naming our current sequence asks for a
                // retransmission of the block in flight.
                Ok(Block::R { n, .. }) if n == self.ns && block[1] & 0x80 == 0 => {
                    attempts += 1;
                    if attempts > MAX_RETRANSMITS {
                        return Err(TransportError::T1RetransmitExhausted);
                    }
                    tx = block.to_vec();
                }
                Ok(other) => return Ok(other),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ccid::test::{data_block, ScriptedPipe};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn atr() -> AtrInfo {
        AtrInfo {
            t1_supported: true,
            ifsc: 32,
            crc_edc: false,
        }
    }

    fn protocol(card_blocks: Vec<Vec<u8>>) -> (T1Protocol, Arc<std::sync::Mutex<Vec<Vec<u8>>>>) {
        let responses = card_blocks
            .into_iter()
            .enumerate()
            .map(|(seq, b)| data_block(seq as u8, 0, &b))
            .collect();
        let pipe = ScriptedPipe::new(responses);
        let written = Arc::clone(&pipe.written);
        let xcvr = CcidTransceiver::new(Box::new(pipe), Arc::new(AtomicBool::new(false)));
        (T1Protocol::new(xcvr, &atr()), written)
    }

    #[test]
    fn lrc_is_xor() {
        let block = encode_i(0, false, &[0x00, 0xA4, 0x04, 0x00], Edc::Lrc);
        let lrc = block[..block.len() - 1].iter().fold(0u8, |a, b| a ^ b);
        assert_eq!(*block.last().unwrap(), lrc);
    }

    #[test]
    fn crc_blocks_roundtrip() {
        let block = encode_i(1, true, b"hello", Edc::Crc);
        match parse(&block, Edc::Crc).unwrap() {
            Block::I { n, more, inf } => {
                assert_eq!(n, 1);
                assert!(more);
                assert_eq!(inf, b"hello");
            }
            other => panic!("parsed {other:?}"),
        }
    }

    #[test]
    fn single_exchange() {
        let card = encode_i(0, false, &[0x90, 0x00], Edc::Lrc);
        let (mut t1, _) = protocol(vec![card]);
        let rsp = t1.transmit(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
        assert_eq!(rsp, vec![0x90, 0x00]);
        // Sequences advanced on both sides.
        assert_eq!(t1.ns, 1);
        assert_eq!(t1.nr, 1);
    }

    #[test]
    fn chained_send_toggles_and_acks() {
        // 100-byte payload at IFSC 32: four I-blocks, three R acks then a
        // response I-block.
        let card = vec![
            encode_r(1, 0, Edc::Lrc),
            encode_r(0, 0, Edc::Lrc),
            encode_r(1, 0, Edc::Lrc),
            encode_i(0, false, &[0x90, 0x00], Edc::Lrc),
        ];
        let (mut t1, written) = protocol(card);
        let payload = vec![0xAB; 100];
        let rsp = t1.transmit(&payload).unwrap();
        assert_eq!(rsp, vec![0x90, 0x00]);

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 4);
        let pcbs: Vec<u8> = written.iter().map(|m| m[11]).collect();
        // N alternates 0,1,0,1; more-bit set on all but the last.
        assert_eq!(pcbs, vec![0x20, 0x60, 0x20, 0x40]);
        // Reassembling the INF fields reproduces the payload.
        let sent: Vec<u8> = written
            .iter()
            .flat_map(|m| m[13..m.len() - 1].to_vec())
            .collect();
        assert_eq!(sent, payload);
    }

    #[test]
    fn key_import_sized_chain() {
        // A 512-byte payload at IFSC 32: sixteen I-blocks, each acked
        // with an R-block except the last, which gets the response.
        let mut card: Vec<Vec<u8>> = (0..15)
            .map(|i| encode_r((i + 1) % 2, 0, Edc::Lrc))
            .collect();
        card.push(encode_i(0, false, &[0x90, 0x00], Edc::Lrc));
        let (mut t1, written) = protocol(card);

        let payload = vec![0xC3; 512];
        let rsp = t1.transmit(&payload).unwrap();
        assert_eq!(rsp, vec![0x90, 0x00]);

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 16);
        for (i, msg) in written.iter().enumerate() {
            let pcb = msg[11];
            assert_eq!((pcb >> 6) & 1, (i % 2) as u8, "N toggles each block");
            assert_eq!(pcb & 0x20 != 0, i < 15, "more-bit on all but the last");
            assert_eq!(msg[12], 32, "LEN equals IFSC");
        }
    }

    #[test]
    fn chained_receive_reassembles() {
        let card = vec![
            encode_i(0, true, b"AAAA", Edc::Lrc),
            encode_i(1, false, &[0x42, 0x90, 0x00], Edc::Lrc),
        ];
        let (mut t1, written) = protocol(card);
        let rsp = t1.transmit(&[0x00, 0xCA, 0x00, 0x6E, 0x00]).unwrap();
        assert_eq!(rsp, b"AAAA\x42\x90\x00");

        // Second outgoing block is R(1) acking the first response part.
        let written = written.lock().unwrap();
        assert_eq!(written[1][11], 0x90);
    }

    #[test]
    fn wtx_request_granted() {
        let card = vec![
            encode_s(false, S_WTX, &[0x05], Edc::Lrc),
            encode_i(0, false, &[0x90, 0x00], Edc::Lrc),
        ];
        let (mut t1, written) = protocol(card);
        let rsp = t1.transmit(&[0x00, 0x47, 0x80, 0x00]).unwrap();
        assert_eq!(rsp, vec![0x90, 0x00]);

        let written = written.lock().unwrap();
        // S(WTX response) echoes the multiplier.
        assert_eq!(written[1][11], 0xE3);
        assert_eq!(written[1][13], 0x05);
    }

    #[test]
    fn ifs_request_updates_ifsc() {
        let card = vec![
            encode_s(false, S_IFS, &[0x10], Edc::Lrc),
            encode_i(0, false, &[0x90, 0x00], Edc::Lrc),
        ];
        let (mut t1, _) = protocol(card);
        t1.transmit(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
        assert_eq!(t1.ifsc, 0x10);
    }

    #[test]
    fn bad_edc_retransmits_with_same_n() {
        let mut broken = encode_i(0, false, &[0x90, 0x00], Edc::Lrc);
        let last = broken.len() - 1;
        broken[last] ^= 0xFF;
        let card = vec![broken, encode_i(0, false, &[0x90, 0x00], Edc::Lrc)];
        let (mut t1, written) = protocol(card);
        let rsp = t1.transmit(&[0x00, 0xA4, 0x04, 0x00]).unwrap();
        assert_eq!(rsp, vec![0x90, 0x00]);

        let written = written.lock().unwrap();
        assert_eq!(written.len(), 2);
        // Retransmission preserves the PCB (same N).
        assert_eq!(written[0][11], written[1][11]);
    }

    #[test]
    fn retransmit_budget_exhausts() {
        let mut broken = encode_i(0, false, &[0x90, 0x00], Edc::Lrc);
        let last = broken.len() - 1;
        broken[last] ^= 0xFF;
        let card = vec![broken.clone(), broken.clone(), broken.clone(), broken];
        let (mut t1, _) = protocol(card);
        assert!(matches!(
            t1.transmit(&[0x00, 0xA4, 0x04, 0x00]),
            Err(TransportError::T1RetransmitExhausted)
        ));
    }

    #[test]
    fn ifsd_negotiation() {
        let card = vec![encode_s(true, S_IFS, &[IFSD_MAX], Edc::Lrc)];
        let (mut t1, written) = protocol(card);
        t1.negotiate_ifsd().unwrap();
        let written = written.lock().unwrap();
        assert_eq!(written[0][11], 0xC1);
        assert_eq!(written[0][13], 0xFE);
    }
}
