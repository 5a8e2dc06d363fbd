//! ISO 7816-4 APDU command and response codecs, short and extended forms.

use crate::errors::TransportError;

/// The CLA bit marking a chained command segment.
pub const CLA_CHAINING: u8 = 0x10;

/// Largest expected-response value; `ne == NE_MAX` requests "as much as
/// the card can return".
pub const NE_MAX: usize = 65536;

/// An ISO 7816-4 command APDU.
///
/// `data` may carry up to 65535 bytes, `ne` up to 65536 (0 meaning "no
/// response body expected"). The serialised form is chosen per the
/// encoding rules: short when `data.len() <= 255 && ne <= 256`, extended
/// otherwise.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandApdu {
    /// Instruction class.
    pub cla: u8,
    /// Instruction code.
    pub ins: u8,
    /// Parameter 1.
    pub p1: u8,
    /// Parameter 2.
    pub p2: u8,
    /// Command data field.
    pub data: Vec<u8>,
    /// Expected response length (Ne), 0..=65536.
    pub ne: usize,
}

impl CommandApdu {
    /// Build a command APDU.
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: impl Into<Vec<u8>>, ne: usize) -> Self {
        CommandApdu {
            cla,
            ins,
            p1,
            p2,
            data: data.into(),
            ne,
        }
    }

    /// True if the short encoding can represent this command.
    pub fn is_short_encodable(&self) -> bool {
        self.data.len() <= 255 && self.ne <= 256
    }

    /// A copy with the chaining bit set in CLA.
    pub fn with_chaining(&self) -> Self {
        let mut cmd = self.clone();
        cmd.cla |= CLA_CHAINING;
        cmd
    }

    /// A copy with a different expected-response length.
    pub fn with_ne(&self, ne: usize) -> Self {
        let mut cmd = self.clone();
        cmd.ne = ne;
        cmd
    }

    /// Parse wire bytes back into a command, accepting both forms.
    ///
    /// A zero first length octet marks the extended form; a zero
    /// extended Lc is rejected as malformed.
    pub fn parse(bytes: &[u8]) -> Result<CommandApdu, TransportError> {
        if bytes.len() < 4 {
            return Err(TransportError::ApduMalformed("command shorter than a header"));
        }
        let (header, rest) = bytes.split_at(4);
        let (cla, ins, p1, p2) = (header[0], header[1], header[2], header[3]);
        let build = |data: &[u8], ne: usize| CommandApdu::new(cla, ins, p1, p2, data.to_vec(), ne);

        match rest {
            [] => Ok(build(&[], 0)),
            [le] => Ok(build(&[], le_short(*le))),
            [0x00, tail @ ..] if tail.len() >= 2 => {
                // Extended form.
                if tail.len() == 2 {
                    return Ok(build(&[], le_extended(tail[0], tail[1])));
                }
                let lc = usize::from(tail[0]) << 8 | usize::from(tail[1]);
                if lc == 0 {
                    return Err(TransportError::ApduMalformed("extended Lc of zero"));
                }
                let body = &tail[2..];
                if body.len() == lc {
                    Ok(build(body, 0))
                } else if body.len() == lc + 2 {
                    Ok(build(&body[..lc], le_extended(body[lc], body[lc + 1])))
                } else {
                    Err(TransportError::ApduMalformed("extended Lc disagrees with length"))
                }
            }
            [lc, body @ ..] => {
                let lc = usize::from(*lc);
                if body.len() == lc {
                    Ok(build(body, 0))
                } else if body.len() == lc + 1 {
                    Ok(build(&body[..lc], le_short(body[lc])))
                } else {
                    Err(TransportError::ApduMalformed("Lc disagrees with length"))
                }
            }
        }
    }

    /// Serialise to wire bytes, selecting the short or extended form.
    pub fn serialize(&self) -> Result<Vec<u8>, TransportError> {
        if self.data.len() > 65535 {
            return Err(TransportError::ApduMalformed("command data exceeds 65535 bytes"));
        }
        if self.ne > NE_MAX {
            return Err(TransportError::ApduMalformed("ne exceeds 65536"));
        }

        let mut out = Vec::with_capacity(9 + self.data.len());
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2]);

        if self.data.is_empty() && self.ne == 0 {
            // Case 1: header only.
            return Ok(out);
        }

        if self.is_short_encodable() {
            if !self.data.is_empty() {
                out.push(self.data.len() as u8);
                out.extend_from_slice(&self.data);
            }
            if self.ne > 0 {
                // 256 encodes as 0x00.
                out.push((self.ne % 256) as u8);
            }
        } else {
            // Extended form always opens with a zero octet.
            out.push(0x00);
            if !self.data.is_empty() {
                out.push((self.data.len() >> 8) as u8);
                out.push((self.data.len() & 0xFF) as u8);
                out.extend_from_slice(&self.data);
            }
            if self.ne > 0 {
                // 65536 encodes as 0x0000.
                let ne = self.ne % NE_MAX;
                out.push((ne >> 8) as u8);
                out.push((ne & 0xFF) as u8);
            }
        }
        Ok(out)
    }
}

fn le_short(b: u8) -> usize {
    match b {
        0 => 256,
        n => usize::from(n),
    }
}

fn le_extended(hi: u8, lo: u8) -> usize {
    match (hi, lo) {
        (0, 0) => NE_MAX,
        _ => usize::from(hi) << 8 | usize::from(lo),
    }
}

impl std::fmt::Debug for CommandApdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CommandApdu {{ {:02x} {:02x} {:02x} {:02x}, lc={}, ne={} }}",
            self.cla,
            self.ins,
            self.p1,
            self.p2,
            self.data.len(),
            self.ne
        )
    }
}

/// An ISO 7816-4 response APDU: body plus trailing status word.
#[derive(Clone, PartialEq, Eq)]
pub struct ResponseApdu {
    /// Response body.
    pub data: Vec<u8>,
    /// Status word, `sw1 << 8 | sw2`.
    pub sw: u16,
}

impl ResponseApdu {
    /// Build a response from body and status word.
    pub fn new(data: impl Into<Vec<u8>>, sw: u16) -> Self {
        ResponseApdu {
            data: data.into(),
            sw,
        }
    }

    /// Split raw wire bytes into body and status word.
    pub fn parse(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < 2 {
            return Err(TransportError::ApduMalformed("response shorter than a status word"));
        }
        let (body, sw) = bytes.split_at(bytes.len() - 2);
        Ok(ResponseApdu {
            data: body.to_vec(),
            sw: u16::from(sw[0]) << 8 | u16::from(sw[1]),
        })
    }

    /// First status byte.
    pub fn sw1(&self) -> u8 {
        (self.sw >> 8) as u8
    }

    /// Second status byte.
    pub fn sw2(&self) -> u8 {
        (self.sw & 0xFF) as u8
    }

    /// True on `0x9000`.
    pub fn is_success(&self) -> bool {
        self.sw == 0x9000
    }

    /// For `0x61xx`, the number of bytes still available via GET RESPONSE.
    pub fn bytes_remaining(&self) -> Option<usize> {
        if self.sw1() == 0x61 {
            Some(match self.sw2() {
                0 => 256,
                n => usize::from(n),
            })
        } else {
            None
        }
    }

    /// Serialise back to wire bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        out.push(self.sw1());
        out.push(self.sw2());
        out
    }
}

impl std::fmt::Debug for ResponseApdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResponseApdu {{ len={}, sw={:04x} }}", self.data.len(), self.sw)
    }
}
