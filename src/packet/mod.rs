//! Byte-to-token state machine over one CPU's raw trace stream.
//!
//! Mirrors the teacher's `RawEventRecord`/`SliceLocation` approach of
//! decoding a byte buffer into typed records while tracking a small amount
//! of carried-over state (here: the last full address, for TIP
//! decompression) rather than allocating a record per byte.

mod workarounds;

use crate::error::Warning;

/// One decoded control-flow or timing packet, tagged with enough payload to
/// drive both the timestamp heuristics and the instruction replay engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packet {
    Tnt { bits: u64, count: u8 },
    Tip { addr: u64, compressed: bool },
    FupPge { addr: u64 },
    FupPgd { addr: u64 },
    FupBufferOverflow { addr: u64, compressed: bool },
    FupFar { addr: u64 },
    Sts { acbr: u8, ecbr: u8, tsc: u64 },
    Mtc { rng: u8, tsc8: u8 },
    Pip { cr0_pg: bool, cr3: u64 },
    Psb,
    Ccp { cntp: u64 },
    TraceStop,
}

impl Packet {
    pub fn is_timing(&self) -> bool {
        matches!(
            self,
            Packet::Sts { .. } | Packet::Mtc { .. } | Packet::FupBufferOverflow { .. }
        )
    }
}

/// A decoded packet plus the byte position it started at and the LIP value
/// in effect at that position (after any update the packet itself causes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub offset: u64,
    pub lip: u64,
    pub packet: Packet,
}

/// What `Parser::next` hands back: either a decoded token, or notice that a
/// range of bytes was discarded while resynchronizing to the next PSB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    Token(Token),
    Skip { start: u64, end: u64, warning: Warning },
}

/// Decodes one CPU's trace byte stream into a sequence of [`ParseEvent`]s.
///
/// `base_offset` is the absolute file offset of `data[0]`; all positions
/// handed out are absolute, so a `Parser` can be constructed over any
/// sub-slice of a trace file (the replay engine opens one at
/// `block.pos_start` pre-loaded with the block's `psb_pos` LIP).
pub struct Parser<'a> {
    data: &'a [u8],
    base_offset: u64,
    cursor: usize,
    lip: u64,
    last_psb_offset: u64,
    bytes_skipped_since_last_psb: u64,
    packet_mask: u8,
    workarounds: workarounds::Workarounds,
}

/// Bound above which an MTC tick jump is rejected outright (§4.1 failure
/// semantics); kept in sync with [`crate::timing::MAX_MTC_GAP`].
pub const MAX_MTC_JUMP: u16 = 150;

enum LipDecodeError {
    /// A genuine protocol violation (e.g. the reserved `cnt == 3`).
    Reserved,
    /// Ran out of bytes; per §4.1 this is not an error at end of input.
    Eof,
}

impl<'a> Parser<'a> {
    pub fn new(data: &'a [u8], base_offset: u64, initial_lip: u64) -> Self {
        Parser {
            data,
            base_offset,
            cursor: 0,
            lip: initial_lip,
            last_psb_offset: base_offset,
            bytes_skipped_since_last_psb: 0,
            packet_mask: 0,
            workarounds: workarounds::Workarounds::new(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.base_offset + self.cursor as u64
    }

    pub fn lip(&self) -> u64 {
        self.lip
    }

    /// `current_offset - last_PSB_offset - bytes_skipped_since_last_PSB`,
    /// the packet-count policy's running counter (§4.1 item 5).
    pub fn packet_count(&self) -> u64 {
        self.offset()
            .saturating_sub(self.last_psb_offset)
            .saturating_sub(self.bytes_skipped_since_last_psb)
    }

    pub fn set_packet_mask(&mut self, mask: u8) {
        self.packet_mask = mask;
    }

    /// Discard tokens until `offset` is reached (§4.1 item 4).
    pub fn skip_to_offset(&mut self, offset: u64) {
        let target = offset.saturating_sub(self.base_offset) as usize;
        self.cursor = target.min(self.data.len());
    }

    /// Discard tokens until the next STS/MTC/OVERFLOW/PGE (§4.1 item 4).
    pub fn skip_to_next_timing_packet(&mut self) -> Option<ParseEvent> {
        loop {
            match self.next()? {
                ev @ ParseEvent::Token(Token { packet, .. }) => {
                    if packet.is_timing() || matches!(packet, Packet::FupPge { .. }) {
                        return Some(ev);
                    }
                }
                skip => return Some(skip),
            }
        }
    }

    fn peek_byte(&self) -> Option<u8> {
        self.data.get(self.cursor).copied()
    }

    fn take_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.cursor + n > self.data.len() {
            return None;
        }
        let slice = &self.data[self.cursor..self.cursor + n];
        self.cursor += n;
        Some(slice)
    }

    fn le_addr(bytes: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        u64::from_le_bytes(buf)
    }

    fn sign_extend_48(addr: u64) -> u64 {
        let shifted = addr << 16;
        ((shifted as i64) >> 16) as u64
    }

    /// Decode a FUP/TIP-family address payload: `cnt` selects `2+2*cnt`
    /// little-endian bytes, `zext` decides whether the prior LIP's high
    /// bits are preserved or cleared before the overwrite.
    ///
    /// Distinguishes a reserved `cnt` value (a real protocol violation) from
    /// simply running out of bytes at the end of the slice, which per
    /// §4.1 is not an error.
    fn decode_lip_address(&mut self, cnt: u8, zext: bool) -> Result<(u64, bool), LipDecodeError> {
        if cnt == 3 {
            return Err(LipDecodeError::Reserved);
        }
        let nbytes = 2 + 2 * cnt as usize;
        let raw = self.take_bytes(nbytes).ok_or(LipDecodeError::Eof)?;
        let low_bits = nbytes * 8;
        let mask = if low_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << low_bits) - 1
        };
        let new_low = Self::le_addr(raw) & mask;
        let base = if zext { 0 } else { self.lip & !mask };
        let combined = base | new_low;
        self.lip = Self::sign_extend_48(combined);
        let compressed = nbytes < 6 && !zext;
        Ok((self.lip, compressed))
    }

    /// Decode one raw packet (no workaround policies applied) starting at
    /// the current cursor. Returns `None` at end of input (not an error).
    fn decode_raw(&mut self) -> Option<Result<(u64, Packet), Warning>> {
        let start = self.cursor;
        let lead = self.peek_byte()?;

        if lead == 0 {
            self.cursor += 1;
            return Some(Err(Warning::ReservedPacket));
        }

        // PSB: literal lead bytes 0x82 0x02, eight zero bytes, 16-byte total.
        if lead == 0x82 && self.data.get(self.cursor + 1) == Some(&0x02) {
            if self.cursor + 16 > self.data.len() {
                // Not enough bytes left to tell a genuine trailing PSB from a
                // broken one; per §4.1 truncation at end of input is not an
                // error, so stop cleanly instead of warning.
                self.cursor = start;
                return None;
            }
            let zeros_ok = self.data[self.cursor + 2..self.cursor + 10]
                .iter()
                .all(|&b| b == 0);
            let term_ok = self.data[self.cursor + 10] == 0xc0;
            if zeros_ok && term_ok {
                self.cursor += 16;
                return Some(Ok((start as u64, Packet::Psb)));
            }
            self.cursor = start;
            return Some(Err(Warning::BrokenPsb));
        }

        // Isolated 0xc0 lookalike, not part of a real PSB.
        if lead == 0xc0 {
            self.cursor += 1;
            return Some(Err(Warning::C0Lookalike));
        }

        if lead & 0x80 == 0 {
            // TNT short form: topmost set bit is the stop marker; the bits
            // below it, MSB-first, are the decision bits.
            self.cursor += 1;
            let topmost = 7 - lead.leading_zeros() as u8; // lead != 0, bit7 clear
            let count = topmost;
            if count > 47 {
                return Some(Err(Warning::ReservedPacket));
            }
            let mut bits = 0u64;
            for i in (0..count).rev() {
                let bit = (lead >> i) & 1;
                bits = (bits << 1) | bit as u64;
            }
            return Some(Ok((start as u64, Packet::Tnt { bits, count })));
        }

        if lead & 0xc0 == 0x80 {
            // FUP family.
            self.cursor += 1;
            let sub = (lead >> 3) & 0x7;
            let cnt = (lead >> 1) & 0x3;
            let zext = lead & 1 != 0;
            match sub {
                0 | 1 | 2 | 6 | 7 => match self.decode_lip_address(cnt, zext) {
                    Ok((addr, compressed)) => {
                        let packet = match sub {
                            0 => Packet::FupPge { addr },
                            1 => Packet::FupPgd { addr },
                            2 => Packet::FupBufferOverflow { addr, compressed },
                            6 => Packet::Tip { addr, compressed },
                            7 => Packet::FupFar { addr },
                            _ => unreachable!(),
                        };
                        Some(Ok((start as u64, packet)))
                    }
                    Err(LipDecodeError::Eof) => {
                        self.cursor = start;
                        None
                    }
                    Err(LipDecodeError::Reserved) => {
                        self.cursor = start;
                        Some(Err(Warning::TruncatedLip))
                    }
                },
                3 => {
                    // PCC: consumed for LIP/offset bookkeeping, not surfaced.
                    match self.decode_lip_address(cnt, zext) {
                        Ok(_) => self.decode_raw(),
                        Err(LipDecodeError::Eof) => {
                            self.cursor = start;
                            None
                        }
                        Err(LipDecodeError::Reserved) => {
                            self.cursor = start;
                            Some(Err(Warning::TruncatedLip))
                        }
                    }
                }
                _ => Some(Err(Warning::ReservedPacket)),
            }
        } else {
            // Extended family (bit7 and bit6 set): byte low 6 bits select kind.
            self.cursor += 1;
            let sub = lead & 0x3f;
            match sub {
                0x04 => {
                    let Some(payload) = self.take_bytes(7) else {
                        self.cursor = start;
                        return None;
                    };
                    let acbr = payload[0];
                    let ecbr = payload[1];
                    let tsc = Self::le_addr(&payload[2..7]) & 0xff_ffff_ffff;
                    Some(Ok((start as u64, Packet::Sts { acbr, ecbr, tsc })))
                }
                0x08 => {
                    let Some(payload) = self.take_bytes(2) else {
                        self.cursor = start;
                        return None;
                    };
                    let rng = payload[0] & 0x7;
                    let tsc8 = payload[1];
                    Some(Ok((start as u64, Packet::Mtc { rng, tsc8 })))
                }
                0x0c => {
                    let Some(payload) = self.take_bytes(8) else {
                        self.cursor = start;
                        return None;
                    };
                    let cr0_pg = payload[0] & 1 != 0;
                    let cr3 = Self::le_addr(&payload[1..8]);
                    Some(Ok((start as u64, Packet::Pip { cr0_pg, cr3 })))
                }
                0x10 => Some(Ok((start as u64, Packet::TraceStop))),
                0x14 => {
                    let Some(payload) = self.take_bytes(4) else {
                        self.cursor = start;
                        return None;
                    };
                    Some(Ok((start as u64, Packet::Ccp { cntp: Self::le_addr(payload) })))
                }
                _ => Some(Err(Warning::ReservedPacket)),
            }
        }
    }

    /// Scan forward to the next PSB, reporting everything in between as a
    /// skip. Used both for encoder-bug resync and after any reserved-byte
    /// error.
    fn resync(&mut self, from: u64) -> ParseEvent {
        let from_cursor = (from - self.base_offset) as usize;
        let mut i = from_cursor;
        while i + 10 < self.data.len() {
            if self.data[i] == 0xc0 && self.data[i + 1..i + 9].iter().all(|&b| b == 0) {
                self.cursor = i;
                break;
            }
            if self.data[i] == 0x82 && self.data.get(i + 1) == Some(&0x02) {
                self.cursor = i;
                break;
            }
            i += 1;
        }
        if i + 10 >= self.data.len() {
            self.cursor = self.data.len();
        }
        let end = self.offset();
        ParseEvent::Skip {
            start: from,
            end,
            warning: Warning::ReservedPacket,
        }
    }

    /// Advance and decode the next workaround-applied event.
    pub fn next(&mut self) -> Option<ParseEvent> {
        if let Some(buffered) = self.workarounds.take_pending() {
            return Some(buffered);
        }
        loop {
            let start = self.offset();
            match self.decode_raw()? {
                Ok((offset, packet)) => {
                    if let Packet::Psb = packet {
                        self.bytes_skipped_since_last_psb = 0;
                        self.last_psb_offset = offset;
                    }
                    if let Packet::Mtc { tsc8, .. } = packet {
                        if let Some(prev) = self.workarounds.last_mtc_tsc8 {
                            let gap = tsc8.wrapping_sub(prev);
                            if gap as u16 > MAX_MTC_JUMP && gap != 0 {
                                let mut ev = self.resync(offset);
                                if let ParseEvent::Skip { warning, .. } = &mut ev {
                                    *warning = Warning::HugeMtcGap;
                                }
                                return Some(ev);
                            }
                        }
                    }
                    let token = Token {
                        offset,
                        lip: self.lip,
                        packet,
                    };
                    if let Some(ev) = self.workarounds.on_token(token) {
                        return Some(ev);
                    }
                    continue;
                }
                Err(warning) => {
                    let mut ev = self.resync(start);
                    if let ParseEvent::Skip {
                        warning: w, end, ..
                    } = &mut ev
                    {
                        *w = warning;
                        self.bytes_skipped_since_last_psb += *end - start;
                    }
                    return Some(ev);
                }
            }
        }
    }
}

impl<'a> Iterator for Parser<'a> {
    type Item = ParseEvent;

    fn next(&mut self) -> Option<ParseEvent> {
        Parser::next(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tnt_short_form() {
        // 0x5E = 0101_1110, topmost set bit is bit 6: 6 decision bits below it.
        let data = [0x5Eu8];
        let mut p = Parser::new(&data, 0, 0);
        let ev = p.next().unwrap();
        match ev {
            ParseEvent::Token(Token {
                packet: Packet::Tnt { bits, count },
                offset,
                ..
            }) => {
                assert_eq!(offset, 0);
                assert_eq!(count, 6);
                assert_eq!(bits, 0b011110);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_fup_pge_uncompressed() {
        // sub=0 (PGE), cnt=2 (6 bytes), zext=1 -> lead = 1_000_0_11_1 = 0x87
        let lead = 0b1000_0111u8;
        let addr: u64 = 0xffff_ffff_8100_0000;
        let mut data = vec![lead];
        data.extend_from_slice(&addr.to_le_bytes()[..6]);
        let mut p = Parser::new(&data, 0x40, 0);
        let ev = p.next().unwrap();
        match ev {
            ParseEvent::Token(Token {
                packet: Packet::FupPge { addr: got },
                offset,
                lip,
            }) => {
                assert_eq!(offset, 0x40);
                assert_eq!(got, addr);
                assert_eq!(lip, addr);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn decodes_sts_and_mtc() {
        let mut data = vec![];
        data.push(0xc4u8); // extended, sub=0x04 -> STS
        data.push(0x11); // acbr
        data.push(0x22); // ecbr
        data.extend_from_slice(&0x40u64.to_le_bytes()[..5]); // tsc
        data.push(0xc8u8); // extended, sub=0x08 -> MTC
        data.push(0x03); // rng = 3
        data.push(0x42); // tsc8

        let mut p = Parser::new(&data, 0, 0);
        let first = p.next().unwrap();
        assert!(matches!(
            first,
            ParseEvent::Token(Token {
                packet: Packet::Sts { tsc: 0x40, .. },
                ..
            })
        ));
        let second = p.next().unwrap();
        assert!(matches!(
            second,
            ParseEvent::Token(Token {
                packet: Packet::Mtc {
                    rng: 3,
                    tsc8: 0x42
                },
                ..
            })
        ));
    }

    #[test]
    fn zero_byte_triggers_resync() {
        let mut data = vec![0u8, 0u8, 0u8];
        data.push(0x82);
        data.push(0x02);
        data.extend(std::iter::repeat(0u8).take(8));
        data.push(0xc0);
        data.push(0);
        let mut p = Parser::new(&data, 0, 0);
        let ev = p.next().unwrap();
        assert!(matches!(ev, ParseEvent::Skip { start: 0, .. }));
    }

    #[test]
    fn truncation_at_eof_is_not_an_error() {
        let data = [0x80u8]; // FUP family lead with no payload bytes following
        let mut p = Parser::new(&data, 0, 0);
        assert!(p.next().is_none());
    }
}
