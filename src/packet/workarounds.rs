//! Encoder-bug workaround policies, composed as small stateful steps over
//! the raw token stream (§4.1 "Workarounds layered as policies").
//!
//! Each policy is applied in [`Workarounds::on_token`], in the order the
//! spec lists them: postpone-early-MTC, then synthesize-dropped-MTCs, then
//! skip-after-overflow-with-compressed-LIP. Held-back tokens and synthetic
//! insertions are queued in `pending` and drained by [`Parser::next`]
//! before any new byte is decoded, so ordering is preserved across calls.

use std::collections::VecDeque;

use super::{MAX_MTC_JUMP, Packet, ParseEvent, Token};
use crate::error::Warning;

pub(super) struct Workarounds {
    pending: VecDeque<ParseEvent>,
    /// An MTC decoded but not yet released, held for one token's worth of
    /// lookahead to see whether postpone-early-MTC applies.
    held_mtc: Option<Token>,
    /// Set once a compressed-LIP buffer overflow is seen; cleared on the
    /// next non-compressed FUP or PSB.
    suppressed: bool,
    pub(super) last_mtc_tsc8: Option<u8>,
    last_mtc_rng: Option<u8>,
}

impl Workarounds {
    pub(super) fn new() -> Self {
        Workarounds {
            pending: VecDeque::new(),
            held_mtc: None,
            suppressed: false,
            last_mtc_tsc8: None,
            last_mtc_rng: None,
        }
    }

    pub(super) fn take_pending(&mut self) -> Option<ParseEvent> {
        self.pending.pop_front()
    }

    pub(super) fn on_token(&mut self, token: Token) -> Option<ParseEvent> {
        match token.packet {
            Packet::Tnt { .. } if self.suppressed => None,
            Packet::Tip { compressed: true, .. } if self.suppressed => None,
            Packet::Mtc { rng, tsc8 } => {
                self.last_mtc_rng = Some(rng);
                self.last_mtc_tsc8 = Some(tsc8);
                self.handle_mtc(token, rng, tsc8)
            }
            Packet::Sts { tsc, .. } => self.handle_sts(token, tsc),
            Packet::Psb => {
                self.suppressed = false;
                self.flush_and_then(ParseEvent::Token(token))
            }
            Packet::FupBufferOverflow { compressed, .. } => {
                let offset = token.offset;
                let ev = self.flush_and_then(ParseEvent::Token(token));
                if compressed {
                    self.suppressed = true;
                    self.pending.push_back(ParseEvent::Skip {
                        start: offset,
                        end: offset,
                        warning: Warning::OverflowCompressed,
                    });
                }
                ev
            }
            Packet::Tip { compressed: false, .. }
            | Packet::FupPge { .. }
            | Packet::FupPgd { .. }
            | Packet::FupFar { .. } => {
                self.suppressed = false;
                self.flush_and_then(ParseEvent::Token(token))
            }
            _ => self.flush_and_then(ParseEvent::Token(token)),
        }
    }

    fn handle_mtc(&mut self, token: Token, rng: u8, tsc8: u8) -> Option<ParseEvent> {
        let prev = self.held_mtc.take();
        let Some(prev_token) = prev else {
            self.held_mtc = Some(token);
            return None;
        };
        if let Packet::Mtc {
            rng: prev_rng,
            tsc8: prev_tsc8,
        } = prev_token.packet
        {
            if prev_rng == rng {
                let gap = tsc8.wrapping_sub(prev_tsc8);
                if gap > 1 && (gap as u16) <= MAX_MTC_JUMP {
                    for step in 1..gap {
                        let synth_tsc8 = prev_tsc8.wrapping_add(step);
                        self.pending.push_back(ParseEvent::Token(Token {
                            offset: token.offset,
                            lip: token.lip,
                            packet: Packet::Mtc {
                                rng,
                                tsc8: synth_tsc8,
                            },
                        }));
                    }
                }
            }
        }
        self.held_mtc = Some(token);
        Some(ParseEvent::Token(prev_token))
    }

    fn handle_sts(&mut self, token: Token, tsc: u64) -> Option<ParseEvent> {
        let Some(prev) = self.held_mtc.take() else {
            return Some(ParseEvent::Token(token));
        };
        if let Packet::Mtc { rng, tsc8 } = prev.packet {
            let shift = 7 + 2 * rng;
            let implied = ((tsc >> shift) & 0xff) as u8;
            if implied == tsc8.wrapping_add(1) {
                self.pending.push_back(ParseEvent::Token(prev));
                return Some(ParseEvent::Token(token));
            }
        }
        self.pending.push_back(ParseEvent::Token(token));
        Some(ParseEvent::Token(prev))
    }

    fn flush_and_then(&mut self, ev: ParseEvent) -> Option<ParseEvent> {
        match self.held_mtc.take() {
            Some(prev) => {
                self.pending.push_back(ev);
                Some(ParseEvent::Token(prev))
            }
            None => Some(ev),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mtc(offset: u64, rng: u8, tsc8: u8) -> Token {
        Token {
            offset,
            lip: 0,
            packet: Packet::Mtc { rng, tsc8 },
        }
    }

    #[test]
    fn postpones_mtc_that_precedes_matching_sts() {
        let mut w = Workarounds::new();
        assert!(w.on_token(mtc(0, 3, 0x10)).is_none());
        let sts_tsc = 0x11u64 << (7 + 2 * 3); // implied mtc = 0x11 = prev + 1
        let sts = Token {
            offset: 8,
            lip: 0,
            packet: Packet::Sts {
                acbr: 0,
                ecbr: 0,
                tsc: sts_tsc,
            },
        };
        let first = w.on_token(sts).unwrap();
        assert!(matches!(
            first,
            ParseEvent::Token(Token {
                packet: Packet::Sts { .. },
                ..
            })
        ));
        let second = w.take_pending().unwrap();
        assert!(matches!(
            second,
            ParseEvent::Token(Token {
                packet: Packet::Mtc { tsc8: 0x10, .. },
                ..
            })
        ));
    }

    #[test]
    fn synthesizes_missing_mtc_ticks() {
        let mut w = Workarounds::new();
        assert!(w.on_token(mtc(0, 1, 10)).is_none());
        let first = w.on_token(mtc(8, 1, 14)).unwrap();
        assert!(matches!(
            first,
            ParseEvent::Token(Token {
                packet: Packet::Mtc { tsc8: 10, .. },
                ..
            })
        ));
        let synth: Vec<u8> = std::iter::from_fn(|| w.take_pending())
            .map(|ev| match ev {
                ParseEvent::Token(Token {
                    packet: Packet::Mtc { tsc8, .. },
                    ..
                }) => tsc8,
                _ => panic!("expected synthetic mtc"),
            })
            .collect();
        assert_eq!(synth, vec![11, 12, 13]);
    }
}
