//! Parses the sideband event log's on-disk line format into the typed
//! [`SidebandEvent`]s `SidebandModel::from_events` consumes. §6 leaves the
//! log's exact grammar to "an external collaborator"; this one mirrors the
//! collection file's tokenizer (quoted strings, tag-first lines) since both
//! are produced by the same kernel-agent tooling.

use std::io::BufRead;

use super::events::{HookEvent, MmapEvent, MunmapEvent, ScheduleEvent, SidebandEvent};
use crate::error::{ReconstructError, Result};

pub fn read<R: BufRead>(r: R) -> Result<Vec<SidebandEvent>> {
    let mut events = Vec::new();
    for (lineno, line) in r.lines().enumerate() {
        let line = line.map_err(|source| ReconstructError::Read {
            path: "<sideband>".into(),
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let line_no = lineno + 1;
        let tokens = tokenize(trimmed);
        let Some(tag) = tokens.first().map(String::as_str) else {
            continue;
        };
        events.push(parse_event(tag, &tokens, line_no)?);
    }
    Ok(events)
}

fn parse_event(tag: &str, t: &[String], line_no: usize) -> Result<SidebandEvent> {
    Ok(match tag {
        "init" => SidebandEvent::Init {
            cpu: dec(t, 1, line_no)? as u32,
            tsc: hex(t, 2, line_no)?,
            tid: dec(t, 3, line_no)? as u32,
            packet_mask: dec(t, 4, line_no)? as u8,
        },
        "process" => SidebandEvent::Process {
            tsc: hex(t, 1, line_no)?,
            pid: dec(t, 2, line_no)? as i32,
            parent_pid: t.get(3).filter(|s| s.as_str() != "-").map(|s| s.parse().unwrap_or(0)),
        },
        "mmap" => SidebandEvent::Mmap(MmapEvent {
            tsc: hex(t, 1, line_no)?,
            pid: dec(t, 2, line_no)? as i32,
            start: hex(t, 3, line_no)?,
            length: hex(t, 4, line_no)?,
            page_offset: hex(t, 5, line_no)?,
            path: str_field(t, 6, line_no)?,
        }),
        "munmap" => SidebandEvent::Munmap(MunmapEvent {
            tsc: hex(t, 1, line_no)?,
            pid: dec(t, 2, line_no)? as i32,
            start: hex(t, 3, line_no)?,
            length: hex(t, 4, line_no)?,
        }),
        "schedule" => SidebandEvent::Schedule(ScheduleEvent {
            tsc: hex(t, 1, line_no)?,
            cpu: dec(t, 2, line_no)? as u32,
            prev_tid: dec(t, 3, line_no)? as u32,
            new_tid: dec(t, 4, line_no)? as u32,
            packet_count_hint: dec(t, 5, line_no)? as u16,
            packet_mask: dec(t, 6, line_no)? as u8,
        }),
        "hook" => SidebandEvent::Hook(HookEvent {
            original_addr: hex(t, 1, line_no)?,
            copy_addr: opt_hex(t, 2),
            copy_len: hex(t, 3, line_no)?,
            wrapper_addr: opt_hex(t, 4),
            name: t.get(5).filter(|s| s.as_str() != "-").cloned(),
        }),
        "module" => SidebandEvent::Module {
            tsc: hex(t, 1, line_no)?,
            vm_section_tid: dec(t, 2, line_no)? as u32,
            start: hex(t, 3, line_no)?,
            end: hex(t, 4, line_no)?,
        },
        other => {
            return Err(ReconstructError::CollectionSyntax {
                line: line_no,
                message: format!("unrecognized sideband tag {other:?}"),
            })
        }
    })
}

fn field(t: &[String], idx: usize, line_no: usize) -> Result<String> {
    t.get(idx).cloned().ok_or_else(|| ReconstructError::CollectionSyntax {
        line: line_no,
        message: format!("missing field {idx}"),
    })
}

fn str_field(t: &[String], idx: usize, line_no: usize) -> Result<String> {
    field(t, idx, line_no)
}

fn dec(t: &[String], idx: usize, line_no: usize) -> Result<u64> {
    let s = field(t, idx, line_no)?;
    s.parse().map_err(|_| ReconstructError::CollectionSyntax {
        line: line_no,
        message: format!("expected decimal integer, got {s:?}"),
    })
}

fn hex(t: &[String], idx: usize, line_no: usize) -> Result<u64> {
    let s = field(t, idx, line_no)?;
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(&s);
    u64::from_str_radix(digits, 16).map_err(|_| ReconstructError::CollectionSyntax {
        line: line_no,
        message: format!("expected hex integer, got {s:?}"),
    })
}

fn opt_hex(t: &[String], idx: usize) -> Option<u64> {
    let s = t.get(idx)?;
    if s == "-" {
        return None;
    }
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}

fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut s = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                if c == '\\' {
                    continue;
                }
                s.push(c);
            }
            tokens.push(s);
        } else {
            let mut s = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                s.push(c);
                chars.next();
            }
            tokens.push(s);
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_schedule_and_mmap_lines() {
        let text = "init 0 0x100 1 0\nmmap 0x10 5 0x1000 0x2000 0x0 \"/bin/foo\"\nschedule 0x200 0 1 2 0x80 0\n";
        let events = read(std::io::Cursor::new(text)).unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], SidebandEvent::Init { .. }));
    }
}
