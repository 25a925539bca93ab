//! Textual collection-file format: one header section followed by one
//! `task` per line, each owning indented `block`/`enter`/`leave`/`bad`
//! records, terminated by `eof` (§6 "Collection file (textual)").

use std::io::{self, BufRead, Write};

use crate::error::{ReconstructError, Result};

use super::{Block, Collection, VmFuncDecl, VmSectionDecl};

pub fn write<W: Write>(collection: &Collection, mut w: W) -> io::Result<()> {
    for path in &collection.traces {
        writeln!(w, "trace {}", quote(path))?;
    }
    if let Some(path) = &collection.sideband {
        writeln!(w, "sideband {}", quote(path))?;
    }
    for v in &collection.vm_sections {
        writeln!(
            w,
            "vm_section {:#x} {:#x} {:#x} {} {}",
            v.start,
            v.size,
            v.offset,
            v.tid,
            quote(&v.path)
        )?;
    }
    for f in &collection.vm_funcs {
        writeln!(w, "vm_x86_64_func {:#x} {:#x} {}", f.start, f.end, quote(&f.module))?;
    }

    for tid in collection.sorted_tids() {
        let task = &collection.tasks[&tid];
        writeln!(w, "task {} {}", tid, quote(task.name.as_deref().unwrap_or("")))?;
        for block in &task.blocks {
            match *block {
                Block::Trace {
                    cpu,
                    tsc_start,
                    tsc_end,
                    pos_start,
                    lip_start,
                    pos_end,
                    lip_end,
                } => writeln!(
                    w,
                    "\tblock {} {:#x} {:#x} {:#x} {:#x} {:#x} {:#x}",
                    cpu, tsc_start, tsc_end, pos_start, lip_start, pos_end, lip_end
                )?,
                Block::Enter { cpu, tsc } => writeln!(w, "\tenter {} {:#x}", cpu, tsc)?,
                Block::Leave { cpu, tsc } => writeln!(w, "\tleave {} {:#x}", cpu, tsc)?,
                Block::Bad { cpu, tsc_start, tsc_end } => {
                    writeln!(w, "\tbad {} {:#x} {:#x}", cpu, tsc_start, tsc_end)?
                }
            }
        }
    }
    writeln!(w, "eof")?;
    Ok(())
}

pub fn read<R: BufRead>(r: R) -> Result<Collection> {
    let mut collection = Collection::default();
    let mut current_tid: Option<u32> = None;

    for (lineno, line) in r.lines().enumerate() {
        let line = line.map_err(|source| ReconstructError::Read {
            path: "<collection>".into(),
            source,
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let indented = line.starts_with(' ') || line.starts_with('\t');
        let tokens = tokenize(trimmed);
        let Some(tag) = tokens.first() else { continue };

        let line_no = lineno + 1;
        match tag.as_str() {
            "eof" => break,
            "trace" => collection.traces.push(expect_str(&tokens, 1, line_no)?),
            "sideband" => collection.sideband = Some(expect_str(&tokens, 1, line_no)?),
            "vm_section" => collection.vm_sections.push(VmSectionDecl {
                start: expect_hex(&tokens, 1, line_no)?,
                size: expect_hex(&tokens, 2, line_no)?,
                offset: expect_hex(&tokens, 3, line_no)?,
                tid: expect_dec(&tokens, 4, line_no)? as u32,
                path: expect_str(&tokens, 5, line_no)?,
            }),
            "vm_x86_64_func" => collection.vm_funcs.push(VmFuncDecl {
                start: expect_hex(&tokens, 1, line_no)?,
                end: expect_hex(&tokens, 2, line_no)?,
                module: expect_str(&tokens, 3, line_no)?,
            }),
            "task" if !indented => {
                let tid = expect_dec(&tokens, 1, line_no)? as u32;
                let name = expect_str(&tokens, 2, line_no)?;
                collection.task_mut(tid).name = (!name.is_empty()).then_some(name);
                current_tid = Some(tid);
            }
            "block" | "enter" | "leave" | "bad" if indented => {
                let tid = current_tid.ok_or_else(|| ReconstructError::CollectionSyntax {
                    line: line_no,
                    message: "block record outside of a task section".to_string(),
                })?;
                let block = parse_block(tag, &tokens, line_no)?;
                collection.task_mut(tid).blocks.push(block);
            }
            other => {
                return Err(ReconstructError::CollectionSyntax {
                    line: line_no,
                    message: format!("unrecognized tag {other:?}"),
                });
            }
        }
    }
    Ok(collection)
}

fn parse_block(tag: &str, tokens: &[String], line_no: usize) -> Result<Block> {
    let cpu = expect_dec(tokens, 1, line_no)? as u32;
    Ok(match tag {
        "block" => Block::Trace {
            cpu,
            tsc_start: expect_hex(tokens, 2, line_no)?,
            tsc_end: expect_hex(tokens, 3, line_no)?,
            pos_start: expect_hex(tokens, 4, line_no)?,
            lip_start: expect_hex(tokens, 5, line_no)?,
            pos_end: expect_hex(tokens, 6, line_no)?,
            lip_end: expect_hex(tokens, 7, line_no)?,
        },
        "enter" => Block::Enter {
            cpu,
            tsc: expect_hex(tokens, 2, line_no)?,
        },
        "leave" => Block::Leave {
            cpu,
            tsc: expect_hex(tokens, 2, line_no)?,
        },
        "bad" => Block::Bad {
            cpu,
            tsc_start: expect_hex(tokens, 2, line_no)?,
            tsc_end: expect_hex(tokens, 3, line_no)?,
        },
        _ => unreachable!(),
    })
}

fn expect_str(tokens: &[String], idx: usize, line_no: usize) -> Result<String> {
    tokens
        .get(idx)
        .cloned()
        .ok_or_else(|| ReconstructError::CollectionSyntax {
            line: line_no,
            message: format!("missing field {idx}"),
        })
}

fn expect_dec(tokens: &[String], idx: usize, line_no: usize) -> Result<u64> {
    let s = expect_str(tokens, idx, line_no)?;
    s.parse::<u64>().map_err(|_| ReconstructError::CollectionSyntax {
        line: line_no,
        message: format!("expected decimal integer, got {s:?}"),
    })
}

fn expect_hex(tokens: &[String], idx: usize, line_no: usize) -> Result<u64> {
    let s = expect_str(tokens, idx, line_no)?;
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(&s);
    u64::from_str_radix(digits, 16).map_err(|_| ReconstructError::CollectionSyntax {
        line: line_no,
        message: format!("expected hex integer, got {s:?}"),
    })
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
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
    use crate::collect::Task;

    #[test]
    fn round_trips_through_text() {
        let mut collection = Collection::default();
        collection.traces.push("/tmp/cpu0.pt".to_string());
        collection.tasks.insert(
            42,
            Task {
                tid: 42,
                name: Some("a \"quoted\" name".to_string()),
                blocks: vec![
                    Block::Enter { cpu: 0, tsc: 0x10 },
                    Block::Trace {
                        cpu: 0,
                        tsc_start: 0x10,
                        tsc_end: 0x20,
                        pos_start: 0,
                        lip_start: 0,
                        pos_end: 0x30,
                        lip_end: 0xdead,
                    },
                    Block::Leave { cpu: 0, tsc: 0x20 },
                ],
            },
        );

        let mut buf = Vec::new();
        write(&collection, &mut buf).unwrap();
        let parsed = read(io::Cursor::new(buf)).unwrap();

        assert_eq!(parsed.traces, vec!["/tmp/cpu0.pt".to_string()]);
        let task = &parsed.tasks[&42];
        assert_eq!(task.name.as_deref(), Some("a \"quoted\" name"));
        assert_eq!(task.blocks.len(), 3);
    }

    #[test]
    fn rejects_block_outside_task() {
        let text = "\tenter 0 0x10\neof\n";
        assert!(read(io::Cursor::new(text)).is_err());
    }
}
