//! Line-oriented event traces.
//!
//! The binary replays recorded instrumentation events from a text trace,
//! one event per line:
//!
//! ```text
//! s <tid>              thread start
//! f <tid>              thread fini
//! i <tid>              one instruction (no memory operand)
//! r <tid> <ip> <addr>  memory read
//! w <tid> <ip> <addr>  memory write
//! ```
//!
//! Numbers are decimal or `0x`-prefixed hex. Blank lines and `#` comments
//! are skipped. Replay issues an instruction event ahead of every memory
//! event, mirroring how the instrumentation host observes every
//! instruction before its memory operands.

use crate::{address, Simulator};
use std::io::BufRead;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    ThreadStart { tid: usize },
    ThreadFini { tid: usize },
    Instruction { tid: usize },
    Read { tid: usize, ip: address, addr: address },
    Write { tid: usize, ip: address, addr: address },
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("line {line}: unknown event kind {kind:?}")]
    UnknownKind { line: usize, kind: String },
    #[error("line {line}: expected {expected} fields after {kind:?}, found {found}")]
    FieldCount {
        line: usize,
        kind: char,
        expected: usize,
        found: usize,
    },
    #[error("line {line}: malformed number {token:?}")]
    Number { line: usize, token: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn parse_number(token: &str, line: usize) -> Result<u64, Error> {
    let parsed = match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => token.parse(),
    };
    parsed.map_err(|_| Error::Number {
        line,
        token: token.to_owned(),
    })
}

/// Parse a single trace line; `Ok(None)` for blanks and comments.
pub fn parse_line(text: &str, line: usize) -> Result<Option<Event>, Error> {
    let text = text.trim();
    if text.is_empty() || text.starts_with('#') {
        return Ok(None);
    }

    let mut fields = text.split_whitespace();
    let kind = fields.next().expect("non-empty line has a first field");
    let rest: Vec<&str> = fields.collect();

    let expect = |expected: usize| -> Result<(), Error> {
        if rest.len() == expected {
            Ok(())
        } else {
            Err(Error::FieldCount {
                line,
                kind: kind.chars().next().unwrap_or('?'),
                expected,
                found: rest.len(),
            })
        }
    };

    let event = match kind {
        "s" => {
            expect(1)?;
            Event::ThreadStart {
                tid: parse_number(rest[0], line)? as usize,
            }
        }
        "f" => {
            expect(1)?;
            Event::ThreadFini {
                tid: parse_number(rest[0], line)? as usize,
            }
        }
        "i" => {
            expect(1)?;
            Event::Instruction {
                tid: parse_number(rest[0], line)? as usize,
            }
        }
        "r" | "w" => {
            expect(3)?;
            let tid = parse_number(rest[0], line)? as usize;
            let ip = parse_number(rest[1], line)?;
            let addr = parse_number(rest[2], line)?;
            if kind == "r" {
                Event::Read { tid, ip, addr }
            } else {
                Event::Write { tid, ip, addr }
            }
        }
        other => {
            return Err(Error::UnknownKind {
                line,
                kind: other.to_owned(),
            })
        }
    };
    Ok(Some(event))
}

/// Iterator over the events of a trace stream.
pub struct Reader<R> {
    input: R,
    line: usize,
    buf: String,
}

impl<R: BufRead> Reader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            line: 0,
            buf: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for Reader<R> {
    type Item = Result<Event, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            self.line += 1;
            match self.input.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(err.into())),
            }
            match parse_line(&self.buf, self.line) {
                Ok(Some(event)) => return Some(Ok(event)),
                Ok(None) => {}
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Replay a trace stream into the simulator callbacks.
pub fn replay<R: BufRead>(sim: &Simulator, input: R) -> Result<u64, Error> {
    let mut events = 0;
    for event in Reader::new(input) {
        match event? {
            Event::ThreadStart { tid } => sim.on_thread_start(tid),
            Event::ThreadFini { tid } => sim.on_thread_fini(tid),
            Event::Instruction { tid } => sim.on_instruction(tid),
            Event::Read { tid, ip, addr } => {
                sim.on_instruction(tid);
                sim.on_memory_read(tid, ip, addr);
            }
            Event::Write { tid, ip, addr } => {
                sim.on_instruction(tid);
                sim.on_memory_write(tid, ip, addr);
            }
        }
        events += 1;
    }
    Ok(events)
}
