//! Lazy reverse line reader.
//!
//! [`ReverseLines`] walks a seekable resource from the end towards the
//! start in fixed-size blocks and yields complete lines, last line first.
//! Only one block plus the current partial line is held in memory.
//!
//! The sequence mirrors a plain split on `\n` read back to front: a
//! trailing newline produces a leading empty line, the text before the
//! first newline is yielded last, and an empty resource yields exactly one
//! empty string. Callers filter empty lines themselves.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

const BLOCK_SIZE: usize = 8 * 1024;

pub struct ReverseLines<R> {
    reader: R,
    /// Offset of the first byte not yet read.
    position: u64,
    block_size: usize,
    /// Start of the line currently being assembled, in file order.
    partial: Vec<u8>,
    /// Complete lines found in the last block, next one first.
    ready: VecDeque<String>,
    finished: bool,
}

impl ReverseLines<File> {
    /// Opens `path` and positions the scan at its current end.
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::new(File::open(path)?)
    }
}

impl<R: Read + Seek> ReverseLines<R> {
    pub fn new(reader: R) -> io::Result<Self> {
        Self::with_block_size(reader, BLOCK_SIZE)
    }

    pub fn with_block_size(mut reader: R, block_size: usize) -> io::Result<Self> {
        let position = reader.seek(SeekFrom::End(0))?;
        Ok(Self {
            reader,
            position,
            block_size: block_size.max(1),
            partial: Vec::new(),
            ready: VecDeque::new(),
            finished: false,
        })
    }

    /// Reads the block ending at `position` and moves every line it
    /// completes into `ready`.
    fn read_block(&mut self) -> io::Result<()> {
        let len = self.position.min(self.block_size as u64);
        let start = self.position - len;
        let mut block = vec![0u8; len as usize];
        self.reader.seek(SeekFrom::Start(start))?;
        self.reader.read_exact(&mut block)?;
        self.position = start;

        let mut tail = std::mem::take(&mut self.partial);
        let mut end = block.len();
        while let Some(newline) = block[..end].iter().rposition(|&b| b == b'\n') {
            let mut line = block[newline + 1..end].to_vec();
            line.append(&mut tail);
            self.ready.push_back(decode(line));
            end = newline;
        }
        let mut partial = block[..end].to_vec();
        partial.append(&mut tail);
        self.partial = partial;
        Ok(())
    }
}

fn decode(mut line: Vec<u8>) -> String {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    match String::from_utf8(line) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

impl<R: Read + Seek> Iterator for ReverseLines<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Some(Ok(line));
            }
            if self.finished {
                return None;
            }
            if self.position == 0 {
                self.finished = true;
                return Some(Ok(decode(std::mem::take(&mut self.partial))));
            }
            if let Err(e) = self.read_block() {
                self.finished = true;
                return Some(Err(e));
            }
        }
    }
}
