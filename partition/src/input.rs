//! Shared input cursor delivering line-aligned blocks to map workers.
//!
//! Many threads call `read` concurrently; an internal lock serializes
//! the underlying file reads. Each returned block consists of whole
//! lines only; a partial line at the end of a block is carried into the
//! next read. A final line with no terminating newline is synthesized
//! into one.

use crate::silo::MAX_LINE_SIZE;
use anyhow::{bail, Context, Result};
use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Mutex;

pub struct InputLines {
    state: Mutex<State>,
    block_size: usize,
}

struct State {
    paths: VecDeque<PathBuf>,
    reader: Option<(File, PathBuf)>,
    carry: Vec<u8>,
}

impl InputLines {
    pub fn new(paths: Vec<PathBuf>, block_size: usize) -> Self {
        InputLines {
            state: Mutex::new(State { paths: paths.into(), reader: None, carry: Vec::new() }),
            block_size,
        }
    }

    /// The buffer capacity `read` may require.
    pub fn min_buffer_capacity(&self) -> usize {
        self.block_size + MAX_LINE_SIZE + 1
    }

    /// Fill `buf` with the next block of whole lines. Returns false
    /// when the input is exhausted.
    pub fn read(&self, buf: &mut Vec<u8>) -> Result<bool> {
        buf.clear();
        let mut state = self.state.lock().expect("input cursor lock poisoned");
        buf.append(&mut state.carry);

        while buf.len() < self.block_size {
            if state.reader.is_none() {
                match state.paths.pop_front() {
                    Some(path) => {
                        let file = File::open(&path)
                            .with_context(|| format!("failed to open input file {}", path.display()))?;
                        state.reader = Some((file, path));
                    }
                    None => break,
                }
            }
            let (file, path) = state.reader.as_mut().expect("reader was just installed");
            let start = buf.len();
            buf.resize(self.block_size, 0);
            let n = file
                .read(&mut buf[start..])
                .with_context(|| format!("failed to read input file {}", path.display()))?;
            buf.truncate(start + n);
            if n == 0 {
                state.reader = None;
            }
        }

        if buf.is_empty() {
            return Ok(false);
        }
        match buf.iter().rposition(|&b| b == b'\n') {
            Some(last) => {
                state.carry.extend_from_slice(&buf[last + 1..]);
                if state.carry.len() > MAX_LINE_SIZE {
                    bail!("input line exceeds the maximum line size {MAX_LINE_SIZE}");
                }
                buf.truncate(last + 1);
            }
            None => {
                // No newline in a full block means a line longer than
                // the block; at end of input, synthesize the terminator.
                if state.reader.is_some() || !state.paths.is_empty() {
                    bail!("input line exceeds the block size {}", self.block_size);
                }
                buf.push(b'\n');
            }
        }
        Ok(true)
    }
}
