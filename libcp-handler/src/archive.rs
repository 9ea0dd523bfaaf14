// Copyright 2026-Present The Crashpipe Authors
// SPDX-License-Identifier: Apache-2.0

//! The dual-sink archive: a forward-only input reader paired with a gzip
//! output writer, such that every byte observed from the input is mirrored
//! to the gzip sink exactly once, in order (the mirror invariant spec.md
//! §4.1/§8 requires). The archive also carries hand-written USTAR member
//! headers for auxiliary files (`info.crashdata`, `crashcontext-*` data),
//! interleaved into the same gzip stream around the raw, unframed core
//! bytes — there is no outer tar container for the core itself.

use flate2::write::GzEncoder;
use flate2::Compression;
use libcp_common::error::CrashpipeError;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

/// `ARCHIVE_READ_BUFFER_SZ` in `original_source`.
const SCRATCH_BUF_SZ: usize = 128 * 1024;

const TAR_BLOCK: usize = 512;

pub struct Archive {
    out: Option<GzEncoder<File>>,
    input: Option<Box<dyn Read>>,
    in_offset: u64,
    embedded_any: bool,
}

impl Archive {
    pub fn create(out_path: &Path) -> Result<Self, CrashpipeError> {
        let file = File::create(out_path).map_err(|source| CrashpipeError::Open {
            path: out_path.display().to_string(),
            source,
        })?;
        Ok(Self {
            out: Some(GzEncoder::new(file, Compression::best())),
            input: None,
            in_offset: 0,
            embedded_any: false,
        })
    }

    pub fn stream_open_stdin(&mut self) {
        self.input = Some(Box::new(std::io::stdin()));
    }

    /// Attaches an arbitrary input source. Used directly by tests building
    /// synthetic cores; production code uses [`Self::stream_open_stdin`] or
    /// [`Self::stream_open_file`].
    pub fn stream_open_reader(&mut self, reader: Box<dyn Read>) {
        self.input = Some(reader);
    }

    pub fn stream_open_file(&mut self, path: &Path) -> Result<(), CrashpipeError> {
        let file = File::open(path).map_err(|source| CrashpipeError::Open {
            path: path.display().to_string(),
            source,
        })?;
        self.input = Some(Box::new(file));
        Ok(())
    }

    pub fn in_offset(&self) -> u64 {
        self.in_offset
    }

    fn sink_write(&mut self, buf: &[u8]) {
        if let Some(out) = self.out.as_mut() {
            if let Err(e) = out.write_all(buf) {
                tracing::warn!(error = %e, "gzip sink write failed, continuing parse");
            }
        }
    }

    /// Copies exactly `buf.len()` bytes from input into `buf`, mirroring them
    /// to the gzip sink. Short reads are a hard failure.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<(), CrashpipeError> {
        let input = self.input.as_mut().ok_or(CrashpipeError::ShortIo {
            what: "archive input (not attached)",
            expected: buf.len(),
            actual: 0,
        })?;
        input.read_exact(buf).map_err(|_| CrashpipeError::ShortIo {
            what: "archive input",
            expected: buf.len(),
            actual: 0,
        })?;
        self.sink_write(buf);
        self.in_offset += buf.len() as u64;
        Ok(())
    }

    /// Equivalent to `move_ahead(target - in_offset)`. The stream is
    /// forward-only: `target < in_offset` is an error.
    pub fn move_to_offset(&mut self, target: u64) -> Result<(), CrashpipeError> {
        if target < self.in_offset {
            return Err(CrashpipeError::BackwardSeek {
                target,
                current: self.in_offset,
            });
        }
        self.move_ahead(target - self.in_offset)
    }

    /// Reads `n` bytes through a 128 KiB scratch buffer, writing every byte
    /// read to the gzip sink and advancing `in_offset`.
    pub fn move_ahead(&mut self, n: u64) -> Result<(), CrashpipeError> {
        let mut remaining = n;
        let mut scratch = vec![0u8; SCRATCH_BUF_SZ.min(n.max(1) as usize)];
        while remaining > 0 {
            let want = remaining.min(scratch.len() as u64) as usize;
            let input = self.input.as_mut().ok_or(CrashpipeError::ShortIo {
                what: "archive input (not attached)",
                expected: want,
                actual: 0,
            })?;
            input
                .read_exact(&mut scratch[..want])
                .map_err(|_| CrashpipeError::ShortIo {
                    what: "archive move_ahead",
                    expected: want,
                    actual: 0,
                })?;
            self.sink_write(&scratch[..want]);
            self.in_offset += want as u64;
            remaining -= want as u64;
        }
        Ok(())
    }

    /// Reads to EOF, mirroring every byte to the gzip sink. Returns the
    /// number of bytes streamed.
    pub fn read_all(&mut self) -> Result<u64, CrashpipeError> {
        let mut scratch = vec![0u8; SCRATCH_BUF_SZ];
        let mut total = 0u64;
        loop {
            let input = self.input.as_mut().ok_or(CrashpipeError::ShortIo {
                what: "archive input (not attached)",
                expected: 0,
                actual: 0,
            })?;
            let n = input.read(&mut scratch).map_err(|_| CrashpipeError::ShortIo {
                what: "archive read_all",
                expected: 0,
                actual: 0,
            })?;
            if n == 0 {
                break;
            }
            self.sink_write(&scratch[..n]);
            self.in_offset += n as u64;
            total += n as u64;
        }
        Ok(total)
    }

    /// Begins an auxiliary file member: writes a USTAR header for `name`
    /// sized `size` bytes. Must be followed by exactly `size` bytes of
    /// `write_file` calls, then `finish_file`.
    pub fn create_file(&mut self, name: &str, size: u64) -> Result<(), CrashpipeError> {
        let mut header = tar::Header::new_gnu();
        header.set_path(name).map_err(|_| {
            CrashpipeError::ProtocolReject(format!("archive member name too long: {name}"))
        })?;
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        self.sink_write(header.as_bytes());
        self.embedded_any = true;
        Ok(())
    }

    pub fn write_file(&mut self, bytes: &[u8]) {
        self.sink_write(bytes);
    }

    /// Pads the most recently started member up to the next 512-byte
    /// boundary, as USTAR requires.
    pub fn finish_file(&mut self, written: u64) {
        let pad = (TAR_BLOCK - (written as usize % TAR_BLOCK)) % TAR_BLOCK;
        if pad > 0 {
            self.sink_write(&vec![0u8; pad]);
        }
    }

    /// Flushes and closes both sinks. Idempotent: a second call is a no-op.
    pub fn close(&mut self) -> Result<(), CrashpipeError> {
        let Some(mut out) = self.out.take() else {
            return Ok(());
        };
        if self.embedded_any {
            out.write_all(&[0u8; TAR_BLOCK]).ok();
            out.write_all(&[0u8; TAR_BLOCK]).ok();
        }
        out.finish().map_err(|source| CrashpipeError::Open {
            path: "<gzip sink>".to_string(),
            source,
        })?;
        Ok(())
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        if self.out.is_some() {
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "archive close on drop failed");
            }
        }
    }
}
