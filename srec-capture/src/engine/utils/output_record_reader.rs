//! Record reader for child process output.
//!
//! ffmpeg rewrites its status line with `\r`. Piped output is then not
//! newline-delimited, so `lines()` would hold progress back until the process
//! exits. Records here end at either `\n` or `\r`.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// Records longer than this are split.
const MAX_RECORD_LEN: usize = 64 * 1024;

/// Reads an async stream and yields trimmed, non-empty text records.
pub struct OutputRecordReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    scratch: [u8; 4096],
}

impl<R> OutputRecordReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
            scratch: [0u8; 4096],
        }
    }

    /// Next record, `None` at end of stream.
    pub async fn next_record(&mut self) -> io::Result<Option<String>> {
        loop {
            let split = self
                .pending
                .iter()
                .position(|&b| matches!(b, b'\n' | b'\r'))
                .or_else(|| (self.pending.len() >= MAX_RECORD_LEN).then_some(MAX_RECORD_LEN));

            if let Some(idx) = split {
                let record_bytes: Vec<u8> = self.pending.drain(..idx).collect();
                let delimiters = self
                    .pending
                    .iter()
                    .take_while(|&&b| matches!(b, b'\n' | b'\r'))
                    .count();
                self.pending.drain(..delimiters);

                let record = String::from_utf8_lossy(&record_bytes).trim().to_string();
                if record.is_empty() {
                    continue;
                }
                return Ok(Some(record));
            }

            let n = self.reader.read(&mut self.scratch).await?;
            if n == 0 {
                let record = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                return Ok((!record.is_empty()).then_some(record));
            }

            self.pending.extend_from_slice(&self.scratch[..n]);
        }
    }
}
