//! Local read path: splits a source file into pooled [`Block`]s.

use fdx_core::{Block, BufferPool, Error, FileKind, FileUnit, Result};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Reads sources into pool-sized blocks tagged with their destination
/// file unit and offset
#[derive(Debug, Clone)]
pub struct BlockReader {
    pool: Arc<BufferPool>,
}

impl BlockReader {
    /// Create a reader drawing buffers from `pool`
    #[must_use]
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self { pool }
    }

    /// Read `source` and hand every block for `unit` to `sink`.
    ///
    /// The zero source produces `unit.size()` zero bytes. A file of size
    /// zero yields a single empty block so the writer can complete it.
    /// Returns the number of bytes read.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by the source or by `sink`, and an
    /// `UnexpectedEof` I/O error if the source holds fewer bytes than the
    /// unit declares.
    pub fn read_file<F>(&self, unit: &FileUnit, source: &Path, mut sink: F) -> Result<u64>
    where
        F: FnMut(Block) -> Result<()>,
    {
        let size = unit.size();
        if size == 0 {
            let block = Block::new(unit.session_id(), unit.id(), 0, self.pool.acquire(), 0);
            sink(block)?;
            return Ok(0);
        }

        let mut file = match FileKind::of(source) {
            FileKind::Zero => None,
            _ => Some(File::open(source)?),
        };

        let mut offset = 0u64;
        while offset < size {
            let mut buf = self.pool.acquire();
            let want = buf.len().min((size - offset) as usize);
            let n = match file.as_mut() {
                Some(f) => read_full(f, &mut buf[..want])?,
                None => {
                    buf[..want].fill(0);
                    want
                }
            };
            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "{} ended after {offset} of {size} declared bytes",
                        source.display()
                    ),
                )));
            }

            sink(Block::new(unit.session_id(), unit.id(), offset, buf, n))?;
            offset += n as u64;
        }

        debug!(file = %unit.id(), source = %source.display(), bytes = offset, "Source read");
        Ok(offset)
    }
}

/// Fill `buf` from `reader`, stopping early only at end of input
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
