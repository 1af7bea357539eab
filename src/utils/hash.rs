use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Result as IoResult, Write};
use std::path::Path;

pub fn sha256_file(path: &Path) -> IoResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 { break; }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Writer adapter that counts bytes and, optionally, hashes them on the way through.
pub struct Tally<W> {
    inner: W,
    bytes: u64,
    hasher: Option<Sha256>,
}

impl<W: Write> Tally<W> {
    pub fn counting(inner: W) -> Self {
        Self { inner, bytes: 0, hasher: None }
    }

    pub fn hashing(inner: W) -> Self {
        Self { inner, bytes: 0, hasher: Some(Sha256::new()) }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Returns the inner writer, the byte count and the hex digest (if hashing).
    pub fn into_parts(self) -> (W, u64, Option<String>) {
        let digest = self.hasher.map(|h| hex::encode(h.finalize()));
        (self.inner, self.bytes, digest)
    }
}

impl<W: Write> Write for Tally<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.bytes += n as u64;
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
