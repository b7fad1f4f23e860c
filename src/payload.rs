//! Payload location and embedding.
//!
//! A onefile build is the launcher stub with the zip payload appended
//! verbatim. The launcher finds the payload by scanning its own image
//! for the archive magic signature, not by extension or trailer index,
//! so the same logic lives here for both sides: the builder uses it to
//! refuse double-embedding, the launcher to locate the offset. A raw
//! signature hit is only a candidate; any binary that links an archive
//! reader carries the signature bytes among its own constants, so every
//! hit is validated by actually opening the archive.

use anyhow::{bail, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Scan chunk size; the signature may straddle a chunk edge, which the
/// scanner covers with a signature-sized look-back.
pub const SCAN_CHUNK: usize = 64 * 1024;

/// Zip local-file-header signature.
///
/// Computed at runtime so the byte sequence never appears contiguously
/// in the launcher's own image, where the scanner would find it before
/// the real payload.
pub fn magic() -> [u8; 4] {
    let mut m = [0xA0u8, 0xBBu8, 0xF3u8, 0xF4u8];
    for b in &mut m {
        *b ^= 0xF0;
    }
    m // b"PK\x03\x04"
}

/// Find the absolute offset of the first payload signature.
///
/// Raw scan only; callers that need to distinguish a real payload from
/// stray signature bytes use [`locate_archive`].
pub fn find_payload_offset<R: Read>(reader: R) -> Result<Option<u64>> {
    scan_for_magic(reader, SCAN_CHUNK)
}

/// Find the first signature occurrence that marks a readable archive.
///
/// Signature bytes occurring inside the stub's own code or data do not
/// open as an archive and are skipped; exhausting the image without a
/// readable archive means no payload is embedded.
pub fn locate_archive(path: &Path) -> Result<Option<u64>> {
    let mut from = 0u64;
    loop {
        let mut image = File::open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        image.seek(SeekFrom::Start(from))?;
        let Some(found) = scan_for_magic(&mut image, SCAN_CHUNK)? else {
            return Ok(None);
        };
        let offset = from + found;
        let section = SectionReader::open(path, offset)?;
        if zip::ZipArchive::new(section).is_ok() {
            return Ok(Some(offset));
        }
        from = offset + 1;
    }
}

/// Chunked scan with explicit chunk size (exposed for tests exercising
/// the chunk-boundary case).
pub fn scan_for_magic<R: Read>(mut reader: R, chunk_size: usize) -> Result<Option<u64>> {
    assert!(chunk_size >= 4, "chunk must hold the signature");
    let magic = magic();

    // `carry` holds the last signature-length - 1 bytes of the
    // previous window; `absolute` is the file offset of carry[0].
    let mut carry: Vec<u8> = Vec::new();
    let mut absolute: u64 = 0;
    let mut chunk = vec![0u8; chunk_size];

    loop {
        let n = read_full(&mut reader, &mut chunk)?;
        if n == 0 {
            return Ok(None);
        }

        let mut window = carry.clone();
        window.extend_from_slice(&chunk[..n]);

        if let Some(i) = window.windows(4).position(|w| w == magic) {
            return Ok(Some(absolute + i as u64));
        }

        let keep = window.len().min(3);
        absolute += (window.len() - keep) as u64;
        carry = window[window.len() - keep..].to_vec();
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
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

/// Append an archive to a copy of the launcher stub.
///
/// Refuses a stub that already carries a readable payload, so two
/// builds never stack archives in one executable.
pub fn append_payload(stub: &Path, archive: &Path, output: &Path) -> Result<()> {
    if locate_archive(stub)?.is_some() {
        bail!(
            "{} already contains an embedded payload; use a clean launcher stub",
            stub.display()
        );
    }
    let mut out = File::create(output)
        .with_context(|| format!("cannot create {}", output.display()))?;
    let mut stub_file = File::open(stub)
        .with_context(|| format!("cannot open launcher stub {}", stub.display()))?;
    io::copy(&mut stub_file, &mut out)?;
    let mut archive_file = File::open(archive)
        .with_context(|| format!("cannot open archive {}", archive.display()))?;
    io::copy(&mut archive_file, &mut out)?;
    out.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(output, perms)?;
    }
    Ok(())
}

/// Read + Seek view over the `[start, end)` region of a file, so the
/// zip reader only ever sees the embedded archive.
pub struct SectionReader {
    inner: File,
    start: u64,
    len: u64,
    pos: u64,
}

impl SectionReader {
    pub fn new(mut inner: File, start: u64) -> Result<Self> {
        let end = inner.seek(SeekFrom::End(0))?;
        let len = end.checked_sub(start).context("payload offset past end of file")?;
        Ok(Self {
            inner,
            start,
            len,
            pos: 0,
        })
    }

    /// Open a file and restrict it to the region from `start`.
    pub fn open(path: &Path, start: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        Self::new(file, start)
    }
}

impl Read for SectionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let remaining = (self.len - self.pos) as usize;
        let take = buf.len().min(remaining);
        self.inner.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.inner.read(&mut buf[..take])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SectionReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => self.len as i64 + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of payload",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
