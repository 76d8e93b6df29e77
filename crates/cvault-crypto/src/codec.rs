//! Streaming ChaCha20-Poly1305 media container
//!
//! Container format (binary, version 1):
//! ```text
//! [4 bytes: "CVMF"][1 byte: version][16 bytes: salt][12 bytes: nonce][4 bytes: chunk_size BE]
//! [chunk 0: ciphertext (chunk_size bytes) || 16-byte tag]
//! ...
//! [chunk n: ciphertext (0..=chunk_size bytes) || 16-byte tag]   <- final, ends the file
//! ```
//!
//! - file key = HKDF-SHA256(ikm = CEK, salt = header salt, info = "cvault-media-v1")
//! - chunk nonce = header nonce with the last 8 bytes XORed by the chunk index (BE)
//! - chunk AAD = header bytes || chunk index (8 bytes BE) || final flag (1 byte)
//!
//! Every chunk is authenticated before any of its plaintext is released. The
//! AAD binds chunks to their position and to the end of the stream, so
//! reordering, truncation at a chunk boundary and appended data all fail
//! authentication. A consumer that sees an error mid-stream must discard what
//! it already received; only a stream that reached its final chunk is valid.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    ChaCha20Poly1305, Key, Nonce, Tag,
};
use cvault_core::config::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use cvault_core::{VaultError, VaultResult};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::keys::{hkdf_derive, ContentKey, KeyMaterial};
use crate::{KEY_SIZE, NONCE_SIZE, SALT_SIZE, TAG_SIZE};

pub const MAGIC: &[u8; 4] = b"CVMF";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 4 + 1 + SALT_SIZE + NONCE_SIZE + 4;

const FILE_KEY_INFO: &[u8] = b"cvault-media-v1";
const AAD_LEN: usize = HEADER_LEN + 8 + 1;

/// Fixed-size container header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub salt: [u8; SALT_SIZE],
    pub nonce: [u8; NONCE_SIZE],
    pub chunk_size: u32,
}

impl ContainerHeader {
    /// Fresh header with random salt and nonce.
    pub fn generate(chunk_size: u32) -> VaultResult<Self> {
        check_chunk_size(chunk_size)?;
        let mut salt = [0u8; SALT_SIZE];
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        Ok(Self {
            salt,
            nonce,
            chunk_size,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(MAGIC);
        out[4] = VERSION;
        out[5..5 + SALT_SIZE].copy_from_slice(&self.salt);
        out[5 + SALT_SIZE..5 + SALT_SIZE + NONCE_SIZE].copy_from_slice(&self.nonce);
        out[HEADER_LEN - 4..].copy_from_slice(&self.chunk_size.to_be_bytes());
        out
    }

    /// Parse a header. `bytes` may be shorter than `HEADER_LEN` when the file
    /// itself is.
    pub fn parse(bytes: &[u8]) -> VaultResult<Self> {
        if bytes.len() >= MAGIC.len() && &bytes[..MAGIC.len()] != MAGIC {
            return Err(VaultError::Format("media container: bad magic".into()));
        }
        if bytes.len() > 4 && bytes[4] != VERSION {
            return Err(VaultError::Version {
                found: bytes[4],
                supported: VERSION,
            });
        }
        if bytes.len() < HEADER_LEN {
            return Err(VaultError::Truncated(format!(
                "media container header is {} bytes",
                bytes.len()
            )));
        }

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[5..5 + SALT_SIZE]);
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[5 + SALT_SIZE..5 + SALT_SIZE + NONCE_SIZE]);
        let mut size = [0u8; 4];
        size.copy_from_slice(&bytes[HEADER_LEN - 4..HEADER_LEN]);
        let chunk_size = u32::from_be_bytes(size);
        check_chunk_size(chunk_size)
            .map_err(|_| VaultError::Format(format!("media container: chunk size {chunk_size}")))?;

        Ok(Self {
            salt,
            nonce,
            chunk_size,
        })
    }

    fn file_key(&self, cek: &ContentKey) -> VaultResult<Zeroizing<[u8; KEY_SIZE]>> {
        hkdf_derive(cek.as_bytes(), Some(&self.salt), FILE_KEY_INFO).map(Zeroizing::new)
    }

    fn chunk_nonce(&self, index: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = self.nonce;
        for (n, i) in nonce[NONCE_SIZE - 8..].iter_mut().zip(index.to_be_bytes()) {
            *n ^= i;
        }
        nonce
    }
}

fn check_chunk_size(chunk_size: u32) -> VaultResult<()> {
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
        return Err(VaultError::Config(format!(
            "chunk size {chunk_size} outside {MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE}"
        )));
    }
    Ok(())
}

fn chunk_aad(header: &[u8; HEADER_LEN], index: u64, is_final: bool) -> [u8; AAD_LEN] {
    let mut aad = [0u8; AAD_LEN];
    aad[..HEADER_LEN].copy_from_slice(header);
    aad[HEADER_LEN..HEADER_LEN + 8].copy_from_slice(&index.to_be_bytes());
    aad[AAD_LEN - 1] = u8::from(is_final);
    aad
}

/// Fill `buf` unless EOF comes first. Returns the number of bytes read.
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

/// Encrypt `reader` into a container written to `writer`, holding at most two
/// chunks in memory. Returns the number of plaintext bytes consumed.
pub fn encrypt_stream<R: Read, W: Write>(
    cek: &ContentKey,
    mut reader: R,
    mut writer: W,
    chunk_size: u32,
) -> VaultResult<u64> {
    let header = ContainerHeader::generate(chunk_size)?;
    let header_bytes = header.to_bytes();
    let key = header.file_key(cek)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));

    writer.write_all(&header_bytes)?;

    let size = chunk_size as usize;
    let mut current = Zeroizing::new(vec![0u8; size]);
    let mut next = Zeroizing::new(vec![0u8; size]);
    let mut current_len = read_full(&mut reader, &mut current[..])?;
    let mut index = 0u64;
    let mut total = 0u64;

    loop {
        // A short read means EOF, so only a full chunk needs a lookahead.
        let next_len = if current_len == size {
            read_full(&mut reader, &mut next[..])?
        } else {
            0
        };
        let is_final = next_len == 0;

        let tag = cipher
            .encrypt_in_place_detached(
                Nonce::from_slice(&header.chunk_nonce(index)),
                &chunk_aad(&header_bytes, index, is_final),
                &mut current[..current_len],
            )
            .map_err(|e| VaultError::Other(anyhow::anyhow!("chunk encryption failed: {e}")))?;

        writer.write_all(&current[..current_len])?;
        writer.write_all(&tag)?;
        total += current_len as u64;
        index += 1;

        if is_final {
            break;
        }
        std::mem::swap(&mut current, &mut next);
        current_len = next_len;
    }

    writer.flush()?;
    tracing::debug!(chunks = index, bytes = total, "media container sealed");
    Ok(total)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Reading,
    Finished,
    Failed,
}

/// Pull-based decryptor. Each `read` decrypts at most one chunk ahead of the
/// consumer, so a stalled consumer stalls decryption too.
///
/// Dropping it mid-stream closes the reader and zeroizes the key and any
/// buffered plaintext.
pub struct Decryptor<R: Read> {
    reader: BufReader<R>,
    header: ContainerHeader,
    header_bytes: [u8; HEADER_LEN],
    key: Zeroizing<[u8; KEY_SIZE]>,
    chunk: Zeroizing<Vec<u8>>,
    chunk_len: usize,
    pos: usize,
    index: u64,
    plaintext_bytes: u64,
    state: StreamState,
}

impl<R: Read> Decryptor<R> {
    /// Read and validate the header. Magic, version and chunk size are
    /// checked before any key material is derived.
    pub fn new(cek: &ContentKey, reader: R) -> VaultResult<Self> {
        let mut reader = BufReader::new(reader);
        let mut header_bytes = [0u8; HEADER_LEN];
        let n = read_full(&mut reader, &mut header_bytes)?;
        let header = ContainerHeader::parse(&header_bytes[..n])?;
        let key = header.file_key(cek)?;
        let chunk = Zeroizing::new(vec![0u8; header.chunk_size as usize + TAG_SIZE]);

        Ok(Self {
            reader,
            header,
            header_bytes,
            key,
            chunk,
            chunk_len: 0,
            pos: 0,
            index: 0,
            plaintext_bytes: 0,
            state: StreamState::Reading,
        })
    }

    pub fn header(&self) -> &ContainerHeader {
        &self.header
    }

    /// True once the final chunk has been authenticated.
    pub fn is_finished(&self) -> bool {
        self.state == StreamState::Finished
    }

    pub fn plaintext_bytes(&self) -> u64 {
        self.plaintext_bytes
    }

    /// Decrypt the next chunk and hand back its plaintext. `Ok(None)` after the
    /// final chunk.
    pub fn next_chunk(&mut self) -> VaultResult<Option<&[u8]>> {
        match self.state {
            StreamState::Finished => return Ok(None),
            StreamState::Failed => return Err(poisoned()),
            StreamState::Reading => {}
        }
        self.advance_guarded()?;
        self.pos = self.chunk_len;
        Ok(Some(&self.chunk[..self.chunk_len]))
    }

    fn advance_guarded(&mut self) -> VaultResult<()> {
        let result = self.advance();
        if result.is_err() {
            self.state = StreamState::Failed;
            self.chunk_len = 0;
            self.pos = 0;
            self.chunk.iter_mut().for_each(|b| *b = 0);
        }
        result
    }

    fn advance(&mut self) -> VaultResult<()> {
        let enc_len = self.header.chunk_size as usize + TAG_SIZE;
        let n = read_full(&mut self.reader, &mut self.chunk[..enc_len])?;
        if n < TAG_SIZE {
            return Err(VaultError::Truncated(format!(
                "media container chunk {} is {n} bytes",
                self.index
            )));
        }
        let is_final = n < enc_len || self.reader.fill_buf()?.is_empty();

        let nonce = self.header.chunk_nonce(self.index);
        let aad = chunk_aad(&self.header_bytes, self.index, is_final);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key[..]));
        let (body, tag) = self.chunk[..n].split_at_mut(n - TAG_SIZE);
        cipher
            .decrypt_in_place_detached(Nonce::from_slice(&nonce), &aad, body, Tag::from_slice(tag))
            .map_err(|_| VaultError::Authentication)?;

        self.chunk_len = n - TAG_SIZE;
        self.pos = 0;
        self.index += 1;
        self.plaintext_bytes += self.chunk_len as u64;
        if is_final {
            self.state = StreamState::Finished;
            tracing::debug!(
                chunks = self.index,
                bytes = self.plaintext_bytes,
                "media container verified"
            );
        }
        Ok(())
    }
}

fn poisoned() -> VaultError {
    VaultError::Other(anyhow::anyhow!(
        "media stream aborted after an earlier failure"
    ))
}

impl<R: Read> Read for Decryptor<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos == self.chunk_len {
            match self.state {
                StreamState::Finished => return Ok(0),
                StreamState::Failed => return Err(into_io(poisoned())),
                StreamState::Reading => self.advance_guarded().map_err(into_io)?,
            }
        }
        let n = buf.len().min(self.chunk_len - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn into_io(e: VaultError) -> io::Error {
    match e {
        VaultError::Io(io) => io,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// Recover the `VaultError` carried by an `io::Error` coming out of a
/// `Decryptor` used through `Read`.
pub fn vault_error_from_io(e: io::Error) -> VaultError {
    if e.get_ref().is_some_and(|inner| inner.is::<VaultError>()) {
        if let Some(inner) = e.into_inner() {
            if let Ok(err) = inner.downcast::<VaultError>() {
                return *err;
            }
        }
        return VaultError::Other(anyhow::anyhow!("media stream error"));
    }
    VaultError::Io(e)
}

/// Decrypt a whole container into `writer`. Returns the plaintext length.
///
/// Plaintext is written chunk by chunk as it verifies; on error the caller
/// must discard everything already written.
pub fn decrypt_stream<R: Read, W: Write>(
    cek: &ContentKey,
    reader: R,
    mut writer: W,
) -> VaultResult<u64> {
    let mut decryptor = Decryptor::new(cek, reader)?;
    while let Some(chunk) = decryptor.next_chunk()? {
        writer.write_all(chunk)?;
    }
    writer.flush()?;
    Ok(decryptor.plaintext_bytes())
}

/// Encrypt `src` into a container at `dst` (temp file, then rename).
pub fn encrypt_file(cek: &ContentKey, src: &Path, dst: &Path, chunk_size: u32) -> VaultResult<u64> {
    let input = File::open(src)?;
    write_atomically(dst, |out| encrypt_stream(cek, input, out, chunk_size))
}

/// Decrypt the container at `src` into `dst`. `dst` only appears once the
/// final chunk has verified; a failed decryption leaves nothing behind.
pub fn decrypt_file(cek: &ContentKey, src: &Path, dst: &Path) -> VaultResult<u64> {
    let input = File::open(src)?;
    write_atomically(dst, |out| decrypt_stream(cek, input, out))
}

fn write_atomically<F>(dst: &Path, fill: F) -> VaultResult<u64>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> VaultResult<u64>,
{
    let dir = match dst.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    // removed on drop unless persisted
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let n = {
        let mut out = BufWriter::new(tmp.as_file_mut());
        let n = fill(&mut out)?;
        out.flush()?;
        n
    };
    tmp.as_file().sync_all()?;
    tmp.persist(dst).map_err(|e| e.error)?;
    Ok(n)
}
