//! Seekable block-cipher streams.
//!
//! A stream starts with one block of random IV. The plaintext follows in
//! counter mode: data block `i` is XORed with the encryption of `IV + i`,
//! reading the IV as a big-endian integer. The final block always carries
//! padding: a single `0x80` byte right after the last plaintext byte, then
//! zeros. A plaintext whose length is a multiple of the block size therefore
//! gains one whole padding block.

use crate::error::{Error, Result};
use crate::refs::RefKey;
use cipher::{Block, BlockEncrypt, KeyInit};
use rand::RngCore;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Cipher used for packs.
pub type PackCipher = aes::Aes256;

/// Padding marker following the last plaintext byte.
const PAD_MARKER: u8 = 0x80;

/// Blocks decrypted per read from the underlying stream.
const READ_BLOCKS: usize = 4096;

const PACK_KEY_CONTEXT: &str = "hoard 2024-06 pack encryption key";
const REF_KEY_CONTEXT: &str = "hoard 2024-06 ref signing key";

/// Build the pack cipher from a 32-byte key.
pub fn pack_cipher(key: &[u8]) -> Result<PackCipher> {
    PackCipher::new_from_slice(key)
        .map_err(|_| Error::config(format!("pack key must be 32 bytes, got {}", key.len())))
}

/// The keys of one repository, derived from a single 32-byte master secret.
#[derive(Clone)]
pub struct RepoKeys {
    /// Encrypts packs.
    pub pack: PackCipher,
    /// Signs tag values.
    pub refs: RefKey,
}

impl RepoKeys {
    pub fn from_master(master: &[u8]) -> Result<Self> {
        if master.len() != 32 {
            return Err(Error::config(format!(
                "master key must be 32 bytes, got {}",
                master.len()
            )));
        }
        Ok(Self {
            pack: pack_cipher(&blake3::derive_key(PACK_KEY_CONTEXT, master))?,
            refs: RefKey::new(blake3::derive_key(REF_KEY_CONTEXT, master)),
        })
    }
}

/// Load a key file holding the master secret: 32 raw bytes, or 64 hex
/// characters with optional surrounding whitespace.
pub fn load_key_file(path: &Path) -> Result<RepoKeys> {
    let raw = std::fs::read(path)?;
    if raw.len() == 32 {
        return RepoKeys::from_master(&raw);
    }
    let text = std::str::from_utf8(&raw)
        .map_err(|_| Error::config(format!("key file {} is not valid", path.display())))?;
    let key = hex::decode(text.trim())
        .map_err(|e| Error::config(format!("key file {}: {}", path.display(), e)))?;
    RepoKeys::from_master(&key)
}

/// Add `value` to a big-endian counter, wrapping at its width.
fn add_to_counter(counter: &mut [u8], mut value: u64) {
    let mut carry = 0u16;
    for byte in counter.iter_mut().rev() {
        if value == 0 && carry == 0 {
            break;
        }
        let sum = *byte as u16 + (value & 0xff) as u16 + carry;
        *byte = sum as u8;
        carry = sum >> 8;
        value >>= 8;
    }
}

/// XOR `data`, which begins at data block `first_block`, with the keystream.
fn apply_keystream<C: BlockEncrypt>(cipher: &C, iv: &[u8], first_block: u64, data: &mut [u8]) {
    let mut counter = Block::<C>::default();
    for (i, chunk) in data.chunks_mut(C::block_size()).enumerate() {
        counter.copy_from_slice(iv);
        add_to_counter(&mut counter, first_block + i as u64);
        cipher.encrypt_block(&mut counter);
        for (b, k) in chunk.iter_mut().zip(counter.iter()) {
            *b ^= k;
        }
    }
}

/// Encrypts everything written to it. Call [`finish`](Self::finish) to emit
/// the padded final block; dropping the writer loses it.
pub struct EncryptedWriter<W: Write, C: BlockEncrypt> {
    inner: W,
    cipher: C,
    iv: Vec<u8>,
    iv_written: bool,
    block: Vec<u8>,
    sealed: u64,
}

impl<W: Write, C: BlockEncrypt> EncryptedWriter<W, C> {
    /// Start a stream under a fresh random IV.
    pub fn new(inner: W, cipher: C) -> Self {
        let mut iv = vec![0u8; C::block_size()];
        rand::thread_rng().fill_bytes(&mut iv);
        Self {
            inner,
            cipher,
            iv,
            iv_written: false,
            block: Vec::with_capacity(C::block_size()),
            sealed: 0,
        }
    }

    fn write_iv(&mut self, out: &mut Vec<u8>) {
        if !self.iv_written {
            out.extend_from_slice(&self.iv);
            self.iv_written = true;
        }
    }

    /// Encrypt the full block buffer onto `out`.
    fn seal_block(&mut self, out: &mut Vec<u8>) {
        apply_keystream(&self.cipher, &self.iv, self.sealed, &mut self.block);
        out.extend_from_slice(&self.block);
        self.block.clear();
        self.sealed += 1;
    }

    /// Pad and write the final block, returning the inner stream.
    pub fn finish(mut self) -> Result<W> {
        let bs = C::block_size();
        let mut out = Vec::with_capacity(2 * bs);
        self.write_iv(&mut out);
        self.block.push(PAD_MARKER);
        self.block.resize(bs, 0);
        self.seal_block(&mut out);
        self.inner.write_all(&out)?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write, C: BlockEncrypt> Write for EncryptedWriter<W, C> {
    fn write(&mut self, mut buf: &[u8]) -> io::Result<usize> {
        let bs = C::block_size();
        let total = buf.len();
        let mut out = Vec::with_capacity(total + 2 * bs);
        self.write_iv(&mut out);
        while !buf.is_empty() {
            let n = (bs - self.block.len()).min(buf.len());
            self.block.extend_from_slice(&buf[..n]);
            buf = &buf[n..];
            // Seal as soon as the block fills so a padding block always
            // remains for finish.
            if self.block.len() == bs {
                self.seal_block(&mut out);
            }
        }
        self.inner.write_all(&out)?;
        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypts a stream written by [`EncryptedWriter`], with random access.
pub struct EncryptedReader<R: Read + Seek, C: BlockEncrypt> {
    inner: R,
    cipher: C,
    iv: Vec<u8>,
    /// Ciphertext bytes after the IV.
    data_len: u64,
    plaintext_len: u64,
    pos: u64,
    /// Decrypted span starting at the block-aligned `cache_start`.
    cache: Vec<u8>,
    cache_start: u64,
}

impl<R: Read + Seek, C: BlockEncrypt> EncryptedReader<R, C> {
    /// Read the IV, validate the ciphertext length and locate the padding.
    pub fn new(mut inner: R, cipher: C) -> Result<Self> {
        let bs = C::block_size() as u64;
        let ciphertext_len = inner.seek(SeekFrom::End(0))?;
        if ciphertext_len < 2 * bs || ciphertext_len % bs != 0 {
            return Err(Error::corrupt_ciphertext(format!(
                "length {} is not an IV plus a positive multiple of the {} byte block",
                ciphertext_len, bs
            )));
        }

        let mut iv = vec![0u8; bs as usize];
        inner.seek(SeekFrom::Start(0))?;
        inner.read_exact(&mut iv)?;

        let data_len = ciphertext_len - bs;
        let mut reader = Self {
            inner,
            cipher,
            iv,
            data_len,
            plaintext_len: 0,
            pos: 0,
            cache: Vec::new(),
            cache_start: 0,
        };
        reader.load(data_len - bs)?;

        let last = &reader.cache[reader.cache.len() - bs as usize..];
        let pad = match last.iter().rposition(|&b| b != 0) {
            Some(i) if last[i] == PAD_MARKER => bs - i as u64,
            _ => return Err(Error::corrupt_ciphertext("padding marker not found")),
        };
        reader.plaintext_len = data_len - pad;
        Ok(reader)
    }

    /// Plaintext length.
    pub fn len(&self) -> u64 {
        self.plaintext_len
    }

    pub fn is_empty(&self) -> bool {
        self.plaintext_len == 0
    }

    /// Decrypt the run of blocks starting at the block containing `offset`.
    fn load(&mut self, offset: u64) -> Result<()> {
        let bs = C::block_size() as u64;
        let start = offset - offset % bs;
        let len = (READ_BLOCKS as u64 * bs).min(self.data_len - start);

        self.cache.resize(len as usize, 0);
        self.inner.seek(SeekFrom::Start(bs + start))?;
        self.inner.read_exact(&mut self.cache)?;
        apply_keystream(&self.cipher, &self.iv, start / bs, &mut self.cache);
        self.cache_start = start;
        Ok(())
    }

    fn cached(&self, offset: u64) -> bool {
        offset >= self.cache_start && offset < self.cache_start + self.cache.len() as u64
    }

    fn read_plain(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.plaintext_len || buf.is_empty() {
            return Ok(0);
        }
        if !self.cached(self.pos) {
            self.load(self.pos)?;
        }
        let within = (self.pos - self.cache_start) as usize;
        let cache_end = self.cache_start + self.cache.len() as u64;
        let avail = (cache_end.min(self.plaintext_len) - self.pos) as usize;
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&self.cache[within..within + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek, C: BlockEncrypt> Read for EncryptedReader<R, C> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_plain(buf).map_err(io::Error::other)
    }
}

impl<R: Read + Seek, C: BlockEncrypt> Seek for EncryptedReader<R, C> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
            SeekFrom::End(d) => self.plaintext_len.checked_add_signed(d),
        };
        self.pos = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek to a negative offset")
        })?;
        Ok(self.pos)
    }
}
