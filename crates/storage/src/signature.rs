//! Binary signature (magic byte) checks for uploads.
//!
//! The extension of an upload only tells us what the client *claims* it is.
//! Before anything touches the disk, the first few bytes of the stream are
//! compared against the signature that extension promises.

use crate::error::{ErrorKind, Result};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, Chain};

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];
const GZIP_MAGIC: [u8; 2] = [0x1F, 0x8B];
const BZIP2_MAGIC: [u8; 3] = [0x42, 0x5A, 0x68];
const XZ_MAGIC: [u8; 6] = [0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const SEVEN_ZIP_MAGIC: [u8; 6] = [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];

/// Longest signature we ever need to look at.
pub const MAX_SIGNATURE_LEN: usize = 6;

/// An artifact format the store knows how to recognise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    /// Zip archives, including Android packages (.zip, .apk, .jar)
    Zip,
    /// Gzip (.gz, .tgz)
    Gzip,
    /// Bzip2 (.bz2)
    Bzip2,
    /// XZ/LZMA (.xz)
    Xz,
    /// Zstd (.zst)
    Zstd,
    /// 7-Zip (.7z)
    SevenZip,
    /// Raw partition or firmware images (.img, .bin). No signature to check.
    Raw,
}
impl Format {
    /// Look up the format for an extension (with or without the leading dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "zip" | "apk" | "jar" => Some(Self::Zip),
            "gz" | "tgz" => Some(Self::Gzip),
            "bz2" => Some(Self::Bzip2),
            "xz" => Some(Self::Xz),
            "zst" => Some(Self::Zstd),
            "7z" => Some(Self::SevenZip),
            "img" | "bin" => Some(Self::Raw),
            _ => None,
        }
    }

    /// Magic bytes every file of this format starts with.
    pub fn magic(&self) -> &'static [u8] {
        match self {
            Self::Zip => &ZIP_MAGIC,
            Self::Gzip => &GZIP_MAGIC,
            Self::Bzip2 => &BZIP2_MAGIC,
            Self::Xz => &XZ_MAGIC,
            Self::Zstd => &ZSTD_MAGIC,
            Self::SevenZip => &SEVEN_ZIP_MAGIC,
            Self::Raw => &[],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
            Self::SevenZip => "7z",
            Self::Raw => "raw",
        }
    }

    /// MIME type to serve files of this format with.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Zip => "application/zip",
            Self::Gzip => "application/gzip",
            Self::Bzip2 => "application/x-bzip2",
            Self::Xz => "application/x-xz",
            Self::Zstd => "application/zstd",
            Self::SevenZip => "application/x-7z-compressed",
            Self::Raw => "application/octet-stream",
        }
    }

    /// Returns `true` if `head` starts with this format's signature.
    ///
    /// A head shorter than the signature never matches, which also rejects
    /// empty uploads for every format that has one.
    pub fn matches(&self, head: &[u8]) -> bool {
        head.starts_with(self.magic())
    }
}

/// An upload stream whose first bytes can be inspected without losing them.
///
/// Reads just enough of the inner reader to compare signatures, then
/// [`into_reader`](Self::into_reader) replays the buffered head followed by
/// the rest of the stream.
pub struct PeekableUpload<R> {
    inner: R,
    buffer: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PeekableUpload<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, buffer: Vec::new() }
    }

    /// Buffer up to `limit` bytes from the start of the stream.
    ///
    /// Returns fewer bytes only if the stream ends first.
    pub async fn peek(&mut self, limit: usize) -> Result<&[u8]> {
        if self.buffer.len() < limit {
            let needed = (limit - self.buffer.len()) as u64;
            (&mut self.inner).take(needed).read_to_end(&mut self.buffer).await.map_err(ErrorKind::Io)?;
        }
        Ok(&self.buffer[..self.buffer.len().min(limit)])
    }

    /// Check the head of the stream against `format`.
    pub async fn verify(&mut self, format: Format) -> Result<()> {
        let magic = format.magic();
        if magic.is_empty() {
            return Ok(());
        }
        let head = self.peek(magic.len()).await?;
        if !format.matches(head) {
            tracing::warn!(format = format.name(), head = ?head, "Upload signature mismatch");
            exn::bail!(ErrorKind::SignatureMismatch(format.name().to_string()));
        }
        Ok(())
    }

    pub fn into_reader(self) -> Chain<Cursor<Vec<u8>>, R> {
        Cursor::new(self.buffer).chain(self.inner)
    }
}
