//! GGUF metadata reader
//!
//! Reads the header and key-value table of a GGUF container to recover the
//! defaults a model ships with (context length, chat template). Tensor info and
//! tensor data are never read, so this stays cheap on multi-gigabyte files.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Metadata key holding the Jinja chat template
pub const CHAT_TEMPLATE_KEY: &str = "tokenizer.chat_template";

/// Metadata key naming the model architecture (prefix of most other keys)
pub const ARCHITECTURE_KEY: &str = "general.architecture";

const CONTEXT_LENGTH_SUFFIX: &str = ".context_length";

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: u64 = 24;

/// Upper bound for a single metadata string. Anything larger is a corrupt length prefix.
const MAX_STRING_LEN: u64 = 64 * 1024 * 1024;

/// Arrays of arrays nested deeper than this are rejected
const MAX_ARRAY_DEPTH: usize = 64;

/// Errors that can occur while reading GGUF metadata
#[derive(Debug, Error)]
pub enum GgufError {
    #[error("Model file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to read model file: {0}")]
    Io(#[source] io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("GGUF file is truncated")]
    Truncated,

    #[error("Malformed GGUF metadata: {0}")]
    Malformed(String),
}

impl GgufError {
    /// True for errors caused by the file contents rather than by the filesystem
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            GgufError::InvalidMagic(_)
                | GgufError::UnsupportedVersion(_)
                | GgufError::Truncated
                | GgufError::Malformed(_)
        )
    }
}

impl From<io::Error> for GgufError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            GgufError::Truncated
        } else {
            GgufError::Io(e)
        }
    }
}

/// Fixed-size header at the start of every GGUF file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufHeader {
    /// GGUF format version
    pub version: u32,
    /// Number of tensors in the model
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_kv_count: u64,
}

/// Defaults recovered from a model file.
///
/// `None` means the key is not present in the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelMetadata {
    /// Training context length in tokens (`<arch>.context_length`)
    pub context_size: Option<u64>,
    /// Chat template string (`tokenizer.chat_template`)
    pub chat_template: Option<String>,
    /// Model architecture (`general.architecture`)
    pub architecture: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
    String,
    Array,
    U64,
    I64,
    F64,
}

impl ValueType {
    fn from_u32(value: u32) -> Result<Self, GgufError> {
        Ok(match value {
            0 => ValueType::U8,
            1 => ValueType::I8,
            2 => ValueType::U16,
            3 => ValueType::I16,
            4 => ValueType::U32,
            5 => ValueType::I32,
            6 => ValueType::F32,
            7 => ValueType::Bool,
            8 => ValueType::String,
            9 => ValueType::Array,
            10 => ValueType::U64,
            11 => ValueType::I64,
            12 => ValueType::F64,
            other => return Err(GgufError::Malformed(format!("unknown value type {other}"))),
        })
    }

    fn fixed_size(self) -> Option<u64> {
        match self {
            ValueType::U8 | ValueType::I8 | ValueType::Bool => Some(1),
            ValueType::U16 | ValueType::I16 => Some(2),
            ValueType::U32 | ValueType::I32 | ValueType::F32 => Some(4),
            ValueType::U64 | ValueType::I64 | ValueType::F64 => Some(8),
            ValueType::String | ValueType::Array => None,
        }
    }

    fn is_integer(self) -> bool {
        matches!(
            self,
            ValueType::U8
                | ValueType::I8
                | ValueType::U16
                | ValueType::I16
                | ValueType::U32
                | ValueType::I32
                | ValueType::U64
                | ValueType::I64
        )
    }
}

/// Little-endian cursor over the metadata section.
///
/// Tracks its own position so skips past the end of the file are reported as
/// truncation instead of silently seeking into nothing.
struct MetadataCursor<R> {
    inner: R,
    pos: u64,
    len: u64,
}

impl<R: Read + Seek> MetadataCursor<R> {
    fn new(mut inner: R) -> Result<Self, GgufError> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, pos: 0, len })
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], GgufError> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf)?;
        self.pos += N as u64;
        Ok(buf)
    }

    fn read_u32(&mut self) -> Result<u32, GgufError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> Result<u64, GgufError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn skip(&mut self, n: u64) -> Result<(), GgufError> {
        let target = self.pos.checked_add(n).ok_or(GgufError::Truncated)?;
        if target > self.len {
            return Err(GgufError::Truncated);
        }
        let offset = i64::try_from(n).map_err(|_| GgufError::Truncated)?;
        self.inner.seek(SeekFrom::Current(offset))?;
        self.pos = target;
        Ok(())
    }

    fn read_string_len(&mut self) -> Result<u64, GgufError> {
        let len = self.read_u64()?;
        if len > MAX_STRING_LEN {
            return Err(GgufError::Malformed(format!("string length {len} out of range")));
        }
        if self.pos + len > self.len {
            return Err(GgufError::Truncated);
        }
        Ok(len)
    }

    fn read_string(&mut self) -> Result<String, GgufError> {
        let len = self.read_string_len()?;
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf)?;
        self.pos += len;
        String::from_utf8(buf).map_err(|_| GgufError::Malformed("string is not valid UTF-8".into()))
    }

    /// Reads an integer value, returning `None` for negative values
    fn read_unsigned(&mut self, ty: ValueType) -> Result<Option<u64>, GgufError> {
        Ok(match ty {
            ValueType::U8 => Some(u64::from(self.read_array::<1>()?[0])),
            ValueType::I8 => u64::try_from(i8::from_le_bytes(self.read_array()?)).ok(),
            ValueType::U16 => Some(u64::from(u16::from_le_bytes(self.read_array()?))),
            ValueType::I16 => u64::try_from(i16::from_le_bytes(self.read_array()?)).ok(),
            ValueType::U32 => Some(u64::from(self.read_u32()?)),
            ValueType::I32 => u64::try_from(i32::from_le_bytes(self.read_array()?)).ok(),
            ValueType::U64 => Some(self.read_u64()?),
            ValueType::I64 => u64::try_from(i64::from_le_bytes(self.read_array()?)).ok(),
            other => {
                self.skip_value(other, 0)?;
                None
            }
        })
    }

    fn skip_value(&mut self, ty: ValueType, depth: usize) -> Result<(), GgufError> {
        if let Some(size) = ty.fixed_size() {
            return self.skip(size);
        }
        match ty {
            ValueType::String => {
                let len = self.read_string_len()?;
                self.skip(len)
            }
            ValueType::Array => {
                if depth >= MAX_ARRAY_DEPTH {
                    return Err(GgufError::Malformed("array nesting too deep".into()));
                }
                let elem = ValueType::from_u32(self.read_u32()?)?;
                let count = self.read_u64()?;
                match elem.fixed_size() {
                    Some(size) => {
                        let total = size
                            .checked_mul(count)
                            .ok_or_else(|| GgufError::Malformed(format!("array of {count} elements")))?;
                        self.skip(total)
                    }
                    None => {
                        // every element needs at least an 8 byte length prefix
                        if count > (self.len - self.pos) / 8 {
                            return Err(GgufError::Truncated);
                        }
                        for _ in 0..count {
                            self.skip_value(elem, depth + 1)?;
                        }
                        Ok(())
                    }
                }
            }
            _ => unreachable!("fixed-size types handled above"),
        }
    }

    fn read_header(&mut self) -> Result<GgufHeader, GgufError> {
        if self.len < HEADER_LEN {
            return Err(GgufError::Truncated);
        }

        let magic = self.read_u32()?;
        if magic != GGUF_MAGIC {
            return Err(GgufError::InvalidMagic(magic));
        }

        // GGUF v2 and v3 are supported
        let version = self.read_u32()?;
        if !(2..=3).contains(&version) {
            return Err(GgufError::UnsupportedVersion(version));
        }

        let tensor_count = self.read_u64()?;
        let metadata_kv_count = self.read_u64()?;

        Ok(GgufHeader {
            version,
            tensor_count,
            metadata_kv_count,
        })
    }

    fn read_metadata(&mut self) -> Result<ModelMetadata, GgufError> {
        let header = self.read_header()?;

        let mut architecture = None;
        let mut chat_template = None;
        let mut context_lengths: Vec<(String, u64)> = Vec::new();

        for _ in 0..header.metadata_kv_count {
            let key = self.read_string()?;
            let ty = ValueType::from_u32(self.read_u32()?)?;

            if key == ARCHITECTURE_KEY && ty == ValueType::String {
                architecture = Some(self.read_string()?);
            } else if key == CHAT_TEMPLATE_KEY && ty == ValueType::String {
                chat_template = Some(self.read_string()?);
            } else if key.ends_with(CONTEXT_LENGTH_SUFFIX) && ty.is_integer() {
                if let Some(value) = self.read_unsigned(ty)? {
                    context_lengths.push((key, value));
                }
            } else {
                self.skip_value(ty, 0)?;
            }
        }

        // Prefer `<arch>.context_length`; fall back to any context length key.
        let context_size = architecture
            .as_deref()
            .and_then(|arch| {
                let wanted = format!("{arch}{CONTEXT_LENGTH_SUFFIX}");
                context_lengths.iter().find(|(key, _)| *key == wanted)
            })
            .or_else(|| context_lengths.first())
            .map(|(_, value)| *value);

        Ok(ModelMetadata {
            context_size,
            chat_template: chat_template.filter(|t| !t.is_empty()),
            architecture,
        })
    }
}

fn open(path: &Path) -> Result<BufReader<File>, GgufError> {
    match File::open(path) {
        Ok(file) => Ok(BufReader::new(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(GgufError::NotFound(path.to_path_buf())),
        Err(e) => Err(GgufError::Io(e)),
    }
}

/// Validates that a file is a GGUF container and returns its header.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufHeader, GgufError> {
    let mut cursor = MetadataCursor::new(open(path.as_ref())?)?;
    cursor.read_header()
}

/// Reads the metadata defaults (context length, chat template) from a GGUF file.
///
/// # Returns
/// * `Ok(ModelMetadata)` - fields absent from the file are `None`
/// * `Err(GgufError::NotFound)` - the path does not exist
/// * `Err(_)` where `is_format_error()` - the file is not a valid or complete GGUF container
pub fn read_metadata<P: AsRef<Path>>(path: P) -> Result<ModelMetadata, GgufError> {
    let path = path.as_ref();
    let mut cursor = MetadataCursor::new(open(path)?)?;
    let metadata = cursor.read_metadata()?;

    tracing::debug!(
        "GGUF metadata for {}: arch={:?} context={:?} template={}",
        path.display(),
        metadata.architecture,
        metadata.context_size,
        metadata.chat_template.is_some()
    );

    Ok(metadata)
}
