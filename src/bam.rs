//! Minimal reader for BGZF-compressed BAM alignments: the header, the
//! reference dictionary and per-record reference/flag statistics.

use std::collections::BTreeMap;
use std::io::Read;

use flate2::read::MultiGzDecoder;
use thiserror::Error;

/// Empty BGZF block every well-formed BAM file ends with.
pub const BGZF_EOF: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43, 0x02,
    0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const MAGIC: &[u8; 4] = b"BAM\x01";
const FLAG_UNMAPPED: u16 = 0x4;
const FLAG_SECONDARY: u16 = 0x100;
const FLAG_SUPPLEMENTARY: u16 = 0x800;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BamError {
    #[error("not BGZF/gzip compressed: {0}")]
    Decompress(String),
    #[error("missing BAM magic")]
    BadMagic,
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("invalid {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub name: String,
    pub length: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BamHeader {
    pub text: String,
    pub references: Vec<Reference>,
}

impl BamHeader {
    /// `SO` tag of the `@HD` line.
    pub fn sort_order(&self) -> Option<&str> {
        self.text
            .lines()
            .find(|line| line.starts_with("@HD"))
            .and_then(|line| tag_value(line, "SO"))
    }

    /// Tag maps of every `@PG` line, in header order.
    pub fn programs(&self) -> Vec<BTreeMap<&str, &str>> {
        self.text
            .lines()
            .filter(|line| line.starts_with("@PG"))
            .map(|line| {
                line.split('\t')
                    .skip(1)
                    .filter_map(|field| field.split_once(':'))
                    .collect()
            })
            .collect()
    }
}

fn tag_value<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    line.split('\t')
        .skip(1)
        .filter_map(|field| field.split_once(':'))
        .find(|(name, _)| *name == tag)
        .map(|(_, value)| value)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadStats {
    /// Primary records (secondary and supplementary excluded).
    pub primary: u64,
    pub unmapped: u64,
    /// Mapped primary records per reference name.
    pub mapped_by_reference: BTreeMap<String, u64>,
}

impl ReadStats {
    pub fn mapped_to<'a>(&self, references: impl IntoIterator<Item = &'a String>) -> u64 {
        references
            .into_iter()
            .filter_map(|name| self.mapped_by_reference.get(name))
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BamSummary {
    pub header: BamHeader,
    pub stats: ReadStats,
}

pub fn has_eof_marker(bytes: &[u8]) -> bool {
    bytes.ends_with(&BGZF_EOF)
}

/// Structural integrity check: compressed stream, magic, header and the
/// trailing EOF block.
pub fn quickcheck(bytes: &[u8]) -> Result<(), BamError> {
    if !has_eof_marker(bytes) {
        return Err(BamError::Truncated("file: no BGZF EOF block"));
    }
    let data = decompress(bytes)?;
    let mut cursor = Cursor::new(&data);
    read_header(&mut cursor).map(|_| ())
}

pub fn read_bam(bytes: &[u8]) -> Result<BamSummary, BamError> {
    let data = decompress(bytes)?;
    let mut cursor = Cursor::new(&data);
    let header = read_header(&mut cursor)?;

    let mut stats = ReadStats::default();
    while !cursor.is_empty() {
        let block_size = cursor.i32("record length")?;
        let block_size =
            usize::try_from(block_size).map_err(|_| BamError::Invalid("record length"))?;
        let record = cursor.take(block_size, "alignment record")?;
        if record.len() < 16 {
            return Err(BamError::Truncated("alignment record"));
        }
        let ref_id = i32::from_le_bytes([record[0], record[1], record[2], record[3]]);
        let flag = u16::from_le_bytes([record[14], record[15]]);
        if flag & (FLAG_SECONDARY | FLAG_SUPPLEMENTARY) != 0 {
            continue;
        }
        stats.primary += 1;
        let reference = usize::try_from(ref_id)
            .ok()
            .and_then(|index| header.references.get(index));
        match reference {
            Some(reference) if flag & FLAG_UNMAPPED == 0 => {
                *stats
                    .mapped_by_reference
                    .entry(reference.name.clone())
                    .or_default() += 1;
            }
            _ => stats.unmapped += 1,
        }
    }

    Ok(BamSummary { header, stats })
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, BamError> {
    let mut data = Vec::new();
    MultiGzDecoder::new(bytes)
        .read_to_end(&mut data)
        .map_err(|err| BamError::Decompress(err.to_string()))?;
    Ok(data)
}

fn read_header(cursor: &mut Cursor<'_>) -> Result<BamHeader, BamError> {
    if cursor.take(4, "magic")? != MAGIC {
        return Err(BamError::BadMagic);
    }
    let l_text = cursor.len_field("header text length")?;
    let text = cursor.take(l_text, "header text")?;
    let text = String::from_utf8_lossy(text)
        .trim_end_matches('\0')
        .to_string();

    let n_ref = cursor.len_field("reference count")?;
    let mut references = Vec::with_capacity(n_ref.min(4096));
    for _ in 0..n_ref {
        let l_name = cursor.len_field("reference name length")?;
        let name = cursor.take(l_name, "reference name")?;
        let name = std::str::from_utf8(name)
            .map_err(|_| BamError::Invalid("reference name"))?
            .trim_end_matches('\0')
            .to_string();
        let length = cursor.i32("reference length")?;
        references.push(Reference {
            name,
            length: u32::try_from(length).map_err(|_| BamError::Invalid("reference length"))?,
        });
    }
    Ok(BamHeader { text, references })
}

struct Cursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn is_empty(&self) -> bool {
        self.position >= self.data.len()
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], BamError> {
        let end = self
            .position
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or(BamError::Truncated(what))?;
        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn i32(&mut self, what: &'static str) -> Result<i32, BamError> {
        let bytes = self.take(4, what)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn len_field(&mut self, what: &'static str) -> Result<usize, BamError> {
        usize::try_from(self.i32(what)?).map_err(|_| BamError::Invalid(what))
    }
}
