//! Firmware images in the Motorola S-record format.
//!
//! An image is a sorted list of non-overlapping sections. Data records that continue
//! where a previous record ended are merged into the same section.

pub mod error;

use std::path::Path;

use tracing::debug;

use crate::Result;

pub use error::Error;

/// Data bytes per record written by [`Image::dump`]
const DUMP_RECORD_LEN: usize = 32;

/// Contiguous block of image data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Section {
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// First address after the section.
    pub fn end(&self) -> u64 {
        self.address as u64 + self.data.len() as u64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Image {
    sections: Vec<Section>,
    header: Vec<u8>,
    entry: Option<u32>,
    terminator: bool,
}

impl Image {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read and parse an S-record file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let image = Self::parse(&text)?;
        debug!(
            "Loaded {}: {} sections, {} bytes",
            path.as_ref().display(),
            image.sections.len(),
            image.size()
        );
        Ok(image)
    }

    pub fn parse(text: &str) -> std::result::Result<Self, Error> {
        let mut image = Self::new();

        for (i, line) in text.lines().enumerate() {
            let line_no = i + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let mut chars = line.chars();
            if chars.next() != Some('S') {
                return Err(Error::InvalidRecord { line: line_no });
            }
            let kind = chars.next().ok_or(Error::InvalidRecord { line: line_no })?;
            let bytes = hex::decode(chars.as_str()).map_err(|_| Error::InvalidRecord { line: line_no })?;

            // count, payload, checksum
            if bytes.len() < 2 || bytes[0] as usize != bytes.len() - 1 {
                return Err(Error::InvalidRecord { line: line_no });
            }
            let sum = bytes[..bytes.len() - 1]
                .iter()
                .fold(0u8, |acc, &b| acc.wrapping_add(b));
            if !sum != bytes[bytes.len() - 1] {
                return Err(Error::Checksum { line: line_no });
            }
            let payload = &bytes[1..bytes.len() - 1];

            let address_len = match kind {
                '0' | '1' | '5' | '9' => 2,
                '2' | '6' | '8' => 3,
                '3' | '7' => 4,
                _ => return Err(Error::UnsupportedRecord { line: line_no, kind }),
            };
            if payload.len() < address_len {
                return Err(Error::InvalidRecord { line: line_no });
            }
            let address = payload[..address_len]
                .iter()
                .fold(0u32, |acc, &b| (acc << 8) | b as u32);
            let data = &payload[address_len..];

            match kind {
                '0' => image.header = data.to_vec(),
                '1' | '2' | '3' => image.append(address, data),
                // record counts carry no data
                '5' | '6' => {}
                _ => {
                    image.entry = Some(address);
                    image.terminator |= kind == '7';
                }
            }
        }

        Ok(image)
    }

    /// Sections sorted by address.
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// True if the image carried an S7 (32 bit) termination record.
    pub fn has_terminator(&self) -> bool {
        self.terminator
    }

    pub fn entry(&self) -> Option<u32> {
        self.entry
    }

    /// Total number of data bytes.
    pub fn size(&self) -> usize {
        self.sections.iter().map(Section::size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Lowest start and highest end over all sections.
    pub fn extent(&self) -> Option<(u32, u64)> {
        let start = self.sections.first()?.address;
        let end = self.sections.iter().map(Section::end).max()?;
        Some((start, end))
    }

    /// Write `data` at `address`, merging with every section it touches or continues. Newer bytes win on overlap.
    pub fn append(&mut self, address: u32, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let start = address as u64;
        let end = start + data.len() as u64;

        let (touching, mut rest): (Vec<Section>, Vec<Section>) = std::mem::take(&mut self.sections)
            .into_iter()
            .partition(|s| s.address as u64 <= end && s.end() >= start);

        let merged_start = touching.iter().map(|s| s.address as u64).chain([start]).min().unwrap_or(start);
        let merged_end = touching.iter().map(Section::end).chain([end]).max().unwrap_or(end);

        let mut merged = vec![0u8; (merged_end - merged_start) as usize];
        for section in &touching {
            let offset = (section.address as u64 - merged_start) as usize;
            merged[offset..offset + section.size()].copy_from_slice(&section.data);
        }
        let offset = (start - merged_start) as usize;
        merged[offset..offset + data.len()].copy_from_slice(data);

        rest.push(Section {
            address: merged_start as u32,
            data: merged,
        });
        rest.sort_by_key(|s| s.address);
        self.sections = rest;
    }

    /// Serialize as S0, S3 data records and an S7 terminator.
    pub fn to_srec(&self) -> String {
        let mut out = String::new();
        push_record(&mut out, '0', &[0, 0], &self.header);
        for section in &self.sections {
            for (i, chunk) in section.data.chunks(DUMP_RECORD_LEN).enumerate() {
                let address = section.address.wrapping_add((i * DUMP_RECORD_LEN) as u32);
                push_record(&mut out, '3', &address.to_be_bytes(), chunk);
            }
        }
        push_record(&mut out, '7', &self.entry.unwrap_or(0).to_be_bytes(), &[]);
        out
    }

    pub fn dump(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_srec())?;
        debug!("Dumped {} bytes to {}", self.size(), path.as_ref().display());
        Ok(())
    }
}

fn push_record(out: &mut String, kind: char, address: &[u8], data: &[u8]) {
    let count = (address.len() + data.len() + 1) as u8;
    let sum = address
        .iter()
        .chain(data)
        .fold(count, |acc, &b| acc.wrapping_add(b));
    out.push_str(&format!(
        "S{}{:02X}{}{}{:02X}\n",
        kind,
        count,
        hex::encode_upper(address),
        hex::encode_upper(data),
        !sum
    ));
}
