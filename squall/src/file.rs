//! File stream state machines
//!
//! A read handle walks a file sector by sector: the sector offset
//! table is decrypted first (key minus one), then each touched sector
//! is read, checksummed, decrypted, and unpacked independently. A
//! write handle buffers one sector at a time, seals it through the
//! codec, and stages everything in memory until `finish` hands the
//! assembled region to the archive for commit.

use std::io::{Cursor, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use md5::{Digest, Md5};

use crate::compression::{self, compress, decompress, CompressionMethod};
use crate::crypto::{decrypt_data, encrypt_data};
use crate::error::{Error, Result};
use crate::tables::BlockFlags;

/// Read-side state for one open file
#[derive(Debug)]
pub(crate) struct ReadState {
    /// Absolute offset of the file's data region in the backing file
    file_pos: u64,
    compressed_size: u64,
    file_size: u64,
    flags: BlockFlags,
    /// Decryption key, already FIX_KEY-adjusted; unused when clear
    key: u32,
    sector_size: u64,
    position: u64,
    verify_checksums: bool,
    sector_offsets: Option<Vec<u32>>,
    sector_crcs: Option<Vec<u32>>,
    cached_sector: Option<(usize, Vec<u8>)>,
}

impl ReadState {
    pub(crate) fn new(
        file_pos: u64,
        compressed_size: u64,
        file_size: u64,
        flags: BlockFlags,
        key: u32,
        sector_size: u64,
        verify_checksums: bool,
    ) -> Self {
        ReadState {
            file_pos,
            compressed_size,
            file_size,
            flags,
            key,
            sector_size,
            position: 0,
            verify_checksums,
            sector_offsets: None,
            sector_crcs: None,
            cached_sector: None,
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.file_size
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    /// Moves the read position. The result is clamped to the file
    /// size; seeking before the start is an error.
    pub(crate) fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.position) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.file_size) + i128::from(delta),
        };
        if target < 0 {
            return Err(Error::NegativeSeek);
        }
        self.position = (target as u64).min(self.file_size);
        Ok(self.position)
    }

    /// Reads up to `buf.len()` bytes at the current position.
    ///
    /// Short reads near the end of the file and empty reads at EOF
    /// are success, not errors.
    pub(crate) fn read<R: Read + Seek>(&mut self, reader: &mut R, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.position >= self.file_size {
            return Ok(0);
        }
        if !self.flags.is_compressed() && !self.flags.contains(BlockFlags::ENCRYPTED) {
            return self.read_plain(reader, buf);
        }

        let span = self.sector_span();
        let mut copied = 0;
        while copied < buf.len() && self.position < self.file_size {
            let index = (self.position / span) as usize;
            let start = (self.position % span) as usize;
            let sector = self.sector_data(reader, index)?;
            if start >= sector.len() {
                break;
            }
            let take = (buf.len() - copied).min(sector.len() - start);
            buf[copied..copied + take].copy_from_slice(&sector[start..start + take]);
            copied += take;
            self.position += take as u64;
        }
        Ok(copied)
    }

    /// Unencrypted, uncompressed files are read straight from their
    /// data region without the sector machinery.
    fn read_plain<R: Read + Seek>(&mut self, reader: &mut R, buf: &mut [u8]) -> Result<usize> {
        let take = u64::min(self.file_size - self.position, buf.len() as u64) as usize;
        reader.seek(SeekFrom::Start(self.file_pos + self.position))?;
        reader.read_exact(&mut buf[..take])?;
        self.position += take as u64;
        Ok(take)
    }

    /// One sector's worth of logical positions; single-unit files are
    /// one sector however large they are.
    fn sector_span(&self) -> u64 {
        if self.flags.contains(BlockFlags::SINGLE_UNIT) {
            self.file_size.max(1)
        } else {
            self.sector_size
        }
    }

    fn sector_data<R: Read + Seek>(&mut self, reader: &mut R, index: usize) -> Result<&[u8]> {
        if self.cached_sector.as_ref().map(|(cached, _)| *cached) != Some(index) {
            let data = self.load_sector(reader, index)?;
            self.cached_sector = Some((index, data));
        }
        Ok(self
            .cached_sector
            .as_ref()
            .map(|(_, data)| data.as_slice())
            .unwrap_or_default())
    }

    fn load_sector<R: Read + Seek>(&mut self, reader: &mut R, index: usize) -> Result<Vec<u8>> {
        let span = self.sector_span();
        let expected = self
            .file_size
            .saturating_sub(index as u64 * span)
            .min(span) as usize;

        let (start, stored) = if self.flags.contains(BlockFlags::SINGLE_UNIT) {
            (0, self.compressed_size as usize)
        } else if self.flags.is_compressed() {
            self.ensure_sector_offsets(reader)?;
            let offsets = self.sector_offsets.as_deref().unwrap_or_default();
            let start = offsets[index] as usize;
            let end = offsets[index + 1] as usize;
            (start as u64, end - start)
        } else {
            // Encrypted but uncompressed: sector positions are
            // computable, no offset table is stored.
            (index as u64 * span, expected)
        };

        reader.seek(SeekFrom::Start(self.file_pos + start))?;
        let mut raw = vec![0u8; stored];
        reader.read_exact(&mut raw)?;

        if let Some(crcs) = &self.sector_crcs {
            let actual = crc32fast::hash(&raw);
            if crcs.get(index).copied() != Some(actual) {
                return Err(Error::corrupt(format!(
                    "sector {index} checksum mismatch (computed {actual:08X})"
                )));
            }
        }

        if self.flags.contains(BlockFlags::ENCRYPTED) {
            decrypt_data(&mut raw, self.key.wrapping_add(index as u32));
        }

        if raw.len() == expected {
            return Ok(raw);
        }
        if raw.len() > expected || !self.flags.is_compressed() {
            return Err(Error::corrupt(format!(
                "sector {index} holds {} bytes where at most {expected} fit",
                raw.len()
            )));
        }

        // Imploded files carry no method byte; everything else stored
        // smaller than it unpacks leads with one.
        if self.flags.contains(BlockFlags::IMPLODE) && !self.flags.contains(BlockFlags::COMPRESS) {
            return decompress(&raw, compression::flags::PKWARE, expected);
        }
        let Some((&method, payload)) = raw.split_first() else {
            return Err(Error::corrupt(format!("sector {index} is empty")));
        };
        decompress(payload, method, expected)
    }

    fn ensure_sector_offsets<R: Read + Seek>(&mut self, reader: &mut R) -> Result<()> {
        if self.sector_offsets.is_some() {
            return Ok(());
        }

        let sector_count = self.file_size.div_ceil(self.sector_span()) as usize;
        let has_crcs = self.flags.contains(BlockFlags::SECTOR_CRC);
        let entries = sector_count + 1 + usize::from(has_crcs);
        let table_len = entries * 4;
        if table_len as u64 > self.compressed_size {
            return Err(Error::corrupt(
                "sector offset table extends past the stored data",
            ));
        }

        reader.seek(SeekFrom::Start(self.file_pos))?;
        let mut raw = vec![0u8; table_len];
        reader.read_exact(&mut raw)?;
        if self.flags.contains(BlockFlags::ENCRYPTED) {
            decrypt_data(&mut raw, self.key.wrapping_sub(1));
        }

        let mut cursor = Cursor::new(&raw);
        let mut offsets = Vec::with_capacity(entries);
        for _ in 0..entries {
            offsets.push(cursor.read_u32::<LittleEndian>()?);
        }
        if (offsets[0] as usize) < table_len
            || offsets.windows(2).any(|pair| pair[0] > pair[1])
            || u64::from(offsets[entries - 1]) > self.compressed_size
        {
            return Err(Error::corrupt("sector offset table is inconsistent"));
        }

        if has_crcs && self.verify_checksums {
            self.sector_crcs = Some(Self::load_crc_sector(
                reader,
                self.file_pos,
                &offsets,
                sector_count,
            )?);
        }
        self.sector_offsets = Some(offsets);
        Ok(())
    }

    /// The checksum table rides behind the data sectors as one extra
    /// pseudo-sector: a u32 per data sector, stored raw or compressed
    /// but never encrypted.
    fn load_crc_sector<R: Read + Seek>(
        reader: &mut R,
        file_pos: u64,
        offsets: &[u32],
        sector_count: usize,
    ) -> Result<Vec<u32>> {
        let start = offsets[sector_count] as usize;
        let end = offsets[sector_count + 1] as usize;
        let expected = sector_count * 4;

        reader.seek(SeekFrom::Start(file_pos + start as u64))?;
        let mut raw = vec![0u8; end - start];
        reader.read_exact(&mut raw)?;
        let data = if raw.len() < expected {
            let Some((&method, payload)) = raw.split_first() else {
                return Err(Error::corrupt("sector checksum table is empty"));
            };
            decompress(payload, method, expected)?
        } else {
            raw
        };

        let mut cursor = Cursor::new(&data);
        let mut crcs = Vec::with_capacity(sector_count);
        for _ in 0..sector_count {
            crcs.push(cursor.read_u32::<LittleEndian>()?);
        }
        Ok(crcs)
    }
}

/// Write-side state for one open file
#[derive(Debug)]
pub(crate) struct WriteState {
    /// Size declared at creation; `finish` fails if the total written
    /// differs
    file_size: u64,
    written: u64,
    flags: BlockFlags,
    compression: CompressionMethod,
    sector_size: u64,
    buffer: Vec<u8>,
    sectors: Vec<Vec<u8>>,
    crc: crc32fast::Hasher,
    md5: Md5,
}

impl WriteState {
    pub(crate) fn new(
        file_size: u64,
        flags: BlockFlags,
        compression: CompressionMethod,
        sector_size: u64,
    ) -> Self {
        WriteState {
            file_size,
            written: 0,
            flags,
            compression,
            sector_size,
            buffer: Vec::new(),
            sectors: Vec::new(),
            crc: crc32fast::Hasher::new(),
            md5: Md5::new(),
        }
    }

    pub(crate) fn declared_size(&self) -> u64 {
        self.file_size
    }

    pub(crate) fn written(&self) -> u64 {
        self.written
    }

    /// Appends at the high-water mark. Writing zero bytes is a no-op;
    /// writing past the declared size fails without buffering.
    pub(crate) fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let total = self.written + data.len() as u64;
        if total > self.file_size {
            return Err(Error::SizeMismatch {
                declared: self.file_size,
                written: total,
            });
        }
        self.crc.update(data);
        self.md5.update(data);
        self.written = total;

        if self.flags.contains(BlockFlags::SINGLE_UNIT) {
            self.buffer.extend_from_slice(data);
            return Ok(());
        }
        let mut rest = data;
        while !rest.is_empty() {
            let room = self.sector_size as usize - self.buffer.len();
            let take = room.min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buffer.len() == self.sector_size as usize {
                self.seal_buffer()?;
            }
        }
        Ok(())
    }

    /// Seals any partial sector and hands the staged file over for
    /// commit. Nothing reaches the archive until the caller writes
    /// the returned region.
    pub(crate) fn finish(&mut self) -> Result<StagedFile> {
        if self.written != self.file_size {
            return Err(Error::SizeMismatch {
                declared: self.file_size,
                written: self.written,
            });
        }
        if !self.buffer.is_empty() {
            self.seal_buffer()?;
        }
        Ok(StagedFile {
            flags: self.flags,
            file_size: self.file_size,
            sectors: std::mem::take(&mut self.sectors),
            content_crc32: std::mem::take(&mut self.crc).finalize(),
            content_md5: self.md5.finalize_reset().into(),
        })
    }

    fn seal_buffer(&mut self) -> Result<()> {
        let raw = std::mem::take(&mut self.buffer);
        let sealed = self.seal(raw)?;
        self.sectors.push(sealed);
        Ok(())
    }

    /// Runs one raw sector through the codec; the sector is stored
    /// raw when compression does not shrink it.
    fn seal(&self, raw: Vec<u8>) -> Result<Vec<u8>> {
        let mask = self.compression.mask();
        if !self.flags.contains(BlockFlags::COMPRESS) || mask == 0 || raw.is_empty() {
            return Ok(raw);
        }
        let payload = compress(&raw, mask)?;
        if payload.len() + 1 < raw.len() {
            let mut sector = Vec::with_capacity(payload.len() + 1);
            sector.push(mask);
            sector.extend_from_slice(&payload);
            Ok(sector)
        } else {
            Ok(raw)
        }
    }
}

/// A finished but uncommitted file: sealed sectors plus the content
/// digests the attributes file tracks
#[derive(Debug)]
pub(crate) struct StagedFile {
    pub(crate) flags: BlockFlags,
    pub(crate) file_size: u64,
    sectors: Vec<Vec<u8>>,
    pub(crate) content_crc32: u32,
    pub(crate) content_md5: [u8; 16],
}

impl StagedFile {
    /// Assembles the on-disk data region: sector offset table (when
    /// one is stored), encrypted sectors, and the trailing checksum
    /// pseudo-sector. Returns the region together with the final
    /// flags.
    pub(crate) fn into_region(mut self, key: u32) -> (Vec<u8>, BlockFlags) {
        if self.file_size == 0 {
            self.flags.remove(
                BlockFlags::COMPRESS
                    | BlockFlags::IMPLODE
                    | BlockFlags::ENCRYPTED
                    | BlockFlags::SECTOR_CRC
                    | BlockFlags::SINGLE_UNIT,
            );
            return (Vec::new(), self.flags);
        }

        if self.flags.contains(BlockFlags::ENCRYPTED) {
            for (index, sector) in self.sectors.iter_mut().enumerate() {
                encrypt_data(sector, key.wrapping_add(index as u32));
            }
        }

        let needs_table =
            self.flags.is_compressed() && !self.flags.contains(BlockFlags::SINGLE_UNIT);
        if !needs_table {
            // Without an offset table there is nowhere to store sector
            // checksums.
            self.flags.remove(BlockFlags::SECTOR_CRC);
            let mut region = Vec::new();
            for sector in &self.sectors {
                region.extend_from_slice(sector);
            }
            return (region, self.flags);
        }

        let crc_sector = self.flags.contains(BlockFlags::SECTOR_CRC).then(|| {
            let mut bytes = Vec::with_capacity(self.sectors.len() * 4);
            for sector in &self.sectors {
                bytes.extend_from_slice(&crc32fast::hash(sector).to_le_bytes());
            }
            bytes
        });

        let entries = self.sectors.len() + 1 + usize::from(crc_sector.is_some());
        let mut offsets = Vec::with_capacity(entries);
        let mut position = (entries * 4) as u32;
        offsets.push(position);
        for sector in &self.sectors {
            position += sector.len() as u32;
            offsets.push(position);
        }
        if let Some(crc) = &crc_sector {
            position += crc.len() as u32;
            offsets.push(position);
        }

        let mut table = Vec::with_capacity(entries * 4);
        for offset in &offsets {
            table.extend_from_slice(&offset.to_le_bytes());
        }
        if self.flags.contains(BlockFlags::ENCRYPTED) {
            encrypt_data(&mut table, key.wrapping_sub(1));
        }

        let mut region = table;
        for sector in &self.sectors {
            region.extend_from_slice(sector);
        }
        if let Some(crc) = crc_sector {
            region.extend_from_slice(&crc);
        }
        (region, self.flags)
    }
}

/// Re-keys a stored data region in place without unpacking it.
///
/// Renaming an encrypted file changes its name-derived key, and
/// relocating a FIX_KEY file changes the position-adjusted one; either
/// way every ciphered piece is decrypted with the old key schedule and
/// re-encrypted with the new. Checksum entries cover the ciphered
/// sector bytes, so an uncompressed checksum table is recomputed here
/// as well.
pub(crate) fn recrypt_region(
    region: &mut [u8],
    flags: BlockFlags,
    file_size: u64,
    sector_size: u64,
    old_key: u32,
    new_key: u32,
) -> Result<()> {
    if !flags.contains(BlockFlags::ENCRYPTED) || region.is_empty() || old_key == new_key {
        return Ok(());
    }
    if flags.contains(BlockFlags::SINGLE_UNIT) {
        decrypt_data(region, old_key);
        encrypt_data(region, new_key);
        return Ok(());
    }

    let span = sector_size.max(1);
    let sector_count = file_size.div_ceil(span) as usize;

    if !flags.is_compressed() {
        for index in 0..sector_count {
            let start = index * span as usize;
            let end = region.len().min(start + span as usize);
            if start >= end {
                break;
            }
            let sector = &mut region[start..end];
            decrypt_data(sector, old_key.wrapping_add(index as u32));
            encrypt_data(sector, new_key.wrapping_add(index as u32));
        }
        return Ok(());
    }

    let entries = sector_count + 1 + usize::from(flags.contains(BlockFlags::SECTOR_CRC));
    let table_len = entries * 4;
    if table_len > region.len() {
        return Err(Error::corrupt(
            "sector offset table extends past the stored data",
        ));
    }

    let (table, _) = region.split_at_mut(table_len);
    decrypt_data(table, old_key.wrapping_sub(1));
    let offsets: Vec<u32> = table
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    encrypt_data(table, new_key.wrapping_sub(1));

    for index in 0..sector_count {
        let start = offsets[index] as usize;
        let end = offsets[index + 1] as usize;
        if start < table_len || start > end || end > region.len() {
            return Err(Error::corrupt("sector offset table is inconsistent"));
        }
        let sector = &mut region[start..end];
        decrypt_data(sector, old_key.wrapping_add(index as u32));
        encrypt_data(sector, new_key.wrapping_add(index as u32));
    }

    // The checksum table covers ciphered sector bytes, so it must
    // follow the key change.
    if flags.contains(BlockFlags::SECTOR_CRC) {
        let crc_start = offsets[sector_count] as usize;
        let crc_end = offsets[sector_count + 1] as usize;
        if crc_start > crc_end || crc_end > region.len() {
            return Err(Error::corrupt("sector offset table is inconsistent"));
        }
        if crc_end - crc_start == sector_count * 4 {
            let mut crcs = Vec::with_capacity(sector_count * 4);
            for index in 0..sector_count {
                let sector = &region[offsets[index] as usize..offsets[index + 1] as usize];
                crcs.extend_from_slice(&crc32fast::hash(sector).to_le_bytes());
            }
            region[crc_start..crc_end].copy_from_slice(&crcs);
        }
        // A compressed checksum table cannot be patched in place;
        // readers will reject those sectors until the file is
        // rewritten.
    }

    Ok(())
}
