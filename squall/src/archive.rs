//! Archive open, create, and every by-name operation
//!
//! The archive owns the backing file, the in-memory tables, and a
//! registry of open file and finder handles. Handles are copyable
//! slot-plus-nonce IDs validated on every call, so a stale or
//! wrong-kind handle fails cleanly instead of touching another
//! handle's state. Structural mutations that relocate slots or entries
//! (a rehash, a compact) bump a generation counter that outstanding
//! read and finder handles are checked against.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tempfile::NamedTempFile;

use crate::compression::CompressionMethod;
use crate::crypto::{file_key, fix_file_key, hash_string, hash_type};
use crate::error::{Error, Result};
use crate::file::{recrypt_region, ReadState, StagedFile, WriteState};
use crate::finder::{name_key, FindData, FinderState, FinderView};
use crate::header::{
    find_header, FormatVersion, Header, UserData, MAX_SECTOR_SIZE_SHIFT,
};
use crate::special_files::{
    build_listfile, filetime_now, is_internal_name, parse_listfile, Attributes, ATTRIBUTES_NAME,
    LISTFILE_NAME, SIGNATURE_NAME,
};
use crate::tables::{
    hi_block_table_bytes, parse_hi_block_table, BetTable, BlockEntry, BlockFlags, BlockTable,
    HashTable, HetTable, LOCALE_NEUTRAL, MAX_HASH_TABLE_SIZE, MIN_HASH_TABLE_SIZE,
};

/// Hash table capacity for archives created without an explicit limit
const DEFAULT_MAX_FILE_COUNT: u32 = 0x40;

/// Progress and cancellation are reported at this granularity during
/// compaction.
const COMPACT_CHUNK: usize = 0x1_0000;

/// Options for opening an existing archive
#[derive(Debug, Clone)]
pub struct OpenOptions {
    read_only: bool,
    verify_checksums: bool,
    load_listfile: bool,
}

impl OpenOptions {
    /// Default options: writable, checksums not verified, listfile
    /// loaded
    pub fn new() -> Self {
        OpenOptions {
            read_only: false,
            verify_checksums: false,
            load_listfile: true,
        }
    }

    /// Refuses every mutating operation on the opened archive
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Verifies stored sector checksums while reading
    pub fn verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    /// Controls whether `(listfile)` is parsed to recover file names
    pub fn load_listfile(mut self, load: bool) -> Self {
        self.load_listfile = load;
        self
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions::new()
    }
}

/// Options for creating a new archive
#[derive(Debug, Clone)]
pub struct CreateOptions {
    format_version: FormatVersion,
    sector_size_shift: u16,
    max_file_count: u32,
    listfile: bool,
    attributes: bool,
}

impl CreateOptions {
    /// Default options: version 1, 4 KiB sectors, a small file limit,
    /// listfile and attributes maintained
    pub fn new() -> Self {
        CreateOptions {
            format_version: FormatVersion::V1,
            sector_size_shift: crate::header::DEFAULT_SECTOR_SIZE_SHIFT,
            max_file_count: DEFAULT_MAX_FILE_COUNT,
            listfile: true,
            attributes: true,
        }
    }

    /// Archive format version to write
    pub fn version(mut self, version: FormatVersion) -> Self {
        self.format_version = version;
        self
    }

    /// Sector size is `512 << shift`
    pub fn sector_size_shift(mut self, shift: u16) -> Self {
        self.sector_size_shift = shift;
        self
    }

    /// Initial file limit; rounded up to a power of two
    pub fn max_file_count(mut self, count: u32) -> Self {
        self.max_file_count = count;
        self
    }

    /// Controls whether a `(listfile)` is created and maintained
    pub fn listfile(mut self, listfile: bool) -> Self {
        self.listfile = listfile;
        self
    }

    /// Controls whether an `(attributes)` file is created and
    /// maintained
    pub fn attributes(mut self, attributes: bool) -> Self {
        self.attributes = attributes;
        self
    }
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions::new()
    }
}

/// Storage options for one added file
#[derive(Debug, Clone)]
pub struct FileOptions {
    compression: CompressionMethod,
    encrypt: bool,
    fix_key: bool,
    single_unit: bool,
    sector_crc: bool,
    locale: Option<u16>,
    replace: bool,
}

impl FileOptions {
    /// Default options: zlib compression, no encryption, sectored
    /// storage, the archive's current locale
    pub fn new() -> Self {
        FileOptions {
            compression: CompressionMethod::default(),
            encrypt: false,
            fix_key: false,
            single_unit: false,
            sector_crc: false,
            locale: None,
            replace: false,
        }
    }

    /// Compression applied to each sector
    pub fn compression(mut self, compression: CompressionMethod) -> Self {
        self.compression = compression;
        self
    }

    /// Encrypts sector data with the name-derived key
    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    /// Folds the file's position and size into the encryption key
    pub fn fix_key(mut self, fix_key: bool) -> Self {
        self.fix_key = fix_key;
        self
    }

    /// Stores the file as one unit instead of fixed-size sectors
    pub fn single_unit(mut self, single_unit: bool) -> Self {
        self.single_unit = single_unit;
        self
    }

    /// Stores a checksum for each sector
    pub fn sector_crc(mut self, sector_crc: bool) -> Self {
        self.sector_crc = sector_crc;
        self
    }

    /// Locale of this file version; defaults to the archive's locale
    pub fn locale(mut self, locale: u16) -> Self {
        self.locale = Some(locale);
        self
    }

    /// Replaces an existing file of the same name and locale instead
    /// of failing
    pub fn replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    fn block_flags(&self) -> BlockFlags {
        let mut flags = BlockFlags::EXISTS;
        if self.compression.mask() != 0 {
            flags |= BlockFlags::COMPRESS;
        }
        if self.encrypt {
            flags |= BlockFlags::ENCRYPTED;
        }
        if self.fix_key {
            flags |= BlockFlags::ENCRYPTED | BlockFlags::FIX_KEY;
        }
        if self.single_unit {
            flags |= BlockFlags::SINGLE_UNIT;
        }
        if self.sector_crc {
            flags |= BlockFlags::SECTOR_CRC;
        }
        flags
    }
}

impl Default for FileOptions {
    fn default() -> Self {
        FileOptions::new()
    }
}

/// Identifier for an open file stream, read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle {
    slot: u32,
    nonce: u32,
}

/// Identifier for a running enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinderHandle {
    slot: u32,
    nonce: u32,
}

enum HandleState {
    Read {
        state: ReadState,
        generation: u64,
    },
    Write {
        name: String,
        locale: u16,
        state: WriteState,
    },
    Finder {
        state: FinderState,
        generation: u64,
    },
}

/// Slab of open handles.
///
/// A freed slot is reused, so every grant carries a nonce; a handle
/// whose nonce no longer matches its slot has been closed.
#[derive(Default)]
struct Registry {
    cells: Vec<Option<(u32, HandleState)>>,
    next_nonce: u32,
}

impl Registry {
    fn grant(&mut self, state: HandleState) -> (u32, u32) {
        self.next_nonce = match self.next_nonce.wrapping_add(1) {
            0 => 1,
            nonce => nonce,
        };
        let nonce = self.next_nonce;

        match self.cells.iter_mut().position(|cell| cell.is_none()) {
            Some(slot) => {
                self.cells[slot] = Some((nonce, state));
                (slot as u32, nonce)
            }
            None => {
                self.cells.push(Some((nonce, state)));
                (self.cells.len() as u32 - 1, nonce)
            }
        }
    }

    fn get_mut(&mut self, slot: u32, nonce: u32) -> Option<&mut HandleState> {
        match self.cells.get_mut(slot as usize) {
            Some(Some((granted, state))) if *granted == nonce => Some(state),
            _ => None,
        }
    }

    fn remove(&mut self, slot: u32, nonce: u32) -> Option<HandleState> {
        let cell = self.cells.get_mut(slot as usize)?;
        if matches!(cell, Some((granted, _)) if *granted == nonce) {
            cell.take().map(|(_, state)| state)
        } else {
            None
        }
    }

    fn drain(&mut self) -> Vec<HandleState> {
        self.cells
            .drain(..)
            .flatten()
            .map(|(_, state)| state)
            .collect()
    }
}

/// An open archive
pub struct Archive {
    file: File,
    path: PathBuf,
    read_only: bool,
    verify_checksums: bool,
    archive_offset: u64,
    header: Header,
    user_data: Option<UserData>,
    hash_table: HashTable,
    block_table: BlockTable,
    hi_block_table: Vec<u16>,
    het_table: Option<HetTable>,
    bet_table: Option<BetTable>,
    /// Known file names keyed by their verification hash pair
    names: HashMap<u64, String>,
    /// User file names when a `(listfile)` is maintained
    listfile: Option<Vec<String>>,
    attributes: Option<Attributes>,
    locale: u16,
    generation: u64,
    registry: Registry,
    dirty: bool,
    closed: bool,
}

impl fmt::Debug for Archive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archive")
            .field("path", &self.path)
            .field("format_version", &self.header.format_version)
            .field("read_only", &self.read_only)
            .field("file_count", &self.file_count())
            .field("max_file_count", &self.max_file_count())
            .finish_non_exhaustive()
    }
}

impl Archive {
    /// Opens an archive with default options
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Archive::open_with(path, OpenOptions::new())
    }

    /// Opens an archive.
    ///
    /// The header is located by scanning 512-byte boundaries, so
    /// archives embedded in larger container files are found. When the
    /// archive carries no classic tables, storage metadata is
    /// recovered from its extended tables and the archive opens
    /// read-only.
    pub fn open_with<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut read_only = options.read_only;
        let mut file = if read_only {
            File::open(&path)?
        } else {
            match File::options().read(true).write(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                    log::debug!("{path:?} is not writable, opening read-only");
                    read_only = true;
                    File::open(&path)?
                }
                Err(err) => return Err(err.into()),
            }
        };

        let file_len = file.seek(SeekFrom::End(0))?;
        let (archive_offset, user_data, header) = find_header(&mut file)?;
        let backing_len = file_len - archive_offset;

        let mut het_table = None;
        let mut bet_table = None;
        if let Some(offset) = header.het_table_offset() {
            let stored = ext_table_stored_size(&header, offset, |v4| v4.het_table_size_64);
            verify_stored_digest(&mut file, archive_offset + offset, stored, &header, |v4| {
                ("HET table", v4.md5_het_table)
            })?;
            het_table = Some(HetTable::read(&mut file, archive_offset + offset, stored)?);
        }
        if let Some(offset) = header.bet_table_offset() {
            let stored = ext_table_stored_size(&header, offset, |v4| v4.bet_table_size_64);
            verify_stored_digest(&mut file, archive_offset + offset, stored, &header, |v4| {
                ("BET table", v4.md5_bet_table)
            })?;
            bet_table = Some(BetTable::read(&mut file, archive_offset + offset, stored)?);
        }

        let has_classic = header.hash_table_size != 0;
        let (hash_table, block_table, hi_block_table) = if has_classic {
            load_classic_tables(&mut file, archive_offset, backing_len, &header)?
        } else {
            let bet = bet_table
                .as_ref()
                .ok_or_else(|| Error::bad_format("archive has neither classic nor BET tables"))?;
            log::info!("{path:?} carries only extended tables, opening read-only");
            read_only = true;
            let (block_table, hi) = synthesize_block_table(bet);
            (HashTable::new(MIN_HASH_TABLE_SIZE), block_table, hi)
        };

        verify_header_digest(&mut file, archive_offset, &header)?;

        for (index, entry) in block_table.entries().iter().enumerate() {
            if entry.exists() {
                let hi = hi_block_table.get(index).copied().unwrap_or(0);
                let position = (u64::from(hi) << 32) | u64::from(entry.file_pos);
                if position + u64::from(entry.compressed_size) > backing_len {
                    return Err(Error::bad_format(
                        "block entry extends past the end of the file",
                    ));
                }
            }
        }

        let mut archive = Archive {
            file,
            path,
            read_only,
            verify_checksums: options.verify_checksums,
            archive_offset,
            header,
            user_data,
            hash_table,
            block_table,
            hi_block_table,
            het_table,
            bet_table,
            names: HashMap::new(),
            listfile: None,
            attributes: None,
            locale: LOCALE_NEUTRAL,
            generation: 0,
            registry: Registry::default(),
            dirty: false,
            closed: false,
        };

        archive.warm_name_cache(&[LISTFILE_NAME, ATTRIBUTES_NAME, SIGNATURE_NAME]);
        if options.load_listfile {
            archive.load_listfile();
        }
        archive.load_attributes();
        Ok(archive)
    }

    /// Creates a new archive, truncating anything already at `path`.
    pub fn create<P: AsRef<Path>>(path: P, options: CreateOptions) -> Result<Self> {
        if options.sector_size_shift > MAX_SECTOR_SIZE_SHIFT {
            return Err(Error::bad_format(format!(
                "unreasonable sector size shift {}",
                options.sector_size_shift
            )));
        }
        let capacity = options
            .max_file_count
            .clamp(MIN_HASH_TABLE_SIZE, MAX_HASH_TABLE_SIZE)
            .next_power_of_two();

        let path = path.as_ref().to_path_buf();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut header = Header::new(options.format_version);
        header.sector_size_shift = options.sector_size_shift;

        let mut archive = Archive {
            file,
            path,
            read_only: false,
            verify_checksums: false,
            archive_offset: 0,
            header,
            user_data: None,
            hash_table: HashTable::new(capacity),
            block_table: BlockTable::new(),
            hi_block_table: Vec::new(),
            het_table: None,
            bet_table: None,
            names: HashMap::new(),
            listfile: options.listfile.then(Vec::new),
            attributes: options.attributes.then(|| Attributes::new(0)),
            locale: LOCALE_NEUTRAL,
            generation: 0,
            registry: Registry::default(),
            dirty: true,
            closed: false,
        };
        archive.flush()?;
        Ok(archive)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Format version of the archive
    pub fn format_version(&self) -> FormatVersion {
        self.header.format_version
    }

    /// Sector size in bytes
    pub fn sector_size(&self) -> u32 {
        self.header.sector_size()
    }

    /// User data block preceding the header, if one is present
    pub fn user_data(&self) -> Option<&UserData> {
        self.user_data.as_ref()
    }

    /// Number of files currently stored
    pub fn file_count(&self) -> u32 {
        self.block_table
            .entries()
            .iter()
            .filter(|entry| entry.exists())
            .count() as u32
    }

    /// Current file limit, the hash table capacity
    pub fn max_file_count(&self) -> u32 {
        self.hash_table.capacity()
    }

    /// Locale used by name lookups unless a file overrides it
    pub fn locale(&self) -> u16 {
        self.locale
    }

    /// Changes the lookup locale for subsequent operations
    pub fn set_locale(&mut self, locale: u16) {
        self.locale = locale;
    }

    /// True if `name` resolves to a stored file
    pub fn has_file(&self, name: &str) -> bool {
        match self.resolve(name, self.locale) {
            Some((_, block_index)) => self
                .block_table
                .get(block_index)
                .is_some_and(BlockEntry::exists),
            None => false,
        }
    }

    /// Reads a whole file into memory
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let handle = self.open_file(name)?;
        let result = self.read_to_end(handle);
        let _ = self.close_file(handle);
        result
    }

    fn read_to_end(&mut self, handle: FileHandle) -> Result<Vec<u8>> {
        let size = self.file_size(handle)? as usize;
        let mut data = vec![0u8; size];
        let mut total = 0;
        while total < size {
            let got = self.file_read(handle, &mut data[total..])?;
            if got == 0 {
                break;
            }
            total += got;
        }
        data.truncate(total);
        Ok(data)
    }

    /// Extracts one file to `target`, creating parent directories
    pub fn extract_file<P: AsRef<Path>>(&mut self, name: &str, target: P) -> Result<()> {
        let data = self.read_file(name)?;
        let target = target.as_ref();
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(target, data)?;
        Ok(())
    }

    /// Extracts every listed file under `target_dir`, mapping `\` path
    /// separators to directories.
    pub fn extract_all<P: AsRef<Path>>(&mut self, target_dir: P) -> Result<()> {
        let names = self.list()?;
        for name in names {
            let mut target = target_dir.as_ref().to_path_buf();
            for part in name.split('\\') {
                target.push(part);
            }
            self.extract_file(&name, target)?;
        }
        Ok(())
    }

    /// Names of the stored user files, from the maintained listfile
    pub fn list(&self) -> Result<Vec<String>> {
        let listfile = self
            .listfile
            .as_ref()
            .ok_or_else(|| Error::NotFound(LISTFILE_NAME.to_string()))?;
        let mut names = listfile.clone();
        names.sort_by_key(|name| name.to_ascii_uppercase());
        Ok(names)
    }

    /// Opens a read stream over a stored file
    pub fn open_file(&mut self, name: &str) -> Result<FileHandle> {
        let (_, block_index) = self
            .resolve(name, self.locale)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let entry = *self
            .block_table
            .get(block_index)
            .ok_or_else(|| Error::corrupt("hash entry points outside the block table"))?;
        if !entry.exists() {
            return Err(Error::NotFound(name.to_string()));
        }

        let position = self.block_position(block_index, &entry);
        let key = if entry.flags.contains(BlockFlags::ENCRYPTED) {
            let base = file_key(name);
            if entry.flags.contains(BlockFlags::FIX_KEY) {
                fix_file_key(base, position as u32, entry.file_size)
            } else {
                base
            }
        } else {
            0
        };

        let state = ReadState::new(
            self.archive_offset + position,
            u64::from(entry.compressed_size),
            u64::from(entry.file_size),
            entry.flags,
            key,
            u64::from(self.header.sector_size()),
            self.verify_checksums,
        );
        let (slot, nonce) = self.registry.grant(HandleState::Read {
            state,
            generation: self.generation,
        });
        Ok(FileHandle { slot, nonce })
    }

    /// Opens a write stream for a new file of exactly `size` bytes.
    ///
    /// Nothing is visible in the archive until the stream is finished.
    pub fn create_file(&mut self, name: &str, size: u64, options: &FileOptions) -> Result<FileHandle> {
        self.ensure_writable()?;
        if name.is_empty() {
            return Err(Error::bad_format("empty file name"));
        }
        if is_internal_name(name) {
            return Err(Error::AccessDenied);
        }
        if size > u64::from(u32::MAX) {
            return Err(Error::bad_format(
                "file size exceeds the 4 GiB block table limit",
            ));
        }

        let locale = options.locale.unwrap_or(self.locale);
        let existing = self
            .hash_table
            .find(name, locale)
            .filter(|&slot| self.hash_table.entry(slot).locale == locale);
        if let Some(slot) = existing {
            if !options.replace {
                return Err(Error::AlreadyExists(name.to_string()));
            }
            let block_index = self.hash_table.entry(slot).block_index;
            self.remove_file_at(slot, block_index);
        }
        if self.hash_table.occupied_count() >= self.hash_table.capacity() {
            // Make what is already committed durable before the table
            // is rebuilt.
            self.flush()?;
            if self.hash_table.occupied_count() >= self.hash_table.capacity() {
                self.grow_file_limit()?;
            }
        }

        let state = WriteState::new(
            size,
            options.block_flags(),
            options.compression,
            u64::from(self.header.sector_size()),
        );
        let (slot, nonce) = self.registry.grant(HandleState::Write {
            name: name.to_string(),
            locale,
            state,
        });
        Ok(FileHandle { slot, nonce })
    }

    /// Reads from an open read stream. Short reads near EOF are
    /// success; a read at EOF returns zero bytes.
    pub fn file_read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize> {
        let generation = self.generation;
        match self.registry.get_mut(handle.slot, handle.nonce) {
            Some(HandleState::Read { state, generation: opened }) => {
                if *opened != generation {
                    return Err(Error::InvalidHandle);
                }
                state.read(&mut self.file, buf)
            }
            Some(HandleState::Write { .. }) => Err(Error::AccessDenied),
            _ => Err(Error::InvalidHandle),
        }
    }

    /// Appends to an open write stream. Writing past the declared size
    /// fails without buffering anything.
    pub fn file_write(&mut self, handle: FileHandle, data: &[u8]) -> Result<()> {
        match self.registry.get_mut(handle.slot, handle.nonce) {
            Some(HandleState::Write { state, .. }) => state.write(data),
            Some(HandleState::Read { .. }) => Err(Error::AccessDenied),
            _ => Err(Error::InvalidHandle),
        }
    }

    /// Moves the position of a read stream.
    ///
    /// Write streams are append-only; for them only the position
    /// queries `Current(0)` and `End(0)` are allowed, reporting the
    /// high-water mark and the declared size.
    pub fn file_seek(&mut self, handle: FileHandle, pos: SeekFrom) -> Result<u64> {
        let generation = self.generation;
        match self.registry.get_mut(handle.slot, handle.nonce) {
            Some(HandleState::Read { state, generation: opened }) => {
                if *opened != generation {
                    return Err(Error::InvalidHandle);
                }
                state.seek(pos)
            }
            Some(HandleState::Write { state, .. }) => match pos {
                SeekFrom::Current(0) => Ok(state.written()),
                SeekFrom::End(0) => Ok(state.declared_size()),
                _ => Err(Error::AccessDenied),
            },
            _ => Err(Error::InvalidHandle),
        }
    }

    /// Unpacked size of the stream's file: actual for read streams,
    /// declared for write streams
    pub fn file_size(&mut self, handle: FileHandle) -> Result<u64> {
        match self.registry.get_mut(handle.slot, handle.nonce) {
            Some(HandleState::Read { state, .. }) => Ok(state.size()),
            Some(HandleState::Write { state, .. }) => Ok(state.declared_size()),
            _ => Err(Error::InvalidHandle),
        }
    }

    /// Completes a write stream and commits the file.
    ///
    /// The handle is consumed either way; a failed commit discards the
    /// staged data. The table update is flushed so the new entry
    /// survives an immediate process exit.
    pub fn finish_file(&mut self, handle: FileHandle) -> Result<()> {
        if !matches!(
            self.registry.get_mut(handle.slot, handle.nonce),
            Some(HandleState::Write { .. })
        ) {
            return Err(Error::InvalidHandle);
        }
        let Some(HandleState::Write { name, locale, mut state }) =
            self.registry.remove(handle.slot, handle.nonce)
        else {
            return Err(Error::InvalidHandle);
        };

        let staged = state.finish()?;
        self.commit_staged(&name, locale, staged)?;
        self.flush_tables()
    }

    /// Closes a stream. A read stream is dropped; a write stream is
    /// finished and committed.
    pub fn close_file(&mut self, handle: FileHandle) -> Result<()> {
        match self.registry.get_mut(handle.slot, handle.nonce) {
            Some(HandleState::Read { .. }) => {
                self.registry.remove(handle.slot, handle.nonce);
                Ok(())
            }
            Some(HandleState::Write { .. }) => self.finish_file(handle),
            _ => Err(Error::InvalidHandle),
        }
    }

    /// Adds a file in one shot
    pub fn add_file(&mut self, name: &str, data: &[u8], options: &FileOptions) -> Result<()> {
        self.add_file_inner(name, data, options, &mut |_, _| true)
            .map(|_| ())
    }

    /// Adds a file, reporting progress after every stored sector.
    ///
    /// Returning `false` from the callback cancels the add; nothing is
    /// committed and the call returns `Ok(false)`.
    pub fn add_file_with_progress<F>(
        &mut self,
        name: &str,
        data: &[u8],
        options: &FileOptions,
        mut progress: F,
    ) -> Result<bool>
    where
        F: FnMut(u64, u64) -> bool,
    {
        self.add_file_inner(name, data, options, &mut progress)
    }

    fn add_file_inner(
        &mut self,
        name: &str,
        data: &[u8],
        options: &FileOptions,
        progress: &mut dyn FnMut(u64, u64) -> bool,
    ) -> Result<bool> {
        let total = data.len() as u64;
        let handle = self.create_file(name, total, options)?;
        match self.stream_chunks(handle, data, progress) {
            Ok(true) => {
                self.finish_file(handle)?;
                Ok(true)
            }
            Ok(false) => {
                let _ = self.discard_file(handle);
                Ok(false)
            }
            Err(err) => {
                let _ = self.discard_file(handle);
                Err(err)
            }
        }
    }

    fn stream_chunks(
        &mut self,
        handle: FileHandle,
        data: &[u8],
        progress: &mut dyn FnMut(u64, u64) -> bool,
    ) -> Result<bool> {
        let total = data.len() as u64;
        if !progress(0, total) {
            return Ok(false);
        }
        let mut done = 0u64;
        for chunk in data.chunks(self.header.sector_size() as usize) {
            self.file_write(handle, chunk)?;
            done += chunk.len() as u64;
            if !progress(done, total) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Abandons a write stream; nothing becomes visible in the archive
    pub fn discard_file(&mut self, handle: FileHandle) -> Result<()> {
        if !matches!(
            self.registry.get_mut(handle.slot, handle.nonce),
            Some(HandleState::Write { .. })
        ) {
            return Err(Error::InvalidHandle);
        }
        self.registry.remove(handle.slot, handle.nonce);
        Ok(())
    }

    /// Removes a file.
    ///
    /// The hash slot becomes a tombstone and the block entry keeps its
    /// region claim, so probe chains through the slot stay alive and
    /// open read streams keep their bytes until the next compact.
    pub fn remove_file(&mut self, name: &str) -> Result<()> {
        self.ensure_writable()?;
        if is_internal_name(name) {
            return Err(Error::AccessDenied);
        }
        let (slot, block_index) = self
            .lookup_classic(name, self.locale)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        self.remove_file_at(slot, block_index);
        Ok(())
    }

    fn remove_file_at(&mut self, slot: u32, block_index: u32) {
        let entry = *self.hash_table.entry(slot);
        self.hash_table.remove(slot);

        // Other locale versions share the verification hashes; the
        // name caches keep the name while any of them remains.
        let orphaned = !self
            .hash_table
            .entries()
            .iter()
            .any(|e| e.is_occupied() && e.name_a == entry.name_a && e.name_b == entry.name_b);
        if orphaned {
            let key = name_key(entry.name_a, entry.name_b);
            if let Some(name) = self.names.remove(&key) {
                if let Some(listfile) = self.listfile.as_mut() {
                    listfile.retain(|listed| !listed.eq_ignore_ascii_case(&name));
                }
            }
        }

        if let Some(block) = self.block_table.get_mut(block_index) {
            block.flags.remove(BlockFlags::EXISTS);
            block.flags.insert(BlockFlags::DELETE_MARKER);
        }
        if let Some(attributes) = self.attributes.as_mut() {
            attributes.clear(block_index as usize);
        }
        self.dirty = true;
    }

    /// Renames a file, re-encrypting its stored data when the key is
    /// derived from the name.
    pub fn rename_file(&mut self, old: &str, new: &str) -> Result<()> {
        self.ensure_writable()?;
        if is_internal_name(old) || is_internal_name(new) {
            return Err(Error::AccessDenied);
        }
        if new.is_empty() {
            return Err(Error::bad_format("empty file name"));
        }

        let (slot, block_index) = self
            .lookup_classic(old, self.locale)
            .ok_or_else(|| Error::NotFound(old.to_string()))?;
        let locale = self.hash_table.entry(slot).locale;
        let duplicate = self
            .hash_table
            .find(new, locale)
            .is_some_and(|found| self.hash_table.entry(found).locale == locale);
        if duplicate {
            return Err(Error::AlreadyExists(new.to_string()));
        }
        let entry = *self
            .block_table
            .get(block_index)
            .ok_or_else(|| Error::corrupt("hash entry points outside the block table"))?;

        if entry.exists() && entry.flags.contains(BlockFlags::ENCRYPTED) {
            let position = self.block_position(block_index, &entry);
            let old_key = derived_key(old, &entry, position);
            let new_key = derived_key(new, &entry, position);
            if old_key != new_key {
                let mut region =
                    self.read_region(position, u64::from(entry.compressed_size))?;
                recrypt_region(
                    &mut region,
                    entry.flags,
                    u64::from(entry.file_size),
                    u64::from(self.header.sector_size()),
                    old_key,
                    new_key,
                )?;
                self.write_region(position, &region)?;
            }
        }

        let old_entry = *self.hash_table.entry(slot);
        self.hash_table.remove(slot);
        // A slot was just freed, so this insert cannot run out of room.
        self.hash_table.insert(new, locale, block_index)?;

        let orphaned = !self
            .hash_table
            .entries()
            .iter()
            .any(|e| e.is_occupied() && e.name_a == old_entry.name_a && e.name_b == old_entry.name_b);
        if orphaned {
            if let Some(name) = self.names.remove(&name_key(old_entry.name_a, old_entry.name_b)) {
                if let Some(listfile) = self.listfile.as_mut() {
                    listfile.retain(|listed| !listed.eq_ignore_ascii_case(&name));
                }
            }
        }
        self.remember_name(new);
        self.dirty = true;
        Ok(())
    }

    /// Grows the file limit, rehashing every stored name.
    ///
    /// Shrinking below the current occupancy or growing past the
    /// format's table ceiling fails without touching the archive. A
    /// successful rehash relocates slots, so outstanding read and
    /// finder handles become stale.
    pub fn set_max_file_count(&mut self, limit: u32) -> Result<()> {
        self.ensure_writable()?;
        if limit < self.hash_table.occupied_count() || limit > MAX_HASH_TABLE_SIZE {
            return Err(Error::NotEnoughMemory);
        }
        let capacity = limit
            .clamp(MIN_HASH_TABLE_SIZE, MAX_HASH_TABLE_SIZE)
            .next_power_of_two();
        if capacity == self.hash_table.capacity() {
            return Ok(());
        }

        let names = &self.names;
        let rebuilt = self.hash_table.rebuilt_with(capacity, |entry| {
            names
                .get(&name_key(entry.name_a, entry.name_b))
                .map(|name| hash_string(name, hash_type::TABLE_OFFSET))
        })?;
        self.hash_table = rebuilt;
        self.generation = self.generation.wrapping_add(1);
        self.dirty = true;
        Ok(())
    }

    /// Starts an enumeration of the stored files.
    ///
    /// The mask filters names with `*` and `?` wildcards; literal
    /// bytes match exactly. Files whose name is not known are reported
    /// under a positional pseudo-name.
    pub fn find_first(&mut self, mask: &str) -> Result<FinderHandle> {
        let state = if self.hash_table.occupied_count() == 0 && self.bet_table.is_some() {
            FinderState::over_blocks(mask.to_string())
        } else {
            FinderState::over_slots(mask.to_string())
        };
        let (slot, nonce) = self.registry.grant(HandleState::Finder {
            state,
            generation: self.generation,
        });
        Ok(FinderHandle { slot, nonce })
    }

    /// Starts an enumeration over the listfile names instead of the
    /// hash table. Listed names no longer present are skipped.
    pub fn list_find_first(&mut self, mask: &str) -> Result<FinderHandle> {
        let mut names = self
            .listfile
            .clone()
            .ok_or_else(|| Error::NotFound(LISTFILE_NAME.to_string()))?;
        for internal in [LISTFILE_NAME, ATTRIBUTES_NAME, SIGNATURE_NAME] {
            names.push(internal.to_string());
        }
        let (slot, nonce) = self.registry.grant(HandleState::Finder {
            state: FinderState::over_names(mask.to_string(), names),
            generation: self.generation,
        });
        Ok(FinderHandle { slot, nonce })
    }

    /// Advances an enumeration. `Ok(None)` means exhausted, and the
    /// handle is closed automatically.
    pub fn find_next(&mut self, handle: FinderHandle) -> Result<Option<FindData>> {
        let generation = self.generation;
        let view = FinderView {
            hash_table: &self.hash_table,
            block_table: &self.block_table,
            names: &self.names,
            locale: self.locale,
        };
        let mut stale = false;
        let found = match self.registry.get_mut(handle.slot, handle.nonce) {
            Some(HandleState::Finder { state, generation: opened }) => {
                if *opened == generation {
                    state.next(&view)
                } else {
                    stale = true;
                    None
                }
            }
            _ => return Err(Error::InvalidHandle),
        };
        if stale {
            self.registry.remove(handle.slot, handle.nonce);
            return Err(Error::InvalidHandle);
        }
        if found.is_none() {
            self.registry.remove(handle.slot, handle.nonce);
        }
        Ok(found)
    }

    /// Closes an enumeration early
    pub fn close_finder(&mut self, handle: FinderHandle) -> Result<()> {
        if !matches!(
            self.registry.get_mut(handle.slot, handle.nonce),
            Some(HandleState::Finder { .. })
        ) {
            return Err(Error::InvalidHandle);
        }
        self.registry.remove(handle.slot, handle.nonce);
        Ok(())
    }

    /// Writes the refreshed internal files, the tables, and the header
    /// to the backing file.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.store_internal_files()?;
        self.flush_tables()?;
        self.dirty = false;
        Ok(())
    }

    /// Closes the archive, finishing outstanding write streams and
    /// dropping the rest, then flushes. The first child error is
    /// reported after everything has been closed.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.close_children_and_flush()
    }

    fn close_children_and_flush(&mut self) -> Result<()> {
        let mut first_error = None;
        for state in self.registry.drain() {
            if let HandleState::Write { name, locale, mut state } = state {
                let committed = state
                    .finish()
                    .and_then(|staged| self.commit_staged(&name, locale, staged));
                if let Err(err) = committed {
                    log::warn!("discarding incomplete file {name:?}: {err}");
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Err(err) = self.flush() {
            first_error.get_or_insert(err);
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Rebuilds the archive without gaps
    pub fn compact(&mut self) -> Result<()> {
        self.compact_inner(&mut |_, _| true).map(|_| ())
    }

    /// Rebuilds the archive without gaps, reporting progress as file
    /// data is copied.
    ///
    /// Returning `false` from the callback cancels the rebuild; the
    /// archive is left exactly as it was and the call returns
    /// `Ok(false)`. A completed rebuild relocates block entries, so
    /// outstanding read and finder handles become stale.
    pub fn compact_with_progress<F>(&mut self, mut progress: F) -> Result<bool>
    where
        F: FnMut(u64, u64) -> bool,
    {
        self.compact_inner(&mut progress)
    }

    fn compact_inner(&mut self, progress: &mut dyn FnMut(u64, u64) -> bool) -> Result<bool> {
        self.ensure_writable()?;
        self.flush()?;

        // Survivors in stored order. The attributes file is rebuilt
        // rather than copied because its arrays are indexed by block
        // position.
        let stored_attributes = self
            .lookup_classic(ATTRIBUTES_NAME, LOCALE_NEUTRAL)
            .map(|(_, block_index)| block_index);
        let attributes_index = match self.attributes {
            Some(_) => stored_attributes,
            None => {
                if stored_attributes.is_some() {
                    log::warn!(
                        "unparsed attributes file copied verbatim, its arrays keep the old block order"
                    );
                }
                None
            }
        };
        let mut survivors: Vec<u32> = (0..self.block_table.len())
            .filter(|&index| {
                self.block_table.get(index).is_some_and(BlockEntry::exists)
                    && Some(index) != attributes_index
            })
            .collect();
        survivors.sort_by_key(|&index| {
            self.block_table
                .get(index)
                .map_or(0, |entry| self.block_position(index, entry))
        });

        let names_by_block = self.names_by_block_index();
        let total: u64 = survivors
            .iter()
            .filter_map(|&index| self.block_table.get(index))
            .map(|entry| u64::from(entry.compressed_size))
            .sum();
        if !progress(0, total) {
            return Ok(false);
        }

        let parent = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut temp = match parent {
            Some(parent) => NamedTempFile::new_in(parent)?,
            None => NamedTempFile::new_in(".")?,
        };

        // Bytes in front of the header, such as a user data block,
        // carry over verbatim.
        if self.archive_offset > 0 {
            let prefix = read_exact_at(&mut self.file, 0, self.archive_offset)?;
            write_all_at(temp.as_file_mut(), 0, &prefix)?;
        }

        let mut new_block = BlockTable::new();
        let mut new_hi: Vec<u16> = Vec::new();
        let mut remap: HashMap<u32, u32> = HashMap::new();
        let mut cursor = u64::from(self.header.header_size);
        let mut copied = 0u64;

        for &old_index in &survivors {
            let entry = *self
                .block_table
                .get(old_index)
                .ok_or_else(|| Error::corrupt("block table changed during compaction"))?;
            let old_position = self.block_position(old_index, &entry);
            let mut region = self.read_region(old_position, u64::from(entry.compressed_size))?;

            // A fixed-key file's cipher depends on its position, so a
            // relocation re-keys it. That needs the real name.
            if entry.flags.contains(BlockFlags::ENCRYPTED)
                && entry.flags.contains(BlockFlags::FIX_KEY)
                && old_position != cursor
            {
                let name = names_by_block.get(&old_index).ok_or_else(|| {
                    Error::corrupt("cannot relocate a fixed-key file with no known name")
                })?;
                let base = file_key(name);
                recrypt_region(
                    &mut region,
                    entry.flags,
                    u64::from(entry.file_size),
                    u64::from(self.header.sector_size()),
                    fix_file_key(base, old_position as u32, entry.file_size),
                    fix_file_key(base, cursor as u32, entry.file_size),
                )?;
            }

            let mut offset = self.archive_offset + cursor;
            for chunk in region.chunks(COMPACT_CHUNK) {
                write_all_at(temp.as_file_mut(), offset, chunk)?;
                offset += chunk.len() as u64;
                copied += chunk.len() as u64;
                if !progress(copied, total) {
                    return Ok(false);
                }
            }

            let new_index = new_block.push(BlockEntry {
                file_pos: cursor as u32,
                ..entry
            });
            new_hi.push((cursor >> 32) as u16);
            remap.insert(old_index, new_index);
            cursor += u64::from(entry.compressed_size);
        }

        // Reorder the attribute arrays to the new block indices and
        // append the rebuilt file.
        let mut new_attributes = None;
        if let Some(old_attributes) = self.attributes.as_ref() {
            let own_index = new_block.len();
            let mut rebuilt = Attributes {
                flags: old_attributes.flags,
                ..Attributes::default()
            };
            rebuilt.resize(own_index as usize + 1);
            for (&old_index, &new_index) in &remap {
                rebuilt.record(
                    new_index as usize,
                    old_attributes.crc32.get(old_index as usize).copied().unwrap_or(0),
                    old_attributes
                        .filetimes
                        .get(old_index as usize)
                        .copied()
                        .unwrap_or(0),
                    old_attributes.md5.get(old_index as usize).copied().unwrap_or([0; 16]),
                );
            }

            let content = rebuilt.to_bytes();
            let mut state = WriteState::new(
                content.len() as u64,
                BlockFlags::EXISTS | BlockFlags::COMPRESS,
                CompressionMethod::Zlib,
                u64::from(self.header.sector_size()),
            );
            state.write(&content)?;
            let (region, flags) = state.finish()?.into_region(0);
            write_all_at(temp.as_file_mut(), self.archive_offset + cursor, &region)?;

            let new_index = new_block.push(BlockEntry {
                file_pos: cursor as u32,
                compressed_size: region.len() as u32,
                file_size: content.len() as u32,
                flags,
            });
            new_hi.push((cursor >> 32) as u16);
            if let Some(old_index) = attributes_index {
                remap.insert(old_index, new_index);
            }
            cursor += region.len() as u64;
            new_attributes = Some(rebuilt);
        }

        // Remap the hash table. Entries whose block vanished become
        // tombstones so surviving probe chains stay intact.
        let mut new_hash = self.hash_table.clone();
        for slot in 0..new_hash.capacity() {
            let block_index = new_hash.entry(slot).block_index;
            if !new_hash.entry(slot).is_occupied() {
                continue;
            }
            match remap.get(&block_index) {
                Some(&new_index) => new_hash.entry_mut(slot).block_index = new_index,
                None => new_hash.remove(slot),
            }
        }

        let mut new_header = self.header.clone();
        layout_tables(
            temp.as_file_mut(),
            self.archive_offset,
            &mut new_header,
            &new_hash,
            &new_block,
            &new_hi,
            cursor,
        )?;
        temp.as_file_mut().sync_all()?;

        let file = temp.persist(&self.path).map_err(|err| Error::from(err.error))?;

        self.drop_extended_tables("compaction");
        self.file = file;
        self.header = new_header;
        self.hash_table = new_hash;
        self.block_table = new_block;
        self.hi_block_table = new_hi;
        self.attributes = new_attributes;
        self.generation = self.generation.wrapping_add(1);
        self.dirty = false;
        progress(total, total);
        Ok(true)
    }

    // ----- internals -----

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::AccessDenied);
        }
        Ok(())
    }

    /// Finds the block index for a name: the classic hash table first,
    /// then HET candidates verified against the BET name hash bits.
    fn resolve(&self, name: &str, locale: u16) -> Option<(Option<u32>, u32)> {
        if let Some(slot) = self.hash_table.find(name, locale) {
            return Some((Some(slot), self.hash_table.entry(slot).block_index));
        }
        if let (Some(het), Some(bet)) = (self.het_table.as_ref(), self.bet_table.as_ref()) {
            let masked = het.masked_name_hash(name);
            for candidate in het.candidate_indexes(name) {
                if bet.name_hash_matches(candidate, masked) {
                    return Some((None, candidate));
                }
            }
        }
        None
    }

    /// Block entry for a name, used by patch chain resolution
    pub(crate) fn resolve_block(&self, name: &str) -> Option<BlockEntry> {
        let (_, block_index) = self.resolve(name, self.locale)?;
        self.block_table.get(block_index).copied()
    }

    fn lookup_classic(&self, name: &str, locale: u16) -> Option<(u32, u32)> {
        let slot = self.hash_table.find(name, locale)?;
        let block_index = self.hash_table.entry(slot).block_index;
        self.block_table
            .get(block_index)
            .is_some_and(BlockEntry::exists)
            .then_some((slot, block_index))
    }

    fn block_position(&self, block_index: u32, entry: &BlockEntry) -> u64 {
        let hi = self
            .hi_block_table
            .get(block_index as usize)
            .copied()
            .unwrap_or(0);
        (u64::from(hi) << 32) | u64::from(entry.file_pos)
    }

    /// First position past every claimed data region.
    ///
    /// Removed entries keep their claim, so this never moves backwards
    /// outside a compact; new regions are appended here.
    fn data_end(&self) -> u64 {
        let mut end = u64::from(self.header.header_size);
        for (index, entry) in self.block_table.entries().iter().enumerate() {
            let claim =
                self.block_position(index as u32, entry) + u64::from(entry.compressed_size);
            end = end.max(claim);
        }
        end
    }

    fn remember_name(&mut self, name: &str) {
        let key = name_key(
            hash_string(name, hash_type::NAME_A),
            hash_string(name, hash_type::NAME_B),
        );
        self.names.insert(key, name.to_string());
        if !is_internal_name(name) {
            if let Some(listfile) = self.listfile.as_mut() {
                if !listfile.iter().any(|listed| listed.eq_ignore_ascii_case(name)) {
                    listfile.push(name.to_string());
                }
            }
        }
    }

    fn warm_name_cache(&mut self, names: &[&str]) {
        for name in names {
            if self.resolve(name, LOCALE_NEUTRAL).is_some() {
                let key = name_key(
                    hash_string(name, hash_type::NAME_A),
                    hash_string(name, hash_type::NAME_B),
                );
                self.names.insert(key, name.to_string());
            }
        }
    }

    fn names_by_block_index(&self) -> HashMap<u32, String> {
        let mut map = HashMap::new();
        for entry in self.hash_table.entries() {
            if !entry.is_occupied() {
                continue;
            }
            if let Some(name) = self.names.get(&name_key(entry.name_a, entry.name_b)) {
                map.insert(entry.block_index, name.clone());
            }
        }
        map
    }

    fn load_listfile(&mut self) {
        if self.resolve(LISTFILE_NAME, LOCALE_NEUTRAL).is_none() {
            return;
        }
        let data = match self.read_file(LISTFILE_NAME) {
            Ok(data) => data,
            Err(err) => {
                log::warn!("unreadable listfile in {:?}: {err}", self.path);
                return;
            }
        };

        let mut user_names = Vec::new();
        for name in parse_listfile(&data) {
            if self.resolve(&name, LOCALE_NEUTRAL).is_some() {
                let key = name_key(
                    hash_string(&name, hash_type::NAME_A),
                    hash_string(&name, hash_type::NAME_B),
                );
                self.names.insert(key, name.clone());
            }
            if !is_internal_name(&name)
                && !user_names
                    .iter()
                    .any(|listed: &String| listed.eq_ignore_ascii_case(&name))
            {
                user_names.push(name);
            }
        }
        self.listfile = Some(user_names);
    }

    fn load_attributes(&mut self) {
        if self.resolve(ATTRIBUTES_NAME, LOCALE_NEUTRAL).is_none() {
            return;
        }
        let block_count = self.block_table.len() as usize;
        match self
            .read_file(ATTRIBUTES_NAME)
            .and_then(|data| Attributes::parse(&data, block_count))
        {
            Ok(attributes) => self.attributes = Some(attributes),
            Err(err) => {
                log::warn!("ignoring unusable attributes in {:?}: {err}", self.path);
            }
        }
    }

    /// Places a finished file into the tables and writes its data
    /// region. On failure the tables are left as they were.
    fn commit_staged(&mut self, name: &str, locale: u16, staged: StagedFile) -> Result<()> {
        let file_size = staged.file_size;
        let content_crc32 = staged.content_crc32;
        let content_md5 = staged.content_md5;

        let reused = self.block_table.find_free();
        let block_index = reused.unwrap_or_else(|| self.block_table.len());

        let slot = match self.hash_table.insert(name, locale, block_index) {
            Ok(slot) => slot,
            Err(Error::NotEnoughMemory) => {
                self.grow_file_limit()?;
                self.hash_table.insert(name, locale, block_index)?
            }
            Err(err) => return Err(err),
        };

        let position = self.data_end();
        let key = if staged.flags.contains(BlockFlags::ENCRYPTED) {
            let base = file_key(name);
            if staged.flags.contains(BlockFlags::FIX_KEY) {
                fix_file_key(base, position as u32, file_size as u32)
            } else {
                base
            }
        } else {
            0
        };
        let (region, flags) = staged.into_region(key);

        let end = position + region.len() as u64;
        let limit = match self.header.format_version {
            FormatVersion::V1 => u64::from(u32::MAX),
            _ => (1u64 << 48) - 1,
        };
        if region.len() as u64 > u64::from(u32::MAX) || end > limit {
            self.hash_table.remove(slot);
            return Err(Error::DiskFull);
        }
        if let Err(err) = self.write_region(position, &region) {
            self.hash_table.remove(slot);
            return Err(err);
        }

        let entry = BlockEntry {
            file_pos: position as u32,
            compressed_size: region.len() as u32,
            file_size: file_size as u32,
            flags,
        };
        match reused {
            Some(index) => {
                if let Some(block) = self.block_table.get_mut(index) {
                    *block = entry;
                }
            }
            None => {
                self.block_table.push(entry);
            }
        }
        if self.header.format_version >= FormatVersion::V2 {
            let len = self.block_table.len() as usize;
            if self.hi_block_table.len() < len {
                self.hi_block_table.resize(len, 0);
            }
            self.hi_block_table[block_index as usize] = (position >> 32) as u16;
        }

        self.remember_name(name);
        if let Some(attributes) = self.attributes.as_mut() {
            attributes.resize(self.block_table.len() as usize);
            if name.eq_ignore_ascii_case(ATTRIBUTES_NAME) {
                // Recording the attributes file in itself would change
                // its content on every store.
                attributes.clear(block_index as usize);
            } else {
                attributes.record(
                    block_index as usize,
                    content_crc32,
                    filetime_now(),
                    content_md5,
                );
            }
        }
        self.dirty = true;
        Ok(())
    }

    /// Doubles the file limit, as adds do when the table is full
    fn grow_file_limit(&mut self) -> Result<()> {
        let capacity = self.hash_table.capacity();
        if capacity >= MAX_HASH_TABLE_SIZE {
            return Err(Error::NotEnoughMemory);
        }
        self.set_max_file_count(capacity + 1)
    }

    /// Regenerates `(listfile)` and `(attributes)` from the maintained
    /// state
    fn store_internal_files(&mut self) -> Result<()> {
        if let Some(user_names) = self.listfile.clone() {
            let mut listed = user_names;
            listed.push(LISTFILE_NAME.to_string());
            if self.attributes.is_some() {
                listed.push(ATTRIBUTES_NAME.to_string());
            }
            if self.resolve(SIGNATURE_NAME, LOCALE_NEUTRAL).is_some() {
                listed.push(SIGNATURE_NAME.to_string());
            }
            let content = build_listfile(&listed);
            self.store_internal(LISTFILE_NAME, &content)?;
        }

        if self.attributes.is_some() {
            // The block count must be final before the arrays are
            // serialized, so the entry is claimed through the same
            // path as any other add would.
            let needs_new_block = self
                .lookup_classic(ATTRIBUTES_NAME, LOCALE_NEUTRAL)
                .is_none()
                && self.block_table.find_free().is_none();
            let block_count = self.block_table.len() as usize + usize::from(needs_new_block);
            let content = match self.attributes.as_mut() {
                Some(attributes) => {
                    attributes.resize(block_count);
                    attributes.to_bytes()
                }
                None => return Ok(()),
            };
            self.store_internal(ATTRIBUTES_NAME, &content)?;
        }
        Ok(())
    }

    fn store_internal(&mut self, name: &str, content: &[u8]) -> Result<()> {
        if let Some((slot, block_index)) = self.lookup_classic(name, LOCALE_NEUTRAL) {
            self.remove_file_at(slot, block_index);
        }
        let mut state = WriteState::new(
            content.len() as u64,
            BlockFlags::EXISTS | BlockFlags::COMPRESS,
            CompressionMethod::Zlib,
            u64::from(self.header.sector_size()),
        );
        state.write(content)?;
        let staged = state.finish()?;
        self.commit_staged(name, LOCALE_NEUTRAL, staged)
    }

    /// Writes the tables and header without refreshing the internal
    /// files, making committed entries durable.
    fn flush_tables(&mut self) -> Result<()> {
        let data_end = self.data_end();
        layout_tables(
            &mut self.file,
            self.archive_offset,
            &mut self.header,
            &self.hash_table,
            &self.block_table,
            &self.hi_block_table,
            data_end,
        )?;
        self.drop_extended_tables("a table write");
        self.file.sync_all()?;
        Ok(())
    }

    /// This crate rewrites classic tables only; stale HET/BET copies
    /// must not survive a layout change.
    fn drop_extended_tables(&mut self, cause: &str) {
        let het = self.het_table.take().is_some();
        let bet = self.bet_table.take().is_some();
        if het || bet {
            log::debug!("extended tables dropped by {cause}");
        }
    }

    fn read_region(&mut self, position: u64, len: u64) -> Result<Vec<u8>> {
        read_exact_at(&mut self.file, self.archive_offset + position, len)
    }

    fn write_region(&mut self, position: u64, data: &[u8]) -> Result<()> {
        write_all_at(&mut self.file, self.archive_offset + position, data)
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.close_children_and_flush() {
            log::warn!("closing {:?}: {err}", self.path);
        }
    }
}

/// Encryption key of a stored entry under the given name
fn derived_key(name: &str, entry: &BlockEntry, position: u64) -> u32 {
    let base = file_key(name);
    if entry.flags.contains(BlockFlags::FIX_KEY) {
        fix_file_key(base, position as u32, entry.file_size)
    } else {
        base
    }
}

fn read_exact_at(file: &mut File, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut data = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut data)?;
    Ok(data)
}

fn write_all_at(file: &mut File, offset: u64, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    Ok(())
}

/// Loads and validates the classic hash, block, and hi-block tables.
fn load_classic_tables(
    file: &mut File,
    archive_offset: u64,
    backing_len: u64,
    header: &Header,
) -> Result<(HashTable, BlockTable, Vec<u16>)> {
    if !header.hash_table_size.is_power_of_two() || header.hash_table_size > MAX_HASH_TABLE_SIZE {
        return Err(Error::bad_format(format!(
            "hash table size {:#x} is not a power of two in range",
            header.hash_table_size
        )));
    }

    let hash_len = u64::from(header.hash_table_size) * 16;
    let block_len = u64::from(header.block_table_size) * 16;
    if let Some(v4) = header.v4.as_ref() {
        if v4.hash_table_size_64 != 0 && v4.hash_table_size_64 < hash_len
            || v4.block_table_size_64 != 0 && v4.block_table_size_64 < block_len
        {
            return Err(Error::bad_format("compressed classic tables are not supported"));
        }
    }

    let hash_offset = header.hash_table_offset();
    let block_offset = header.block_table_offset();
    if hash_offset + hash_len > backing_len || block_offset + block_len > backing_len {
        return Err(Error::bad_format("table extends past the end of the file"));
    }

    let hash_raw = read_exact_at(file, archive_offset + hash_offset, hash_len)?;
    verify_table_digest(&hash_raw, header, |v4| ("hash table", v4.md5_hash_table))?;
    let hash_table = HashTable::from_encrypted_bytes(hash_raw)?;

    let block_raw = read_exact_at(file, archive_offset + block_offset, block_len)?;
    verify_table_digest(&block_raw, header, |v4| ("block table", v4.md5_block_table))?;
    let block_table = BlockTable::from_encrypted_bytes(block_raw)?;

    let mut hi_block_table = Vec::new();
    if let Some(offset) = header.hi_block_table_offset() {
        let hi_len = u64::from(header.block_table_size) * 2;
        if offset + hi_len > backing_len {
            return Err(Error::bad_format("table extends past the end of the file"));
        }
        let hi_raw = read_exact_at(file, archive_offset + offset, hi_len)?;
        verify_table_digest(&hi_raw, header, |v4| {
            ("hi-block table", v4.md5_hi_block_table)
        })?;
        hi_block_table = parse_hi_block_table(&hi_raw)?;
    }

    Ok((hash_table, block_table, hi_block_table))
}

/// Recovers a classic block table from a BET table so the rest of the
/// crate can stay on one metadata path.
fn synthesize_block_table(bet: &BetTable) -> (BlockTable, Vec<u16>) {
    let mut block_table = BlockTable::new();
    let mut hi = Vec::new();
    let mut saturated = false;

    for index in 0..bet.len() {
        let Some(info) = bet.file_info(index) else {
            continue;
        };
        if info.compressed_size > u64::from(u32::MAX) || info.file_size > u64::from(u32::MAX) {
            saturated = true;
        }
        block_table.push(BlockEntry {
            file_pos: info.file_pos as u32,
            compressed_size: info.compressed_size.min(u64::from(u32::MAX)) as u32,
            file_size: info.file_size.min(u64::from(u32::MAX)) as u32,
            flags: info.flags,
        });
        hi.push((info.file_pos >> 32) as u16);
    }
    if saturated {
        log::warn!("BET table holds file sizes past 4 GiB, sizes saturated");
    }
    (block_table, hi)
}

/// Stored size of an extended table: the v4 header states it, earlier
/// versions leave it as the distance to the next region.
fn ext_table_stored_size(header: &Header, offset: u64, pick: fn(&crate::header::HeaderV4) -> u64) -> u64 {
    if let Some(v4) = header.v4.as_ref() {
        let stored = pick(v4);
        if stored != 0 {
            return stored;
        }
    }

    let mut end = header.archive_size_64();
    let neighbors = [
        (header.hash_table_size != 0).then(|| header.hash_table_offset()),
        (header.block_table_size != 0).then(|| header.block_table_offset()),
        header.hi_block_table_offset(),
        header.het_table_offset(),
        header.bet_table_offset(),
    ];
    for neighbor in neighbors.into_iter().flatten() {
        if neighbor > offset && neighbor < end {
            end = neighbor;
        }
    }
    end.saturating_sub(offset)
}

fn verify_table_digest(
    stored: &[u8],
    header: &Header,
    pick: fn(&crate::header::HeaderV4) -> (&'static str, [u8; 16]),
) -> Result<()> {
    let Some(v4) = header.v4.as_ref() else {
        return Ok(());
    };
    let (label, expected) = pick(v4);
    if expected == [0u8; 16] {
        return Ok(());
    }
    let digest: [u8; 16] = Md5::digest(stored).into();
    if digest != expected {
        return Err(Error::corrupt(format!("{label} MD5 mismatch")));
    }
    Ok(())
}

fn verify_stored_digest(
    file: &mut File,
    offset: u64,
    len: u64,
    header: &Header,
    pick: fn(&crate::header::HeaderV4) -> (&'static str, [u8; 16]),
) -> Result<()> {
    if header.v4.is_none() {
        return Ok(());
    }
    let stored = read_exact_at(file, offset, len)?;
    verify_table_digest(&stored, header, pick)
}

/// Checks the v4 header's digest of itself, which covers every header
/// byte before the digest field.
fn verify_header_digest(file: &mut File, archive_offset: u64, header: &Header) -> Result<()> {
    let Some(v4) = header.v4.as_ref() else {
        return Ok(());
    };
    if v4.md5_header == [0u8; 16] {
        return Ok(());
    }
    let covered = u64::from(header.header_size.min(FormatVersion::V4.header_size())) - 16;
    let raw = read_exact_at(file, archive_offset, covered)?;
    let digest: [u8; 16] = Md5::digest(&raw).into();
    if digest != v4.md5_header {
        return Err(Error::corrupt("header MD5 mismatch"));
    }
    Ok(())
}

/// Writes the tables at `data_end` and the header at the archive
/// start, filling in every size, offset, and digest field the format
/// version carries. The backing file is truncated past the new end.
pub(crate) fn layout_tables(
    file: &mut File,
    archive_offset: u64,
    header: &mut Header,
    hash_table: &HashTable,
    block_table: &BlockTable,
    hi_block_table: &[u16],
    data_end: u64,
) -> Result<()> {
    let hash_bytes = hash_table.to_encrypted_bytes();
    let block_bytes = block_table.to_encrypted_bytes();
    let hi_needed = header.format_version >= FormatVersion::V2
        && hi_block_table.iter().any(|&value| value != 0);
    let hi_bytes = if hi_needed {
        hi_block_table_bytes(hi_block_table)
    } else {
        Vec::new()
    };

    let hash_pos = data_end;
    let block_pos = hash_pos + hash_bytes.len() as u64;
    let hi_pos = block_pos + block_bytes.len() as u64;
    let total = hi_pos + hi_bytes.len() as u64;

    header.hash_table_pos = hash_pos as u32;
    header.block_table_pos = block_pos as u32;
    header.hash_table_size = hash_table.capacity();
    header.block_table_size = block_table.len();
    header.archive_size = u32::try_from(total).unwrap_or(0);
    if let Some(v2) = header.v2.as_mut() {
        v2.hash_table_pos_hi = (hash_pos >> 32) as u16;
        v2.block_table_pos_hi = (block_pos >> 32) as u16;
        v2.hi_block_table_pos = if hi_needed { hi_pos } else { 0 };
    }
    if let Some(v3) = header.v3.as_mut() {
        v3.archive_size_64 = total;
        v3.het_table_pos = 0;
        v3.bet_table_pos = 0;
    }
    if let Some(v4) = header.v4.as_mut() {
        v4.hash_table_size_64 = hash_bytes.len() as u64;
        v4.block_table_size_64 = block_bytes.len() as u64;
        v4.hi_block_table_size_64 = hi_bytes.len() as u64;
        v4.het_table_size_64 = 0;
        v4.bet_table_size_64 = 0;
        v4.raw_chunk_size = 0x4000;
        v4.md5_hash_table = Md5::digest(&hash_bytes).into();
        v4.md5_block_table = Md5::digest(&block_bytes).into();
        v4.md5_hi_block_table = Md5::digest(&hi_bytes).into();
        v4.md5_het_table = [0; 16];
        v4.md5_bet_table = [0; 16];
        v4.md5_header = [0; 16];
    }
    if header.v4.is_some() {
        // The header digests itself up to the digest field.
        let mut serialized = Vec::new();
        header.write(&mut serialized)?;
        let covered = serialized.len() - 16;
        let digest: [u8; 16] = Md5::digest(&serialized[..covered]).into();
        if let Some(v4) = header.v4.as_mut() {
            v4.md5_header = digest;
        }
    }

    write_all_at(file, archive_offset + hash_pos, &hash_bytes)?;
    write_all_at(file, archive_offset + block_pos, &block_bytes)?;
    if hi_needed {
        write_all_at(file, archive_offset + hi_pos, &hi_bytes)?;
    }

    let mut serialized = Vec::new();
    header.write(&mut serialized)?;
    write_all_at(file, archive_offset, &serialized)?;
    file.set_len(archive_offset + total)?;
    Ok(())
}
