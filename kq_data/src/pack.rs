use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail, ensure};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use memmap2::{Mmap, MmapOptions};

const SIGNATURE: &[u8; 4] = b"KQPK";
const VERSION: u32 = 1;
const HEADER_SIZE: usize = 16;
const ENTRY_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub name: String,
    pub offset: u64,
    pub size: u32,
}

impl PackEntry {
    pub fn data_range(&self) -> Range<usize> {
        let start = self.offset as usize;
        let end = start + self.size as usize;
        start..end
    }
}

/// Read-only view over a `.kq` pack archive.
///
/// Layout (little endian): `KQPK`, version, entry count, name table length,
/// then one 16-byte record per entry (name offset, data offset, size,
/// reserved), the NUL-separated name table and finally the payloads.
#[derive(Debug)]
pub struct PackArchive {
    path: PathBuf,
    mmap: Mmap,
    entries: Vec<PackEntry>,
}

impl PackArchive {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let file = File::open(&path_buf)
            .with_context(|| format!("opening pack archive at {}", path_buf.display()))?;
        let mmap = unsafe { MmapOptions::new().map(&file) }
            .with_context(|| format!("memory-mapping pack archive {}", path_buf.display()))?;

        let entries = parse_entries(&mmap)
            .with_context(|| format!("parsing pack archive {}", path_buf.display()))?;

        Ok(PackArchive {
            path: path_buf,
            mmap,
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[PackEntry] {
        &self.entries
    }

    pub fn find_entry(&self, name: &str) -> Option<&PackEntry> {
        let wanted = normalize_name(name);
        self.entries.iter().find(|entry| entry.name == wanted)
    }

    pub fn read_entry_bytes(&self, entry: &PackEntry) -> &[u8] {
        &self.mmap[entry.data_range()]
    }

    pub fn extract_entry<P: AsRef<Path>>(&self, entry: &PackEntry, dest: P) -> Result<()> {
        let bytes = self.read_entry_bytes(entry);
        let mut file = File::create(dest.as_ref())
            .with_context(|| format!("creating {}", dest.as_ref().display()))?;
        file.write_all(bytes)
            .with_context(|| format!("writing {}", dest.as_ref().display()))?;
        Ok(())
    }
}

fn parse_entries(mmap: &[u8]) -> Result<Vec<PackEntry>> {
    ensure!(
        mmap.len() >= HEADER_SIZE,
        "pack archive is too small to contain a header"
    );

    let header = &mmap[..HEADER_SIZE];
    if &header[0..4] != SIGNATURE {
        bail!("pack archive missing KQPK signature");
    }
    let version = LittleEndian::read_u32(&header[4..8]);
    ensure!(version == VERSION, "unsupported pack version {version}");

    let file_count = LittleEndian::read_u32(&header[8..12]) as usize;
    let name_list_len = LittleEndian::read_u32(&header[12..16]) as usize;

    let entries_bytes_len = file_count
        .checked_mul(ENTRY_SIZE)
        .ok_or_else(|| anyhow!("pack archive entry count overflow"))?;
    let names_offset = HEADER_SIZE + entries_bytes_len;
    let names_end = names_offset
        .checked_add(name_list_len)
        .ok_or_else(|| anyhow!("pack archive name table overflow"))?;
    ensure!(
        names_end <= mmap.len(),
        "pack archive truncated before name table"
    );

    let entries_block = &mmap[HEADER_SIZE..names_offset];
    let names_block = &mmap[names_offset..names_end];

    let mut entries = Vec::with_capacity(file_count);
    for index in 0..file_count {
        let record = &entries_block[index * ENTRY_SIZE..(index + 1) * ENTRY_SIZE];
        let name_offset = LittleEndian::read_u32(&record[0..4]) as usize;
        let data_offset = LittleEndian::read_u32(&record[4..8]) as usize;
        let size = LittleEndian::read_u32(&record[8..12]);

        ensure!(
            name_offset < name_list_len,
            "pack entry {index} has invalid name offset {name_offset}"
        );
        let end = data_offset
            .checked_add(size as usize)
            .ok_or_else(|| anyhow!("pack entry {index} size overflow"))?;
        ensure!(
            data_offset >= names_end && end <= mmap.len(),
            "pack entry {index} data lies outside the payload area"
        );

        let name = read_c_string(names_block, name_offset)
            .with_context(|| format!("reading name for entry {index}"))?;
        entries.push(PackEntry {
            name,
            offset: data_offset as u64,
            size,
        });
    }

    Ok(entries)
}

fn read_c_string(table: &[u8], offset: usize) -> Result<String> {
    if offset >= table.len() {
        bail!("name offset beyond table length");
    }
    let end = table[offset..]
        .iter()
        .position(|&b| b == 0)
        .map(|len| offset + len)
        .unwrap_or(table.len());
    ensure!(end > offset, "empty pack entry name");
    Ok(String::from_utf8_lossy(&table[offset..end]).into_owned())
}

/// Archive names always use forward slashes and never start with one.
pub fn normalize_name(name: &str) -> String {
    name.replace('\\', "/").trim_start_matches('/').to_string()
}

/// Accumulates files in memory and writes them out as a pack archive.
#[derive(Debug, Default)]
pub struct PackWriter {
    files: Vec<(String, Vec<u8>)>,
}

impl PackWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, bytes: Vec<u8>) -> Result<()> {
        let name = normalize_name(name);
        ensure!(!name.is_empty(), "pack entry names must not be empty");
        ensure!(!name.contains('\0'), "pack entry name {name:?} contains NUL");
        if self.files.iter().any(|(existing, _)| *existing == name) {
            bail!("duplicate pack entry {name}");
        }
        self.files.push((name, bytes));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file =
            File::create(path).with_context(|| format!("creating pack {}", path.display()))?;
        let mut out = BufWriter::new(file);
        self.write(&mut out)
            .with_context(|| format!("writing pack {}", path.display()))?;
        out.flush()
            .with_context(|| format!("flushing pack {}", path.display()))?;
        Ok(())
    }

    fn write<W: Write>(&self, out: &mut W) -> Result<()> {
        let mut names = Vec::new();
        let mut name_offsets = Vec::with_capacity(self.files.len());
        for (name, _) in &self.files {
            name_offsets.push(names.len());
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }

        let payload_start = HEADER_SIZE + self.files.len() * ENTRY_SIZE + names.len();

        out.write_all(SIGNATURE)?;
        out.write_u32::<LittleEndian>(VERSION)?;
        out.write_u32::<LittleEndian>(to_u32(self.files.len(), "entry count")?)?;
        out.write_u32::<LittleEndian>(to_u32(names.len(), "name table length")?)?;

        let mut data_offset = payload_start;
        for ((_, bytes), name_offset) in self.files.iter().zip(&name_offsets) {
            out.write_u32::<LittleEndian>(to_u32(*name_offset, "name offset")?)?;
            out.write_u32::<LittleEndian>(to_u32(data_offset, "data offset")?)?;
            out.write_u32::<LittleEndian>(to_u32(bytes.len(), "entry size")?)?;
            out.write_u32::<LittleEndian>(0)?;
            data_offset += bytes.len();
        }
        out.write_all(&names)?;
        for (_, bytes) in &self.files {
            out.write_all(bytes)?;
        }
        Ok(())
    }
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| anyhow!("{what} {value} does not fit in a pack archive"))
}
