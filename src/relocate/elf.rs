//! ELF search path rewriting.
//!
//! The dynamic section is located through the section table when present and
//! through `PT_DYNAMIC` otherwise. Rewrites only ever overwrite the existing
//! `DT_RPATH`/`DT_RUNPATH` string in `.dynstr`, retag the entry, or remove it by
//! shifting the following entries up; the file never changes size.

use object::elf;
use object::read::elf::{FileHeader, ProgramHeader, SectionHeader};
use object::{Endian, Endianness, SectionIndex};
use std::ops::Range;
use std::path::{Path, PathBuf};

use super::{Binary, BinaryFormat, Placement, Relocatable, Rewrite, RewriteKind};
use crate::error::{Error, Result};
use crate::utils::is_within;

/// Libraries provided by the C runtime on every target system. These never
/// count as dependencies satisfied by the tree.
pub const SYSTEM_LIBRARIES: &[&str] = &[
    "linux-vdso.so.1",
    "ld-linux-x86-64.so.2",
    "ld-linux-aarch64.so.1",
    "libc.so.6",
    "libdl.so.2",
    "libgcc_s.so.1",
    "libgcc_s.so.2",
    "libm.so.6",
    "libmd.so.0",
    "libmemusage.so",
    "libnsl.so.1",
    "libpcprofile.so",
    "libpthread.so.0",
    "libresolv.so.2",
    "librt.so.1",
    "libthread_db.so.1",
    "libutil.so.1",
    "libutil.so.2",
];

pub fn is_system_library(name: &str) -> bool {
    SYSTEM_LIBRARIES.contains(&name) || (name.starts_with("libnss_") && name.ends_with(".so.2"))
}

/// Whether a search path entry is resolved relative to the object itself.
pub fn is_origin_relative(entry: &str) -> bool {
    entry.starts_with("$ORIGIN") || entry.starts_with("${ORIGIN}")
}

/// Expand `$ORIGIN` in a search path entry against the directory of the object.
pub fn expand_origin(entry: &str, dir: &Path) -> Option<PathBuf> {
    let rest = entry
        .strip_prefix("${ORIGIN}")
        .or_else(|| entry.strip_prefix("$ORIGIN"))?;
    Some(crate::utils::normalize(
        &dir.join(rest.trim_start_matches('/')),
    ))
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: usize,
    tag: u64,
    val: u64,
}

/// The dynamic section of an ELF image, decoded enough to patch it.
struct DynamicTable {
    endian: Endianness,
    word: usize,
    entries: Vec<Entry>,
    /// Offset one past the last entry slot in the section.
    end: usize,
    strtab: Range<usize>,
}

impl DynamicTable {
    fn parse(data: &[u8]) -> Result<Option<Self>, String> {
        match object::FileKind::parse(data).map_err(|e| e.to_string())? {
            object::FileKind::Elf32 => Self::parse_header::<elf::FileHeader32<Endianness>>(data),
            object::FileKind::Elf64 => Self::parse_header::<elf::FileHeader64<Endianness>>(data),
            _ => Err("not an ELF file".to_string()),
        }
    }

    fn parse_header<Elf: FileHeader<Endian = Endianness>>(
        data: &[u8],
    ) -> Result<Option<Self>, String> {
        let header = Elf::parse(data).map_err(|e| e.to_string())?;
        let endian = header.endian().map_err(|e| e.to_string())?;
        let word = if header.is_type_64() { 8 } else { 4 };

        let mut dynamic: Option<(u64, u64)> = None;
        let mut strtab: Option<(u64, u64)> = None;
        let sections = header.sections(endian, data).map_err(|e| e.to_string())?;
        if let Some(section) = sections
            .iter()
            .find(|s| s.sh_type(endian) == elf::SHT_DYNAMIC)
        {
            dynamic = Some((section.sh_offset(endian).into(), section.sh_size(endian).into()));
            let link = sections
                .section(SectionIndex(section.sh_link(endian) as usize))
                .map_err(|e| e.to_string())?;
            strtab = Some((link.sh_offset(endian).into(), link.sh_size(endian).into()));
        }

        let segments = header
            .program_headers(endian, data)
            .map_err(|e| e.to_string())?;
        if dynamic.is_none() {
            dynamic = segments
                .iter()
                .find(|ph| ph.p_type(endian) == elf::PT_DYNAMIC)
                .map(|ph| (ph.p_offset(endian).into(), ph.p_filesz(endian).into()));
        }
        let Some((offset, size)) = dynamic else {
            // Statically linked.
            return Ok(None);
        };

        let start = offset as usize;
        let end = start
            .checked_add(size as usize)
            .filter(|&end| end <= data.len())
            .ok_or("dynamic section out of bounds")?;
        let end = start + (end - start) / (2 * word) * (2 * word);
        let mut entries = Vec::new();
        let mut at = start;
        while at + 2 * word <= end {
            let tag = read_word(data, at, word, endian)?;
            let val = read_word(data, at + word, word, endian)?;
            entries.push(Entry {
                offset: at,
                tag,
                val,
            });
            if tag == u64::from(elf::DT_NULL) {
                break;
            }
            at += 2 * word;
        }

        let strtab = match strtab {
            Some(found) => found,
            None => {
                let value = |tag: u32| {
                    entries
                        .iter()
                        .find(|e| e.tag == u64::from(tag))
                        .map(|e| e.val)
                };
                let addr = value(elf::DT_STRTAB).ok_or("missing DT_STRTAB")?;
                let size = value(elf::DT_STRSZ).ok_or("missing DT_STRSZ")?;
                let file_offset = segments
                    .iter()
                    .filter(|ph| ph.p_type(endian) == elf::PT_LOAD)
                    .find_map(|ph| {
                        let vaddr: u64 = ph.p_vaddr(endian).into();
                        let filesz: u64 = ph.p_filesz(endian).into();
                        let poffset: u64 = ph.p_offset(endian).into();
                        (vaddr <= addr && addr < vaddr + filesz).then(|| addr - vaddr + poffset)
                    })
                    .ok_or("DT_STRTAB not in a loaded segment")?;
                (file_offset, size)
            }
        };
        let strtab_start = strtab.0 as usize;
        let strtab_end = strtab_start
            .checked_add(strtab.1 as usize)
            .filter(|&end| end <= data.len())
            .ok_or("string table out of bounds")?;

        Ok(Some(Self {
            endian,
            word,
            entries,
            end,
            strtab: strtab_start..strtab_end,
        }))
    }

    /// The string at `offset` in the dynamic string table.
    fn string<'d>(&self, data: &'d [u8], offset: u64) -> Option<&'d [u8]> {
        let start = self.strtab.start.checked_add(offset as usize)?;
        let table = data.get(start..self.strtab.end)?;
        let len = table.iter().position(|&b| b == 0)?;
        Some(&table[..len])
    }

    fn strings(&self, data: &[u8], tag: u32) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.tag == u64::from(tag))
            .filter_map(|e| self.string(data, e.val))
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect()
    }

    fn search_entries(&self) -> Vec<(usize, Entry)> {
        self.entries
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, e)| e.tag == u64::from(elf::DT_RPATH) || e.tag == u64::from(elf::DT_RUNPATH))
            .collect()
    }

    fn set_tag(&self, out: &mut [u8], entry: &Entry, tag: u32) {
        write_word(out, entry.offset, self.word, self.endian, u64::from(tag));
    }

    /// Remove entry `index`, shifting every later slot up by one.
    fn remove(&self, out: &mut [u8], index: usize) {
        let size = 2 * self.word;
        let at = self.entries[index].offset;
        out.copy_within(at + size..self.end, at);
        out[self.end - size..self.end].fill(0);
    }
}

fn read_word(data: &[u8], at: usize, word: usize, endian: Endianness) -> Result<u64, String> {
    let bytes = data
        .get(at..at + word)
        .ok_or("dynamic entry out of bounds")?;
    Ok(if word == 8 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        endian.read_u64_bytes(raw)
    } else {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(bytes);
        u64::from(endian.read_u32_bytes(raw))
    })
}

fn write_word(out: &mut [u8], at: usize, word: usize, endian: Endianness, value: u64) {
    if word == 8 {
        out[at..at + 8].copy_from_slice(&endian.write_u64_bytes(value));
    } else {
        out[at..at + 4].copy_from_slice(&endian.write_u32_bytes(value as u32));
    }
}

fn unsupported(path: &Path, reason: String) -> Error {
    Error::UnsupportedFormat {
        path: path.to_path_buf(),
        reason,
    }
}

pub struct ElfFormat;

impl ElfFormat {
    fn table(&self, path: &Path, data: &[u8]) -> Result<Option<DynamicTable>> {
        DynamicTable::parse(data).map_err(|e| unsupported(path, e))
    }
}

impl Relocatable for ElfFormat {
    fn inspect(&self, path: &Path, data: &[u8]) -> Result<Binary> {
        let mut binary = Binary {
            path: path.to_path_buf(),
            format: BinaryFormat::Elf,
            search_paths: Vec::new(),
            dependencies: Vec::new(),
        };
        if let Some(table) = self.table(path, data)? {
            binary.dependencies = table.strings(data, elf::DT_NEEDED);
            binary.search_paths = table
                .search_entries()
                .iter()
                .filter_map(|(_, e)| table.string(data, e.val))
                .flat_map(|s| {
                    String::from_utf8_lossy(s)
                        .split(':')
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .collect();
        }
        Ok(binary)
    }

    fn relocate(
        &self,
        binary: &Binary,
        data: &[u8],
        placement: &Placement,
    ) -> Result<Option<Rewrite>> {
        let Some(table) = self.table(&binary.path, data)? else {
            return Ok(None);
        };
        let search = table.search_entries();
        let needs_lib = binary
            .dependencies
            .iter()
            .any(|name| provided_by_tree(name, placement));
        // Entries like `$ORIGIN/../pkg.libs` that already resolve a dependency
        // inside the tree.
        let origin_dirs: Vec<PathBuf> = binary
            .search_paths
            .iter()
            .filter_map(|entry| expand_origin(entry, placement.dir))
            .filter(|dir| is_within(dir, placement.root))
            .collect();
        let needs_origin = binary.dependencies.iter().any(|name| {
            !is_system_library(name) && origin_dirs.iter().any(|d| d.join(name).exists())
        });

        let mut out = data.to_vec();
        if !needs_lib && !needs_origin {
            if search.is_empty() {
                return Ok(None);
            }
            for (index, _) in search.iter().rev() {
                table.remove(&mut out, *index);
            }
            return Ok(Some(Rewrite {
                bytes: out,
                kind: RewriteKind::Stripped,
            }));
        }

        let mut value = Vec::new();
        if needs_lib {
            let rel = placement.lib_dir_relative();
            value.push(if rel == Path::new(".") {
                "$ORIGIN".to_string()
            } else {
                format!("$ORIGIN/{}", rel.display())
            });
        }
        for entry in &binary.search_paths {
            let inside = expand_origin(entry, placement.dir)
                .is_some_and(|dir| is_within(&dir, placement.root));
            if inside && !value.contains(entry) {
                value.push(entry.clone());
            }
        }
        let value = value.join(":");

        let Some(&(_, primary)) = search.first() else {
            return Err(Error::RelocationOverflow {
                path: binary.path.clone(),
                required: value.len(),
                available: 0,
            });
        };
        let current = table.string(data, primary.val).unwrap_or_default();
        let retag = placement.force_rpath && primary.tag == u64::from(elf::DT_RUNPATH);
        if current == value.as_bytes() && !retag && search.len() == 1 {
            return Ok(None);
        }
        if value.len() > current.len() {
            return Err(Error::RelocationOverflow {
                path: binary.path.clone(),
                required: value.len(),
                available: current.len(),
            });
        }

        let start = table.strtab.start + primary.val as usize;
        out[start..start + current.len()].fill(0);
        out[start..start + value.len()].copy_from_slice(value.as_bytes());
        if retag {
            table.set_tag(&mut out, &primary, elf::DT_RPATH);
        }
        for (index, _) in search.iter().skip(1).rev() {
            table.remove(&mut out, *index);
        }
        Ok(Some(Rewrite {
            bytes: out,
            kind: RewriteKind::Relative,
        }))
    }
}

/// Whether the tree's library directory satisfies a `DT_NEEDED` entry.
fn provided_by_tree(name: &str, placement: &Placement) -> bool {
    if name.contains('/') {
        return placement
            .in_tree(Path::new(name))
            .is_some_and(|path| path.exists());
    }
    !is_system_library(name) && placement.lib_dir.join(name).exists()
}
