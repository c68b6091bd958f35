//! Mach-O load command rewriting.
//!
//! Dependencies recorded by absolute in-tree path become `@loader_path`
//! relative, `LC_RPATH` entries pointing into the tree are made relative too,
//! and `LC_RPATH` commands that no longer serve an in-tree dependency are
//! removed. Strings are rewritten inside their existing command; removed
//! commands shrink `sizeofcmds` and leave zeroed padding behind, so the file
//! size and segment offsets never change.

use object::macho;
use object::read::macho::{LoadCommandVariant, MachHeader};
use object::{Endian, Endianness};
use std::path::{Path, PathBuf};

use super::{Binary, BinaryFormat, Placement, Relocatable, Rewrite, RewriteKind};
use crate::error::{Error, Result};
use crate::utils::{normalize, relative_path};

/// Offsets of `ncmds` and `sizeofcmds` in both header layouts.
const NCMDS_OFFSET: usize = 16;
const SIZEOFCMDS_OFFSET: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Load,
    Rpath,
    Other,
}

#[derive(Debug, Clone)]
struct Command {
    offset: usize,
    size: usize,
    role: Role,
    /// Offset of the path string within the command, and its current value.
    path: Option<(usize, String)>,
}

struct LoadCommands {
    endian: Endianness,
    header_size: usize,
    sizeofcmds: usize,
    commands: Vec<Command>,
}

impl LoadCommands {
    fn parse(data: &[u8]) -> Result<Self, String> {
        match object::FileKind::parse(data).map_err(|e| e.to_string())? {
            object::FileKind::MachO32 => Self::parse_header::<macho::MachHeader32<Endianness>>(data),
            object::FileKind::MachO64 => Self::parse_header::<macho::MachHeader64<Endianness>>(data),
            _ => Err("not a thin Mach-O file".to_string()),
        }
    }

    fn parse_header<Mach: MachHeader<Endian = Endianness>>(data: &[u8]) -> Result<Self, String> {
        let header = Mach::parse(data, 0).map_err(|e| e.to_string())?;
        let endian = header.endian().map_err(|e| e.to_string())?;
        let header_size = std::mem::size_of::<Mach>();

        let mut iter = header
            .load_commands(endian, data, 0)
            .map_err(|e| e.to_string())?;
        let mut commands = Vec::new();
        let mut offset = header_size;
        while let Some(command) = iter.next().map_err(|e| e.to_string())? {
            let size = command.cmdsize() as usize;
            let (role, name) = match command.variant().map_err(|e| e.to_string())? {
                LoadCommandVariant::Dylib(dylib) => (Role::Load, Some(dylib.dylib.name)),
                LoadCommandVariant::Rpath(rpath) => (Role::Rpath, Some(rpath.path)),
                _ => (Role::Other, None),
            };
            let path = match name {
                Some(name) => {
                    let text = command.string(endian, name).map_err(|e| e.to_string())?;
                    Some((
                        name.offset.get(endian) as usize,
                        String::from_utf8_lossy(text).into_owned(),
                    ))
                }
                None => None,
            };
            commands.push(Command {
                offset,
                size,
                role,
                path,
            });
            offset += size;
        }

        Ok(Self {
            endian,
            header_size,
            sizeofcmds: header.sizeofcmds(endian) as usize,
            commands,
        })
    }

    fn paths(&self, role: Role) -> Vec<String> {
        self.commands
            .iter()
            .filter(|c| c.role == role)
            .filter_map(|c| c.path.as_ref().map(|(_, p)| p.clone()))
            .collect()
    }
}

/// Resolve a loader-relative reference against the directory of the binary.
pub fn expand_loader_path(entry: &str, dir: &Path) -> Option<PathBuf> {
    let rest = entry
        .strip_prefix("@loader_path")
        .or_else(|| entry.strip_prefix("@executable_path"))?;
    Some(normalize(&dir.join(rest.trim_start_matches('/'))))
}

fn loader_relative(placement: &Placement, target: &Path) -> String {
    let rel = relative_path(placement.dir, target);
    if rel == Path::new(".") {
        "@loader_path".to_string()
    } else {
        format!("@loader_path/{}", rel.display())
    }
}

/// Whether a recorded dependency resolves into the tree.
fn in_tree_dependency(name: &str, placement: &Placement) -> bool {
    if let Some(path) = placement.in_tree(Path::new(name)) {
        return path.exists();
    }
    if let Some(path) = expand_loader_path(name, placement.dir) {
        return path.exists() && crate::utils::is_within(&path, placement.root);
    }
    if let Some(rest) = name.strip_prefix("@rpath/") {
        return placement.lib_dir.join(rest).exists();
    }
    false
}

pub struct MachOFormat;

impl Relocatable for MachOFormat {
    fn inspect(&self, path: &Path, data: &[u8]) -> Result<Binary> {
        let commands = LoadCommands::parse(data).map_err(|reason| Error::UnsupportedFormat {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(Binary {
            path: path.to_path_buf(),
            format: BinaryFormat::MachO,
            search_paths: commands.paths(Role::Rpath),
            dependencies: commands.paths(Role::Load),
        })
    }

    fn relocate(
        &self,
        binary: &Binary,
        data: &[u8],
        placement: &Placement,
    ) -> Result<Option<Rewrite>> {
        let parsed = LoadCommands::parse(data).map_err(|reason| Error::UnsupportedFormat {
            path: binary.path.clone(),
            reason,
        })?;
        let needs_tree = binary
            .dependencies
            .iter()
            .any(|name| in_tree_dependency(name, placement));

        let mut out = data.to_vec();
        let mut kept = Vec::with_capacity(parsed.commands.len());
        let mut removed = false;
        let mut rewritten = false;

        for command in &parsed.commands {
            let mut bytes = data[command.offset..command.offset + command.size].to_vec();
            if let Some((string_offset, value)) = &command.path {
                let target = placement.in_tree(Path::new(value));
                let replacement = match (command.role, target) {
                    (Role::Rpath, _) if !needs_tree => None,
                    (Role::Rpath, None) if value.starts_with('/') => None,
                    (_, Some(target)) => Some(loader_relative(placement, &target)),
                    _ => Some(value.clone()),
                };
                let Some(replacement) = replacement else {
                    removed = true;
                    continue;
                };
                if &replacement != value {
                    let available = command.size.saturating_sub(*string_offset + 1);
                    if replacement.len() > available {
                        return Err(Error::RelocationOverflow {
                            path: binary.path.clone(),
                            required: replacement.len(),
                            available,
                        });
                    }
                    bytes[*string_offset..].fill(0);
                    bytes[*string_offset..*string_offset + replacement.len()]
                        .copy_from_slice(replacement.as_bytes());
                    rewritten = true;
                }
            }
            kept.push(bytes);
        }

        if !removed && !rewritten {
            return Ok(None);
        }

        let region = parsed.header_size..parsed.header_size + parsed.sizeofcmds;
        let mut commands: Vec<u8> = kept.concat();
        let ncmds = kept.len() as u32;
        let sizeofcmds = commands.len() as u32;
        commands.resize(parsed.sizeofcmds, 0);
        out[region].copy_from_slice(&commands);
        out[NCMDS_OFFSET..NCMDS_OFFSET + 4].copy_from_slice(&parsed.endian.write_u32_bytes(ncmds));
        out[SIZEOFCMDS_OFFSET..SIZEOFCMDS_OFFSET + 4]
            .copy_from_slice(&parsed.endian.write_u32_bytes(sizeofcmds));

        let kind = if needs_tree {
            RewriteKind::Relative
        } else {
            RewriteKind::Stripped
        };
        Ok(Some(Rewrite { bytes: out, kind }))
    }
}
