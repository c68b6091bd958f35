//! Minimal binary writers used by the tests.
//!
//! These produce just enough of an ELF shared object or a Mach-O dylib for the
//! relocation engine to parse: a dynamic section with NEEDED and search path
//! entries, or a load command list with dylib and rpath commands.

use object::endian::{BigEndian, U16, U32, U64};
use object::pod::bytes_of;
use object::Endianness;

const LE: Endianness = Endianness::Little;

fn u16(v: u16) -> U16<Endianness> {
    U16::new(LE, v)
}
fn u32(v: u32) -> U32<Endianness> {
    U32::new(LE, v)
}
fn u64(v: u64) -> U64<Endianness> {
    U64::new(LE, v)
}

fn pad_to(buffer: &mut Vec<u8>, align: usize) {
    while buffer.len() % align != 0 {
        buffer.push(0);
    }
}

/// Which dynamic tag carries the search path.
#[derive(Clone, Copy)]
pub enum SearchTag {
    Rpath,
    Runpath,
}

/// Description of a little-endian ELF64 shared object.
pub struct ElfSpec<'a> {
    pub needed: &'a [&'a str],
    pub search: Option<(SearchTag, &'a str)>,
    /// Omit section headers so only the program headers locate `.dynamic`.
    pub stripped_sections: bool,
}

impl<'a> ElfSpec<'a> {
    pub fn new(needed: &'a [&'a str], search: Option<(SearchTag, &'a str)>) -> Self {
        Self {
            needed,
            search,
            stripped_sections: false,
        }
    }
}

pub fn elf(spec: &ElfSpec) -> Vec<u8> {
    const EHDR: usize = 64;
    const PHDR: usize = 56;
    const SHDR: usize = 64;
    const DYN: usize = 16;

    // .dynstr
    let mut dynstr = vec![0u8];
    let mut needed_offsets = Vec::new();
    for name in spec.needed {
        needed_offsets.push(dynstr.len() as u64);
        dynstr.extend_from_slice(name.as_bytes());
        dynstr.push(0);
    }
    let search_offset = spec.search.map(|(_, value)| {
        let offset = dynstr.len() as u64;
        dynstr.extend_from_slice(value.as_bytes());
        dynstr.push(0);
        offset
    });

    let dynstr_offset = EHDR + 2 * PHDR;
    let mut dynstr_padded = dynstr.clone();
    while (dynstr_offset + dynstr_padded.len()) % 8 != 0 {
        dynstr_padded.push(0);
    }
    let dynamic_offset = dynstr_offset + dynstr_padded.len();

    // .dynamic
    let mut entries: Vec<(u32, u64)> = needed_offsets
        .iter()
        .map(|&off| (object::elf::DT_NEEDED, off))
        .collect();
    if let (Some((tag, _)), Some(off)) = (spec.search, search_offset) {
        let tag = match tag {
            SearchTag::Rpath => object::elf::DT_RPATH,
            SearchTag::Runpath => object::elf::DT_RUNPATH,
        };
        entries.push((tag, off));
    }
    entries.push((object::elf::DT_STRTAB, dynstr_offset as u64));
    entries.push((object::elf::DT_STRSZ, dynstr.len() as u64));
    entries.push((object::elf::DT_NULL, 0));
    entries.push((object::elf::DT_NULL, 0));
    let dynamic_size = entries.len() * DYN;

    let shstrtab: &[u8] = b"\0.dynstr\0.dynamic\0.shstrtab\0";
    let shstrtab_offset = dynamic_offset + dynamic_size;
    let mut shoff = shstrtab_offset + shstrtab.len();
    shoff += (8 - shoff % 8) % 8;
    let shnum: u16 = if spec.stripped_sections { 0 } else { 4 };
    let total = if spec.stripped_sections {
        shstrtab_offset
    } else {
        shoff + shnum as usize * SHDR
    };

    let mut buffer = Vec::new();
    let header = object::elf::FileHeader64::<Endianness> {
        e_ident: object::elf::Ident {
            magic: object::elf::ELFMAG,
            class: object::elf::ELFCLASS64,
            data: object::elf::ELFDATA2LSB,
            version: object::elf::EV_CURRENT,
            os_abi: object::elf::ELFOSABI_SYSV,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: u16(object::elf::ET_DYN),
        e_machine: u16(object::elf::EM_X86_64),
        e_version: u32(object::elf::EV_CURRENT as u32),
        e_entry: u64(0),
        e_phoff: u64(EHDR as u64),
        e_shoff: u64(if spec.stripped_sections { 0 } else { shoff as u64 }),
        e_flags: u32(0),
        e_ehsize: u16(EHDR as u16),
        e_phentsize: u16(PHDR as u16),
        e_phnum: u16(2),
        e_shentsize: u16(SHDR as u16),
        e_shnum: u16(shnum),
        e_shstrndx: u16(if spec.stripped_sections { 0 } else { 3 }),
    };
    buffer.extend_from_slice(bytes_of(&header));

    let load = object::elf::ProgramHeader64::<Endianness> {
        p_type: u32(object::elf::PT_LOAD),
        p_flags: u32(object::elf::PF_R),
        p_offset: u64(0),
        p_vaddr: u64(0),
        p_paddr: u64(0),
        p_filesz: u64(total as u64),
        p_memsz: u64(total as u64),
        p_align: u64(0x1000),
    };
    buffer.extend_from_slice(bytes_of(&load));
    let dynamic = object::elf::ProgramHeader64::<Endianness> {
        p_type: u32(object::elf::PT_DYNAMIC),
        p_flags: u32(object::elf::PF_R | object::elf::PF_W),
        p_offset: u64(dynamic_offset as u64),
        p_vaddr: u64(dynamic_offset as u64),
        p_paddr: u64(dynamic_offset as u64),
        p_filesz: u64(dynamic_size as u64),
        p_memsz: u64(dynamic_size as u64),
        p_align: u64(8),
    };
    buffer.extend_from_slice(bytes_of(&dynamic));

    buffer.extend_from_slice(&dynstr_padded);
    for (tag, val) in entries {
        let entry = object::elf::Dyn64::<Endianness> {
            d_tag: u64(tag as u64),
            d_val: u64(val),
        };
        buffer.extend_from_slice(bytes_of(&entry));
    }
    if spec.stripped_sections {
        return buffer;
    }

    buffer.extend_from_slice(shstrtab);
    pad_to(&mut buffer, 8);

    let section = |name: u32, kind: u32, offset: usize, size: usize, link: u32, entsize: u64| {
        object::elf::SectionHeader64::<Endianness> {
            sh_name: u32(name),
            sh_type: u32(kind),
            sh_flags: u64(0),
            sh_addr: u64(offset as u64),
            sh_offset: u64(offset as u64),
            sh_size: u64(size as u64),
            sh_link: u32(link),
            sh_info: u32(0),
            sh_addralign: u64(if kind == object::elf::SHT_NULL { 0 } else { 1 }),
            sh_entsize: u64(entsize),
        }
    };
    let null = section(0, object::elf::SHT_NULL, 0, 0, 0, 0);
    let dynstr_section = section(1, object::elf::SHT_STRTAB, dynstr_offset, dynstr.len(), 0, 0);
    let dynamic_section = section(
        9,
        object::elf::SHT_DYNAMIC,
        dynamic_offset,
        dynamic_size,
        1,
        DYN as u64,
    );
    let shstrtab_section = section(
        18,
        object::elf::SHT_STRTAB,
        shstrtab_offset,
        shstrtab.len(),
        0,
        0,
    );
    for s in [null, dynstr_section, dynamic_section, shstrtab_section] {
        buffer.extend_from_slice(bytes_of(&s));
    }
    buffer
}

/// Little-endian 64-bit Mach-O dylib with the given load and rpath commands.
pub fn macho(dylibs: &[&str], rpaths: &[&str]) -> Vec<u8> {
    use object::macho;

    let mut commands = Vec::new();
    let mut ncmds = 0u32;
    for name in dylibs {
        let fixed = std::mem::size_of::<macho::DylibCommand<Endianness>>();
        let mut size = fixed + name.len() + 1;
        size += (8 - size % 8) % 8;
        let command = macho::DylibCommand::<Endianness> {
            cmd: u32(macho::LC_LOAD_DYLIB),
            cmdsize: u32(size as u32),
            dylib: macho::Dylib {
                name: macho::LcStr {
                    offset: u32(fixed as u32),
                },
                timestamp: u32(2),
                current_version: u32(0x10000),
                compatibility_version: u32(0x10000),
            },
        };
        let start = commands.len();
        commands.extend_from_slice(bytes_of(&command));
        commands.extend_from_slice(name.as_bytes());
        commands.resize(start + size, 0);
        ncmds += 1;
    }
    for path in rpaths {
        let fixed = std::mem::size_of::<macho::RpathCommand<Endianness>>();
        let mut size = fixed + path.len() + 1;
        size += (8 - size % 8) % 8;
        let command = macho::RpathCommand::<Endianness> {
            cmd: u32(macho::LC_RPATH),
            cmdsize: u32(size as u32),
            path: macho::LcStr {
                offset: u32(fixed as u32),
            },
        };
        let start = commands.len();
        commands.extend_from_slice(bytes_of(&command));
        commands.extend_from_slice(path.as_bytes());
        commands.resize(start + size, 0);
        ncmds += 1;
    }

    let header = macho::MachHeader64::<Endianness> {
        magic: U32::new(BigEndian, macho::MH_CIGAM_64),
        cputype: u32(macho::CPU_TYPE_ARM64),
        cpusubtype: u32(0),
        filetype: u32(macho::MH_DYLIB),
        ncmds: u32(ncmds),
        sizeofcmds: u32(commands.len() as u32),
        flags: u32(0),
        reserved: u32(0),
    };
    let mut buffer = Vec::new();
    buffer.extend_from_slice(bytes_of(&header));
    buffer.extend_from_slice(&commands);
    // Stand-in for segment contents following the load commands.
    buffer.extend_from_slice(&[0xAB; 64]);
    buffer
}
