//! Executable image emission.
//!
//! Builds the final ELF executable from a relocated [`LayoutPlan`]: file
//! header, one RWX `PT_LOAD` program header, the segment bytes in `.text`,
//! `.rodata`, `.data` order, then section headers and a `.shstrtab` so the
//! output stays inspectable. `.bss` contributes only to `p_memsz`, never to
//! the file.

use object::endian::{U16, U32, U64};
use object::pod::bytes_of;
use object::Endianness;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::arch::Architecture;
use crate::layout::{LayoutPlan, PAGE_SIZE};
use crate::object_file::SectionKind;

/// The sole output of a link: the executable bytes and their entry point.
#[derive(Debug)]
pub struct Image {
    pub bytes: Vec<u8>,
    pub entry_point: u64,
}

impl Image {
    /// Writes the image to disk and marks it executable.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, &self.bytes)?;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms)
    }
}

fn u16(e: Endianness, v: u16) -> U16<Endianness> {
    U16::new(e, v)
}
fn u32(e: Endianness, v: u32) -> U32<Endianness> {
    U32::new(e, v)
}
fn u64(e: Endianness, v: u64) -> U64<Endianness> {
    U64::new(e, v)
}

/// Serializes the laid-out, relocated segments into an executable image.
pub fn build_image<A: Architecture>(plan: &LayoutPlan, entry_point: u64, arch: &A) -> Image {
    let e = arch.endianness();
    let mut buffer = Vec::new();
    let num_sections = plan.segments.len() as u16 + 2;

    let file_header = object::elf::FileHeader64::<Endianness> {
        e_ident: object::elf::Ident {
            magic: object::elf::ELFMAG,
            class: object::elf::ELFCLASS64,
            data: object::elf::ELFDATA2LSB,
            version: object::elf::EV_CURRENT,
            os_abi: object::elf::ELFOSABI_SYSV,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: u16(e, object::elf::ET_EXEC),
        e_machine: u16(e, arch.elf_machine()),
        e_version: u32(e, object::elf::EV_CURRENT as u32),
        e_entry: u64(e, entry_point),
        e_phoff: u64(e, 64),
        e_shoff: u64(e, 0), // Patched once the section headers are placed
        e_flags: u32(e, 0),
        e_ehsize: u16(e, 64),
        e_phentsize: u16(e, 56),
        e_phnum: u16(e, 1),
        e_shentsize: u16(e, 64),
        e_shnum: u16(e, num_sections),
        e_shstrndx: u16(e, num_sections - 1),
    };
    buffer.extend_from_slice(bytes_of(&file_header));

    let file_size = plan
        .segments
        .iter()
        .filter(|s| !s.is_bss() && s.size > 0)
        .next_back()
        .map_or(PAGE_SIZE, |s| s.file_offset + s.size);

    let mem_end = plan
        .segments
        .iter()
        .filter(|s| s.size > 0)
        .map(|s| s.virtual_address + s.size)
        .max()
        .unwrap_or(plan.base_address + PAGE_SIZE);
    let mem_size = (mem_end - plan.base_address).max(file_size);

    let prog_header = object::elf::ProgramHeader64::<Endianness> {
        p_type: u32(e, object::elf::PT_LOAD),
        p_flags: u32(e, object::elf::PF_R | object::elf::PF_W | object::elf::PF_X),
        p_offset: u64(e, 0),
        p_vaddr: u64(e, plan.base_address),
        p_paddr: u64(e, plan.base_address),
        p_filesz: u64(e, file_size),
        p_memsz: u64(e, mem_size),
        p_align: u64(e, PAGE_SIZE),
    };
    buffer.extend_from_slice(bytes_of(&prog_header));

    // Pad the header page.
    if (buffer.len() as u64) < PAGE_SIZE {
        buffer.resize(PAGE_SIZE as usize, 0);
    }

    for segment in &plan.segments {
        if segment.is_bss() || segment.size == 0 {
            continue;
        }
        let current = buffer.len() as u64;
        if segment.file_offset > current {
            buffer.resize(segment.file_offset as usize, 0);
        }
        buffer.extend_from_slice(&segment.data);
    }

    // Section header string table.
    let mut shstrtab = vec![0u8];
    let mut name_offsets = vec![0usize];
    for segment in &plan.segments {
        name_offsets.push(shstrtab.len());
        shstrtab.extend_from_slice(segment.name.as_bytes());
        shstrtab.push(0);
    }
    name_offsets.push(shstrtab.len());
    shstrtab.extend_from_slice(b".shstrtab\0");

    let shoff = buffer.len();

    let null_sec = object::elf::SectionHeader64::<Endianness> {
        sh_name: u32(e, 0),
        sh_type: u32(e, object::elf::SHT_NULL),
        sh_flags: u64(e, 0),
        sh_addr: u64(e, 0),
        sh_offset: u64(e, 0),
        sh_size: u64(e, 0),
        sh_link: u32(e, 0),
        sh_info: u32(e, 0),
        sh_addralign: u64(e, 0),
        sh_entsize: u64(e, 0),
    };
    buffer.extend_from_slice(bytes_of(&null_sec));

    for (i, segment) in plan.segments.iter().enumerate() {
        let sh_type = if segment.is_bss() {
            object::elf::SHT_NOBITS
        } else {
            object::elf::SHT_PROGBITS
        };
        let sh_flags = match segment.kind {
            SectionKind::Code => object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR,
            SectionKind::Rodata => object::elf::SHF_ALLOC,
            SectionKind::Data | SectionKind::Bss => {
                object::elf::SHF_ALLOC | object::elf::SHF_WRITE
            }
        };
        let sec_header = object::elf::SectionHeader64::<Endianness> {
            sh_name: u32(e, name_offsets[i + 1] as u32),
            sh_type: u32(e, sh_type),
            sh_flags: u64(e, sh_flags as u64),
            sh_addr: u64(e, segment.virtual_address),
            sh_offset: u64(e, segment.file_offset),
            sh_size: u64(e, segment.size),
            sh_link: u32(e, 0),
            sh_info: u32(e, 0),
            sh_addralign: u64(e, 16),
            sh_entsize: u64(e, 0),
        };
        buffer.extend_from_slice(bytes_of(&sec_header));
    }

    let shstrtab_header = object::elf::SectionHeader64::<Endianness> {
        sh_name: u32(e, name_offsets[name_offsets.len() - 1] as u32),
        sh_type: u32(e, object::elf::SHT_STRTAB),
        sh_flags: u64(e, 0),
        sh_addr: u64(e, 0),
        sh_offset: u64(e, (shoff + num_sections as usize * 64) as u64),
        sh_size: u64(e, shstrtab.len() as u64),
        sh_link: u32(e, 0),
        sh_info: u32(e, 0),
        sh_addralign: u64(e, 1),
        sh_entsize: u64(e, 0),
    };
    buffer.extend_from_slice(bytes_of(&shstrtab_header));
    buffer.extend_from_slice(&shstrtab);

    // Patch e_shoff now that the section header position is known.
    buffer[40..48].copy_from_slice(&(shoff as u64).to_le_bytes());

    Image {
        bytes: buffer,
        entry_point,
    }
}
