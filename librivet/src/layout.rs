//! Address and file-offset assignment. Output sections are ordered by a
//! conventional rank, grouped into load segments by permission class, and
//! placed so that each section's file offset is congruent to its virtual
//! address modulo the page size. Fragment offsets within each section are
//! assigned in a single pass that resolves alignment-fragment padding.

use crate::alignment::Alignment;
use crate::args::OutputKind;
use crate::backend::TargetBackend;
use crate::error::Result;
use crate::fragment::FragmentKind;
use crate::module::Module;
use crate::section::SectionId;
use crate::section::SectionPayload;
use rivet_utils::elf::shf;
use std::ops::Range;

#[derive(Debug, Clone, Copy)]
pub(crate) struct ProgramHeader {
    pub(crate) p_type: u32,
    pub(crate) flags: u32,
    pub(crate) offset: u64,
    pub(crate) vaddr: u64,
    pub(crate) filesz: u64,
    pub(crate) memsz: u64,
    pub(crate) align: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Layout {
    pub(crate) segments: Vec<ProgramHeader>,

    /// File offset of the section header table.
    pub(crate) shoff: u64,
}

/// Permission class of an alloc section; consecutive sections of the same
/// class share a LOAD segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PermClass {
    Read,
    ReadExec,
    ReadWrite,
}

fn perm_class(module: &Module, id: SectionId) -> PermClass {
    let flags = module.section(id).flags;
    if flags.contains(shf::EXECINSTR) {
        PermClass::ReadExec
    } else if flags.contains(shf::WRITE) {
        PermClass::ReadWrite
    } else {
        PermClass::Read
    }
}

fn perm_flags(class: PermClass) -> u32 {
    match class {
        PermClass::Read => object::elf::PF_R,
        PermClass::ReadExec => object::elf::PF_R | object::elf::PF_X,
        PermClass::ReadWrite => object::elf::PF_R | object::elf::PF_W,
    }
}

/// Emission order for output sections. More specific names first, then the
/// general flag classes.
fn section_rank(module: &Module, id: SectionId) -> u32 {
    let section = module.section(id);
    let name = section.name;
    let flags = section.flags;
    match name {
        b".interp" => 0,
        b".hash" => 2,
        b".dynsym" => 3,
        b".dynstr" => 4,
        b".plt" => 20,
        b".init_array" => 30,
        b".fini_array" => 31,
        b".ctors" => 32,
        b".dtors" => 33,
        b".data.rel.ro" | b".data.rel.ro.local" => 34,
        b".dynamic" => 35,
        b".got" => 36,
        b".tdata" => 38,
        b".got.plt" => 40,
        b".data" => 41,
        b".tbss" => 50,
        b".bss" => 52,
        b".symtab" => 61,
        b".strtab" => 62,
        b".shstrtab" => 63,
        _ => {
            if !flags.contains(shf::ALLOC) {
                if section.kind == crate::section::SectionKind::Relocation {
                    60
                } else {
                    59
                }
            } else if flags.contains(shf::EXECINSTR) {
                21
            } else if !flags.contains(shf::WRITE) {
                10
            } else if section.sh_type == object::elf::SHT_NOBITS {
                if flags.contains(shf::TLS) { 50 } else { 51 }
            } else {
                42
            }
        }
    }
}

/// Assigns fragment offsets within every output section. Alignment
/// fragments resolve their padding here; everything else is placed at the
/// running offset.
pub(crate) fn assign_fragment_offsets(module: &mut Module) {
    for index in 0..module.output_sections.len() {
        let section_id = module.output_sections[index];
        let frags = match &module.section(section_id).payload {
            SectionPayload::Data(data) => data.frags.clone(),
            _ => continue,
        };
        let mut offset = 0u64;
        for frag_id in frags {
            let frag = module.frag_mut(frag_id);
            if let FragmentKind::Align {
                boundary,
                max_bytes,
                padding,
                ..
            } = &mut frag.kind
            {
                let want = boundary.align_up(offset) - offset;
                *padding = want.min(*max_bytes);
            }
            frag.offset = offset;
            offset += frag.size();
        }
        module.section_mut(section_id).size = offset;
    }
}

/// Sorts the output section list into emission order.
pub(crate) fn order_output_sections(module: &mut Module) {
    let mut order = std::mem::take(&mut module.output_sections);
    order.sort_by_key(|&id| (section_rank(module, id), id));
    module.output_sections = order;
}

/// The virtual address range of the TLS template (.tdata/.tbss).
pub(crate) fn tls_range(module: &Module) -> Option<Range<u64>> {
    let mut start = u64::MAX;
    let mut end = 0;
    for &id in &module.output_sections {
        let section = module.section(id);
        if section.flags.contains(shf::TLS) && section.size > 0 {
            start = start.min(section.addr);
            end = end.max(section.addr + section.size);
        }
    }
    (start != u64::MAX).then_some(start..end)
}

fn ehdr_size(bitclass: u8) -> u64 {
    if bitclass == 64 { 64 } else { 52 }
}

fn phdr_entry_size(bitclass: u8) -> u64 {
    if bitclass == 64 { 56 } else { 32 }
}

/// Counts the program headers the layout will emit. Needed up front because
/// the header table occupies space in the first load segment.
fn count_segments(module: &Module, output_kind: OutputKind) -> u64 {
    if output_kind == OutputKind::Relocatable {
        return 0;
    }
    let mut count = 1; // GNU_STACK
    let mut last_class = None;
    for &id in &module.output_sections {
        let section = module.section(id);
        if !section.is_alloc() || section.size == 0 {
            continue;
        }
        let class = perm_class(module, id);
        if last_class != Some(class) {
            count += 1;
            last_class = Some(class);
        }
        match section.name {
            b".interp" => count += 1,
            b".dynamic" => count += 1,
            _ => {}
        }
    }
    if tls_range(module).is_some() {
        count += 1;
    }
    count
}

/// Assigns section addresses and file offsets and builds the program
/// headers. Safe to run repeatedly; the relaxation loop does exactly that.
pub(crate) fn compute(
    module: &mut Module,
    backend: &dyn TargetBackend,
    output_kind: OutputKind,
) -> Result<Layout> {
    assign_fragment_offsets(module);
    order_output_sections(module);

    let mut layout = Layout::default();
    let page = Alignment::new(backend.page_size())?;
    let bitclass = backend.bitclass();

    if output_kind == OutputKind::Relocatable {
        // No addresses, no segments; content follows the ELF header.
        let mut offset = ehdr_size(bitclass);
        for index in 0..module.output_sections.len() {
            let id = module.output_sections[index];
            let section = module.section(id);
            if section.sh_type == object::elf::SHT_NOBITS {
                module.section_mut(id).file_offset = offset;
                continue;
            }
            let align = section.alignment;
            offset = align.align_up(offset);
            module.section_mut(id).file_offset = offset;
            offset += module.section(id).size;
        }
        layout.shoff = Alignment::new(8)?.align_up(offset);
        return Ok(layout);
    }

    let base = backend.base_address(output_kind);
    let num_segments = count_segments(module, output_kind);
    let headers_size = ehdr_size(bitclass) + num_segments * phdr_entry_size(bitclass);

    let mut addr = base + headers_size;
    let mut offset = headers_size;
    let mut last_class: Option<PermClass> = None;
    let mut loads: Vec<ProgramHeader> = Vec::new();
    let mut interp: Option<ProgramHeader> = None;
    let mut dynamic: Option<ProgramHeader> = None;

    for index in 0..module.output_sections.len() {
        let id = module.output_sections[index];
        let section = module.section(id);
        if !section.is_alloc() || section.size == 0 {
            continue;
        }
        let class = perm_class(module, id);
        let nobits = section.sh_type == object::elf::SHT_NOBITS;
        let align = section.alignment;
        let size = section.size;
        let name_is_interp = section.name == b".interp";
        let name_is_dynamic = section.name == b".dynamic";

        if last_class != Some(class) {
            // New load segment: advance to a fresh page and keep the file
            // offset congruent to the address.
            addr = page.align_up(addr);
            offset = page.align_modulo(addr, offset);
            last_class = Some(class);
            loads.push(ProgramHeader {
                p_type: object::elf::PT_LOAD,
                flags: perm_flags(class),
                offset,
                vaddr: addr,
                filesz: 0,
                memsz: 0,
                align: page.value(),
            });
        }

        let aligned = align.align_up(addr);
        offset += aligned - addr;
        addr = aligned;

        {
            let section = module.section_mut(id);
            section.addr = addr;
            section.file_offset = offset;
        }

        let load = loads.last_mut().expect("segment started above");
        load.memsz = addr + size - load.vaddr;
        if !nobits {
            load.filesz = offset + size - load.offset;
        }

        if name_is_interp {
            interp = Some(ProgramHeader {
                p_type: object::elf::PT_INTERP,
                flags: object::elf::PF_R,
                offset,
                vaddr: addr,
                filesz: size,
                memsz: size,
                align: 1,
            });
        }
        if name_is_dynamic {
            dynamic = Some(ProgramHeader {
                p_type: object::elf::PT_DYNAMIC,
                flags: object::elf::PF_R | object::elf::PF_W,
                offset,
                vaddr: addr,
                filesz: size,
                memsz: size,
                align: 8,
            });
        }

        addr += size;
        if !nobits {
            offset += size;
        }
    }

    // Non-alloc sections trail the mapped image.
    for index in 0..module.output_sections.len() {
        let id = module.output_sections[index];
        let section = module.section(id);
        if section.is_alloc() || section.size == 0 {
            continue;
        }
        let align = section.alignment;
        offset = align.align_up(offset);
        module.section_mut(id).file_offset = offset;
        offset += module.section(id).size;
    }

    let mut segments = Vec::new();
    if let Some(interp) = interp {
        segments.push(interp);
    }
    segments.extend(loads);
    if let Some(dynamic) = dynamic {
        segments.push(dynamic);
    }
    if let Some(tls) = tls_range(module) {
        let (tls_offset, tls_filesz, tls_align) = tls_file_extent(module);
        segments.push(ProgramHeader {
            p_type: object::elf::PT_TLS,
            flags: object::elf::PF_R,
            offset: tls_offset,
            vaddr: tls.start,
            filesz: tls_filesz,
            memsz: tls.end - tls.start,
            align: tls_align,
        });
    }
    segments.push(ProgramHeader {
        p_type: object::elf::PT_GNU_STACK,
        flags: object::elf::PF_R | object::elf::PF_W,
        offset: 0,
        vaddr: 0,
        filesz: 0,
        memsz: 0,
        align: 16,
    });

    debug_assert_eq!(segments.len() as u64, num_segments);

    layout.segments = segments;
    layout.shoff = Alignment::new(8)?.align_up(offset);
    Ok(layout)
}

fn tls_file_extent(module: &Module) -> (u64, u64, u64) {
    let mut offset = 0;
    let mut filesz = 0;
    let mut align = 1u64;
    let mut first = true;
    for &id in &module.output_sections {
        let section = module.section(id);
        if !section.flags.contains(shf::TLS) || section.size == 0 {
            continue;
        }
        if first {
            offset = section.file_offset;
            first = false;
        }
        align = align.max(section.alignment.value());
        if section.sh_type != object::elf::SHT_NOBITS {
            filesz = section.file_offset + section.size - offset;
        }
    }
    (offset, filesz, align)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::OutputKind;
    use crate::section::SectionKind;
    use crate::x86_64::X86_64;
    use rivet_utils::elf::SectionFlags;

    fn flags(extra: rivet_utils::elf::SectionFlags) -> SectionFlags {
        SectionFlags::empty().with(shf::ALLOC).with(extra)
    }

    #[test]
    fn test_offsets_are_monotonic_and_aligned() {
        let mut module = Module::new();
        let text = module.get_or_create_output_section(
            b".text",
            SectionKind::Regular,
            object::elf::SHT_PROGBITS,
            flags(shf::EXECINSTR),
            Alignment::new(16).unwrap(),
        );
        module.append_fragment(
            text,
            FragmentKind::Fill {
                pattern: 0x90,
                size: 7,
                count: 1,
            },
            Alignment::new(1).unwrap(),
        );
        module.append_fragment(
            text,
            FragmentKind::Fill {
                pattern: 0x90,
                size: 9,
                count: 1,
            },
            Alignment::new(8).unwrap(),
        );
        module.append_fragment(
            text,
            FragmentKind::Fill {
                pattern: 0x90,
                size: 1,
                count: 1,
            },
            Alignment::new(4).unwrap(),
        );
        assign_fragment_offsets(&mut module);

        let frags = module.section(text).data().unwrap().frags.clone();
        let mut last_end = 0;
        for frag_id in frags {
            let frag = module.frag(frag_id);
            assert!(frag.offset >= last_end, "fragment offsets must not overlap");
            last_end = frag.offset + frag.size();
        }
        // 7 bytes, 1 byte padding, 9 bytes at 8, padding to 20, 1 byte.
        assert_eq!(module.section(text).size, 21);
    }

    #[test]
    fn test_exec_layout_congruence() {
        let mut module = Module::new();
        let text = module.get_or_create_output_section(
            b".text",
            SectionKind::Regular,
            object::elf::SHT_PROGBITS,
            flags(shf::EXECINSTR),
            Alignment::new(16).unwrap(),
        );
        module.append_fragment(
            text,
            FragmentKind::Fill {
                pattern: 0,
                size: 100,
                count: 1,
            },
            Alignment::new(16).unwrap(),
        );
        let data = module.get_or_create_output_section(
            b".data",
            SectionKind::Regular,
            object::elf::SHT_PROGBITS,
            flags(shf::WRITE),
            Alignment::new(8).unwrap(),
        );
        module.append_fragment(
            data,
            FragmentKind::Fill {
                pattern: 0,
                size: 32,
                count: 1,
            },
            Alignment::new(8).unwrap(),
        );

        let backend = X86_64::new(OutputKind::Executable);
        let layout = compute(&mut module, &backend, OutputKind::Executable).unwrap();

        for &id in &module.output_sections {
            let section = module.section(id);
            if section.is_alloc() && section.size > 0 {
                assert_eq!(
                    section.addr % 0x1000,
                    section.file_offset % 0x1000,
                    "offset/addr congruence for {}",
                    section.display_name()
                );
            }
        }
        let load_count = layout
            .segments
            .iter()
            .filter(|s| s.p_type == object::elf::PT_LOAD)
            .count();
        assert_eq!(load_count, 2);
        assert!(layout.segments.iter().any(|s| s.p_type == object::elf::PT_GNU_STACK));
    }
}
