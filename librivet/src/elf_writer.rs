//! Output emission: name-pool sizing at prelayout, then ELF header, program
//! headers, section contents, symbol tables, relocation sync and section
//! headers. Flat binary output reuses the content path without any headers.

use crate::args::OutputKind;
use crate::backend::TargetBackend;
use crate::error::Context as _;
use crate::error::Result;
use crate::fragment::FragmentKind;
use crate::layout::Layout;
use crate::module::InputKind;
use crate::module::Module;
use crate::relocator::Patch;
use crate::relocator::Relocator;
use crate::section::Section;
use crate::section::SectionId;
use crate::section::SectionKind;
use crate::symbol::Binding;
use crate::symbol::ResolveInfoId;
use crate::symbol::SymbolDesc;
use crate::symbol::SymbolType;
use crate::symbol::Visibility;
use anyhow::anyhow;
use anyhow::bail;
use hashbrown::HashMap;
use memmap2::MmapOptions;
use rivet_utils::elf::shf;
use rivet_utils::elf::SectionFlags;
use std::io::Write as _;
use std::ops::Deref;
use std::ops::DerefMut;
use std::path::Path;

pub(crate) enum OutputBuffer {
    Mmap(memmap2::MmapMut),
    InMemory(Vec<u8>),
}

impl OutputBuffer {
    fn new(file: &std::fs::File, file_size: u64) -> Self {
        Self::new_mmapped(file, file_size)
            .unwrap_or_else(|| Self::InMemory(vec![0; file_size as usize]))
    }

    fn new_mmapped(file: &std::fs::File, file_size: u64) -> Option<Self> {
        file.set_len(file_size).ok()?;
        let mmap = unsafe { MmapOptions::new().map_mut(file) }.ok()?;
        Some(Self::Mmap(mmap))
    }
}

impl Deref for OutputBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            OutputBuffer::Mmap(mmap) => mmap.deref(),
            OutputBuffer::InMemory(vec) => vec.deref(),
        }
    }
}

impl DerefMut for OutputBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            OutputBuffer::Mmap(mmap) => mmap.deref_mut(),
            OutputBuffer::InMemory(vec) => vec.deref_mut(),
        }
    }
}

pub(crate) struct SizedOutput {
    file: std::fs::File,
    pub(crate) out: OutputBuffer,
}

impl SizedOutput {
    pub(crate) fn create(path: &Path, file_size: u64) -> Result<SizedOutput> {
        let _ = std::fs::remove_file(path);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to open `{}`", path.display()))?;
        let out = OutputBuffer::new(&file, file_size);
        Ok(SizedOutput { file, out })
    }

    pub(crate) fn flush(&mut self, make_executable: bool) -> Result {
        if let OutputBuffer::InMemory(bytes) = &self.out {
            self.file
                .write_all(bytes)
                .context("Failed to write output file")?;
        }
        if make_executable {
            // Best-effort; pipes and special files won't take a mode.
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt as _;
                if let Ok(metadata) = self.file.metadata() {
                    let mut permissions = metadata.permissions();
                    permissions.set_mode(permissions.mode() | 0o111);
                    let _ = self.file.set_permissions(permissions);
                }
            }
        }
        Ok(())
    }
}

/// Endian/word-size aware field stores.
#[derive(Clone, Copy)]
struct Emit {
    little: bool,
    is64: bool,
}

impl Emit {
    fn put16(&self, buf: &mut [u8], offset: usize, value: u16) {
        let bytes = if self.little {
            value.to_le_bytes()
        } else {
            value.to_be_bytes()
        };
        buf[offset..offset + 2].copy_from_slice(&bytes);
    }

    fn put32(&self, buf: &mut [u8], offset: usize, value: u32) {
        let bytes = if self.little {
            value.to_le_bytes()
        } else {
            value.to_be_bytes()
        };
        buf[offset..offset + 4].copy_from_slice(&bytes);
    }

    fn put64(&self, buf: &mut [u8], offset: usize, value: u64) {
        let bytes = if self.little {
            value.to_le_bytes()
        } else {
            value.to_be_bytes()
        };
        buf[offset..offset + 8].copy_from_slice(&bytes);
    }

    fn put_bytes(&self, buf: &mut [u8], offset: usize, value: u64, width: usize) {
        for i in 0..width {
            let byte = (value >> (8 * i)) as u8;
            let position = if self.little {
                offset + i
            } else {
                offset + width - 1 - i
            };
            buf[position] = byte;
        }
    }

    fn word_size(&self) -> usize {
        if self.is64 { 8 } else { 4 }
    }
}

/// Everything decided at prelayout: which name-pool sections exist, their
/// contents' shapes, and the symbol orderings shared between sizing and
/// emission.
pub(crate) struct OutputPlan {
    symtab_entries: Vec<ResolveInfoId>,
    symtab_local_count: usize,
    symtab_index: HashMap<ResolveInfoId, usize>,
    strtab: Vec<u8>,
    strtab_offsets: Vec<u32>,

    dynsym_entries: Vec<ResolveInfoId>,
    dynstr: Vec<u8>,
    dynstr_offsets: Vec<u32>,
    dynstr_needed: Vec<u32>,
    dynstr_soname: Option<u32>,

    symtab: Option<SectionId>,
    strtab_section: Option<SectionId>,
    shstrtab: SectionId,
    dynsym: Option<SectionId>,
    dynstr_section: Option<SectionId>,
    hash: Option<SectionId>,
    dynamic: Option<SectionId>,
    interp: Option<SectionId>,
    rela_plt: Option<SectionId>,
    eh_frame_hdr: Option<SectionId>,

    /// For relocatable output: one merged relocation output section per
    /// (relocated output section, sh_type).
    reloc_outputs: Vec<RelocOutput>,

    interp_path: &'static [u8],
    fde_count: u64,
}

struct RelocOutput {
    section: SectionId,
    target: SectionId,
    sh_type: u32,
    sources: Vec<SectionId>,
}

const DYN_ENTRY_FIXED: &[u32] = &[
    object::elf::DT_HASH,
    object::elf::DT_STRTAB,
    object::elf::DT_SYMTAB,
    object::elf::DT_STRSZ,
    object::elf::DT_SYMENT,
];

fn sym_entry_size(is64: bool) -> u64 {
    if is64 { 24 } else { 16 }
}

fn rel_entry_size(is64: bool, rela: bool) -> u64 {
    match (is64, rela) {
        (true, true) => 24,
        (true, false) => 16,
        (false, true) => 12,
        (false, false) => 8,
    }
}

fn dyn_entry_size(is64: bool) -> u64 {
    if is64 { 16 } else { 8 }
}

impl OutputPlan {
    /// Sizes the name pools and other synthesised sections so that layout
    /// can place them. Must run after every content-producing phase.
    pub(crate) fn prelayout(
        module: &mut Module<'_>,
        backend: &dyn TargetBackend,
        output_kind: OutputKind,
    ) -> Result<OutputPlan> {
        let is64 = backend.bitclass() == 64;
        let is_dynamic = !module.needed.is_empty() || output_kind == OutputKind::SharedObject;

        // Symbol table contents: null, then locals (section symbols, stubs,
        // named input locals), then globals.
        let mut entries: Vec<ResolveInfoId> = Vec::new();
        let mut section_symbol_infos = Vec::new();
        for &section_id in &module.output_sections {
            if module.section(section_id).size == 0 {
                continue;
            }
            if let Some(symbol_id) = module.section_symbol(section_id) {
                section_symbol_infos.push(module.symbol(symbol_id).info);
            }
        }
        entries.extend(section_symbol_infos);
        for stub in &module.stubs {
            entries.push(module.symbol(stub.symbol).info);
        }
        for input in &module.inputs {
            if input.kind != InputKind::Object {
                continue;
            }
            for &symbol_id in &input.symbols {
                let symbol = module.symbol(symbol_id);
                let info = module.info(symbol.info);
                if info.binding == Binding::Local
                    && !info.name.is_empty()
                    && symbol.frag_ref.is_some()
                    && !matches!(info.sym_type, SymbolType::Section | SymbolType::File)
                {
                    entries.push(symbol.info);
                }
            }
        }
        let symtab_local_count = entries.len() + 1;

        let mut globals = module.pool.global_infos();
        globals.retain(|&id| {
            let info = module.info(id);
            !info.from_shared
        });
        entries.extend(globals);

        let mut strtab = vec![0u8];
        let mut strtab_offsets = Vec::with_capacity(entries.len());
        let mut symtab_index = HashMap::new();
        for (index, &info_id) in entries.iter().enumerate() {
            let info = module.info(info_id);
            let offset = if info.name.is_empty() || info.sym_type == SymbolType::Section {
                0
            } else {
                add_string(&mut strtab, &info.name)
            };
            strtab_offsets.push(offset);
            symtab_index.insert(info_id, index + 1);
        }

        // Dynamic symbols: imports the link actually referenced, plus our
        // own exports when building a shared object.
        let mut dynsym_entries = Vec::new();
        if is_dynamic {
            for &info_id in &module.pool.global_infos() {
                let info = module.info(info_id);
                let import = info.from_shared && info.referenced;
                let export = output_kind == OutputKind::SharedObject
                    && !info.from_shared
                    && info.desc == SymbolDesc::Define
                    && info.visibility == Visibility::Default
                    && matches!(info.binding, Binding::Global | Binding::Weak);
                if import || export {
                    dynsym_entries.push(info_id);
                }
            }
        }
        let mut dynstr = vec![0u8];
        let mut dynstr_offsets = Vec::with_capacity(dynsym_entries.len());
        for &info_id in &dynsym_entries {
            let name = module.info(info_id).name.clone();
            dynstr_offsets.push(add_string(&mut dynstr, &name));
        }
        let needed_names = module.needed.clone();
        let dynstr_needed = needed_names
            .iter()
            .map(|name| add_string(&mut dynstr, name))
            .collect();
        let dynstr_soname = module
            .soname
            .clone()
            .map(|soname| add_string(&mut dynstr, soname.as_bytes()));

        // Relocatable output carries the (rewritten) input relocations,
        // merged per target output section.
        let mut reloc_outputs: Vec<RelocOutput> = Vec::new();
        if output_kind == OutputKind::Relocatable {
            for input in &module.inputs {
                for &reloc_section_id in &input.reloc_sections {
                    let reloc_section = module.section(reloc_section_id);
                    let Some(link) = reloc_section.link else {
                        continue;
                    };
                    let Some(target) = module.section(link).out else {
                        continue;
                    };
                    let sh_type = reloc_section.sh_type;
                    match reloc_outputs
                        .iter_mut()
                        .find(|r| r.target == target && r.sh_type == sh_type)
                    {
                        Some(existing) => existing.sources.push(reloc_section_id),
                        None => reloc_outputs.push(RelocOutput {
                            section: SectionId::from_usize(0),
                            target,
                            sh_type,
                            sources: vec![reloc_section_id],
                        }),
                    }
                }
            }
        }

        let interp_path: &'static [u8] = if backend.machine() == object::elf::EM_ARM {
            b"/lib/ld-linux.so.3\0"
        } else {
            b"/lib64/ld-linux-x86-64.so.2\0"
        };

        // FDE count for the .eh_frame_hdr search table.
        let mut fde_count = 0;
        let mut eh_frame_present = false;
        if let Some(eh_frame) = module.output_section_by_name(b".eh_frame") {
            eh_frame_present = module.section(eh_frame).size > 0;
            fde_count = count_fdes(module, eh_frame, backend.is_little_endian());
        }

        // Create the synthesised sections, sized. Layout places them.
        let dyn_info = backend.relocator().dyn_link_info();

        let mut plan = OutputPlan {
            symtab_entries: entries,
            symtab_local_count,
            symtab_index,
            strtab,
            strtab_offsets,
            dynsym_entries,
            dynstr,
            dynstr_offsets,
            dynstr_needed,
            dynstr_soname,
            symtab: None,
            strtab_section: None,
            shstrtab: SectionId::from_usize(0),
            dynsym: None,
            dynstr_section: None,
            hash: None,
            dynamic: None,
            interp: None,
            rela_plt: None,
            eh_frame_hdr: None,
            reloc_outputs,
            interp_path,
            fde_count,
        };

        let word_align = crate::alignment::Alignment::new(if is64 { 8 } else { 4 })?;

        if is_dynamic && output_kind != OutputKind::FlatBinary {
            if output_kind == OutputKind::Executable {
                let interp = module.get_or_create_output_section(
                    b".interp",
                    SectionKind::Regular,
                    object::elf::SHT_PROGBITS,
                    SectionFlags::empty().with(shf::ALLOC),
                    crate::alignment::MIN,
                );
                module.section_mut(interp).size = plan.interp_path.len() as u64;
                plan.interp = Some(interp);
            }

            let dynsym = module.get_or_create_output_section(
                b".dynsym",
                SectionKind::NamePool,
                object::elf::SHT_DYNSYM,
                SectionFlags::empty().with(shf::ALLOC),
                word_align,
            );
            module.section_mut(dynsym).size =
                (plan.dynsym_entries.len() as u64 + 1) * sym_entry_size(is64);
            module.section_mut(dynsym).entsize = sym_entry_size(is64);
            plan.dynsym = Some(dynsym);

            let dynstr_section = module.get_or_create_output_section(
                b".dynstr",
                SectionKind::NamePool,
                object::elf::SHT_STRTAB,
                SectionFlags::empty().with(shf::ALLOC),
                crate::alignment::MIN,
            );
            module.section_mut(dynstr_section).size = plan.dynstr.len() as u64;
            plan.dynstr_section = Some(dynstr_section);

            let nsyms = plan.dynsym_entries.len() as u64 + 1;
            let hash = module.get_or_create_output_section(
                b".hash",
                SectionKind::NamePool,
                object::elf::SHT_HASH,
                SectionFlags::empty().with(shf::ALLOC),
                crate::alignment::Alignment::new(4)?,
            );
            module.section_mut(hash).size = (2 + nsyms + nsyms) * 4;
            module.section_mut(hash).entsize = 4;
            plan.hash = Some(hash);

            if !dyn_info.plt_symbols.is_empty() {
                let rela_plt = module.get_or_create_output_section(
                    if is64 { b".rela.plt".as_slice() } else { b".rel.plt".as_slice() },
                    SectionKind::Relocation,
                    if is64 { object::elf::SHT_RELA } else { object::elf::SHT_REL },
                    SectionFlags::empty().with(shf::ALLOC),
                    word_align,
                );
                module.section_mut(rela_plt).size =
                    dyn_info.plt_symbols.len() as u64 * rel_entry_size(is64, is64);
                module.section_mut(rela_plt).entsize = rel_entry_size(is64, is64);
                plan.rela_plt = Some(rela_plt);
            }

            let dynamic = module.get_or_create_output_section(
                b".dynamic",
                SectionKind::NamePool,
                object::elf::SHT_DYNAMIC,
                SectionFlags::empty().with(shf::ALLOC).with(shf::WRITE),
                word_align,
            );
            let mut tag_count = DYN_ENTRY_FIXED.len() as u64
                + plan.dynstr_needed.len() as u64
                + u64::from(plan.dynstr_soname.is_some())
                + 1; // DT_NULL
            if plan.rela_plt.is_some() {
                tag_count += 4; // PLTGOT, PLTRELSZ, PLTREL, JMPREL
            }
            module.section_mut(dynamic).size = tag_count * dyn_entry_size(is64);
            module.section_mut(dynamic).entsize = dyn_entry_size(is64);
            plan.dynamic = Some(dynamic);
        }

        if output_kind == OutputKind::Relocatable {
            for index in 0..plan.reloc_outputs.len() {
                let sh_type = plan.reloc_outputs[index].sh_type;
                let target = plan.reloc_outputs[index].target;
                let is_rela = sh_type == object::elf::SHT_RELA;
                let prefix: &[u8] = if is_rela { b".rela" } else { b".rel" };
                let mut name = prefix.to_vec();
                name.extend_from_slice(module.section(target).name);
                let name = crate::symbol::leak_name(name);
                let section = module.get_or_create_output_section(
                    name,
                    SectionKind::Relocation,
                    sh_type,
                    SectionFlags::empty(),
                    word_align,
                );
                let count: u64 = plan.reloc_outputs[index]
                    .sources
                    .iter()
                    .map(|&s| {
                        module
                            .section(s)
                            .reloc_data()
                            .map(|d| d.relocs.len() as u64)
                            .unwrap_or(0)
                    })
                    .sum();
                module.section_mut(section).size = count * rel_entry_size(is64, is_rela);
                module.section_mut(section).entsize = rel_entry_size(is64, is_rela);
                module.section_mut(section).link = Some(target);
                plan.reloc_outputs[index].section = section;
            }
        }

        if eh_frame_present
            && matches!(output_kind, OutputKind::Executable | OutputKind::SharedObject)
        {
            let eh_frame_hdr = module.get_or_create_output_section(
                b".eh_frame_hdr",
                SectionKind::EhFrame,
                object::elf::SHT_PROGBITS,
                SectionFlags::empty().with(shf::ALLOC),
                crate::alignment::EH_FRAME_HDR,
            );
            module.section_mut(eh_frame_hdr).size = 12 + plan.fde_count * 8;
            plan.eh_frame_hdr = Some(eh_frame_hdr);
        }

        // .symtab/.strtab/.shstrtab go last (and .shstrtab names itself).
        if output_kind != OutputKind::FlatBinary {
            let symtab = module.get_or_create_output_section(
                b".symtab",
                SectionKind::NamePool,
                object::elf::SHT_SYMTAB,
                SectionFlags::empty(),
                word_align,
            );
            module.section_mut(symtab).size =
                (plan.symtab_entries.len() as u64 + 1) * sym_entry_size(is64);
            module.section_mut(symtab).entsize = sym_entry_size(is64);
            plan.symtab = Some(symtab);

            let strtab = module.get_or_create_output_section(
                b".strtab",
                SectionKind::NamePool,
                object::elf::SHT_STRTAB,
                SectionFlags::empty(),
                crate::alignment::MIN,
            );
            module.section_mut(strtab).size = plan.strtab.len() as u64;
            plan.strtab_section = Some(strtab);
        }

        let shstrtab = module.get_or_create_output_section(
            b".shstrtab",
            SectionKind::NamePool,
            object::elf::SHT_STRTAB,
            SectionFlags::empty(),
            crate::alignment::MIN,
        );
        let mut shstrtab_size = 1u64;
        for &id in &module.output_sections {
            if module.section(id).size > 0 || module.section(id).name == b".shstrtab" {
                shstrtab_size += module.section(id).name.len() as u64 + 1;
            }
        }
        module.section_mut(shstrtab).size = shstrtab_size;
        plan.shstrtab = shstrtab;

        Ok(plan)
    }
}

fn add_string(pool: &mut Vec<u8>, name: &[u8]) -> u32 {
    let offset = pool.len() as u32;
    pool.extend_from_slice(name);
    pool.push(0);
    offset
}

fn count_fdes(module: &Module, eh_frame: SectionId, little: bool) -> u64 {
    let read32 = |bytes: &[u8], at: usize| -> u32 {
        let raw: [u8; 4] = bytes[at..at + 4].try_into().unwrap();
        if little {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        }
    };
    let mut bytes = Vec::new();
    collect_section_bytes(module, eh_frame, &mut bytes);
    let mut count = 0;
    let mut offset = 0usize;
    while offset + 8 <= bytes.len() {
        let length = read32(&bytes, offset) as usize;
        if length == 0 {
            break;
        }
        if read32(&bytes, offset + 4) != 0 {
            count += 1;
        }
        offset += 4 + length;
    }
    count
}

fn collect_section_bytes(module: &Module, section: SectionId, out: &mut Vec<u8>) {
    let Some(data) = module.section(section).data() else {
        return;
    };
    for &frag_id in &data.frags {
        let frag = module.frag(frag_id);
        match &frag.kind {
            FragmentKind::Region(bytes) | FragmentKind::StringEntry { bytes, .. } => {
                out.extend_from_slice(bytes);
            }
            FragmentKind::Fill {
                pattern,
                size,
                count,
            } => out.extend(std::iter::repeat_n(*pattern, (*size * *count) as usize)),
            FragmentKind::Align { padding, fill, .. } => {
                out.extend(std::iter::repeat_n(*fill, *padding as usize));
            }
            FragmentKind::Null => {}
            FragmentKind::Stub { id, .. } => {
                out.extend_from_slice(module.stubs[id.as_usize()].template);
            }
        }
    }
}

pub(crate) struct WriteInputs<'a> {
    pub(crate) entry: u64,
    pub(crate) patches: &'a [Patch],
}

/// Writes the complete output image.
#[tracing::instrument(skip_all, name = "Write output file")]
pub(crate) fn write(
    module: &mut Module<'_>,
    backend: &dyn TargetBackend,
    relocator: &dyn Relocator,
    plan: &OutputPlan,
    layout: &Layout,
    output_kind: OutputKind,
    inputs: WriteInputs,
    path: &Path,
) -> Result {
    let emit = Emit {
        little: backend.is_little_endian(),
        is64: backend.bitclass() == 64,
    };

    if output_kind == OutputKind::FlatBinary {
        return write_flat_binary(module, backend, relocator, inputs, path, emit);
    }

    // Assign section header indices: null, then every non-empty output
    // section in layout order.
    let mut shndx = 1usize;
    for index in 0..module.output_sections.len() {
        let id = module.output_sections[index];
        if module.section(id).size == 0 && module.section(id).name != b".shstrtab" {
            continue;
        }
        module.section_mut(id).output_index = Some(shndx);
        shndx += 1;
    }
    let shnum = shndx;

    let shentsize: u64 = if emit.is64 { 64 } else { 40 };
    let file_size = layout.shoff + shnum as u64 * shentsize;
    let mut output = SizedOutput::create(path, file_size)?;
    let buf = &mut output.out;

    write_ehdr(module, backend, plan, layout, output_kind, &inputs, emit, buf, shnum)?;
    write_phdrs(layout, emit, buf);
    write_section_contents(module, buf);
    write_name_pools(module, plan, output_kind, emit, buf)?;
    write_plt_relocations(module, backend, relocator, plan, emit, buf);
    sync_relocations(module, relocator, emit, buf);
    apply_patches(module, inputs.patches, emit, buf);
    if output_kind != OutputKind::Relocatable {
        if let Some(eh_frame_hdr) = plan.eh_frame_hdr {
            write_eh_frame_hdr(module, plan, eh_frame_hdr, emit, buf)?;
        }
    }
    write_shdrs(module, plan, emit, buf, layout)?;

    output.flush(matches!(
        output_kind,
        OutputKind::Executable | OutputKind::SharedObject
    ))?;
    Ok(())
}

fn write_flat_binary(
    module: &Module<'_>,
    backend: &dyn TargetBackend,
    relocator: &dyn Relocator,
    inputs: WriteInputs,
    path: &Path,
    emit: Emit,
) -> Result {
    let base = backend.base_address(OutputKind::FlatBinary);
    let mut end = 0u64;
    for &id in &module.output_sections {
        let section = module.section(id);
        if section.is_alloc() && section.sh_type != object::elf::SHT_NOBITS {
            end = end.max(section.addr + section.size - base);
        }
    }
    let mut output = SizedOutput::create(path, end)?;
    let buf = &mut output.out;
    for &id in &module.output_sections {
        let section = module.section(id);
        if !section.is_alloc() || section.sh_type == object::elf::SHT_NOBITS || section.size == 0 {
            continue;
        }
        let mut bytes = Vec::new();
        collect_section_bytes(module, id, &mut bytes);
        let offset = (section.addr - base) as usize;
        buf[offset..offset + bytes.len()].copy_from_slice(&bytes);
    }
    // Relocation results land at addr - base rather than file offsets.
    for input in &module.inputs {
        for &reloc_section in &input.reloc_sections {
            let Some(data) = module.section(reloc_section).reloc_data() else {
                continue;
            };
            for reloc in &data.relocs {
                let section = module.section(module.frag_section(reloc.target_ref.frag));
                if !section.is_alloc() {
                    continue;
                }
                let position =
                    (section.addr + module.frag_ref_offset(reloc.target_ref) - base) as usize;
                let width = (relocator.reloc_size_bits(reloc.r_type) / 8) as usize;
                emit.put_bytes(buf, position, reloc.target_data, width);
            }
        }
    }
    for reloc in &module.stub_relocs {
        let section = module.section(module.frag_section(reloc.target_ref.frag));
        let position = (section.addr + module.frag_ref_offset(reloc.target_ref) - base) as usize;
        let width = (relocator.reloc_size_bits(reloc.r_type) / 8) as usize;
        emit.put_bytes(buf, position, reloc.target_data, width);
    }
    for patch in inputs.patches {
        let section = module.section(patch.section);
        let position = (section.addr + patch.offset - base) as usize;
        emit.put_bytes(buf, position, patch.value, patch.width as usize);
    }
    output.flush(false)?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_ehdr(
    module: &Module<'_>,
    backend: &dyn TargetBackend,
    plan: &OutputPlan,
    layout: &Layout,
    output_kind: OutputKind,
    inputs: &WriteInputs,
    emit: Emit,
    buf: &mut [u8],
    shnum: usize,
) -> Result {
    buf[..4].copy_from_slice(&object::elf::ELFMAG);
    buf[4] = if emit.is64 {
        object::elf::ELFCLASS64
    } else {
        object::elf::ELFCLASS32
    };
    buf[5] = if emit.little {
        object::elf::ELFDATA2LSB
    } else {
        object::elf::ELFDATA2MSB
    };
    buf[6] = object::elf::EV_CURRENT;
    buf[7] = backend.osabi();
    buf[8] = backend.abi_version();

    let e_type = match output_kind {
        OutputKind::Executable => object::elf::ET_EXEC,
        OutputKind::SharedObject => object::elf::ET_DYN,
        OutputKind::Relocatable => object::elf::ET_REL,
        OutputKind::FlatBinary => unreachable!("flat binaries have no ELF header"),
    };
    emit.put16(buf, 16, e_type);
    emit.put16(buf, 18, backend.machine());
    emit.put32(buf, 20, u32::from(object::elf::EV_CURRENT));

    let phnum = layout.segments.len();
    let (ehsize, phentsize, shentsize): (u16, u16, u16) = if emit.is64 {
        (64, 56, 64)
    } else {
        (52, 32, 40)
    };
    let phoff = if phnum > 0 { u64::from(ehsize) } else { 0 };

    if emit.is64 {
        emit.put64(buf, 24, inputs.entry);
        emit.put64(buf, 32, phoff);
        emit.put64(buf, 40, layout.shoff);
        emit.put32(buf, 48, backend.flags());
        emit.put16(buf, 52, ehsize);
        emit.put16(buf, 54, phentsize);
        emit.put16(buf, 56, phnum as u16);
        emit.put16(buf, 58, shentsize);
        emit.put16(buf, 60, shnum as u16);
        emit.put16(buf, 62, shstrndx(module, plan)?);
    } else {
        emit.put32(buf, 24, inputs.entry as u32);
        emit.put32(buf, 28, phoff as u32);
        emit.put32(buf, 32, layout.shoff as u32);
        emit.put32(buf, 36, backend.flags());
        emit.put16(buf, 40, ehsize);
        emit.put16(buf, 42, phentsize);
        emit.put16(buf, 44, phnum as u16);
        emit.put16(buf, 46, shentsize);
        emit.put16(buf, 48, shnum as u16);
        emit.put16(buf, 50, shstrndx(module, plan)?);
    }
    Ok(())
}

fn shstrndx(module: &Module<'_>, plan: &OutputPlan) -> Result<u16> {
    module
        .section(plan.shstrtab)
        .output_index
        .map(|index| index as u16)
        .ok_or_else(|| anyhow!("shstrtab was not assigned a section index"))
}

fn write_phdrs(layout: &Layout, emit: Emit, buf: &mut [u8]) {
    let ehsize = if emit.is64 { 64usize } else { 52 };
    let entsize = if emit.is64 { 56usize } else { 32 };
    for (index, segment) in layout.segments.iter().enumerate() {
        let at = ehsize + index * entsize;
        emit.put32(buf, at, segment.p_type);
        if emit.is64 {
            emit.put32(buf, at + 4, segment.flags);
            emit.put64(buf, at + 8, segment.offset);
            emit.put64(buf, at + 16, segment.vaddr);
            emit.put64(buf, at + 24, segment.vaddr);
            emit.put64(buf, at + 32, segment.filesz);
            emit.put64(buf, at + 40, segment.memsz);
            emit.put64(buf, at + 48, segment.align);
        } else {
            emit.put32(buf, at + 4, segment.offset as u32);
            emit.put32(buf, at + 8, segment.vaddr as u32);
            emit.put32(buf, at + 12, segment.vaddr as u32);
            emit.put32(buf, at + 16, segment.filesz as u32);
            emit.put32(buf, at + 20, segment.memsz as u32);
            emit.put32(buf, at + 24, segment.flags);
            emit.put32(buf, at + 28, segment.align as u32);
        }
    }
}

fn write_section_contents(module: &Module<'_>, buf: &mut [u8]) {
    for &id in &module.output_sections {
        let section = module.section(id);
        if section.sh_type == object::elf::SHT_NOBITS || section.size == 0 {
            continue;
        }
        if section.data().is_none() {
            continue;
        }
        let mut bytes = Vec::new();
        collect_section_bytes(module, id, &mut bytes);
        let offset = section.file_offset as usize;
        buf[offset..offset + bytes.len()].copy_from_slice(&bytes);
    }
}

/// JUMP_SLOT relocations for the PLT entries the scan phase reserved.
fn write_plt_relocations(
    module: &Module<'_>,
    backend: &dyn TargetBackend,
    relocator: &dyn Relocator,
    plan: &OutputPlan,
    emit: Emit,
    buf: &mut [u8],
) {
    let Some(rela_plt) = plan.rela_plt else {
        return;
    };
    let dyn_info = relocator.dyn_link_info();
    let Some(got_plt) = dyn_info.got_plt else {
        return;
    };
    let jump_slot = if backend.machine() == object::elf::EM_ARM {
        object::elf::R_ARM_JUMP_SLOT
    } else {
        object::elf::R_X86_64_JUMP_SLOT
    };
    let got_plt_addr = module.section(got_plt).addr;
    let is_rela = emit.is64;
    let entsize = rel_entry_size(emit.is64, is_rela) as usize;
    let mut at = module.section(rela_plt).file_offset as usize;
    for (index, sym) in dyn_info.plt_symbols.iter().enumerate() {
        // Slot 3 onward; the first three .got.plt entries belong to the
        // loader.
        let slot_addr = got_plt_addr + (3 + index as u64) * emit.word_size() as u64;
        let dynsym_index = plan
            .dynsym_entries
            .iter()
            .position(|candidate| candidate == sym)
            .map(|position| position + 1)
            .unwrap_or(0);
        if emit.is64 {
            emit.put64(buf, at, slot_addr);
            emit.put64(buf, at + 8, ((dynsym_index as u64) << 32) | u64::from(jump_slot));
            if is_rela {
                emit.put64(buf, at + 16, 0);
            }
        } else {
            emit.put32(buf, at, slot_addr as u32);
            emit.put32(
                buf,
                at + 4,
                ((dynsym_index as u32) << 8) | (jump_slot & 0xff),
            );
        }
        at += entsize;
    }
}

fn write_name_pools(
    module: &Module<'_>,
    plan: &OutputPlan,
    output_kind: OutputKind,
    emit: Emit,
    buf: &mut [u8],
) -> Result {
    // .symtab + .strtab
    if let (Some(symtab), Some(strtab)) = (plan.symtab, plan.strtab_section) {
        let base = module.section(symtab).file_offset as usize;
        let entsize = sym_entry_size(emit.is64) as usize;
        for (index, &info_id) in plan.symtab_entries.iter().enumerate() {
            let at = base + (index + 1) * entsize;
            write_symbol(module, info_id, plan.strtab_offsets[index], emit, buf, at);
        }
        let strtab_offset = module.section(strtab).file_offset as usize;
        buf[strtab_offset..strtab_offset + plan.strtab.len()].copy_from_slice(&plan.strtab);
    }

    // .dynsym / .dynstr / .hash / .dynamic / .interp / .rela.plt
    if let (Some(dynsym), Some(dynstr)) = (plan.dynsym, plan.dynstr_section) {
        let base = module.section(dynsym).file_offset as usize;
        let entsize = sym_entry_size(emit.is64) as usize;
        for (index, &info_id) in plan.dynsym_entries.iter().enumerate() {
            let at = base + (index + 1) * entsize;
            write_symbol(module, info_id, plan.dynstr_offsets[index], emit, buf, at);
        }
        let dynstr_offset = module.section(dynstr).file_offset as usize;
        buf[dynstr_offset..dynstr_offset + plan.dynstr.len()].copy_from_slice(&plan.dynstr);

        if let Some(hash) = plan.hash {
            write_hash(module, plan, hash, emit, buf);
        }
        if let Some(interp) = plan.interp {
            let offset = module.section(interp).file_offset as usize;
            buf[offset..offset + plan.interp_path.len()].copy_from_slice(plan.interp_path);
        }
        if let Some(dynamic) = plan.dynamic {
            write_dynamic(module, plan, dynamic, emit, buf);
        }
    }

    // Relocatable output's merged relocation sections.
    if output_kind == OutputKind::Relocatable {
        for reloc_output in &plan.reloc_outputs {
            write_reloc_output(module, plan, reloc_output, emit, buf)?;
        }
    }

    // .shstrtab
    let shstrtab_offset = module.section(plan.shstrtab).file_offset as usize;
    let mut cursor = shstrtab_offset + 1;
    buf[shstrtab_offset] = 0;
    for &id in &module.output_sections {
        let section = module.section(id);
        if section.output_index.is_none() {
            continue;
        }
        buf[cursor..cursor + section.name.len()].copy_from_slice(section.name);
        buf[cursor + section.name.len()] = 0;
        cursor += section.name.len() + 1;
    }
    Ok(())
}

fn write_symbol(
    module: &Module<'_>,
    info_id: ResolveInfoId,
    name_offset: u32,
    emit: Emit,
    buf: &mut [u8],
    at: usize,
) {
    let info = module.info(info_id);
    let symbol = info.out_symbol.map(|id| module.symbol(id));
    let value = symbol.map(|s| s.value).unwrap_or(0);

    let bind = match info.binding {
        Binding::Local => object::elf::STB_LOCAL,
        Binding::Weak => object::elf::STB_WEAK,
        _ => object::elf::STB_GLOBAL,
    };
    let sym_type = match info.sym_type {
        SymbolType::Object => object::elf::STT_OBJECT,
        SymbolType::Function => object::elf::STT_FUNC,
        SymbolType::Section => object::elf::STT_SECTION,
        SymbolType::File => object::elf::STT_FILE,
        SymbolType::ThreadLocal => object::elf::STT_TLS,
        SymbolType::NoType => object::elf::STT_NOTYPE,
    };
    let other = match info.visibility {
        Visibility::Default => object::elf::STV_DEFAULT,
        Visibility::Protected => object::elf::STV_PROTECTED,
        Visibility::Hidden => object::elf::STV_HIDDEN,
        Visibility::Internal => object::elf::STV_INTERNAL,
    };

    let shndx: u16 = if info.is_undefined() || info.from_shared {
        object::elf::SHN_UNDEF
    } else if info.binding == Binding::Absolute {
        object::elf::SHN_ABS
    } else {
        symbol
            .and_then(|s| s.frag_ref)
            .map(|frag_ref| {
                let out_frag = module
                    .frag(frag_ref.frag)
                    .string_output_link()
                    .unwrap_or(frag_ref.frag);
                module.section(module.frag_section(out_frag)).output_index
            })
            .flatten()
            .map(|index| index as u16)
            .unwrap_or(object::elf::SHN_ABS)
    };

    // In relocatable output symbol values are section-relative, which they
    // already are because sections have address zero.
    let st_info = (bind << 4) | sym_type;
    if emit.is64 {
        emit.put32(buf, at, name_offset);
        buf[at + 4] = st_info;
        buf[at + 5] = other;
        emit.put16(buf, at + 6, shndx);
        emit.put64(buf, at + 8, value);
        emit.put64(buf, at + 16, info.size);
    } else {
        emit.put32(buf, at, name_offset);
        emit.put32(buf, at + 4, value as u32);
        emit.put32(buf, at + 8, info.size as u32);
        buf[at + 12] = st_info;
        buf[at + 13] = other;
        emit.put16(buf, at + 14, shndx);
    }
}

fn elf_hash(name: &[u8]) -> u32 {
    let mut hash = 0u32;
    for &byte in name {
        hash = (hash << 4).wrapping_add(u32::from(byte));
        let high = hash & 0xf000_0000;
        if high != 0 {
            hash ^= high >> 24;
        }
        hash &= !high;
    }
    hash
}

fn write_hash(module: &Module<'_>, plan: &OutputPlan, hash: SectionId, emit: Emit, buf: &mut [u8]) {
    let base = module.section(hash).file_offset as usize;
    let nsyms = plan.dynsym_entries.len() + 1;
    let nbucket = nsyms.max(1);
    emit.put32(buf, base, nbucket as u32);
    emit.put32(buf, base + 4, nsyms as u32);
    let buckets_at = base + 8;
    let chains_at = buckets_at + nbucket * 4;
    for (index, &info_id) in plan.dynsym_entries.iter().enumerate() {
        let name = &module.info(info_id).name;
        let bucket = (elf_hash(name) as usize) % nbucket;
        // Prepend to the bucket's chain.
        let slot = buckets_at + bucket * 4;
        let previous = u32::from_le_bytes(buf[slot..slot + 4].try_into().unwrap());
        let previous = if emit.little {
            previous
        } else {
            previous.swap_bytes()
        };
        emit.put32(buf, slot, (index + 1) as u32);
        emit.put32(buf, chains_at + (index + 1) * 4, previous);
    }
}

fn write_dynamic(
    module: &Module<'_>,
    plan: &OutputPlan,
    dynamic: SectionId,
    emit: Emit,
    buf: &mut [u8],
) {
    let entsize = dyn_entry_size(emit.is64) as usize;
    let mut at = module.section(dynamic).file_offset as usize;
    let mut put = |buf: &mut [u8], tag: u32, value: u64| {
        if emit.is64 {
            emit.put64(buf, at, u64::from(tag));
            emit.put64(buf, at + 8, value);
        } else {
            emit.put32(buf, at, tag);
            emit.put32(buf, at + 4, value as u32);
        }
        at += entsize;
    };

    for &needed in &plan.dynstr_needed {
        put(buf, object::elf::DT_NEEDED, u64::from(needed));
    }
    if let Some(soname) = plan.dynstr_soname {
        put(buf, object::elf::DT_SONAME, u64::from(soname));
    }
    let addr_of = |id: Option<SectionId>| id.map(|id| module.section(id).addr).unwrap_or(0);
    put(buf, object::elf::DT_HASH, addr_of(plan.hash));
    put(buf, object::elf::DT_STRTAB, addr_of(plan.dynstr_section));
    put(buf, object::elf::DT_SYMTAB, addr_of(plan.dynsym));
    put(buf, object::elf::DT_STRSZ, plan.dynstr.len() as u64);
    put(buf, object::elf::DT_SYMENT, sym_entry_size(emit.is64));
    if let Some(rela_plt) = plan.rela_plt {
        let dyn_info_got_plt = module.output_section_by_name(b".got.plt");
        put(buf, object::elf::DT_PLTGOT, addr_of(dyn_info_got_plt));
        put(
            buf,
            object::elf::DT_PLTRELSZ,
            module.section(rela_plt).size,
        );
        put(
            buf,
            object::elf::DT_PLTREL,
            u64::from(if emit.is64 {
                object::elf::DT_RELA
            } else {
                object::elf::DT_REL
            }),
        );
        put(buf, object::elf::DT_JMPREL, addr_of(Some(rela_plt)));
    }
    put(buf, object::elf::DT_NULL, 0);
}

fn write_reloc_output(
    module: &Module<'_>,
    plan: &OutputPlan,
    reloc_output: &RelocOutput,
    emit: Emit,
    buf: &mut [u8],
) -> Result {
    let is_rela = reloc_output.sh_type == object::elf::SHT_RELA;
    let entsize = rel_entry_size(emit.is64, is_rela) as usize;
    let mut at = module.section(reloc_output.section).file_offset as usize;
    for &source in &reloc_output.sources {
        let Some(data) = module.section(source).reloc_data() else {
            continue;
        };
        for reloc in &data.relocs {
            let offset = module.frag_ref_offset(reloc.target_ref);
            let sym_index = plan
                .symtab_index
                .get(&reloc.sym)
                .copied()
                .ok_or_else(|| anyhow!("Relocation symbol missing from output symbol table"))?;
            if emit.is64 {
                emit.put64(buf, at, offset);
                emit.put64(
                    buf,
                    at + 8,
                    ((sym_index as u64) << 32) | u64::from(reloc.r_type),
                );
                if is_rela {
                    emit.put64(buf, at + 16, reloc.addend as u64);
                }
            } else {
                emit.put32(buf, at, offset as u32);
                emit.put32(
                    buf,
                    at + 4,
                    ((sym_index as u32) << 8) | (reloc.r_type & 0xff),
                );
                if is_rela {
                    emit.put32(buf, at + 8, reloc.addend as u32);
                }
            }
            at += entsize;
        }
    }
    Ok(())
}

/// Writes each relocation's computed bytes over its site.
fn sync_relocations(
    module: &Module<'_>,
    relocator: &dyn Relocator,
    emit: Emit,
    buf: &mut [u8],
) {
    let mut sync = |reloc: &crate::relocation::Relocation| {
        let section = module.section(module.frag_section(reloc.target_ref.frag));
        if section.sh_type == object::elf::SHT_NOBITS || section.output_index.is_none() {
            return;
        }
        let position = (section.file_offset + module.frag_ref_offset(reloc.target_ref)) as usize;
        let width = (relocator.reloc_size_bits(reloc.r_type) / 8) as usize;
        emit.put_bytes(buf, position, reloc.target_data, width.min(emit.word_size()));
    };
    for input in &module.inputs {
        for &reloc_section in &input.reloc_sections {
            let Some(data) = module.section(reloc_section).reloc_data() else {
                continue;
            };
            for reloc in &data.relocs {
                sync(reloc);
            }
        }
    }
    for reloc in &module.stub_relocs {
        sync(reloc);
    }
}

fn apply_patches(module: &Module<'_>, patches: &[Patch], emit: Emit, buf: &mut [u8]) {
    for patch in patches {
        let section = module.section(patch.section);
        let position = (section.file_offset + patch.offset) as usize;
        emit.put_bytes(buf, position, patch.value, patch.width as usize);
    }
}

/// Synthesises the `.eh_frame_hdr` binary-search table from the FDEs in the
/// already-relocated `.eh_frame` content. PC-begin values are assumed to use
/// the `pcrel | sdata4` encoding, which is what GCC and Clang emit.
fn write_eh_frame_hdr(
    module: &Module<'_>,
    plan: &OutputPlan,
    eh_frame_hdr: SectionId,
    emit: Emit,
    buf: &mut [u8],
) -> Result {
    let Some(eh_frame) = module.output_section_by_name(b".eh_frame") else {
        return Ok(());
    };
    let eh_frame_addr = module.section(eh_frame).addr;
    let eh_frame_offset = module.section(eh_frame).file_offset as usize;
    let eh_frame_size = module.section(eh_frame).size as usize;
    let hdr_addr = module.section(eh_frame_hdr).addr;
    let hdr_offset = module.section(eh_frame_hdr).file_offset as usize;

    let read32 = |buf: &[u8], at: usize| -> u32 {
        let raw: [u8; 4] = buf[at..at + 4].try_into().unwrap();
        if emit.little {
            u32::from_le_bytes(raw)
        } else {
            u32::from_be_bytes(raw)
        }
    };

    let mut table: Vec<(u64, u64)> = Vec::new();
    let mut record = 0usize;
    while record + 8 <= eh_frame_size {
        let length = read32(buf, eh_frame_offset + record) as usize;
        if length == 0 {
            break;
        }
        let id = read32(buf, eh_frame_offset + record + 4);
        if id != 0 {
            let pc_field_addr = eh_frame_addr + record as u64 + 8;
            let pc_rel = read32(buf, eh_frame_offset + record + 8) as i32;
            let pc = pc_field_addr.wrapping_add(pc_rel as i64 as u64);
            table.push((pc, eh_frame_addr + record as u64));
        }
        record += 4 + length;
    }
    table.sort_unstable();

    if table.len() as u64 != plan.fde_count {
        bail!(
            "eh_frame FDE count changed between prelayout ({}) and emission ({})",
            plan.fde_count,
            table.len()
        );
    }

    buf[hdr_offset] = 1; // version
    buf[hdr_offset + 1] = 0x1b; // eh_frame_ptr: pcrel | sdata4
    buf[hdr_offset + 2] = 0x03; // fde_count: udata4
    buf[hdr_offset + 3] = 0x3b; // table: datarel | sdata4
    let eh_frame_ptr = eh_frame_addr.wrapping_sub(hdr_addr + 4) as u32;
    emit.put32(buf, hdr_offset + 4, eh_frame_ptr);
    emit.put32(buf, hdr_offset + 8, table.len() as u32);
    let mut at = hdr_offset + 12;
    for (pc, fde) in table {
        emit.put32(buf, at, pc.wrapping_sub(hdr_addr) as u32);
        emit.put32(buf, at + 4, fde.wrapping_sub(hdr_addr) as u32);
        at += 8;
    }
    Ok(())
}

fn write_shdrs(
    module: &Module<'_>,
    plan: &OutputPlan,
    emit: Emit,
    buf: &mut [u8],
    layout: &Layout,
) -> Result {
    let entsize = if emit.is64 { 64usize } else { 40 };
    let base = layout.shoff as usize;

    // Name offsets follow the order the names were written into .shstrtab.
    let mut name_offsets: HashMap<SectionId, u32> = HashMap::new();
    let mut cursor = 1u32;
    for &id in &module.output_sections {
        let section = module.section(id);
        if section.output_index.is_none() {
            continue;
        }
        name_offsets.insert(id, cursor);
        cursor += section.name.len() as u32 + 1;
    }

    let link_for = |section: &Section| -> u32 {
        let linked = match section.sh_type {
            object::elf::SHT_SYMTAB => plan.strtab_section,
            object::elf::SHT_DYNSYM => plan.dynstr_section,
            object::elf::SHT_HASH => plan.dynsym,
            object::elf::SHT_DYNAMIC => plan.dynstr_section,
            object::elf::SHT_REL | object::elf::SHT_RELA => plan.symtab,
            _ => None,
        };
        linked
            .and_then(|id| module.section(id).output_index)
            .unwrap_or(0) as u32
    };

    for &id in &module.output_sections {
        let section = module.section(id);
        let Some(index) = section.output_index else {
            continue;
        };
        let at = base + index * entsize;
        let sh_name = name_offsets.get(&id).copied().unwrap_or(0);
        let sh_info: u32 = match section.sh_type {
            object::elf::SHT_SYMTAB => plan.symtab_local_count as u32,
            object::elf::SHT_REL | object::elf::SHT_RELA => section
                .link
                .and_then(|target| module.section(target).output_index)
                .unwrap_or(0) as u32,
            _ => 0,
        };

        emit.put32(buf, at, sh_name);
        emit.put32(buf, at + 4, section.sh_type);
        if emit.is64 {
            emit.put64(buf, at + 8, section.flags.raw());
            emit.put64(buf, at + 16, section.addr);
            emit.put64(buf, at + 24, section.file_offset);
            emit.put64(buf, at + 32, section.size);
            emit.put32(buf, at + 40, link_for(section));
            emit.put32(buf, at + 44, sh_info);
            emit.put64(buf, at + 48, section.alignment.value());
            emit.put64(buf, at + 56, section.entsize);
        } else {
            emit.put32(buf, at + 8, section.flags.raw() as u32);
            emit.put32(buf, at + 12, section.addr as u32);
            emit.put32(buf, at + 16, section.file_offset as u32);
            emit.put32(buf, at + 20, section.size as u32);
            emit.put32(buf, at + 24, link_for(section));
            emit.put32(buf, at + 28, sh_info);
            emit.put32(buf, at + 32, section.alignment.value() as u32);
            emit.put32(buf, at + 36, section.entsize as u32);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elf_hash_known_values() {
        // Reference values from the SysV ABI.
        assert_eq!(elf_hash(b""), 0);
        assert_eq!(elf_hash(b"printf"), 0x077905a6);
    }

    #[test]
    fn test_emit_endianness() {
        let little = Emit {
            little: true,
            is64: true,
        };
        let big = Emit {
            little: false,
            is64: false,
        };
        let mut buf = [0u8; 8];
        little.put32(&mut buf, 0, 0x11223344);
        assert_eq!(&buf[..4], &[0x44, 0x33, 0x22, 0x11]);
        big.put32(&mut buf, 0, 0x11223344);
        assert_eq!(&buf[..4], &[0x11, 0x22, 0x33, 0x44]);
        little.put_bytes(&mut buf, 0, 0xaabb, 2);
        assert_eq!(&buf[..2], &[0xbb, 0xaa]);
        big.put_bytes(&mut buf, 0, 0xaabb, 2);
        assert_eq!(&buf[..2], &[0xaa, 0xbb]);
    }
}
