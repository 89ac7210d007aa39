//! Reads ELF relocatable objects and shared objects into the fragment model.
//! Reading is generic over the four input shapes (ELF32/ELF64, little/big
//! endian) via `object`'s low-level traits; everything downstream of here is
//! word-size- and endian-neutral.
//!
//! Relocation sections are read separately from the rest of the object,
//! after symbol resolution has completed across all inputs, because each
//! relocation's symbol field must name a settled `ResolveInfo`.

use crate::alignment::Alignment;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_kind;
use crate::fragment::FragmentKind;
use crate::fragment::FragmentRef;
use crate::merge_string;
use crate::merge_string::MergeString;
use crate::module::Input;
use crate::module::InputId;
use crate::module::InputKind;
use crate::module::Module;
use crate::relocation::Relocation;
use crate::section::Section;
use crate::section::SectionId;
use crate::section::SectionKind;
use crate::symbol::Binding;
use crate::symbol::ResolveInfo;
use crate::symbol::Symbol;
use crate::symbol::SymbolDesc;
use crate::symbol::SymbolType;
use crate::symbol::Visibility;
use crate::symbol_pool::SymbolObservation;
use anyhow::bail;
use object::read::elf::Dyn as _;
use object::read::elf::FileHeader;
use object::read::elf::Rel as _;
use object::read::elf::Rela as _;
use object::read::elf::SectionHeader;
use object::read::elf::Sym;
use object::Endian as _;
use object::Endianness;
use rivet_utils::elf::shf;
use rivet_utils::elf::SectionFlags;

pub(crate) struct ReadObjectOutcome {
    pub(crate) input: InputId,
    pub(crate) machine: u16,

    /// Global names this input defined, used for as-needed accounting on
    /// shared objects.
    pub(crate) defined_names: Vec<Vec<u8>>,
}

/// Reads one relocatable object's sections and symbols into the module.
pub(crate) fn read_object<'data>(
    module: &mut Module<'data>,
    data: &'data [u8],
    name: String,
) -> Result<ReadObjectOutcome> {
    let ident = file_kind::elf_ident(data)?;
    if ident.is_64 {
        read_object_impl::<object::elf::FileHeader64<Endianness>>(module, data, name)
    } else {
        read_object_impl::<object::elf::FileHeader32<Endianness>>(module, data, name)
    }
}

/// Reads a shared object's dynamic symbol table. Shared objects contribute
/// resolution state and a DT_NEEDED name, never content.
pub(crate) fn read_dynamic_object<'data>(
    module: &mut Module<'data>,
    data: &'data [u8],
    name: String,
) -> Result<ReadObjectOutcome> {
    let ident = file_kind::elf_ident(data)?;
    if ident.is_64 {
        read_dynamic_impl::<object::elf::FileHeader64<Endianness>>(module, data, name)
    } else {
        read_dynamic_impl::<object::elf::FileHeader32<Endianness>>(module, data, name)
    }
}

/// Reads the relocation sections of a previously-read object.
pub(crate) fn read_relocations<'data>(
    module: &mut Module<'data>,
    input_id: InputId,
    is_64: bool,
) -> Result {
    if is_64 {
        read_relocations_impl::<object::elf::FileHeader64<Endianness>>(module, input_id)
    } else {
        read_relocations_impl::<object::elf::FileHeader32<Endianness>>(module, input_id)
    }
}

fn classify_section(name: &[u8], sh_type: u32, flags: SectionFlags) -> SectionKind {
    match sh_type {
        object::elf::SHT_NULL => SectionKind::Null,
        object::elf::SHT_PROGBITS => {
            if name == b".eh_frame" {
                SectionKind::EhFrame
            } else if !flags.contains(shf::ALLOC) {
                // .comment, .debug_* and friends don't participate in the
                // link.
                SectionKind::Ignore
            } else {
                SectionKind::Regular
            }
        }
        object::elf::SHT_NOBITS => SectionKind::Bss,
        object::elf::SHT_REL | object::elf::SHT_RELA => SectionKind::Relocation,
        object::elf::SHT_SYMTAB | object::elf::SHT_STRTAB | object::elf::SHT_DYNSYM => {
            SectionKind::NamePool
        }
        object::elf::SHT_GROUP => SectionKind::Group,
        object::elf::SHT_NOTE => {
            if name == b".note.GNU-stack" {
                SectionKind::StackNote
            } else {
                SectionKind::Ignore
            }
        }
        object::elf::SHT_INIT_ARRAY
        | object::elf::SHT_FINI_ARRAY
        | object::elf::SHT_PREINIT_ARRAY => SectionKind::Regular,
        t if t >= object::elf::SHT_LOPROC => SectionKind::Target,
        _ => SectionKind::Ignore,
    }
}

fn read_object_impl<'data, H: FileHeader<Endian = Endianness>>(
    module: &mut Module<'data>,
    data: &'data [u8],
    name: String,
) -> Result<ReadObjectOutcome> {
    let header = H::parse(data).context("Failed to parse ELF header")?;
    let endian = header.endian()?;
    let machine = header.e_machine(endian);
    let sections = header.sections(endian, data)?;

    let input_id = module.add_input(Input {
        name,
        kind: InputKind::Object,
        data,
        sections: Vec::new(),
        reloc_sections: Vec::new(),
        symbols: Vec::new(),
    });

    // Materialise the input sections.
    let mut section_ids: Vec<Option<SectionId>> = Vec::new();
    for section in sections.iter() {
        let name = sections.section_name(endian, section)?;
        let sh_type = section.sh_type(endian);
        let flags = SectionFlags::from(section.sh_flags(endian).into());
        let kind = classify_section(name, sh_type, flags);
        match kind {
            SectionKind::Null
            | SectionKind::NamePool
            | SectionKind::Relocation
            | SectionKind::Ignore
            | SectionKind::Group
            | SectionKind::StackNote => {
                section_ids.push(None);
                continue;
            }
            _ => {}
        }

        let alignment = Alignment::new(section.sh_addralign(endian).into())?;
        let mut out = Section::new(name, kind, sh_type, flags, alignment);
        out.entsize = section.sh_entsize(endian).into();
        let section_id = module.add_section(out);

        if kind == SectionKind::Bss {
            let size: u64 = section.sh_size(endian).into();
            if size > 0 {
                let frag = module.alloc_fragment(
                    section_id,
                    0,
                    FragmentKind::Fill {
                        pattern: 0,
                        size,
                        count: 1,
                    },
                );
                module.section_mut(section_id).data_mut().push(frag);
                module.section_mut(section_id).size = size;
            }
        } else {
            let content = section.data(endian, data)?;
            let is_merge_string = flags.contains(shf::MERGE)
                && flags.contains(shf::STRINGS)
                && module.section(section_id).entsize <= 1;
            if is_merge_string && !content.is_empty() {
                merge_string::split_input_section(module, section_id, content).with_context(
                    || {
                        format!(
                            "Bad merge section `{}`",
                            module.section(section_id).display_name()
                        )
                    },
                )?;
                module.section_mut(section_id).size = content.len() as u64;
            } else if !content.is_empty() {
                let frag = module.alloc_fragment(section_id, 0, FragmentKind::Region(content));
                module.section_mut(section_id).data_mut().push(frag);
                module.section_mut(section_id).size = content.len() as u64;
            }
        }
        section_ids.push(Some(section_id));
    }

    // Read the symbol table, offering globals to the pool as we go.
    let symbols = sections.symbols(endian, data, object::elf::SHT_SYMTAB)?;
    let mut symbol_ids = Vec::with_capacity(symbols.len());
    let mut defined_names = Vec::new();
    for (index, sym) in symbols.iter().enumerate() {
        let symbol_id = read_symbol::<H>(
            module,
            input_id,
            sym,
            endian,
            symbols.strings(),
            &section_ids,
            index,
            &mut defined_names,
        )?;
        symbol_ids.push(symbol_id);
    }

    let input = &mut module.inputs[input_id.as_usize()];
    input.sections = section_ids.into_iter().flatten().collect();
    input.symbols = symbol_ids;

    Ok(ReadObjectOutcome {
        input: input_id,
        machine,
        defined_names,
    })
}

#[allow(clippy::too_many_arguments)]
fn read_symbol<'data, H: FileHeader<Endian = Endianness>>(
    module: &mut Module<'data>,
    input_id: InputId,
    sym: &'data H::Sym,
    endian: Endianness,
    strings: object::read::StringTable<'data>,
    section_ids: &[Option<SectionId>],
    index: usize,
    defined_names: &mut Vec<Vec<u8>>,
) -> Result<crate::symbol::SymbolId> {
    let name = sym.name(endian, strings)?;
    let st_type = sym.st_type();
    let sym_type = match st_type {
        object::elf::STT_OBJECT => SymbolType::Object,
        object::elf::STT_FUNC => SymbolType::Function,
        object::elf::STT_SECTION => SymbolType::Section,
        object::elf::STT_FILE => SymbolType::File,
        object::elf::STT_TLS => SymbolType::ThreadLocal,
        _ => SymbolType::NoType,
    };
    let visibility = match sym.st_other() & 0x3 {
        object::elf::STV_INTERNAL => Visibility::Internal,
        object::elf::STV_HIDDEN => Visibility::Hidden,
        object::elf::STV_PROTECTED => Visibility::Protected,
        _ => Visibility::Default,
    };
    let shndx = sym.st_shndx(endian);
    let st_value: u64 = sym.st_value(endian).into();
    let st_size: u64 = sym.st_size(endian).into();

    let section = usize::from(shndx)
        .checked_sub(1)
        .and_then(|_| section_ids.get(usize::from(shndx)))
        .copied()
        .flatten();

    let frag_ref = section.and_then(|section_id| frag_ref_for(module, section_id, st_value));

    // Locals (and symbol 0) don't go through the pool.
    if sym.is_local() || index == 0 {
        let mut info = ResolveInfo::new(name);
        info.sym_type = sym_type;
        info.binding = Binding::Local;
        info.visibility = visibility;
        info.size = st_size;
        info.source = Some(input_id);
        info.section = section;
        info.desc = if shndx == object::elf::SHN_UNDEF && index == 0 {
            SymbolDesc::Undefined
        } else {
            SymbolDesc::Define
        };
        let info_id = module.pool.alloc_unnamed(info);
        let mut symbol = Symbol::new(info_id);
        symbol.frag_ref = frag_ref;
        if shndx == object::elf::SHN_ABS {
            symbol.value = st_value;
        }
        let symbol_id = module.add_symbol(symbol);
        module.pool.info_mut(info_id).out_symbol = Some(symbol_id);
        return Ok(symbol_id);
    }

    let is_common = shndx == object::elf::SHN_COMMON;
    let is_absolute = shndx == object::elf::SHN_ABS;
    let desc = if is_common {
        SymbolDesc::Common
    } else if shndx == object::elf::SHN_UNDEF {
        SymbolDesc::Undefined
    } else {
        SymbolDesc::Define
    };
    let binding = if sym.st_bind() == object::elf::STB_WEAK {
        Binding::Weak
    } else if is_absolute {
        Binding::Absolute
    } else {
        Binding::Global
    };
    let alignment = if is_common {
        Alignment::new(st_value.max(1))?
    } else {
        crate::alignment::MIN
    };

    let (info_id, outcome) = module.pool.insert(SymbolObservation {
        name,
        sym_type,
        desc,
        binding,
        visibility,
        size: st_size,
        alignment,
        from_shared: false,
        source: Some(input_id),
        section,
    })?;

    let mut symbol = Symbol::new(info_id);
    symbol.frag_ref = frag_ref;
    if is_absolute {
        symbol.value = st_value;
    }
    let symbol_id = module.add_symbol(symbol);

    if desc != SymbolDesc::Undefined {
        defined_names.push(name.to_vec());
    }
    if outcome.is_definition() && desc == SymbolDesc::Define {
        module.pool.info_mut(info_id).out_symbol = Some(symbol_id);
    }
    Ok(symbol_id)
}

/// Builds a `FragmentRef` for an offset into an input section. For merge
/// string sections the entry containing the offset is found by greatest
/// lower bound, so that symbols naming a specific string (or a byte inside
/// one) stay attached to that string's fragment through deduplication.
fn frag_ref_for(module: &Module<'_>, section_id: SectionId, offset: u64) -> Option<FragmentRef> {
    if let Some(ms_id) = module.section(section_id).merge {
        if let MergeString::Input(input) = module.merge_string(ms_id) {
            let (&entry_offset, &entry) = input.entries.range(..=offset).next_back()?;
            return Some(FragmentRef::new(entry, offset - entry_offset));
        }
    }
    let first = *module.section(section_id).data()?.frags.first()?;
    Some(FragmentRef::new(first, offset))
}

fn read_dynamic_impl<'data, H: FileHeader<Endian = Endianness>>(
    module: &mut Module<'data>,
    data: &'data [u8],
    name: String,
) -> Result<ReadObjectOutcome> {
    let header = H::parse(data).context("Failed to parse ELF header")?;
    let endian = header.endian()?;
    let machine = header.e_machine(endian);
    let sections = header.sections(endian, data)?;

    let input_id = module.add_input(Input {
        name,
        kind: InputKind::SharedObject,
        data,
        sections: Vec::new(),
        reloc_sections: Vec::new(),
        symbols: Vec::new(),
    });

    let symbols = sections.symbols(endian, data, object::elf::SHT_DYNSYM)?;
    let mut defined_names = Vec::new();
    let mut symbol_ids = Vec::with_capacity(symbols.len());
    for (index, sym) in symbols.iter().enumerate() {
        let name = sym.name(endian, symbols.strings())?;
        if index == 0 || sym.is_undefined(endian) || sym.is_local() || name.is_empty() {
            // Shared objects' own references don't create obligations for
            // this link.
            let info_id = module.pool.alloc_unnamed(ResolveInfo::new(name));
            symbol_ids.push(module.add_symbol(Symbol::new(info_id)));
            continue;
        }
        let binding = if sym.st_bind() == object::elf::STB_WEAK {
            Binding::Weak
        } else {
            Binding::Global
        };
        let sym_type = match sym.st_type() {
            object::elf::STT_OBJECT => SymbolType::Object,
            object::elf::STT_FUNC => SymbolType::Function,
            object::elf::STT_TLS => SymbolType::ThreadLocal,
            _ => SymbolType::NoType,
        };
        let (info_id, outcome) = module.pool.insert(SymbolObservation {
            name,
            sym_type,
            desc: SymbolDesc::Define,
            binding,
            visibility: Visibility::Default,
            size: sym.st_size(endian).into(),
            alignment: crate::alignment::MIN,
            from_shared: true,
            source: Some(input_id),
            section: None,
        })?;
        let symbol_id = module.add_symbol(Symbol::new(info_id));
        if outcome.is_definition() {
            // Shared definitions resolve to zero; the backends route
            // references through the PLT/GOT.
            module.pool.info_mut(info_id).out_symbol = Some(symbol_id);
        }
        defined_names.push(name.to_vec());
        symbol_ids.push(symbol_id);
    }

    module.inputs[input_id.as_usize()].symbols = symbol_ids;

    Ok(ReadObjectOutcome {
        input: input_id,
        machine,
        defined_names,
    })
}

/// Reads DT_SONAME from a shared object, if present.
pub(crate) fn read_soname<'data>(data: &'data [u8]) -> Result<Option<&'data [u8]>> {
    let ident = file_kind::elf_ident(data)?;
    if ident.is_64 {
        read_soname_impl::<object::elf::FileHeader64<Endianness>>(data)
    } else {
        read_soname_impl::<object::elf::FileHeader32<Endianness>>(data)
    }
}

fn read_soname_impl<'data, H: FileHeader<Endian = Endianness>>(
    data: &'data [u8],
) -> Result<Option<&'data [u8]>> {
    let header = H::parse(data)?;
    let endian = header.endian()?;
    let sections = header.sections(endian, data)?;
    for section in sections.iter() {
        let Some((dyns, link)) = section.dynamic(endian, data)? else {
            continue;
        };
        let strings = sections.strings(endian, data, link)?;
        for entry in dyns {
            let tag: u64 = entry.d_tag(endian).into();
            if tag == u64::from(object::elf::DT_SONAME) {
                let offset: u64 = entry.d_val(endian).into();
                return Ok(strings.get(offset as u32).ok());
            }
        }
    }
    Ok(None)
}

fn read_relocations_impl<'data, H: FileHeader<Endian = Endianness>>(
    module: &mut Module<'data>,
    input_id: InputId,
) -> Result {
    let data = module.input(input_id).data;
    let header = H::parse(data).context("Failed to parse ELF header")?;
    let endian = header.endian()?;
    let sections = header.sections(endian, data)?;
    let is_64 = size_of::<H::Word>() == 8;

    // Rebuild the ELF-index → section-id mapping the same way the first
    // read pass did.
    let mut section_ids: Vec<Option<SectionId>> = vec![None; sections.len()];
    {
        let mut materialised = module.input(input_id).sections.iter().copied();
        for (elf_index, section) in sections.iter().enumerate() {
            let name = sections.section_name(endian, section)?;
            let sh_type = section.sh_type(endian);
            let flags = SectionFlags::from(section.sh_flags(endian).into());
            if !matches!(
                classify_section(name, sh_type, flags),
                SectionKind::Null
                    | SectionKind::NamePool
                    | SectionKind::Relocation
                    | SectionKind::Ignore
                    | SectionKind::Group
                    | SectionKind::StackNote
            ) {
                section_ids[elf_index] = materialised.next();
            }
        }
    }

    for section in sections.iter() {
        let sh_type = section.sh_type(endian);
        if sh_type != object::elf::SHT_REL && sh_type != object::elf::SHT_RELA {
            continue;
        }
        let target_index = section.sh_info(endian) as usize;
        let Some(Some(target_section)) = section_ids.get(target_index).copied() else {
            // The section these relocations apply to was dropped.
            continue;
        };
        let name = sections.section_name(endian, section)?;
        let target_bytes = sections
            .section(object::SectionIndex(target_index))
            .ok()
            .and_then(|target| target.data(endian, data).ok())
            .unwrap_or_default();

        let mut relocs = Vec::new();
        if let Some((rels, _)) = section.rel(endian, data)? {
            for rel in rels {
                let r_offset: u64 = rel.r_offset(endian).into();
                let r_sym = rel.r_sym(endian) as usize;
                relocs.push(make_relocation(
                    module,
                    input_id,
                    target_section,
                    r_offset,
                    rel.r_type(endian),
                    r_sym,
                    0,
                    read_word(target_bytes, r_offset, is_64, endian),
                )?);
            }
        }
        if let Some((relas, _)) = section.rela(endian, data)? {
            for rela in relas {
                let r_offset: u64 = rela.r_offset(endian).into();
                let r_sym = rela.r_sym(endian, false) as usize;
                relocs.push(make_relocation(
                    module,
                    input_id,
                    target_section,
                    r_offset,
                    rela.r_type(endian, false),
                    r_sym,
                    rela.r_addend(endian).into(),
                    read_word(target_bytes, r_offset, is_64, endian),
                )?);
            }
        }

        let mut reloc_section = Section::new(
            name,
            SectionKind::Relocation,
            sh_type,
            SectionFlags::empty(),
            Alignment::new(section.sh_addralign(endian).into())?,
        );
        reloc_section.entsize = section.sh_entsize(endian).into();
        reloc_section.link = Some(target_section);
        let reloc_section_id = module.add_section(reloc_section);
        module
            .section_mut(reloc_section_id)
            .reloc_data_mut()
            .relocs = relocs;
        module.inputs[input_id.as_usize()]
            .reloc_sections
            .push(reloc_section_id);
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn make_relocation(
    module: &Module<'_>,
    input_id: InputId,
    target_section: SectionId,
    r_offset: u64,
    r_type: u32,
    r_sym: usize,
    addend: i64,
    target_data: u64,
) -> Result<Relocation> {
    let input = module.input(input_id);
    let Some(&symbol_id) = input.symbols.get(r_sym) else {
        bail!(
            "Relocation in `{}` references out-of-range symbol {r_sym}",
            input.name
        );
    };
    let Some(target_ref) = frag_ref_for(module, target_section, r_offset) else {
        bail!(
            "Relocation in `{}` applies to a section with no content",
            input.name
        );
    };
    Ok(Relocation {
        r_type,
        target_ref,
        sym: module.symbol(symbol_id).info,
        addend,
        target_data,
    })
}

/// Reads the native word at `offset`, zero-padding reads that run off the
/// end of the section.
fn read_word(bytes: &[u8], offset: u64, is_64: bool, endian: Endianness) -> u64 {
    let offset = offset as usize;
    let width = if is_64 { 8 } else { 4 };
    let mut raw = [0u8; 8];
    for i in 0..width {
        raw[i] = bytes.get(offset + i).copied().unwrap_or(0);
    }
    if is_64 {
        if endian.is_little_endian() {
            u64::from_le_bytes(raw)
        } else {
            u64::from_be_bytes(raw)
        }
    } else {
        let word: [u8; 4] = raw[..4].try_into().unwrap();
        if endian.is_little_endian() {
            u64::from(u32::from_le_bytes(word))
        } else {
            u64::from(u32::from_be_bytes(word))
        }
    }
}
