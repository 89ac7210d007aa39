//! The link driver. Phases run in a fixed order, each completing before the
//! next: normalize and read inputs (pulling archive members to a fixpoint),
//! merge sections, add standard/target/script symbols, allocate commons,
//! scan relocations, relax stubs, prelayout, layout, finalize symbol values,
//! apply relocations, emit, post-process.

use crate::arch::Architecture;
use crate::args::Args;
use crate::args::OutputKind;
use crate::archive::ArchiveEntry;
use crate::archive::ArchiveIterator;
use crate::backend::TargetBackend;
use crate::elf;
use crate::elf_writer;
use crate::elf_writer::OutputPlan;
use crate::elf_writer::WriteInputs;
use crate::error::Context as _;
use crate::error::LinkError;
use crate::error::Result;
use crate::file_kind;
use crate::file_kind::FileKind;
use crate::fragment::FragmentId;
use crate::fragment::FragmentKind;
use crate::fragment::FragmentRef;
use crate::input_data;
use crate::input_data::InputSequence;
use crate::layout;
use crate::linker_script::parse_expression_text;
use crate::linker_script::AssignmentKind;
use crate::linker_script::RpnExpression;
use crate::merge_string;
use crate::merge_string::MergeString;
use crate::merge_string::MergeStringId;
use crate::module::InputId;
use crate::module::InputKind;
use crate::module::Module;
use crate::relocator::issue_undef_ref;
use crate::relocator::partial_scan;
use crate::relocator::ApplyResult;
use crate::section::SectionId;
use crate::section::SectionKind;
use crate::symbol::Binding;
use crate::symbol::ResolveInfoId;
use crate::symbol::Symbol;
use crate::symbol::SymbolDesc;
use crate::symbol::SymbolId;
use crate::symbol::SymbolType;
use crate::symbol::Visibility;
use crate::x86_64::X86_64;
use anyhow::anyhow;
use anyhow::bail;
use hashbrown::HashMap;
use hashbrown::HashSet;
use rivet_utils::elf::shf;
use rivet_utils::elf::SectionFlags;
use rivet_utils::elf::MERGEABLE_FLAGS;
use std::borrow::Cow;

/// Stub relaxation must make progress each round; a link that hasn't
/// converged by now never will.
const MAX_RELAX_ITERATIONS: usize = 16;

pub(crate) fn link(args: &Args) -> Result {
    let sequence = input_data::load_inputs(args)?;
    drive(args, &sequence)
}

#[tracing::instrument(skip_all, name = "Link")]
fn drive<'data>(args: &'data Args, sequence: &'data InputSequence) -> Result {
    if sequence.order.is_empty() {
        bail!("no input files");
    }

    // Linkability checks come before reading any section bodies.
    let mut has_shared_input = false;
    for &file_index in &sequence.order {
        let file = &sequence.files[file_index];
        if file.kind == FileKind::ElfDynamic {
            has_shared_input = true;
            if !file.modifiers.allow_shared {
                bail!(LinkError::MixedStaticShared(
                    file.filename.display().to_string()
                ));
            }
        }
    }
    if args.nmagic && has_shared_input {
        bail!(LinkError::NMagicNotStatic);
    }

    let arch = select_architecture(args, sequence)?;
    let mut backend: Box<dyn TargetBackend> = match arch {
        Architecture::X86_64 => Box::new(X86_64::new(args.output_kind)),
        Architecture::Arm => Box::new(crate::arm::Arm::new(args.output_kind)),
    };

    let mut module = Module::new();
    backend.init_target_sections(&mut module)?;
    backend.init_target_stubs();

    // Phases 1 & 2: read objects and shared objects in link order; archives
    // hold their members back until an undefined symbol demands them.
    let mut archives: Vec<PendingArchive<'data>> = Vec::new();
    let mut object_inputs: Vec<(InputId, bool)> = Vec::new();
    let mut shared_inputs: Vec<SharedInput> = Vec::new();

    for &file_index in &sequence.order {
        let file = &sequence.files[file_index];
        let data = file.data();
        let display = file.filename.display().to_string();
        match file.kind {
            FileKind::ElfObject => {
                let outcome = elf::read_object(&mut module, data, display)
                    .with_context(|| format!("Failed to read `{file}`"))?;
                check_machine(&*backend, &module, outcome.input, outcome.machine)?;
                object_inputs.push((outcome.input, file_kind::elf_ident(data)?.is_64));
            }
            FileKind::ElfDynamic => {
                let outcome = elf::read_dynamic_object(&mut module, data, display)
                    .with_context(|| format!("Failed to read `{file}`"))?;
                check_machine(&*backend, &module, outcome.input, outcome.machine)?;
                let needed_name = elf::read_soname(data)?
                    .map(<[u8]>::to_vec)
                    .unwrap_or_else(|| {
                        file.filename
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned().into_bytes())
                            .unwrap_or_default()
                    });
                shared_inputs.push(SharedInput {
                    needed_name,
                    as_needed: file.modifiers.as_needed,
                    defined: outcome.defined_names,
                });
            }
            FileKind::Archive => {
                archives.push(PendingArchive::parse(data, display)?);
            }
            FileKind::Text => {}
        }
    }

    // Pull archive members that define currently-unresolved symbols, to a
    // fixpoint: each pulled member can itself leave new undefined symbols.
    loop {
        let mut progressed = false;
        for archive in &mut archives {
            for &(name, member_offset) in &archive.index {
                if archive.loaded.contains(&member_offset) {
                    continue;
                }
                let wanted = module
                    .pool
                    .lookup(name)
                    .is_some_and(|id| module.info(id).is_undefined());
                if !wanted {
                    continue;
                }
                let Some(&(ident, member_data)) = archive.members.get(&member_offset) else {
                    bail!(
                        "Symbol index of `{}` refers to a missing member at offset {member_offset}",
                        archive.name
                    );
                };
                archive.loaded.insert(member_offset);
                let display = format!("{}({})", archive.name, String::from_utf8_lossy(ident));
                let outcome = elf::read_object(&mut module, member_data, display)?;
                check_machine(&*backend, &module, outcome.input, outcome.machine)?;
                object_inputs.push((outcome.input, file_kind::elf_ident(member_data)?.is_64));
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    // Relocations were deferred until symbol resolution settled.
    for &(input_id, is_64) in &object_inputs {
        elf::read_relocations(&mut module, input_id, is_64).with_context(|| {
            format!("Failed to read relocations of `{}`", module.input(input_id).name)
        })?;
    }

    // DT_NEEDED accounting; an as-needed library only counts if one of its
    // definitions satisfied a reference.
    for shared in &shared_inputs {
        let used = !shared.as_needed
            || shared.defined.iter().any(|name| {
                module.pool.lookup(name).is_some_and(|id| {
                    let info = module.info(id);
                    info.from_shared && info.referenced
                })
            });
        if used {
            module.needed.push(shared.needed_name.clone());
        }
    }
    module.soname = args.soname.clone();

    // Phase 3: merge sections.
    merge_sections(&mut module)?;

    // Phase 4: standard and target symbols.
    for index in 0..module.output_sections.len() {
        let section_id = module.output_sections[index];
        module.add_section_symbol(section_id);
    }
    backend.init_target_symbols(&mut module)?;

    // Phase 5: script-defined symbols. Values are evaluated after layout;
    // here each assignment claims its symbol handle.
    let script_defs = collect_script_defs(args, sequence)?;
    let mut pending_assignments: Vec<(SymbolId, RpnExpression)> = Vec::new();
    for def in &script_defs {
        let existing = module.pool.lookup(def.name);
        if def.kind.is_provide() {
            let Some(id) = existing else { continue };
            if !module.info(id).is_undefined() {
                continue;
            }
        }
        let info_id = match existing {
            Some(id) => id,
            None => module.pool.get_or_create(def.name),
        };
        let symbol_id = match module.info(info_id).out_symbol {
            Some(id) => id,
            None => module.add_symbol(Symbol::new(info_id)),
        };
        {
            let info = module.info_mut(info_id);
            info.desc = SymbolDesc::Define;
            info.binding = Binding::Absolute;
            if def.kind.is_hidden() {
                info.visibility = info.visibility.max(Visibility::Hidden);
            }
            info.out_symbol = Some(symbol_id);
        }
        pending_assignments.push((symbol_id, def.expression.clone()));
    }

    // Phase 6: allocate commons into .bss / .tbss.
    allocate_commons(&mut module)?;

    // Phase 7: scan (or, for -r, partial-scan) relocations.
    let relocatable = args.output_kind.is_relocatable();
    {
        let relocator = backend.relocator_mut();
        for &(input_id, _) in &object_inputs {
            relocator.initialize_scan(&mut module, input_id)?;
            let reloc_sections = module.input(input_id).reloc_sections.clone();
            for reloc_section in reloc_sections {
                if reloc_target_dropped(&module, reloc_section) {
                    continue;
                }
                let count = reloc_count(&module, reloc_section);
                for index in 0..count {
                    if relocatable {
                        let mut reloc = module.reloc(reloc_section, index);
                        partial_scan(&mut module, &mut reloc, &*relocator)?;
                        *module.reloc_mut(reloc_section, index) = reloc;
                    } else {
                        let reloc = module.reloc(reloc_section, index);
                        relocator.scan(&mut module, &reloc, input_id)?;
                    }
                }
            }
            relocator.finalize_scan(&mut module, input_id)?;
        }
    }

    // Phase 8: stub relaxation to a fixpoint.
    if !relocatable && backend.wants_relaxation() {
        let mut converged = false;
        for _ in 0..MAX_RELAX_ITERATIONS {
            layout::compute(&mut module, &*backend, args.output_kind)?;
            let mut finished = true;
            backend.do_relax(&mut module, &mut finished)?;
            if finished {
                converged = true;
                break;
            }
        }
        if !converged {
            bail!(LinkError::RelaxationDiverged);
        }
        backend.finalize_stubs(&mut module)?;
    }

    // Phase 9: prelayout; section symbols for late-created sections, then
    // name-pool sizing.
    layout::assign_fragment_offsets(&mut module);
    for index in 0..module.output_sections.len() {
        let section_id = module.output_sections[index];
        module.add_section_symbol(section_id);
    }
    let plan = OutputPlan::prelayout(&mut module, &*backend, args.output_kind)?;

    // Phase 10: layout.
    let layout = layout::compute(&mut module, &*backend, args.output_kind)?;

    // Phase 11: finalize symbol values, then script assignments.
    finalize_symbol_values(&mut module, &*backend);
    backend.finalize_target_symbols(&mut module)?;
    let image_end = module
        .output_sections
        .iter()
        .map(|&id| {
            let section = module.section(id);
            if section.is_alloc() {
                section.addr + section.size
            } else {
                0
            }
        })
        .max()
        .unwrap_or(0);
    for (symbol_id, expression) in &pending_assignments {
        let value = expression.evaluate(
            &|name| {
                module
                    .pool
                    .lookup(name.as_bytes())
                    .and_then(|id| module.info(id).out_symbol)
                    .map(|sid| module.symbol(sid).value)
            },
            image_end,
        )?;
        module.symbol_mut(*symbol_id).value = value;
    }

    // Phase 12: apply relocations. Overflow and bad-reloc results are
    // collected per relocation; the link fails once the phase completes.
    if !relocatable {
        apply_relocations(&mut module, &mut *backend, &object_inputs)?;
    }

    // Phases 13 & 14: emit and post-process.
    let entry = entry_address(&module, args, sequence, &*backend);
    let patches = backend.relocator_mut().take_patches();
    elf_writer::write(
        &mut module,
        &*backend,
        backend.relocator(),
        &plan,
        &layout,
        args.output_kind,
        WriteInputs {
            entry,
            patches: &patches,
        },
        &args.output,
    )?;

    Ok(())
}

struct SharedInput {
    needed_name: Vec<u8>,
    as_needed: bool,
    defined: Vec<Vec<u8>>,
}

struct PendingArchive<'data> {
    name: String,
    index: Vec<(&'data [u8], usize)>,
    members: HashMap<usize, (&'data [u8], &'data [u8])>,
    loaded: HashSet<usize>,
}

impl<'data> PendingArchive<'data> {
    fn parse(data: &'data [u8], name: String) -> Result<PendingArchive<'data>> {
        let mut index = Vec::new();
        let mut members = HashMap::new();
        let mut contents = Vec::new();
        let mut filenames = None;
        for entry in ArchiveIterator::from_archive_bytes(data)
            .with_context(|| format!("Failed to read archive `{name}`"))?
        {
            match entry? {
                ArchiveEntry::SymbolTable(table) => index = table.symbols()?,
                ArchiveEntry::Filenames(table) => filenames = Some(table),
                ArchiveEntry::Regular(content) => contents.push(content),
            }
        }
        for content in contents {
            members.insert(
                content.header_offset,
                (content.identifier(filenames), content.entry_data),
            );
        }
        if index.is_empty() && !members.is_empty() {
            bail!("Archive `{name}` has no symbol index");
        }
        Ok(PendingArchive {
            name,
            index,
            members,
            loaded: HashSet::new(),
        })
    }
}

fn check_machine(
    backend: &dyn TargetBackend,
    module: &Module<'_>,
    input: InputId,
    machine: u16,
) -> Result {
    if machine != backend.machine() {
        bail!(
            "`{}` has incompatible architecture 0x{machine:x}, expecting 0x{:x}",
            module.input(input).name,
            backend.machine(),
        );
    }
    Ok(())
}

fn select_architecture(args: &Args, sequence: &InputSequence) -> Result<Architecture> {
    if let Some(arch) = args.arch {
        return Ok(arch);
    }
    if let Some(name) = &sequence.script.output_arch {
        if name.contains("arm") {
            return Ok(Architecture::Arm);
        }
        if name.contains("x86-64") || name.contains("x86_64") {
            return Ok(Architecture::X86_64);
        }
    }
    for &file_index in &sequence.order {
        let file = &sequence.files[file_index];
        if !matches!(file.kind, FileKind::ElfObject | FileKind::ElfDynamic) {
            continue;
        }
        let data = file.data();
        let ident = file_kind::elf_ident(data)?;
        if data.len() < 20 {
            continue;
        }
        let raw = [data[18], data[19]];
        let machine = if ident.is_little_endian {
            u16::from_le_bytes(raw)
        } else {
            u16::from_be_bytes(raw)
        };
        return Architecture::try_from(machine);
    }
    bail!("Unable to determine output architecture");
}

struct ScriptDef<'data> {
    name: &'data [u8],
    kind: AssignmentKind,
    expression: RpnExpression,
}

fn collect_script_defs<'data>(
    args: &'data Args,
    sequence: &'data InputSequence,
) -> Result<Vec<ScriptDef<'data>>> {
    let mut defs = Vec::new();
    for assignment in &sequence.script.assignments {
        defs.push(ScriptDef {
            name: assignment.name.as_bytes(),
            kind: assignment.kind,
            expression: assignment.expression.clone(),
        });
    }
    for (name, expression) in &args.defsym {
        defs.push(ScriptDef {
            name: name.as_bytes(),
            kind: AssignmentKind::Force,
            expression: parse_expression_text(expression)
                .with_context(|| format!("Bad --defsym expression for `{name}`"))?,
        });
    }
    Ok(defs)
}

/// The output section name an input section maps to. Default entries are
/// static; the catch-all keeps the input's own name.
fn output_name_for<'data>(module: &Module<'data>, input_name: &'data [u8]) -> Result<&'data [u8]> {
    let Some(mapping) = module.section_map.find(input_name) else {
        bail!(LinkError::UnrecognizedOutputSection(
            String::from_utf8_lossy(input_name).into_owned()
        ));
    };
    Ok(match &mapping.output {
        Some(Cow::Borrowed(name)) => name.as_bytes(),
        Some(Cow::Owned(name)) => crate::symbol::leak_name(name.clone().into_bytes()),
        None => input_name,
    })
}

/// Phase 3: move every input section's content into its output section.
/// Merge-string inputs deduplicate through the output merger; everything
/// else splices fragments, widening the output's alignment and or-ing in the
/// permissible flags.
#[tracing::instrument(skip_all, name = "Merge sections")]
fn merge_sections(module: &mut Module<'_>) -> Result {
    for input_index in 0..module.inputs.len() {
        if module.inputs[input_index].kind != InputKind::Object {
            continue;
        }
        let section_ids = module.inputs[input_index].sections.clone();
        for section_id in section_ids {
            let (kind, in_merger, name, sh_type, flags, alignment, entsize) = {
                let section = module.section(section_id);
                (
                    section.kind,
                    section.merge,
                    section.name,
                    section.sh_type,
                    section.flags,
                    section.alignment,
                    section.entsize,
                )
            };
            if kind.skipped_when_merging() || kind == SectionKind::Target {
                continue;
            }
            if module.section(section_id).data().is_none_or(|d| d.is_empty()) {
                continue;
            }

            let out_name = output_name_for(module, name)?;
            let out_section = module.get_or_create_output_section(
                out_name,
                kind,
                sh_type,
                flags.masked(MERGEABLE_FLAGS)
                    .with(flags.masked(SectionFlags::from_u32(
                        object::elf::SHF_MERGE | object::elf::SHF_STRINGS,
                    ))),
                alignment,
            );
            {
                let out = module.section_mut(out_section);
                out.flags |= flags.masked(MERGEABLE_FLAGS);
                if out.alignment < alignment {
                    out.alignment = alignment;
                }
                if out.entsize == 0 {
                    out.entsize = entsize;
                }
            }

            let out_has_merger = module.section(out_section).merge.is_some();
            let out_is_empty = module
                .section(out_section)
                .data()
                .is_none_or(|d| d.is_empty());

            match (in_merger, out_has_merger) {
                (Some(in_ms), true) => {
                    let out_ms = module.section(out_section).merge.unwrap();
                    merge_string::merge(module, out_ms, in_ms, false)?;
                }
                (Some(in_ms), false) => {
                    if out_is_empty {
                        let out_ms = merge_string::output_merger(module, out_section);
                        merge_string::merge(module, out_ms, in_ms, false)?;
                    } else {
                        // The output is already plain content; keep this
                        // input's strings addressable but don't deduplicate.
                        append_entries_plain(module, out_section, in_ms);
                    }
                }
                (None, true) => {
                    // A non-mergeable input coalesced into a merge output:
                    // forced mode appends every string unconditionally.
                    let in_ms = force_split(module, section_id)?;
                    let out_ms = module.section(out_section).merge.unwrap();
                    merge_string::merge(module, out_ms, in_ms, true)?;
                }
                (None, false) => {
                    splice_section(module, out_section, section_id, alignment);
                }
            }
            module.section_mut(section_id).out = Some(out_section);
        }
    }

    // Assign the byte-sorted output offsets, then permanently rewrite
    // symbol refs into merged strings; no per-access indirection remains in
    // the relocation loop.
    for index in 0..module.merge_strings.len() {
        let ms_id = MergeStringId::from_usize(index);
        if matches!(module.merge_string(ms_id), MergeString::Output(_)) {
            merge_string::finalize_output(module, ms_id);
        }
    }
    for index in 0..module.symbols.len() {
        let symbol_id = SymbolId::from_usize(index);
        let Some(frag_ref) = module.symbol(symbol_id).frag_ref else {
            continue;
        };
        if module.frag(frag_ref.frag).string_output_link().is_none() {
            continue;
        }
        if module.info(module.symbol(symbol_id).info).sym_type == SymbolType::Section {
            continue;
        }
        let mut rewritten = frag_ref;
        merge_string::update_fragment_ref(module, &mut rewritten);
        module.symbol_mut(symbol_id).frag_ref = Some(rewritten);
    }
    Ok(())
}

/// Converts a plain section's single region into string entries so forced
/// merging can record per-string offsets.
fn force_split<'data>(
    module: &mut Module<'data>,
    section_id: SectionId,
) -> Result<MergeStringId> {
    let bytes = {
        let section = module.section(section_id);
        let frags = &section.data().expect("checked non-empty").frags;
        let [only] = frags.as_slice() else {
            bail!(LinkError::CannotMergeSection(
                section.display_name().into_owned()
            ));
        };
        match &module.frag(*only).kind {
            FragmentKind::Region(bytes) => *bytes,
            _ => bail!(LinkError::CannotMergeSection(
                module.section(section_id).display_name().into_owned()
            )),
        }
    };
    module.section_mut(section_id).payload = crate::section::SectionPayload::None;
    merge_string::split_input_section(module, section_id, bytes).map_err(|_| {
        anyhow!(LinkError::CannotMergeSection(
            module.section(section_id).display_name().into_owned()
        ))
    })
}

/// Appends an input merger's entries to a non-merge output as plain
/// fragments; each entry links to itself so relocation retargeting still
/// resolves.
fn append_entries_plain(module: &mut Module<'_>, out_section: SectionId, in_ms: MergeStringId) {
    let MergeString::Input(input) = module.merge_string(in_ms) else {
        return;
    };
    let input_section = input.section;
    let entries: Vec<FragmentId> = input.entries.values().copied().collect();
    for frag_id in entries {
        let size = module.frag(frag_id).size();
        if let FragmentKind::StringEntry { output_link, .. } = &mut module.frag_mut(frag_id).kind
        {
            *output_link = Some(frag_id);
        }
        module.frag_mut(frag_id).parent = out_section;
        let offset = module.section(out_section).size;
        module.frag_mut(frag_id).offset = offset;
        module.section_mut(out_section).data_mut().push(frag_id);
        module.section_mut(out_section).size += size;
    }
    module.section_mut(input_section).kind = SectionKind::Ignore;
}

/// Moves all fragments from an input section to the end of an output
/// section, preserving the input's alignment with an alignment fragment.
fn splice_section(
    module: &mut Module<'_>,
    out_section: SectionId,
    input_section: SectionId,
    alignment: crate::alignment::Alignment,
) {
    let frags = {
        let section = module.section_mut(input_section);
        match &mut section.payload {
            crate::section::SectionPayload::Data(data) => std::mem::take(&mut data.frags),
            _ => return,
        }
    };
    if alignment.value() > 1 {
        let current = module.section(out_section).size;
        let padding = alignment.align_up(current) - current;
        if padding > 0 {
            let align_frag = module.alloc_fragment(
                out_section,
                current,
                FragmentKind::Align {
                    boundary: alignment,
                    max_bytes: alignment.value(),
                    fill: 0,
                    padding,
                },
            );
            module.section_mut(out_section).data_mut().push(align_frag);
            module.section_mut(out_section).size += padding;
        }
    }
    for frag_id in frags {
        let size = module.frag(frag_id).size();
        module.frag_mut(frag_id).parent = out_section;
        let offset = module.section(out_section).size;
        module.frag_mut(frag_id).offset = offset;
        module.section_mut(out_section).data_mut().push(frag_id);
        module.section_mut(out_section).size += size;
    }
}

/// Phase 6: every common symbol gets backing store in .bss (or .tbss for
/// thread-locals) and becomes a definition.
fn allocate_commons(module: &mut Module<'_>) -> Result {
    for info_id in module.pool.global_infos() {
        if !module.info(info_id).is_common() {
            continue;
        }
        let (size, alignment, is_tls) = {
            let info = module.info(info_id);
            (
                info.size,
                info.alignment,
                info.sym_type == SymbolType::ThreadLocal,
            )
        };
        let (name, flags): (&'static [u8], SectionFlags) = if is_tls {
            (
                b".tbss",
                SectionFlags::empty()
                    .with(shf::ALLOC)
                    .with(shf::WRITE)
                    .with(shf::TLS),
            )
        } else {
            (b".bss", SectionFlags::empty().with(shf::ALLOC).with(shf::WRITE))
        };
        let section = module.get_or_create_output_section(
            name,
            SectionKind::Bss,
            object::elf::SHT_NOBITS,
            flags,
            alignment,
        );
        let appended = module.append_fragment(
            section,
            FragmentKind::Fill {
                pattern: 0,
                size,
                count: 1,
            },
            alignment,
        );
        let symbol_id = module.add_symbol(Symbol::with_frag_ref(
            info_id,
            FragmentRef::new(appended.frag, 0),
        ));
        let info = module.info_mut(info_id);
        info.desc = SymbolDesc::Define;
        info.section = Some(section);
        info.out_symbol = Some(symbol_id);
    }
    Ok(())
}

fn reloc_target_dropped(module: &Module<'_>, reloc_section: SectionId) -> bool {
    let Some(link) = module.section(reloc_section).link else {
        return true;
    };
    let target = module.section(link);
    target.out.is_none() && target.merge.is_none()
}

fn reloc_count(module: &Module<'_>, reloc_section: SectionId) -> usize {
    module
        .section(reloc_section)
        .reloc_data()
        .map(|d| d.relocs.len())
        .unwrap_or(0)
}

/// Phase 11: symbol values become absolute addresses. Absolute and file
/// symbols hold zero (script assignments overwrite theirs afterwards);
/// thread-locals ask the backend; anything with a definition site gets
/// section address plus in-section offset.
fn finalize_symbol_values(module: &mut Module<'_>, backend: &dyn TargetBackend) {
    for index in 0..module.symbols.len() {
        let symbol_id = SymbolId::from_usize(index);
        let info_id = module.symbol(symbol_id).info;
        let (binding, sym_type) = {
            let info = module.info(info_id);
            (info.binding, info.sym_type)
        };
        if binding == Binding::Absolute || sym_type == SymbolType::File {
            module.symbol_mut(symbol_id).value = 0;
            continue;
        }
        if sym_type == SymbolType::ThreadLocal {
            backend.finalize_tls_symbol(module, symbol_id);
            continue;
        }
        let Some(frag_ref) = module.symbol(symbol_id).frag_ref else {
            continue;
        };
        let home = module.frag_section(frag_ref.frag);
        if module.section(home).merge.is_some() && sym_type == SymbolType::Section {
            // Section symbols into merged strings resolve per relocation.
            continue;
        }
        let value = module.frag_ref_address(frag_ref);
        module.symbol_mut(symbol_id).value = value;
    }
}

/// Phase 12. Overflows and bad relocations accumulate one diagnostic per
/// relocation, unresolved symbols one diagnostic each; the phase always runs
/// to completion before the link fails.
#[tracing::instrument(skip_all, name = "Apply relocations")]
fn apply_relocations(
    module: &mut Module<'_>,
    backend: &mut dyn TargetBackend,
    object_inputs: &[(InputId, bool)],
) -> Result {
    let relocator = backend.relocator_mut();
    let mut diagnostics: Vec<LinkError> = Vec::new();
    let mut reported_undef: HashSet<ResolveInfoId> = HashSet::new();

    for &(input_id, _) in object_inputs {
        relocator.initialize_apply(module, input_id)?;
        let reloc_sections = module.input(input_id).reloc_sections.clone();
        for reloc_section in reloc_sections {
            if reloc_target_dropped(module, reloc_section) {
                continue;
            }
            for index in 0..reloc_count(module, reloc_section) {
                let mut reloc = module.reloc(reloc_section, index);
                {
                    let info = module.info(reloc.sym);
                    if info.is_undefined() && !info.is_weak() {
                        if reported_undef.insert(reloc.sym) {
                            diagnostics.push(issue_undef_ref(module, input_id, &reloc));
                        }
                        continue;
                    }
                }
                let result = relocator.apply(module, &mut reloc);
                *module.reloc_mut(reloc_section, index) = reloc;
                handle_apply_result(module, relocator, &reloc, result, &mut diagnostics)?;
            }
        }
        relocator.finalize_apply(module, input_id)?;
    }

    // Relocations emitted by stub insertion come after the inputs' own.
    let mut stub_relocs = std::mem::take(&mut module.stub_relocs);
    for reloc in &mut stub_relocs {
        let result = relocator.apply(module, reloc);
        handle_apply_result(module, relocator, reloc, result, &mut diagnostics)?;
    }
    module.stub_relocs = stub_relocs;

    relocator.finalize_link(module)?;

    if !diagnostics.is_empty() {
        for diagnostic in &diagnostics {
            eprintln!("rivet: error: {diagnostic}");
        }
        bail!(
            "link failed with {} error(s); first: {}",
            diagnostics.len(),
            diagnostics[0]
        );
    }
    Ok(())
}

fn handle_apply_result(
    module: &Module<'_>,
    relocator: &dyn crate::relocator::Relocator,
    reloc: &crate::relocation::Relocation,
    result: ApplyResult,
    diagnostics: &mut Vec<LinkError>,
) -> Result {
    let describe = || {
        format!(
            "{} against `{}`",
            relocator.reloc_name(reloc.r_type),
            module.info(reloc.sym).name_for_display()
        )
    };
    match result {
        ApplyResult::Ok => Ok(()),
        ApplyResult::Overflow => {
            diagnostics.push(LinkError::RelocOverflow(describe()));
            Ok(())
        }
        ApplyResult::BadReloc => {
            diagnostics.push(LinkError::BadReloc(describe()));
            Ok(())
        }
        ApplyResult::Unsupported => bail!(LinkError::UnsupportedReloc(describe())),
        ApplyResult::Unknown => bail!(LinkError::UnknownReloc(describe())),
    }
}

fn entry_address(
    module: &Module<'_>,
    args: &Args,
    sequence: &InputSequence,
    backend: &dyn TargetBackend,
) -> u64 {
    if !matches!(
        args.output_kind,
        OutputKind::Executable | OutputKind::FlatBinary
    ) {
        return 0;
    }
    let name: &[u8] = args
        .entry
        .as_deref()
        .or(sequence.script.entry.as_deref())
        .map(str::as_bytes)
        .unwrap_or(b"_start");
    if let Some(value) = module
        .pool
        .lookup(name)
        .and_then(|id| module.info(id).out_symbol)
        .map(|sid| module.symbol(sid).value)
    {
        if value != 0 {
            return value;
        }
    }
    // Same fallback as GNU linkers: the start of .text, else the image base.
    crate::error::warning(&format!(
        "cannot find entry symbol `{}`; defaulting to start of .text",
        String::from_utf8_lossy(name)
    ));
    module
        .output_section_by_name(b".text")
        .map(|id| module.section(id).addr)
        .unwrap_or_else(|| backend.base_address(args.output_kind))
}
