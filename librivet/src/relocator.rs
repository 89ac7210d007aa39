//! The two-pass relocation protocol. `scan` runs per input before layout and
//! reserves GOT/PLT/dynamic-relocation slots; `apply` runs after symbol
//! values are final and computes the bytes, storing them into each
//! relocation's `target_data` for the writer to sync into the output image.
//!
//! The arch-neutral half lives here: rewriting relocations whose target or
//! symbol landed in a merged string section, the symbol-value table, the
//! partial-link (-r) rewrite, and undefined-reference attribution.

use crate::error::LinkError;
use crate::error::Result;
use crate::merge_string;
use crate::module::InputId;
use crate::module::Module;
use crate::relocation::Relocation;
use crate::section::SectionId;
use crate::symbol::SymbolType;
use std::borrow::Cow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApplyResult {
    Ok,
    Overflow,
    BadReloc,
    Unsupported,
    Unknown,
}

/// A direct store into a section's bytes, produced by the relocators for
/// content they own (GOT entry values, PLT instruction words). The writer
/// applies these after section contents are in place.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Patch {
    pub(crate) section: SectionId,
    pub(crate) offset: u64,
    pub(crate) value: u64,
    pub(crate) width: u8,
}

pub(crate) trait Relocator {
    fn initialize_scan(&mut self, _module: &mut Module, _input: InputId) -> Result {
        Ok(())
    }

    fn finalize_scan(&mut self, _module: &mut Module, _input: InputId) -> Result {
        Ok(())
    }

    fn initialize_apply(&mut self, _module: &mut Module, _input: InputId) -> Result {
        Ok(())
    }

    fn finalize_apply(&mut self, _module: &mut Module, _input: InputId) -> Result {
        Ok(())
    }

    /// Reserves whatever auxiliary entries this relocation needs. Pure
    /// bookkeeping; never writes target bytes.
    fn scan(&mut self, module: &mut Module, reloc: &Relocation, input: InputId) -> Result;

    /// Computes and stores the relocation result. The shared front half
    /// rewrites the site if it sits in a merged string section, then
    /// dispatches on the relocation type.
    fn apply(&mut self, module: &mut Module, reloc: &mut Relocation) -> ApplyResult {
        let site_section = module.frag_section(reloc.target_ref.frag);
        if module.section(site_section).merge.is_some() {
            merge_string::update_fragment_ref(module, &mut reloc.target_ref);
        }
        self.do_apply(module, reloc)
    }

    fn do_apply(&mut self, module: &mut Module, reloc: &mut Relocation) -> ApplyResult;

    /// The width in bits of the field a relocation type stores.
    fn reloc_size_bits(&self, r_type: u32) -> u32;

    fn reloc_name(&self, r_type: u32) -> Cow<'static, str>;

    /// Whether this architecture's relocations carry explicit addends.
    fn uses_rela(&self) -> bool;

    /// Decodes the arch-encoded offset a relocation carries against a merge
    /// string section (the addend for RELA, the in-place word for REL).
    fn merge_string_offset(&self, reloc: &Relocation) -> u32 {
        if self.uses_rela() {
            reloc.addend as u32
        } else {
            reloc.target_data as u32
        }
    }

    /// Encodes a merge-string offset back into the relocation.
    fn apply_merge_string_offset(&self, reloc: &mut Relocation, offset: u32) {
        if self.uses_rela() {
            reloc.addend = i64::from(offset);
        } else {
            reloc.target_data = u64::from(offset);
        }
    }

    /// The amount to subtract from a merged-string symbol value so that the
    /// addend the backend re-adds at apply time doesn't get counted twice.
    /// Derived per relocation form rather than assumed globally: REL
    /// backends cancel the in-place word; RELA backends cancel the explicit
    /// addend, and only when it was consumed to select the string (section
    /// symbols).
    fn merge_value_correction(&self, reloc: &Relocation, is_section_symbol: bool) -> u64 {
        if self.uses_rela() {
            if is_section_symbol {
                reloc.addend as u64
            } else {
                0
            }
        } else {
            reloc.target_data
        }
    }

    /// Called once after the apply phase with final symbol values; the
    /// relocator computes the contents of the sections it manages (GOT
    /// entries, PLT bodies) as patches.
    fn finalize_link(&mut self, _module: &Module) -> Result {
        Ok(())
    }

    /// Internal stores this relocator wants written into sections it
    /// manages.
    fn take_patches(&mut self) -> Vec<Patch> {
        Vec::new()
    }

    /// What the writer needs to emit `.rela.plt`/`.dynamic` for the slots
    /// reserved during scan.
    fn dyn_link_info(&self) -> DynLinkInfo {
        DynLinkInfo::default()
    }
}

#[derive(Debug, Default)]
pub(crate) struct DynLinkInfo {
    pub(crate) plt_symbols: Vec<crate::symbol::ResolveInfoId>,
    pub(crate) plt: Option<SectionId>,
    pub(crate) got_plt: Option<SectionId>,
}

/// The output section a symbol's fragment ends up in, following a merged
/// string's output link when there is one.
fn symbol_output_section(module: &Module<'_>, frag_ref: crate::fragment::FragmentRef) -> SectionId {
    let frag = module.frag(frag_ref.frag);
    let resolved = frag.string_output_link().unwrap_or(frag_ref.frag);
    module.frag_section(resolved)
}

/// Computes the value of a relocation's target symbol, per the symbol-value
/// table: merged-string targets translate through the merger (interior
/// pointers included); section symbols evaluate to section address plus
/// in-section offset; anything else uses the finalised symbol value.
pub(crate) fn relocation_symbol_value(
    module: &Module<'_>,
    reloc: &Relocation,
    relocator: &dyn Relocator,
) -> Result<u64> {
    let info = module.info(reloc.sym);
    let Some(symbol_id) = info.out_symbol else {
        return Ok(0);
    };
    let symbol = module.symbol(symbol_id);
    let Some(frag_ref) = symbol.frag_ref else {
        return Ok(symbol.value);
    };

    let home_section = module.frag_section(frag_ref.frag);
    if let Some(ms_id) = module.section(home_section).merge {
        let is_section_symbol = info.sym_type == SymbolType::Section;
        let out_section = symbol_output_section(module, frag_ref);
        let addr = module.section(out_section).addr;
        let offset = if is_section_symbol {
            merge_string::output_offset_from_input(
                module,
                ms_id,
                u64::from(relocator.merge_string_offset(reloc)),
                frag_ref,
            )?
        } else {
            merge_string::output_offset(module, frag_ref)
        };
        let correction = relocator.merge_value_correction(reloc, is_section_symbol);
        return Ok((offset + addr).wrapping_sub(correction));
    }

    if info.sym_type == SymbolType::Section {
        return Ok(module.frag_ref_address(frag_ref));
    }

    Ok(symbol.value)
}

/// Partial-link (-r) processing for one relocation: rewrite the stored
/// offset to the post-merge location and retarget the symbol at the output
/// section's section symbol, without resolving any absolute address.
pub(crate) fn partial_scan(
    module: &mut Module<'_>,
    reloc: &mut Relocation,
    relocator: &dyn Relocator,
) -> Result {
    let info = module.info(reloc.sym);
    let Some(symbol_id) = info.out_symbol else {
        return Ok(());
    };
    let sym_type = info.sym_type;
    let Some(frag_ref) = module.symbol(symbol_id).frag_ref else {
        return Ok(());
    };

    let home_section = module.frag_section(frag_ref.frag);
    if let Some(ms_id) = module.section(home_section).merge {
        let offset = if sym_type == SymbolType::Section {
            merge_string::output_offset_from_input(
                module,
                ms_id,
                u64::from(relocator.merge_string_offset(reloc)),
                frag_ref,
            )?
        } else {
            merge_string::output_offset(module, frag_ref)
        };
        relocator.apply_merge_string_offset(reloc, offset as u32);
        let out_section = symbol_output_section(module, frag_ref);
        retarget_at_section_symbol(module, reloc, out_section);
    } else if sym_type == SymbolType::Section {
        let offset = module.frag_ref_offset(frag_ref);
        if relocator.uses_rela() {
            reloc.addend = reloc.addend.wrapping_add(offset as i64);
        } else {
            reloc.target_data = reloc.target_data.wrapping_add(offset);
        }
        retarget_at_section_symbol(module, reloc, home_section);
    }
    Ok(())
}

fn retarget_at_section_symbol(module: &Module<'_>, reloc: &mut Relocation, section: SectionId) {
    if let Some(symbol_id) = module.section_symbol(section) {
        reloc.sym = module.symbol(symbol_id).info;
    }
}

/// Builds the diagnostic for an unresolved reference. For sites in a text
/// section, the containing input's `File` and `Function` symbols are
/// inspected to name the caller: the function whose `[value, value + size)`
/// range covers the relocation site.
pub(crate) fn issue_undef_ref(
    module: &Module<'_>,
    input_id: InputId,
    reloc: &Relocation,
) -> LinkError {
    let symbol = module.info(reloc.sym).name_for_display();
    let input = module.input(input_id);
    let site_section = module.frag_section(reloc.target_ref.frag);
    let section_name = module.section(site_section).name;

    if !section_name.starts_with(b".text") {
        return LinkError::UndefinedReference(symbol);
    }

    let site_address = module.frag_ref_address(reloc.target_ref);
    let mut caller_file = String::new();
    let mut caller_func = String::new();
    for &symbol_id in &input.symbols {
        let observation = module.symbol(symbol_id);
        let info = module.info(observation.info);
        match info.sym_type {
            SymbolType::File => {
                caller_file = String::from_utf8_lossy(&info.name).into_owned();
            }
            SymbolType::Function => {
                let value = observation.value;
                if value <= site_address && site_address < value + info.size {
                    caller_func = info.name_for_display();
                    break;
                }
            }
            _ => {}
        }
    }

    if caller_func.is_empty() {
        return LinkError::UndefinedReference(symbol);
    }
    let file = if caller_file.is_empty() {
        input.name.clone()
    } else {
        caller_file
    };
    LinkError::UndefinedReferenceInText {
        symbol,
        file,
        caller: caller_func,
    }
}
