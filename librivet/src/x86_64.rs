//! The x86-64 backend: RELA relocations, GOT/PLT reservation during scan,
//! static TLS. x86-64 branches reach the whole address space, so this
//! backend registers no stub prototypes.

use crate::alignment;
use crate::args::OutputKind;
use crate::backend::TargetBackend;
use crate::error::LinkError;
use crate::error::Result;
use crate::fragment::FragmentKind;
use crate::layout;
use crate::module::InputId;
use crate::module::Module;
use crate::relocation::Relocation;
use crate::relocator::ApplyResult;
use crate::relocator::DynLinkInfo;
use crate::relocator::Patch;
use crate::relocator::Relocator;
use crate::relocator::relocation_symbol_value;
use crate::section::SectionId;
use crate::section::SectionKind;
use crate::symbol::Binding;
use crate::symbol::ResolveInfo;
use crate::symbol::ResolveInfoId;
use crate::symbol::Symbol;
use crate::symbol::SymbolDesc;
use crate::symbol::SymbolId;
use crate::symbol::SymbolType;
use anyhow::bail;
use hashbrown::HashMap;
use object::elf::*;
use rivet_utils::bits::fits_signed;
use rivet_utils::bits::fits_unsigned;
use rivet_utils::elf::shf;
use rivet_utils::elf::x86_64_rel_type_to_string;
use rivet_utils::elf::SectionFlags;
use std::borrow::Cow;

const GOT_ENTRY_SIZE: u64 = 8;
const PLT_ENTRY_SIZE: u64 = 16;

/// Reserved entries at the start of .got.plt (dynamic-section address and
/// two loader slots).
const GOT_PLT_HEADER_ENTRIES: u64 = 3;

pub(crate) struct X86_64 {
    relocator: X86_64Relocator,
}

impl X86_64 {
    pub(crate) fn new(output_kind: OutputKind) -> Self {
        Self {
            relocator: X86_64Relocator {
                output_kind,
                got: None,
                plt: None,
                got_plt: None,
                got_entries: HashMap::new(),
                got_order: Vec::new(),
                plt_entries: HashMap::new(),
                plt_order: Vec::new(),
                tls_entries: HashMap::new(),
                patches: Vec::new(),
            },
        }
    }
}

impl TargetBackend for X86_64 {
    fn bitclass(&self) -> u8 {
        64
    }

    fn is_little_endian(&self) -> bool {
        true
    }

    fn machine(&self) -> u16 {
        EM_X86_64
    }

    fn base_address(&self, output_kind: OutputKind) -> u64 {
        match output_kind {
            OutputKind::Executable | OutputKind::FlatBinary => 0x40_0000,
            OutputKind::SharedObject | OutputKind::Relocatable => 0,
        }
    }

    fn init_target_symbols(&mut self, module: &mut Module) -> Result {
        // _GLOBAL_OFFSET_TABLE_ is defined lazily once scan decides a GOT is
        // needed; here we only claim the name if some input referenced it,
        // forcing GOT creation.
        if module.pool.lookup(b"_GLOBAL_OFFSET_TABLE_").is_some() {
            self.relocator.ensure_got(module);
        }
        Ok(())
    }

    fn relocator(&self) -> &dyn Relocator {
        &self.relocator
    }

    fn relocator_mut(&mut self) -> &mut dyn Relocator {
        &mut self.relocator
    }

    fn finalize_tls_symbol(&self, module: &mut Module, symbol: SymbolId) {
        // On x86-64 the thread pointer sits at the end of the TLS block, so
        // a thread-local symbol's value is its (negative) offset from there.
        let Some(frag_ref) = module.symbol(symbol).frag_ref else {
            return;
        };
        let address = module.frag_ref_address(frag_ref);
        let Some(range) = layout::tls_range(module) else {
            return;
        };
        module.symbol_mut(symbol).value = address.wrapping_sub(range.end);
    }

    fn finalize_target_symbols(&mut self, module: &mut Module) -> Result {
        if let Some(got) = self.relocator.got {
            define_section_anchor(module, b"_GLOBAL_OFFSET_TABLE_", got);
        }
        if let Some(plt) = self.relocator.plt {
            define_section_anchor(module, b"_PROCEDURE_LINKAGE_TABLE_", plt);
        }
        Ok(())
    }
}

/// Defines (or re-points) a hidden absolute-ish symbol at the start of a
/// section.
fn define_section_anchor(module: &mut Module, name: &'static [u8], section: SectionId) {
    let addr = module.section(section).addr;
    if let Some(info_id) = module.pool.lookup(name) {
        let info = module.info(info_id);
        if let Some(symbol_id) = info.out_symbol {
            module.symbol_mut(symbol_id).value = addr;
            return;
        }
        let symbol_id = module.add_symbol(Symbol::new(info_id));
        module.symbol_mut(symbol_id).value = addr;
        let info = module.info_mut(info_id);
        info.desc = SymbolDesc::Define;
        info.binding = Binding::Absolute;
        info.out_symbol = Some(symbol_id);
        return;
    }
    let mut info = ResolveInfo::new(name);
    info.sym_type = SymbolType::Object;
    info.desc = SymbolDesc::Define;
    info.binding = Binding::Local;
    info.section = Some(section);
    let info_id = module.pool.alloc_unnamed(info);
    let symbol_id = module.add_symbol(Symbol::new(info_id));
    module.symbol_mut(symbol_id).value = addr;
    module.pool.info_mut(info_id).out_symbol = Some(symbol_id);
}

pub(crate) struct X86_64Relocator {
    output_kind: OutputKind,
    got: Option<SectionId>,
    plt: Option<SectionId>,
    got_plt: Option<SectionId>,

    got_entries: HashMap<ResolveInfoId, u64>,
    got_order: Vec<ResolveInfoId>,

    plt_entries: HashMap<ResolveInfoId, u64>,
    plt_order: Vec<ResolveInfoId>,

    /// GOT entries holding thread-pointer offsets rather than addresses.
    tls_entries: HashMap<ResolveInfoId, u64>,

    patches: Vec<Patch>,
}

impl X86_64Relocator {
    fn ensure_got(&mut self, module: &mut Module) -> SectionId {
        *self.got.get_or_insert_with(|| {
            module.get_or_create_output_section(
                b".got",
                SectionKind::Regular,
                SHT_PROGBITS,
                SectionFlags::empty().with(shf::ALLOC).with(shf::WRITE),
                alignment::GOT_ENTRY,
            )
        })
    }

    fn reserve_got(&mut self, module: &mut Module, sym: ResolveInfoId, is_tls: bool) {
        if self.got_entries.contains_key(&sym) {
            return;
        }
        let got = self.ensure_got(module);
        let index = self.got_order.len() as u64;
        module.append_fragment(
            got,
            FragmentKind::Fill {
                pattern: 0,
                size: GOT_ENTRY_SIZE,
                count: 1,
            },
            alignment::GOT_ENTRY,
        );
        self.got_entries.insert(sym, index);
        self.got_order.push(sym);
        if is_tls {
            self.tls_entries.insert(sym, index);
        }
    }

    fn reserve_plt(&mut self, module: &mut Module, sym: ResolveInfoId) -> Result {
        if self.plt_entries.contains_key(&sym) {
            return Ok(());
        }
        if self.output_kind == OutputKind::FlatBinary {
            bail!(LinkError::FailAllocatePlt(
                module.info(sym).name_for_display()
            ));
        }
        let plt = *self.plt.get_or_insert_with(|| {
            module.get_or_create_output_section(
                b".plt",
                SectionKind::Regular,
                SHT_PROGBITS,
                SectionFlags::empty().with(shf::ALLOC).with(shf::EXECINSTR),
                alignment::PLT,
            )
        });
        let got_plt = *self.got_plt.get_or_insert_with(|| {
            module.get_or_create_output_section(
                b".got.plt",
                SectionKind::Regular,
                SHT_PROGBITS,
                SectionFlags::empty().with(shf::ALLOC).with(shf::WRITE),
                alignment::GOT_ENTRY,
            )
        });
        if self.plt_order.is_empty() {
            // Loader header slots in .got.plt.
            module.append_fragment(
                got_plt,
                FragmentKind::Fill {
                    pattern: 0,
                    size: GOT_ENTRY_SIZE,
                    count: GOT_PLT_HEADER_ENTRIES,
                },
                alignment::GOT_ENTRY,
            );
        }
        let index = self.plt_order.len() as u64;
        module.append_fragment(
            plt,
            FragmentKind::Fill {
                pattern: 0,
                size: PLT_ENTRY_SIZE,
                count: 1,
            },
            alignment::PLT,
        );
        module.append_fragment(
            got_plt,
            FragmentKind::Fill {
                pattern: 0,
                size: GOT_ENTRY_SIZE,
                count: 1,
            },
            alignment::GOT_ENTRY,
        );
        self.plt_entries.insert(sym, index);
        self.plt_order.push(sym);
        Ok(())
    }

    fn got_address(&self, module: &Module, sym: ResolveInfoId) -> Option<u64> {
        let index = *self.got_entries.get(&sym)?;
        let got = self.got?;
        Some(module.section(got).addr + index * GOT_ENTRY_SIZE)
    }

    fn plt_address(&self, module: &Module, sym: ResolveInfoId) -> Option<u64> {
        let index = *self.plt_entries.get(&sym)?;
        let plt = self.plt?;
        Some(module.section(plt).addr + index * PLT_ENTRY_SIZE)
    }

    /// Whether references to this symbol must go through the PLT.
    fn needs_plt(&self, module: &Module, sym: ResolveInfoId) -> bool {
        let info = module.info(sym);
        info.from_shared && !info.is_undefined()
    }
}

impl Relocator for X86_64Relocator {
    fn scan(&mut self, module: &mut Module, reloc: &Relocation, _input: InputId) -> Result {
        match reloc.r_type {
            R_X86_64_NONE
            | R_X86_64_64
            | R_X86_64_32
            | R_X86_64_32S
            | R_X86_64_16
            | R_X86_64_8
            | R_X86_64_PC64
            | R_X86_64_PC32
            | R_X86_64_PC16
            | R_X86_64_PC8
            | R_X86_64_SIZE32
            | R_X86_64_SIZE64
            | R_X86_64_TPOFF32
            | R_X86_64_GOTPC32 => {}
            R_X86_64_PLT32 => {
                if self.needs_plt(module, reloc.sym) {
                    self.reserve_plt(module, reloc.sym)?;
                }
            }
            R_X86_64_GOT32
            | R_X86_64_GOTPCREL
            | R_X86_64_GOTPCRELX
            | R_X86_64_REX_GOTPCRELX => {
                self.reserve_got(module, reloc.sym, false);
            }
            R_X86_64_GOTTPOFF => {
                self.reserve_got(module, reloc.sym, true);
            }
            R_X86_64_TLSGD | R_X86_64_TLSLD | R_X86_64_DTPOFF32 | R_X86_64_DTPOFF64
            | R_X86_64_GOTPC32_TLSDESC | R_X86_64_TLSDESC_CALL => {
                // General-dynamic TLS needs loader cooperation we don't
                // model; compilers fall back to initial-exec with
                // -ftls-model=initial-exec.
                bail!(LinkError::UnsupportedReloc(
                    x86_64_rel_type_to_string(reloc.r_type).into_owned()
                ))
            }
            other => bail!(LinkError::UnknownReloc(format!(
                "{} in scan",
                x86_64_rel_type_to_string(other)
            ))),
        }
        // Referencing the GOT base also forces the GOT into existence.
        if matches!(reloc.r_type, R_X86_64_GOTPC32 | R_X86_64_GOT32) {
            self.ensure_got(module);
        }
        Ok(())
    }

    fn do_apply(&mut self, module: &mut Module, reloc: &mut Relocation) -> ApplyResult {
        let place = module.frag_ref_address(reloc.target_ref);
        let symbol_value = match relocation_symbol_value(module, reloc, self) {
            Ok(value) => value,
            Err(_) => return ApplyResult::BadReloc,
        };
        let addend = reloc.addend;
        let got_base = self
            .got
            .map(|got| module.section(got).addr)
            .unwrap_or_default();

        let value: u64 = match reloc.r_type {
            R_X86_64_NONE => return ApplyResult::Ok,
            R_X86_64_64 => symbol_value.wrapping_add(addend as u64),
            R_X86_64_32 => {
                let value = symbol_value.wrapping_add(addend as u64);
                if !fits_unsigned(value, 32) {
                    return ApplyResult::Overflow;
                }
                value
            }
            R_X86_64_32S => {
                let value = symbol_value.wrapping_add(addend as u64);
                if !fits_signed(value as i64, 32) {
                    return ApplyResult::Overflow;
                }
                value
            }
            R_X86_64_16 => {
                let value = symbol_value.wrapping_add(addend as u64);
                if !fits_unsigned(value, 16) {
                    return ApplyResult::Overflow;
                }
                value
            }
            R_X86_64_8 => {
                let value = symbol_value.wrapping_add(addend as u64);
                if !fits_unsigned(value, 8) {
                    return ApplyResult::Overflow;
                }
                value
            }
            R_X86_64_PC64 => symbol_value
                .wrapping_add(addend as u64)
                .wrapping_sub(place),
            R_X86_64_PC32 | R_X86_64_PLT32 => {
                let target = self
                    .plt_address(module, reloc.sym)
                    .unwrap_or(symbol_value);
                let value = target.wrapping_add(addend as u64).wrapping_sub(place);
                if !fits_signed(value as i64, 32) {
                    return ApplyResult::Overflow;
                }
                value
            }
            R_X86_64_PC16 => {
                let value = symbol_value
                    .wrapping_add(addend as u64)
                    .wrapping_sub(place);
                if !fits_signed(value as i64, 16) {
                    return ApplyResult::Overflow;
                }
                value
            }
            R_X86_64_PC8 => {
                let value = symbol_value
                    .wrapping_add(addend as u64)
                    .wrapping_sub(place);
                if !fits_signed(value as i64, 8) {
                    return ApplyResult::Overflow;
                }
                value
            }
            R_X86_64_GOTPCREL | R_X86_64_GOTPCRELX | R_X86_64_REX_GOTPCRELX
            | R_X86_64_GOTTPOFF => {
                let Some(entry) = self.got_address(module, reloc.sym) else {
                    return ApplyResult::BadReloc;
                };
                let value = entry.wrapping_add(addend as u64).wrapping_sub(place);
                if !fits_signed(value as i64, 32) {
                    return ApplyResult::Overflow;
                }
                value
            }
            R_X86_64_GOT32 => {
                let Some(entry) = self.got_address(module, reloc.sym) else {
                    return ApplyResult::BadReloc;
                };
                entry.wrapping_sub(got_base).wrapping_add(addend as u64)
            }
            R_X86_64_GOTPC32 => {
                let value = got_base.wrapping_add(addend as u64).wrapping_sub(place);
                if !fits_signed(value as i64, 32) {
                    return ApplyResult::Overflow;
                }
                value
            }
            R_X86_64_TPOFF32 => {
                // finalize_tls_symbol already folded the thread-pointer bias
                // into the symbol value.
                let value = symbol_value.wrapping_add(addend as u64);
                if !fits_signed(value as i64, 32) {
                    return ApplyResult::Overflow;
                }
                value
            }
            R_X86_64_SIZE32 => {
                let value = module.info(reloc.sym).size.wrapping_add(addend as u64);
                if !fits_unsigned(value, 32) {
                    return ApplyResult::Overflow;
                }
                value
            }
            R_X86_64_SIZE64 => module.info(reloc.sym).size.wrapping_add(addend as u64),
            R_X86_64_GLOB_DAT | R_X86_64_JUMP_SLOT | R_X86_64_RELATIVE | R_X86_64_COPY => {
                return ApplyResult::Unsupported;
            }
            _ => return ApplyResult::Unknown,
        };

        let bits = self.reloc_size_bits(reloc.r_type);
        let mask = if bits == 64 { u64::MAX } else { (1 << bits) - 1 };
        reloc.target_data = value & mask;
        ApplyResult::Ok
    }

    fn reloc_size_bits(&self, r_type: u32) -> u32 {
        match r_type {
            R_X86_64_64 | R_X86_64_PC64 | R_X86_64_SIZE64 => 64,
            R_X86_64_16 | R_X86_64_PC16 => 16,
            R_X86_64_8 | R_X86_64_PC8 => 8,
            _ => 32,
        }
    }

    fn reloc_name(&self, r_type: u32) -> Cow<'static, str> {
        x86_64_rel_type_to_string(r_type)
    }

    fn uses_rela(&self) -> bool {
        true
    }

    fn finalize_link(&mut self, module: &Module) -> Result {
        // Fill reserved GOT entries with their symbols' final values (or
        // thread-pointer offsets for the TLS entries).
        if let Some(got) = self.got {
            for (index, &sym) in self.got_order.iter().enumerate() {
                // For TLS entries the thread-pointer bias was already folded
                // into the symbol value, so both kinds store the finalised
                // value directly.
                let value = module.symbol_value(sym);
                self.patches.push(Patch {
                    section: got,
                    offset: index as u64 * GOT_ENTRY_SIZE,
                    value,
                    width: 8,
                });
            }
        }

        // PLT entries: `jmp *disp32(%rip)` through the matching .got.plt
        // slot, padded to 16 bytes. The slot itself gets the target's
        // resolved address (loader-free binding).
        if let (Some(plt), Some(got_plt)) = (self.plt, self.got_plt) {
            let plt_addr = module.section(plt).addr;
            let got_plt_addr = module.section(got_plt).addr;
            for (index, &sym) in self.plt_order.iter().enumerate() {
                let entry_addr = plt_addr + index as u64 * PLT_ENTRY_SIZE;
                let slot_addr =
                    got_plt_addr + (GOT_PLT_HEADER_ENTRIES + index as u64) * GOT_ENTRY_SIZE;
                let disp = slot_addr.wrapping_sub(entry_addr + 6);
                self.patches.push(Patch {
                    section: plt,
                    offset: index as u64 * PLT_ENTRY_SIZE,
                    value: 0x25ff,
                    width: 2,
                });
                self.patches.push(Patch {
                    section: plt,
                    offset: index as u64 * PLT_ENTRY_SIZE + 2,
                    value: disp & 0xffff_ffff,
                    width: 4,
                });
                self.patches.push(Patch {
                    section: got_plt,
                    offset: (GOT_PLT_HEADER_ENTRIES + index as u64) * GOT_ENTRY_SIZE,
                    value: module.symbol_value(sym),
                    width: 8,
                });
            }
        }
        Ok(())
    }

    fn take_patches(&mut self) -> Vec<Patch> {
        std::mem::take(&mut self.patches)
    }

    fn dyn_link_info(&self) -> DynLinkInfo {
        DynLinkInfo {
            plt_symbols: self.plt_order.clone(),
            plt: self.plt,
            got_plt: self.got_plt,
        }
    }
}

