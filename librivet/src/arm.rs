//! The 32-bit ARM backend: REL relocations with in-place addends, a small
//! GOT, and long-branch veneers. ARM B/BL immediates reach ±32 MiB, so
//! branches to farther targets are routed through an absolute-load veneer
//! placed in a branch island near the call site.

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
use crate::relocator::Patch;
use crate::relocator::Relocator;
use crate::relocator::relocation_symbol_value;
use crate::section::SectionId;
use crate::section::SectionKind;
use crate::stub::BranchIslandFactory;
use crate::stub::StubFactory;
use crate::stub::StubFixup;
use crate::stub::StubPrototype;
use crate::symbol::ResolveInfoId;
use crate::symbol::SymbolId;
use anyhow::bail;
use hashbrown::HashMap;
use object::elf::*;
use rivet_utils::arm::branch_in_range;
use rivet_utils::arm::decode_branch_offset;
use rivet_utils::arm::encode_branch_offset;
use rivet_utils::bits::fits_signed;
use rivet_utils::bits::fits_unsigned;
use rivet_utils::bits::sign_extend;
use rivet_utils::elf::arm_rel_type_to_string;
use rivet_utils::elf::shf;
use rivet_utils::elf::SectionFlags;
use std::borrow::Cow;

const GOT_ENTRY_SIZE: u64 = 4;

/// Width of the code window one branch island serves. Kept well under the
/// 32 MiB branch range so that every branch in the window reaches its
/// island.
const ISLAND_GROUP_SIZE: u64 = 0x00e0_0000;

/// `ldr pc, [pc, #-4]` followed by the target address literal.
const ABS_VENEER: &[u8] = &[0x04, 0xf0, 0x1f, 0xe5, 0x00, 0x00, 0x00, 0x00];

const ABS_VENEER_FIXUPS: &[StubFixup] = &[StubFixup {
    offset: 4,
    r_type: R_ARM_ABS32,
    addend: 0,
}];

struct AbsoluteVeneer;

impl StubPrototype for AbsoluteVeneer {
    fn name(&self) -> &'static str {
        "veneer_abs"
    }

    fn template(&self) -> &'static [u8] {
        ABS_VENEER
    }

    fn fixups(&self) -> &'static [StubFixup] {
        ABS_VENEER_FIXUPS
    }

    fn is_my_duty(&self, reloc: &Relocation, source_addr: u64, target_value: u64) -> bool {
        is_branch(reloc.r_type) && !branch_in_range(source_addr, target_value)
    }
}

fn is_branch(r_type: u32) -> bool {
    matches!(
        r_type,
        R_ARM_PC24 | R_ARM_CALL | R_ARM_JUMP24 | R_ARM_PLT32
    )
}

pub(crate) struct Arm {
    relocator: ArmRelocator,
    stub_factory: StubFactory,
    islands: BranchIslandFactory,
}

impl Arm {
    pub(crate) fn new(_output_kind: OutputKind) -> Self {
        Self {
            relocator: ArmRelocator {
                got: None,
                got_entries: HashMap::new(),
                got_order: Vec::new(),
                patches: Vec::new(),
            },
            stub_factory: StubFactory::new(),
            islands: BranchIslandFactory::new(ISLAND_GROUP_SIZE),
        }
    }
}

impl TargetBackend for Arm {
    fn bitclass(&self) -> u8 {
        32
    }

    fn is_little_endian(&self) -> bool {
        true
    }

    fn machine(&self) -> u16 {
        EM_ARM
    }

    fn flags(&self) -> u32 {
        // EABI version 5.
        0x0500_0000
    }

    fn base_address(&self, output_kind: OutputKind) -> u64 {
        match output_kind {
            OutputKind::Executable | OutputKind::FlatBinary => 0x1_0000,
            OutputKind::SharedObject | OutputKind::Relocatable => 0,
        }
    }

    fn init_target_stubs(&mut self) {
        self.stub_factory.add_prototype(Box::new(AbsoluteVeneer));
    }

    fn relocator(&self) -> &dyn Relocator {
        &self.relocator
    }

    fn relocator_mut(&mut self) -> &mut dyn Relocator {
        &mut self.relocator
    }

    fn finalize_tls_symbol(&self, module: &mut Module, symbol: SymbolId) {
        // ARM's thread pointer points at the TCB; the TLS block begins 8
        // bytes after it.
        let Some(frag_ref) = module.symbol(symbol).frag_ref else {
            return;
        };
        let address = module.frag_ref_address(frag_ref);
        let Some(range) = layout::tls_range(module) else {
            return;
        };
        module.symbol_mut(symbol).value = address.wrapping_sub(range.start).wrapping_add(8);
    }

    fn wants_relaxation(&self) -> bool {
        self.stub_factory.has_prototypes()
    }

    fn do_relax(&mut self, module: &mut Module, finished: &mut bool) -> Result {
        let mut work = Vec::new();
        for (input_index, input) in module.inputs.iter().enumerate() {
            for &reloc_section in &input.reloc_sections {
                let Some(reloc_data) = module.section(reloc_section).reloc_data() else {
                    continue;
                };
                for index in 0..reloc_data.relocs.len() {
                    if is_branch(reloc_data.relocs[index].r_type) {
                        work.push((input_index, reloc_section, index));
                    }
                }
            }
        }

        for (_input, reloc_section, index) in work {
            let reloc = module.reloc(reloc_section, index);
            let source_addr = module.frag_ref_address(reloc.target_ref);
            let Some(target_value) = estimate_symbol_address(module, reloc.sym) else {
                continue;
            };
            let created = self.stub_factory.create(
                module,
                &mut self.islands,
                reloc_section,
                index,
                source_addr,
                target_value,
            )?;
            if created {
                *finished = false;
            }
        }
        Ok(())
    }

    fn finalize_stubs(&mut self, module: &mut Module) -> Result {
        for island in &mut self.islands.islands {
            module.stub_relocs.append(&mut island.relocs);
        }
        Ok(())
    }
}

/// Where a symbol is expected to land, using current (pre-final) layout
/// state. Symbols with no definition site (undefined, shared, absolute)
/// yield `None` and never get stubs.
fn estimate_symbol_address(module: &Module, sym: ResolveInfoId) -> Option<u64> {
    let info = module.info(sym);
    let symbol = module.symbol(info.out_symbol?);
    let frag_ref = symbol.frag_ref?;
    Some(module.frag_ref_address(frag_ref))
}

pub(crate) struct ArmRelocator {
    got: Option<SectionId>,
    got_entries: HashMap<ResolveInfoId, u64>,
    got_order: Vec<ResolveInfoId>,
    patches: Vec<Patch>,
}

impl ArmRelocator {
    fn reserve_got(&mut self, module: &mut Module, sym: ResolveInfoId) {
        if self.got_entries.contains_key(&sym) {
            return;
        }
        let got = *self.got.get_or_insert_with(|| {
            module.get_or_create_output_section(
                b".got",
                SectionKind::Regular,
                SHT_PROGBITS,
                SectionFlags::empty().with(shf::ALLOC).with(shf::WRITE),
                alignment::Alignment { exponent: 2 },
            )
        });
        let index = self.got_order.len() as u64;
        module.append_fragment(
            got,
            FragmentKind::Fill {
                pattern: 0,
                size: GOT_ENTRY_SIZE,
                count: 1,
            },
            alignment::Alignment { exponent: 2 },
        );
        self.got_entries.insert(sym, index);
        self.got_order.push(sym);
    }

    fn got_offset(&self, sym: ResolveInfoId) -> Option<u64> {
        self.got_entries.get(&sym).map(|&i| i * GOT_ENTRY_SIZE)
    }
}

/// Decodes the in-place addend stored at a REL relocation site.
fn decode_addend(r_type: u32, word: u64) -> i64 {
    let word32 = word as u32;
    match r_type {
        R_ARM_PC24 | R_ARM_CALL | R_ARM_JUMP24 | R_ARM_PLT32 => {
            decode_branch_offset(word32)
        }
        R_ARM_MOVW_ABS_NC | R_ARM_MOVT_ABS => {
            let imm16 = ((word32 >> 4) & 0xf000) | (word32 & 0x0fff);
            sign_extend(u64::from(imm16), 16)
        }
        R_ARM_PREL31 => sign_extend(u64::from(word32 & 0x7fff_ffff), 31),
        R_ARM_ABS16 => sign_extend(u64::from(word32 & 0xffff), 16),
        R_ARM_ABS8 => sign_extend(u64::from(word32 & 0xff), 8),
        _ => i64::from(word32 as i32),
    }
}

fn encode_movw_imm(word: u32, value: u32) -> u32 {
    let imm16 = value & 0xffff;
    (word & 0xfff0_f000) | ((imm16 & 0xf000) << 4) | (imm16 & 0x0fff)
}

impl Relocator for ArmRelocator {
    fn scan(&mut self, module: &mut Module, reloc: &Relocation, _input: InputId) -> Result {
        match reloc.r_type {
            R_ARM_NONE
            | R_ARM_ABS32
            | R_ARM_REL32
            | R_ARM_ABS16
            | R_ARM_ABS8
            | R_ARM_PC24
            | R_ARM_CALL
            | R_ARM_JUMP24
            | R_ARM_PLT32
            | R_ARM_PREL31
            | R_ARM_MOVW_ABS_NC
            | R_ARM_MOVT_ABS
            | R_ARM_V4BX => {}
            R_ARM_GOT32 => self.reserve_got(module, reloc.sym),
            other => bail!(LinkError::UnknownReloc(format!(
                "{} in scan",
                arm_rel_type_to_string(other)
            ))),
        }
        Ok(())
    }

    fn do_apply(&mut self, module: &mut Module, reloc: &mut Relocation) -> ApplyResult {
        let place = module.frag_ref_address(reloc.target_ref);
        let symbol_value = match relocation_symbol_value(module, reloc, self) {
            Ok(value) => value,
            Err(_) => return ApplyResult::BadReloc,
        };
        let addend = decode_addend(reloc.r_type, reloc.target_data);
        let word = reloc.target_data as u32;

        let result: u64 = match reloc.r_type {
            R_ARM_NONE | R_ARM_V4BX => return ApplyResult::Ok,
            R_ARM_ABS32 => symbol_value.wrapping_add(addend as u64) & 0xffff_ffff,
            R_ARM_REL32 => {
                symbol_value
                    .wrapping_add(addend as u64)
                    .wrapping_sub(place)
                    & 0xffff_ffff
            }
            R_ARM_ABS16 => {
                let value = symbol_value.wrapping_add(addend as u64);
                if !fits_unsigned(value, 16) {
                    return ApplyResult::Overflow;
                }
                value
            }
            R_ARM_ABS8 => {
                let value = symbol_value.wrapping_add(addend as u64);
                if !fits_unsigned(value, 8) {
                    return ApplyResult::Overflow;
                }
                value
            }
            R_ARM_PC24 | R_ARM_CALL | R_ARM_JUMP24 | R_ARM_PLT32 => {
                let displacement = symbol_value
                    .wrapping_add(addend as u64)
                    .wrapping_sub(place) as i64;
                if !fits_signed(displacement, 26) {
                    return ApplyResult::Overflow;
                }
                match encode_branch_offset(word, displacement) {
                    Some(encoded) => u64::from(encoded),
                    None => return ApplyResult::BadReloc,
                }
            }
            R_ARM_PREL31 => {
                let value = symbol_value
                    .wrapping_add(addend as u64)
                    .wrapping_sub(place) as i64;
                if !fits_signed(value, 31) {
                    return ApplyResult::Overflow;
                }
                u64::from((value as u32 & 0x7fff_ffff) | (word & 0x8000_0000))
            }
            R_ARM_MOVW_ABS_NC => {
                let value = symbol_value.wrapping_add(addend as u64) as u32;
                u64::from(encode_movw_imm(word, value & 0xffff))
            }
            R_ARM_MOVT_ABS => {
                let value = symbol_value.wrapping_add(addend as u64) as u32;
                u64::from(encode_movw_imm(word, value >> 16))
            }
            R_ARM_GOT32 => {
                let Some(offset) = self.got_offset(reloc.sym) else {
                    return ApplyResult::BadReloc;
                };
                offset.wrapping_add(addend as u64) & 0xffff_ffff
            }
            _ => return ApplyResult::Unknown,
        };

        reloc.target_data = result;
        ApplyResult::Ok
    }

    fn reloc_size_bits(&self, r_type: u32) -> u32 {
        match r_type {
            R_ARM_ABS16 => 16,
            R_ARM_ABS8 => 8,
            _ => 32,
        }
    }

    fn reloc_name(&self, r_type: u32) -> Cow<'static, str> {
        arm_rel_type_to_string(r_type)
    }

    fn uses_rela(&self) -> bool {
        false
    }

    fn finalize_link(&mut self, module: &Module) -> Result {
        if let Some(got) = self.got {
            for (index, &sym) in self.got_order.iter().enumerate() {
                self.patches.push(Patch {
                    section: got,
                    offset: index as u64 * GOT_ENTRY_SIZE,
                    value: module.symbol_value(sym),
                    width: 4,
                });
            }
        }
        Ok(())
    }

    fn take_patches(&mut self) -> Vec<Patch> {
        std::mem::take(&mut self.patches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::Alignment;
    use crate::fragment::FragmentRef;
    use crate::module::Input;
    use crate::module::InputKind;
    use crate::section::Section;
    use crate::symbol::ResolveInfo;
    use crate::symbol::Symbol;
    use crate::symbol::SymbolDesc;
    use crate::symbol::SymbolType;

    #[test]
    fn test_decode_branch_addend() {
        // `bl` with imm24 = -2 encodes the usual -8 pipeline adjustment.
        assert_eq!(decode_addend(R_ARM_CALL, 0xebff_fffe), -8);
    }

    #[test]
    fn test_movw_round_trip() {
        let insn = encode_movw_imm(0xe300_0000, 0xabcd);
        assert_eq!(insn, 0xe30a_0bcd);
        assert_eq!(
            decode_addend(R_ARM_MOVW_ABS_NC, u64::from(insn)),
            sign_extend(0xabcd, 16)
        );
    }

    #[test]
    fn test_veneer_accepts_only_far_branches() {
        let veneer = AbsoluteVeneer;
        let reloc = Relocation {
            r_type: R_ARM_CALL,
            target_ref: crate::fragment::FragmentRef::new(
                crate::fragment::FragmentId::from_usize(0),
                0,
            ),
            sym: ResolveInfoId::from_usize(0),
            addend: 0,
            target_data: 0,
        };
        assert!(!veneer.is_my_duty(&reloc, 0x8000, 0x9000));
        assert!(veneer.is_my_duty(&reloc, 0x8000, 0x8000 + 40 * 1024 * 1024));
        let abs32 = Relocation {
            r_type: R_ARM_ABS32,
            ..reloc
        };
        assert!(!veneer.is_my_duty(&abs32, 0x8000, 0x8000 + 40 * 1024 * 1024));
    }

    /// Two calls 40 MiB away from their target: one shared veneer appears
    /// next to the callers, both branches are redirected to it, and the
    /// relax loop settles within three iterations.
    #[test]
    fn test_far_branches_share_a_veneer() {
        const BL: &[u8] = &[0xfe, 0xff, 0xff, 0xeb];
        const BX_LR: &[u8] = &[0x1e, 0xff, 0x2f, 0xe1];

        let mut module = Module::new();
        let text = module.get_or_create_output_section(
            b".text",
            SectionKind::Regular,
            SHT_PROGBITS,
            SectionFlags::empty().with(shf::ALLOC).with(shf::EXECINSTR),
            Alignment::new(4).unwrap(),
        );
        let word = Alignment::new(4).unwrap();
        let caller_a = module.append_fragment(text, crate::fragment::FragmentKind::Region(BL), word);
        let caller_b = module.append_fragment(text, crate::fragment::FragmentKind::Region(BL), word);
        module.append_fragment(
            text,
            crate::fragment::FragmentKind::Fill {
                pattern: 0,
                size: 40 * 1024 * 1024,
                count: 1,
            },
            word,
        );
        let callee = module.append_fragment(text, crate::fragment::FragmentKind::Region(BX_LR), word);

        let mut info = ResolveInfo::new(b"far_func".as_slice());
        info.sym_type = SymbolType::Function;
        info.desc = SymbolDesc::Define;
        let info_id = module.pool.alloc_unnamed(info);
        let symbol = module.add_symbol(Symbol::with_frag_ref(
            info_id,
            FragmentRef::new(callee.frag, 0),
        ));
        module.pool.info_mut(info_id).out_symbol = Some(symbol);

        let reloc_section = module.add_section(Section::new(
            b".rel.text",
            SectionKind::Relocation,
            SHT_REL,
            SectionFlags::empty(),
            crate::alignment::MIN,
        ));
        let make_reloc = |site| Relocation {
            r_type: R_ARM_CALL,
            target_ref: FragmentRef::new(site, 0),
            sym: info_id,
            addend: 0,
            target_data: 0xebff_fffe,
        };
        module.section_mut(reloc_section).reloc_data_mut().relocs =
            vec![make_reloc(caller_a.frag), make_reloc(caller_b.frag)];
        module.inputs.push(Input {
            name: "far.o".to_owned(),
            kind: InputKind::Object,
            data: b"",
            sections: Vec::new(),
            reloc_sections: vec![reloc_section],
            symbols: Vec::new(),
        });

        let mut backend = Arm::new(OutputKind::Executable);
        backend.init_target_stubs();
        let mut iterations = 0;
        loop {
            crate::layout::compute(&mut module, &backend, OutputKind::Executable).unwrap();
            let mut finished = true;
            backend.do_relax(&mut module, &mut finished).unwrap();
            iterations += 1;
            if finished {
                break;
            }
            assert!(iterations <= 3, "relaxation did not settle in 3 iterations");
        }

        assert_eq!(module.stubs.len(), 1);
        let stub_info = module.symbol(module.stubs[0].symbol).info;
        assert_eq!(module.reloc(reloc_section, 0).sym, stub_info);
        assert_eq!(module.reloc(reloc_section, 1).sym, stub_info);

        // The veneer sits just after the first caller, well within reach.
        crate::layout::compute(&mut module, &backend, OutputKind::Executable).unwrap();
        let stub_offset = module.frag(module.stubs[0].frag).offset;
        assert!(stub_offset < 1024, "veneer should be near its callers");

        backend.finalize_stubs(&mut module).unwrap();
        assert_eq!(module.stub_relocs.len(), 1);
        assert_eq!(module.stub_relocs[0].r_type, R_ARM_ABS32);
        assert_eq!(module.stub_relocs[0].sym, info_id);
    }
}
