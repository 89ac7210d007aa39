//! The root of the link: one `Module` owns the inputs in link order, the
//! arenas for sections, fragments and symbols, the output symbol pool, the
//! output section list and the script state. The driver threads it through
//! every phase.

use crate::alignment::Alignment;
use crate::fragment::Fragment;
use crate::fragment::FragmentId;
use crate::fragment::FragmentKind;
use crate::fragment::FragmentRef;
use crate::merge_string::MergeString;
use crate::merge_string::MergeStringId;
use crate::relocation::Relocation;
use crate::section::Section;
use crate::section::SectionId;
use crate::section::SectionKind;
use crate::section::SectionMap;
use crate::stub::StubInstance;
use crate::symbol::Binding;
use crate::symbol::ResolveInfo;
use crate::symbol::ResolveInfoId;
use crate::symbol::Symbol;
use crate::symbol::SymbolDesc;
use crate::symbol::SymbolId;
use crate::symbol::SymbolType;
use crate::symbol_pool::SymbolPool;
use hashbrown::HashMap;

/// Index of an input in the module's input list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct InputId(u32);

impl InputId {
    pub(crate) fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputKind {
    Object,
    SharedObject,
}

/// One object or shared object participating in the link. Archive members
/// become `Input`s when they're pulled.
pub(crate) struct Input<'data> {
    pub(crate) name: String,
    pub(crate) kind: InputKind,
    pub(crate) data: &'data [u8],
    pub(crate) sections: Vec<SectionId>,
    pub(crate) reloc_sections: Vec<SectionId>,

    /// Module symbol per input symbol-table index.
    pub(crate) symbols: Vec<SymbolId>,
}

pub(crate) struct Module<'data> {
    pub(crate) inputs: Vec<Input<'data>>,
    pub(crate) sections: Vec<Section<'data>>,
    pub(crate) fragments: Vec<Fragment<'data>>,
    pub(crate) symbols: Vec<Symbol>,
    pub(crate) pool: SymbolPool<'data>,
    pub(crate) merge_strings: Vec<MergeString<'data>>,

    /// Output sections in creation order. Layout orders them for emission.
    pub(crate) output_sections: Vec<SectionId>,

    /// One synthetic symbol per output section, created at prelayout.
    pub(crate) section_symbols: HashMap<SectionId, SymbolId>,

    pub(crate) stubs: Vec<StubInstance>,

    /// Fixup relocations emitted by stub insertion, applied after the
    /// regular relocation sections.
    pub(crate) stub_relocs: Vec<Relocation>,

    pub(crate) section_map: SectionMap,

    /// DT_NEEDED names, in link order.
    pub(crate) needed: Vec<Vec<u8>>,

    pub(crate) soname: Option<String>,
}

pub(crate) struct AppendedFragment {
    pub(crate) frag: FragmentId,
    pub(crate) bytes_added: u64,
}

impl<'data> Module<'data> {
    pub(crate) fn new() -> Self {
        let mut module = Self {
            inputs: Vec::new(),
            sections: Vec::new(),
            fragments: Vec::new(),
            symbols: Vec::new(),
            pool: SymbolPool::default(),
            merge_strings: Vec::new(),
            output_sections: Vec::new(),
            section_symbols: HashMap::new(),
            stubs: Vec::new(),
            stub_relocs: Vec::new(),
            section_map: SectionMap::with_std_elf_map(),
            needed: Vec::new(),
            soname: None,
        };
        // Section 0 is the null section, as in the ELF section header table.
        module.add_section(Section::new(
            b"",
            SectionKind::Null,
            object::elf::SHT_NULL,
            rivet_utils::elf::SectionFlags::empty(),
            crate::alignment::MIN,
        ));
        module
    }

    pub(crate) fn input(&self, id: InputId) -> &Input<'data> {
        &self.inputs[id.as_usize()]
    }

    pub(crate) fn section(&self, id: SectionId) -> &Section<'data> {
        &self.sections[id.as_usize()]
    }

    pub(crate) fn section_mut(&mut self, id: SectionId) -> &mut Section<'data> {
        &mut self.sections[id.as_usize()]
    }

    pub(crate) fn frag(&self, id: FragmentId) -> &Fragment<'data> {
        &self.fragments[id.as_usize()]
    }

    pub(crate) fn frag_mut(&mut self, id: FragmentId) -> &mut Fragment<'data> {
        &mut self.fragments[id.as_usize()]
    }

    pub(crate) fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.as_usize()]
    }

    pub(crate) fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.as_usize()]
    }

    pub(crate) fn info(&self, id: ResolveInfoId) -> &ResolveInfo<'data> {
        self.pool.info(id)
    }

    pub(crate) fn info_mut(&mut self, id: ResolveInfoId) -> &mut ResolveInfo<'data> {
        self.pool.info_mut(id)
    }

    pub(crate) fn merge_string(&self, id: MergeStringId) -> &MergeString<'data> {
        &self.merge_strings[id.as_usize()]
    }

    pub(crate) fn merge_string_mut(&mut self, id: MergeStringId) -> &mut MergeString<'data> {
        &mut self.merge_strings[id.as_usize()]
    }

    pub(crate) fn add_input(&mut self, input: Input<'data>) -> InputId {
        let id = InputId::from_usize(self.inputs.len());
        self.inputs.push(input);
        id
    }

    pub(crate) fn add_section(&mut self, section: Section<'data>) -> SectionId {
        let id = SectionId::from_usize(self.sections.len());
        self.sections.push(section);
        id
    }

    pub(crate) fn add_symbol(&mut self, symbol: Symbol) -> SymbolId {
        let id = SymbolId::from_usize(self.symbols.len());
        self.symbols.push(symbol);
        id
    }

    /// Allocates a fragment in the arena without attaching it to its parent's
    /// fragment list. The caller decides where it goes.
    pub(crate) fn alloc_fragment(
        &mut self,
        parent: SectionId,
        offset: u64,
        kind: FragmentKind<'data>,
    ) -> FragmentId {
        let id = FragmentId::from_usize(self.fragments.len());
        self.fragments.push(Fragment {
            parent,
            offset,
            kind,
        });
        id
    }

    /// Appends a fragment to a section's data, inserting an alignment
    /// fragment first when `align` requires one. The alignment fragment
    /// carries a constraint; its recorded padding here is provisional and is
    /// recomputed when offsets are assigned. Returns the total bytes added.
    pub(crate) fn append_fragment(
        &mut self,
        section_id: SectionId,
        kind: FragmentKind<'data>,
        align: Alignment,
    ) -> AppendedFragment {
        let current_size = self.section(section_id).size;
        let mut padding = 0;
        if align.value() > 1 {
            padding = align.align_up(current_size) - current_size;
            if padding > 0 {
                let align_frag = self.alloc_fragment(
                    section_id,
                    current_size,
                    FragmentKind::Align {
                        boundary: align,
                        max_bytes: align.value(),
                        fill: 0,
                        padding,
                    },
                );
                self.section_mut(section_id).data_mut().push(align_frag);
            }
        }
        let offset = current_size + padding;
        let frag = self.alloc_fragment(section_id, offset, kind);
        let frag_size = self.frag(frag).size();
        self.section_mut(section_id).data_mut().push(frag);
        let section = self.section_mut(section_id);
        section.size = offset + frag_size;
        if section.alignment < align {
            section.alignment = align;
        }
        AppendedFragment {
            frag,
            bytes_added: padding + frag_size,
        }
    }

    /// The offset of a `FragmentRef` within its section.
    pub(crate) fn frag_ref_offset(&self, frag_ref: FragmentRef) -> u64 {
        let frag = self.frag(frag_ref.frag);
        frag.offset + frag_ref.offset
    }

    pub(crate) fn frag_section(&self, frag: FragmentId) -> SectionId {
        self.frag(frag).parent
    }

    /// The virtual address a `FragmentRef` ends up at.
    pub(crate) fn frag_ref_address(&self, frag_ref: FragmentRef) -> u64 {
        let section = self.section(self.frag_section(frag_ref.frag));
        section.addr + self.frag_ref_offset(frag_ref)
    }

    pub(crate) fn output_section_by_name(&self, name: &[u8]) -> Option<SectionId> {
        self.output_sections
            .iter()
            .copied()
            .find(|&id| self.section(id).name == name)
    }

    pub(crate) fn get_or_create_output_section(
        &mut self,
        name: &'data [u8],
        kind: SectionKind,
        sh_type: u32,
        flags: rivet_utils::elf::SectionFlags,
        alignment: Alignment,
    ) -> SectionId {
        if let Some(existing) = self.output_section_by_name(name) {
            return existing;
        }
        let id = self.add_section(Section::new(name, kind, sh_type, flags, alignment));
        self.output_sections.push(id);
        id
    }

    /// Creates the synthetic section symbol for an output section. The
    /// symbol's value is the section address and its offset is zero.
    pub(crate) fn add_section_symbol(&mut self, section_id: SectionId) -> SymbolId {
        if let Some(&existing) = self.section_symbols.get(&section_id) {
            return existing;
        }
        let mut info = ResolveInfo::new(self.section(section_id).name.to_vec());
        info.sym_type = SymbolType::Section;
        info.desc = SymbolDesc::Define;
        info.binding = Binding::Local;
        info.section = Some(section_id);
        let info_id = self.pool.alloc_unnamed(info);
        let frag_ref = self
            .section(section_id)
            .data()
            .and_then(|d| d.frags.first())
            .map(|&frag| FragmentRef::new(frag, 0));
        let mut symbol = Symbol::new(info_id);
        symbol.frag_ref = frag_ref;
        let symbol_id = self.add_symbol(symbol);
        self.pool.info_mut(info_id).out_symbol = Some(symbol_id);
        self.section_symbols.insert(section_id, symbol_id);
        symbol_id
    }

    pub(crate) fn section_symbol(&self, section_id: SectionId) -> Option<SymbolId> {
        self.section_symbols.get(&section_id).copied()
    }

    pub(crate) fn reloc(&self, section: SectionId, index: usize) -> Relocation {
        self.section(section)
            .reloc_data()
            .expect("relocation section has reloc data")
            .relocs[index]
    }

    pub(crate) fn reloc_mut(&mut self, section: SectionId, index: usize) -> &mut Relocation {
        &mut self.section_mut(section).reloc_data_mut().relocs[index]
    }

    /// The value of a resolved symbol, once values have been finalised.
    /// Undefined and shared-object symbols resolve to zero.
    pub(crate) fn symbol_value(&self, info_id: ResolveInfoId) -> u64 {
        self.info(info_id)
            .out_symbol
            .map(|id| self.symbol(id).value)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment;
    use rivet_utils::elf::shf;
    use rivet_utils::elf::SectionFlags;

    #[test]
    fn test_append_fragment_inserts_alignment() {
        let mut module = Module::new();
        let section = module.get_or_create_output_section(
            b".data",
            SectionKind::Regular,
            object::elf::SHT_PROGBITS,
            SectionFlags::empty().with(shf::ALLOC),
            alignment::MIN,
        );
        module.append_fragment(
            section,
            FragmentKind::Fill {
                pattern: 0,
                size: 3,
                count: 1,
            },
            alignment::MIN,
        );
        let appended = module.append_fragment(
            section,
            FragmentKind::Fill {
                pattern: 0,
                size: 8,
                count: 1,
            },
            Alignment::new(8).unwrap(),
        );
        // 5 bytes of padding then 8 bytes of content.
        assert_eq!(appended.bytes_added, 13);
        assert_eq!(module.section(section).size, 16);
        assert_eq!(module.frag(appended.frag).offset, 8);
        assert_eq!(module.section(section).alignment, Alignment::new(8).unwrap());
    }

    #[test]
    fn test_section_symbol_created_once() {
        let mut module = Module::new();
        let section = module.get_or_create_output_section(
            b".text",
            SectionKind::Regular,
            object::elf::SHT_PROGBITS,
            SectionFlags::empty().with(shf::ALLOC).with(shf::EXECINSTR),
            alignment::MIN,
        );
        let a = module.add_section_symbol(section);
        let b = module.add_section_symbol(section);
        assert_eq!(a, b);
        let info = module.info(module.symbol(a).info);
        assert_eq!(info.sym_type, SymbolType::Section);
        assert_eq!(info.binding, Binding::Local);
    }
}
