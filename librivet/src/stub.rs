//! Long-branch stubs ("branch islands"). When a branch relocation cannot
//! reach its target, a veneer is emitted near the branch site and the
//! relocation is redirected to the veneer's synthesised symbol. Islands
//! group the stubs for a window of code so that N branches to the same
//! target share one stub.

use crate::error::Result;
use crate::fragment::FragmentId;
use crate::fragment::FragmentKind;
use crate::fragment::FragmentRef;
use crate::module::Module;
use crate::relocation::Relocation;
use crate::section::SectionId;
use crate::symbol::Binding;
use crate::symbol::ResolveInfo;
use crate::symbol::ResolveInfoId;
use crate::symbol::Symbol;
use crate::symbol::SymbolDesc;
use crate::symbol::SymbolId;
use crate::symbol::SymbolType;
use anyhow::anyhow;
use hashbrown::HashMap;

/// Index of a stub in the module's stub arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StubId(u32);

impl StubId {
    pub(crate) fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A relocation the stub needs against its own body, typically to plant the
/// target address in a literal slot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StubFixup {
    pub(crate) offset: u64,
    pub(crate) r_type: u32,
    pub(crate) addend: i64,
}

/// A registered stub shape. The factory asks each prototype in registration
/// order whether a relocation is its duty; the first to accept produces the
/// stub.
pub(crate) trait StubPrototype {
    fn name(&self) -> &'static str;

    fn template(&self) -> &'static [u8];

    fn fixups(&self) -> &'static [StubFixup];

    /// Whether this prototype must service `reloc`, given where the branch
    /// sits and where its target resolved to.
    fn is_my_duty(&self, reloc: &Relocation, source_addr: u64, target_value: u64) -> bool;
}

/// One materialised stub.
pub(crate) struct StubInstance {
    pub(crate) prototype: usize,
    pub(crate) symbol: SymbolId,
    pub(crate) frag: FragmentId,
    pub(crate) target: ResolveInfoId,

    /// The instruction bytes, copied into the output by the writer.
    pub(crate) template: &'static [u8],
}

/// A contiguous run of stubs appended after a bound point in code.
pub(crate) struct BranchIsland {
    pub(crate) section: SectionId,
    pub(crate) group: u64,
    pub(crate) name: String,

    /// The fragment after which the island's stubs are placed. Advanced as
    /// stubs are added so they stay contiguous.
    insert_after: FragmentId,

    /// Stubs already in this island, keyed so that branches to the same
    /// target through the same prototype share one stub.
    stubs: HashMap<(usize, ResolveInfoId), StubId>,

    /// Fixup relocations emitted by this island's stubs. Applied after the
    /// regular relocation sections.
    pub(crate) relocs: Vec<Relocation>,
}

pub(crate) struct BranchIslandFactory {
    /// Width of the code window served by one island. Must be comfortably
    /// inside the architecture's branch range so that any branch in the
    /// window reaches its island.
    group_size: u64,

    pub(crate) islands: Vec<BranchIsland>,
}

impl BranchIslandFactory {
    pub(crate) fn new(group_size: u64) -> Self {
        Self {
            group_size,
            islands: Vec::new(),
        }
    }

    /// Finds the island serving the code window around `site_frag`, creating
    /// it anchored at that fragment if the window has none yet.
    pub(crate) fn find_or_create(&mut self, module: &Module<'_>, site_frag: FragmentId) -> usize {
        let section = module.frag_section(site_frag);
        let group = module.frag(site_frag).offset / self.group_size;
        if let Some(index) = self
            .islands
            .iter()
            .position(|island| island.section == section && island.group == group)
        {
            return index;
        }
        let index = self.islands.len();
        self.islands.push(BranchIsland {
            section,
            group,
            name: format!("island{index}"),
            insert_after: site_frag,
            stubs: HashMap::new(),
            relocs: Vec::new(),
        });
        index
    }
}

pub(crate) struct StubFactory {
    prototypes: Vec<Box<dyn StubPrototype>>,
}

impl StubFactory {
    pub(crate) fn new() -> Self {
        Self {
            prototypes: Vec::new(),
        }
    }

    /// Registers a stub prototype.
    pub(crate) fn add_prototype(&mut self, prototype: Box<dyn StubPrototype>) {
        self.prototypes.push(prototype);
    }

    pub(crate) fn has_prototypes(&self) -> bool {
        !self.prototypes.is_empty()
    }

    /// Services one relocation: if a prototype accepts it, the relocation is
    /// redirected to a stub (shared if one already exists for this target in
    /// the island). Returns whether a new stub was created, which is what
    /// forces another relaxation iteration.
    pub(crate) fn create(
        &self,
        module: &mut Module<'_>,
        islands: &mut BranchIslandFactory,
        reloc_section: SectionId,
        reloc_index: usize,
        source_addr: u64,
        target_value: u64,
    ) -> Result<bool> {
        let reloc = module.reloc(reloc_section, reloc_index);
        let Some(proto_index) = self
            .prototypes
            .iter()
            .position(|p| p.is_my_duty(&reloc, source_addr, target_value))
        else {
            return Ok(false);
        };

        let island_index = islands.find_or_create(module, reloc.target_ref.frag);
        let island = &mut islands.islands[island_index];
        let key = (proto_index, reloc.sym);

        if let Some(&existing) = island.stubs.get(&key) {
            let stub_info = module.symbol(module.stubs[existing.as_usize()].symbol).info;
            module.reloc_mut(reloc_section, reloc_index).sym = stub_info;
            return Ok(false);
        }

        let prototype = &self.prototypes[proto_index];
        let template = prototype.template();

        // Clone the prototype into a fragment placed right after the
        // island's bound point.
        let stub_id = StubId::from_usize(module.stubs.len());
        let frag = module.alloc_fragment(
            island.section,
            0,
            FragmentKind::Stub {
                id: stub_id,
                size: template.len() as u64,
            },
        );
        insert_after(module, island.section, island.insert_after, frag)?;
        island.insert_after = frag;

        // The synthesised local symbol the branch is redirected to.
        let target_info = reloc.sym;
        let name = format!(
            "__{}_{}@{}",
            String::from_utf8_lossy(&module.info(target_info).name),
            prototype.name(),
            island.name,
        );
        let mut info = ResolveInfo::new(name.into_bytes());
        info.sym_type = SymbolType::Function;
        info.desc = SymbolDesc::Define;
        info.binding = Binding::Local;
        info.size = template.len() as u64;
        info.section = Some(island.section);
        let info_id = module.pool.alloc_unnamed(info);
        let symbol_id = module.add_symbol(Symbol::with_frag_ref(
            info_id,
            FragmentRef::new(frag, 0),
        ));
        module.pool.info_mut(info_id).out_symbol = Some(symbol_id);

        // The stub's own fixups branch/point to the original target.
        for fixup in prototype.fixups() {
            island.relocs.push(Relocation {
                r_type: fixup.r_type,
                target_ref: FragmentRef::new(frag, fixup.offset),
                sym: target_info,
                addend: fixup.addend,
                target_data: 0,
            });
        }

        module.stubs.push(StubInstance {
            prototype: proto_index,
            symbol: symbol_id,
            frag,
            target: target_info,
            template,
        });
        island.stubs.insert(key, stub_id);

        // Redirect the branch to the stub.
        module.reloc_mut(reloc_section, reloc_index).sym = info_id;
        Ok(true)
    }

    pub(crate) fn template_bytes(&self, prototype: usize) -> &'static [u8] {
        self.prototypes[prototype].template()
    }
}

fn insert_after(
    module: &mut Module<'_>,
    section: SectionId,
    after: FragmentId,
    frag: FragmentId,
) -> Result {
    let data = module.section_mut(section).data_mut();
    let position = data
        .frags
        .iter()
        .position(|&f| f == after)
        .ok_or_else(|| anyhow!("Island anchor is not in its section"))?;
    data.frags.insert(position + 1, frag);
    Ok(())
}
