//! Sections and the input-name → output-name mapping table.

use crate::alignment::Alignment;
use crate::error::LinkError;
use crate::error::Result;
use crate::fragment::SectionData;
use crate::merge_string::MergeStringId;
use crate::relocation::RelocData;
use anyhow::bail;
use rivet_utils::elf::SectionFlags;
use std::borrow::Cow;

/// Index of a section in the module's section arena. Input sections and
/// output sections share the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct SectionId(u32);

impl SectionId {
    pub(crate) fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SectionKind {
    Null,
    Regular,
    Bss,
    EhFrame,
    NamePool,
    Relocation,
    /// Architecture-specific content, merged by the backend.
    Target,
    Group,
    StackNote,
    Ignore,
}

impl SectionKind {
    /// Section kinds that never participate in section merging.
    pub(crate) fn skipped_when_merging(self) -> bool {
        matches!(
            self,
            SectionKind::Ignore
                | SectionKind::Null
                | SectionKind::NamePool
                | SectionKind::Group
                | SectionKind::StackNote
                | SectionKind::Relocation
        )
    }
}

#[derive(Debug)]
pub(crate) struct Section<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) kind: SectionKind,
    pub(crate) sh_type: u32,
    pub(crate) flags: SectionFlags,
    pub(crate) alignment: Alignment,
    pub(crate) entsize: u64,

    /// While content is being built this is a running total; after layout it
    /// is the final section size.
    pub(crate) size: u64,

    pub(crate) addr: u64,
    pub(crate) file_offset: u64,

    pub(crate) payload: SectionPayload,

    /// For `SHF_MERGE | SHF_STRINGS` sections: the attached string merger.
    pub(crate) merge: Option<MergeStringId>,

    /// For relocation sections: the section the relocations apply to.
    pub(crate) link: Option<SectionId>,

    /// For input sections: the output section their content moved into.
    pub(crate) out: Option<SectionId>,

    /// Section header index, assigned when the output file is written.
    pub(crate) output_index: Option<usize>,
}

#[derive(Debug)]
pub(crate) enum SectionPayload {
    None,
    Data(SectionData),
    Reloc(RelocData),
}

impl<'data> Section<'data> {
    pub(crate) fn new(
        name: &'data [u8],
        kind: SectionKind,
        sh_type: u32,
        flags: SectionFlags,
        alignment: Alignment,
    ) -> Self {
        Self {
            name,
            kind,
            sh_type,
            flags,
            alignment,
            entsize: 0,
            size: 0,
            addr: 0,
            file_offset: 0,
            payload: SectionPayload::None,
            merge: None,
            link: None,
            out: None,
            output_index: None,
        }
    }

    pub(crate) fn data(&self) -> Option<&SectionData> {
        match &self.payload {
            SectionPayload::Data(data) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn data_mut(&mut self) -> &mut SectionData {
        if !matches!(self.payload, SectionPayload::Data(_)) {
            self.payload = SectionPayload::Data(SectionData::default());
        }
        match &mut self.payload {
            SectionPayload::Data(data) => data,
            _ => unreachable!(),
        }
    }

    pub(crate) fn reloc_data(&self) -> Option<&RelocData> {
        match &self.payload {
            SectionPayload::Reloc(data) => Some(data),
            _ => None,
        }
    }

    pub(crate) fn reloc_data_mut(&mut self) -> &mut RelocData {
        if !matches!(self.payload, SectionPayload::Reloc(_)) {
            self.payload = SectionPayload::Reloc(RelocData::default());
        }
        match &mut self.payload {
            SectionPayload::Reloc(data) => data,
            _ => unreachable!(),
        }
    }

    pub(crate) fn is_alloc(&self) -> bool {
        self.flags.contains(rivet_utils::elf::shf::ALLOC)
    }

    pub(crate) fn display_name(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.name)
    }
}

/// An ordered list of (pattern, output name, offset) mappings from input
/// section names to output section names. Patterns match by prefix; `*`
/// matches everything and must come last. The first matching entry wins.
/// User-script entries prepend ahead of the GNU defaults.
pub(crate) struct SectionMap {
    mappings: Vec<Mapping>,
}

pub(crate) struct Mapping {
    pub(crate) pattern: Cow<'static, str>,
    /// `None` means the input section keeps its own name.
    pub(crate) output: Option<Cow<'static, str>>,
    pub(crate) offset: u64,
}

/// The ELF name mappings used by gold, installed before any user entries.
/// Order matters: more specific prefixes come before the prefixes they
/// extend.
const STD_ELF_MAP: &[(&str, &str)] = &[
    (".text", ".text"),
    (".rodata", ".rodata"),
    (".data.rel.ro.local", ".data.rel.ro.local"),
    (".data.rel.ro", ".data.rel.ro"),
    (".data", ".data"),
    (".bss", ".bss"),
    (".tdata", ".tdata"),
    (".tbss", ".tbss"),
    (".init_array", ".init_array"),
    (".fini_array", ".fini_array"),
    (".ctors", ".ctors"),
    (".dtors", ".dtors"),
    (".sdata", ".sdata"),
    (".sbss", ".sbss"),
    (".gcc_except_table", ".gcc_except_table"),
    (".gnu.linkonce.t", ".text"),
    (".gnu.linkonce.r", ".rodata"),
    (".gnu.linkonce.d", ".data"),
    (".gnu.linkonce.b", ".bss"),
];

impl SectionMap {
    pub(crate) fn with_std_elf_map() -> Self {
        let mut mappings: Vec<Mapping> = STD_ELF_MAP
            .iter()
            .map(|(pattern, output)| Mapping {
                pattern: Cow::Borrowed(*pattern),
                output: Some(Cow::Borrowed(*output)),
                offset: 0,
            })
            .collect();
        // The explicit catch-all: anything unmatched keeps its input name.
        mappings.push(Mapping {
            pattern: Cow::Borrowed("*"),
            output: None,
            offset: 0,
        });
        Self { mappings }
    }

    /// Adds a mapping ahead of everything already present.
    pub(crate) fn prepend(
        &mut self,
        pattern: impl Into<Cow<'static, str>>,
        output: impl Into<Cow<'static, str>>,
        offset: u64,
    ) {
        self.mappings.insert(
            0,
            Mapping {
                pattern: pattern.into(),
                output: Some(output.into()),
                offset,
            },
        );
    }

    pub(crate) fn find(&self, input_name: &[u8]) -> Option<&Mapping> {
        self.mappings.iter().find(|m| {
            m.pattern == "*" || input_name.starts_with(m.pattern.as_bytes())
        })
    }

    /// Returns the output section name for an input section. With the
    /// catch-all installed this cannot fail for the default map, but a user
    /// map without one surfaces `UnrecognizedOutputSection`.
    pub(crate) fn output_name<'a>(&'a self, input_name: &'a [u8]) -> Result<&'a [u8]> {
        let Some(mapping) = self.find(input_name) else {
            bail!(LinkError::UnrecognizedOutputSection(
                String::from_utf8_lossy(input_name).into_owned()
            ));
        };
        Ok(match &mapping.output {
            Some(name) => name.as_bytes(),
            None => input_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std_map_prefixes() {
        let map = SectionMap::with_std_elf_map();
        assert_eq!(map.output_name(b".text.startup").unwrap(), b".text");
        assert_eq!(map.output_name(b".text").unwrap(), b".text");
        assert_eq!(map.output_name(b".rodata.str1.8").unwrap(), b".rodata");
        assert_eq!(
            map.output_name(b".data.rel.ro.local.foo").unwrap(),
            b".data.rel.ro.local"
        );
        assert_eq!(map.output_name(b".data.rel.ro.foo").unwrap(), b".data.rel.ro");
        assert_eq!(map.output_name(b".bss.page_tables").unwrap(), b".bss");
    }

    #[test]
    fn test_catch_all_keeps_name() {
        let map = SectionMap::with_std_elf_map();
        assert_eq!(map.output_name(b".my_custom").unwrap(), b".my_custom");
    }

    #[test]
    fn test_first_match_wins_with_prepended_entry() {
        let mut map = SectionMap::with_std_elf_map();
        map.prepend(".text.hot", ".text.hot", 0x40);
        assert_eq!(map.output_name(b".text.hot.inner").unwrap(), b".text.hot");
        assert_eq!(map.output_name(b".text.cold").unwrap(), b".text");
        assert_eq!(map.find(b".text.hot.inner").unwrap().offset, 0x40);
        assert_eq!(map.find(b".text.cold").unwrap().offset, 0);
    }
}
