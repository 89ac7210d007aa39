//! Deduplication of `SHF_MERGE | SHF_STRINGS` section content. Each input
//! merge section is split at NUL terminators into one `StringEntry` fragment
//! per string, keyed by its original byte offset. Merging into the output
//! either deduplicates through a byte-ordered pool or, in forced mode,
//! appends every entry unconditionally. Every input entry ends up with an
//! `output_link` naming the pool entry it was merged into, which is what
//! relocation retargeting consumes, including relocations whose addend
//! lands in the *middle* of a string.
//!
//! Output offsets are assigned once, after all inputs for an output section
//! have merged, iterating the pool in byte order so that builds are
//! reproducible regardless of input order.

use crate::error::Context as _;
use crate::error::LinkError;
use crate::error::Result;
use crate::fragment::FragmentId;
use crate::fragment::FragmentKind;
use crate::fragment::FragmentRef;
use crate::module::Module;
use crate::section::SectionId;
use anyhow::bail;
use hashbrown::HashMap;
use std::collections::BTreeMap;

/// Index of a merger in the module's merge-string arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct MergeStringId(u32);

impl MergeStringId {
    pub(crate) fn from_usize(index: usize) -> Self {
        Self(index as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub(crate) enum MergeString<'data> {
    Input(MergeStringInput),
    Output(MergeStringOutput<'data>),
}

#[derive(Debug)]
pub(crate) struct MergeStringInput {
    pub(crate) section: SectionId,

    /// Input byte offset of each string, in offset order. Greatest-lower-
    /// bound queries against this map resolve interior pointers.
    pub(crate) entries: BTreeMap<u64, FragmentId>,
}

#[derive(Debug, Default)]
pub(crate) struct MergeStringOutput<'data> {
    pub(crate) section: Option<SectionId>,

    /// The deduplicated pool, ordered by byte comparison.
    pool: BTreeMap<&'data [u8], FragmentId>,

    /// Entries appended in forced mode, in append order, after the pool.
    forced: Vec<FragmentId>,

    /// Maps the first fragment of each merged input section to that input's
    /// merger, so that input-relative offsets can be translated after the
    /// fragment has moved to the output.
    first_frag_to_input: HashMap<FragmentId, MergeStringId>,
}

/// Splits an input merge section's content into `StringEntry` fragments and
/// registers an input merger for it. Each fragment's provisional offset is
/// its byte offset within the input section.
pub(crate) fn split_input_section<'data>(
    module: &mut Module<'data>,
    section_id: SectionId,
    content: &'data [u8],
) -> Result<MergeStringId> {
    let ms_id = MergeStringId::from_usize(module.merge_strings.len());
    let mut entries = BTreeMap::new();
    let mut remaining = content;
    let mut offset = 0u64;
    while !remaining.is_empty() {
        let len = memchr::memchr(0, remaining)
            .map(|i| i + 1)
            .context("String in merge-string section is not null-terminated")?;
        let (bytes, rest) = remaining.split_at(len);
        let frag = module.alloc_fragment(
            section_id,
            offset,
            FragmentKind::StringEntry {
                bytes,
                output_link: None,
            },
        );
        module.section_mut(section_id).data_mut().push(frag);
        entries.insert(offset, frag);
        offset += len as u64;
        remaining = rest;
    }
    module.merge_strings.push(MergeString::Input(MergeStringInput {
        section: section_id,
        entries,
    }));
    module.section_mut(section_id).merge = Some(ms_id);
    Ok(ms_id)
}

/// Registers (or returns) the output merger attached to an output section.
pub(crate) fn output_merger<'data>(
    module: &mut Module<'data>,
    section_id: SectionId,
) -> MergeStringId {
    if let Some(existing) = module.section(section_id).merge {
        return existing;
    }
    let ms_id = MergeStringId::from_usize(module.merge_strings.len());
    module
        .merge_strings
        .push(MergeString::Output(MergeStringOutput {
            section: Some(section_id),
            ..MergeStringOutput::default()
        }));
    module.section_mut(section_id).merge = Some(ms_id);
    ms_id
}

/// Merges one input merger's strings into an output merger.
///
/// In deduplicating mode each entry is looked up by byte equality in the
/// pool: a hit links the entry to the existing pool string; a miss moves the
/// fragment into the output section. In forced mode (used when a
/// non-mergeable input has been coalesced into this output for layout
/// reasons) every entry is appended unconditionally and links to itself.
pub(crate) fn merge<'data>(
    module: &mut Module<'data>,
    output_id: MergeStringId,
    input_id: MergeStringId,
    forced: bool,
) -> Result {
    let MergeString::Input(input) = module.merge_string(input_id) else {
        bail!("Internal error: merge() source must be an input merger");
    };
    let input_section = input.section;
    let entry_frags: Vec<FragmentId> = input.entries.values().copied().collect();
    let first_frag = entry_frags.first().copied();

    let MergeString::Output(output) = module.merge_string(output_id) else {
        bail!("Internal error: merge() destination must be an output merger");
    };
    let output_section = output
        .section
        .expect("output merger is attached to a section");

    if let Some(first) = first_frag {
        let MergeString::Output(output) = module.merge_string_mut(output_id) else {
            unreachable!();
        };
        output.first_frag_to_input.insert(first, input_id);
    }

    for frag_id in entry_frags {
        let bytes = module
            .frag(frag_id)
            .string_bytes()
            .expect("merge entries are string fragments");
        if forced {
            set_output_link(module, frag_id, frag_id);
            module.frag_mut(frag_id).parent = output_section;
            let MergeString::Output(output) = module.merge_string_mut(output_id) else {
                unreachable!();
            };
            output.forced.push(frag_id);
            continue;
        }
        let MergeString::Output(output) = module.merge_string_mut(output_id) else {
            unreachable!();
        };
        if let Some(&existing) = output.pool.get(bytes) {
            set_output_link(module, frag_id, existing);
        } else {
            output.pool.insert(bytes, frag_id);
            set_output_link(module, frag_id, frag_id);
            module.frag_mut(frag_id).parent = output_section;
        }
    }

    // The input section's content now lives (deduplicated) in the output.
    let section = module.section_mut(input_section);
    section.kind = crate::section::SectionKind::Ignore;
    Ok(())
}

fn set_output_link(module: &mut Module<'_>, frag: FragmentId, link: FragmentId) {
    let FragmentKind::StringEntry { output_link, .. } = &mut module.frag_mut(frag).kind else {
        panic!("set_output_link on non-string fragment");
    };
    *output_link = Some(link);
}

/// Rebuilds the output section's fragment list in byte-sorted pool order
/// (forced entries follow in append order) and assigns final offsets.
pub(crate) fn finalize_output(module: &mut Module<'_>, output_id: MergeStringId) {
    let MergeString::Output(output) = module.merge_string(output_id) else {
        return;
    };
    let section_id = output
        .section
        .expect("output merger is attached to a section");
    let ordered: Vec<FragmentId> = output
        .pool
        .values()
        .copied()
        .chain(output.forced.iter().copied())
        .collect();

    let mut offset = 0u64;
    for &frag_id in &ordered {
        let frag = module.frag_mut(frag_id);
        frag.offset = offset;
        offset += frag.size();
    }
    let section = module.section_mut(section_id);
    section.size = offset;
    match &mut section.payload {
        crate::section::SectionPayload::Data(data) => data.frags = ordered,
        _ => {
            section.payload =
                crate::section::SectionPayload::Data(crate::fragment::SectionData {
                    frags: ordered,
                });
        }
    }
}

/// Translates an input-section-relative offset to the post-merge output
/// offset: the entry whose input offset is the greatest lower bound of `p`
/// supplies its output string's offset plus the remainder. This is how
/// interior pointers into strings survive deduplication.
pub(crate) fn output_offset_from_input(
    module: &Module<'_>,
    ms_id: MergeStringId,
    input_offset: u64,
    frag_ref: FragmentRef,
) -> Result<u64> {
    match module.merge_string(ms_id) {
        MergeString::Input(input) => {
            let Some((&entry_offset, &entry)) =
                input.entries.range(..=input_offset).next_back()
            else {
                bail!(LinkError::BadMergeOffset(input_offset));
            };
            let link = module
                .frag(entry)
                .string_output_link()
                .expect("string entry has been merged");
            Ok(module.frag(link).offset + (input_offset - entry_offset))
        }
        MergeString::Output(output) => {
            // The fragment has already moved to the output; recover the input
            // merger it came from and translate there.
            let Some(&input_ms) = output.first_frag_to_input.get(&frag_ref.frag) else {
                bail!(LinkError::BadMergeOffset(input_offset));
            };
            output_offset_from_input(module, input_ms, input_offset, frag_ref)
        }
    }
}

/// The output offset of a reference into a specific (non-section) string.
pub(crate) fn output_offset(module: &Module<'_>, frag_ref: FragmentRef) -> u64 {
    let link = module
        .frag(frag_ref.frag)
        .string_output_link()
        .unwrap_or(frag_ref.frag);
    module.frag(link).offset + frag_ref.offset
}

/// Rewrites a ref at a merged string to point at the surviving output
/// fragment, preserving the byte-in-string offset.
pub(crate) fn update_fragment_ref(module: &Module<'_>, frag_ref: &mut FragmentRef) {
    if let Some(link) = module.frag(frag_ref.frag).string_output_link() {
        frag_ref.frag = link;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment;
    use crate::section::Section;
    use crate::section::SectionKind;
    use rivet_utils::elf::shf;
    use rivet_utils::elf::SectionFlags;

    fn merge_flags() -> SectionFlags {
        SectionFlags::empty()
            .with(shf::ALLOC)
            .with(shf::MERGE)
            .with(shf::STRINGS)
    }

    fn add_input_section<'data>(
        module: &mut Module<'data>,
        content: &'data [u8],
    ) -> (SectionId, MergeStringId) {
        let section = module.add_section(Section::new(
            b".rodata.str1.1",
            SectionKind::Regular,
            object::elf::SHT_PROGBITS,
            merge_flags(),
            alignment::MIN,
        ));
        let ms = split_input_section(module, section, content).unwrap();
        (section, ms)
    }

    fn setup_output(module: &mut Module<'_>) -> (SectionId, MergeStringId) {
        let out_section = module.get_or_create_output_section(
            b".rodata.str1.1",
            SectionKind::Regular,
            object::elf::SHT_PROGBITS,
            merge_flags(),
            alignment::MIN,
        );
        let out_ms = output_merger(module, out_section);
        (out_section, out_ms)
    }

    fn output_bytes(module: &Module<'_>, section: SectionId) -> Vec<u8> {
        let mut out = Vec::new();
        for &frag in &module.section(section).data().unwrap().frags {
            out.extend_from_slice(module.frag(frag).string_bytes().unwrap());
        }
        out
    }

    #[test]
    fn test_dedup_across_inputs_byte_sorted() {
        let mut module = Module::new();
        let (out_section, out_ms) = setup_output(&mut module);
        let (_, ms_a) = add_input_section(&mut module, b"hello\0world\0hello\0");
        let (_, ms_b) = add_input_section(&mut module, b"world\0!\0");

        merge(&mut module, out_ms, ms_a, false).unwrap();
        merge(&mut module, out_ms, ms_b, false).unwrap();
        finalize_output(&mut module, out_ms);

        // Three distinct strings, byte-sorted.
        assert_eq!(output_bytes(&module, out_section), b"!\0hello\0world\0");
        assert_eq!(module.section(out_section).size, 14);
    }

    #[test]
    fn test_relocation_offset_translation() {
        let mut module = Module::new();
        let (_, out_ms) = setup_output(&mut module);
        let (_, ms_a) = add_input_section(&mut module, b"hello\0world\0hello\0");
        let (_, ms_b) = add_input_section(&mut module, b"world\0!\0");
        merge(&mut module, out_ms, ms_a, false).unwrap();
        merge(&mut module, out_ms, ms_b, false).unwrap();
        finalize_output(&mut module, out_ms);

        // Output layout: "!\0" at 0, "hello\0" at 2, "world\0" at 8.
        let dummy = FragmentRef::new(
            match module.merge_string(ms_a) {
                MergeString::Input(input) => *input.entries.values().next().unwrap(),
                _ => unreachable!(),
            },
            0,
        );
        // Input A offset 6 is the start of "world".
        assert_eq!(
            output_offset_from_input(&module, ms_a, 6, dummy).unwrap(),
            8
        );
        // Input A offset 12 is the duplicate "hello".
        assert_eq!(
            output_offset_from_input(&module, ms_a, 12, dummy).unwrap(),
            2
        );
        // Input B offset 0 is "world", deduplicated into A's copy.
        assert_eq!(
            output_offset_from_input(&module, ms_b, 0, dummy).unwrap(),
            8
        );
    }

    #[test]
    fn test_interior_pointer() {
        let mut module = Module::new();
        let (_, out_ms) = setup_output(&mut module);
        let (_, ms_a) = add_input_section(&mut module, b"hello\0world\0");
        merge(&mut module, out_ms, ms_a, false).unwrap();
        finalize_output(&mut module, out_ms);

        let dummy = FragmentRef::new(
            match module.merge_string(ms_a) {
                MergeString::Input(input) => *input.entries.values().next().unwrap(),
                _ => unreachable!(),
            },
            0,
        );
        // "hello\0" lands at 0, "world\0" at 6. Offset 2 points at "llo"
        // inside "hello"; offset 8 points at "rld" inside "world".
        assert_eq!(output_offset_from_input(&module, ms_a, 2, dummy).unwrap(), 2);
        assert_eq!(output_offset_from_input(&module, ms_a, 8, dummy).unwrap(), 8);
    }

    #[test]
    fn test_interior_pointer_after_dedup() {
        let mut module = Module::new();
        let (_, out_ms) = setup_output(&mut module);
        let (_, ms_a) = add_input_section(&mut module, b"zzzz\0hello\0");
        let (_, ms_b) = add_input_section(&mut module, b"hello\0");
        merge(&mut module, out_ms, ms_a, false).unwrap();
        merge(&mut module, out_ms, ms_b, false).unwrap();
        finalize_output(&mut module, out_ms);

        // Output: "hello\0" at 0, "zzzz\0" at 6. B's "hello" was
        // deduplicated into A's fragment; an interior pointer to "llo" in
        // B's copy must land inside A's surviving string.
        let dummy = FragmentRef::new(
            match module.merge_string(ms_b) {
                MergeString::Input(input) => *input.entries.values().next().unwrap(),
                _ => unreachable!(),
            },
            0,
        );
        assert_eq!(output_offset_from_input(&module, ms_b, 2, dummy).unwrap(), 2);
    }

    #[test]
    fn test_offset_before_first_entry_fails() {
        let mut module = Module::new();
        let (_, out_ms) = setup_output(&mut module);
        let (_, ms_a) = add_input_section(&mut module, b"x\0");
        merge(&mut module, out_ms, ms_a, false).unwrap();
        finalize_output(&mut module, out_ms);

        // Build an input merger whose first entry starts past zero, then ask
        // for an offset before it.
        let (section, k, v) = {
            let MergeString::Input(input) = module.merge_string(ms_a) else {
                unreachable!();
            };
            let (&k, &v) = input.entries.iter().next().unwrap();
            (input.section, k, v)
        };
        let mut entries = BTreeMap::new();
        entries.insert(k + 8, v);
        module.merge_strings.push(MergeString::Input(MergeStringInput {
            section,
            entries,
        }));
        let shifted = MergeStringId::from_usize(module.merge_strings.len() - 1);
        let dummy = FragmentRef::new(v, 0);
        let err = output_offset_from_input(&module, shifted, 4, dummy).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkError>(),
            Some(LinkError::BadMergeOffset(4))
        ));
    }

    #[test]
    fn test_forced_mode_keeps_duplicates() {
        let mut module = Module::new();
        let (out_section, out_ms) = setup_output(&mut module);
        let (_, ms_a) = add_input_section(&mut module, b"dup\0");
        let (_, ms_b) = add_input_section(&mut module, b"dup\0");
        merge(&mut module, out_ms, ms_a, true).unwrap();
        merge(&mut module, out_ms, ms_b, true).unwrap();
        finalize_output(&mut module, out_ms);
        assert_eq!(output_bytes(&module, out_section), b"dup\0dup\0");
    }

    #[test]
    fn test_no_duplicate_strings_in_output() {
        let mut module = Module::new();
        let (out_section, out_ms) = setup_output(&mut module);
        let (_, ms_a) = add_input_section(&mut module, b"a\0b\0a\0c\0b\0");
        merge(&mut module, out_ms, ms_a, false).unwrap();
        finalize_output(&mut module, out_ms);

        let frags = &module.section(out_section).data().unwrap().frags;
        let mut seen = Vec::new();
        for &f in frags {
            let bytes = module.frag(f).string_bytes().unwrap().to_vec();
            assert!(!seen.contains(&bytes), "duplicate string in output pool");
            seen.push(bytes);
        }
        assert_eq!(seen.len(), 3);
    }
}
