//! The output symbol pool. Resolution is streaming: as each input is parsed,
//! every global symbol observation is offered to the pool, which either
//! creates a new name entry or folds the observation into the existing one
//! according to the binding/common/visibility rules.
//!
//! Name keys are interned: a name's hash is computed once, when the
//! observation reaches the pool, and carried in the key, so the repeated
//! lookups that resolution, archive fixpointing and script-symbol handling
//! perform never rehash the name bytes.

use crate::alignment::Alignment;
use crate::error::LinkError;
use crate::error::Result;
use crate::module::InputId;
use crate::section::SectionId;
use crate::symbol::Binding;
use crate::symbol::ResolveInfo;
use crate::symbol::ResolveInfoId;
use crate::symbol::SymbolDesc;
use crate::symbol::SymbolType;
use crate::symbol::Visibility;
use anyhow::bail;
use std::hash::BuildHasher;
use std::hash::Hash;
use std::hash::Hasher;

/// A global symbol name with its hash fixed at interning time.
#[derive(Clone, Copy)]
struct InternedName<'data> {
    bytes: &'data [u8],
    hash: u64,
}

impl<'data> InternedName<'data> {
    fn new(bytes: &'data [u8]) -> InternedName<'data> {
        let mut hasher = foldhash::fast::FixedState::default().build_hasher();
        hasher.write(bytes);
        InternedName {
            bytes,
            hash: hasher.finish(),
        }
    }
}

impl PartialEq for InternedName<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for InternedName<'_> {}

impl Hash for InternedName<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// The name map's hasher passes the interned hash straight through.
#[derive(Default, Clone)]
struct NameHasher {
    hash: u64,
}

impl Hasher for NameHasher {
    fn finish(&self) -> u64 {
        self.hash
    }

    fn write_u64(&mut self, value: u64) {
        self.hash = value;
    }

    fn write(&mut self, _bytes: &[u8]) {
        unreachable!("interned names hash through write_u64 only");
    }
}

impl BuildHasher for NameHasher {
    type Hasher = NameHasher;

    fn build_hasher(&self) -> NameHasher {
        NameHasher::default()
    }
}

type NameMap<'data, V> = hashbrown::HashMap<InternedName<'data>, V, NameHasher>;

#[derive(Default)]
pub(crate) struct SymbolPool<'data> {
    name_to_info: NameMap<'data, ResolveInfoId>,
    infos: Vec<ResolveInfo<'data>>,
}

/// One global symbol observation being offered to the pool.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SymbolObservation<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) sym_type: SymbolType,
    pub(crate) desc: SymbolDesc,
    pub(crate) binding: Binding,
    pub(crate) visibility: Visibility,
    pub(crate) size: u64,
    pub(crate) alignment: Alignment,
    pub(crate) from_shared: bool,
    pub(crate) source: Option<InputId>,
    pub(crate) section: Option<SectionId>,
}

/// What the pool decided about an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolveOutcome {
    /// First observation of this name.
    New,

    /// The observation replaces the previous state as the definition.
    TakeNew,

    /// The previous state stands; the observation was a reference or a
    /// weaker definition.
    KeepOld,

    /// Two commons coalesced: largest size, strictest alignment.
    CoalescedCommon,
}

impl ResolveOutcome {
    pub(crate) fn is_definition(self) -> bool {
        matches!(self, ResolveOutcome::New | ResolveOutcome::TakeNew)
    }
}

impl<'data> SymbolPool<'data> {
    pub(crate) fn info(&self, id: ResolveInfoId) -> &ResolveInfo<'data> {
        &self.infos[id.as_usize()]
    }

    pub(crate) fn info_mut(&mut self, id: ResolveInfoId) -> &mut ResolveInfo<'data> {
        &mut self.infos[id.as_usize()]
    }

    pub(crate) fn len(&self) -> usize {
        self.infos.len()
    }

    pub(crate) fn infos(&self) -> impl Iterator<Item = (ResolveInfoId, &ResolveInfo<'data>)> {
        self.infos
            .iter()
            .enumerate()
            .map(|(i, info)| (ResolveInfoId::from_usize(i), info))
    }

    pub(crate) fn lookup(&self, name: &[u8]) -> Option<ResolveInfoId> {
        let key = InternedName::new(name);
        self.name_to_info.get(&key).copied()
    }

    /// Looks a name up, creating a bare undefined entry if absent. Used for
    /// script-assigned symbols, which overwrite whatever resolution decided.
    pub(crate) fn get_or_create(&mut self, name: &'data [u8]) -> ResolveInfoId {
        let key = InternedName::new(name);
        if let Some(&id) = self.name_to_info.get(&key) {
            return id;
        }
        let id = ResolveInfoId::from_usize(self.infos.len());
        self.infos.push(ResolveInfo::new(name));
        self.name_to_info.insert(key, id);
        id
    }

    /// All named (global) entries, in creation order for deterministic
    /// output.
    pub(crate) fn global_infos(&self) -> Vec<ResolveInfoId> {
        let mut ids: Vec<ResolveInfoId> = self.name_to_info.values().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Allocates a `ResolveInfo` that doesn't participate in name lookup:
    /// locals, section symbols and stub symbols.
    pub(crate) fn alloc_unnamed(&mut self, info: ResolveInfo<'data>) -> ResolveInfoId {
        let id = ResolveInfoId::from_usize(self.infos.len());
        self.infos.push(info);
        id
    }

    /// Offers a global observation to the pool.
    pub(crate) fn insert(
        &mut self,
        obs: SymbolObservation<'data>,
    ) -> Result<(ResolveInfoId, ResolveOutcome)> {
        let key = InternedName::new(obs.name);
        let is_reference = obs.desc == SymbolDesc::Undefined && !obs.from_shared;
        if let Some(&id) = self.name_to_info.get(&key) {
            let info = self.info_mut(id);
            info.referenced |= is_reference;
            let outcome = resolve(info, &obs)?;
            Ok((id, outcome))
        } else {
            let id = ResolveInfoId::from_usize(self.infos.len());
            let mut info = info_from_observation(&obs);
            info.referenced = is_reference;
            self.infos.push(info);
            self.name_to_info.insert(key, id);
            Ok((id, ResolveOutcome::New))
        }
    }
}

fn info_from_observation<'data>(obs: &SymbolObservation<'data>) -> ResolveInfo<'data> {
    let mut info = ResolveInfo::new(obs.name);
    info.sym_type = obs.sym_type;
    info.desc = obs.desc;
    info.binding = obs.binding;
    info.visibility = obs.visibility;
    info.size = obs.size;
    info.alignment = obs.alignment;
    info.from_shared = obs.from_shared;
    info.source = obs.source;
    info.section = obs.section;
    info
}

/// Applies one observation to the existing state for the name.
fn resolve<'data>(
    old: &mut ResolveInfo<'data>,
    new: &SymbolObservation<'data>,
) -> Result<ResolveOutcome> {
    // The narrower visibility wins regardless of which definition is
    // selected.
    old.visibility = old.visibility.max(new.visibility);

    // An undef never overrides anything, though a strong reference upgrades
    // the binding of a weak one.
    if new.desc == SymbolDesc::Undefined {
        if old.is_undefined() && old.binding == Binding::Weak && new.binding == Binding::Global {
            old.binding = Binding::Global;
        }
        if old.is_undefined() && old.sym_type == SymbolType::NoType {
            old.sym_type = new.sym_type;
        }
        return Ok(ResolveOutcome::KeepOld);
    }

    if old.is_undefined() {
        take_new(old, new);
        return Ok(ResolveOutcome::TakeNew);
    }

    // Common symbols coalesce to the largest size and strictest alignment; a
    // non-common definition overrides any common.
    if old.is_common() {
        if new.desc == SymbolDesc::Common {
            old.size = old.size.max(new.size);
            old.alignment = old.alignment.max(new.alignment);
            return Ok(ResolveOutcome::CoalescedCommon);
        }
        take_new(old, new);
        return Ok(ResolveOutcome::TakeNew);
    }
    if new.desc == SymbolDesc::Common {
        return Ok(ResolveOutcome::KeepOld);
    }

    // Both are proper definitions. A shared-object definition never
    // overrides a relocatable-object definition.
    match (old.from_shared, new.from_shared) {
        (false, true) => return Ok(ResolveOutcome::KeepOld),
        (true, false) => {
            take_new(old, new);
            return Ok(ResolveOutcome::TakeNew);
        }
        _ => {}
    }

    match (old.is_weak(), new.binding == Binding::Weak) {
        (true, false) => {
            take_new(old, new);
            Ok(ResolveOutcome::TakeNew)
        }
        (false, true) | (true, true) => Ok(ResolveOutcome::KeepOld),
        (false, false) => {
            if old.from_shared && new.from_shared {
                // Two shared objects defining the same name: first wins, as
                // the dynamic loader would resolve it.
                return Ok(ResolveOutcome::KeepOld);
            }
            bail!(LinkError::MultipleDefinition(old.name_for_display()))
        }
    }
}

fn take_new<'data>(old: &mut ResolveInfo<'data>, new: &SymbolObservation<'data>) {
    old.sym_type = new.sym_type;
    old.desc = new.desc;
    old.binding = new.binding;
    old.size = new.size;
    old.alignment = new.alignment;
    old.from_shared = new.from_shared;
    old.source = new.source;
    old.section = new.section;
    old.out_symbol = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment;
    use crate::error::LinkError;

    fn obs(name: &'static [u8]) -> SymbolObservation<'static> {
        SymbolObservation {
            name,
            sym_type: SymbolType::NoType,
            desc: SymbolDesc::Define,
            binding: Binding::Global,
            visibility: Visibility::Default,
            size: 0,
            alignment: alignment::MIN,
            from_shared: false,
            source: None,
            section: None,
        }
    }

    #[test]
    fn test_two_strong_definitions_error() {
        let mut pool = SymbolPool::default();
        pool.insert(obs(b"foo")).unwrap();
        let err = pool.insert(obs(b"foo")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LinkError>(),
            Some(LinkError::MultipleDefinition(_))
        ));
    }

    #[test]
    fn test_strong_overrides_weak() {
        let mut pool = SymbolPool::default();
        let weak = SymbolObservation {
            binding: Binding::Weak,
            ..obs(b"bar")
        };
        let (id, outcome) = pool.insert(weak).unwrap();
        assert_eq!(outcome, ResolveOutcome::New);
        let (_, outcome) = pool.insert(obs(b"bar")).unwrap();
        assert_eq!(outcome, ResolveOutcome::TakeNew);
        assert_eq!(pool.info(id).binding, Binding::Global);
        // A later weak definition doesn't displace the strong one.
        let weak_again = SymbolObservation {
            binding: Binding::Weak,
            ..obs(b"bar")
        };
        let (_, outcome) = pool.insert(weak_again).unwrap();
        assert_eq!(outcome, ResolveOutcome::KeepOld);
    }

    #[test]
    fn test_undef_never_overrides() {
        let mut pool = SymbolPool::default();
        let (id, _) = pool.insert(obs(b"baz")).unwrap();
        let undef = SymbolObservation {
            desc: SymbolDesc::Undefined,
            ..obs(b"baz")
        };
        let (_, outcome) = pool.insert(undef).unwrap();
        assert_eq!(outcome, ResolveOutcome::KeepOld);
        assert_eq!(pool.info(id).desc, SymbolDesc::Define);
    }

    #[test]
    fn test_commons_coalesce() {
        let mut pool = SymbolPool::default();
        let small = SymbolObservation {
            desc: SymbolDesc::Common,
            size: 64,
            alignment: Alignment::new(16).unwrap(),
            ..obs(b"buf")
        };
        let large = SymbolObservation {
            desc: SymbolDesc::Common,
            size: 128,
            alignment: Alignment::new(4).unwrap(),
            ..obs(b"buf")
        };
        let (id, _) = pool.insert(small).unwrap();
        let (_, outcome) = pool.insert(large).unwrap();
        assert_eq!(outcome, ResolveOutcome::CoalescedCommon);
        let info = pool.info(id);
        assert_eq!(info.size, 128);
        assert_eq!(info.alignment, Alignment::new(16).unwrap());
        assert_eq!(info.desc, SymbolDesc::Common);
    }

    #[test]
    fn test_definition_overrides_common() {
        let mut pool = SymbolPool::default();
        let common = SymbolObservation {
            desc: SymbolDesc::Common,
            size: 64,
            ..obs(b"buf")
        };
        pool.insert(common).unwrap();
        let (id, outcome) = pool.insert(obs(b"buf")).unwrap();
        assert_eq!(outcome, ResolveOutcome::TakeNew);
        assert_eq!(pool.info(id).desc, SymbolDesc::Define);
        // And a common arriving after a definition is ignored.
        let common_again = SymbolObservation {
            desc: SymbolDesc::Common,
            size: 256,
            ..obs(b"buf")
        };
        let (_, outcome) = pool.insert(common_again).unwrap();
        assert_eq!(outcome, ResolveOutcome::KeepOld);
    }

    #[test]
    fn test_shared_definition_never_overrides_regular() {
        let mut pool = SymbolPool::default();
        pool.insert(obs(b"printf")).unwrap();
        let shared = SymbolObservation {
            from_shared: true,
            ..obs(b"printf")
        };
        let (id, outcome) = pool.insert(shared).unwrap();
        assert_eq!(outcome, ResolveOutcome::KeepOld);
        assert!(!pool.info(id).from_shared);
    }

    #[test]
    fn test_regular_overrides_shared() {
        let mut pool = SymbolPool::default();
        let shared = SymbolObservation {
            from_shared: true,
            ..obs(b"malloc")
        };
        pool.insert(shared).unwrap();
        let (id, outcome) = pool.insert(obs(b"malloc")).unwrap();
        assert_eq!(outcome, ResolveOutcome::TakeNew);
        assert!(!pool.info(id).from_shared);
    }

    #[test]
    fn test_visibility_narrows() {
        let mut pool = SymbolPool::default();
        let (id, _) = pool.insert(obs(b"vis")).unwrap();
        let hidden_ref = SymbolObservation {
            desc: SymbolDesc::Undefined,
            visibility: Visibility::Hidden,
            ..obs(b"vis")
        };
        pool.insert(hidden_ref).unwrap();
        assert_eq!(pool.info(id).visibility, Visibility::Hidden);
    }
}
