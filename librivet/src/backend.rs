//! The architecture/ABI plug-in surface. One backend object is created per
//! link and consulted by the driver for ELF identity, address-space
//! conventions, the relocator, target sections/symbols and relaxation.

use crate::args::OutputKind;
use crate::error::Result;
use crate::module::Module;
use crate::relocator::Relocator;
use crate::symbol::SymbolId;

pub(crate) trait TargetBackend {
    fn bitclass(&self) -> u8;

    fn is_little_endian(&self) -> bool;

    fn machine(&self) -> u16;

    fn osabi(&self) -> u8 {
        0
    }

    fn abi_version(&self) -> u8 {
        0
    }

    fn flags(&self) -> u32 {
        0
    }

    fn page_size(&self) -> u64 {
        0x1000
    }

    /// The base virtual address for the output kind.
    fn base_address(&self, output_kind: OutputKind) -> u64;

    /// Registers target-defined output sections before section merging.
    fn init_target_sections(&mut self, _module: &mut Module) -> Result {
        Ok(())
    }

    /// Defines backend symbols such as `_GLOBAL_OFFSET_TABLE_` and
    /// `_PROCEDURE_LINKAGE_TABLE_`.
    fn init_target_symbols(&mut self, _module: &mut Module) -> Result {
        Ok(())
    }

    /// Registers stub prototypes with the backend's stub factory.
    fn init_target_stubs(&mut self) {}

    fn relocator(&self) -> &dyn Relocator;

    fn relocator_mut(&mut self) -> &mut dyn Relocator;

    /// Computes the final value of a thread-local symbol.
    fn finalize_tls_symbol(&self, module: &mut Module, symbol: SymbolId);

    /// Last chance for the backend to fix up its own symbols after layout.
    fn finalize_target_symbols(&mut self, _module: &mut Module) -> Result {
        Ok(())
    }

    /// One relaxation step. Sets `finished` to false when it changed
    /// anything that requires another layout pass (a new stub, typically).
    fn do_relax(&mut self, _module: &mut Module, _finished: &mut bool) -> Result {
        Ok(())
    }

    /// Moves relaxation-emitted relocations into the module once the
    /// fixpoint is reached, so the apply phase can process them after the
    /// regular relocation sections.
    fn finalize_stubs(&mut self, _module: &mut Module) -> Result {
        Ok(())
    }

    /// Whether relaxation can ever be needed for this architecture.
    fn wants_relaxation(&self) -> bool {
        false
    }
}
