use crate::error::Result;
use anyhow::bail;
use object::elf::EM_386;
use object::elf::EM_ARM;
use object::elf::EM_X86_64;
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    Arm,
}

impl TryFrom<u16> for Architecture {
    type Error = crate::error::Error;

    fn try_from(arch: u16) -> Result<Self, Self::Error> {
        match arch {
            EM_X86_64 => Ok(Self::X86_64),
            EM_ARM => Ok(Self::Arm),
            EM_386 => bail!("i386 objects are not supported"),
            _ => bail!("Unsupported architecture: 0x{arch:x}"),
        }
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arch = match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm => "arm",
        };
        write!(f, "{arch}")
    }
}
