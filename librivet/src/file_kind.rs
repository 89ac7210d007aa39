//! Code for identifying what sort of file we're dealing with based on the bytes of the file.

use crate::error::Result;
use anyhow::bail;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileKind {
    ElfObject,
    ElfDynamic,
    Archive,
    /// ASCII text that isn't ELF or an archive. Attempted as a linker script.
    Text,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) struct ElfIdent {
    pub(crate) is_64: bool,
    pub(crate) is_little_endian: bool,
}

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.starts_with(&object::archive::MAGIC) {
            Ok(FileKind::Archive)
        } else if bytes.starts_with(&object::elf::ELFMAG) {
            let ident = elf_ident(bytes)?;
            let e_type_offset = 16;
            if bytes.len() < e_type_offset + 2 {
                bail!("Invalid ELF file");
            }
            let raw = [bytes[e_type_offset], bytes[e_type_offset + 1]];
            let e_type = if ident.is_little_endian {
                u16::from_le_bytes(raw)
            } else {
                u16::from_be_bytes(raw)
            };
            match e_type {
                object::elf::ET_REL => Ok(FileKind::ElfObject),
                object::elf::ET_DYN => Ok(FileKind::ElfDynamic),
                t => bail!("Unsupported ELF kind {t}"),
            }
        } else if bytes.is_ascii() {
            Ok(FileKind::Text)
        } else {
            bail!("Couldn't identify file type");
        }
    }
}

/// Reads the class and data-encoding bytes of the ELF identification header.
pub(crate) fn elf_ident(bytes: &[u8]) -> Result<ElfIdent> {
    if bytes.len() < 6 {
        bail!("Invalid ELF file");
    }
    let is_64 = match bytes[4] {
        object::elf::ELFCLASS32 => false,
        object::elf::ELFCLASS64 => true,
        other => bail!("Invalid ELF class {other}"),
    };
    let is_little_endian = match bytes[5] {
        object::elf::ELFDATA2LSB => true,
        object::elf::ELFDATA2MSB => false,
        other => bail!("Invalid ELF data encoding {other}"),
    };
    Ok(ElfIdent {
        is_64,
        is_little_endian,
    })
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileKind::ElfObject => "ELF object",
            FileKind::ElfDynamic => "ELF dynamic",
            FileKind::Archive => "archive",
            FileKind::Text => "text",
        };
        std::fmt::Display::fmt(s, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_archive() {
        let mut bytes = b"!<arch>\n".to_vec();
        bytes.extend_from_slice(b"rest");
        assert_eq!(
            FileKind::identify_bytes(&bytes).unwrap(),
            FileKind::Archive
        );
    }

    #[test]
    fn test_identify_elf_object() {
        let mut bytes = vec![0x7f, b'E', b'L', b'F', 2, 1, 1, 0];
        bytes.resize(16, 0);
        bytes.extend_from_slice(&object::elf::ET_REL.to_le_bytes());
        bytes.extend_from_slice(&[0; 46]);
        assert_eq!(
            FileKind::identify_bytes(&bytes).unwrap(),
            FileKind::ElfObject
        );
        let ident = elf_ident(&bytes).unwrap();
        assert!(ident.is_64);
        assert!(ident.is_little_endian);
    }

    #[test]
    fn test_identify_big_endian_elf32() {
        let mut bytes = vec![0x7f, b'E', b'L', b'F', 1, 2, 1, 0];
        bytes.resize(16, 0);
        bytes.extend_from_slice(&object::elf::ET_DYN.to_be_bytes());
        assert_eq!(
            FileKind::identify_bytes(&bytes).unwrap(),
            FileKind::ElfDynamic
        );
        let ident = elf_ident(&bytes).unwrap();
        assert!(!ident.is_64);
        assert!(!ident.is_little_endian);
    }

    #[test]
    fn test_identify_text() {
        assert_eq!(
            FileKind::identify_bytes(b"GROUP ( libc.so.6 )").unwrap(),
            FileKind::Text
        );
    }
}
