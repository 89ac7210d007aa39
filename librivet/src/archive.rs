//! Code to read ar files. We don't use the ar crate because it provides access to data only via the
//! Read trait and we want to borrow the data of each entry. The SysV symbol index ("/" entry) is
//! parsed because archive members are only loaded when they define a symbol that is currently
//! undefined.

use crate::error::Context as _;
use crate::error::Result;
use anyhow::bail;
use bytemuck::Pod;
use bytemuck::Zeroable;
use std::ops::Range;

pub(crate) enum ArchiveEntry<'data> {
    Regular(ArchiveContent<'data>),
    Filenames(ExtendedFilenames<'data>),
    SymbolTable(SymbolTable<'data>),
}

#[derive(Clone, Copy)]
pub(crate) struct ExtendedFilenames<'data> {
    data: &'data [u8],
}

#[derive(Clone, Copy)]
pub(crate) struct SymbolTable<'data> {
    data: &'data [u8],
}

pub(crate) struct ArchiveContent<'data> {
    ident: &'data str,

    pub(crate) entry_data: &'data [u8],

    /// The offset in the archive at which the entry's header starts. The SysV
    /// symbol index refers to members by this offset.
    pub(crate) header_offset: usize,
}

pub(crate) struct ArchiveIterator<'data> {
    data: &'data [u8],
    offset: usize,
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
struct EntryHeader {
    ident: [u8; 16],
    _timestamp: [u8; 12],
    _owner_id: [u8; 6],
    _group_id: [u8; 6],
    _mode: [u8; 8],
    size: [u8; 10],
    end: [u8; 2],
}

const _ASSERTS: () = {
    assert!(size_of::<EntryHeader>() == 60);
};

const HEADER_SIZE: usize = size_of::<EntryHeader>();

impl<'data> ArchiveIterator<'data> {
    /// Create an iterator from the bytes of the whole archive.
    pub(crate) fn from_archive_bytes(data: &'data [u8]) -> Result<Self> {
        let magic = object::archive::MAGIC;
        if let Some(data) = data.strip_prefix(&magic) {
            Ok(Self {
                data,
                offset: magic.len(),
            })
        } else {
            bail!("Missing archive header");
        }
    }

    fn next_result(&mut self) -> Result<Option<ArchiveEntry<'data>>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        if self.data.len() < HEADER_SIZE {
            bail!("Short archive entry header");
        }
        let header_offset = self.offset;
        let (header, rest) = self.data.split_at(HEADER_SIZE);
        let header: &EntryHeader = bytemuck::from_bytes(header);
        let size = parse_decimal(&header.size)?;
        self.data = rest;
        self.offset += HEADER_SIZE;
        let ident = std::str::from_utf8(&header.ident).context("archive ident is invalid UTF-8")?;
        let ident = ident.trim_end();
        if self.data.len() < size {
            bail!("Entry size is {size}, but only {} bytes left", self.data.len());
        }
        let entry_data = &self.data[..size];
        let entry = match ident {
            "/" => ArchiveEntry::SymbolTable(SymbolTable { data: entry_data }),
            "//" => ArchiveEntry::Filenames(ExtendedFilenames { data: entry_data }),
            _ => ArchiveEntry::Regular(ArchiveContent {
                ident,
                entry_data,
                header_offset,
            }),
        };
        let size_with_padding = size.next_multiple_of(2).min(self.data.len());
        self.data = &self.data[size_with_padding..];
        self.offset += size_with_padding;
        Ok(Some(entry))
    }
}

fn parse_decimal(bytes: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(bytes)
        .context("archive size field is invalid UTF-8")?
        .trim_end();
    text.parse()
        .with_context(|| format!("Invalid archive size field `{text}`"))
}

impl<'data> ArchiveContent<'data> {
    /// Returns the member's filename. Long names live in the extended
    /// filenames entry and are referenced as `/<offset>`.
    pub(crate) fn identifier(
        &self,
        extended_filenames: Option<ExtendedFilenames<'data>>,
    ) -> &'data [u8] {
        if let Some(filenames) = extended_filenames {
            if let Some(rest) = self.ident.strip_prefix('/') {
                if let Ok(offset) = rest.trim_end_matches('/').trim().parse::<usize>() {
                    let data = &filenames.data[offset..];
                    // Each name in the extended filenames table ends with "/\n".
                    let end = memchr::memchr(b'\n', data).unwrap_or(data.len());
                    return &data[..end.saturating_sub(1)];
                }
            }
        }
        self.ident.trim_end_matches('/').as_bytes()
    }

    pub(crate) fn data_range(&self) -> Range<usize> {
        let data_start = self.header_offset + HEADER_SIZE;
        data_start..data_start + self.entry_data.len()
    }
}

impl<'data> SymbolTable<'data> {
    /// Iterates the SysV index as (symbol name, member header offset) pairs.
    /// The index is a big-endian u32 count, that many big-endian u32 member
    /// offsets, then the NUL-terminated names in the same order.
    pub(crate) fn symbols(&self) -> Result<Vec<(&'data [u8], usize)>> {
        if self.data.len() < 4 {
            bail!("Archive symbol index too short");
        }
        let count = u32::from_be_bytes(self.data[..4].try_into().unwrap()) as usize;
        let offsets_end = 4 + count * 4;
        if self.data.len() < offsets_end {
            bail!("Archive symbol index truncated");
        }
        let mut names = &self.data[offsets_end..];
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            let raw = &self.data[4 + i * 4..8 + i * 4];
            let member_offset = u32::from_be_bytes(raw.try_into().unwrap()) as usize;
            let end = memchr::memchr(0, names).context("Unterminated name in symbol index")?;
            out.push((&names[..end], member_offset));
            names = &names[end + 1..];
        }
        Ok(out)
    }
}

impl<'data> Iterator for ArchiveIterator<'data> {
    type Item = Result<ArchiveEntry<'data>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_result().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ident: &str, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("{ident:<16}").as_bytes());
        out.extend_from_slice(b"0           ");
        out.extend_from_slice(b"0     0     ");
        out.extend_from_slice(b"644     ");
        out.extend_from_slice(format!("{:<10}", data.len()).as_bytes());
        out.extend_from_slice(b"`\n");
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
        out
    }

    fn archive(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut out = b"!<arch>\n".to_vec();
        for e in entries {
            out.extend_from_slice(e);
        }
        out
    }

    #[test]
    fn test_iterate_members() {
        let data = archive(&[entry("a.o/", b"AAAA"), entry("b.o/", b"BBBBB")]);
        let entries: Vec<_> = ArchiveIterator::from_archive_bytes(&data)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(entries.len(), 2);
        let ArchiveEntry::Regular(first) = &entries[0] else {
            panic!("expected regular entry");
        };
        assert_eq!(first.identifier(None), b"a.o");
        assert_eq!(first.entry_data, b"AAAA");
        let ArchiveEntry::Regular(second) = &entries[1] else {
            panic!("expected regular entry");
        };
        assert_eq!(second.entry_data, b"BBBBB");
        // Odd-sized first entry is padded, so the second starts on an even
        // offset.
        assert_eq!(second.header_offset % 2, 0);
    }

    #[test]
    fn test_symbol_index() {
        let mut index = Vec::new();
        index.extend_from_slice(&2u32.to_be_bytes());
        index.extend_from_slice(&100u32.to_be_bytes());
        index.extend_from_slice(&200u32.to_be_bytes());
        index.extend_from_slice(b"foo\0bar\0");
        let data = archive(&[entry("/", &index)]);
        let mut iter = ArchiveIterator::from_archive_bytes(&data).unwrap();
        let ArchiveEntry::SymbolTable(table) = iter.next().unwrap().unwrap() else {
            panic!("expected symbol table");
        };
        let symbols = table.symbols().unwrap();
        assert_eq!(symbols, vec![(b"foo".as_slice(), 100), (b"bar".as_slice(), 200)]);
    }

    #[test]
    fn test_long_filenames() {
        let names = b"a-very-long-member-name.o/\n";
        let data = archive(&[entry("//", names), entry("/0", b"XX")]);
        let entries: Vec<_> = ArchiveIterator::from_archive_bytes(&data)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let ArchiveEntry::Filenames(filenames) = &entries[0] else {
            panic!("expected filenames entry");
        };
        let ArchiveEntry::Regular(member) = &entries[1] else {
            panic!("expected regular entry");
        };
        assert_eq!(
            member.identifier(Some(*filenames)),
            b"a-very-long-member-name.o"
        );
    }
}
