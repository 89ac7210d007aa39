//! End-to-end links over synthesised input objects: write relocatable
//! objects with `object::write`, run the linker on them, then pull the
//! output apart with `object::read`.

use librivet::LinkError;
use librivet::Linker;
use object::read::Object as _;
use object::read::ObjectSection as _;
use object::read::ObjectSymbol as _;
use object::write::Object;
use object::write::Relocation;
use object::write::Symbol;
use object::write::SymbolSection;
use object::Architecture;
use object::BinaryFormat;
use object::Endianness;
use object::RelocationFlags;
use object::SectionKind;
use object::SymbolFlags;
use object::SymbolKind;
use object::SymbolScope;
use std::path::Path;
use std::path::PathBuf;

struct TestDir {
    root: PathBuf,
}

impl TestDir {
    fn new(name: &str) -> TestDir {
        let root = std::env::temp_dir().join(format!(
            "rivet-test-{}-{name}",
            std::process::id()
        ));
        std::fs::create_dir_all(&root).unwrap();
        TestDir { root }
    }

    fn file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.root.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

fn new_object() -> Object<'static> {
    Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little)
}

fn add_global_func(obj: &mut Object, name: &[u8], section: object::write::SectionId, value: u64) {
    obj.add_symbol(Symbol {
        name: name.to_vec(),
        value,
        size: 1,
        kind: SymbolKind::Text,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(section),
        flags: SymbolFlags::None,
    });
}

fn link(output: &Path, inputs: &[&Path], extra: &[&str]) -> librivet::error::Result {
    let mut args: Vec<String> = vec!["-o".to_owned(), output.display().to_string()];
    args.extend(extra.iter().map(|s| (*s).to_owned()));
    args.extend(inputs.iter().map(|p| p.display().to_string()));
    Linker::from_args(args.iter())?.run()
}

#[test]
fn test_minimal_static_executable() {
    let dir = TestDir::new("minimal");
    let mut obj = new_object();
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    // mov eax, 60; xor edi, edi; syscall
    let code = [
        0xb8, 0x3c, 0x00, 0x00, 0x00, 0x31, 0xff, 0x0f, 0x05,
    ];
    obj.append_section_data(text, &code, 16);
    add_global_func(&mut obj, b"_start", text, 0);
    let input = dir.file("start.o", &obj.write().unwrap());

    let output = dir.path("minimal");
    link(&output, &[&input], &[]).unwrap();

    let bytes = std::fs::read(&output).unwrap();
    let parsed = object::read::File::parse(bytes.as_slice()).unwrap();
    assert_eq!(parsed.format(), BinaryFormat::Elf);
    assert!(parsed.entry() >= 0x40_0000);
    let out_text = parsed.section_by_name(".text").unwrap();
    assert_eq!(parsed.entry(), out_text.address());
    assert_eq!(out_text.data().unwrap(), &code);
}

#[test]
fn test_two_strong_definitions_fail() {
    let dir = TestDir::new("dupes");
    let make = |with_start: bool| {
        let mut obj = new_object();
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0xc3], 16);
        add_global_func(&mut obj, b"foo", text, 0);
        if with_start {
            add_global_func(&mut obj, b"_start", text, 0);
        }
        obj.write().unwrap()
    };
    let a = dir.file("a.o", &make(true));
    let b = dir.file("b.o", &make(false));

    let err = link(&dir.path("dupes"), &[&a, &b], &[]).unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<LinkError>(),
            Some(LinkError::MultipleDefinition(name)) if name == "foo"
        ),
        "unexpected error: {err:#}"
    );
}

#[test]
fn test_weak_definition_loses_to_strong() {
    let dir = TestDir::new("weak");
    let mut weak_obj = new_object();
    let text = weak_obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    weak_obj.append_section_data(text, &[0xc3], 16);
    weak_obj.add_symbol(Symbol {
        name: b"bar".to_vec(),
        value: 0,
        size: 1,
        kind: SymbolKind::Text,
        scope: SymbolScope::Dynamic,
        weak: true,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    add_global_func(&mut weak_obj, b"_start", text, 0);
    let a = dir.file("weak.o", &weak_obj.write().unwrap());

    let mut strong_obj = new_object();
    let text = strong_obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    // Padding ahead of the strong definition, so that its final address is
    // distinguishable from the weak one's.
    strong_obj.append_section_data(text, &[0x90, 0x90, 0x90, 0x90, 0xc3], 16);
    add_global_func(&mut strong_obj, b"bar", text, 4);
    let b = dir.file("strong.o", &strong_obj.write().unwrap());

    let output = dir.path("weak");
    link(&output, &[&a, &b], &[]).unwrap();

    let bytes = std::fs::read(&output).unwrap();
    let parsed = object::read::File::parse(bytes.as_slice()).unwrap();
    let out_text = parsed.section_by_name(".text").unwrap();
    let bar = parsed
        .symbols()
        .find(|s| s.name() == Ok("bar"))
        .expect("bar in output symtab");
    // The weak copy sits at .text+0; B's strong copy comes after A's one
    // byte of content, 16-aligned, plus its own 4 bytes of padding.
    assert_eq!(bar.address(), out_text.address() + 16 + 4);
}

#[test]
fn test_string_merge_dedup_and_retargeting() {
    let dir = TestDir::new("strmerge");

    // Input A: "hello\0world\0hello\0" plus a pointer to offset 6 ("world")
    // and one to offset 2 ("llo", an interior pointer).
    let mut obj_a = new_object();
    let text = obj_a.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj_a.append_section_data(text, &[0xc3], 16);
    add_global_func(&mut obj_a, b"_start", text, 0);
    let strings = obj_a.add_section(
        Vec::new(),
        b".rodata.str1.1".to_vec(),
        SectionKind::ReadOnlyString,
    );
    obj_a.append_section_data(strings, b"hello\0world\0hello\0", 1);
    let data = obj_a.add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
    obj_a.append_section_data(data, &[0u8; 16], 8);
    let strings_symbol = obj_a.section_symbol(strings);
    obj_a
        .add_relocation(
            data,
            Relocation {
                offset: 0,
                symbol: strings_symbol,
                addend: 6,
                flags: RelocationFlags::Elf {
                    r_type: object::elf::R_X86_64_64,
                },
            },
        )
        .unwrap();
    obj_a
        .add_relocation(
            data,
            Relocation {
                offset: 8,
                symbol: strings_symbol,
                addend: 2,
                flags: RelocationFlags::Elf {
                    r_type: object::elf::R_X86_64_64,
                },
            },
        )
        .unwrap();
    let a = dir.file("a.o", &obj_a.write().unwrap());

    // Input B: "world\0!\0"; one duplicate, one new string.
    let mut obj_b = new_object();
    let strings_b = obj_b.add_section(
        Vec::new(),
        b".rodata.str1.1".to_vec(),
        SectionKind::ReadOnlyString,
    );
    obj_b.append_section_data(strings_b, b"world\0!\0", 1);
    let b = dir.file("b.o", &obj_b.write().unwrap());

    let output = dir.path("strmerge");
    link(&output, &[&a, &b], &[]).unwrap();

    let bytes = std::fs::read(&output).unwrap();
    let parsed = object::read::File::parse(bytes.as_slice()).unwrap();

    // Three distinct strings, byte-sorted: "!\0" < "hello\0" < "world\0".
    let rodata = parsed.section_by_name(".rodata").unwrap();
    assert_eq!(rodata.data().unwrap(), b"!\0hello\0world\0");

    // The pointer at .data+0 must resolve to "world" (output offset 8); the
    // interior pointer at .data+8 to "llo" inside "hello" (output offset 4).
    let out_data = parsed.section_by_name(".data").unwrap();
    let words = out_data.data().unwrap();
    let first = u64::from_le_bytes(words[..8].try_into().unwrap());
    let second = u64::from_le_bytes(words[8..16].try_into().unwrap());
    assert_eq!(first, rodata.address() + 8);
    assert_eq!(second, rodata.address() + 2 + 2);
}

#[test]
fn test_common_symbols_coalesce() {
    let dir = TestDir::new("commons");
    let make = |size: u64, align: u64, with_start: bool| {
        let mut obj = new_object();
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0xc3], 16);
        if with_start {
            add_global_func(&mut obj, b"_start", text, 0);
        }
        obj.add_symbol(Symbol {
            name: b"buf".to_vec(),
            value: align,
            size,
            kind: SymbolKind::Data,
            scope: SymbolScope::Dynamic,
            weak: false,
            section: SymbolSection::Common,
            flags: SymbolFlags::None,
        });
        obj.write().unwrap()
    };
    let a = dir.file("a.o", &make(64, 16, true));
    let b = dir.file("b.o", &make(128, 4, false));

    let output = dir.path("commons");
    link(&output, &[&a, &b], &[]).unwrap();

    let bytes = std::fs::read(&output).unwrap();
    let parsed = object::read::File::parse(bytes.as_slice()).unwrap();
    let bss = parsed.section_by_name(".bss").unwrap();
    assert_eq!(bss.size(), 128);
    assert_eq!(bss.align(), 16);
    let buf = parsed
        .symbols()
        .find(|s| s.name() == Ok("buf"))
        .expect("buf in output symtab");
    assert_eq!(buf.address(), bss.address());
    assert_eq!(buf.address() % 16, 0);
}

#[test]
fn test_undefined_reference_is_reported_with_caller() {
    let dir = TestDir::new("undef");
    let mut obj = new_object();
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    // call <missing>
    obj.append_section_data(text, &[0xe8, 0x00, 0x00, 0x00, 0x00, 0xc3], 16);
    obj.add_symbol(Symbol {
        name: b"caller_fn".to_vec(),
        value: 0,
        size: 6,
        kind: SymbolKind::Text,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    add_global_func(&mut obj, b"_start", text, 0);
    let missing = obj.add_symbol(Symbol {
        name: b"missing".to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Unknown,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    });
    obj.add_relocation(
        text,
        Relocation {
            offset: 1,
            symbol: missing,
            addend: -4,
            flags: RelocationFlags::Elf {
                r_type: object::elf::R_X86_64_PLT32,
            },
        },
    )
    .unwrap();
    let input = dir.file("undef.o", &obj.write().unwrap());

    let err = link(&dir.path("undef"), &[&input], &[]).unwrap_err();
    let message = format!("{err:#}");
    assert!(
        message.contains("undefined reference") && message.contains("missing"),
        "unexpected error: {message}"
    );
    assert!(
        message.contains("caller_fn"),
        "diagnostic should name the calling function: {message}"
    );
}

#[test]
fn test_relocatable_output_keeps_relocations() {
    let dir = TestDir::new("partial");
    let mut obj = new_object();
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.append_section_data(text, &[0x90, 0x90, 0x90, 0x90], 16);
    add_global_func(&mut obj, b"fn_a", text, 0);
    let data = obj.add_section(Vec::new(), b".data".to_vec(), SectionKind::Data);
    obj.append_section_data(data, &[0u8; 8], 8);
    let text_symbol = obj.section_symbol(text);
    obj.add_relocation(
        data,
        Relocation {
            offset: 0,
            symbol: text_symbol,
            addend: 2,
            flags: RelocationFlags::Elf {
                r_type: object::elf::R_X86_64_64,
            },
        },
    )
    .unwrap();
    let input = dir.file("partial.o", &obj.write().unwrap());

    let output = dir.path("partial.o.out");
    link(&output, &[&input], &["-r"]).unwrap();

    let bytes = std::fs::read(&output).unwrap();
    let parsed = object::read::File::parse(bytes.as_slice()).unwrap();
    assert_eq!(parsed.kind(), object::ObjectKind::Relocatable);
    let out_data = parsed.section_by_name(".data").unwrap();
    let relocs: Vec<_> = out_data.relocations().collect();
    assert_eq!(relocs.len(), 1, "the .data relocation must survive -r");
    // Addresses stay unresolved in relocatable output.
    assert_eq!(out_data.address(), 0);
}

#[test]
fn test_defsym_and_script_assignment() {
    let dir = TestDir::new("defsym");
    let mut obj = new_object();
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.append_section_data(text, &[0xc3], 16);
    add_global_func(&mut obj, b"_start", text, 0);
    let input = dir.file("main.o", &obj.write().unwrap());
    let script = dir.file("layout.ld", b"PROVIDE(__heap_size = 0x1000 * 2);\n");

    let output = dir.path("defsym");
    link(
        &output,
        &[&input],
        &["--defsym=__image_base=0x400000", "-T", script.to_str().unwrap()],
    )
    .unwrap();

    let bytes = std::fs::read(&output).unwrap();
    let parsed = object::read::File::parse(bytes.as_slice()).unwrap();
    let image_base = parsed
        .symbols()
        .find(|s| s.name() == Ok("__image_base"))
        .expect("defsym symbol in output");
    assert_eq!(image_base.address(), 0x40_0000);
    // Unreferenced PROVIDE symbols stay out of the output.
    assert!(!parsed.symbols().any(|s| s.name() == Ok("__heap_size")));
}

#[test]
fn test_archive_members_pulled_on_demand() {
    let dir = TestDir::new("archive");

    let mut main_obj = new_object();
    let text = main_obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    main_obj.append_section_data(text, &[0xe8, 0x00, 0x00, 0x00, 0x00, 0xc3], 16);
    add_global_func(&mut main_obj, b"_start", text, 0);
    let helper = main_obj.add_symbol(Symbol {
        name: b"helper".to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Unknown,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    });
    main_obj
        .add_relocation(
            text,
            Relocation {
                offset: 1,
                symbol: helper,
                addend: -4,
                flags: RelocationFlags::Elf {
                    r_type: object::elf::R_X86_64_PLT32,
                },
            },
        )
        .unwrap();
    let main = dir.file("main.o", &main_obj.write().unwrap());

    // helper.o defines `helper`; unused.o defines a symbol nobody wants.
    let make_member = |name: &[u8]| {
        let mut obj = new_object();
        let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
        obj.append_section_data(text, &[0xc3], 16);
        add_global_func(&mut obj, name, text, 0);
        obj.write().unwrap()
    };
    let helper_bytes = make_member(b"helper");
    let unused_bytes = make_member(b"nobody_wants_this");

    let archive_bytes = build_archive(&[
        ("helper.o", &helper_bytes, &[b"helper"]),
        ("unused.o", &unused_bytes, &[b"nobody_wants_this"]),
    ]);
    let archive = dir.file("libhelpers.a", &archive_bytes);

    let output = dir.path("archive");
    link(&output, &[&main, &archive], &[]).unwrap();

    let bytes = std::fs::read(&output).unwrap();
    let parsed = object::read::File::parse(bytes.as_slice()).unwrap();
    assert!(parsed.symbols().any(|s| s.name() == Ok("helper")));
    assert!(
        !parsed.symbols().any(|s| s.name() == Ok("nobody_wants_this")),
        "unreferenced archive members must not be pulled"
    );
}

/// Builds an ar archive with a SysV symbol index.
fn build_archive(members: &[(&str, &[u8], &[&[u8]])]) -> Vec<u8> {
    let header_size = 60usize;

    // First pass: compute member offsets. The index entry itself comes
    // right after the global header.
    let mut index_symbols: Vec<(Vec<u8>, usize)> = Vec::new();
    let mut index_size = 4;
    for (_, _, symbols) in members {
        for name in *symbols {
            index_size += 4 + name.len() + 1;
        }
    }
    let mut offset = 8 + header_size + index_size + index_size % 2;
    for (_, data, symbols) in members {
        for name in *symbols {
            index_symbols.push((name.to_vec(), offset));
        }
        offset += header_size + data.len() + data.len() % 2;
    }

    let mut index = Vec::new();
    index.extend_from_slice(&(index_symbols.len() as u32).to_be_bytes());
    for (_, member_offset) in &index_symbols {
        index.extend_from_slice(&(*member_offset as u32).to_be_bytes());
    }
    for (name, _) in &index_symbols {
        index.extend_from_slice(name);
        index.push(0);
    }

    let mut out = b"!<arch>\n".to_vec();
    let mut push_entry = |ident: &str, data: &[u8]| {
        out.extend_from_slice(format!("{ident:<16}").as_bytes());
        out.extend_from_slice(format!("{:<12}", 0).as_bytes());
        out.extend_from_slice(format!("{:<6}", 0).as_bytes());
        out.extend_from_slice(format!("{:<6}", 0).as_bytes());
        out.extend_from_slice(format!("{:<8}", 644).as_bytes());
        out.extend_from_slice(format!("{:<10}", data.len()).as_bytes());
        out.extend_from_slice(b"`\n");
        out.extend_from_slice(data);
        if data.len() % 2 == 1 {
            out.push(b'\n');
        }
    };
    push_entry("/", &index);
    for (name, data, _) in members {
        push_entry(&format!("{name}/"), data);
    }
    out
}
