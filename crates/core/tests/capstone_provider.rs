#![cfg(feature = "capstone-backend")]

use std::path::PathBuf;

use object::write::{Object, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind as ObjSymbolKind,
    SymbolScope,
};
use sigscope_core::model::{FactKind, Scope};
use sigscope_core::providers::{CapstoneProvider, FactAccessError, FactProvider, FactRequest};
use sigscope_core::{Category, Registry};
use tempfile::TempDir;

fn write_fixture(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn function(obj: &mut Object<'_>, name: &str, section: object::write::SectionId, value: u64, size: u64) {
    obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value,
        size,
        kind: ObjSymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(section),
        flags: SymbolFlags::Elf { st_info: 0x12, st_other: 0 },
    });
}

/// `main` loads PT_DENY_ATTACH and calls a local `ptrace`; `.rodata` carries "LLDB".
fn anti_debug_elf() -> Vec<u8> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    obj.section_mut(text).set_data(
        vec![
            0xbf, 0x1f, 0x00, 0x00, 0x00, // mov edi, 0x1f
            0xe8, 0x01, 0x00, 0x00, 0x00, // call ptrace
            0xc3, // ret
            0x31, 0xc0, // xor eax, eax
            0xc3, // ret
        ],
        16,
    );
    let rodata = obj.add_section(Vec::new(), b".rodata".to_vec(), SectionKind::ReadOnlyData);
    obj.section_mut(rodata).append_data(b"LLDB\x00", 1);

    function(&mut obj, "main", text, 0, 11);
    function(&mut obj, "ptrace", text, 11, 3);
    obj.write().unwrap()
}

#[test]
fn elf_fixture_yields_procedure_scoped_facts() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(&dir, "fixture_elf", &anti_debug_elf());

    let model = CapstoneProvider.facts(&FactRequest::new(&path)).expect("elf facts");
    assert!(model.binary_id().starts_with("fixture_elf@sha256:"));
    assert_eq!(model.procedures(), vec!["main", "ptrace"]);

    let in_main = |fact: &&sigscope_core::model::Fact| fact.scope() == &Scope::procedure("main");
    assert!(model.facts().iter().filter(in_main).any(|f| matches!(
        &f.kind,
        FactKind::Xref(x) if x.target == 11 && x.target_name.as_deref() == Some("ptrace")
    )));
    assert!(model
        .facts()
        .iter()
        .filter(in_main)
        .any(|f| matches!(&f.kind, FactKind::Number(n) if n.value == 31)));
    assert!(model.facts().iter().any(|f| f.scope() == &Scope::Global
        && matches!(&f.kind, FactKind::String(s) if s.value == "LLDB")));
    assert!(model.facts().iter().any(|f| matches!(
        &f.kind,
        FactKind::Symbol(s) if s.name == "main"
    )));

    let registry = Registry::load().unwrap();
    let raw = registry.index_for(Category::AntiDebug).unwrap().scan(&model);
    assert!(raw.iter().any(|m| m.signature_id == "anti_debug.ptrace_deny_attach"
        && m.location.scope == Scope::procedure("main")));
    // The global string never joins a procedure-scoped conjunction.
    assert!(raw
        .iter()
        .any(|m| m.signature_id == "anti_debug.debugger_strings" && m.location.scope == Scope::Global));
}

#[test]
fn raw_blob_becomes_one_procedure() {
    let dir = tempfile::tempdir().unwrap();
    // mov eax, 0x2000004 ; syscall ; ret
    let path = write_fixture(&dir, "blob.bin", &[0xb8, 0x04, 0x00, 0x00, 0x02, 0x0f, 0x05, 0xc3]);

    let mut request = FactRequest::new(&path);
    request.arch = Some("x86_64".into());
    let model = CapstoneProvider.facts(&request).expect("blob facts");

    assert_eq!(model.procedures(), vec!["sub_0"]);
    let mnemonics: Vec<&str> = model
        .facts()
        .iter()
        .filter_map(|f| match &f.kind {
            FactKind::Instruction(i) => Some(i.mnemonic.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(mnemonics, vec!["mov", "syscall", "ret"]);
    assert!(model
        .facts()
        .iter()
        .any(|f| matches!(&f.kind, FactKind::Number(n) if n.value == 0x200_0004)));
}

#[test]
fn instruction_budget_caps_disassembly() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_fixture(&dir, "nops.bin", &[0x90; 64]);
    let mut request = FactRequest::new(&path);
    request.max_instructions = Some(8);
    let model = CapstoneProvider.facts(&request).unwrap();
    assert_eq!(model.counts().instructions, 8);
}

#[test]
fn unusable_inputs_are_rejected() {
    let dir = tempfile::tempdir().unwrap();

    let empty = write_fixture(&dir, "empty.bin", &[]);
    assert!(matches!(
        CapstoneProvider.facts(&FactRequest::new(&empty)).unwrap_err(),
        FactAccessError::Malformed { .. }
    ));

    let mut truncated = b"\x7fELF\x02\x01\x01".to_vec();
    truncated.resize(20, 0);
    let truncated = write_fixture(&dir, "truncated.elf", &truncated);
    assert!(matches!(
        CapstoneProvider.facts(&FactRequest::new(&truncated)).unwrap_err(),
        FactAccessError::Malformed { .. }
    ));

    let blob = write_fixture(&dir, "blob.bin", &[0x90; 4]);
    let mut request = FactRequest::new(&blob);
    request.arch = Some("z80".into());
    assert!(matches!(
        CapstoneProvider.facts(&request).unwrap_err(),
        FactAccessError::UnsupportedFormat(msg) if msg.contains("z80")
    ));

    let missing = dir.path().join("missing.bin");
    assert!(matches!(
        CapstoneProvider.facts(&FactRequest::new(&missing)).unwrap_err(),
        FactAccessError::MissingBinary(_)
    ));
}

#[test]
fn zero_instruction_budget_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    // rdtsc ; rdtsc ; ret
    let path = write_fixture(&dir, "timing.bin", &[0x0f, 0x31, 0x0f, 0x31, 0xc3]);

    let mut request = FactRequest::new(&path);
    request.arch = Some("x86_64".into());
    let model = CapstoneProvider.facts(&request).unwrap();
    assert_eq!(model.counts().instructions, 3);

    request.max_instructions = Some(0);
    let err = CapstoneProvider.facts(&request).unwrap_err();
    assert!(matches!(&err, FactAccessError::Backend(msg) if msg.contains("instruction budget")));
}
