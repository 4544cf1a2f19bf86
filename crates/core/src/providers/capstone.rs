//! Facts straight from a binary: goblin for the container, capstone for the code.
//!
//! Imports and exports become global symbol facts, function symbols become procedures,
//! and each procedure is disassembled (bounded by the instruction budget) into
//! instruction, immediate-constant, and call facts. Printable strings from read-only data
//! are attributed to the procedure that references them, or left global otherwise.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use capstone::arch::{self, ArchOperand};
use capstone::{prelude::*, Capstone, InsnDetail, InsnGroupId, InsnGroupType};
use goblin::{elf, mach, pe, Object};
use tracing::debug;

use super::{binary_identifier, read_input, FactAccessError, FactProvider, FactRequest};
use crate::model::{Fact, FactKind, FactModel, Location, NumericConstant, SymbolKind};

const DEFAULT_MAX_INSTRUCTIONS: usize = 4096;
const MIN_STRING_LEN: usize = 4;

/// Sections whose contents are scanned for printable strings.
const STRING_SECTIONS: [&str; 7] = [
    ".rodata",
    ".rdata",
    "__cstring",
    "__const",
    "__objc_methname",
    "__objc_classname",
    "__oslogstring",
];

pub struct CapstoneProvider;

#[derive(Debug, Clone)]
struct SectionRange {
    name: String,
    start: u64,
    end: u64,
    file_offset: usize,
    executable: bool,
}

impl SectionRange {
    fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// File slice for `[addr, addr + len)`, clipped to the section and the file.
    fn file_range(&self, addr: u64, len: Option<u64>, bytes_len: usize) -> Option<(usize, usize)> {
        if !self.contains(addr) {
            return None;
        }
        let available = self.end - addr;
        let length = len.unwrap_or(available).min(available);
        let start = self.file_offset.checked_add((addr - self.start) as usize)?;
        let end = start.saturating_add(length as usize).min(bytes_len);
        (start < end).then_some((start, end))
    }
}

#[derive(Debug, Clone)]
struct Procedure {
    name: String,
    address: u64,
    size: Option<u64>,
    /// ELF section index, used to look up relocation-named call targets.
    section_index: Option<usize>,
}

/// Container-level view of one binary.
#[derive(Debug, Default)]
struct Image {
    arch: Option<&'static str>,
    sections: Vec<SectionRange>,
    procedures: Vec<Procedure>,
    imports: Vec<(String, u64)>,
    exports: Vec<(String, u64)>,
    /// Address -> name for call targets (functions, import slots).
    names: HashMap<u64, String>,
    /// (section index, offset) -> symbol named by a relocation at that offset.
    relocations: HashMap<(usize, u64), String>,
    entry: Option<u64>,
}

fn elf_arch(machine: u16) -> Option<&'static str> {
    match machine {
        elf::header::EM_X86_64 => Some("x86_64"),
        elf::header::EM_386 => Some("x86"),
        elf::header::EM_AARCH64 => Some("arm64"),
        elf::header::EM_ARM => Some("arm"),
        _ => None,
    }
}

fn pe_arch(machine: u16) -> Option<&'static str> {
    match machine {
        pe::header::COFF_MACHINE_X86 => Some("x86"),
        pe::header::COFF_MACHINE_X86_64 => Some("x86_64"),
        pe::header::COFF_MACHINE_ARM => Some("arm"),
        pe::header::COFF_MACHINE_ARM64 => Some("arm64"),
        _ => None,
    }
}

fn mach_arch(cputype: u32) -> Option<&'static str> {
    match cputype {
        mach::cputype::CPU_TYPE_X86 => Some("x86"),
        mach::cputype::CPU_TYPE_X86_64 => Some("x86_64"),
        mach::cputype::CPU_TYPE_ARM => Some("arm"),
        mach::cputype::CPU_TYPE_ARM64 => Some("arm64"),
        _ => None,
    }
}

/// ELF, PE, Mach-O (thin or fat) and ar magics; anything else may be a raw code blob.
fn has_container_magic(bytes: &[u8]) -> bool {
    const MACH_MAGICS: [u32; 4] = [0xfeed_face, 0xfeed_facf, 0xcafe_babe, 0xcafe_babf];
    if bytes.starts_with(b"\x7fELF") || bytes.starts_with(b"MZ") || bytes.starts_with(b"!<arch>") {
        return true;
    }
    let Some(head) = bytes.get(..4) else { return false };
    let head = [head[0], head[1], head[2], head[3]];
    let (le, be) = (u32::from_le_bytes(head), u32::from_be_bytes(head));
    MACH_MAGICS.contains(&le) || MACH_MAGICS.contains(&be)
}

fn make_cs(name: &str) -> Result<Capstone, FactAccessError> {
    let built = match name {
        "x86_64" | "amd64" => {
            Capstone::new().x86().mode(arch::x86::ArchMode::Mode64).detail(true).build()
        }
        "x86" | "i386" => {
            Capstone::new().x86().mode(arch::x86::ArchMode::Mode32).detail(true).build()
        }
        "arm" | "armv7" => {
            Capstone::new().arm().mode(arch::arm::ArchMode::Arm).detail(true).build()
        }
        "arm64" | "aarch64" => {
            Capstone::new().arm64().mode(arch::arm64::ArchMode::Arm).detail(true).build()
        }
        other => return Err(FactAccessError::UnsupportedFormat(format!("architecture '{other}'"))),
    };
    built.map_err(|e| FactAccessError::Backend(format!("capstone init failed for {name}: {e}")))
}

fn elf_image(elf: &elf::Elf) -> Image {
    let mut image = Image { arch: elf_arch(elf.header.e_machine), ..Image::default() };

    for sh in &elf.section_headers {
        let name = elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string();
        image.sections.push(SectionRange {
            name,
            start: sh.sh_addr,
            end: sh.sh_addr.saturating_add(sh.sh_size),
            file_offset: sh.sh_offset as usize,
            executable: sh.is_executable(),
        });
    }

    let mut seen_imports = BTreeSet::new();
    let tables = [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)];
    for (syms, strtab) in tables {
        for sym in syms.iter() {
            let Some(name) = strtab.get_at(sym.st_name).filter(|n| !n.is_empty()) else {
                continue;
            };
            let undefined = sym.st_shndx == elf::section_header::SHN_UNDEF as usize;
            if undefined {
                if sym.st_type() != elf::sym::STT_SECTION && seen_imports.insert(name.to_string()) {
                    image.imports.push((name.to_string(), 0));
                }
                continue;
            }
            if !sym.is_function() {
                continue;
            }
            if sym.st_bind() != elf::sym::STB_LOCAL {
                image.exports.push((name.to_string(), sym.st_value));
            }
            image.names.entry(sym.st_value).or_insert_with(|| name.to_string());
            image.procedures.push(Procedure {
                name: name.to_string(),
                address: sym.st_value,
                size: (sym.st_size > 0).then_some(sym.st_size),
                section_index: Some(sym.st_shndx),
            });
        }
    }

    // Relocatable objects name call targets through relocations against the code section.
    for (reloc_idx, relocs) in &elf.shdr_relocs {
        let Some(target) = elf.section_headers.get(*reloc_idx).map(|sh| sh.sh_info as usize) else {
            continue;
        };
        for reloc in relocs.iter() {
            let name = elf
                .syms
                .get(reloc.r_sym)
                .and_then(|sym| elf.strtab.get_at(sym.st_name))
                .filter(|n| !n.is_empty());
            if let Some(name) = name {
                image.relocations.insert((target, reloc.r_offset), name.to_string());
            }
        }
    }

    image.entry = (elf.entry != 0).then_some(elf.entry);
    image
}

fn pe_image(pe: &pe::PE) -> Image {
    let mut image = Image { arch: pe_arch(pe.header.coff_header.machine), ..Image::default() };

    for sec in &pe.sections {
        let size = if sec.virtual_size == 0 { sec.size_of_raw_data } else { sec.virtual_size };
        image.sections.push(SectionRange {
            name: sec.name().unwrap_or_default().to_string(),
            start: sec.virtual_address as u64,
            end: sec.virtual_address as u64 + size as u64,
            file_offset: sec.pointer_to_raw_data as usize,
            executable: sec.characteristics & pe::section_table::IMAGE_SCN_MEM_EXECUTE != 0,
        });
    }

    // Addresses are RVAs throughout, so RIP-relative IAT loads resolve against import slots.
    for import in &pe.imports {
        let name = import.name.to_string();
        image.names.insert(import.rva as u64, name.clone());
        image.imports.push((name, import.rva as u64));
    }
    for export in &pe.exports {
        let Some(name) = export.name.filter(|n| !n.is_empty()) else { continue };
        if export.rva == 0 {
            continue;
        }
        let address = export.rva as u64;
        image.exports.push((name.to_string(), address));
        image.names.entry(address).or_insert_with(|| name.to_string());
        image.procedures.push(Procedure {
            name: name.to_string(),
            address,
            size: None,
            section_index: None,
        });
    }

    image.entry = (pe.entry != 0).then_some(pe.entry as u64);
    image
}

fn mach_image(bin: &mach::MachO) -> Image {
    let mut image = Image { arch: mach_arch(bin.header.cputype()), ..Image::default() };

    for (sec, _) in bin.segments.sections().flatten().filter_map(Result::ok) {
        let segname = sec.segname().unwrap_or("");
        image.sections.push(SectionRange {
            name: sec.name().unwrap_or("").to_string(),
            start: sec.addr,
            end: sec.addr.saturating_add(sec.size),
            file_offset: sec.offset as usize,
            executable: segname == "__TEXT" && sec.name().is_ok_and(|n| n == "__text"),
        });
    }

    if let Ok(imports) = bin.imports() {
        for import in imports {
            image.imports.push((import.name.to_string(), import.address));
        }
    }
    if let Ok(exports) = bin.exports() {
        for export in exports {
            image.exports.push((export.name.clone(), export.offset));
        }
    }

    let code: Vec<SectionRange> = image.sections.iter().filter(|s| s.executable).cloned().collect();
    for sym in bin.symbols() {
        let Ok((name, nlist)) = sym else { continue };
        if name.is_empty() || nlist.is_stab() || nlist.is_undefined() || nlist.n_value == 0 {
            continue;
        }
        if !code.iter().any(|s| s.contains(nlist.n_value)) {
            continue;
        }
        image.names.entry(nlist.n_value).or_insert_with(|| name.to_string());
        image.procedures.push(Procedure {
            name: name.to_string(),
            address: nlist.n_value,
            size: None,
            section_index: None,
        });
    }

    image.entry = (bin.entry != 0).then_some(bin.entry);
    image
}

/// Fill in missing sizes from the next procedure start (or the section end), and drop
/// aliases that share a start address.
fn settle_procedures(image: &mut Image) {
    image.procedures.sort_by(|a, b| a.address.cmp(&b.address).then(a.name.cmp(&b.name)));
    image.procedures.dedup_by(|later, first| later.address == first.address);
    let starts: Vec<u64> = image.procedures.iter().map(|p| p.address).collect();
    for (idx, proc) in image.procedures.iter_mut().enumerate() {
        if proc.size.is_some() {
            continue;
        }
        let section_end = image.sections.iter().find(|s| s.contains(proc.address)).map(|s| s.end);
        let next = starts.get(idx + 1).copied();
        proc.size = match (next, section_end) {
            (Some(n), Some(end)) => Some(n.min(end) - proc.address),
            (Some(n), None) => Some(n - proc.address),
            (None, Some(end)) => Some(end - proc.address),
            (None, None) => None,
        };
    }
}

/// Printable runs of at least [`MIN_STRING_LEN`] bytes from read-only data sections.
fn collect_strings(image: &Image, bytes: &[u8]) -> BTreeMap<u64, String> {
    let mut out = BTreeMap::new();
    for sec in &image.sections {
        if !STRING_SECTIONS.iter().any(|prefix| sec.name.starts_with(prefix)) {
            continue;
        }
        let Some((start, end)) = sec.file_range(sec.start, None, bytes.len()) else { continue };
        let data = &bytes[start..end];
        let mut run_start = None;
        for (i, b) in data.iter().enumerate() {
            let printable = b.is_ascii_graphic() || *b == b' ' || *b == b'\t';
            match (printable, run_start) {
                (true, None) => run_start = Some(i),
                (false, Some(s)) => {
                    if i - s >= MIN_STRING_LEN {
                        let text = String::from_utf8_lossy(&data[s..i]).into_owned();
                        out.insert(sec.start + s as u64, text);
                    }
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = run_start {
            if data.len() - s >= MIN_STRING_LEN {
                out.insert(sec.start + s as u64, String::from_utf8_lossy(&data[s..]).into_owned());
            }
        }
    }
    out
}

/// Immediate operands (with operand position) and RIP-relative memory targets.
fn operand_values(detail: &InsnDetail, next_address: u64, op_str: &str) -> (Vec<(u8, u64)>, Option<u64>) {
    let mut immediates = Vec::new();
    let mut rip_target = None;
    for (idx, op) in detail.arch_detail().operands().iter().enumerate() {
        let idx = idx.min(u8::MAX as usize) as u8;
        match op {
            ArchOperand::X86Operand(op) => match &op.op_type {
                arch::x86::X86OperandType::Imm(imm) => immediates.push((idx, *imm as u64)),
                arch::x86::X86OperandType::Mem(mem) if op_str.contains("rip") => {
                    rip_target = Some(next_address.wrapping_add(mem.disp() as u64));
                }
                _ => {}
            },
            ArchOperand::ArmOperand(op) => {
                if let arch::arm::ArmOperandType::Imm(imm) = op.op_type {
                    immediates.push((idx, imm as i64 as u64));
                }
            }
            ArchOperand::Arm64Operand(op) => {
                if let arch::arm64::Arm64OperandType::Imm(imm) = op.op_type {
                    immediates.push((idx, imm as u64));
                }
            }
            _ => {}
        }
    }
    (immediates, rip_target)
}

fn has_group(detail: &InsnDetail, group: InsnGroupType::Type) -> bool {
    detail.groups().iter().any(|g| *g == InsnGroupId(group as u8))
}

struct Disassembly<'a> {
    cs: &'a Capstone,
    image: &'a Image,
    strings: &'a BTreeMap<u64, String>,
    budget: usize,
}

impl Disassembly<'_> {
    /// Emit facts for one procedure; returns the string addresses it referenced.
    fn procedure(
        &self,
        proc: &Procedure,
        code: &[u8],
        facts: &mut Vec<Fact>,
    ) -> Result<BTreeSet<u64>, FactAccessError> {
        let mut referenced = BTreeSet::new();
        let insns = self.cs.disasm_count(code, proc.address, self.budget).map_err(|e| {
            FactAccessError::Backend(format!(
                "disassembly of {} at 0x{:x} failed: {e}",
                proc.name, proc.address
            ))
        })?;

        for insn in insns.iter() {
            let address = insn.address();
            let at = || Location::in_procedure(proc.name.clone(), address);
            let mnemonic = insn.mnemonic().unwrap_or("");
            let op_str = insn.op_str().unwrap_or("");
            facts.push(Fact::instruction(at(), mnemonic, op_str));

            let Ok(detail) = self.cs.insn_detail(insn) else { continue };
            let next_address = address + insn.bytes().len() as u64;
            let (immediates, rip_target) = operand_values(&detail, next_address, op_str);
            let is_call = has_group(&detail, InsnGroupType::CS_GRP_CALL);

            if is_call {
                let target = immediates.first().map(|(_, v)| *v).or(rip_target);
                let name = self.call_name(proc, address, next_address, target);
                facts.push(Fact::call(at(), target.unwrap_or_default(), name));
            } else {
                for (idx, value) in &immediates {
                    facts.push(Fact::new(
                        at(),
                        FactKind::Number(NumericConstant { value: *value, operand_index: Some(*idx) }),
                    ));
                }
            }

            for candidate in immediates.iter().map(|(_, v)| *v).chain(rip_target) {
                if let Some(value) = self.strings.get(&candidate) {
                    referenced.insert(candidate);
                    facts.push(Fact::string(at(), value.clone()));
                }
            }
        }
        Ok(referenced)
    }

    fn call_name(
        &self,
        proc: &Procedure,
        address: u64,
        next_address: u64,
        target: Option<u64>,
    ) -> Option<String> {
        if let Some(section) = proc.section_index {
            let relocated = (address..next_address)
                .find_map(|offset| self.image.relocations.get(&(section, offset)));
            if let Some(name) = relocated {
                return Some(name.clone());
            }
        }
        target.and_then(|t| self.image.names.get(&t)).cloned()
    }
}

impl FactProvider for CapstoneProvider {
    fn facts(&self, request: &FactRequest) -> Result<FactModel, FactAccessError> {
        let bytes = read_input(&request.path)?;
        if bytes.is_empty() {
            return Err(FactAccessError::Malformed {
                path: request.path.clone(),
                message: "file is empty".into(),
            });
        }
        let budget = request.max_instructions.unwrap_or(DEFAULT_MAX_INSTRUCTIONS);
        if budget == 0 {
            return Err(FactAccessError::Backend(
                "instruction budget must be at least 1".into(),
            ));
        }
        let binary_id = binary_identifier(&request.path, &bytes);

        let mut image = match Object::parse(&bytes) {
            Ok(Object::Elf(elf)) => elf_image(&elf),
            Ok(Object::PE(pe)) => pe_image(&pe),
            Ok(Object::Mach(mach::Mach::Binary(bin))) => mach_image(&bin),
            Ok(Object::Mach(mach::Mach::Fat(_))) => {
                return Err(FactAccessError::UnsupportedFormat(
                    "universal (fat) Mach-O; extract a single architecture first".into(),
                ))
            }
            // Anything goblin does not recognise is treated as a raw code blob.
            Ok(_) => Image::default(),
            Err(_) if !has_container_magic(&bytes) => Image::default(),
            Err(e) => {
                return Err(FactAccessError::Malformed {
                    path: request.path.clone(),
                    message: e.to_string(),
                })
            }
        };

        let raw_blob = image.sections.is_empty();
        if raw_blob {
            image.sections.push(SectionRange {
                name: "blob".into(),
                start: 0,
                end: bytes.len() as u64,
                file_offset: 0,
                executable: true,
            });
            image.procedures.push(Procedure {
                name: "sub_0".into(),
                address: 0,
                size: Some(bytes.len() as u64),
                section_index: None,
            });
        } else if image.procedures.is_empty() {
            if let Some(entry) = image.entry {
                image.procedures.push(Procedure {
                    name: "entry".into(),
                    address: entry,
                    size: None,
                    section_index: None,
                });
            }
        }
        settle_procedures(&mut image);

        let arch_name = request
            .arch
            .as_deref()
            .map(str::to_lowercase)
            .or_else(|| image.arch.map(str::to_string))
            .unwrap_or_else(|| "x86_64".to_string());
        let cs = make_cs(&arch_name)?;

        let mut facts = Vec::new();
        for (name, address) in &image.imports {
            facts.push(Fact::symbol(Location::global(*address), name.clone(), SymbolKind::Import));
        }
        for (name, address) in &image.exports {
            facts.push(Fact::symbol(Location::global(*address), name.clone(), SymbolKind::Export));
        }

        let strings = collect_strings(&image, &bytes);
        let pass = Disassembly {
            cs: &cs,
            image: &image,
            strings: &strings,
            budget,
        };

        let mut referenced = BTreeSet::new();
        for proc in &image.procedures {
            let range = image
                .sections
                .iter()
                .enumerate()
                .filter(|(idx, _)| proc.section_index.map_or(true, |want| want == *idx))
                .find_map(|(_, sec)| sec.file_range(proc.address, proc.size, bytes.len()));
            let Some((start, end)) = range else { continue };
            referenced.extend(pass.procedure(proc, &bytes[start..end], &mut facts)?);
        }

        for (address, value) in &strings {
            if !referenced.contains(address) {
                facts.push(Fact::string(Location::global(*address), value.clone()));
            }
        }

        debug!(
            binary = %binary_id,
            arch = %arch_name,
            procedures = image.procedures.len(),
            facts = facts.len(),
            "capstone facts collected"
        );
        Ok(FactModel::new(binary_id, facts))
    }

    fn name(&self) -> &'static str {
        "capstone"
    }
}
