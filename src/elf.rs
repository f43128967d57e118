//! Hand-rolled 64-bit little-endian ELF parser for BPF object files (§4.2).
//!
//! A generic ELF crate is deliberately not used: the section-handling
//! policy below needs exact control over how `.maps`/`maps` symbols are
//! read and how `tracepoint/...` sections are separated from their
//! relocation tables, which is easier to express directly than to bend a
//! general-purpose parser toward.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;

const SHT_SYMTAB: u32 = 2;
const SHT_REL: u32 = 9;
const SHT_RELA: u32 = 4;

const STT_OBJECT: u8 = 1;

const MAP_SPEC_BYTES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapSpec {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
}

/// A single 8-byte BPF instruction (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: u8,
    pub regs: u8,
    pub offset: i16,
    pub immediate: i32,
}

impl Instruction {
    pub fn dst_reg(&self) -> u8 {
        self.regs & 0x0f
    }

    pub fn src_reg(&self) -> u8 {
        self.regs >> 4
    }

    pub fn set_src_reg(&mut self, src_reg: u8) {
        self.regs = (self.regs & 0x0f) | (src_reg << 4);
    }

    fn from_bytes(bytes: &[u8; 8]) -> Self {
        Instruction {
            opcode: bytes[0],
            regs: bytes[1],
            offset: i16::from_le_bytes([bytes[2], bytes[3]]),
            immediate: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.opcode;
        out[1] = self.regs;
        out[2..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4..8].copy_from_slice(&self.immediate.to_le_bytes());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub instruction_index: u64,
    pub symbol_name: String,
}

/// The parsed BPF ELF image (§3 "Parsed ELF image").
#[derive(Debug, Clone)]
pub struct ParsedImage {
    pub license: String,
    pub maps: BTreeMap<String, MapSpec>,
    pub programs: BTreeMap<String, Vec<Instruction>>,
    pub relocations: BTreeMap<String, Vec<Relocation>>,
}

impl ParsedImage {
    /// Validates the cross-section invariant from §3: every relocation's
    /// symbol must name a known map before loading proceeds.
    pub fn validate(&self) -> Result<()> {
        for relocs in self.relocations.values() {
            for reloc in relocs {
                if !self.maps.contains_key(&reloc.symbol_name) {
                    return Err(Error::MissingMap(reloc.symbol_name.clone()));
                }
            }
        }
        Ok(())
    }
}

struct SectionHeader {
    name_off: u32,
    sh_type: u32,
    offset: u64,
    size: u64,
    link: u32,
    info: u32,
    entsize: u64,
}

struct Sym {
    name: String,
    shndx: u16,
    value: u64,
    info: u8,
}

fn u16le(b: &[u8], off: usize) -> Result<u16> {
    let s: [u8; 2] = b
        .get(off..off + 2)
        .ok_or_else(|| Error::malformed_elf("truncated while reading u16"))?
        .try_into()
        .unwrap();
    Ok(u16::from_le_bytes(s))
}

fn u32le(b: &[u8], off: usize) -> Result<u32> {
    let s: [u8; 4] = b
        .get(off..off + 4)
        .ok_or_else(|| Error::malformed_elf("truncated while reading u32"))?
        .try_into()
        .unwrap();
    Ok(u32::from_le_bytes(s))
}

fn u64le(b: &[u8], off: usize) -> Result<u64> {
    let s: [u8; 8] = b
        .get(off..off + 8)
        .ok_or_else(|| Error::malformed_elf("truncated while reading u64"))?
        .try_into()
        .unwrap();
    Ok(u64::from_le_bytes(s))
}

fn cstr_at(strtab: &[u8], off: usize) -> String {
    let end = strtab[off..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| off + p)
        .unwrap_or(strtab.len());
    String::from_utf8_lossy(&strtab[off..end]).into_owned()
}

/// Parses a BPF ELF image from `data`.
pub fn parse(data: &[u8]) -> Result<ParsedImage> {
    if data.len() < 64 {
        return Err(Error::malformed_elf("file shorter than an ELF header"));
    }
    if &data[0..4] != b"\x7fELF" {
        return Err(Error::malformed_elf("missing ELF magic"));
    }
    if data[EI_CLASS] != ELFCLASS64 {
        return Err(Error::malformed_elf("not a 64-bit ELF object"));
    }
    if data[EI_DATA] != ELFDATA2LSB {
        return Err(Error::malformed_elf("not little-endian (required by the BPF ABI)"));
    }

    let e_shoff = u64le(data, 0x28)? as usize;
    let e_shentsize = u16le(data, 0x3a)? as usize;
    let e_shnum = u16le(data, 0x3c)? as usize;
    let e_shstrndx = u16le(data, 0x3e)? as usize;

    if e_shentsize < 64 {
        return Err(Error::malformed_elf("section header entry too small"));
    }

    let mut sections = Vec::with_capacity(e_shnum);
    for i in 0..e_shnum {
        let base = e_shoff + i * e_shentsize;
        let hdr_bytes = data
            .get(base..base + 64)
            .ok_or_else(|| Error::malformed_elf("truncated section header"))?;
        sections.push(SectionHeader {
            name_off: u32le(hdr_bytes, 0)?,
            sh_type: u32le(hdr_bytes, 4)?,
            offset: u64le(hdr_bytes, 24)?,
            size: u64le(hdr_bytes, 32)?,
            link: u32le(hdr_bytes, 40)?,
            info: u32le(hdr_bytes, 44)?,
            entsize: u64le(hdr_bytes, 56)?,
        });
    }

    let shstrtab_hdr = sections
        .get(e_shstrndx)
        .ok_or_else(|| Error::malformed_elf("invalid section-header string table index"))?;
    let shstrtab = data
        .get(shstrtab_hdr.offset as usize..(shstrtab_hdr.offset + shstrtab_hdr.size) as usize)
        .ok_or_else(|| Error::malformed_elf("truncated section-header string table"))?;

    let section_name = |hdr: &SectionHeader| -> String { cstr_at(shstrtab, hdr.name_off as usize) };

    // Load the (first) symbol table and its string table, if present.
    let mut symbols: Vec<Sym> = Vec::new();
    for hdr in &sections {
        if hdr.sh_type != SHT_SYMTAB {
            continue;
        }
        let strtab_hdr = sections
            .get(hdr.link as usize)
            .ok_or_else(|| Error::malformed_elf("symtab sh_link out of range"))?;
        let strtab = data
            .get(strtab_hdr.offset as usize..(strtab_hdr.offset + strtab_hdr.size) as usize)
            .ok_or_else(|| Error::malformed_elf("truncated symbol string table"))?;
        let entsize = if hdr.entsize == 0 { 24 } else { hdr.entsize as usize };
        let sym_bytes = data
            .get(hdr.offset as usize..(hdr.offset + hdr.size) as usize)
            .ok_or_else(|| Error::malformed_elf("truncated symbol table"))?;
        let count = sym_bytes.len() / entsize;
        for i in 0..count {
            let s = &sym_bytes[i * entsize..i * entsize + entsize];
            let st_name = u32le(s, 0)? as usize;
            let st_info = s[4];
            let st_shndx = u16le(s, 6)?;
            let st_value = u64le(s, 8)?;
            symbols.push(Sym {
                name: cstr_at(strtab, st_name),
                shndx: st_shndx,
                value: st_value,
                info: st_info,
            });
        }
        break;
    }

    let mut maps = BTreeMap::new();
    let mut programs: BTreeMap<String, Vec<Instruction>> = BTreeMap::new();
    let mut license = String::new();
    let mut prog_section_index: BTreeMap<usize, String> = BTreeMap::new();

    for (idx, hdr) in sections.iter().enumerate() {
        let name = section_name(hdr);
        if name == "license" {
            let bytes = data
                .get(hdr.offset as usize..(hdr.offset + hdr.size) as usize)
                .ok_or_else(|| Error::malformed_elf("truncated license section"))?;
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            let raw = String::from_utf8_lossy(&bytes[..end]).into_owned();
            license = if raw.is_empty() { "GPL".to_string() } else { raw };
        } else if name == ".maps" || name == "maps" {
            let section_bytes = data
                .get(hdr.offset as usize..(hdr.offset + hdr.size) as usize)
                .ok_or_else(|| Error::malformed_elf("truncated maps section"))?;

            let map_symbols: Vec<&Sym> = symbols
                .iter()
                .filter(|s| s.shndx as usize == idx && (s.info & 0x0f) == STT_OBJECT)
                .collect();

            if map_symbols.is_empty() {
                let spec = decode_map_spec(section_bytes, 0)?;
                maps.insert("execve_events".to_string(), spec);
            } else {
                for sym in map_symbols {
                    let spec = decode_map_spec(section_bytes, sym.value as usize)?;
                    maps.insert(sym.name.clone(), spec);
                }
            }
        } else if name.starts_with("tracepoint/") {
            if hdr.size == 0 || hdr.size % 8 != 0 {
                return Err(Error::malformed_elf(format!(
                    "program section `{name}` is not a non-empty multiple of 8 bytes"
                )));
            }
            let bytes = data
                .get(hdr.offset as usize..(hdr.offset + hdr.size) as usize)
                .ok_or_else(|| Error::malformed_elf("truncated program section"))?;
            let mut instructions = Vec::with_capacity(bytes.len() / 8);
            for chunk in bytes.chunks_exact(8) {
                let arr: [u8; 8] = chunk.try_into().unwrap();
                instructions.push(Instruction::from_bytes(&arr));
            }
            prog_section_index.insert(idx, name.clone());
            programs.insert(name, instructions);
        }
    }

    if license.is_empty() {
        license = "GPL".to_string();
    }

    let mut relocations: BTreeMap<String, Vec<Relocation>> = BTreeMap::new();
    for hdr in &sections {
        if hdr.sh_type != SHT_REL && hdr.sh_type != SHT_RELA {
            continue;
        }
        let target_name = match prog_section_index.get(&(hdr.info as usize)) {
            Some(n) => n.clone(),
            None => continue,
        };
        let symtab_hdr = sections
            .get(hdr.link as usize)
            .ok_or_else(|| Error::malformed_elf("relocation sh_link out of range"))?;
        let strtab_hdr = sections
            .get(symtab_hdr.link as usize)
            .ok_or_else(|| Error::malformed_elf("symtab sh_link out of range"))?;
        let strtab = data
            .get(strtab_hdr.offset as usize..(strtab_hdr.offset + strtab_hdr.size) as usize)
            .ok_or_else(|| Error::malformed_elf("truncated symbol string table"))?;
        let sym_entsize = if symtab_hdr.entsize == 0 {
            24
        } else {
            symtab_hdr.entsize as usize
        };
        let sym_bytes = data
            .get(symtab_hdr.offset as usize..(symtab_hdr.offset + symtab_hdr.size) as usize)
            .ok_or_else(|| Error::malformed_elf("truncated symbol table"))?;

        let entsize = if hdr.entsize == 0 {
            if hdr.sh_type == SHT_RELA { 24 } else { 16 }
        } else {
            hdr.entsize as usize
        };
        let rel_bytes = data
            .get(hdr.offset as usize..(hdr.offset + hdr.size) as usize)
            .ok_or_else(|| Error::malformed_elf("truncated relocation table"))?;
        let mut list = Vec::new();
        for chunk in rel_bytes.chunks_exact(entsize) {
            let r_offset = u64le(chunk, 0)?;
            let r_info = u64le(chunk, 8)?;
            let sym_index = (r_info >> 32) as usize;
            let sym_off = sym_index * sym_entsize;
            let sym = sym_bytes
                .get(sym_off..sym_off + sym_entsize)
                .ok_or_else(|| Error::malformed_elf("relocation symbol index out of range"))?;
            let st_name = u32le(sym, 0)? as usize;
            let symbol_name = cstr_at(strtab, st_name);
            list.push(Relocation {
                instruction_index: r_offset / 8,
                symbol_name,
            });
        }
        relocations.insert(target_name, list);
    }

    Ok(ParsedImage {
        license,
        maps,
        programs,
        relocations,
    })
}

fn decode_map_spec(section_bytes: &[u8], value_off: usize) -> Result<MapSpec> {
    let bytes = section_bytes
        .get(value_off..value_off + MAP_SPEC_BYTES)
        .ok_or_else(|| Error::malformed_elf("map definition shorter than 20 bytes"))?;
    Ok(MapSpec {
        map_type: u32le(bytes, 0)?,
        key_size: u32le(bytes, 4)?,
        value_size: u32le(bytes, 8)?,
        max_entries: u32le(bytes, 12)?,
        flags: u32le(bytes, 16)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ElfBuilder {
        sections: Vec<(String, u32, Vec<u8>, u32, u32, u64)>,
    }

    impl ElfBuilder {
        fn new() -> Self {
            ElfBuilder {
                sections: vec![("".to_string(), 0, vec![], 0, 0, 0)],
            }
        }

        fn add(&mut self, name: &str, sh_type: u32, data: Vec<u8>, link: u32, info: u32, entsize: u64) -> usize {
            self.sections.push((name.to_string(), sh_type, data, link, info, entsize));
            self.sections.len() - 1
        }

        fn build(&self) -> Vec<u8> {
            // shstrtab section holding every section's name.
            let mut shstrtab = vec![0u8];
            let mut name_offsets = Vec::new();
            for (name, ..) in &self.sections {
                name_offsets.push(shstrtab.len() as u32);
                shstrtab.extend_from_slice(name.as_bytes());
                shstrtab.push(0);
            }
            let shstrndx = self.sections.len();

            let mut out = vec![0u8; 64];
            out[0..4].copy_from_slice(b"\x7fELF");
            out[EI_CLASS] = ELFCLASS64;
            out[EI_DATA] = ELFDATA2LSB;

            let mut body = Vec::new();
            let mut offsets = Vec::new();
            for (_, _, data, ..) in &self.sections {
                offsets.push(64 + body.len());
                body.extend_from_slice(data);
            }
            let shstrtab_offset = 64 + body.len();
            body.extend_from_slice(&shstrtab);

            let shoff = 64 + body.len();
            out.extend_from_slice(&body);

            let total_sections = self.sections.len() + 1;
            for i in 0..total_sections {
                let (sh_type, size, link, info, entsize, name_off, offset) = if i < self.sections.len() {
                    let (_, sh_type, data, link, info, entsize) = &self.sections[i];
                    (*sh_type, data.len() as u64, *link, *info, *entsize, name_offsets[i], offsets[i] as u64)
                } else {
                    (3u32, shstrtab.len() as u64, 0, 0, 0, 0, shstrtab_offset as u64)
                };
                let mut shdr = vec![0u8; 64];
                shdr[0..4].copy_from_slice(&name_off.to_le_bytes());
                shdr[4..8].copy_from_slice(&sh_type.to_le_bytes());
                shdr[24..32].copy_from_slice(&offset.to_le_bytes());
                shdr[32..40].copy_from_slice(&size.to_le_bytes());
                shdr[40..44].copy_from_slice(&link.to_le_bytes());
                shdr[44..48].copy_from_slice(&info.to_le_bytes());
                shdr[56..64].copy_from_slice(&entsize.to_le_bytes());
                out.extend_from_slice(&shdr);
            }

            out[0x28..0x30].copy_from_slice(&(shoff as u64).to_le_bytes());
            out[0x3a..0x3c].copy_from_slice(&64u16.to_le_bytes());
            out[0x3c..0x3e].copy_from_slice(&(total_sections as u16).to_le_bytes());
            out[0x3e..0x40].copy_from_slice(&(shstrndx as u16).to_le_bytes());
            out
        }
    }

    fn sym_entry(name_off: u32, info: u8, shndx: u16, value: u64) -> [u8; 24] {
        let mut s = [0u8; 24];
        s[0..4].copy_from_slice(&name_off.to_le_bytes());
        s[4] = info;
        s[6..8].copy_from_slice(&shndx.to_le_bytes());
        s[8..16].copy_from_slice(&value.to_le_bytes());
        s
    }

    #[test]
    fn parses_license_maps_and_program_with_relocation() {
        let mut b = ElfBuilder::new();

        let map_spec = {
            let mut v = vec![0u8; 20];
            v[0..4].copy_from_slice(&BPF_MAP_TYPE_TEST.to_le_bytes());
            v[4..8].copy_from_slice(&4u32.to_le_bytes());
            v[8..12].copy_from_slice(&8u32.to_le_bytes());
            v[12..16].copy_from_slice(&1024u32.to_le_bytes());
            v
        };
        let maps_idx = b.add(".maps", 1, map_spec, 0, 0, 0);

        // one LD_IMM64 instruction pair referencing "execve_events"
        let mut prog = vec![0u8; 16];
        prog[0] = 0x18; // LD_IMM64
        let prog_idx = b.add("tracepoint/syscalls/sys_enter_execve", 1, prog.clone(), 0, 0, 0);
        let _ = prog;

        b.add("license", 1, b"GPL\0".to_vec(), 0, 0, 0);

        // symbol table: one OBJECT symbol in .maps named "execve_events"
        let strtab_bytes = b"\0execve_events\0".to_vec();
        let strtab_idx = b.add(".strtab", 3, strtab_bytes, 0, 0, 0);
        // index 0 is the mandatory null symbol table entry.
        let mut symtab_bytes = vec![0u8; 24];
        symtab_bytes.extend_from_slice(&sym_entry(1, 0x01, maps_idx as u16, 0));
        let symtab_idx = b.add(".symtab", SHT_SYMTAB, symtab_bytes, strtab_idx as u32, 0, 24);

        // relocation table targeting the program section
        let mut rel = vec![0u8; 16];
        rel[0..8].copy_from_slice(&0u64.to_le_bytes()); // r_offset = 0 -> instr 0
        let r_info: u64 = 1 << 32; // symbol index 1
        rel[8..16].copy_from_slice(&r_info.to_le_bytes());
        b.add(".rel.tracepoint", SHT_REL, rel, symtab_idx as u32, prog_idx as u32, 16);

        let bytes = b.build();
        let image = parse(&bytes).expect("parse succeeds");

        assert_eq!(image.license, "GPL");
        let spec = image.maps.get("execve_events").expect("map present");
        assert_eq!(spec.max_entries, 1024);

        let instrs = image
            .programs
            .get("tracepoint/syscalls/sys_enter_execve")
            .expect("program present");
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].opcode, 0x18);

        let relocs = image
            .relocations
            .get("tracepoint/syscalls/sys_enter_execve")
            .expect("relocations present");
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].symbol_name, "execve_events");
        assert_eq!(relocs[0].instruction_index, 0);

        image.validate().expect("all relocations resolve");
    }

    const BPF_MAP_TYPE_TEST: u32 = 27;

    #[test]
    fn rejects_big_endian() {
        let mut b = ElfBuilder::new();
        b.add("license", 1, b"GPL\0".to_vec(), 0, 0, 0);
        let mut bytes = b.build();
        bytes[EI_DATA] = 2; // ELFDATA2MSB
        assert!(parse(&bytes).is_err());
    }

    #[test]
    fn falls_back_to_execve_events_without_symbols() {
        let mut b = ElfBuilder::new();
        let mut spec = vec![0u8; 20];
        spec[12..16].copy_from_slice(&8192u32.to_le_bytes());
        b.add(".maps", 1, spec, 0, 0, 0);
        b.add("license", 1, b"GPL\0".to_vec(), 0, 0, 0);
        let bytes = b.build();
        let image = parse(&bytes).unwrap();
        assert_eq!(image.maps["execve_events"].max_entries, 8192);
    }

    #[test]
    fn parses_an_object_loaded_from_a_real_file() {
        use std::io::Write;

        let mut b = ElfBuilder::new();
        let mut spec = vec![0u8; 20];
        spec[12..16].copy_from_slice(&4096u32.to_le_bytes());
        b.add(".maps", 1, spec, 0, 0, 0);
        b.add("license", 1, b"GPL\0".to_vec(), 0, 0, 0);
        let bytes = b.build();

        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(&bytes).expect("write temp file");

        let read_back = std::fs::read(file.path()).expect("read temp file back");
        let image = parse(&read_back).expect("parse succeeds on bytes read from disk");
        assert_eq!(image.maps["execve_events"].max_entries, 4096);
    }
}
