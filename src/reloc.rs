//! Map-fd relocation patcher (§4.4).

use std::collections::BTreeMap;

use crate::elf::{Instruction, Relocation};
use crate::error::{Error, Result};
use crate::syscall::{BPF_PSEUDO_MAP_FD, LD_IMM64};

/// Patches `instructions` in place according to `relocations`, using
/// `map_fds` to resolve each relocation's symbol to a real file
/// descriptor. Each relocation index is patched at most once; a relocation
/// list containing the same index twice would apply the patch twice, but
/// doing so is never valid input (§4.4 "must not be re-applied to the
/// same index twice") and the caller is expected not to construct one.
pub fn apply(
    instructions: &mut [Instruction],
    relocations: &[Relocation],
    map_fds: &BTreeMap<String, i32>,
) -> Result<()> {
    for reloc in relocations {
        let fd = *map_fds
            .get(&reloc.symbol_name)
            .ok_or_else(|| Error::MissingMap(reloc.symbol_name.clone()))?;

        let index = reloc.instruction_index as usize;
        if index >= instructions.len() {
            return Err(Error::malformed_elf(format!(
                "relocation index {index} out of range for {} instructions",
                instructions.len()
            )));
        }
        if instructions[index].opcode != LD_IMM64 {
            return Err(Error::malformed_elf(format!(
                "relocation at index {index} targets a non-LD_IMM64 instruction"
            )));
        }

        instructions[index].set_src_reg(BPF_PSEUDO_MAP_FD);
        instructions[index].immediate = fd;
        if index + 1 < instructions.len() {
            instructions[index + 1].immediate = 0;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ld_imm64_pair() -> [Instruction; 2] {
        [
            Instruction {
                opcode: LD_IMM64,
                regs: 0x10, // some garbage src_reg to be cleared
                offset: 0,
                immediate: 0xdead_beefu32 as i32,
            },
            Instruction {
                opcode: 0,
                regs: 0,
                offset: 0,
                immediate: 1,
            },
        ]
    }

    #[test]
    fn patches_src_reg_and_immediate() {
        let mut instrs = ld_imm64_pair();
        let relocs = vec![Relocation {
            instruction_index: 0,
            symbol_name: "execve_events".to_string(),
        }];
        let mut fds = BTreeMap::new();
        fds.insert("execve_events".to_string(), 7);

        apply(&mut instrs, &relocs, &fds).unwrap();
        assert_eq!(instrs[0].src_reg(), BPF_PSEUDO_MAP_FD);
        assert_eq!(instrs[0].immediate, 7);
        assert_eq!(instrs[1].immediate, 0);
    }

    #[test]
    fn unknown_symbol_is_missing_map() {
        let mut instrs = ld_imm64_pair();
        let relocs = vec![Relocation {
            instruction_index: 0,
            symbol_name: "nonexistent".to_string(),
        }];
        let fds = BTreeMap::new();
        assert!(matches!(
            apply(&mut instrs, &relocs, &fds),
            Err(Error::MissingMap(_))
        ));
    }

    #[test]
    fn non_ld_imm64_target_is_malformed() {
        let mut instrs = ld_imm64_pair();
        instrs[0].opcode = 0x07; // ALU64 add, not a load
        let relocs = vec![Relocation {
            instruction_index: 0,
            symbol_name: "execve_events".to_string(),
        }];
        let mut fds = BTreeMap::new();
        fds.insert("execve_events".to_string(), 7);
        assert!(matches!(
            apply(&mut instrs, &relocs, &fds),
            Err(Error::MalformedElf(_))
        ));
    }

    #[test]
    fn out_of_range_index_is_malformed() {
        let mut instrs = ld_imm64_pair();
        let relocs = vec![Relocation {
            instruction_index: 5,
            symbol_name: "execve_events".to_string(),
        }];
        let mut fds = BTreeMap::new();
        fds.insert("execve_events".to_string(), 7);
        assert!(matches!(
            apply(&mut instrs, &relocs, &fds),
            Err(Error::MalformedElf(_))
        ));
    }

    #[test]
    fn patching_is_deterministic_across_fresh_copies() {
        let relocs = vec![Relocation {
            instruction_index: 0,
            symbol_name: "execve_events".to_string(),
        }];
        let mut fds = BTreeMap::new();
        fds.insert("execve_events".to_string(), 9);

        let mut a = ld_imm64_pair();
        let mut b = ld_imm64_pair();
        apply(&mut a, &relocs, &fds).unwrap();
        apply(&mut b, &relocs, &fds).unwrap();
        assert_eq!(a, b);
    }
}
