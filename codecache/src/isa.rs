use std::fmt;

/// Instruction sets the code generators can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstructionSet {
    /// 32-bit ARM in Thumb-2 mode. Callable addresses carry the mode in bit 0.
    Thumb2,
    Arm64,
    X86,
    X86_64,
    Mips,
    Mips64,
}

#[cfg(target_arch = "arm")]
pub const RUNTIME_ISA: InstructionSet = InstructionSet::Thumb2;
#[cfg(target_arch = "aarch64")]
pub const RUNTIME_ISA: InstructionSet = InstructionSet::Arm64;
#[cfg(target_arch = "x86")]
pub const RUNTIME_ISA: InstructionSet = InstructionSet::X86;
#[cfg(target_arch = "x86_64")]
pub const RUNTIME_ISA: InstructionSet = InstructionSet::X86_64;
#[cfg(target_arch = "mips")]
pub const RUNTIME_ISA: InstructionSet = InstructionSet::Mips;
#[cfg(target_arch = "mips64")]
pub const RUNTIME_ISA: InstructionSet = InstructionSet::Mips64;
#[cfg(not(any(
    target_arch = "arm",
    target_arch = "aarch64",
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "mips",
    target_arch = "mips64"
)))]
compile_error!("no code generator targets this architecture");

/// Alignment that suits every instruction set, and the granule of the code
/// region allocator.
pub const JIT_CODE_ALIGNMENT: usize = 16;

impl InstructionSet {
    /// Required alignment of a method's first instruction.
    pub const fn alignment(self) -> usize {
        match self {
            InstructionSet::Thumb2 | InstructionSet::Mips => 8,
            InstructionSet::Arm64
            | InstructionSet::X86
            | InstructionSet::X86_64
            | InstructionSet::Mips64 => 16,
        }
    }

    /// Offset added to a code address to form a callable entry point.
    pub const fn code_delta(self) -> usize {
        match self {
            InstructionSet::Thumb2 => 1,
            _ => 0,
        }
    }

    /// Whether return addresses and entry points are offset by the mode bit.
    pub const fn has_mode_bit(self) -> bool {
        self.code_delta() != 0
    }

    pub const fn is_64bit(self) -> bool {
        matches!(
            self,
            InstructionSet::Arm64 | InstructionSet::X86_64 | InstructionSet::Mips64
        )
    }
}

impl fmt::Display for InstructionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstructionSet::Thumb2 => "thumb2",
            InstructionSet::Arm64 => "arm64",
            InstructionSet::X86 => "x86",
            InstructionSet::X86_64 => "x86_64",
            InstructionSet::Mips => "mips",
            InstructionSet::Mips64 => "mips64",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [InstructionSet; 6] = [
        InstructionSet::Thumb2,
        InstructionSet::Arm64,
        InstructionSet::X86,
        InstructionSet::X86_64,
        InstructionSet::Mips,
        InstructionSet::Mips64,
    ];

    #[test]
    fn alignment_divides_jit_alignment() {
        for isa in ALL {
            assert!(isa.alignment().is_power_of_two());
            assert_eq!(JIT_CODE_ALIGNMENT % isa.alignment(), 0, "{isa}");
        }
    }

    #[test]
    fn only_thumb_has_mode_bit() {
        for isa in ALL {
            assert_eq!(isa.has_mode_bit(), isa == InstructionSet::Thumb2);
        }
        assert_eq!(InstructionSet::Thumb2.code_delta(), 1);
    }
}
