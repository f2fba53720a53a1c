// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Identification of the executing processor.

#![cfg(target_arch = "x86_64")]
// UNSAFETY: Calling the cpuid intrinsic.
#![expect(unsafe_code)]

use crate::CpuVendor;
use crate::LogicalCpu;
use core::arch::x86_64::CpuidResult;

fn cpuid(eax: u32, ecx: u32) -> CpuidResult {
    // SAFETY: this instruction is always safe to invoke. If the instruction is
    // for some reason not supported, the process will fault in an OS-specific
    // way, but this will not cause memory safety violations.
    unsafe { core::arch::x86_64::__cpuid_count(eax, ecx) }
}

/// Reads the vendor string and initial APIC ID of the executing processor.
pub(crate) fn current() -> LogicalCpu {
    let leaf0 = cpuid(0, 0);
    let mut vendor = [0; 12];
    vendor[0..4].copy_from_slice(&leaf0.ebx.to_le_bytes());
    vendor[4..8].copy_from_slice(&leaf0.edx.to_le_bytes());
    vendor[8..12].copy_from_slice(&leaf0.ecx.to_le_bytes());

    let leaf1 = cpuid(1, 0);
    LogicalCpu {
        vendor: CpuVendor(vendor),
        apic_id: (leaf1.ebx >> 24) as u8,
    }
}
