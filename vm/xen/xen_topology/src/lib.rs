// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Processor topology of a Xen guest.
//!
//! The event channel drivers address per-processor hypervisor state by the
//! hypervisor's virtual CPU index, which for HVM guests is the ACPI processor
//! ID the MADT assigns to each local APIC. [`SystemTopology`] captures that
//! mapping once, at driver start, and is then passed to every component that
//! needs it.

mod cpuid;
pub mod madt;

use thiserror::Error;

#[allow(non_camel_case_types)]
mod packed_nums {
    pub type u32_le = zerocopy::U32<zerocopy::LittleEndian>;
}

/// The hypervisor's index for a virtual CPU.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VpIndex(u32);

impl VpIndex {
    /// Returns `index` as a VP index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// VP index zero, the boot processor.
    pub const BSP: Self = Self::new(0);

    /// Returns the VP index value.
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for VpIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// The CPUID vendor identification string, e.g. `GenuineIntel`.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct CpuVendor(pub [u8; 12]);

impl std::fmt::Display for CpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl std::fmt::Debug for CpuVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// The identity of one logical processor as reported by the processor
/// itself.
#[derive(Copy, Clone, Debug)]
pub struct LogicalCpu {
    /// The CPUID vendor string.
    pub vendor: CpuVendor,
    /// The initial APIC ID.
    pub apic_id: u8,
}

impl LogicalCpu {
    /// Returns a processor description.
    pub fn new(vendor: &[u8; 12], apic_id: u8) -> Self {
        Self {
            vendor: CpuVendor(*vendor),
            apic_id,
        }
    }

    /// Probes the processor this is called on.
    ///
    /// Callers enumerating the system must run this on each processor in
    /// turn.
    #[cfg(target_arch = "x86_64")]
    pub fn current() -> Self {
        cpuid::current()
    }
}

/// Information about a logical processor.
#[derive(Copy, Clone, Debug)]
pub struct CpuInfo {
    /// The guest's logical processor number.
    pub index: u32,
    /// The CPUID vendor string.
    pub vendor: CpuVendor,
    /// The initial APIC ID.
    pub apic_id: u8,
    /// The ACPI processor ID, which is also the hypervisor's VP index.
    pub processor_id: u8,
}

impl CpuInfo {
    /// Returns the hypervisor's index for this processor.
    pub fn vp_index(&self) -> VpIndex {
        VpIndex::new(self.processor_id.into())
    }
}

/// Error returned when building a [`SystemTopology`].
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The MADT could not be parsed.
    #[error("failed to parse the MADT")]
    Madt(#[from] madt::ParseMadtError),
    /// No processors were provided.
    #[error("must have at least one processor")]
    NoProcessors,
    /// A processor's APIC ID has no MADT entry.
    #[error("processor {cpu} has APIC ID {apic_id:#x}, which is not in the MADT")]
    UnknownApicId {
        /// The logical processor number.
        cpu: u32,
        /// The processor's APIC ID.
        apic_id: u8,
    },
}

/// The processor topology of the running guest.
#[derive(Debug, Clone)]
pub struct SystemTopology {
    cpus: Vec<CpuInfo>,
}

impl SystemTopology {
    /// Builds the topology from the raw MADT and the identity of each logical
    /// processor, in logical processor order.
    pub fn new(
        raw_madt: &[u8],
        cpus: impl IntoIterator<Item = LogicalCpu>,
    ) -> Result<Self, TopologyError> {
        let mut apics = Vec::new();
        madt::parse_madt(raw_madt, |apic| {
            apics.push((apic.apic_id, apic.acpi_processor_id))
        })?;

        let cpus = cpus
            .into_iter()
            .enumerate()
            .map(|(index, cpu)| -> Result<CpuInfo, TopologyError> {
                let index = index as u32;
                let processor_id = apics
                    .iter()
                    .find_map(|&(apic_id, processor_id)| {
                        (apic_id == cpu.apic_id).then_some(processor_id)
                    })
                    .ok_or(TopologyError::UnknownApicId {
                        cpu: index,
                        apic_id: cpu.apic_id,
                    })?;

                tracing::info!(
                    cpu = index,
                    vendor = %cpu.vendor,
                    apic_id = cpu.apic_id,
                    processor_id,
                    "processor identified"
                );

                Ok(CpuInfo {
                    index,
                    vendor: cpu.vendor,
                    apic_id: cpu.apic_id,
                    processor_id,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if cpus.is_empty() {
            return Err(TopologyError::NoProcessors);
        }

        Ok(Self { cpus })
    }

    /// Returns the number of logical processors.
    pub fn cpu_count(&self) -> u32 {
        self.cpus.len() as u32
    }

    /// Returns the logical processors, in logical processor order.
    pub fn cpus(&self) -> &[CpuInfo] {
        &self.cpus
    }

    /// Returns the hypervisor's index for logical processor `cpu`.
    ///
    /// Panics if `cpu` is not a processor of this topology.
    pub fn virtual_cpu_index(&self, cpu: u32) -> VpIndex {
        let Some(info) = self.cpus.get(cpu as usize) else {
            panic!(
                "processor {cpu} out of range, {} processors",
                self.cpus.len()
            );
        };
        info.vp_index()
    }

    /// Returns one more than the largest VP index, for sizing tables indexed
    /// by VP.
    pub fn vp_index_limit(&self) -> u32 {
        self.cpus
            .iter()
            .map(|cpu| cpu.vp_index().index() + 1)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::madt::MadtBuilder;

    const VENDOR: &[u8; 12] = b"GenuineIntel";

    #[test]
    fn maps_apic_ids_to_vp_indices() {
        let table = MadtBuilder::new()
            .local_apic(0, 0)
            .local_apic(1, 2)
            .local_apic(5, 4)
            .build();

        let topology = SystemTopology::new(
            &table,
            [
                LogicalCpu::new(VENDOR, 0),
                LogicalCpu::new(VENDOR, 4),
                LogicalCpu::new(VENDOR, 2),
            ],
        )
        .unwrap();

        assert_eq!(topology.cpu_count(), 3);
        assert_eq!(topology.virtual_cpu_index(0), VpIndex::new(0));
        assert_eq!(topology.virtual_cpu_index(1), VpIndex::new(5));
        assert_eq!(topology.virtual_cpu_index(2), VpIndex::new(1));
        assert_eq!(topology.vp_index_limit(), 6);
        assert_eq!(topology.cpus()[1].apic_id, 4);
        assert_eq!(topology.cpus()[1].vendor.to_string(), "GenuineIntel");
    }

    #[test]
    fn unknown_apic_id() {
        let table = MadtBuilder::new().local_apic(0, 0).build();
        let err = SystemTopology::new(
            &table,
            [LogicalCpu::new(VENDOR, 0), LogicalCpu::new(VENDOR, 1)],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TopologyError::UnknownApicId { cpu: 1, apic_id: 1 }
        ));
    }

    #[test]
    fn no_processors() {
        let table = MadtBuilder::new().local_apic(0, 0).build();
        assert!(matches!(
            SystemTopology::new(&table, Vec::<LogicalCpu>::new()),
            Err(TopologyError::NoProcessors)
        ));
    }

    #[test]
    #[should_panic(expected = "processor 1 out of range")]
    fn lookup_out_of_range() {
        let table = MadtBuilder::new().local_apic(0, 0).build();
        let topology = SystemTopology::new(&table, [LogicalCpu::new(VENDOR, 0)]).unwrap();
        topology.virtual_cpu_index(1);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn probe_current_processor() {
        let cpu = LogicalCpu::current();
        assert!(cpu.vendor.0.iter().any(|&b| b != 0));
    }
}
