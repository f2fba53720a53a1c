// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! ACPI Multiple APIC Description Table (MADT) parsing.

use crate::packed_nums::*;
use core::mem::size_of;
use static_assertions::const_assert_eq;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Ref;
use zerocopy::Unaligned;

pub const MADT_SIGNATURE: [u8; 4] = *b"APIC";

/// The standard ACPI table header.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct AcpiHeader {
    pub signature: [u8; 4],
    pub length: u32_le,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_tableid: [u8; 8],
    pub oem_revision: u32_le,
    pub creator_id: u32_le,
    pub creator_revision: u32_le,
}

const_assert_eq!(size_of::<AcpiHeader>(), 36);

/// The fixed portion of the MADT following the ACPI header.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct MadtHeader {
    pub local_apic_address: u32_le,
    pub flags: u32_le,
}

const_assert_eq!(size_of::<MadtHeader>(), 8);

/// The header common to every interrupt controller structure.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct MadtEntryHeader {
    pub typ: u8,
    pub length: u8,
}

pub const MADT_TYPE_LOCAL_APIC: u8 = 0;

/// Processor local APIC structure.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct MadtLocalApic {
    pub typ: u8,
    pub length: u8,
    pub acpi_processor_id: u8,
    pub apic_id: u8,
    pub flags: u32_le,
}

const_assert_eq!(size_of::<MadtLocalApic>(), 8);

pub const MADT_LOCAL_APIC_ENABLED: u32 = 1 << 0;
pub const MADT_LOCAL_APIC_ONLINE_CAPABLE: u32 = 1 << 1;

impl MadtLocalApic {
    pub fn new(acpi_processor_id: u8, apic_id: u8) -> Self {
        Self {
            typ: MADT_TYPE_LOCAL_APIC,
            length: size_of::<Self>() as u8,
            acpi_processor_id,
            apic_id,
            flags: MADT_LOCAL_APIC_ENABLED.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseMadtError {
    #[error("could not read standard ACPI header")]
    MissingAcpiHeader,
    #[error("invalid signature. expected b\"APIC\", found {0:?}")]
    InvalidSignature([u8; 4]),
    #[error("mismatched len. in_header: {in_header}, actual {actual}")]
    MismatchedLength { in_header: usize, actual: usize },
    #[error("missing fixed MADT header")]
    MissingFixedHeader,
    #[error("malformed interrupt controller structure at offset {offset}")]
    BadEntry { offset: usize },
}

/// Walks the interrupt controller structures of `raw_madt`, calling
/// `on_local_apic` for each processor local APIC. Other structure types are
/// skipped.
pub fn parse_madt<'a>(
    raw_madt: &'a [u8],
    mut on_local_apic: impl FnMut(&'a MadtLocalApic),
) -> Result<(&'a AcpiHeader, &'a MadtHeader), ParseMadtError> {
    let raw_madt_len = raw_madt.len();
    let (acpi_header, buf) = Ref::<_, AcpiHeader>::from_prefix(raw_madt)
        .map_err(|_| ParseMadtError::MissingAcpiHeader)?;

    if acpi_header.signature != MADT_SIGNATURE {
        return Err(ParseMadtError::InvalidSignature(acpi_header.signature));
    }

    if acpi_header.length.get() as usize != raw_madt_len {
        return Err(ParseMadtError::MismatchedLength {
            in_header: acpi_header.length.get() as usize,
            actual: raw_madt_len,
        });
    }

    let (madt_header, mut buf) =
        Ref::<_, MadtHeader>::from_prefix(buf).map_err(|_| ParseMadtError::MissingFixedHeader)?;

    while !buf.is_empty() {
        let offset = raw_madt_len - buf.len();
        let bad_entry = || ParseMadtError::BadEntry { offset };
        let (header, _) = MadtEntryHeader::ref_from_prefix(buf).map_err(|_| bad_entry())?;
        let length = header.length as usize;
        if length < size_of::<MadtEntryHeader>() || length > buf.len() {
            return Err(bad_entry());
        }
        let (entry, rest) = buf.split_at(length);
        if header.typ == MADT_TYPE_LOCAL_APIC {
            let (apic, _) = Ref::<_, MadtLocalApic>::from_prefix(entry).map_err(|_| bad_entry())?;
            on_local_apic(Ref::into_ref(apic));
        }
        buf = rest;
    }

    Ok((Ref::into_ref(acpi_header), Ref::into_ref(madt_header)))
}

/// Builds a MADT image. Used to describe synthetic topologies.
#[derive(Debug, Default)]
pub struct MadtBuilder {
    entries: Vec<u8>,
}

impl MadtBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a processor local APIC structure.
    pub fn local_apic(&mut self, acpi_processor_id: u8, apic_id: u8) -> &mut Self {
        self.entries.extend_from_slice(
            MadtLocalApic::new(acpi_processor_id, apic_id).as_bytes(),
        );
        self
    }

    /// Appends a raw interrupt controller structure of type `typ`.
    pub fn raw_entry(&mut self, typ: u8, body: &[u8]) -> &mut Self {
        self.entries.push(typ);
        self.entries.push((body.len() + 2) as u8);
        self.entries.extend_from_slice(body);
        self
    }

    /// Returns the finished table, with a valid checksum.
    pub fn build(&self) -> Vec<u8> {
        let length = size_of::<AcpiHeader>() + size_of::<MadtHeader>() + self.entries.len();
        let header = AcpiHeader {
            signature: MADT_SIGNATURE,
            length: (length as u32).into(),
            revision: 4,
            checksum: 0,
            oem_id: *b"XENVMM",
            oem_tableid: *b"XENMADT ",
            oem_revision: 0.into(),
            creator_id: 0.into(),
            creator_revision: 0.into(),
        };
        let madt_header = MadtHeader {
            local_apic_address: 0xfee0_0000.into(),
            flags: 0.into(),
        };
        let mut table = Vec::with_capacity(length);
        table.extend_from_slice(header.as_bytes());
        table.extend_from_slice(madt_header.as_bytes());
        table.extend_from_slice(&self.entries);
        let sum = table.iter().fold(0u8, |sum, &b| sum.wrapping_add(b));
        table[9] = 0u8.wrapping_sub(sum);
        table
    }
}
