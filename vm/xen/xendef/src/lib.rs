// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Xen hypervisor interface definitions used by the guest event channel
//! drivers.
//!
//! The layouts here are shared with the hypervisor and must match the
//! published FIFO event channel ABI bit for bit.

#![no_std]

use bitfield_struct::bitfield;
use core::fmt::Debug;
use core::mem::offset_of;
use core::mem::size_of;
use static_assertions::const_assert;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const XEN_PAGE_SIZE_USIZE: usize = 4096;

/// The number of priority queues per VCPU.
pub const EVTCHN_FIFO_MAX_QUEUES: usize = 16;
/// The priority new channels are bound with.
pub const EVTCHN_FIFO_PRIORITY_DEFAULT: u32 = 7;
/// The least urgent priority.
pub const EVTCHN_FIFO_PRIORITY_MIN: u32 = 15;

/// Width of the LINK field of an event word.
pub const EVTCHN_FIFO_LINK_BITS: u32 = 17;
pub const EVTCHN_FIFO_LINK_MASK: u32 = (1 << EVTCHN_FIFO_LINK_BITS) - 1;
/// The number of ports addressable through the LINK field.
pub const EVTCHN_FIFO_NR_CHANNELS: u32 = 1 << EVTCHN_FIFO_LINK_BITS;

/// Bit numbers of the event word flags.
pub const EVTCHN_FIFO_PENDING: u32 = 31;
pub const EVTCHN_FIFO_MASKED: u32 = 30;
pub const EVTCHN_FIFO_LINKED: u32 = 29;
pub const EVTCHN_FIFO_BUSY: u32 = 28;

/// The number of event words held by one event array page.
pub const EVENT_WORDS_PER_PAGE: usize = XEN_PAGE_SIZE_USIZE / size_of::<u32>();
/// The number of event array pages needed to cover every port.
pub const EVTCHN_FIFO_MAX_EVENT_PAGES: usize =
    EVTCHN_FIFO_NR_CHANNELS as usize / EVENT_WORDS_PER_PAGE;

/// A FIFO event word.
///
/// Both the guest and the hypervisor modify event words concurrently, so the
/// guest must only ever change one with an atomic operation.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct EventWord {
    /// The next port in the same queue, or zero at the end of the queue.
    #[bits(17)]
    pub link: u32,
    #[bits(11)]
    _reserved: u32,
    /// Set by the hypervisor while it updates the link.
    pub busy: bool,
    /// The word is on a queue.
    pub linked: bool,
    /// Delivery is suppressed.
    pub masked: bool,
    /// An event has been raised and not yet acknowledged.
    pub pending: bool,
}

const_assert_eq!(EventWord::new().with_pending(true).into_bits(), 1 << EVTCHN_FIFO_PENDING);
const_assert_eq!(EventWord::new().with_masked(true).into_bits(), 1 << EVTCHN_FIFO_MASKED);
const_assert_eq!(EventWord::new().with_linked(true).into_bits(), 1 << EVTCHN_FIFO_LINKED);
const_assert_eq!(EventWord::new().with_busy(true).into_bits(), 1 << EVTCHN_FIFO_BUSY);
const_assert_eq!(
    EventWord::new().with_link(EVTCHN_FIFO_LINK_MASK).into_bits(),
    EVTCHN_FIFO_LINK_MASK
);

/// The per-VCPU FIFO control block, as registered with `EVTCHNOP_init_control`.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EvtchnFifoControlBlock {
    /// One bit per priority with linked events.
    pub ready: u32,
    pub rsvd: u32,
    /// The head of each priority queue, zero if empty.
    pub head: [u32; EVTCHN_FIFO_MAX_QUEUES],
}

const_assert_eq!(size_of::<EvtchnFifoControlBlock>(), 72);

/// Index of the `ready` field in a control block viewed as 32-bit words.
pub const CONTROL_BLOCK_READY_WORD: usize =
    offset_of!(EvtchnFifoControlBlock, ready) / size_of::<u32>();
/// Index of `head[0]` in a control block viewed as 32-bit words.
pub const CONTROL_BLOCK_HEAD_WORD: usize =
    offset_of!(EvtchnFifoControlBlock, head) / size_of::<u32>();

const_assert!(EVTCHN_FIFO_MAX_QUEUES <= u32::BITS as usize);

/// An event channel port number.
///
/// Port 0 is reserved and is never bound or linked, which is what allows a
/// zero LINK field to mean "end of queue".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct EvtchnPort(u32);

impl EvtchnPort {
    pub const RESERVED: Self = Self(0);

    pub const fn new(port: u32) -> Self {
        Self(port)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the event array page holding this port's event word.
    pub const fn page_index(self) -> usize {
        self.0 as usize / EVENT_WORDS_PER_PAGE
    }

    /// Returns the offset of this port's event word within its page.
    pub const fn page_offset(self) -> usize {
        self.0 as usize % EVENT_WORDS_PER_PAGE
    }
}

impl core::fmt::Display for EvtchnPort {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// A Xen domain identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DomainId(pub u16);

impl DomainId {
    pub const DOM0: Self = Self(0);
}

impl core::fmt::Display for DomainId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// An HVM parameter index, for `HVMOP_get_param` and `HVMOP_set_param`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct HvmParam(pub u32);

impl HvmParam {
    /// The local port of the xenstore event channel.
    pub const STORE_EVTCHN: Self = Self(2);
}

/// A raw hypercall return value: zero or a positive value on success, a
/// negated errno on failure.
#[derive(Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
#[repr(transparent)]
pub struct XenStatus(pub i64);

impl XenStatus {
    pub const SUCCESS: Self = Self(0);

    /// Returns the non-negative return value, or the corresponding
    /// [`XenError`].
    ///
    /// Errno values too large to be represented are reported as `EIO`.
    pub fn result(self) -> XenResult<u64> {
        if self.0 >= 0 {
            return Ok(self.0 as u64);
        }
        let err = self
            .0
            .checked_neg()
            .and_then(|errno| u16::try_from(errno).ok())
            .and_then(core::num::NonZeroU16::new)
            .map_or(XenError::EIO, XenError);
        Err(err)
    }

    pub fn is_ok(self) -> bool {
        self.0 >= 0
    }

    pub fn is_err(self) -> bool {
        self.0 < 0
    }
}

impl From<XenResult<()>> for XenStatus {
    fn from(result: XenResult<()>) -> Self {
        result.err().map_or(Self::SUCCESS, |err| Self(-i64::from(err.0.get())))
    }
}

impl Debug for XenStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.result() {
            Ok(value) => write!(f, "Success({value})"),
            Err(err) => Debug::fmt(&err, f),
        }
    }
}

/// A hypercall failure, carrying the (positive) errno value.
//
// DEVNOTE: use `NonZeroU16` to get a niche optimization, since 0 is never an
// error.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct XenError(core::num::NonZeroU16);

impl XenError {
    /// Returns the errno value.
    pub fn errno(self) -> u16 {
        self.0.get()
    }

    /// Classifies the error the way guest drivers report it upwards.
    pub fn kind(self) -> XenErrorKind {
        match self {
            Self::EAGAIN => XenErrorKind::Retry,
            Self::EINVAL => XenErrorKind::InvalidParameter,
            Self::ENOMEM => XenErrorKind::OutOfMemory,
            Self::ENOSPC | Self::EMSGSIZE => XenErrorKind::BufferOverflow,
            Self::ENOSYS => XenErrorKind::NotImplemented,
            Self::ENOTCONN | Self::ECONNREFUSED => XenErrorKind::Disconnected,
            _ => XenErrorKind::Other,
        }
    }

    pub fn is_retry(self) -> bool {
        self.kind() == XenErrorKind::Retry
    }

    pub fn is_out_of_memory(self) -> bool {
        self.kind() == XenErrorKind::OutOfMemory
    }
}

impl From<core::num::NonZeroU16> for XenError {
    fn from(errno: core::num::NonZeroU16) -> Self {
        Self(errno)
    }
}

impl Debug for XenError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.debug_name() {
            Some(name) => f.pad(name),
            None => write!(f, "errno {}", self.0.get()),
        }
    }
}

impl core::fmt::Display for XenError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.doc_str() {
            Some(s) => f.write_str(s),
            None => write!(f, "Xen error {}", self.0.get()),
        }
    }
}

impl core::error::Error for XenError {}

/// Coarse classification of a [`XenError`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum XenErrorKind {
    Retry,
    InvalidParameter,
    OutOfMemory,
    BufferOverflow,
    NotImplemented,
    Disconnected,
    Other,
}

macro_rules! xen_error {
    ($ty:ty, $(#[doc = $doc:expr] $ident:ident = $val:expr),* $(,)?) => {
        impl $ty {
            $(
                #[doc = $doc]
                pub const $ident: Self = Self(core::num::NonZeroU16::new($val).unwrap());
            )*

            fn debug_name(&self) -> Option<&'static str> {
                Some(match self.0.get() {
                    $(
                        $val => stringify!($ident),
                    )*
                    _ => return None,
                })
            }

            fn doc_str(&self) -> Option<&'static str> {
                Some(match self.0.get() {
                    $(
                        $val => $doc.trim_ascii(),
                    )*
                    _ => return None,
                })
            }
        }
    };
}

// DEVNOTE: the doc comments here are also used as the runtime error strings.
xen_error! {
    XenError,
    /// Operation not permitted
    EPERM = 1,
    /// No such file or directory
    ENOENT = 2,
    /// No such process
    ESRCH = 3,
    /// Interrupted system call
    EINTR = 4,
    /// I/O error
    EIO = 5,
    /// No such device or address
    ENXIO = 6,
    /// Arg list too long
    E2BIG = 7,
    /// Exec format error
    ENOEXEC = 8,
    /// Bad file number
    EBADF = 9,
    /// No child processes
    ECHILD = 10,
    /// Try again
    EAGAIN = 11,
    /// Out of memory
    ENOMEM = 12,
    /// Permission denied
    EACCES = 13,
    /// Bad address
    EFAULT = 14,
    /// Device or resource busy
    EBUSY = 16,
    /// File exists
    EEXIST = 17,
    /// Cross-device link
    EXDEV = 18,
    /// No such device
    ENODEV = 19,
    /// Invalid argument
    EINVAL = 22,
    /// File table overflow
    ENFILE = 23,
    /// Too many open files
    EMFILE = 24,
    /// No space left on device
    ENOSPC = 28,
    /// Too many links
    EMLINK = 31,
    /// Math argument out of domain of func
    EDOM = 33,
    /// Math result not representable
    ERANGE = 34,
    /// Resource deadlock would occur
    EDEADLK = 35,
    /// File name too long
    ENAMETOOLONG = 36,
    /// No record locks available
    ENOLCK = 37,
    /// Function not implemented
    ENOSYS = 38,
    /// Directory not empty
    ENOTEMPTY = 39,
    /// No data available
    ENODATA = 61,
    /// Timer expired
    ETIME = 62,
    /// Link has been severed
    ENOLINK = 67,
    /// Value too large for defined data type
    EOVERFLOW = 75,
    /// Illegal byte sequence
    EILSEQ = 84,
    /// Interrupted system call should be restarted
    ERESTART = 85,
    /// Too many users
    EUSERS = 87,
    /// Message too long
    EMSGSIZE = 90,
    /// Operation not supported on transport endpoint
    EOPNOTSUPP = 95,
    /// Address already in use
    EADDRINUSE = 98,
    /// Cannot assign requested address
    EADDRNOTAVAIL = 99,
    /// No buffer space available
    ENOBUFS = 105,
    /// Transport endpoint is already connected
    EISCONN = 106,
    /// Transport endpoint is not connected
    ENOTCONN = 107,
    /// Connection timed out
    ETIMEDOUT = 110,
    /// Connection refused
    ECONNREFUSED = 111,
    /// Operation already in progress
    EALREADY = 114,
}

/// A useful result type for hypercalls.
pub type XenResult<T> = Result<T, XenError>;

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::format;

    #[test]
    fn event_word_layout() {
        let word = EventWord::from(0xa000_0005);
        assert!(word.pending());
        assert!(!word.masked());
        assert!(word.linked());
        assert!(!word.busy());
        assert_eq!(word.link(), 5);

        let word = EventWord::new().with_masked(true).with_link(0x1ffff);
        assert_eq!(word.into_bits(), 0x4001_ffff);
    }

    #[test]
    fn control_block_offsets() {
        assert_eq!(CONTROL_BLOCK_READY_WORD, 0);
        assert_eq!(CONTROL_BLOCK_HEAD_WORD, 2);
        assert_eq!(EVTCHN_FIFO_MAX_EVENT_PAGES, 128);
    }

    #[test]
    fn port_page_math() {
        let port = EvtchnPort::new(1025);
        assert_eq!(port.page_index(), 1);
        assert_eq!(port.page_offset(), 1);
    }

    #[test]
    fn status_conversion() {
        assert_eq!(XenStatus(0).result(), Ok(0));
        assert_eq!(XenStatus(42).result(), Ok(42));
        assert_eq!(XenStatus(-12).result(), Err(XenError::ENOMEM));
        assert_eq!(XenStatus(-1_000_000).result(), Err(XenError::EIO));
        assert_eq!(XenStatus::from(Err(XenError::EINVAL)), XenStatus(-22));
        assert_eq!(XenStatus::from(Ok(())), XenStatus::SUCCESS);
    }

    #[test]
    fn error_text_and_kind() {
        assert_eq!(format!("{}", XenError::ENOMEM), "Out of memory");
        assert_eq!(format!("{:?}", XenError::ENOMEM), "ENOMEM");
        let unknown = XenError::from(core::num::NonZeroU16::new(500).unwrap());
        assert_eq!(format!("{unknown:?}"), "errno 500");
        assert_eq!(format!("{unknown}"), "Xen error 500");
        assert!(XenError::EAGAIN.is_retry());
        assert!(XenError::ENOMEM.is_out_of_memory());
        assert_eq!(XenError::EMSGSIZE.kind(), XenErrorKind::BufferOverflow);
        assert_eq!(XenError::ECONNREFUSED.kind(), XenErrorKind::Disconnected);
        assert_eq!(XenError::EPERM.kind(), XenErrorKind::Other);
    }
}
