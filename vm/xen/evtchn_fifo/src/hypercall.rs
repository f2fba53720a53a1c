// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The event channel and HVM parameter hypercalls the FIFO ABI depends on.

use xen_topology::VpIndex;
use xendef::DomainId;
use xendef::EvtchnPort;
use xendef::HvmParam;
use xendef::XenResult;

/// The remote end of an interdomain event channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InterdomainBinding {
    pub remote_domain: DomainId,
    pub remote_port: EvtchnPort,
}

/// Hypercall transport.
pub trait EvtchnHypercalls: Send + Sync {
    /// `EVTCHNOP_init_control`: registers the control block in frame
    /// `control_gfn` for `vp`, switching the domain to the FIFO ABI.
    fn init_control(&self, control_gfn: u64, vp: VpIndex) -> XenResult<()>;

    /// `EVTCHNOP_expand_array`: appends frame `array_gfn` to the event array.
    fn expand_array(&self, array_gfn: u64) -> XenResult<()>;

    /// `EVTCHNOP_reset`: closes every event channel of this domain and
    /// reverts to the 2-level ABI.
    fn reset(&self) -> XenResult<()>;

    /// `EVTCHNOP_status`: returns the remote end of interdomain channel
    /// `port`.
    fn query_interdomain(&self, port: EvtchnPort) -> XenResult<InterdomainBinding>;

    /// `EVTCHNOP_bind_interdomain`: binds a new local port to `remote`.
    fn bind_interdomain(&self, remote: InterdomainBinding) -> XenResult<EvtchnPort>;

    /// `HVMOP_get_param`.
    fn get_param(&self, param: HvmParam) -> XenResult<u64>;

    /// `HVMOP_set_param`.
    fn set_param(&self, param: HvmParam, value: u64) -> XenResult<()>;
}
