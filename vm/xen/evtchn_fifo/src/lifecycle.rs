// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reference-counted registration with the hypervisor.

use crate::Error;
use crate::Fifo;
use crate::ResetError;
use crate::control::ControlBlockSet;
use xen_topology::VpIndex;
use xendef::EvtchnPort;
use xendef::HvmParam;

/// Control blocks published by an acquire still in progress. Dropping this
/// unpublishes them; their pages stay with the set.
struct StagedControlBlocks<'a> {
    controls: &'a ControlBlockSet,
    vps: Vec<VpIndex>,
}

impl StagedControlBlocks<'_> {
    fn commit(mut self) {
        self.vps.clear();
    }
}

impl Drop for StagedControlBlocks<'_> {
    fn drop(&mut self) {
        for &vp in &self.vps {
            self.controls.clear(vp);
        }
    }
}

impl Fifo {
    pub(crate) fn add_reference(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.references > 0 {
            state.references += 1;
            return Ok(());
        }

        tracing::info!(
            cpus = self.topology.cpu_count(),
            "registering fifo control blocks"
        );

        let mut staged = StagedControlBlocks {
            controls: &self.controls,
            vps: Vec::new(),
        };
        if let Err(err) = self.register_control_blocks(&mut staged) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to register fifo control blocks"
            );
            // Undo the registrations that succeeded before unpublishing
            // their blocks.
            if let Err(error) = self.hypercalls.reset() {
                tracing::warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to reset event channels"
                );
            }
            return Err(err);
        }

        staged.commit();
        state.references = 1;
        Ok(())
    }

    fn register_control_blocks(&self, staged: &mut StagedControlBlocks<'_>) -> Result<(), Error> {
        for cpu in 0..self.topology.cpu_count() {
            let vp = self.topology.virtual_cpu_index(cpu);
            let page = match self.controls.page(vp) {
                Some(page) => {
                    page.fill(0);
                    page
                }
                None => self
                    .allocator
                    .allocate_page()
                    .map_err(Error::AllocatePage)?,
            };

            // The hypervisor may raise events as soon as the block is
            // registered, so it must already be visible to poll.
            self.controls.publish(vp, &page);
            staged.vps.push(vp);

            self.hypercalls
                .init_control(page.pfn(), vp)
                .map_err(|source| Error::InitControl { vp, source })?;

            tracing::info!(cpu, %vp, pfn = page.pfn(), "control block registered");
        }
        Ok(())
    }

    pub(crate) fn remove_reference(&self) {
        let mut state = self.state.lock();
        assert_ne!(
            state.references, 0,
            "fifo event channel abi released without acquire"
        );
        state.references -= 1;
        if state.references > 0 {
            return;
        }

        tracing::info!("releasing fifo event channels");

        // Losing the store channel leaves the guest unable to reach its
        // configuration, so there is nothing to fall back to.
        if let Err(err) = self.reset_and_rebind() {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to restore the store event channel"
            );
            panic!("failed to restore the store event channel: {err}");
        }

        self.events.contract();
        for cpu in 0..self.topology.cpu_count() {
            self.controls.clear(self.topology.virtual_cpu_index(cpu));
        }
    }

    /// Resets the ABI, preserving the store event channel that the reset
    /// closes.
    fn reset_and_rebind(&self) -> Result<(), ResetError> {
        let value = self
            .hypercalls
            .get_param(HvmParam::STORE_EVTCHN)
            .map_err(ResetError::GetStoreChannel)?;
        let port = u32::try_from(value)
            .map(EvtchnPort::new)
            .map_err(|_| ResetError::InvalidStoreChannel(value))?;

        let remote = self
            .hypercalls
            .query_interdomain(port)
            .map_err(|source| ResetError::QueryStoreChannel { port, source })?;

        tracing::info!(
            %port,
            remote_domain = %remote.remote_domain,
            remote_port = %remote.remote_port,
            "resetting event channels"
        );

        self.hypercalls.reset().map_err(ResetError::Reset)?;

        let new_port =
            self.hypercalls
                .bind_interdomain(remote)
                .map_err(|source| ResetError::BindStoreChannel {
                    remote_domain: remote.remote_domain,
                    remote_port: remote.remote_port,
                    source,
                })?;

        self.hypercalls
            .set_param(HvmParam::STORE_EVTCHN, new_port.get().into())
            .map_err(|source| ResetError::SetStoreChannel {
                port: new_port,
                source,
            })?;

        tracing::info!(old_port = %port, %new_port, "store event channel rebound");
        Ok(())
    }
}
