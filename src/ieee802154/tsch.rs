// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright lrwpan-tsch Contributors 2025.

//! The TSCH MAC state machine.
//!
//! [`TschMac`] is driven entirely by events: the slot tick, the per-slot
//! sub-timers, and the PHY's confirm/indication callbacks. Each event
//! handler runs to completion and may post further events through the
//! timer service; between events no logic runs. Within a slot the machine
//! walks one of three paths:
//!
//! - transmit: `IDLE → (CCA →) SENDING → ACK_PENDING → ACK_PENDING_END`,
//!   cut short when no ACK was requested or the queue head is backing off;
//! - receive: `IDLE → RX → PKT_WAIT_END`, cut short when a frame arrives;
//! - sleep, when no link is scheduled at the current ASN.
//!
//! The `*_END` states exist because switching the transceiver off is
//! itself asynchronous: a reception already in flight still completes and
//! its indication is accepted there. A slot that ends inside an `*_END`
//! state is resolved at the next tick (ACK miss or RX miss).

use core::cell::{Cell, RefCell};

use log::{debug, error, trace};
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};

use crate::hil::phy::{
    CcaStatus, Phy, PhyAttribute, PhyClient, PhyStatus, TrxState, MAX_MSDU_SIZE,
};
use crate::hil::time::{Timer, TimerClient, TimerHandle};
use crate::net::fcs;
use crate::net::ieee802154::{
    AddressMode, FrameType, Header, MacAddress, BROADCAST_PAN_ID, BROADCAST_SHORT_ADDR,
};

use super::device::{
    DataIndication, DataRequest, LinkOp, LinkStatus, MacMonitor, McpsClient, McpsDataStatus,
    MlmeClient, SetLinkRequest, SetSlotframeRequest, SlotTrace, SlotframeOp, SlotframeStatus,
    TschMode, TschModeStatus,
};
use super::pib::{HoppingSequence, Pib, TimeslotTemplate};
use super::queue::{TxQueueEntry, TxQueues};
use super::schedule::{Link, LinkOptions, ScheduleDb, ScheduleError};

/// Time correction advertised in outgoing ACK IEs. The simulation keeps
/// ideal synchronization, so the value is a fixed placeholder.
const ACK_TIMING_CORRECTION: u16 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacState {
    Idle,
    Cca,
    Sending,
    AckPending,
    AckPendingEnd,
    Rx,
    PktWaitEnd,
}

/// Inputs of the state transition function. `ChannelIdle` and
/// `ChannelAccessFailure` are the synthetic outcomes of a CCA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Idle,
    Cca,
    Rx,
    Sending,
    AckPending,
    AckPendingEnd,
    PktWaitEnd,
    ChannelIdle,
    ChannelAccessFailure,
}

/// Tokens the MAC schedules on the timer service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacTimer {
    /// The ASN boundary, every `tsTimeslotLength` microseconds.
    SlotTick,
    /// A deferred state transition.
    SetState(StateEvent),
    /// `tsRxAckDelay` elapsed after a transmission; start listening for
    /// the ACK.
    WaitAck,
    /// `tsAckWait` elapsed without an ACK.
    AckWaitDone,
    /// `tsRxWait` elapsed without a frame.
    RxWaitDone,
    /// `tsTxAckDelay` elapsed after a reception; send the ACK echoing
    /// `seq` (`None` when the data frame suppressed its sequence number).
    SendAck { seq: Option<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CurrentLink {
    slotframe_handle: u8,
    link_handle: u16,
    active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxFrameKind {
    Data { ack_requested: bool, seq: Option<u8> },
    Ack,
}

#[derive(Debug)]
struct TxFrame {
    bytes: Vec<u8>,
    kind: TxFrameKind,
}

/// One device's TSCH MAC.
pub struct TschMac<'a, P: Phy<'a>, T: Timer<'a, MacTimer>> {
    phy: &'a P,
    timer: &'a T,

    mcps_client: Cell<Option<&'a dyn McpsClient>>,
    mlme_client: Cell<Option<&'a dyn MlmeClient>>,
    monitor: Cell<Option<&'a dyn MacMonitor>>,

    pib: Pib,
    dsn: Cell<u8>,

    state: Cell<MacState>,
    pending_state: Cell<MacState>,
    new_slot: Cell<bool>,
    shared_link: Cell<bool>,
    current_link: Cell<CurrentLink>,
    tsch_enabled: Cell<bool>,
    cca_enabled: Cell<bool>,
    hopping_enabled: Cell<bool>,

    schedule: RefCell<ScheduleDb>,
    pending_link: RefCell<Option<SetLinkRequest>>,
    queues: RefCell<TxQueues>,
    tx_queue_index: Cell<usize>,
    tx_frame: RefCell<Option<TxFrame>>,
    timeslot_template: Cell<TimeslotTemplate>,
    hopping: RefCell<HoppingSequence>,

    rng: RefCell<ChaCha8Rng>,

    slot_tick_event: Cell<Option<TimerHandle>>,
    set_state_event: Cell<Option<TimerHandle>>,
    ack_timeout_event: Cell<Option<TimerHandle>>,
    rx_timeout_event: Cell<Option<TimerHandle>>,

    wait_done_at: Cell<u64>,
    latest_packet_size: Cell<usize>,
    tx_peer_id: Cell<u32>,
    rx_peer_id: Cell<u32>,
}

impl<'a, P: Phy<'a>, T: Timer<'a, MacTimer>> TschMac<'a, P, T> {
    /// `seed` feeds the per-device random stream used for the initial
    /// sequence number and the shared-link backoff draws, so a rerun with
    /// the same seeds replays identically.
    pub fn new(phy: &'a P, timer: &'a T, seed: u64) -> TschMac<'a, P, T> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let dsn = (rng.next_u32() & 0xff) as u8;
        TschMac {
            phy,
            timer,
            mcps_client: Cell::new(None),
            mlme_client: Cell::new(None),
            monitor: Cell::new(None),
            pib: Pib::default(),
            dsn: Cell::new(dsn),
            state: Cell::new(MacState::Idle),
            pending_state: Cell::new(MacState::Idle),
            new_slot: Cell::new(true),
            shared_link: Cell::new(false),
            current_link: Cell::new(CurrentLink {
                slotframe_handle: 0,
                link_handle: 0,
                active: false,
            }),
            tsch_enabled: Cell::new(false),
            cca_enabled: Cell::new(true),
            hopping_enabled: Cell::new(true),
            schedule: RefCell::new(ScheduleDb::default()),
            pending_link: RefCell::new(None),
            queues: RefCell::new(TxQueues::default()),
            tx_queue_index: Cell::new(0),
            tx_frame: RefCell::new(None),
            timeslot_template: Cell::new(TimeslotTemplate::default()),
            hopping: RefCell::new(HoppingSequence::default_sequence(16)),
            rng: RefCell::new(rng),
            slot_tick_event: Cell::new(None),
            set_state_event: Cell::new(None),
            ack_timeout_event: Cell::new(None),
            rx_timeout_event: Cell::new(None),
            wait_done_at: Cell::new(0),
            latest_packet_size: Cell::new(0),
            tx_peer_id: Cell::new(0),
            rx_peer_id: Cell::new(0),
        }
    }

    /// Park the transceiver. Call once after wiring the clients.
    pub fn initialize(&self) {
        self.phy.plme_set_trx_state_request(TrxState::TrxOff);
    }

    pub fn set_mcps_client(&self, client: &'a dyn McpsClient) {
        self.mcps_client.set(Some(client));
    }

    pub fn set_mlme_client(&self, client: &'a dyn MlmeClient) {
        self.mlme_client.set(Some(client));
    }

    pub fn set_monitor(&self, monitor: &'a dyn MacMonitor) {
        self.monitor.set(Some(monitor));
    }

    pub fn set_short_address(&self, address: u16) {
        self.pib.short_address.set(address);
    }

    pub fn get_short_address(&self) -> u16 {
        self.pib.short_address.get()
    }

    pub fn set_extended_address(&self, address: [u8; 8]) {
        self.pib.extended_address.set(address);
    }

    pub fn get_extended_address(&self) -> [u8; 8] {
        self.pib.extended_address.get()
    }

    pub fn set_pan_id(&self, pan_id: u16) {
        self.pib.pan_id.set(pan_id);
    }

    pub fn get_pan_id(&self) -> u16 {
        self.pib.pan_id.get()
    }

    pub fn set_max_frame_retries(&self, retries: u8) {
        self.pib.max_frame_retries.set(retries);
    }

    pub fn set_promiscuous_mode(&self, on: bool) {
        self.pib.promiscuous_mode.set(on);
    }

    pub fn set_cca_enabled(&self, on: bool) {
        self.cca_enabled.set(on);
    }

    pub fn set_hopping_enabled(&self, on: bool) {
        self.hopping_enabled.set(on);
    }

    pub fn set_hopping_sequence(&self, sequence: HoppingSequence) {
        *self.hopping.borrow_mut() = sequence;
    }

    pub fn set_timeslot_template(&self, template: TimeslotTemplate) {
        self.timeslot_template.set(template);
    }

    pub fn asn(&self) -> u64 {
        self.pib.asn.get()
    }

    /// MCPS-DATA.request: encode and enqueue one MSDU.
    pub fn mcps_data_request(&self, params: &DataRequest, msdu: &[u8]) {
        if msdu.len() > MAX_MSDU_SIZE {
            error!(
                "[{:#06x}] msdu too long: {} octets",
                self.get_short_address(),
                msdu.len()
            );
            self.mcps_confirm(params.msdu_handle, McpsDataStatus::FrameTooLong);
            return;
        }
        if params.dst_addr_mode != AddressMode::Short {
            self.mcps_confirm(params.msdu_handle, McpsDataStatus::InvalidAddress);
            return;
        }

        let mut header = Header::new(FrameType::Data);
        header.pan_id_compression = params.pan_id_suppressed;
        header.seq_suppressed = params.seq_num_suppressed;

        match params.src_addr_mode {
            AddressMode::NotPresent => {}
            AddressMode::Short => {
                header.src_pan = Some(self.get_pan_id());
                header.src_addr = Some(MacAddress::Short(self.get_short_address()));
            }
            AddressMode::Long => {
                header.src_pan = Some(self.get_pan_id());
                header.src_addr = Some(MacAddress::Long(self.get_extended_address()));
            }
            AddressMode::Reserved => {
                self.mcps_confirm(params.msdu_handle, McpsDataStatus::InvalidAddress);
                return;
            }
        }
        header.dst_pan = Some(params.dst_pan_id);
        header.dst_addr = Some(MacAddress::Short(params.dst_addr));

        // Broadcasts are never acknowledged.
        let ack = params.ack_tx && params.dst_addr != BROADCAST_SHORT_ADDR;
        header.ack_requested = ack;

        let seq = if params.seq_num_suppressed {
            None
        } else {
            Some(self.dsn.get())
        };
        header.seq = seq;
        self.dsn.set(self.dsn.get().wrapping_add(1));

        let mut frame = Vec::with_capacity(msdu.len() + 32);
        if header.encode(&mut frame).is_err() {
            self.mcps_confirm(params.msdu_handle, McpsDataStatus::InvalidAddress);
            return;
        }
        frame.extend_from_slice(msdu);
        fcs::append_trailer(&mut frame);

        debug!(
            "[{:#06x}] enqueuing {} octets for {:#06x}, seq {:?}",
            self.get_short_address(),
            frame.len(),
            params.dst_addr,
            seq
        );
        self.queues.borrow_mut().enqueue(
            params.dst_addr,
            self.pib.min_be.get(),
            TxQueueEntry {
                handle: params.msdu_handle,
                seq,
                ack_requested: ack,
                frame,
                retries: 0,
                cw_backoff: 0,
            },
        );
    }

    /// MLME-SET-SLOTFRAME.request.
    pub fn mlme_set_slotframe_request(&self, params: &SetSlotframeRequest) {
        let result = {
            let mut schedule = self.schedule.borrow_mut();
            match params.operation {
                SlotframeOp::Add => schedule.add_slotframe(params.handle, params.size),
                SlotframeOp::Modify => schedule.modify_slotframe(params.handle, params.size),
                SlotframeOp::Delete => schedule.delete_slotframe(params.handle),
            }
        };
        let status = match result {
            Ok(()) => SlotframeStatus::Success,
            Err(ScheduleError::SlotframeNotFound) => SlotframeStatus::SlotframeNotFound,
            Err(ScheduleError::MaxExceeded) => SlotframeStatus::MaxSlotframesExceeded,
            Err(_) => SlotframeStatus::InvalidParameter,
        };
        if let Some(client) = self.mlme_client.get() {
            client.mlme_set_slotframe_confirm(params.handle, status);
        }
    }

    /// MLME-SET-LINK.request. Modifying or deleting the link currently in
    /// service is deferred to the next ASN boundary; its confirm follows
    /// the deferred application.
    pub fn mlme_set_link_request(&self, params: &SetLinkRequest) {
        let current = self.current_link.get();
        let targets_active = current.active
            && current.slotframe_handle == params.slotframe_handle
            && current.link_handle == params.link_handle
            && params.operation != LinkOp::Add;
        if targets_active {
            debug!(
                "[{:#06x}] deferring mutation of active link ({}, {})",
                self.get_short_address(),
                params.slotframe_handle,
                params.link_handle
            );
            *self.pending_link.borrow_mut() = Some(params.clone());
            return;
        }
        let status = self.apply_link_request(params);
        if let Some(client) = self.mlme_client.get() {
            client.mlme_set_link_confirm(params.slotframe_handle, params.link_handle, status);
        }
    }

    fn apply_link_request(&self, params: &SetLinkRequest) -> LinkStatus {
        let link = Link {
            slotframe_handle: params.slotframe_handle,
            handle: params.link_handle,
            timeslot: params.timeslot,
            channel_offset: params.channel_offset,
            options: params.options,
            link_type: params.link_type,
            node_addr: params.node_addr,
            fading_bias: params.fading_bias.clone(),
            tx_id: params.tx_id,
            rx_id: params.rx_id,
        };
        let result = {
            let mut schedule = self.schedule.borrow_mut();
            match params.operation {
                LinkOp::Add => schedule.add_link(link),
                LinkOp::Modify => schedule.modify_link(link),
                LinkOp::Delete => {
                    schedule.delete_link(params.slotframe_handle, params.link_handle)
                }
            }
        };
        match result {
            Ok(()) => LinkStatus::Success,
            Err(ScheduleError::UnknownLink) => LinkStatus::UnknownLink,
            Err(ScheduleError::MaxExceeded) => LinkStatus::MaxLinksExceeded,
            Err(_) => LinkStatus::InvalidParameter,
        }
    }

    /// MLME-TSCH-MODE.request: start or stop the slot machinery.
    pub fn mlme_tsch_mode_request(&self, mode: TschMode) {
        match mode {
            TschMode::On => {
                if !self.tsch_enabled.get() {
                    self.tsch_enabled.set(true);
                    *self.pending_link.borrow_mut() = None;
                    self.set_mac_state(StateEvent::Idle);
                    let handle = self.timer.schedule(0, MacTimer::SlotTick);
                    self.slot_tick_event.set(Some(handle));
                }
            }
            TschMode::Off => {
                self.tsch_enabled.set(false);
                if let Some(handle) = self.slot_tick_event.take() {
                    self.timer.cancel(handle);
                }
            }
        }
        if let Some(client) = self.mlme_client.get() {
            client.mlme_tsch_mode_confirm(mode, TschModeStatus::Success);
        }
    }

    /// The ASN boundary.
    fn slot_tick(&self) {
        if !self.tsch_enabled.get() {
            return;
        }
        self.new_slot.set(true);
        let asn = self.pib.asn.get().wrapping_add(1);
        self.pib.asn.set(asn);
        let template = self.timeslot_template.get();
        let handle = self
            .timer
            .schedule(template.timeslot_length as u32, MacTimer::SlotTick);
        self.slot_tick_event.set(Some(handle));

        let mut current = self.current_link.get();
        current.active = false;
        self.current_link.set(current);

        // Resolve a slot that ended while still waiting: the PHY received
        // something, but not what we were listening for.
        match self.state.get() {
            MacState::AckPendingEnd => {
                debug!("[{:#06x}] slot ended without the ack", self.get_short_address());
                self.trace(SlotTrace::RxDataTxAck(self.latest_packet_size.get()));
                self.handle_tx_failure();
                self.set_mac_state(StateEvent::Idle);
            }
            MacState::PktWaitEnd => {
                debug!(
                    "[{:#06x}] slot ended without the expected frame",
                    self.get_short_address()
                );
                self.trace(SlotTrace::RxData(self.latest_packet_size.get()));
                self.set_mac_state(StateEvent::Idle);
            }
            _ => {}
        }

        let deferred = self.pending_link.borrow_mut().take();
        if let Some(params) = deferred {
            let status = self.apply_link_request(&params);
            if let Some(client) = self.mlme_client.get() {
                client.mlme_set_link_confirm(params.slotframe_handle, params.link_handle, status);
            }
        }

        let link = self.schedule.borrow().lookup(asn).cloned();
        let Some(link) = link else {
            debug!(
                "[{:#06x}] asn {}: no link, radio off",
                self.get_short_address(),
                asn
            );
            self.phy.plme_set_trx_state_request(TrxState::TrxOff);
            self.trace(SlotTrace::Sleep);
            return;
        };

        self.current_link.set(CurrentLink {
            slotframe_handle: link.slotframe_handle,
            link_handle: link.handle,
            active: true,
        });

        if self.hopping_enabled.get() {
            let channel = self.hopping.borrow().channel_at(asn, link.channel_offset);
            self.tx_peer_id.set(link.tx_id);
            self.rx_peer_id.set(link.rx_id);
            let bias = link.fading_bias_for(channel);
            debug!(
                "[{:#06x}] asn {}: channel {}, fading bias {}",
                self.get_short_address(),
                asn,
                channel,
                bias
            );
            self.phy
                .plme_set_attribute_request(PhyAttribute::CurrentChannel(channel));
            self.phy
                .plme_set_attribute_request(PhyAttribute::LinkFadingBias(bias));
            if let Some(monitor) = self.monitor.get() {
                monitor.link_information(
                    self.rx_peer_id.get(),
                    self.tx_peer_id.get(),
                    channel,
                    10.0 * bias.log10(),
                );
            }
        }

        if link.options.contains(LinkOptions::TX) {
            self.shared_link
                .set(link.options.contains(LinkOptions::SHARED));
            let ready = self
                .queues
                .borrow_mut()
                .peek_for_tx_link(link.node_addr, self.shared_link.get());
            match ready {
                Some(index) => {
                    self.tx_queue_index.set(index);
                    {
                        let queues = self.queues.borrow();
                        if let Some(head) = queues.head(index) {
                            *self.tx_frame.borrow_mut() = Some(TxFrame {
                                bytes: head.frame.clone(),
                                kind: TxFrameKind::Data {
                                    ack_requested: head.ack_requested,
                                    seq: head.seq,
                                },
                            });
                        }
                    }
                    if self.cca_enabled.get() {
                        self.timer.schedule(
                            template.cca_offset as u32,
                            MacTimer::SetState(StateEvent::Cca),
                        );
                        self.pending_state.set(MacState::Cca);
                    } else {
                        self.timer.schedule(
                            template.tx_offset as u32,
                            MacTimer::SetState(StateEvent::Sending),
                        );
                        self.pending_state.set(MacState::Sending);
                    }
                    self.post_state(StateEvent::Idle);
                }
                None => {
                    debug!("[{:#06x}] tx slot, empty queue", self.get_short_address());
                    self.trace(SlotTrace::EmptyBuffer);
                }
            }
        } else if link.options.contains(LinkOptions::RX) {
            self.timer
                .schedule(template.rx_offset as u32, MacTimer::SetState(StateEvent::Rx));
            self.pending_state.set(MacState::Rx);
            self.post_state(StateEvent::Idle);
        }
    }

    /// The state transition function. Every transition pairs a state
    /// change with the transceiver request it requires.
    fn set_mac_state(&self, event: StateEvent) {
        match event {
            StateEvent::Idle => {
                self.change_state(MacState::Idle);
                if self.pending_state.get() == MacState::Idle {
                    self.phy.plme_set_trx_state_request(TrxState::TrxOff);
                } else {
                    self.pending_state.set(MacState::Idle);
                    if self.new_slot.get() {
                        self.new_slot.set(false);
                        self.phy.plme_set_trx_state_request(TrxState::TrxStart);
                    } else {
                        self.phy.plme_set_trx_state_request(TrxState::TrxSwitching);
                    }
                }
            }
            StateEvent::AckPending => {
                self.change_state(MacState::AckPending);
                self.phy.plme_set_trx_state_request(TrxState::RxOn);
            }
            StateEvent::Cca => {
                self.change_state(MacState::Cca);
                self.phy.plme_set_trx_state_request(TrxState::RxOn);
            }
            StateEvent::Rx => {
                self.change_state(MacState::Rx);
                self.phy.plme_set_trx_state_request(TrxState::RxOn);
            }
            StateEvent::PktWaitEnd => {
                self.change_state(MacState::PktWaitEnd);
                self.wait_done_at.set(self.timer.now());
                self.phy.plme_set_trx_state_request(TrxState::TrxOff);
            }
            StateEvent::AckPendingEnd => {
                self.change_state(MacState::AckPendingEnd);
                self.wait_done_at.set(self.timer.now());
                self.phy.plme_set_trx_state_request(TrxState::TrxOff);
            }
            StateEvent::ChannelIdle => {
                if self.state.get() != MacState::Cca {
                    error!("channel-idle event outside CCA");
                    return;
                }
                self.change_state(MacState::Sending);
                self.phy.plme_set_trx_state_request(TrxState::TxOn);
            }
            StateEvent::ChannelAccessFailure => {
                if self.state.get() != MacState::Cca {
                    error!("channel-access-failure event outside CCA");
                    return;
                }
                debug!(
                    "[{:#06x}] no clear channel, dropping head",
                    self.get_short_address()
                );
                let handle = self.head_handle();
                if let Some(handle) = handle {
                    self.mcps_confirm(handle, McpsDataStatus::ChannelAccessFailure);
                }
                self.remove_head();
                self.change_state(MacState::Idle);
                self.phy.plme_set_trx_state_request(TrxState::TrxOff);
            }
            StateEvent::Sending => {
                if self.state.get() != MacState::Idle {
                    error!("send event outside IDLE");
                    return;
                }
                self.change_state(MacState::Sending);
                self.phy.plme_set_trx_state_request(TrxState::TxOn);
            }
        }
    }

    fn change_state(&self, new_state: MacState) {
        trace!(
            "[{:#06x}] mac state {:?} -> {:?}",
            self.get_short_address(),
            self.state.get(),
            new_state
        );
        self.state.set(new_state);
    }

    fn post_state(&self, event: StateEvent) {
        self.timer.schedule(0, MacTimer::SetState(event));
    }

    /// Post a deferred transition, replacing the previous tracked one.
    /// This is the event `FORCE_TRX_OFF` cancels.
    fn post_state_tracked(&self, event: StateEvent) {
        if let Some(handle) = self.set_state_event.take() {
            self.timer.cancel(handle);
        }
        let handle = self.timer.schedule(0, MacTimer::SetState(event));
        self.set_state_event.set(Some(handle));
    }

    fn handle_wait_ack(&self) {
        self.post_state(StateEvent::AckPending);
        let template = self.timeslot_template.get();
        let handle = self
            .timer
            .schedule(template.ack_wait as u32, MacTimer::AckWaitDone);
        self.ack_timeout_event.set(Some(handle));
        // The link turns around for the ACK; swap the telemetry peer IDs.
        let tx = self.tx_peer_id.get();
        self.tx_peer_id.set(self.rx_peer_id.get());
        self.rx_peer_id.set(tx);
    }

    fn handle_ack_wait_done(&self) {
        match self.state.get() {
            MacState::AckPending => self.post_state(StateEvent::AckPendingEnd),
            MacState::Idle => debug!("ack already received"),
            state => debug!("ack wait elapsed in {:?}", state),
        }
    }

    fn handle_rx_wait_done(&self) {
        match self.state.get() {
            MacState::Rx => self.post_state(StateEvent::PktWaitEnd),
            MacState::Idle => debug!("frame already received"),
            state => debug!("rx wait elapsed in {:?}", state),
        }
    }

    fn handle_send_ack(&self, seq: Option<u8>) {
        if self.state.get() != MacState::Idle {
            error!("ack send requested in {:?}", self.state.get());
            return;
        }
        let mut header = Header::new(FrameType::Acknowledgement);
        header.seq_suppressed = seq.is_none();
        header.seq = seq;
        header.push_ack_ie(ACK_TIMING_CORRECTION);
        header.terminate_no_payload();

        let mut frame = Vec::with_capacity(16);
        if header.encode(&mut frame).is_err() {
            error!("ack encode failed");
            return;
        }
        fcs::append_trailer(&mut frame);
        debug!(
            "[{:#06x}] sending ack, {} octets, seq {:?}",
            self.get_short_address(),
            frame.len(),
            seq
        );
        *self.tx_frame.borrow_mut() = Some(TxFrame {
            bytes: frame,
            kind: TxFrameKind::Ack,
        });
        self.set_mac_state(StateEvent::Sending);
    }

    /// A transmission went unacknowledged (or CCA/ACK bookkeeping says it
    /// failed). Applies shared-link backoff and drops the head once its
    /// retries are exhausted.
    fn handle_tx_failure(&self) {
        let index = self.tx_queue_index.get();
        let max_be = self.pib.max_be.get();
        let max_retries = self.pib.max_frame_retries.get();

        let (handle, exhausted) = {
            let mut queues = self.queues.borrow_mut();
            let Some(queue) = queues.queue_mut(index) else {
                error!("tx failure with no queue at {}", index);
                return;
            };
            if self.shared_link.get() {
                let prior_retries = queue.entries.front().map_or(0, |e| e.retries);
                if prior_retries > 0 && queue.link_be < max_be {
                    queue.link_be += 1;
                }
                let upper = (1u32 << queue.link_be) - 1;
                let draw = (self.rng.borrow_mut().next_u32() % (upper + 1)) as u8;
                if let Some(head) = queue.entries.front_mut() {
                    head.cw_backoff = draw;
                }
                debug!(
                    "[{:#06x}] shared-link backoff: BE {}, {} slots",
                    self.get_short_address(),
                    queue.link_be,
                    draw
                );
            }
            let Some(head) = queue.entries.front_mut() else {
                error!("tx failure with empty queue at {}", index);
                return;
            };
            head.retries += 1;
            (head.handle, head.retries == max_retries)
        };

        if exhausted {
            debug!(
                "[{:#06x}] retries exhausted, dropping head",
                self.get_short_address()
            );
            self.trace(SlotTrace::MaxRetries);
            self.mcps_confirm(handle, McpsDataStatus::NoAck);
            self.remove_head();
        }
    }

    fn remove_head(&self) {
        let index = self.tx_queue_index.get();
        if let Some(entry) = self.queues.borrow_mut().pop_head(index) {
            debug!(
                "[{:#06x}] dequeued frame seq {:?} after {} retries",
                self.get_short_address(),
                entry.seq,
                entry.retries
            );
        }
        self.tx_queue_index.set(0);
        *self.tx_frame.borrow_mut() = None;
    }

    fn head_handle(&self) -> Option<u8> {
        self.queues
            .borrow()
            .head(self.tx_queue_index.get())
            .map(|entry| entry.handle)
    }

    fn mcps_confirm(&self, msdu_handle: u8, status: McpsDataStatus) {
        if let Some(client) = self.mcps_client.get() {
            client.mcps_data_confirm(msdu_handle, status);
        }
    }

    fn trace(&self, slot_trace: SlotTrace) {
        if let Some(monitor) = self.monitor.get() {
            monitor.slot_trace(slot_trace);
        }
    }

    /// Third-level reception filter: frame version 2 frames addressed to
    /// this device, its PAN or their broadcast equivalents.
    fn filter_accepts(&self, header: &Header) -> bool {
        use crate::net::ieee802154::FrameVersion;

        if header.version != FrameVersion::V2015 {
            return false;
        }
        let dst_present = header.dst_addr.is_some();
        let src_present = header.src_addr.is_some();
        let compression = header.pan_id_compression;
        let dst_pan_expected = (!dst_present && !src_present && compression)
            || (dst_present && !src_present && !compression)
            || (dst_present && src_present && !compression);
        if dst_pan_expected {
            match header.dst_pan {
                Some(pan) if pan == self.get_pan_id() || pan == BROADCAST_PAN_ID => {}
                _ => return false,
            }
        }
        match header.dst_addr {
            Some(MacAddress::Short(addr)) => {
                if addr != self.get_short_address() && addr != BROADCAST_SHORT_ADDR {
                    return false;
                }
            }
            Some(MacAddress::Long(addr)) => {
                if addr != self.get_extended_address() {
                    return false;
                }
            }
            None => {}
        }
        if header.frame_type == FrameType::Beacon && self.get_pan_id() != BROADCAST_PAN_ID {
            match header.src_pan {
                Some(pan) if pan == self.get_pan_id() => {}
                _ => return false,
            }
        }
        true
    }
}

impl<'a, P: Phy<'a>, T: Timer<'a, MacTimer>> TimerClient<MacTimer> for TschMac<'a, P, T> {
    fn timer_fired(&self, token: MacTimer) {
        match token {
            MacTimer::SlotTick => self.slot_tick(),
            MacTimer::SetState(event) => self.set_mac_state(event),
            MacTimer::WaitAck => self.handle_wait_ack(),
            MacTimer::AckWaitDone => self.handle_ack_wait_done(),
            MacTimer::RxWaitDone => self.handle_rx_wait_done(),
            MacTimer::SendAck { seq } => self.handle_send_ack(seq),
        }
    }
}

impl<'a, P: Phy<'a>, T: Timer<'a, MacTimer>> PhyClient for TschMac<'a, P, T> {
    fn pd_data_confirm(&self, status: PhyStatus) {
        if self.state.get() != MacState::Sending {
            error!(
                "[{:#06x}] data confirm in {:?}",
                self.get_short_address(),
                self.state.get()
            );
            return;
        }
        let kind = self.tx_frame.borrow().as_ref().map(|frame| frame.kind);
        let Some(kind) = kind else {
            error!("data confirm with no frame in flight");
            return;
        };
        match (status, kind) {
            (PhyStatus::Success, TxFrameKind::Data { ack_requested, .. }) => {
                debug!(
                    "[{:#06x}] transmission complete, ack requested: {}",
                    self.get_short_address(),
                    ack_requested
                );
                if ack_requested {
                    let template = self.timeslot_template.get();
                    self.timer
                        .schedule(template.rx_ack_delay as u32, MacTimer::WaitAck);
                    self.pending_state.set(MacState::AckPending);
                } else {
                    self.trace(SlotTrace::TxData(self.latest_packet_size.get()));
                    if let Some(handle) = self.head_handle() {
                        self.mcps_confirm(handle, McpsDataStatus::Success);
                    }
                    self.remove_head();
                }
            }
            (PhyStatus::Success, TxFrameKind::Ack) => {
                debug!("[{:#06x}] ack transmitted", self.get_short_address());
                self.trace(SlotTrace::RxDataTxAck(self.latest_packet_size.get()));
                *self.tx_frame.borrow_mut() = None;
            }
            (_, TxFrameKind::Data { .. }) => {
                // The PHY refused the frame; surface the failure and drop
                // the head so the queue keeps moving.
                error!(
                    "[{:#06x}] phy rejected transmission: {:?}",
                    self.get_short_address(),
                    status
                );
                if let Some(handle) = self.head_handle() {
                    self.mcps_confirm(handle, McpsDataStatus::FrameTooLong);
                }
                self.remove_head();
            }
            (_, TxFrameKind::Ack) => {
                error!(
                    "[{:#06x}] phy rejected ack transmission: {:?}",
                    self.get_short_address(),
                    status
                );
                *self.tx_frame.borrow_mut() = None;
            }
        }
        self.post_state_tracked(StateEvent::Idle);
    }

    fn pd_data_indication(&self, psdu: &[u8], lqi: u8) {
        let body = match fcs::verify_and_strip(psdu) {
            Ok(body) => body,
            Err(err) => {
                debug!("[{:#06x}] dropping frame: {}", self.get_short_address(), err);
                self.trace(SlotTrace::RxDrop);
                return;
            }
        };
        let (header, header_len) = match Header::decode(body) {
            Ok(decoded) => decoded,
            Err(err) => {
                debug!("[{:#06x}] dropping frame: {}", self.get_short_address(), err);
                self.trace(SlotTrace::RxDrop);
                return;
            }
        };
        let payload = &body[header_len..];
        let indication = DataIndication {
            src_addr_mode: header
                .src_addr
                .map_or(AddressMode::NotPresent, |a| a.address_mode()),
            src_pan_id: header.src_pan,
            src_addr: header.src_addr,
            dst_addr_mode: header
                .dst_addr
                .map_or(AddressMode::NotPresent, |a| a.address_mode()),
            dst_pan_id: header.dst_pan,
            dst_addr: header.dst_addr,
            lqi,
            dsn: header.seq.unwrap_or(0),
        };

        if self.pib.promiscuous_mode.get() {
            if let Some(client) = self.mcps_client.get() {
                client.mcps_data_indication(&indication, payload);
            }
            return;
        }
        if !self.filter_accepts(&header) {
            debug!("[{:#06x}] filter fail", self.get_short_address());
            self.trace(SlotTrace::RxDrop);
            return;
        }

        let state = self.state.get();
        if header.is_ack() && matches!(state, MacState::AckPending | MacState::AckPendingEnd) {
            self.trace(SlotTrace::TxDataRxAck(self.latest_packet_size.get()));
            if let Some(handle) = self.ack_timeout_event.take() {
                self.timer.cancel(handle);
            }
            self.post_state_tracked(StateEvent::Idle);
            let expected = match self.tx_frame.borrow().as_ref().map(|frame| frame.kind) {
                Some(TxFrameKind::Data { seq, .. }) => seq,
                _ => None,
            };
            if header.seq.is_none() || header.seq == expected {
                debug!(
                    "[{:#06x}] ack received, seq {:?}",
                    self.get_short_address(),
                    header.seq
                );
                if let Some(handle) = self.head_handle() {
                    self.mcps_confirm(handle, McpsDataStatus::Success);
                }
                self.remove_head();
            } else {
                debug!(
                    "[{:#06x}] ack with wrong seq {:?}",
                    self.get_short_address(),
                    header.seq
                );
                self.handle_tx_failure();
            }
            if self.state.get() == MacState::AckPendingEnd {
                self.change_state(MacState::Idle);
            } else {
                self.post_state(StateEvent::Idle);
            }
        } else if header.is_data() && matches!(state, MacState::Rx | MacState::PktWaitEnd) {
            debug!(
                "[{:#06x}] frame received from {:?}",
                self.get_short_address(),
                header.src_addr
            );
            self.latest_packet_size.set(psdu.len());
            if let Some(handle) = self.rx_timeout_event.take() {
                self.timer.cancel(handle);
            }
            if let Some(client) = self.mcps_client.get() {
                client.mcps_data_indication(&indication, payload);
            }
            if header.ack_requested {
                let template = self.timeslot_template.get();
                self.timer.schedule(
                    template.tx_ack_delay as u32,
                    MacTimer::SendAck { seq: header.seq },
                );
                self.pending_state.set(MacState::Sending);
            } else {
                self.trace(SlotTrace::RxData(self.latest_packet_size.get()));
            }
            if self.state.get() == MacState::PktWaitEnd {
                self.change_state(MacState::Idle);
            } else {
                self.post_state(StateEvent::Idle);
            }
        } else {
            debug!(
                "[{:#06x}] unexpected {:?} frame in {:?}",
                self.get_short_address(),
                header.frame_type,
                state
            );
            if header.is_data() {
                self.trace(SlotTrace::RxData(psdu.len()));
            }
        }
    }

    fn plme_cca_confirm(&self, status: CcaStatus) {
        if self.state.get() != MacState::Cca {
            debug!("cca confirm in {:?}", self.state.get());
            return;
        }
        if status == CcaStatus::Idle {
            debug!("[{:#06x}] cca clear", self.get_short_address());
            self.set_mac_state(StateEvent::ChannelIdle);
        } else {
            debug!("[{:#06x}] cca busy", self.get_short_address());
            self.trace(SlotTrace::ChannelBusy);
            self.set_mac_state(StateEvent::ChannelAccessFailure);
        }
    }

    fn plme_set_trx_state_confirm(&self, status: PhyStatus) {
        if status == PhyStatus::ForceTrxOff {
            if let Some(handle) = self.set_state_event.take() {
                self.timer.cancel(handle);
            }
            return;
        }
        let now = self.timer.now();
        match self.state.get() {
            MacState::Sending => match status {
                PhyStatus::TxOn | PhyStatus::Success => {
                    let frame = self
                        .tx_frame
                        .borrow()
                        .as_ref()
                        .map(|f| (f.bytes.clone(), f.kind));
                    let Some((bytes, kind)) = frame else {
                        error!("transmitter on with no frame in flight");
                        return;
                    };
                    if matches!(kind, TxFrameKind::Data { .. }) {
                        self.latest_packet_size.set(bytes.len());
                    }
                    self.phy.pd_data_request(&bytes);
                }
                PhyStatus::TrxSwitching | PhyStatus::TrxStart => {}
                _ => error!("trx confirm {:?} while sending", status),
            },
            MacState::Cca => match status {
                PhyStatus::RxOn | PhyStatus::Success => self.phy.plme_cca_request(),
                _ => error!("trx confirm {:?} during cca", status),
            },
            MacState::Rx => match status {
                PhyStatus::RxOn | PhyStatus::Success => {
                    let template = self.timeslot_template.get();
                    debug!(
                        "[{:#06x}] listening for {} us",
                        self.get_short_address(),
                        template.rx_wait
                    );
                    let handle = self
                        .timer
                        .schedule(template.rx_wait as u32, MacTimer::RxWaitDone);
                    self.rx_timeout_event.set(Some(handle));
                }
                _ => error!("trx confirm {:?} while listening", status),
            },
            MacState::Idle | MacState::AckPending => {}
            MacState::PktWaitEnd => {
                if self.wait_done_at.get() == now {
                    // Nothing arrived within the RX window.
                    self.trace(SlotTrace::Idle);
                    self.change_state(MacState::Idle);
                }
            }
            MacState::AckPendingEnd => {
                if self.wait_done_at.get() == now {
                    debug!("[{:#06x}] no ack received", self.get_short_address());
                    self.trace(SlotTrace::WaitAck(self.latest_packet_size.get()));
                    self.handle_tx_failure();
                    self.change_state(MacState::Idle);
                }
            }
        }
    }
}
