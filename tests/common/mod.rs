// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright lrwpan-tsch Contributors 2025.

//! Test scaffolding: a binary-heap discrete-event scheduler, a timer
//! service bound to it, a mock PHY and the radio medium connecting the
//! mock PHYs of several nodes.
//!
//! The medium models what the MAC cares about: propagation-free delivery
//! after the frame's air time, collision of overlapping transmissions on
//! the same channel, and the busy-receiver rule — a transceiver-off
//! request issued mid-reception is confirmed only once the reception
//! completes, after the indication.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use lrwpan_tsch::hil::phy::{CcaStatus, Phy, PhyAttribute, PhyClient, PhyStatus, TrxState};
use lrwpan_tsch::hil::time::{Timer, TimerClient, TimerHandle};
use lrwpan_tsch::ieee802154::device::{
    DataIndication, LinkOp, LinkStatus, MacMonitor, McpsClient, McpsDataStatus, MlmeClient,
    SetLinkRequest, SetSlotframeRequest, SlotTrace, SlotframeOp, SlotframeStatus, TschMode,
    TschModeStatus,
};
use lrwpan_tsch::ieee802154::schedule::{LinkOptions, LinkType};
use lrwpan_tsch::ieee802154::tsch::{MacTimer, TschMac};
use lrwpan_tsch::net::ieee802154::{FrameType, Header};

/// 250 kb/s O-QPSK: 32 us per octet, SHR + PHR add six octets.
fn air_time_us(psdu_len: usize) -> u64 {
    (6 + psdu_len as u64) * 32
}

const CCA_DURATION_US: u64 = 128;

struct Posted {
    id: u64,
    run: Box<dyn FnOnce()>,
}

struct SchedCore {
    now: u64,
    seq: u64,
    next_id: u64,
    cancelled: HashSet<u64>,
    queue: BTreeMap<(u64, u64), Posted>,
}

/// Single-threaded discrete-event scheduler. Events posted for the same
/// timestamp run in posting order.
#[derive(Clone)]
pub struct SimScheduler {
    inner: Rc<RefCell<SchedCore>>,
}

impl SimScheduler {
    pub fn new() -> SimScheduler {
        SimScheduler {
            inner: Rc::new(RefCell::new(SchedCore {
                now: 0,
                seq: 0,
                next_id: 1,
                cancelled: HashSet::new(),
                queue: BTreeMap::new(),
            })),
        }
    }

    pub fn now(&self) -> u64 {
        self.inner.borrow().now
    }

    pub fn post(&self, delay_us: u64, run: Box<dyn FnOnce()>) -> u64 {
        let mut core = self.inner.borrow_mut();
        let at = core.now + delay_us;
        let seq = core.seq;
        core.seq += 1;
        let id = core.next_id;
        core.next_id += 1;
        core.queue.insert((at, seq), Posted { id, run });
        id
    }

    pub fn cancel(&self, id: u64) {
        self.inner.borrow_mut().cancelled.insert(id);
    }

    /// Run every event up to and including `t_end` microseconds.
    pub fn run_until(&self, t_end: u64) {
        loop {
            let next = {
                let mut core = self.inner.borrow_mut();
                match core.queue.keys().next().copied() {
                    None => None,
                    Some(key) if key.0 > t_end => None,
                    Some(key) => {
                        let posted = core.queue.remove(&key).expect("event vanished");
                        core.now = key.0;
                        if core.cancelled.remove(&posted.id) {
                            Some(None)
                        } else {
                            Some(Some(posted))
                        }
                    }
                }
            };
            match next {
                None => break,
                Some(None) => continue,
                Some(Some(posted)) => (posted.run)(),
            }
        }
    }
}

/// Timer service delivering [`MacTimer`] tokens through the scheduler.
pub struct SimTimer {
    sched: SimScheduler,
    client: Rc<Cell<Option<&'static dyn TimerClient<MacTimer>>>>,
}

impl SimTimer {
    pub fn new(sched: &SimScheduler) -> SimTimer {
        SimTimer {
            sched: sched.clone(),
            client: Rc::new(Cell::new(None)),
        }
    }
}

impl Timer<'static, MacTimer> for SimTimer {
    fn set_timer_client(&self, client: &'static dyn TimerClient<MacTimer>) {
        self.client.set(Some(client));
    }

    fn now(&self) -> u64 {
        self.sched.now()
    }

    fn schedule(&self, delay_us: u32, token: MacTimer) -> TimerHandle {
        let client = Rc::clone(&self.client);
        let id = self.sched.post(
            delay_us as u64,
            Box::new(move || {
                if let Some(client) = client.get() {
                    client.timer_fired(token);
                }
            }),
        );
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.sched.cancel(handle.0);
    }
}

pub struct PhyInner {
    sched: SimScheduler,
    medium: Rc<MediumInner>,
    label: u16,
    client: Cell<Option<&'static dyn PhyClient>>,
    trx: Cell<TrxState>,
    channel: Cell<u8>,
    fading_bias: Cell<f64>,
    rx_busy_until: Cell<u64>,
    pending_trx: Cell<Option<TrxState>>,
    trx_requests: RefCell<Vec<TrxState>>,
}

impl PhyInner {
    fn confirm_status(state: TrxState) -> PhyStatus {
        match state {
            TrxState::RxOn => PhyStatus::RxOn,
            TrxState::TxOn => PhyStatus::TxOn,
            TrxState::TrxOff => PhyStatus::TrxOff,
            TrxState::TrxStart => PhyStatus::TrxStart,
            TrxState::TrxSwitching => PhyStatus::TrxSwitching,
            TrxState::ForceTrxOff => PhyStatus::ForceTrxOff,
        }
    }

    fn post_trx_confirm(inner: &Rc<PhyInner>, status: PhyStatus) {
        let sched = inner.sched.clone();
        let inner = Rc::clone(inner);
        sched.post(
            0,
            Box::new(move || {
                if let Some(client) = inner.client.get() {
                    client.plme_set_trx_state_confirm(status);
                }
            }),
        );
    }

    /// Apply a transceiver-off request deferred by an in-flight
    /// reception, once the reception is over.
    fn flush_pending_trx(&self) {
        if self.sched.now() < self.rx_busy_until.get() {
            return;
        }
        if let Some(state) = self.pending_trx.take() {
            self.trx.set(state);
            if let Some(client) = self.client.get() {
                client.plme_set_trx_state_confirm(Self::confirm_status(state));
            }
        }
    }
}

/// Mock PHY. Requests resolve through the scheduler so no confirm ever
/// runs inside the request call.
pub struct SimPhy {
    inner: Rc<PhyInner>,
}

impl SimPhy {
    pub fn new(sched: &SimScheduler, medium: &Medium, label: u16) -> SimPhy {
        let inner = Rc::new(PhyInner {
            sched: sched.clone(),
            medium: Rc::clone(&medium.inner),
            label,
            client: Cell::new(None),
            trx: Cell::new(TrxState::TrxOff),
            channel: Cell::new(11),
            fading_bias: Cell::new(1.0),
            rx_busy_until: Cell::new(0),
            pending_trx: Cell::new(None),
            trx_requests: RefCell::new(Vec::new()),
        });
        medium.inner.phys.borrow_mut().push(Rc::clone(&inner));
        SimPhy { inner }
    }

    pub fn channel(&self) -> u8 {
        self.inner.channel.get()
    }

    pub fn trx_requests(&self) -> Vec<TrxState> {
        self.inner.trx_requests.borrow().clone()
    }
}

impl Phy<'static> for SimPhy {
    fn set_phy_client(&self, client: &'static dyn PhyClient) {
        self.inner.client.set(Some(client));
    }

    fn pd_data_request(&self, psdu: &[u8]) {
        MediumInner::transmit(&self.inner.medium, &self.inner, psdu.to_vec());
    }

    fn plme_set_trx_state_request(&self, state: TrxState) {
        self.inner.trx_requests.borrow_mut().push(state);
        let now = self.inner.sched.now();
        match state {
            TrxState::TrxOff if now < self.inner.rx_busy_until.get() => {
                // Reception in progress: the state change and its confirm
                // wait for the frame to end.
                self.inner.pending_trx.set(Some(state));
            }
            TrxState::ForceTrxOff => {
                self.inner.pending_trx.set(None);
                self.inner.trx.set(TrxState::TrxOff);
                PhyInner::post_trx_confirm(&self.inner, PhyStatus::ForceTrxOff);
            }
            _ => {
                self.inner.pending_trx.set(None);
                self.inner.trx.set(state);
                PhyInner::post_trx_confirm(&self.inner, PhyInner::confirm_status(state));
            }
        }
    }

    fn plme_cca_request(&self) {
        let inner = Rc::clone(&self.inner);
        self.inner.sched.post(
            CCA_DURATION_US,
            Box::new(move || {
                let now = inner.sched.now();
                let channel = inner.channel.get();
                let busy = inner
                    .medium
                    .active
                    .borrow()
                    .iter()
                    .any(|tx| tx.end > now && tx.channel == channel);
                if let Some(client) = inner.client.get() {
                    client.plme_cca_confirm(if busy {
                        CcaStatus::Busy
                    } else {
                        CcaStatus::Idle
                    });
                }
            }),
        );
    }

    fn plme_set_attribute_request(&self, attribute: PhyAttribute) {
        match attribute {
            PhyAttribute::CurrentChannel(channel) => self.inner.channel.set(channel),
            PhyAttribute::LinkFadingBias(bias) => self.inner.fading_bias.set(bias),
        }
        let inner = Rc::clone(&self.inner);
        self.inner.sched.post(
            0,
            Box::new(move || {
                if let Some(client) = inner.client.get() {
                    client.plme_set_attribute_confirm(PhyStatus::Success, attribute.id());
                }
            }),
        );
    }
}

struct ActiveTx {
    id: u64,
    channel: u8,
    end: u64,
    corrupted: Rc<Cell<bool>>,
}

/// One observed transmission, for test assertions.
#[derive(Clone)]
pub struct TxSummary {
    pub time: u64,
    pub sender: u16,
    pub channel: u8,
    pub is_ack: bool,
    pub corrupted: bool,
    pub bytes: Vec<u8>,
}

struct TxRecord {
    time: u64,
    sender: u16,
    channel: u8,
    is_ack: bool,
    corrupted: Rc<Cell<bool>>,
    bytes: Vec<u8>,
}

pub struct MediumInner {
    sched: SimScheduler,
    phys: RefCell<Vec<Rc<PhyInner>>>,
    active: RefCell<Vec<ActiveTx>>,
    records: RefCell<Vec<TxRecord>>,
    drop_acks: Cell<bool>,
    next_tx: Cell<u64>,
}

/// The shared radio channel.
pub struct Medium {
    inner: Rc<MediumInner>,
}

impl Medium {
    pub fn new(sched: &SimScheduler) -> Medium {
        Medium {
            inner: Rc::new(MediumInner {
                sched: sched.clone(),
                phys: RefCell::new(Vec::new()),
                active: RefCell::new(Vec::new()),
                records: RefCell::new(Vec::new()),
                drop_acks: Cell::new(false),
                next_tx: Cell::new(1),
            }),
        }
    }

    /// Swallow every acknowledgment frame without delivering it.
    pub fn set_drop_acks(&self, drop: bool) {
        self.inner.drop_acks.set(drop);
    }

    pub fn records(&self) -> Vec<TxSummary> {
        self.inner
            .records
            .borrow()
            .iter()
            .map(|r| TxSummary {
                time: r.time,
                sender: r.sender,
                channel: r.channel,
                is_ack: r.is_ack,
                corrupted: r.corrupted.get(),
                bytes: r.bytes.clone(),
            })
            .collect()
    }

    pub fn data_records(&self) -> Vec<TxSummary> {
        self.records().into_iter().filter(|r| !r.is_ack).collect()
    }
}

impl MediumInner {
    fn transmit(medium: &Rc<MediumInner>, sender: &Rc<PhyInner>, bytes: Vec<u8>) {
        let now = medium.sched.now();
        let channel = sender.channel.get();
        let end = now + air_time_us(bytes.len());
        let is_ack = Header::decode(&bytes)
            .map(|(h, _)| h.frame_type == FrameType::Acknowledgement)
            .unwrap_or(false);
        let corrupted = Rc::new(Cell::new(false));
        let id = medium.next_tx.get();
        medium.next_tx.set(id + 1);

        medium.records.borrow_mut().push(TxRecord {
            time: now,
            sender: sender.label,
            channel,
            is_ack,
            corrupted: Rc::clone(&corrupted),
            bytes: bytes.clone(),
        });

        if is_ack && medium.drop_acks.get() {
            // The frame vanishes in the ether; the sender still sees a
            // completed transmission.
            let sender = Rc::clone(sender);
            medium.sched.post(
                end - now,
                Box::new(move || {
                    if let Some(client) = sender.client.get() {
                        client.pd_data_confirm(PhyStatus::Success);
                    }
                }),
            );
            return;
        }

        let mut receivers = Vec::new();
        {
            let mut active = medium.active.borrow_mut();
            active.retain(|tx| tx.end > now);
            for tx in active.iter() {
                if tx.channel == channel {
                    tx.corrupted.set(true);
                    corrupted.set(true);
                }
            }
            active.push(ActiveTx {
                id,
                channel,
                end,
                corrupted: Rc::clone(&corrupted),
            });
        }
        for phy in medium.phys.borrow().iter() {
            if Rc::ptr_eq(phy, sender) {
                continue;
            }
            if phy.trx.get() == TrxState::RxOn && phy.channel.get() == channel {
                phy.rx_busy_until
                    .set(phy.rx_busy_until.get().max(end));
                receivers.push(Rc::clone(phy));
            }
        }

        let medium_rc = Rc::clone(medium);
        let sender_rc = Rc::clone(sender);
        medium.sched.post(
            end - now,
            Box::new(move || {
                if let Some(client) = sender_rc.client.get() {
                    client.pd_data_confirm(PhyStatus::Success);
                }
                for phy in &receivers {
                    if !corrupted.get() {
                        if let Some(client) = phy.client.get() {
                            client.pd_data_indication(&bytes, 255);
                        }
                    }
                }
                for phy in &receivers {
                    phy.flush_pending_trx();
                }
                medium_rc.active.borrow_mut().retain(|tx| tx.id != id);
            }),
        );
    }
}

/// Upper layer and telemetry recorder for one node.
#[derive(Default)]
pub struct Recorder {
    pub confirms: RefCell<Vec<(u8, McpsDataStatus)>>,
    pub indications: RefCell<Vec<(DataIndication, Vec<u8>)>>,
    pub traces: RefCell<Vec<SlotTrace>>,
    pub slotframe_confirms: RefCell<Vec<(u8, SlotframeStatus)>>,
    pub link_confirms: RefCell<Vec<(u8, u16, LinkStatus)>>,
    pub mode_confirms: RefCell<Vec<(TschMode, TschModeStatus)>>,
}

impl Recorder {
    pub fn trace_count(&self, wanted: SlotTrace) -> usize {
        self.traces.borrow().iter().filter(|t| **t == wanted).count()
    }

    pub fn trace_count_by(&self, pred: impl Fn(&SlotTrace) -> bool) -> usize {
        self.traces.borrow().iter().filter(|t| pred(t)).count()
    }
}

impl McpsClient for Recorder {
    fn mcps_data_confirm(&self, msdu_handle: u8, status: McpsDataStatus) {
        self.confirms.borrow_mut().push((msdu_handle, status));
    }

    fn mcps_data_indication(&self, indication: &DataIndication, msdu: &[u8]) {
        self.indications
            .borrow_mut()
            .push((indication.clone(), msdu.to_vec()));
    }
}

impl MlmeClient for Recorder {
    fn mlme_set_slotframe_confirm(&self, handle: u8, status: SlotframeStatus) {
        self.slotframe_confirms.borrow_mut().push((handle, status));
    }

    fn mlme_set_link_confirm(&self, slotframe_handle: u8, link_handle: u16, status: LinkStatus) {
        self.link_confirms
            .borrow_mut()
            .push((slotframe_handle, link_handle, status));
    }

    fn mlme_tsch_mode_confirm(&self, mode: TschMode, status: TschModeStatus) {
        self.mode_confirms.borrow_mut().push((mode, status));
    }
}

impl MacMonitor for Recorder {
    fn slot_trace(&self, slot_trace: SlotTrace) {
        self.traces.borrow_mut().push(slot_trace);
    }
}

/// A fully wired node: MAC, mock PHY and recording upper layer.
pub struct Node {
    pub mac: &'static TschMac<'static, SimPhy, SimTimer>,
    pub phy: &'static SimPhy,
    pub upper: &'static Recorder,
}

pub fn build_node(
    sched: &SimScheduler,
    medium: &Medium,
    short_address: u16,
    pan_id: u16,
    seed: u64,
) -> Node {
    let phy: &'static SimPhy = Box::leak(Box::new(SimPhy::new(sched, medium, short_address)));
    let timer: &'static SimTimer = Box::leak(Box::new(SimTimer::new(sched)));
    let mac: &'static TschMac<'static, SimPhy, SimTimer> =
        Box::leak(Box::new(TschMac::new(phy, timer, seed)));
    let upper: &'static Recorder = Box::leak(Box::new(Recorder::default()));

    phy.set_phy_client(mac);
    timer.set_timer_client(mac);
    mac.set_mcps_client(upper);
    mac.set_mlme_client(upper);
    mac.set_monitor(upper);
    mac.set_pan_id(pan_id);
    mac.set_short_address(short_address);
    mac.initialize();

    Node { mac, phy, upper }
}

pub fn slotframe(handle: u8, size: u16) -> SetSlotframeRequest {
    SetSlotframeRequest {
        handle,
        operation: SlotframeOp::Add,
        size,
    }
}

pub fn link_request(
    operation: LinkOp,
    slotframe_handle: u8,
    link_handle: u16,
    timeslot: u16,
    options: LinkOptions,
    node_addr: u16,
) -> SetLinkRequest {
    SetLinkRequest {
        operation,
        link_handle,
        slotframe_handle,
        timeslot,
        channel_offset: 0,
        options,
        link_type: LinkType::Normal,
        node_addr,
        fading_bias: None,
        tx_id: 0,
        rx_id: 0,
    }
}
