// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright lrwpan-tsch Contributors 2025.

//! Upper-layer primitives of the TSCH MAC.
//!
//! Requests flow into the MAC as plain parameter structs; outcomes flow
//! back through the [`McpsClient`] and [`MlmeClient`] callbacks, mirroring
//! the MCPS/MLME SAPs of IEEE 802.15.4e. [`MacMonitor`] is a telemetry tap
//! with no-op defaults; it reports what kind of slot just happened, not
//! protocol state.

use crate::net::ieee802154::{AddressMode, MacAddress, PanID};

use super::schedule::{LinkOptions, LinkType};

/// Status of an MCPS-DATA.confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpsDataStatus {
    Success,
    FrameTooLong,
    InvalidAddress,
    ChannelAccessFailure,
    NoAck,
}

/// MCPS-DATA.request parameters. The payload travels alongside.
#[derive(Debug, Clone)]
pub struct DataRequest {
    pub src_addr_mode: AddressMode,
    pub dst_addr_mode: AddressMode,
    pub dst_pan_id: PanID,
    pub dst_addr: u16,
    pub msdu_handle: u8,
    pub ack_tx: bool,
    /// 15.4e frame-control options.
    pub pan_id_suppressed: bool,
    /// Carried for SAP parity; IE insertion on data frames is not
    /// supported, only ACKs carry IEs.
    pub ies_included: bool,
    pub seq_num_suppressed: bool,
}

impl Default for DataRequest {
    fn default() -> DataRequest {
        DataRequest {
            src_addr_mode: AddressMode::Short,
            dst_addr_mode: AddressMode::Short,
            dst_pan_id: 0,
            dst_addr: 0,
            msdu_handle: 0,
            ack_tx: false,
            pan_id_suppressed: false,
            ies_included: false,
            seq_num_suppressed: false,
        }
    }
}

/// MCPS-DATA.indication parameters. The payload travels alongside.
#[derive(Debug, Clone, PartialEq)]
pub struct DataIndication {
    pub src_addr_mode: AddressMode,
    pub src_pan_id: Option<PanID>,
    pub src_addr: Option<MacAddress>,
    pub dst_addr_mode: AddressMode,
    pub dst_pan_id: Option<PanID>,
    pub dst_addr: Option<MacAddress>,
    pub lqi: u8,
    /// Received sequence number; zero when the sender suppressed it.
    pub dsn: u8,
}

/// Client receiving MCPS confirms and indications.
pub trait McpsClient {
    fn mcps_data_confirm(&self, msdu_handle: u8, status: McpsDataStatus);
    fn mcps_data_indication(&self, indication: &DataIndication, msdu: &[u8]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotframeOp {
    Add,
    Delete,
    Modify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetSlotframeRequest {
    pub handle: u8,
    pub operation: SlotframeOp,
    pub size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotframeStatus {
    Success,
    InvalidParameter,
    SlotframeNotFound,
    MaxSlotframesExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOp {
    Add,
    Delete,
    Modify,
}

/// MLME-SET-LINK.request parameters.
#[derive(Debug, Clone)]
pub struct SetLinkRequest {
    pub operation: LinkOp,
    pub link_handle: u16,
    pub slotframe_handle: u8,
    pub timeslot: u16,
    pub channel_offset: u16,
    pub options: LinkOptions,
    pub link_type: LinkType,
    /// Peer short address; 0xffff for broadcast/advertising links.
    pub node_addr: u16,
    /// Per-channel fading bias installed on the link, indexed by
    /// `channel - 11`.
    pub fading_bias: Option<Vec<f64>>,
    pub tx_id: u32,
    pub rx_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Success,
    InvalidParameter,
    UnknownLink,
    MaxLinksExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TschMode {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TschModeStatus {
    Success,
    NoSync,
}

/// Client receiving MLME confirms.
pub trait MlmeClient {
    fn mlme_set_slotframe_confirm(&self, handle: u8, status: SlotframeStatus);
    fn mlme_set_link_confirm(&self, slotframe_handle: u8, link_handle: u16, status: LinkStatus);
    fn mlme_tsch_mode_confirm(&self, mode: TschMode, status: TschModeStatus);
}

/// What a timeslot amounted to, from this device's point of view. Sizes
/// are MPDU lengths in octets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTrace {
    /// No link scheduled; radio off.
    Sleep,
    /// TX link but nothing queued for its peer.
    EmptyBuffer,
    /// Listened, nothing arrived.
    Idle,
    /// CCA found the channel occupied.
    ChannelBusy,
    /// A frame exhausted its retries and was dropped.
    MaxRetries,
    /// A received frame failed FCS, parsing or filtering.
    RxDrop,
    TxData(usize),
    RxData(usize),
    TxDataRxAck(usize),
    RxDataTxAck(usize),
    /// Sent data, listened for the ACK, never got it.
    WaitAck(usize),
}

/// Telemetry tap. All methods default to no-ops.
pub trait MacMonitor {
    fn slot_trace(&self, _trace: SlotTrace) {}

    /// Fired when the hopping machinery retunes for the active link:
    /// opaque peer IDs, the channel and the fading bias in dB.
    fn link_information(&self, _rx_id: u32, _tx_id: u32, _channel: u8, _fading_bias_db: f64) {}
}
