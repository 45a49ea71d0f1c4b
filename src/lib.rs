// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright lrwpan-tsch Contributors 2025.

//! IEEE 802.15.4e TSCH MAC sublayer for discrete-event network simulation.
//!
//! The crate provides the per-device TSCH state machine, the slotframe/link
//! scheduling database and the 802.15.4/15.4e frame codec. The physical
//! layer and the event scheduler are collaborators behind the traits in
//! [`hil`]: a PHY implementation receives requests and answers with
//! confirms/indications, a timer service posts [`ieee802154::tsch::MacTimer`]
//! events back into the MAC at logical timestamps.
//!
//! Usage
//! -----
//!
//! Wire a MAC to its collaborators, configure the schedule through the MLME
//! primitives, then switch TSCH mode on:
//!
//! ```rust,ignore
//! let mac = TschMac::new(phy, timer, seed);
//! phy.set_phy_client(mac);
//! timer.set_timer_client(mac);
//! mac.set_mcps_client(upper);
//! mac.set_mlme_client(upper);
//!
//! mac.mlme_set_slotframe_request(&SetSlotframeRequest {
//!     handle: 0,
//!     operation: SlotframeOp::Add,
//!     size: 101,
//! });
//! mac.mlme_set_link_request(&tx_link);
//! mac.mlme_tsch_mode_request(TschMode::On);
//! ```

#![forbid(unsafe_code)]

pub mod hil;
pub mod ieee802154;
pub mod net;
