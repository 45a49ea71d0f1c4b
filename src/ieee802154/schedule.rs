// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright lrwpan-tsch Contributors 2025.

//! The slotframe/link scheduling database.
//!
//! A slotframe is a repeating cycle of `size` timeslots; a link binds one
//! timeslot of one slotframe to a radio action. At most one link may
//! occupy a `(slotframe, timeslot)` pair. When several slotframes schedule
//! a link at the same ASN, the slotframe with the smallest handle wins, so
//! every device resolves the conflict identically.

use thiserror::Error;

pub const MAX_SLOTFRAMES: usize = 16;
pub const MAX_LINKS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid slotframe or link parameter")]
    InvalidParameter,
    #[error("no slotframe with that handle")]
    SlotframeNotFound,
    #[error("no link with that handle")]
    UnknownLink,
    #[error("table capacity exceeded")]
    MaxExceeded,
}

bitflags::bitflags! {
    /// Link option bits: b0 transmit, b1 receive, b2 shared, b3
    /// timekeeping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkOptions: u8 {
        const TX = 0b0001;
        const RX = 0b0010;
        const SHARED = 0b0100;
        const TIMEKEEPING = 0b1000;
    }
}

/// Advertising links are scheduled exactly like normal ones; the type is
/// carried for the control plane's benefit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Normal,
    Advertising,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slotframe {
    pub handle: u8,
    pub size: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub slotframe_handle: u8,
    pub handle: u16,
    pub timeslot: u16,
    pub channel_offset: u16,
    pub options: LinkOptions,
    pub link_type: LinkType,
    /// Peer short address; 0xffff for broadcast/advertising links.
    pub node_addr: u16,
    /// Per-channel fading bias handed to the PHY, indexed by
    /// `channel - 11`. Broadcast/advertising links carry none.
    pub fading_bias: Option<Vec<f64>>,
    /// Opaque peer IDs, telemetry only.
    pub tx_id: u32,
    pub rx_id: u32,
}

impl Link {
    /// The fading bias the PHY should apply on `channel`; unity when the
    /// link carries no bias vector.
    pub fn fading_bias_for(&self, channel: u8) -> f64 {
        self.fading_bias
            .as_ref()
            .and_then(|bias| bias.get(channel.saturating_sub(super::pib::CHANNEL_BASE) as usize))
            .copied()
            .unwrap_or(1.0)
    }
}

/// All slotframes and links of one device. Slotframes are kept ordered by
/// handle so that `lookup` resolves same-timeslot conflicts
/// deterministically.
#[derive(Debug, Default)]
pub struct ScheduleDb {
    slotframes: Vec<Slotframe>,
    links: Vec<Link>,
}

impl ScheduleDb {
    pub fn add_slotframe(&mut self, handle: u8, size: u16) -> Result<(), ScheduleError> {
        if size == 0 {
            return Err(ScheduleError::InvalidParameter);
        }
        if self.slotframes.iter().any(|sf| sf.handle == handle) {
            return Err(ScheduleError::InvalidParameter);
        }
        if self.slotframes.len() >= MAX_SLOTFRAMES {
            return Err(ScheduleError::MaxExceeded);
        }
        let pos = self
            .slotframes
            .iter()
            .position(|sf| sf.handle > handle)
            .unwrap_or(self.slotframes.len());
        self.slotframes.insert(pos, Slotframe { handle, size });
        Ok(())
    }

    pub fn modify_slotframe(&mut self, handle: u8, size: u16) -> Result<(), ScheduleError> {
        if size == 0 {
            return Err(ScheduleError::InvalidParameter);
        }
        let sf = self
            .slotframes
            .iter_mut()
            .find(|sf| sf.handle == handle)
            .ok_or(ScheduleError::SlotframeNotFound)?;
        sf.size = size;
        Ok(())
    }

    /// Remove a slotframe along with every link scheduled in it.
    pub fn delete_slotframe(&mut self, handle: u8) -> Result<(), ScheduleError> {
        let pos = self
            .slotframes
            .iter()
            .position(|sf| sf.handle == handle)
            .ok_or(ScheduleError::SlotframeNotFound)?;
        self.slotframes.remove(pos);
        self.links.retain(|l| l.slotframe_handle != handle);
        Ok(())
    }

    pub fn add_link(&mut self, link: Link) -> Result<(), ScheduleError> {
        let sf = self
            .slotframes
            .iter()
            .find(|sf| sf.handle == link.slotframe_handle)
            .ok_or(ScheduleError::InvalidParameter)?;
        if link.timeslot >= sf.size {
            return Err(ScheduleError::InvalidParameter);
        }
        let clash = self.links.iter().any(|l| {
            l.slotframe_handle == link.slotframe_handle
                && (l.handle == link.handle || l.timeslot == link.timeslot)
        });
        if clash {
            return Err(ScheduleError::InvalidParameter);
        }
        if self.links.len() >= MAX_LINKS {
            return Err(ScheduleError::MaxExceeded);
        }
        self.links.push(link);
        Ok(())
    }

    pub fn modify_link(&mut self, link: Link) -> Result<(), ScheduleError> {
        let sf_size = self
            .slotframes
            .iter()
            .find(|sf| sf.handle == link.slotframe_handle)
            .map(|sf| sf.size)
            .ok_or(ScheduleError::UnknownLink)?;
        let pos = self
            .links
            .iter()
            .position(|l| l.slotframe_handle == link.slotframe_handle && l.handle == link.handle)
            .ok_or(ScheduleError::UnknownLink)?;
        if link.timeslot >= sf_size {
            return Err(ScheduleError::InvalidParameter);
        }
        let clash = self.links.iter().enumerate().any(|(i, l)| {
            i != pos
                && l.slotframe_handle == link.slotframe_handle
                && l.timeslot == link.timeslot
        });
        if clash {
            return Err(ScheduleError::InvalidParameter);
        }
        self.links[pos] = link;
        Ok(())
    }

    pub fn delete_link(&mut self, slotframe_handle: u8, handle: u16) -> Result<(), ScheduleError> {
        let pos = self
            .links
            .iter()
            .position(|l| l.slotframe_handle == slotframe_handle && l.handle == handle)
            .ok_or(ScheduleError::UnknownLink)?;
        self.links.remove(pos);
        Ok(())
    }

    pub fn slotframes(&self) -> &[Slotframe] {
        &self.slotframes
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// The link active at `asn`, if any. Slotframes are scanned in handle
    /// order, so the smallest handle wins a same-timeslot conflict.
    pub fn lookup(&self, asn: u64) -> Option<&Link> {
        for sf in &self.slotframes {
            let ts = (asn % sf.size as u64) as u16;
            if let Some(link) = self
                .links
                .iter()
                .find(|l| l.slotframe_handle == sf.handle && l.timeslot == ts)
            {
                return Some(link);
            }
        }
        None
    }
}
