//! `--devices` output
//!
//! Text lines look like
//! `Bus: 1, Address: 12, Port: 3, UDID:…, Name:iPhone, VID=05ac, PID=12a8, Activated=1`.
//! JSON output is an array of objects with the keys `bus`, `addr`, `port`,
//! `udid`, `name`, `vid`, `pid` and `activated`, or a bare object per line
//! when a UDID was given.

use crate::usb::{ActivationState, DeviceSummary};
use serde::Serialize;
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListingFormat {
    pub json: bool,
    /// VID/PID as decimal instead of 4-digit hex
    pub decimal: bool,
}

#[derive(Debug, Serialize)]
struct ListingEntry<'a> {
    bus: u8,
    addr: u8,
    port: u8,
    udid: &'a str,
    name: &'a str,
    vid: String,
    pid: String,
    activated: u8,
}

impl<'a> ListingEntry<'a> {
    fn new(summary: &'a DeviceSummary, format: ListingFormat) -> Self {
        let id = |value: u16| {
            if format.decimal {
                value.to_string()
            } else {
                format!("{:04x}", value)
            }
        };

        Self {
            bus: summary.bus,
            addr: summary.address,
            port: summary.port,
            udid: summary.serial.as_deref().unwrap_or_default(),
            name: summary.product.as_deref().unwrap_or_default(),
            vid: id(summary.vendor_id),
            pid: id(summary.product_id),
            activated: u8::from(summary.state == ActivationState::Enabled),
        }
    }
}

/// Write the listing for `devices`, keeping only `udid` when given
pub fn write_listing<W: Write>(
    out: &mut W,
    devices: &[DeviceSummary],
    udid: Option<&str>,
    format: ListingFormat,
) -> io::Result<()> {
    let entries: Vec<ListingEntry<'_>> = devices
        .iter()
        .filter(|d| udid.is_none_or(|u| d.serial.as_deref() == Some(u)))
        .map(|d| ListingEntry::new(d, format))
        .collect();

    if !format.json {
        for e in &entries {
            writeln!(
                out,
                "Bus: {}, Address: {}, Port: {}, UDID:{}, Name:{}, VID={}, PID={}, Activated={}",
                e.bus, e.addr, e.port, e.udid, e.name, e.vid, e.pid, e.activated
            )?;
        }
        return Ok(());
    }

    if udid.is_some() {
        for e in &entries {
            serde_json::to_writer(&mut *out, e)?;
            writeln!(out)?;
        }
        return Ok(());
    }

    writeln!(out, "[")?;
    for (i, e) in entries.iter().enumerate() {
        serde_json::to_writer(&mut *out, e)?;
        if i + 1 < entries.len() {
            write!(out, ",")?;
        }
        writeln!(out)?;
    }
    writeln!(out, "]")
}
