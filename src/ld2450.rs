// SPDX-License-Identifier: Apache-2.0

//! LD2450 coordinate tracking sensor protocol.
//!
//! Data frames carry three fixed-size target slots between a distinct
//! header and footer marker pair. There is no count field: a sensor seeing
//! fewer live targets still emits zero-filled slots.

use crate::link::{seek_header, Error, FrameSync, Link, RadarModule, Transport};
use crate::poll::Poller;
use log::{debug, info};
use std::sync::{
    atomic::AtomicBool,
    Arc, Mutex,
};

/// Data frame header marker.
pub const DATA_HEADER: [u8; 4] = [0xAA, 0xFF, 0x03, 0x00];

/// Data frame footer marker.
pub const DATA_FOOTER: [u8; 2] = [0x55, 0xCC];

/// Target slots per frame.
pub const TARGET_SLOTS: usize = 3;

/// Bytes per target slot.
pub const SLOT_LEN: usize = 8;

/// Body length following the header marker: three slots plus the footer.
const BODY_LEN: usize = TARGET_SLOTS * SLOT_LEN + DATA_FOOTER.len();

/// Fixed encoded length of a region filter configuration: the mode
/// selector plus two zones of two corner points each.
pub const REGION_FILTER_LEN: usize = 20;

// tracking mode commands
const CMD_SINGLE_TARGET: &[u8] = &[0x02, 0x00, 0x80, 0x00];
const CMD_MULTI_TARGET: &[u8] = &[0x02, 0x00, 0x90, 0x00];
// region filter commands
const CMD_REGION_READ: &[u8] = &[0x02, 0x00, 0xC1, 0x00];
const CMD_REGION_WRITE: &[u8] = &[0x16, 0x00, 0xC2, 0x00];

// region filter configuration offset in the read response
const REF_REGION_CONFIG: usize = 10;

/// One decoded tracking slot. Empty slots are zero-filled by the sensor
/// and decode to an all-zero target rather than being absent.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TrackedTarget {
    /// Lateral position in mm, sensor-origin relative
    pub x: i16,
    /// Forward position in mm
    pub y: i16,
    /// Radial speed in cm/s, negative toward the sensor
    pub speed: i16,
    /// Distance resolution in mm
    pub resolution: u16,
    /// Planar distance from the sensor origin in mm
    pub distance: f64,
}

/// Decode one 8-byte target slot.
///
/// The vendor driver read speed unsigned and re-derived the sign by hand
/// with a transform inconsistent with how x and y are read; speed is read
/// here as plain signed little-endian like the other coordinates.
pub fn decode_target(slot: &[u8; SLOT_LEN]) -> TrackedTarget {
    let x = i16::from_le_bytes([slot[0], slot[1]]);
    let y = i16::from_le_bytes([slot[2], slot[3]]);
    let speed = i16::from_le_bytes([slot[4], slot[5]]);
    let resolution = u16::from_le_bytes([slot[6], slot[7]]);
    let distance = ((x as f64).powi(2) + (y as f64).powi(2)).sqrt();
    TrackedTarget {
        x,
        y,
        speed,
        resolution,
        distance,
    }
}

/// Decode the frame body following the header marker: three positional
/// slots and the footer marker. A malformed body yields no frame.
pub fn decode_frame(body: &[u8]) -> Option<[TrackedTarget; TARGET_SLOTS]> {
    if body.len() < BODY_LEN {
        debug!("short tracking frame ({} bytes), skipping", body.len());
        return None;
    }
    if body[TARGET_SLOTS * SLOT_LEN..BODY_LEN] != DATA_FOOTER {
        debug!("tracking frame footer mismatch, skipping: {:02X?}", body);
        return None;
    }

    let mut targets = [TrackedTarget::default(); TARGET_SLOTS];
    for (i, slot) in body[..TARGET_SLOTS * SLOT_LEN]
        .chunks_exact(SLOT_LEN)
        .enumerate()
    {
        targets[i] = decode_target(slot.try_into().unwrap());
    }
    Some(targets)
}

/// Read one tracking frame from the transport.
pub fn read_frame<T: Transport>(
    transport: &mut T,
    sync: &mut FrameSync,
    cancel: &AtomicBool,
) -> Option<[TrackedTarget; TARGET_SLOTS]> {
    if !seek_header(transport, sync, &DATA_HEADER, cancel) {
        return None;
    }

    let body = match transport.read(BODY_LEN) {
        Ok(body) => body,
        Err(err) => {
            debug!("read failed mid-frame, skipping: {}", err);
            return None;
        }
    };

    if !body.is_empty() {
        sync.mark_success();
    }
    decode_frame(&body)
}

/// Region filter behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    /// No region filtering
    #[default]
    Disabled,
    /// Only report targets inside the zones
    Include,
    /// Ignore targets inside the zones
    Exclude,
}

impl FilterMode {
    fn selector(self) -> [u8; 4] {
        match self {
            FilterMode::Disabled => [0x00, 0x00, 0x00, 0x00],
            FilterMode::Include => [0x01, 0x00, 0x00, 0x00],
            FilterMode::Exclude => [0x02, 0x00, 0x00, 0x00],
        }
    }

    fn from_selector(selector: &[u8]) -> Result<FilterMode, Error> {
        match selector[0] {
            0 => Ok(FilterMode::Disabled),
            1 => Ok(FilterMode::Include),
            2 => Ok(FilterMode::Exclude),
            other => Err(Error::range("filter_mode", other as i64, 0, 2)),
        }
    }
}

/// Axis-aligned rectangular zone given by two diagonal corners, mm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Zone {
    /// First corner (x, y)
    pub p1: (i16, i16),
    /// Diagonally opposite corner (x, y)
    pub p2: (i16, i16),
}

/// Region filter configuration: behavior plus up to two zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionFilter {
    /// Filter behavior
    pub mode: FilterMode,
    /// First zone
    pub zone1: Option<Zone>,
    /// Second zone
    pub zone2: Option<Zone>,
}

impl RegionFilter {
    /// Encode as the mode selector followed by zone corner coordinates as
    /// signed 16-bit little-endian, zero-padded to the fixed length.
    pub fn encode(&self) -> [u8; REGION_FILTER_LEN] {
        let mut buf = [0u8; REGION_FILTER_LEN];
        buf[..4].copy_from_slice(&self.mode.selector());
        let mut off = 4;
        for zone in [self.zone1, self.zone2].into_iter().flatten() {
            for (x, y) in [zone.p1, zone.p2] {
                buf[off..off + 2].copy_from_slice(&x.to_le_bytes());
                buf[off + 2..off + 4].copy_from_slice(&y.to_le_bytes());
                off += 4;
            }
        }
        buf
    }

    /// Decode the same layout back; a zero-filled zone slot reads as unset.
    pub fn decode(buf: &[u8]) -> Result<RegionFilter, Error> {
        if buf.len() < REGION_FILTER_LEN {
            return Err(Error::ShortResponse(buf.len()));
        }
        let mode = FilterMode::from_selector(&buf[..4])?;
        let corner = |off: usize| i16::from_le_bytes([buf[off], buf[off + 1]]);
        let zone = |off: usize| {
            let zone = Zone {
                p1: (corner(off), corner(off + 2)),
                p2: (corner(off + 4), corner(off + 6)),
            };
            (zone != Zone::default()).then_some(zone)
        };
        Ok(RegionFilter {
            mode,
            zone1: zone(4),
            zone2: zone(12),
        })
    }
}

/// Driver for the LD2450 tracking sensor.
///
/// Transport access is serialized behind one lock shared with the polling
/// task, like [`crate::ld2410::Ld2410`].
pub struct Ld2450<T: Transport> {
    link: Arc<Mutex<Link<T>>>,
    poller: Poller<[TrackedTarget; TARGET_SLOTS]>,
}

impl<T: Transport + 'static> Ld2450<T> {
    /// Create a driver over an open transport at the given baud code.
    pub fn new(transport: T, baud_code: u16) -> Ld2450<T> {
        Ld2450 {
            link: Arc::new(Mutex::new(Link::new(transport, baud_code))),
            poller: Poller::new(),
        }
    }

    /// Track only the single strongest target.
    pub fn set_single_target_tracking(&self) -> Result<(), Error> {
        info!("enabling single target tracking");
        self.link.lock().unwrap().send_command(CMD_SINGLE_TARGET)?;
        Ok(())
    }

    /// Track up to three targets.
    pub fn set_multi_target_tracking(&self) -> Result<(), Error> {
        info!("enabling multi target tracking");
        self.link.lock().unwrap().send_command(CMD_MULTI_TARGET)?;
        Ok(())
    }

    /// Install a region filter on the module.
    pub fn set_region_filter(&self, filter: &RegionFilter) -> Result<(), Error> {
        info!("setting region filter: {:?}", filter);
        let mut payload = CMD_REGION_WRITE.to_vec();
        payload.extend_from_slice(&filter.encode());
        self.link.lock().unwrap().send_command(&payload)?;
        Ok(())
    }

    /// Read back the configured region filter.
    pub fn read_region_filter(&self) -> Result<RegionFilter, Error> {
        info!("reading region filter");
        let ret = self.link.lock().unwrap().send_command(CMD_REGION_READ)?;
        if ret.len() < REF_REGION_CONFIG + REGION_FILTER_LEN {
            return Err(Error::ShortResponse(ret.len()));
        }
        RegionFilter::decode(&ret[REF_REGION_CONFIG..])
    }

    /// Read one frame of tracked targets synchronously, bypassing the
    /// polling task.
    pub fn get_radar_data(&self) -> Option<[TrackedTarget; TARGET_SLOTS]> {
        debug!("getting raw dataframe");
        let mut link = self.link.lock().unwrap();
        let cancel = link.cancel_token();
        let (transport, sync) = link.parts();
        read_frame(transport, sync, &cancel)
    }

    /// Latest targets published by the polling task.
    pub fn get_data(&self) -> Option<[TrackedTarget; TARGET_SLOTS]> {
        self.poller.latest()
    }

    /// Start the background polling task.
    pub fn start(&mut self) {
        let link = self.link.clone();
        let cancel = self.link.lock().unwrap().cancel_token();
        self.poller.start(cancel, move || {
            let mut link = link.lock().unwrap();
            let token = link.cancel_token();
            let (transport, sync) = link.parts();
            read_frame(transport, sync, &token)
        });
    }

    /// Stop the polling task. Safe to call when not running.
    pub fn stop(&mut self) {
        self.poller.stop();
    }
}

impl<T: Transport + 'static> RadarModule<T> for Ld2450<T> {
    fn link(&self) -> &Mutex<Link<T>> {
        &self.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockTransport;
    use crate::link::DEFAULT_BAUD_CODE;

    #[test]
    fn test_decode_target_slot() {
        let slot = [0x64, 0x00, 0xC8, 0x00, 0x0A, 0x00, 0x01, 0x00];
        let target = decode_target(&slot);
        assert_eq!(target.x, 100);
        assert_eq!(target.y, 200);
        assert_eq!(target.speed, 10);
        assert_eq!(target.resolution, 1);
        assert!((target.distance - 223.60679).abs() < 1e-3);
    }

    #[test]
    fn test_decode_target_negative_coordinates() {
        // -100 mm x, -50 cm/s approach speed
        let slot = [0x9C, 0xFF, 0xC8, 0x00, 0xCE, 0xFF, 0x28, 0x00];
        let target = decode_target(&slot);
        assert_eq!(target.x, -100);
        assert_eq!(target.y, 200);
        assert_eq!(target.speed, -50);
        assert_eq!(target.resolution, 40);
    }

    #[test]
    fn test_decode_frame_zero_slots() {
        let mut body = vec![0u8; TARGET_SLOTS * SLOT_LEN];
        body.extend_from_slice(&DATA_FOOTER);
        let targets = decode_frame(&body).unwrap();
        assert_eq!(targets.len(), 3);
        for target in targets {
            assert_eq!(target, TrackedTarget::default());
            assert_eq!(target.distance, 0.0);
        }
    }

    #[test]
    fn test_decode_frame_footer_mismatch() {
        let mut body = vec![0u8; TARGET_SLOTS * SLOT_LEN];
        body.extend_from_slice(&[0x55, 0xCD]);
        assert!(decode_frame(&body).is_none());
        assert!(decode_frame(&body[..10]).is_none());
    }

    #[test]
    fn test_read_frame_scenario() {
        // AA FF 03 00 + three slots + 55 CC
        let mut script = DATA_HEADER.to_vec();
        script.extend_from_slice(&[0x64, 0x00, 0xC8, 0x00, 0x0A, 0x00, 0x01, 0x00]);
        script.extend_from_slice(&[0u8; SLOT_LEN]);
        script.extend_from_slice(&[0u8; SLOT_LEN]);
        script.extend_from_slice(&DATA_FOOTER);

        let mut transport = MockTransport::new(&script);
        let mut sync = FrameSync::new();
        let cancel = AtomicBool::new(false);
        let targets = read_frame(&mut transport, &mut sync, &cancel).unwrap();

        assert_eq!(targets.len(), 3);
        assert_eq!(targets[0].x, 100);
        assert_eq!(targets[0].y, 200);
        assert_eq!(targets[0].speed, 10);
        assert_eq!(targets[0].resolution, 1);
        assert!((targets[0].distance - 223.6).abs() < 0.1);
        assert_eq!(targets[1], TrackedTarget::default());
        assert_eq!(targets[2], TrackedTarget::default());
    }

    #[test]
    fn test_region_filter_roundtrip() {
        let filter = RegionFilter {
            mode: FilterMode::Include,
            zone1: Some(Zone {
                p1: (-100, 100),
                p2: (100, 300),
            }),
            zone2: Some(Zone {
                p1: (200, 200),
                p2: (400, 600),
            }),
        };
        let encoded = filter.encode();
        assert_eq!(encoded.len(), REGION_FILTER_LEN);
        assert_eq!(RegionFilter::decode(&encoded).unwrap(), filter);
    }

    #[test]
    fn test_region_filter_single_zone_padding() {
        let filter = RegionFilter {
            mode: FilterMode::Exclude,
            zone1: Some(Zone {
                p1: (-100, 100),
                p2: (100, 100),
            }),
            zone2: None,
        };
        let encoded = filter.encode();
        assert_eq!(encoded[..4], [0x02, 0x00, 0x00, 0x00]);
        // the unused second zone slot stays zero-filled
        assert!(encoded[12..].iter().all(|b| *b == 0));

        let decoded = RegionFilter::decode(&encoded).unwrap();
        assert_eq!(decoded.mode, FilterMode::Exclude);
        assert_eq!(decoded.zone1, filter.zone1);
        assert!(decoded.zone2.is_none());
    }

    #[test]
    fn test_region_filter_decode_rejects_bad_mode() {
        let mut buf = [0u8; REGION_FILTER_LEN];
        buf[0] = 9;
        assert!(RegionFilter::decode(&buf).is_err());
        assert!(RegionFilter::decode(&buf[..10]).is_err());
    }

    #[test]
    fn test_set_region_filter_fixed_command_length() {
        let radar = Ld2450::new(MockTransport::new(&[]), DEFAULT_BAUD_CODE);
        let filter = RegionFilter {
            mode: FilterMode::Exclude,
            zone1: Some(Zone {
                p1: (-100, 100),
                p2: (100, 100),
            }),
            zone2: None,
        };
        radar.set_region_filter(&filter).unwrap();

        let mut link = radar.link.lock().unwrap();
        let (transport, _) = link.parts();
        assert_eq!(transport.writes.len(), 3);
        // header + command word + selector + two zone slots + footer
        assert_eq!(transport.writes[1].len(), 4 + 4 + REGION_FILTER_LEN + 4);
    }

    #[test]
    fn test_read_region_filter() {
        let filter = RegionFilter {
            mode: FilterMode::Include,
            zone1: Some(Zone {
                p1: (10, 20),
                p2: (30, 40),
            }),
            zone2: None,
        };
        let mut ack = vec![0u8; REF_REGION_CONFIG];
        ack.extend_from_slice(&filter.encode());
        let radar = Ld2450::new(
            MockTransport::with_responses(vec![vec![], ack, vec![]]),
            DEFAULT_BAUD_CODE,
        );
        assert_eq!(radar.read_region_filter().unwrap(), filter);
    }

    #[test]
    fn test_commands_usable_after_stop() {
        let mut radar = Ld2450::new(MockTransport::new(&[]), DEFAULT_BAUD_CODE);
        radar.start();
        radar.stop();

        radar.set_single_target_tracking().unwrap();
        let mut link = radar.link.lock().unwrap();
        let (transport, _) = link.parts();
        assert_eq!(transport.writes.len(), 3);
    }

    #[test]
    fn test_tracking_mode_commands() {
        let radar = Ld2450::new(MockTransport::new(&[]), DEFAULT_BAUD_CODE);
        radar.set_single_target_tracking().unwrap();
        radar.set_multi_target_tracking().unwrap();

        let mut link = radar.link.lock().unwrap();
        let (transport, _) = link.parts();
        assert_eq!(transport.writes.len(), 6);
        assert_eq!(&transport.writes[1][4..8], CMD_SINGLE_TARGET);
        assert_eq!(&transport.writes[4][4..8], CMD_MULTI_TARGET);
    }
}
