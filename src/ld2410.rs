// SPDX-License-Identifier: Apache-2.0

//! LD2410 presence sensor protocol.
//!
//! Data frames carry a target type, moving/static distances and energies
//! and, in engineering mode, per-gate energy arrays. Frames are located
//! with the sliding window from the link layer; the body length depends on
//! whether engineering mode is active, and the device's own mode marker
//! wins over the driver's belief.

use crate::link::{
    seek_header, validate_range, Error, FrameSync, Link, RadarModule, Transport,
};
use crate::poll::Poller;
use log::{debug, info, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

/// Data frame header marker.
pub const DATA_HEADER: [u8; 4] = [0xF4, 0xF3, 0xF2, 0xF1];

/// Trailer closing every data frame: tail byte, check byte and the footer
/// marker.
pub const DATA_TRAILER: [u8; 6] = [0x55, 0x00, 0xF8, 0xF7, 0xF6, 0xF5];

/// Body length following the header marker of a normal data frame.
pub const NORMAL_PACKET_LEN: usize = 19;

/// Body length in engineering mode: two extra 9-byte gate energy arrays.
pub const ENG_PACKET_LEN: usize = NORMAL_PACKET_LEN + 18;

/// Number of distance gates reported by the sensor.
pub const GATES: usize = 9;

/// Highest configurable gate index.
pub const GATE_MAX: u8 = 8;

/// Sensitivity upper bound, percent.
pub const SENS_MAX: u8 = 100;

// body field offsets, relative to the first byte after the header marker
const REF_DATA_TYPE: usize = 2;
const REF_TARGET_TYPE: usize = 4;
const REF_MOVE_DIST: usize = 5;
const REF_MOVE_ENERGY: usize = 7;
const REF_STATIC_DIST: usize = 8;
const REF_STATIC_ENERGY: usize = 10;
const REF_DETECT_DIST: usize = 11;
const REF_MOVE_GATE_ENERGY: usize = 13;
const REF_STATIC_GATE_ENERGY: usize = 22;

/// Data-type byte value marking an engineering mode frame.
const ENG_CHECK: u8 = 0x01;

// configuration command opcodes
const CMD_PARAM_EDIT: &[u8] = &[0x14, 0x00, 0x60, 0x00];
const CMD_PARAM_READ: &[u8] = &[0x02, 0x00, 0x61, 0x00];
const CMD_ENG_MODE_ENABLE: &[u8] = &[0x02, 0x00, 0x62, 0x00];
const CMD_ENG_MODE_DISABLE: &[u8] = &[0x02, 0x00, 0x63, 0x00];
const CMD_GATE_SENS_EDIT: &[u8] = &[0x14, 0x00, 0x64, 0x00];

// parameter words inside the edit commands
const PARAM_MAX_MOVING_GATE: [u8; 2] = [0x00, 0x00];
const PARAM_MAX_STATIC_GATE: [u8; 2] = [0x01, 0x00];
const PARAM_EMPTY_DURATION: [u8; 2] = [0x02, 0x00];
const PARAM_GATE_SELECT: [u8; 2] = [0x00, 0x00];
const PARAM_MOVING_GATE_WORD: [u8; 2] = [0x01, 0x00];
const PARAM_STATIC_GATE_WORD: [u8; 2] = [0x02, 0x00];

// parameter read response offsets, into the full response buffer
const REF_MAX_MOVING_GATE: usize = 12;
const REF_MAX_STATIC_GATE: usize = 13;
const REF_MOVING_SENS: usize = 14;
const REF_STATIC_SENS: usize = 23;
const REF_EMPTY_TIMEOUT: usize = 32;

/// What the sensor currently sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetType {
    /// No target detected
    #[default]
    None,
    /// Moving target only
    Moving,
    /// Static target only
    Static,
    /// Moving and static targets
    Both,
}

impl TryFrom<u8> for TargetType {
    type Error = Error;

    fn try_from(value: u8) -> Result<TargetType, Error> {
        match value {
            0 => Ok(TargetType::None),
            1 => Ok(TargetType::Moving),
            2 => Ok(TargetType::Static),
            3 => Ok(TargetType::Both),
            _ => Err(Error::range("target_type", value as i64, 0, 3)),
        }
    }
}

/// One decoded presence reading.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DetectionReading {
    /// Kind of target in view
    pub target_type: TargetType,
    /// Moving target distance in cm
    pub moving_target_distance: u16,
    /// Moving target energy, 0-100
    pub moving_target_energy: u8,
    /// Static target distance in cm
    pub static_target_distance: u16,
    /// Static target energy, 0-100
    pub static_target_energy: u8,
    /// Overall detection distance in cm
    pub detection_distance: u16,
    /// Per-gate moving energies, engineering mode only
    pub moving_gate_energy: Option<[u8; GATES]>,
    /// Per-gate static energies, engineering mode only
    pub static_gate_energy: Option<[u8; GATES]>,
}

/// Detection parameters as configured on the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionParams {
    /// Furthest gate used for motion detection
    pub moving_max_gate: u8,
    /// Furthest gate used for static detection
    pub static_max_gate: u8,
    /// Seconds the sensor keeps reporting presence after targets leave
    pub empty_timeout: u16,
    /// Per-gate motion sensitivities, 0-100
    pub moving_sensitivity: [u8; GATES],
    /// Per-gate static sensitivities, 0-100
    pub static_sensitivity: [u8; GATES],
}

/// Decode one data-frame body.
///
/// `eng_mode` reflects the driver's current belief about the module mode.
/// When the frame carries the engineering marker while the flag is off the
/// device is trusted: the flag is flipped and subsequent frames are read at
/// the longer length. A trailer mismatch is logged as a checksum warning
/// but the frame is still decoded best-effort; this matches the module's
/// observed habit of producing valid fields with a mangled trailer.
pub fn decode_frame(body: &[u8], eng_mode: &AtomicBool) -> Option<DetectionReading> {
    if body.is_empty() {
        return None;
    }

    if body.len() > REF_DATA_TYPE
        && body[REF_DATA_TYPE] == ENG_CHECK
        && !eng_mode.load(Ordering::Relaxed)
    {
        warn!("frame is in engineering mode format but the driver was not, enabling it");
        eng_mode.store(true, Ordering::Relaxed);
    }

    if body.len() < NORMAL_PACKET_LEN {
        debug!("short data frame ({} bytes), skipping", body.len());
        return None;
    }

    if body[body.len() - DATA_TRAILER.len()..] != DATA_TRAILER {
        warn!("checksum not correct, received this packet: {:02X?}", body);
    }

    let target_type = match TargetType::try_from(body[REF_TARGET_TYPE]) {
        Ok(target_type) => target_type,
        Err(_) => {
            debug!(
                "invalid target type {:#04X}, skipping frame",
                body[REF_TARGET_TYPE]
            );
            return None;
        }
    };

    let mut reading = DetectionReading {
        target_type,
        moving_target_distance: u16::from_le_bytes([body[REF_MOVE_DIST], body[REF_MOVE_DIST + 1]]),
        moving_target_energy: body[REF_MOVE_ENERGY],
        static_target_distance: u16::from_le_bytes([
            body[REF_STATIC_DIST],
            body[REF_STATIC_DIST + 1],
        ]),
        static_target_energy: body[REF_STATIC_ENERGY],
        detection_distance: u16::from_le_bytes([body[REF_DETECT_DIST], body[REF_DETECT_DIST + 1]]),
        moving_gate_energy: None,
        static_gate_energy: None,
    };

    if eng_mode.load(Ordering::Relaxed) && body.len() >= ENG_PACKET_LEN {
        let mut moving = [0u8; GATES];
        moving.copy_from_slice(&body[REF_MOVE_GATE_ENERGY..REF_MOVE_GATE_ENERGY + GATES]);
        let mut fixed = [0u8; GATES];
        fixed.copy_from_slice(&body[REF_STATIC_GATE_ENERGY..REF_STATIC_GATE_ENERGY + GATES]);
        reading.moving_gate_energy = Some(moving);
        reading.static_gate_energy = Some(fixed);
    }

    Some(reading)
}

/// Read one data frame from the transport: seek the header marker, then
/// read the mode-dependent body. None means no frame this time (short read
/// or cancellation), the caller retries.
pub fn read_frame<T: Transport>(
    transport: &mut T,
    sync: &mut FrameSync,
    eng_mode: &AtomicBool,
    cancel: &AtomicBool,
) -> Option<DetectionReading> {
    if !seek_header(transport, sync, &DATA_HEADER, cancel) {
        return None;
    }

    let len = if eng_mode.load(Ordering::Relaxed) {
        ENG_PACKET_LEN
    } else {
        NORMAL_PACKET_LEN
    };

    let body = match transport.read(len) {
        Ok(body) => body,
        Err(err) => {
            debug!("read failed mid-frame, skipping: {}", err);
            return None;
        }
    };

    if !body.is_empty() {
        sync.mark_success();
    }
    decode_frame(&body, eng_mode)
}

/// Build the detection-parameter edit payload: maximum gates and the
/// empty-target timeout, each as a parameter word plus a 4-byte value.
/// The timeout carries no range check: the module accepts the full 16-bit
/// range and the parameter type already enforces it.
pub fn encode_detection_params(
    moving_max_gate: u8,
    static_max_gate: u8,
    timeout: u16,
) -> Result<Vec<u8>, Error> {
    validate_range("moving_max_gate", moving_max_gate as i64, 0, GATE_MAX as i64)?;
    validate_range("static_max_gate", static_max_gate as i64, 0, GATE_MAX as i64)?;

    let mut payload = CMD_PARAM_EDIT.to_vec();
    payload.extend_from_slice(&PARAM_MAX_MOVING_GATE);
    payload.extend_from_slice(&(moving_max_gate as u32).to_le_bytes());
    payload.extend_from_slice(&PARAM_MAX_STATIC_GATE);
    payload.extend_from_slice(&(static_max_gate as u32).to_le_bytes());
    payload.extend_from_slice(&PARAM_EMPTY_DURATION);
    payload.extend_from_slice(&(timeout as u32).to_le_bytes());
    Ok(payload)
}

/// Build the gate-sensitivity edit payload.
///
/// Gates 1 and 2 only accept a static sensitivity of 0, a hardware
/// limitation of the module; anything else fails validation.
pub fn encode_gate_sensitivity(
    gate: u8,
    moving_sens: u8,
    static_sens: u8,
) -> Result<Vec<u8>, Error> {
    validate_range("gate", gate as i64, 0, GATE_MAX as i64)?;
    validate_range("moving_sens", moving_sens as i64, 0, SENS_MAX as i64)?;
    if gate == 1 || gate == 2 {
        warn!("gate {} static sensitivity can only be set to 0", gate);
        validate_range("static_sens", static_sens as i64, 0, 0)?;
    } else {
        validate_range("static_sens", static_sens as i64, 0, SENS_MAX as i64)?;
    }

    let mut payload = CMD_GATE_SENS_EDIT.to_vec();
    payload.extend_from_slice(&PARAM_GATE_SELECT);
    payload.extend_from_slice(&(gate as u32).to_le_bytes());
    payload.extend_from_slice(&PARAM_MOVING_GATE_WORD);
    payload.extend_from_slice(&(moving_sens as u32).to_le_bytes());
    payload.extend_from_slice(&PARAM_STATIC_GATE_WORD);
    payload.extend_from_slice(&(static_sens as u32).to_le_bytes());
    Ok(payload)
}

/// Decode the parameter-read response.
pub fn decode_detection_params(ret: &[u8]) -> Result<DetectionParams, Error> {
    if ret.len() < REF_EMPTY_TIMEOUT + 2 {
        return Err(Error::ShortResponse(ret.len()));
    }

    let mut moving = [0u8; GATES];
    moving.copy_from_slice(&ret[REF_MOVING_SENS..REF_MOVING_SENS + GATES]);
    let mut fixed = [0u8; GATES];
    fixed.copy_from_slice(&ret[REF_STATIC_SENS..REF_STATIC_SENS + GATES]);

    Ok(DetectionParams {
        moving_max_gate: ret[REF_MAX_MOVING_GATE],
        static_max_gate: ret[REF_MAX_STATIC_GATE],
        empty_timeout: u16::from_le_bytes([ret[REF_EMPTY_TIMEOUT], ret[REF_EMPTY_TIMEOUT + 1]]),
        moving_sensitivity: moving,
        static_sensitivity: fixed,
    })
}

/// Driver for the LD2410 presence sensor.
///
/// All transport access goes through one lock shared with the polling
/// task, so commands issued while a poll cycle is mid-read wait their turn
/// instead of interleaving on the wire.
pub struct Ld2410<T: Transport> {
    link: Arc<Mutex<Link<T>>>,
    eng_mode: Arc<AtomicBool>,
    poller: Poller<DetectionReading>,
}

impl<T: Transport + 'static> Ld2410<T> {
    /// Create a driver over an open transport at the given baud code.
    pub fn new(transport: T, baud_code: u16) -> Ld2410<T> {
        Ld2410 {
            link: Arc::new(Mutex::new(Link::new(transport, baud_code))),
            eng_mode: Arc::new(AtomicBool::new(false)),
            poller: Poller::new(),
        }
    }

    /// Whether the driver currently expects engineering mode frames. The
    /// decoder is the only writer outside the explicit mode calls.
    pub fn engineering_mode(&self) -> bool {
        self.eng_mode.load(Ordering::Relaxed)
    }

    /// Enable engineering mode: per-gate energies appended to every frame.
    pub fn enable_engineering_mode(&self) -> Result<(), Error> {
        info!("enabling engineering mode");
        self.eng_mode.store(true, Ordering::Relaxed);
        self.link.lock().unwrap().send_command(CMD_ENG_MODE_ENABLE)?;
        Ok(())
    }

    /// Disable engineering mode.
    pub fn disable_engineering_mode(&self) -> Result<(), Error> {
        info!("disabling engineering mode");
        self.eng_mode.store(false, Ordering::Relaxed);
        self.link.lock().unwrap().send_command(CMD_ENG_MODE_DISABLE)?;
        Ok(())
    }

    /// Configure the maximum detection gates and the empty-target timeout.
    pub fn edit_detection_params(
        &self,
        moving_max_gate: u8,
        static_max_gate: u8,
        timeout: u16,
    ) -> Result<(), Error> {
        info!("editing detection parameters");
        let payload = encode_detection_params(moving_max_gate, static_max_gate, timeout)?;
        self.link.lock().unwrap().send_command(&payload)?;
        Ok(())
    }

    /// Configure one gate's moving and static sensitivities.
    pub fn edit_gate_sensitivity(
        &self,
        gate: u8,
        moving_sens: u8,
        static_sens: u8,
    ) -> Result<(), Error> {
        info!("editing gate sensitivity");
        let payload = encode_gate_sensitivity(gate, moving_sens, static_sens)?;
        self.link.lock().unwrap().send_command(&payload)?;
        Ok(())
    }

    /// Read the currently configured detection parameters.
    pub fn read_detection_params(&self) -> Result<DetectionParams, Error> {
        info!("reading detection parameters");
        let ret = self.link.lock().unwrap().send_command(CMD_PARAM_READ)?;
        let params = decode_detection_params(&ret)?;
        debug!("detection parameters: {:?}", params);
        Ok(params)
    }

    /// Read one reading synchronously, bypassing the polling task.
    pub fn get_radar_data(&self) -> Option<DetectionReading> {
        debug!("getting raw dataframe");
        let mut link = self.link.lock().unwrap();
        let cancel = link.cancel_token();
        let (transport, sync) = link.parts();
        read_frame(transport, sync, &self.eng_mode, &cancel)
    }

    /// Latest reading published by the polling task, None until the first
    /// poll cycle completes.
    pub fn get_data(&self) -> Option<DetectionReading> {
        let data = self.poller.latest();
        if data.is_none() {
            warn!("no reading available, has polling been started?");
        }
        data
    }

    /// Start the background polling task. Blocks the caller for a short
    /// warm-up so the first frame can arrive.
    pub fn start(&mut self) {
        let link = self.link.clone();
        let eng_mode = self.eng_mode.clone();
        let cancel = self.link.lock().unwrap().cancel_token();
        self.poller.start(cancel, move || {
            let mut link = link.lock().unwrap();
            let token = link.cancel_token();
            let (transport, sync) = link.parts();
            read_frame(transport, sync, &eng_mode, &token)
        });
    }

    /// Stop the polling task. Safe to call when not running.
    pub fn stop(&mut self) {
        self.poller.stop();
    }
}

impl<T: Transport + 'static> RadarModule<T> for Ld2410<T> {
    fn link(&self) -> &Mutex<Link<T>> {
        &self.link
    }

    fn on_restart(&self) {
        // the module boots back up in normal mode
        self.eng_mode.store(false, Ordering::Relaxed);
    }
}
