// SPDX-License-Identifier: Apache-2.0

use log::{debug, info, trace, warn};
use std::{
    fmt, io,
    ops::Range,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

/// Command frame header marker.
pub const CMD_HEADER: [u8; 4] = [0xFD, 0xFC, 0xFB, 0xFA];
/// Command frame footer marker.
pub const CMD_FOOTER: [u8; 4] = [0x04, 0x03, 0x02, 0x01];

/// Enter configuration mode. Every configuration command must be issued
/// between this frame and [`CMD_CONFIG_DISABLE`].
pub const CMD_CONFIG_ENABLE: &[u8] = &[0x04, 0x00, 0xFF, 0x00, 0x01, 0x00];
/// Leave configuration mode.
pub const CMD_CONFIG_DISABLE: &[u8] = &[0x02, 0x00, 0xFE, 0x00];
/// Read the firmware version.
pub const CMD_FIRMWARE_READ: &[u8] = &[0x02, 0x00, 0xA0, 0x00];
/// Set the serial baud rate. Followed by a 2-byte baud table code.
pub const CMD_BAUD_RATE_SET: &[u8] = &[0x04, 0x00, 0xA1, 0x00];
/// Restore factory defaults.
pub const CMD_FACTORY_RESET: &[u8] = &[0x02, 0x00, 0xA2, 0x00];
/// Restart the module.
pub const CMD_RESTART: &[u8] = &[0x02, 0x00, 0xA3, 0x00];
/// Enable the Bluetooth radio.
pub const CMD_BT_ENABLE: &[u8] = &[0x04, 0x00, 0xA4, 0x00, 0x01, 0x00];
/// Disable the Bluetooth radio.
pub const CMD_BT_DISABLE: &[u8] = &[0x04, 0x00, 0xA4, 0x00, 0x00, 0x00];
/// Query the Bluetooth MAC address.
pub const CMD_BT_MAC_QUERY: &[u8] = &[0x04, 0x00, 0xA5, 0x00, 0x01, 0x00];

/// Accepted baud table codes and the physical bit rates they select.
pub const BAUD_TABLE: [(u16, u32); 8] = [
    (1, 9600),
    (2, 19200),
    (3, 38400),
    (4, 57600),
    (5, 115200),
    (6, 230400),
    (7, 256000),
    (8, 460800),
];

/// Factory default baud table code (256000 bit/s).
pub const DEFAULT_BAUD_CODE: u16 = 7;

/// Header marker length, shared by both protocol variants and tracked by
/// the sliding window.
pub const MARKER_LEN: usize = 4;

/// Largest response read back for a single command frame.
pub const MAX_BUFFER_SIZE: usize = 256;

/// Consecutive read failures tolerated before warning about a likely baud
/// rate mismatch.
pub const READ_FAIL_WARN: u32 = 32;

/// Backoff between transport retries.
const RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Settle delay after a module restart. The module performs a hardware
/// reset and does not answer until it has re-enumerated.
const RESTART_SETTLE: Duration = Duration::from_secs(1);

// firmware version response fields, little endian
const REF_FW_MAJOR: Range<usize> = 12..14;
const REF_FW_MINOR: Range<usize> = 14..18;
// bluetooth MAC response field
const REF_BT_ADDR: Range<usize> = 10..16;

/// Protocol and driver error types.
#[derive(Debug)]
pub enum Error {
    /// I/O error from the underlying transport
    Transport(io::Error),
    /// Caller-supplied value outside its closed valid range
    InvalidParameter {
        /// Name of the offending parameter
        name: &'static str,
        /// Value the caller supplied
        value: i64,
        /// Lowest accepted value
        min: i64,
        /// Highest accepted value
        max: i64,
    },
    /// Response shorter than the fields it should carry
    ShortResponse(usize),
    /// Operation not meaningful for this sensor variant
    NotImplemented(&'static str),
    /// Retries abandoned because the driver is stopping
    Cancelled,
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Transport(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Transport(err) => write!(f, "transport error: {}", err),
            Error::InvalidParameter {
                name,
                value,
                min,
                max,
            } => write!(
                f,
                "{} {} is not a valid setting, pick a value between {} and {}",
                name, value, min, max
            ),
            Error::ShortResponse(len) => write!(f, "short response: {} bytes", len),
            Error::NotImplemented(what) => write!(f, "not implemented: {}", what),
            Error::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl Error {
    pub(crate) fn range(name: &'static str, value: i64, min: i64, max: i64) -> Error {
        Error::InvalidParameter {
            name,
            value,
            min,
            max,
        }
    }
}

/// Validate that `value` lies inside the closed range `[min, max]`.
pub(crate) fn validate_range(
    name: &'static str,
    value: i64,
    min: i64,
    max: i64,
) -> Result<(), Error> {
    if value < min || value > max {
        return Err(Error::range(name, value, min, max));
    }
    Ok(())
}

/// Map a baud table code to its physical bit rate.
pub fn baud_rate(code: u16) -> Result<u32, Error> {
    BAUD_TABLE
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, rate)| *rate)
        .ok_or_else(|| Error::range("baud_code", code as i64, 1, BAUD_TABLE.len() as i64))
}

/// Byte-level transport collaborator behind the protocol engine.
///
/// Implementations cover the physical serial device or, in tests, a
/// scripted byte source. A read may return fewer bytes than requested when
/// the transport times out; an error is counted as a read failure by the
/// synchronization loop.
pub trait Transport: Send {
    /// Read up to `n` bytes, waiting at most the transport timeout.
    fn read(&mut self, n: usize) -> io::Result<Vec<u8>>;
    /// Read a single byte.
    fn read_byte(&mut self) -> io::Result<u8>;
    /// Write the whole buffer.
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;
    /// Close and reopen the transport at a new bit rate.
    fn reopen(&mut self, baud: u32) -> io::Result<()>;
}

/// Fixed-capacity sliding window used to locate a frame header marker in a
/// continuous byte stream.
///
/// One byte is pushed per transport read; the window matches once its
/// contents equal the expected marker. A failed read pushes a placeholder
/// byte so the synchronization state survives transport hiccups instead of
/// being reset.
pub struct FrameSync {
    window: [u8; MARKER_LEN],
    fail_count: u32,
}

impl FrameSync {
    /// Create an empty window.
    pub fn new() -> FrameSync {
        FrameSync {
            window: [0; MARKER_LEN],
            fail_count: 0,
        }
    }

    /// Push one received byte; true once the window equals `marker`.
    pub fn push(&mut self, byte: u8, marker: &[u8; MARKER_LEN]) -> bool {
        self.window.copy_within(1.., 0);
        self.window[MARKER_LEN - 1] = byte;
        self.window == *marker
    }

    /// Record a failed read. The placeholder byte keeps the window moving
    /// without discarding what has been matched so far.
    pub fn push_failure(&mut self, marker: &[u8; MARKER_LEN]) -> bool {
        self.fail_count += 1;
        if self.fail_count > READ_FAIL_WARN {
            warn!(
                "{} consecutive read failures, check that the baud rate matches the module",
                self.fail_count
            );
        }
        self.push(0x00, marker)
    }

    /// Reset the consecutive-failure counter after a fully successful read.
    pub fn mark_success(&mut self) {
        self.fail_count = 0;
    }

    /// Consecutive failed reads since the last success.
    pub fn failures(&self) -> u32 {
        self.fail_count
    }
}

impl Default for FrameSync {
    fn default() -> FrameSync {
        FrameSync::new()
    }
}

/// Scan the transport byte-by-byte until `marker` appears in the sliding
/// window. Returns false when the cancel token fires before sync.
pub(crate) fn seek_header<T: Transport>(
    transport: &mut T,
    sync: &mut FrameSync,
    marker: &[u8; MARKER_LEN],
    cancel: &AtomicBool,
) -> bool {
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        let synced = match transport.read_byte() {
            Ok(byte) => sync.push(byte, marker),
            Err(err) => {
                debug!("read failed while seeking frame header: {}", err);
                thread::sleep(RETRY_BACKOFF);
                sync.push_failure(marker)
            }
        };
        if synced {
            return true;
        }
    }
}

/// Link layer shared by both sensor variants: command framing, the
/// config-mode handshake and module management commands.
pub struct Link<T: Transport> {
    transport: T,
    sync: FrameSync,
    baud_code: u16,
    cancel: Arc<AtomicBool>,
}

impl<T: Transport> Link<T> {
    /// Create a link over an open transport. `baud_code` is the table code
    /// currently in effect, remembered for module restarts.
    pub fn new(transport: T, baud_code: u16) -> Link<T> {
        Link {
            transport,
            sync: FrameSync::new(),
            baud_code,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancellation token checked by every retry loop. The polling task
    /// shares this token so `stop()` has bounded latency.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub(crate) fn parts(&mut self) -> (&mut T, &mut FrameSync) {
        (&mut self.transport, &mut self.sync)
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(payload.len() + CMD_HEADER.len() + CMD_FOOTER.len());
        buf.extend_from_slice(&CMD_HEADER);
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&CMD_FOOTER);
        buf
    }

    /// Send one payload wrapped in the command markers and return whatever
    /// the module answers, raw. An empty or short read is returned as-is;
    /// transport errors are retried with a fixed backoff until the cancel
    /// token fires.
    pub fn send_frame(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let frame = Self::frame(payload);
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
            match self.try_send(&frame) {
                Ok(ret) => {
                    trace!("sent     {:02X?}", frame);
                    trace!("received {:02X?}", ret);
                    return Ok(ret);
                }
                Err(err) => {
                    debug!("send_frame transport error, retrying: {}", err);
                    thread::sleep(RETRY_BACKOFF);
                }
            }
        }
    }

    fn try_send(&mut self, frame: &[u8]) -> io::Result<Vec<u8>> {
        self.transport.write(frame)?;
        self.transport.read(MAX_BUFFER_SIZE)
    }

    /// Send a configuration command bracketed by the config-mode handshake.
    /// All three frames are always sent, even when the middle exchange goes
    /// wrong, so the module is never left stuck in configuration mode.
    pub fn send_command(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        self.send_frame(CMD_CONFIG_ENABLE)?;
        let ret = self.send_frame(payload);
        let closed = self.send_frame(CMD_CONFIG_DISABLE);
        let ret = ret?;
        closed?;
        Ok(ret)
    }

    /// Restart the module and reopen the transport, optionally switching to
    /// a new baud code first.
    pub fn restart(&mut self, new_baud: Option<u16>) -> Result<(), Error> {
        info!("restarting module");
        if let Some(code) = new_baud {
            self.baud_code = code;
        }
        self.send_command(CMD_RESTART)?;
        self.transport.reopen(baud_rate(self.baud_code)?)?;
        thread::sleep(RESTART_SETTLE);
        Ok(())
    }
}

/// Module-management operations shared by both sensor variants.
///
/// Both device types compose the same [`Link`]; this trait surfaces the
/// link-layer operations on each of them without a base-type hierarchy.
pub trait RadarModule<T: Transport> {
    /// Exclusive handle on the shared link.
    fn link(&self) -> &Mutex<Link<T>>;

    /// Hook for variant state that must reset when the module restarts.
    fn on_restart(&self) {}

    /// Read the firmware version string, e.g. `V1.07.22062416`.
    fn read_firmware_version(&self) -> Result<String, Error> {
        info!("reading firmware version");
        let ret = self.link().lock().unwrap().send_command(CMD_FIRMWARE_READ)?;
        if ret.len() < REF_FW_MINOR.end {
            return Err(Error::ShortResponse(ret.len()));
        }
        let major = &ret[REF_FW_MAJOR];
        let minor: String = ret[REF_FW_MINOR]
            .iter()
            .rev()
            .map(|b| format!("{:02x}", b))
            .collect();
        Ok(format!("V{}.{:02}.{}", major[1], major[0], minor))
    }

    /// Switch the module to a new baud code. With `reconnect` the module is
    /// restarted and the transport reopened at the new bit rate; without it
    /// only the baud-set command is issued.
    fn set_baud_rate(&self, code: u16, reconnect: bool) -> Result<(), Error> {
        let rate = baud_rate(code)?;
        info!("setting baud rate to {}", rate);
        let mut payload = CMD_BAUD_RATE_SET.to_vec();
        payload.extend_from_slice(&code.to_le_bytes());
        self.link().lock().unwrap().send_command(&payload)?;
        if reconnect {
            info!("baud rate set command issued, restarting");
            self.restart(Some(code))?;
        }
        Ok(())
    }

    /// Restart the module and wait for it to come back.
    fn restart(&self, new_baud: Option<u16>) -> Result<(), Error> {
        self.link().lock().unwrap().restart(new_baud)?;
        self.on_restart();
        Ok(())
    }

    /// Reset the module to factory defaults. The default baud code takes
    /// effect again, so `reconnect` restarts at that rate.
    fn factory_reset(&self, reconnect: bool) -> Result<(), Error> {
        warn!("module will now be factory reset");
        self.link().lock().unwrap().send_command(CMD_FACTORY_RESET)?;
        if reconnect {
            self.restart(Some(DEFAULT_BAUD_CODE))?;
        }
        Ok(())
    }

    /// Enable the Bluetooth radio.
    fn bt_enable(&self) -> Result<(), Error> {
        info!("enabling bluetooth");
        self.link().lock().unwrap().send_command(CMD_BT_ENABLE)?;
        Ok(())
    }

    /// Disable the Bluetooth radio.
    fn bt_disable(&self) -> Result<(), Error> {
        info!("disabling bluetooth");
        self.link().lock().unwrap().send_command(CMD_BT_DISABLE)?;
        Ok(())
    }

    /// Query the Bluetooth MAC address, formatted `xx:xx:xx:xx:xx:xx`.
    fn bt_query_mac(&self) -> Result<String, Error> {
        info!("querying bluetooth address");
        let ret = self.link().lock().unwrap().send_command(CMD_BT_MAC_QUERY)?;
        if ret.len() < REF_BT_ADDR.end {
            return Err(Error::ShortResponse(ret.len()));
        }
        let mac: Vec<String> = ret[REF_BT_ADDR]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        Ok(mac.join(":"))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::Transport;
    use std::collections::VecDeque;
    use std::io;

    /// Scripted transport: reads drain a byte queue or pop pre-arranged
    /// responses, writes and reopens are recorded for inspection.
    pub struct MockTransport {
        pub rx: VecDeque<u8>,
        pub responses: VecDeque<Vec<u8>>,
        pub writes: Vec<Vec<u8>>,
        pub reopens: Vec<u32>,
        /// Error instead of returning short reads once the queue is empty.
        pub fail_when_empty: bool,
    }

    impl MockTransport {
        pub fn new(script: &[u8]) -> MockTransport {
            MockTransport {
                rx: script.iter().copied().collect(),
                responses: VecDeque::new(),
                writes: Vec::new(),
                reopens: Vec::new(),
                fail_when_empty: false,
            }
        }

        /// One pre-arranged response per `read` call, served before the
        /// byte queue.
        pub fn with_responses(responses: Vec<Vec<u8>>) -> MockTransport {
            let mut mock = MockTransport::new(&[]);
            mock.responses = responses.into();
            mock
        }
    }

    impl Transport for MockTransport {
        fn read(&mut self, n: usize) -> io::Result<Vec<u8>> {
            if let Some(resp) = self.responses.pop_front() {
                return Ok(resp);
            }
            if self.rx.is_empty() && self.fail_when_empty {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "scripted timeout"));
            }
            let n = n.min(self.rx.len());
            Ok(self.rx.drain(..n).collect())
        }

        fn read_byte(&mut self) -> io::Result<u8> {
            self.rx
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "scripted timeout"))
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<()> {
            self.writes.push(buf.to_vec());
            Ok(())
        }

        fn reopen(&mut self, baud: u32) -> io::Result<()> {
            self.reopens.push(baud);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    #[test]
    fn test_frame_wrapper() {
        let mut link = Link::new(MockTransport::new(&[]), DEFAULT_BAUD_CODE);
        link.send_frame(&[0x02, 0x00, 0xFE, 0x00]).unwrap();

        let (transport, _) = link.parts();
        assert_eq!(transport.writes.len(), 1);
        assert_eq!(
            transport.writes[0],
            vec![0xFD, 0xFC, 0xFB, 0xFA, 0x02, 0x00, 0xFE, 0x00, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_send_command_brackets_config_mode() {
        // Garbage middle response must not suppress the disable frame.
        let mut link = Link::new(
            MockTransport::with_responses(vec![
                vec![0x01, 0x02],
                vec![0xDE, 0xAD, 0xBE, 0xEF],
                vec![0x03, 0x04],
            ]),
            DEFAULT_BAUD_CODE,
        );
        let ret = link.send_command(&[0x02, 0x00, 0x61, 0x00]).unwrap();
        assert_eq!(ret, vec![0xDE, 0xAD, 0xBE, 0xEF]);

        let (transport, _) = link.parts();
        assert_eq!(transport.writes.len(), 3);
        assert_eq!(&transport.writes[0][4..10], CMD_CONFIG_ENABLE);
        assert_eq!(&transport.writes[2][4..8], CMD_CONFIG_DISABLE);
    }

    #[test]
    fn test_send_frame_cancelled() {
        let mut transport = MockTransport::new(&[]);
        transport.fail_when_empty = true;
        let mut link = Link::new(transport, DEFAULT_BAUD_CODE);
        link.cancel_token().store(true, Ordering::Relaxed);

        match link.send_frame(&[0x00]) {
            Err(Error::Cancelled) => (),
            other => panic!("expected Cancelled, got {:?}", other),
        }
    }

    #[test]
    fn test_baud_table() {
        assert_eq!(baud_rate(1).unwrap(), 9600);
        assert_eq!(baud_rate(DEFAULT_BAUD_CODE).unwrap(), 256000);
        assert_eq!(baud_rate(8).unwrap(), 460800);
        assert!(matches!(
            baud_rate(9),
            Err(Error::InvalidParameter { name: "baud_code", .. })
        ));
        assert!(baud_rate(0).is_err());
    }

    #[test]
    fn test_frame_sync_matches_marker() {
        let marker = [0xF4, 0xF3, 0xF2, 0xF1];
        let mut sync = FrameSync::new();
        for byte in [0x00, 0x55, 0xF4, 0xF3, 0xF2] {
            assert!(!sync.push(byte, &marker));
        }
        assert!(sync.push(0xF1, &marker));
    }

    #[test]
    fn test_frame_sync_failure_counter() {
        let marker = [0xF4, 0xF3, 0xF2, 0xF1];
        let mut sync = FrameSync::new();
        for _ in 0..5 {
            sync.push_failure(&marker);
        }
        assert_eq!(sync.failures(), 5);
        sync.mark_success();
        assert_eq!(sync.failures(), 0);
    }

    #[test]
    fn test_seek_header_cancel() {
        let mut transport = MockTransport::new(&[]);
        transport.fail_when_empty = true;
        let mut sync = FrameSync::new();
        let cancel = AtomicBool::new(true);
        assert!(!seek_header(
            &mut transport,
            &mut sync,
            &[0xF4, 0xF3, 0xF2, 0xF1],
            &cancel
        ));
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range("gate", 8, 0, 8).is_ok());
        let err = validate_range("gate", 9, 0, 8).unwrap_err();
        assert_eq!(
            err.to_string(),
            "gate 9 is not a valid setting, pick a value between 0 and 8"
        );
    }
}
