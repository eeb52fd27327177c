// SPDX-License-Identifier: Apache-2.0

use crate::link::Transport;
use log::{debug, info};
use serialport::SerialPort;
use std::{
    io::{self, Read, Write},
    time::Duration,
};

/// Serial device transport for the radar modules.
///
/// Reads accumulate until the requested length or the port timeout; a
/// timeout ends the read with whatever arrived, matching the module's
/// habit of pausing between frames.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    path: String,
    timeout: Duration,
}

impl SerialTransport {
    /// Open a serial device at the given bit rate.
    pub fn open(path: &str, baud: u32, timeout: Duration) -> io::Result<SerialTransport> {
        let port = serialport::new(path, baud).timeout(timeout).open()?;
        info!("serial port {} open at {} baud", path, baud);
        Ok(SerialTransport {
            port,
            path: path.to_string(),
            timeout,
        })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let mut len = 0;
        while len < n {
            match self.port.read(&mut buf[len..]) {
                Ok(0) => break,
                Ok(done) => len += done,
                Err(err) if err.kind() == io::ErrorKind::TimedOut => break,
                Err(err) => return Err(err),
            }
        }
        buf.truncate(len);
        Ok(buf)
    }

    fn read_byte(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.port.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()
    }

    fn reopen(&mut self, baud: u32) -> io::Result<()> {
        debug!("reopening {} at {} baud", self.path, baud);
        self.port = serialport::new(self.path.as_str(), baud)
            .timeout(self.timeout)
            .open()?;
        Ok(())
    }
}
