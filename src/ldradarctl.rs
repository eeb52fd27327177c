// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use ldradar::{
    ld2410::{Ld2410, GATE_MAX},
    ld2450::Ld2450,
    link::{baud_rate, Error, RadarModule, DEFAULT_BAUD_CODE},
    serial::SerialTransport,
};
use log::debug;
use std::{thread, time::Duration};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Model {
    Ld2410,
    Ld2450,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Tracking {
    Single,
    Multi,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial device to use
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    device: String,

    /// Sensor model attached to the device
    #[arg(short, long, value_enum)]
    model: Model,

    /// Baud table code currently in effect on the module
    #[arg(short, long, default_value_t = DEFAULT_BAUD_CODE)]
    baud: u16,

    /// Print the firmware version
    #[arg(short, long)]
    firmware: bool,

    /// Print the Bluetooth MAC address
    #[arg(long)]
    bt_mac: bool,

    /// Switch the module to a new baud code and reconnect
    #[arg(long)]
    set_baud: Option<u16>,

    /// Set detection parameters (LD2410 only)
    #[arg(long, num_args = 3, value_names = ["MOVING_GATE", "STATIC_GATE", "TIMEOUT"])]
    detection_params: Option<Vec<u16>>,

    /// Set a tracking mode (LD2450 only)
    #[arg(short, long, value_enum)]
    tracking: Option<Tracking>,

    /// Monitor decoded readings
    #[arg(long)]
    monitor: bool,
}

/// Narrow a gate argument without truncation so an out-of-range value is
/// rejected before any bytes are sent.
fn gate_arg(name: &'static str, value: u16) -> Result<u8, Error> {
    u8::try_from(value).map_err(|_| Error::InvalidParameter {
        name,
        value: value as i64,
        min: 0,
        max: GATE_MAX as i64,
    })
}

fn main() -> Result<(), Error> {
    env_logger::init();
    let args = Args::parse();

    debug!("opening serial device {}", args.device);
    let rate = baud_rate(args.baud)?;
    let transport = SerialTransport::open(&args.device, rate, Duration::from_secs(1))?;

    match args.model {
        Model::Ld2410 => run_ld2410(&args, transport),
        Model::Ld2450 => run_ld2450(&args, transport),
    }
}

fn run_ld2410(args: &Args, transport: SerialTransport) -> Result<(), Error> {
    let mut radar = Ld2410::new(transport, args.baud);

    if args.tracking.is_some() {
        return Err(Error::NotImplemented(
            "tracking modes are an LD2450 feature",
        ));
    }
    if args.firmware {
        println!("Firmware: {}", radar.read_firmware_version()?);
    }
    if args.bt_mac {
        println!("Bluetooth: {}", radar.bt_query_mac()?);
    }
    if let Some(code) = args.set_baud {
        radar.set_baud_rate(code, true)?;
    }
    if let Some(params) = &args.detection_params {
        let moving = gate_arg("moving_max_gate", params[0])?;
        let fixed = gate_arg("static_max_gate", params[1])?;
        radar.edit_detection_params(moving, fixed, params[2])?;
    }
    if args.monitor {
        radar.start();
        loop {
            if let Some(reading) = radar.get_data() {
                println!("{:?}", reading);
            }
            thread::sleep(Duration::from_millis(200));
        }
    }
    Ok(())
}

fn run_ld2450(args: &Args, transport: SerialTransport) -> Result<(), Error> {
    let mut radar = Ld2450::new(transport, args.baud);

    if args.detection_params.is_some() {
        return Err(Error::NotImplemented(
            "detection parameters are an LD2410 feature",
        ));
    }
    if args.firmware {
        println!("Firmware: {}", radar.read_firmware_version()?);
    }
    if args.bt_mac {
        println!("Bluetooth: {}", radar.bt_query_mac()?);
    }
    if let Some(code) = args.set_baud {
        radar.set_baud_rate(code, true)?;
    }
    match args.tracking {
        Some(Tracking::Single) => radar.set_single_target_tracking()?,
        Some(Tracking::Multi) => radar.set_multi_target_tracking()?,
        None => (),
    }
    if args.monitor {
        radar.start();
        loop {
            if let Some(targets) = radar.get_data() {
                for (i, target) in targets.iter().enumerate() {
                    println!(
                        "target {}: x={} y={} speed={} distance={:.1}",
                        i, target.x, target.y, target.speed, target.distance
                    );
                }
            }
            thread::sleep(Duration::from_millis(200));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_arg_rejects_overflow() {
        assert_eq!(gate_arg("moving_max_gate", 6).unwrap(), 6);
        // must not wrap to gate 44
        assert!(matches!(
            gate_arg("moving_max_gate", 300),
            Err(Error::InvalidParameter {
                name: "moving_max_gate",
                value: 300,
                ..
            })
        ));
    }
}
