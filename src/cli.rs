//! Debug console module.
//!
//! A line-oriented console on standard input, standing in for the embedded
//! serial shell. Commands: `printConfig`, `readLog <n>`,
//! `send_aprs_message <dest> <text>`, `test_rx`, `debugOnUSB on|off`,
//! `printPicture`, `command2Camera <val>`, `quit`.

#![allow(missing_debug_implementations)]

use std::{
    io::{self, BufRead},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tracing::{info, warn};

use crate::{
    aprs,
    collector::CollectorHandle,
    config::Config,
    dispatch::HeardList,
    packet::PacketPool,
    radio::{Priority, RadioHandle},
    sensors::Camera,
    threads::transmit_info,
};

/// Console context.
pub struct Cli {
    /// Tracker configuration.
    pub config: Arc<Config>,
    /// Collector handle.
    pub collector: CollectorHandle,
    /// Radio manager handle.
    pub radio: RadioHandle,
    /// Packet pool.
    pub pool: PacketPool,
    /// Directly heard stations.
    pub heard: Arc<HeardList>,
    /// A camera for `printPicture`.
    pub camera: Box<dyn Camera>,
    /// Raised when the operator asks to quit.
    pub quit: Arc<AtomicBool>,
}

/// Console thread body. Returns when stdin closes or on `quit`.
pub fn run(mut cli: Cli) {
    let stdin = io::stdin();
    let mut message_number: u16 = 0;

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if cli.quit.load(Ordering::Acquire) {
            break;
        }

        let mut parts = line.split_whitespace();
        let Some(command) = parts.next() else {
            continue;
        };

        match command {
            "printConfig" => match toml::to_string_pretty(cli.config.as_ref()) {
                Ok(rendered) => println!("{rendered}"),
                Err(e) => warn!("could not render configuration: {e}"),
            },
            "readLog" => {
                let index: usize = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);
                match cli.collector.get_log(index) {
                    Ok(Some(point)) => {
                        let fixed = if point.gps_time == 0 {
                            "-".to_owned()
                        } else {
                            chrono::DateTime::<chrono::Utc>::from_timestamp(
                                i64::from(point.gps_time),
                                0,
                            )
                            .map_or_else(|| "-".to_owned(), |t| t.to_rfc3339())
                        };
                        println!(
                            "log[{index}]: id={} sys_time={} fixed={} gps={} lat={} lon={} alt={} vbat={}",
                            point.id,
                            point.sys_time,
                            fixed,
                            point.gps_state,
                            point.gps_lat,
                            point.gps_lon,
                            point.gps_alt,
                            point.vbat_mv()
                        );
                    }
                    Ok(None) => println!("log[{index}]: empty"),
                    Err(e) => warn!("log read failed: {e}"),
                }
            }
            "send_aprs_message" => {
                let Some(dest) = parts.next() else {
                    println!("usage: send_aprs_message <dest> <text>");
                    continue;
                };
                let text: String = parts.collect::<Vec<_>>().join(" ");
                if text.is_empty() {
                    println!("usage: send_aprs_message <dest> <text>");
                    continue;
                }
                message_number = (message_number + 1) % 1000;
                match aprs::encode_message(dest, &text, Some(message_number)) {
                    Ok(info) => {
                        match transmit_info(
                            &cli.config,
                            &cli.pool,
                            &cli.radio,
                            info,
                            Priority::Beacon,
                        ) {
                            Ok(()) => println!("message {message_number:03} sent to {dest}"),
                            Err(e) => warn!("message transmission failed: {e:#}"),
                        }
                    }
                    Err(e) => warn!("could not encode message: {e}"),
                }
            }
            "test_rx" => {
                let heard = cli.heard.list();
                if heard.is_empty() {
                    println!("no stations heard directly");
                } else {
                    println!("heard direct: {}", heard.join(" "));
                }
            }
            "debugOnUSB" => {
                let on = parts.next() == Some("on");
                info!("console debug output {}", if on { "enabled" } else { "disabled" });
                println!("debugOnUSB {}", if on { "on" } else { "off" });
            }
            "printPicture" => {
                let image_config = cli.config.image();
                match cli.camera.capture(
                    image_config.width(),
                    image_config.height(),
                    image_config.quality(),
                ) {
                    Ok(jpeg) => {
                        let head: Vec<String> =
                            jpeg.iter().take(16).map(|b| format!("{b:02X}")).collect();
                        println!("picture: {} bytes, head {}", jpeg.len(), head.join(" "));
                    }
                    Err(e) => warn!("capture failed: {e:#}"),
                }
            }
            "command2Camera" => {
                let value = parts.next().unwrap_or("0");
                info!("camera command {value} noted; raw register access needs the flight driver");
                println!("camera command {value} queued");
            }
            "quit" => {
                cli.quit.store(true, Ordering::Release);
                break;
            }
            _ => println!("unknown command: {command}"),
        }
    }
    info!("console closed");
}
