// Copyright (C) 2025 Paul Hampson
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License version 3 as  published by the
// Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program.  If not, see <https://www.gnu.org/licenses/>.

use log::LevelFilter;
use std::fs;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::Path;

/// Flags that are followed by a value
const VALUE_FLAGS: [&str; 4] = ["--port", "--baud", "--node-id", "--log-level"];

pub(crate) const DEFAULT_BAUD_RATE: u32 = 115_200;

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

pub(crate) fn parse_log_level(args: &[String]) -> LevelFilter {
    flag_value(args, "--log-level")
        .map(|level_str| match level_str.to_uppercase().as_str() {
            "OFF" => LevelFilter::Off,
            "TRACE" => LevelFilter::Trace,
            "DEBUG" => LevelFilter::Debug,
            "INFO" => LevelFilter::Info,
            "WARN" => LevelFilter::Warn,
            "ERROR" => LevelFilter::Error,
            _ => {
                eprintln!("Unknown log level: {}. Using INFO", level_str);
                LevelFilter::Info
            }
        })
        .unwrap_or(LevelFilter::Info)
}

pub(crate) fn parse_port(args: &[String]) -> Option<String> {
    flag_value(args, "--port").map(str::to_owned)
}

pub(crate) fn parse_baud(args: &[String]) -> IoResult<u32> {
    match flag_value(args, "--baud") {
        None => Ok(DEFAULT_BAUD_RATE),
        Some(baud) => baud
            .parse()
            .map_err(|_| IoError::new(ErrorKind::InvalidInput, format!("Invalid baud rate: {}", baud))),
    }
}

pub(crate) fn parse_node_id(args: &[String]) -> IoResult<Option<u8>> {
    flag_value(args, "--node-id")
        .map(|id| {
            id.parse()
                .map_err(|_| IoError::new(ErrorKind::InvalidInput, format!("Invalid node id: {}", id)))
        })
        .transpose()
}

pub(crate) fn extract_firmware_file_path(args: &[String]) -> IoResult<String> {
    // the last argument that is neither a flag nor a flag's value
    args.iter()
        .enumerate()
        .skip(1)
        .filter(|(i, arg)| !arg.starts_with("--") && !VALUE_FLAGS.contains(&args[i - 1].as_str()))
        .map(|(_, arg)| arg.clone())
        .next_back()
        .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "No firmware file path provided"))
}

pub(crate) fn read_binary_file(path: &str) -> IoResult<Vec<u8>> {
    fs::read(path).map_err(|e| IoError::new(ErrorKind::Other, format!("Failed to read firmware file: {}", e)))
}

/// The file name without its extension, used to label the image on the device
pub(crate) fn firmware_label(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_owned).collect()
    }

    #[test]
    fn firmware_path_skips_flag_values() {
        let args = args("fota-loader-cli --port /dev/ttyACM0 app.bin --log-level debug");
        assert_eq!(extract_firmware_file_path(&args).unwrap(), "app.bin");
    }

    #[test]
    fn missing_firmware_path_is_an_error() {
        let args = args("fota-loader-cli --node-id 4");
        assert_eq!(
            extract_firmware_file_path(&args).unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn flags_fall_back_to_defaults() {
        let args = args("fota-loader-cli app.bin");
        assert_eq!(parse_baud(&args).unwrap(), DEFAULT_BAUD_RATE);
        assert_eq!(parse_node_id(&args).unwrap(), None);
        assert_eq!(parse_port(&args), None);
        assert_eq!(parse_log_level(&args), LevelFilter::Info);
    }

    #[test]
    fn flags_are_parsed() {
        let args = args("fota-loader-cli --baud 9600 --node-id 12 --log-level trace --port COM3 app.bin");
        assert_eq!(parse_baud(&args).unwrap(), 9600);
        assert_eq!(parse_node_id(&args).unwrap(), Some(12));
        assert_eq!(parse_port(&args).as_deref(), Some("COM3"));
        assert_eq!(parse_log_level(&args), LevelFilter::Trace);
    }

    #[test]
    fn bad_node_id_is_rejected() {
        assert!(parse_node_id(&args("fota-loader-cli --node-id 300 app.bin")).is_err());
    }

    #[test]
    fn label_is_the_file_stem() {
        assert_eq!(firmware_label("build/sensor-node.bin"), "sensor-node");
    }
}
