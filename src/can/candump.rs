//! Utilities for parsing candumps into bus-level [CanFrame]s
use std::io::{BufRead, Lines};

use eyre::WrapErr;

use crate::can::CanFrame;

/// File format of the candump
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CandumpFormat {
    /// Try to auto-negotiate the file format
    ///
    /// Assumes that all lines follow the same format, and will pick the first format to
    /// successfully parse a line.
    Auto,
    /// candump -L/-l format
    CanUtilsFile,
    /// candump -ta format
    CanUtilsCli,
}

/// Parse [CanFrame]s from the given reader
pub struct CandumpParser<R: BufRead> {
    format: CandumpFormat,
    lines: Lines<R>,
}

impl<R: BufRead> CandumpParser<R> {
    /// Create a new [CandumpParser] using [CandumpFormat::Auto]
    pub fn new(reader: R) -> Self {
        Self {
            format: CandumpFormat::Auto,
            lines: reader.lines(),
        }
    }

    /// Create a new [CandumpParser] using the given format
    pub fn with_format(reader: R, format: CandumpFormat) -> Self {
        Self {
            format,
            lines: reader.lines(),
        }
    }
}

/// There will be one Item for each input line. The iterator runs out when the input lines run out
impl<R: BufRead> Iterator for CandumpParser<R> {
    type Item = eyre::Result<CanFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = self.lines.next()?;
        match line {
            Ok(line) => Some(self.format.parse(&line)),
            Err(e) => Some(Err(eyre::eyre!("Failed to read line: {e}"))),
        }
    }
}

impl CandumpFormat {
    /// Attempt to parse a [CanFrame] from the given line
    pub fn parse(&mut self, line: &str) -> eyre::Result<CanFrame> {
        match self {
            CandumpFormat::Auto => {
                if let Ok(result) = parse_candump_file_msg(line) {
                    // Assume that all lines follow the format of the first successfully parsed
                    // line
                    *self = CandumpFormat::CanUtilsFile;
                    Ok(result)
                } else if let Ok(result) = parse_candump_cli_msg(line) {
                    *self = CandumpFormat::CanUtilsCli;
                    Ok(result)
                } else {
                    eyre::bail!("Failed to parse {line:?} with all known candump formats")
                }
            }
            CandumpFormat::CanUtilsFile => parse_candump_file_msg(line),
            CandumpFormat::CanUtilsCli => parse_candump_cli_msg(line),
        }
    }
}

fn strip_outer_brackets(field: &str, first: char, last: char) -> &str {
    let field = if let Some(stripped) = field.strip_prefix(first) {
        stripped
    } else {
        field
    };
    let field = if let Some(stripped) = field.strip_suffix(last) {
        stripped
    } else {
        field
    };
    field
}

/// Candump timestamps are fractional epoch seconds; frame timestamps are driver microseconds,
/// which wrap every ~71 minutes. Relative spacing is all the transport timeouts need.
fn timestamp_us(seconds: f64) -> u32 {
    (seconds * 1e6) as u64 as u32
}

/// Map an interface name like `can1` or `vcan0` onto a channel index
fn channel(interface: &str) -> u8 {
    let digits: String = interface.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

/// Parse candumps with the format
///
/// ```text
/// $ candump -ta can0
/// (1739136517.221471)  can0  123   [3]  FF FF FF
/// ```
fn parse_candump_cli_msg(line: &str) -> eyre::Result<CanFrame> {
    let mut parts = line.split_ascii_whitespace();

    let Some(maybe_timestamp) = parts.next() else {
        eyre::bail!("Line {line:?} empty");
    };
    let maybe_timestamp = strip_outer_brackets(maybe_timestamp, '(', ')');
    let timestamp: f64 = maybe_timestamp
        .parse()
        .wrap_err("Failed to parse timestamp as f64")?;
    let Some(interface) = parts.next() else {
        eyre::bail!("Failed to parse interface from: {line:?}");
    };
    let Some(maybe_canid) = parts.next() else {
        eyre::bail!("Failed to parse canid from: {line:?}");
    };
    let canid = u32::from_str_radix(maybe_canid, 16).wrap_err("Failed to parse canid as u32")?;
    let Some(maybe_dlc) = parts.next() else {
        eyre::bail!("Failed to parse dlc from: {line:?}");
    };
    let maybe_dlc = strip_outer_brackets(maybe_dlc, '[', ']');
    let dlc: usize = maybe_dlc.parse().wrap_err("Failed to parse dlc as usize")?;
    if dlc > 8 {
        eyre::bail!("dlc {dlc} exceeds maximum dlc of 8 bytes");
    }

    let mut data = [0, 0, 0, 0, 0, 0, 0, 0];
    #[allow(clippy::needless_range_loop)]
    for i in 0..dlc {
        let Some(maybe_byte) = parts.next() else {
            eyre::bail!("Failed to parse data byte {i} from line: {line:?}");
        };
        if maybe_byte.len() != 2 {
            eyre::bail!(
                "Failed to parse data byte {i} from {maybe_byte:?}: incorrect string length"
            );
        }
        let byte = u8::from_str_radix(maybe_byte, 16).wrap_err("Failed to parse data byte")?;
        data[i] = byte;
    }
    Ok(CanFrame::new(
        timestamp_us(timestamp),
        channel(interface),
        canid,
        &data[..dlc],
    ))
}

/// Parse candumps with the format
///
/// ```text
/// $ candump -L can0
/// (1739136482.503244) can0 123#FFFFFF
/// ```
fn parse_candump_file_msg(line: &str) -> eyre::Result<CanFrame> {
    let mut parts = line.split_ascii_whitespace();
    let Some(maybe_timestamp) = parts.next() else {
        eyre::bail!("Line {line:?} empty");
    };
    let maybe_timestamp = strip_outer_brackets(maybe_timestamp, '(', ')');
    let timestamp: f64 = maybe_timestamp
        .parse()
        .wrap_err("Failed to parse timestamp as f64")?;
    let Some(interface) = parts.next() else {
        eyre::bail!("Failed to parse interface from: {line:?}");
    };

    let Some(maybe_frame) = parts.next() else {
        eyre::bail!("Failed to parse frame data from: {line:?}");
    };
    let mut frame = maybe_frame.split('#');
    let Some(maybe_canid) = frame.next() else {
        eyre::bail!("Failed to parse canid from: {maybe_frame:?} in line {line:?}");
    };
    let canid = u32::from_str_radix(maybe_canid, 16).wrap_err("Failed to parse canid as u32")?;
    let Some(maybe_data) = frame.next() else {
        eyre::bail!("Failed to parse data from: {maybe_frame:?} in line {line:?}");
    };
    if maybe_data.len() > 16 || maybe_data.len() % 2 != 0 {
        eyre::bail!("Failed to parse data from: {maybe_data:?}: incorrect length");
    }
    let dlc = maybe_data.len() / 2;
    let mut data = [0, 0, 0, 0, 0, 0, 0, 0];
    #[allow(clippy::needless_range_loop)]
    for i in 0..dlc {
        let j = i * 2;
        let byte =
            u8::from_str_radix(&maybe_data[j..j + 2], 16).wrap_err("Failed to parse byte")?;
        data[i] = byte;
    }

    Ok(CanFrame::new(
        timestamp_us(timestamp),
        channel(interface),
        canid,
        &data[..dlc],
    ))
}
