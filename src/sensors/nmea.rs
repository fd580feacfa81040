//! NMEA 0183 GGA parsing and a GNSS driver reading sentences from a UART

use async_trait::async_trait;
use tracing::{debug, trace};

use super::SensorDriver;
use crate::error::SensorError;
use crate::sample::{Position, Reading, SampleKind};
use crate::serial::{LineReader, SerialPortIO};

/// Sentences read per acquisition before giving up on a fix
pub const MAX_SENTENCES_PER_READ: usize = 32;

fn malformed(msg: impl Into<String>) -> SensorError {
    SensorError::Bus(msg.into())
}

/// Parse one NMEA sentence
///
/// # Returns
///
/// * `Ok(Some(position))` - a GGA sentence with a fix
/// * `Ok(None)` - a valid sentence of another type
///
/// # Errors
///
/// * `NotReady` - GGA sentence without a fix
/// * `Bus` - bad framing, checksum or field
///
/// # Examples
///
/// ```
/// use collar_firmware::sensors::nmea::parse_sentence;
///
/// let fix = parse_sentence("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47")
///     .unwrap()
///     .unwrap();
/// assert_eq!(fix.latitude_e7, 481_173_000);
/// assert_eq!(fix.satellites, 8);
/// ```
pub fn parse_sentence(line: &str) -> Result<Option<Position>, SensorError> {
    let body = line.trim().strip_prefix('$').ok_or_else(|| malformed("missing '$'"))?;
    let (body, checksum) = body.split_once('*').ok_or_else(|| malformed("missing checksum"))?;

    let expected = u8::from_str_radix(checksum.trim(), 16).map_err(|_| malformed("bad checksum field"))?;
    let actual = body.bytes().fold(0u8, |acc, b| acc ^ b);
    if actual != expected {
        return Err(malformed(format!("checksum mismatch ({:02X} != {:02X})", actual, expected)));
    }

    let fields: Vec<&str> = body.split(',').collect();
    if fields[0].len() != 5 || !fields[0].ends_with("GGA") {
        return Ok(None);
    }
    if fields.len() < 10 {
        return Err(malformed("short GGA sentence"));
    }

    let quality: u8 = fields[6].parse().unwrap_or(0);
    if quality == 0 {
        return Err(SensorError::NotReady);
    }

    let latitude_e7 = parse_coordinate(fields[2], fields[3], 2, 90)?;
    let longitude_e7 = parse_coordinate(fields[4], fields[5], 3, 180)?;
    let satellites = fields[7].parse().unwrap_or(0);
    let altitude_m = match fields[9] {
        "" => 0,
        alt => alt
            .parse::<f64>()
            .map_err(|_| malformed("bad altitude"))?
            .round()
            .clamp(i16::MIN as f64, i16::MAX as f64) as i16,
    };

    Ok(Some(Position {
        latitude_e7,
        longitude_e7,
        altitude_m,
        satellites,
    }))
}

/// `dddmm.mmmm` + hemisphere to degrees x 1e7
fn parse_coordinate(value: &str, hemisphere: &str, degree_digits: usize, limit: i64) -> Result<i32, SensorError> {
    if value.len() < degree_digits + 2 || !value.is_char_boundary(degree_digits) {
        return Err(malformed(format!("bad coordinate '{}'", value)));
    }

    let degrees: f64 = value[..degree_digits]
        .parse()
        .map_err(|_| malformed(format!("bad coordinate '{}'", value)))?;
    let minutes: f64 = value[degree_digits..]
        .parse()
        .map_err(|_| malformed(format!("bad coordinate '{}'", value)))?;
    if !(0.0..60.0).contains(&minutes) {
        return Err(malformed(format!("minutes out of range in '{}'", value)));
    }

    let magnitude = ((degrees + minutes / 60.0) * 1e7).round() as i64;
    if magnitude > limit * 10_000_000 {
        return Err(malformed(format!("coordinate out of range '{}'", value)));
    }

    let signed = match hemisphere {
        "N" | "E" => magnitude,
        "S" | "W" => -magnitude,
        other => return Err(malformed(format!("bad hemisphere '{}'", other))),
    };
    Ok(signed as i32)
}

/// GNSS receiver streaming NMEA over a serial port
pub struct GnssDriver<P: SerialPortIO> {
    reader: LineReader<P>,
}

impl<P: SerialPortIO> GnssDriver<P> {
    pub fn new(port: P) -> Self {
        Self {
            reader: LineReader::new(port),
        }
    }
}

#[async_trait]
impl<P: SerialPortIO> SensorDriver for GnssDriver<P> {
    fn kind(&self) -> SampleKind {
        SampleKind::Position
    }

    /// Wait for the next GGA sentence; buffered older sentences are dropped
    async fn read(&mut self) -> Result<Reading, SensorError> {
        self.reader.discard_input();

        for _ in 0..MAX_SENTENCES_PER_READ {
            let line = self
                .reader
                .read_line()
                .await
                .map_err(|e| SensorError::Bus(format!("GNSS port: {}", e)))?;

            match parse_sentence(&line) {
                Ok(Some(position)) => {
                    trace!("GNSS fix {:?}", position);
                    return Ok(Reading::Position(position));
                }
                Ok(None) => {}
                Err(SensorError::NotReady) => return Err(SensorError::NotReady),
                Err(e) => debug!("Skipping NMEA sentence: {}", e),
            }
        }

        Err(SensorError::NotReady)
    }
}
