/* rivi (c) by Nao Pross <np@0hm.ch>
 *
 *
 * rivi is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! Interchangeable Virtual Instrument (IVI) style instrument drivers
//!
//! Drivers talk SCPI over anything implementing [`Transport`], which
//! includes an open [`usbtmc::Device`](crate::usbtmc::Device).

pub mod fgen;

#[cfg(test)]
pub(crate) mod mock;

use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::usbtmc;

#[derive(Error, Debug)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn StdError + Send + Sync>),
    #[error("decoding error (utf-8)")]
    Decoding(#[from] std::string::FromUtf8Error),
    #[error("empty response to {0:?}")]
    EmptyResponse(String),
    #[error("unexpected response to {command:?}: {response:?}")]
    Parse { command: String, response: String },
    #[error("channel {index} out of range, instrument has {count}")]
    ChannelOutOfRange { index: usize, count: usize },
    #[error("unknown waveform {0:?}")]
    UnknownWaveform(String),
    #[error("unsupported instrument model {0:?}")]
    UnsupportedModel(String),
    #[error("{0} not supported")]
    NotSupported(&'static str),
}

impl Error {
    fn transport<E: StdError + Send + Sync + 'static>(e: E) -> Error {
        Error::Transport(Box::new(e))
    }

    fn parse(command: &str, response: &str) -> Error {
        Error::Parse {
            command: command.to_string(),
            response: response.to_string(),
        }
    }
}

/// Message based connection to an instrument
pub trait Transport {
    type Error: StdError + Send + Sync + 'static;

    /// Send one complete message
    fn write_message(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Receive one complete message
    fn read_message(&mut self) -> Result<Vec<u8>, Self::Error>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    type Error = T::Error;

    fn write_message(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        (**self).write_message(data)
    }

    fn read_message(&mut self) -> Result<Vec<u8>, Self::Error> {
        (**self).read_message()
    }
}

impl Transport for usbtmc::Device<'_> {
    type Error = usbtmc::Error;

    fn write_message(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        self.write_raw(data).map(|_| ())
    }

    fn read_message(&mut self) -> Result<Vec<u8>, Self::Error> {
        self.read_raw()
    }
}

/// SCPI commands and queries on top of any transport
pub trait Scpi: Transport {
    /// Send a command, the newline terminator is appended
    fn command(&mut self, command: &str) -> Result<(), Error> {
        debug!("SCPI write  -> {}", command);
        let message = format!("{}\n", command);
        self.write_message(message.as_bytes())
            .map_err(Error::transport)
    }

    /// Send a query and return the trimmed response
    fn query(&mut self, command: &str) -> Result<String, Error> {
        self.command(command)?;
        let raw = self.read_message().map_err(Error::transport)?;
        let response = String::from_utf8(raw)?;
        let trimmed = response.trim_matches(char::from(0)).trim().to_string();

        debug!("SCPI result <- {}", trimmed);

        if trimmed.is_empty() {
            return Err(Error::EmptyResponse(command.to_string()));
        }
        Ok(trimmed)
    }

    fn query_f64(&mut self, command: &str) -> Result<f64, Error> {
        let response = self.query(command)?;
        parse_f64(command, &response)
    }

    fn query_i64(&mut self, command: &str) -> Result<i64, Error> {
        let response = self.query(command)?;
        parse_i64(command, &response)
    }

    fn query_bool(&mut self, command: &str) -> Result<bool, Error> {
        let response = self.query(command)?;
        parse_bool(command, &response)
    }
}

impl<T: Transport + ?Sized> Scpi for T {}

fn parse_f64(command: &str, response: &str) -> Result<f64, Error> {
    response
        .trim()
        .parse::<f64>()
        .map_err(|_| Error::parse(command, response))
}

fn parse_i64(command: &str, response: &str) -> Result<i64, Error> {
    let value = parse_f64(command, response)?;
    if value.fract() != 0.0 || !value.is_finite() {
        return Err(Error::parse(command, response));
    }
    Ok(value as i64)
}

fn parse_bool(command: &str, response: &str) -> Result<bool, Error> {
    match response.trim().to_uppercase().as_str() {
        "1" | "ON" => Ok(true),
        "0" | "OFF" => Ok(false),
        _ => Err(Error::parse(command, response)),
    }
}

/// Standard waveform shapes of a function generator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StandardWaveform {
    Sine,
    Square,
    Triangle,
    RampUp,
    RampDown,
    DC,
}

impl fmt::Display for StandardWaveform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            StandardWaveform::Sine => "Sine",
            StandardWaveform::Square => "Square",
            StandardWaveform::Triangle => "Triangle",
            StandardWaveform::RampUp => "Ramp Up",
            StandardWaveform::RampDown => "Ramp Down",
            StandardWaveform::DC => "DC",
        };
        f.write_str(name)
    }
}

/// Identification returned by `*IDN?`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub manufacturer: String,
    pub model: String,
    pub serial: String,
    pub firmware: String,
}

impl Identity {
    pub fn parse(response: &str) -> Result<Identity, Error> {
        let fields: Vec<&str> = response.trim().splitn(4, ',').map(str::trim).collect();
        match fields.as_slice() {
            [manufacturer, model, serial, firmware] => Ok(Identity {
                manufacturer: manufacturer.to_string(),
                model: model.to_string(),
                serial: serial.to_string(),
                firmware: firmware.to_string(),
            }),
            _ => Err(Error::parse("*IDN?", response)),
        }
    }
}

/// Parses a `SYST:ERR?` response such as `-113,"Undefined header"`
fn parse_error_queue(response: &str) -> Result<(i32, String), Error> {
    let (code, message) = response
        .split_once(',')
        .ok_or_else(|| Error::parse("SYST:ERR?", response))?;
    let code = code
        .trim()
        .parse::<i32>()
        .map_err(|_| Error::parse("SYST:ERR?", response))?;
    Ok((code, message.trim().trim_matches('"').to_string()))
}

/// Capabilities every IVI instrument offers
pub trait Inherent {
    fn identity(&mut self) -> Result<Identity, Error>;

    /// Return the instrument to its power-on state
    fn reset(&mut self) -> Result<(), Error>;

    /// Clear the status registers and the error queue
    fn clear_status(&mut self) -> Result<(), Error>;

    /// Pop the oldest entry of the error queue, code 0 means no error
    fn error_query(&mut self) -> Result<(i32, String), Error>;
}

/// SCPI implementation of [`Inherent`] shared by the drivers
fn inherent_identity<T: Transport + ?Sized>(transport: &mut T) -> Result<Identity, Error> {
    let response = transport.query("*IDN?")?;
    Identity::parse(&response)
}

fn inherent_error_query<T: Transport + ?Sized>(transport: &mut T) -> Result<(i32, String), Error> {
    let response = transport.query("SYST:ERR?")?;
    parse_error_queue(&response)
}
