/* rivi (c) by Nao Pross <np@0hm.ch>
 *
 *
 * rivi is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! Agilent / Keysight 33220A 20 MHz function generator

use tracing::debug;

use super::{BaseChannel, StdFuncChannel};
use crate::ivi::{
    inherent_error_query, inherent_identity, Error, Identity, Inherent, Scpi, StandardWaveform,
    Transport,
};

const MODEL: &str = "33220A";
const CHANNEL_COUNT: usize = 1;

/// The instrument reports a high-Z load setting as 9.9E+37
const HIGH_Z_THRESHOLD: f64 = 9.9e37;

/// SCPI function name and ramp symmetry (percent) of a standard waveform
fn function_of(waveform: StandardWaveform) -> (&'static str, Option<u8>) {
    match waveform {
        StandardWaveform::Sine => ("SIN", None),
        StandardWaveform::Square => ("SQU", None),
        StandardWaveform::Triangle => ("RAMP", Some(50)),
        StandardWaveform::RampUp => ("RAMP", Some(100)),
        StandardWaveform::RampDown => ("RAMP", Some(0)),
        StandardWaveform::DC => ("DC", None),
    }
}

pub struct Agilent33220<T: Transport> {
    transport: T,
    identity: Identity,
}

impl<T: Transport> Agilent33220<T> {
    /// Wraps a transport after checking that a 33220A answers on it
    pub fn new(mut transport: T) -> Result<Agilent33220<T>, Error> {
        let identity = inherent_identity(&mut transport)?;
        if identity.model != MODEL {
            return Err(Error::UnsupportedModel(identity.model));
        }

        debug!(serial = %identity.serial, firmware = %identity.firmware, "connected to 33220A");
        Ok(Agilent33220 {
            transport,
            identity,
        })
    }

    /// Identity read when the driver was created
    pub fn cached_identity(&self) -> &Identity {
        &self.identity
    }

    pub fn channel_count(&self) -> usize {
        CHANNEL_COUNT
    }

    /// View of the output channel `index`, 0-based
    pub fn channel(&mut self, index: usize) -> Result<Channel<'_, T>, Error> {
        if index >= CHANNEL_COUNT {
            return Err(Error::ChannelOutOfRange {
                index,
                count: CHANNEL_COUNT,
            });
        }
        Ok(Channel {
            transport: &mut self.transport,
            index,
        })
    }

    pub fn into_inner(self) -> T {
        self.transport
    }
}

impl<T: Transport> Inherent for Agilent33220<T> {
    fn identity(&mut self) -> Result<Identity, Error> {
        inherent_identity(&mut self.transport)
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.transport.command("*RST")
    }

    fn clear_status(&mut self) -> Result<(), Error> {
        self.transport.command("*CLS")
    }

    fn error_query(&mut self) -> Result<(i32, String), Error> {
        inherent_error_query(&mut self.transport)
    }
}

/// Output channel of the 33220A
pub struct Channel<'a, T: Transport> {
    transport: &'a mut T,
    index: usize,
}

impl<T: Transport> Channel<'_, T> {
    pub fn index(&self) -> usize {
        self.index
    }

    fn set_ramp_symmetry(&mut self, symmetry: Option<u8>) -> Result<(), Error> {
        match symmetry {
            Some(percent) => self
                .transport
                .command(&format!("FUNC:RAMP:SYMM {}", percent)),
            None => Ok(()),
        }
    }
}

impl<T: Transport> BaseChannel for Channel<'_, T> {
    fn enable_output(&mut self) -> Result<(), Error> {
        self.transport.command("OUTP ON")
    }

    fn disable_output(&mut self) -> Result<(), Error> {
        self.transport.command("OUTP OFF")
    }

    fn output_enabled(&mut self) -> Result<bool, Error> {
        self.transport.query_bool("OUTP?")
    }

    fn output_impedance(&mut self) -> Result<f64, Error> {
        let ohms = self.transport.query_f64("OUTP:LOAD?")?;
        if ohms >= HIGH_Z_THRESHOLD {
            Ok(f64::INFINITY)
        } else {
            Ok(ohms)
        }
    }

    fn set_output_impedance(&mut self, ohms: f64) -> Result<(), Error> {
        if ohms == f64::INFINITY {
            self.transport.command("OUTP:LOAD INF")
        } else if ohms.is_finite() {
            self.transport.command(&format!("OUTP:LOAD {}", ohms))
        } else {
            Err(Error::NotSupported("load impedance must be a number or +inf"))
        }
    }
}

impl<T: Transport> StdFuncChannel for Channel<'_, T> {
    fn amplitude(&mut self) -> Result<f64, Error> {
        self.transport.query_f64("VOLT?")
    }

    fn set_amplitude(&mut self, vpp: f64) -> Result<(), Error> {
        self.transport.command(&format!("VOLT {}", vpp))
    }

    fn dc_offset(&mut self) -> Result<f64, Error> {
        self.transport.query_f64("VOLT:OFFS?")
    }

    fn set_dc_offset(&mut self, volts: f64) -> Result<(), Error> {
        self.transport.command(&format!("VOLT:OFFS {}", volts))
    }

    fn frequency(&mut self) -> Result<f64, Error> {
        self.transport.query_f64("FREQ?")
    }

    fn set_frequency(&mut self, hz: f64) -> Result<(), Error> {
        self.transport.command(&format!("FREQ {}", hz))
    }

    fn standard_waveform(&mut self) -> Result<StandardWaveform, Error> {
        let function = self.transport.query("FUNC?")?;
        match function.to_uppercase().as_str() {
            "SIN" => Ok(StandardWaveform::Sine),
            "SQU" => Ok(StandardWaveform::Square),
            "DC" => Ok(StandardWaveform::DC),
            "RAMP" => match self.transport.query_i64("FUNC:RAMP:SYMM?")? {
                100 => Ok(StandardWaveform::RampUp),
                0 => Ok(StandardWaveform::RampDown),
                50 => Ok(StandardWaveform::Triangle),
                other => Err(Error::UnknownWaveform(format!("RAMP, {}% symmetry", other))),
            },
            // PULS, NOIS and USER are not standard waveforms
            _ => Err(Error::UnknownWaveform(function)),
        }
    }

    fn set_standard_waveform(&mut self, waveform: StandardWaveform) -> Result<(), Error> {
        let (function, symmetry) = function_of(waveform);
        self.transport.command(&format!("FUNC {}", function))?;
        self.set_ramp_symmetry(symmetry)
    }

    fn configure_standard_waveform(
        &mut self,
        waveform: StandardWaveform,
        amplitude: f64,
        dc_offset: f64,
        frequency: f64,
        start_phase: f64,
    ) -> Result<(), Error> {
        // phase is only programmable in burst mode on this model
        if start_phase != 0.0 {
            return Err(Error::NotSupported("start phase outside burst mode"));
        }

        let (function, symmetry) = function_of(waveform);
        self.transport.command(&format!(
            "APPL:{} {}, {}, {}",
            function, frequency, amplitude, dc_offset
        ))?;

        // APPL:RAMP always selects 100% symmetry
        match symmetry {
            Some(100) => Ok(()),
            other => self.set_ramp_symmetry(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ivi::mock::MockTransport;

    const IDN: &str = "Agilent Technologies,33220A,MY44035849,2.02-2.02-22-2";

    fn connected() -> MockTransport {
        let mut mock = MockTransport::new();
        mock.respond("*IDN?", IDN);
        mock
    }

    #[test]
    fn new_checks_model() {
        let mut mock = connected();
        let fgen = Agilent33220::new(&mut mock).unwrap();
        assert_eq!(fgen.cached_identity().serial, "MY44035849");
        assert_eq!(fgen.channel_count(), 1);
    }

    #[test]
    fn setup_failure_sends_nothing_else() {
        let mut mock = MockTransport::new();
        mock.respond("*IDN?", "Rigol Technologies,DG1022,DG1D0000000001,00.03");

        let result = Agilent33220::new(&mut mock);
        assert!(matches!(result, Err(Error::UnsupportedModel(model)) if model == "DG1022"));
        assert_eq!(mock.commands(), ["*IDN?"]);
    }

    #[test]
    fn unanswered_identification_fails_setup() {
        let mut mock = MockTransport::new();
        assert!(matches!(
            Agilent33220::new(&mut mock),
            Err(Error::Transport(_))
        ));
        assert_eq!(mock.commands(), ["*IDN?"]);
    }

    #[test]
    fn channel_out_of_range() {
        let mut mock = connected();
        let mut fgen = Agilent33220::new(&mut mock).unwrap();
        assert!(fgen.channel(0).is_ok());
        assert!(matches!(
            fgen.channel(1),
            Err(Error::ChannelOutOfRange { index: 1, count: 1 })
        ));
    }

    #[test]
    fn ramp_shapes_set_symmetry() {
        let mut mock = connected();
        {
            let mut fgen = Agilent33220::new(&mut mock).unwrap();
            let mut ch = fgen.channel(0).unwrap();
            ch.set_standard_waveform(StandardWaveform::Triangle).unwrap();
            ch.set_standard_waveform(StandardWaveform::RampDown).unwrap();
            ch.configure_standard_waveform(StandardWaveform::Triangle, 1.0, 0.0, 1000.0, 0.0)
                .unwrap();
        }

        assert_eq!(
            &mock.commands()[1..],
            [
                "FUNC RAMP",
                "FUNC:RAMP:SYMM 50",
                "FUNC RAMP",
                "FUNC:RAMP:SYMM 0",
                "APPL:RAMP 1000, 1, 0",
                "FUNC:RAMP:SYMM 50",
            ]
        );
    }

    #[test]
    fn configure_rejects_start_phase() {
        let mut mock = connected();
        {
            let mut fgen = Agilent33220::new(&mut mock).unwrap();
            let mut ch = fgen.channel(0).unwrap();
            assert!(matches!(
                ch.configure_standard_waveform(StandardWaveform::Sine, 1.0, 0.0, 1e3, 90.0),
                Err(Error::NotSupported(_))
            ));
        }
        assert_eq!(mock.commands(), ["*IDN?"]);
    }

    #[test]
    fn queries_read_back_values() {
        let mut mock = connected();
        mock.respond("FREQ?", "+2.340000000000000E+03")
            .respond("VOLT?", "+4.000000000000000E-01")
            .respond("VOLT:OFFS?", "+1.000000000000000E-01")
            .respond("OUTP?", "1")
            .respond("FUNC?", "RAMP")
            .respond("FUNC:RAMP:SYMM?", "+1.000000000000000E+02");

        let mut fgen = Agilent33220::new(&mut mock).unwrap();
        let mut ch = fgen.channel(0).unwrap();
        assert_eq!(format!("{:.0}", ch.frequency().unwrap()), "2340");
        assert_eq!(format!("{:.3}", ch.amplitude().unwrap()), "0.400");
        assert_eq!(ch.dc_offset().unwrap(), 0.1);
        assert!(ch.output_enabled().unwrap());
        assert_eq!(ch.standard_waveform().unwrap(), StandardWaveform::RampUp);
    }

    #[test]
    fn waveform_query_mapping() {
        let mut mock = connected();
        mock.respond("FUNC?", "SIN")
            .respond("FUNC?", "SQU")
            .respond("FUNC?", "DC")
            .respond("FUNC?", "RAMP")
            .respond("FUNC:RAMP:SYMM?", "+5.000000000000000E+01")
            .respond("FUNC?", "RAMP")
            .respond("FUNC:RAMP:SYMM?", "+0.000000000000000E+00")
            .respond("FUNC?", "RAMP")
            .respond("FUNC:RAMP:SYMM?", "+2.500000000000000E+01")
            .respond("FUNC?", "NOIS");

        let mut fgen = Agilent33220::new(&mut mock).unwrap();
        let mut ch = fgen.channel(0).unwrap();
        assert_eq!(ch.standard_waveform().unwrap(), StandardWaveform::Sine);
        assert_eq!(ch.standard_waveform().unwrap(), StandardWaveform::Square);
        assert_eq!(ch.standard_waveform().unwrap(), StandardWaveform::DC);
        assert_eq!(ch.standard_waveform().unwrap(), StandardWaveform::Triangle);
        assert_eq!(ch.standard_waveform().unwrap(), StandardWaveform::RampDown);
        assert!(matches!(
            ch.standard_waveform(),
            Err(Error::UnknownWaveform(_))
        ));
        assert!(matches!(
            ch.standard_waveform(),
            Err(Error::UnknownWaveform(w)) if w == "NOIS"
        ));
    }

    #[test]
    fn query_failure_leaves_channel_usable() {
        let mut mock = connected();
        mock.respond("VOLT?", "+4.000000000000000E-01");

        let mut fgen = Agilent33220::new(&mut mock).unwrap();
        let mut ch = fgen.channel(0).unwrap();
        assert!(ch.frequency().is_err());
        assert_eq!(ch.amplitude().unwrap(), 0.4);
    }

    #[test]
    fn output_impedance() {
        let mut mock = connected();
        mock.respond("OUTP:LOAD?", "+5.000000000000000E+01")
            .respond("OUTP:LOAD?", "+9.900000000000000E+37");
        {
            let mut fgen = Agilent33220::new(&mut mock).unwrap();
            let mut ch = fgen.channel(0).unwrap();
            assert_eq!(ch.output_impedance().unwrap(), 50.0);
            assert_eq!(ch.output_impedance().unwrap(), f64::INFINITY);
            ch.set_output_impedance(f64::INFINITY).unwrap();
            ch.set_output_impedance(50.0).unwrap();
        }
        assert_eq!(
            &mock.commands()[1..],
            ["OUTP:LOAD?", "OUTP:LOAD?", "OUTP:LOAD INF", "OUTP:LOAD 50"]
        );
    }

    #[test]
    fn output_impedance_rejects_nan_and_negative_infinity() {
        let mut mock = connected();
        {
            let mut fgen = Agilent33220::new(&mut mock).unwrap();
            let mut ch = fgen.channel(0).unwrap();
            assert!(matches!(
                ch.set_output_impedance(f64::NAN),
                Err(Error::NotSupported(_))
            ));
            assert!(matches!(
                ch.set_output_impedance(f64::NEG_INFINITY),
                Err(Error::NotSupported(_))
            ));
        }
        assert_eq!(mock.commands(), ["*IDN?"]);
    }

    #[test]
    fn inherent_operations() {
        let mut mock = connected();
        mock.respond("*IDN?", IDN)
            .respond("SYST:ERR?", "-222,\"Data out of range\"");
        {
            let mut fgen = Agilent33220::new(&mut mock).unwrap();
            assert_eq!(fgen.identity().unwrap().model, "33220A");
            fgen.reset().unwrap();
            fgen.clear_status().unwrap();
            assert_eq!(
                fgen.error_query().unwrap(),
                (-222, "Data out of range".to_string())
            );
        }
        assert_eq!(
            mock.commands(),
            ["*IDN?", "*IDN?", "*RST", "*CLS", "SYST:ERR?"]
        );
    }

    #[test]
    fn into_inner_returns_transport() {
        let fgen = Agilent33220::new(connected()).unwrap();
        let mock = fgen.into_inner();
        assert_eq!(mock.commands(), ["*IDN?"]);
    }
}
