/* rivi (c) by Nao Pross <np@0hm.ch>
 *
 *
 * rivi is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! Function generator (IviFgen) capability groups

pub mod agilent33220;
pub mod sequence;

use super::{Error, StandardWaveform};

/// Output control every function generator channel has
pub trait BaseChannel {
    fn enable_output(&mut self) -> Result<(), Error>;
    fn disable_output(&mut self) -> Result<(), Error>;
    fn output_enabled(&mut self) -> Result<bool, Error>;

    /// Expected load in ohms, `f64::INFINITY` for high impedance
    fn output_impedance(&mut self) -> Result<f64, Error>;
    fn set_output_impedance(&mut self, ohms: f64) -> Result<(), Error>;
}

/// Standard function (IviFgenStdFunc) waveform generation
pub trait StdFuncChannel: BaseChannel {
    /// Peak to peak amplitude in volts
    fn amplitude(&mut self) -> Result<f64, Error>;
    fn set_amplitude(&mut self, vpp: f64) -> Result<(), Error>;

    fn dc_offset(&mut self) -> Result<f64, Error>;
    fn set_dc_offset(&mut self, volts: f64) -> Result<(), Error>;

    /// Frequency in hertz
    fn frequency(&mut self) -> Result<f64, Error>;
    fn set_frequency(&mut self, hz: f64) -> Result<(), Error>;

    fn standard_waveform(&mut self) -> Result<StandardWaveform, Error>;
    fn set_standard_waveform(&mut self, waveform: StandardWaveform) -> Result<(), Error>;

    /// Configure every standard waveform attribute at once, `start_phase` in
    /// degrees
    fn configure_standard_waveform(
        &mut self,
        waveform: StandardWaveform,
        amplitude: f64,
        dc_offset: f64,
        frequency: f64,
        start_phase: f64,
    ) -> Result<(), Error>;
}
