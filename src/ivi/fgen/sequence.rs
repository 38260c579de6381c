/* rivi (c) by Nao Pross <np@0hm.ch>
 *
 *
 * rivi is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! Configure a channel for a 2.34 kHz ramp and read the settings back
//!
//! Instrument errors after setup do not stop the sequence: every step is
//! attempted and each failure is logged as a warning.

use tracing::{info, warn};

use super::StdFuncChannel;
use crate::ivi::StandardWaveform;

/// Settings read back from a channel, `None` where the query failed
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Readback {
    pub frequency: Option<f64>,
    pub amplitude: Option<f64>,
    pub waveform: Option<StandardWaveform>,
}

/// Sends every configuration command in order and returns how many failed
pub fn configure<C: StdFuncChannel>(ch: &mut C) -> usize {
    let steps = [
        ("disabling output", ch.disable_output()),
        ("setting amplitude", ch.set_amplitude(0.4)),
        (
            "setting standard waveform",
            ch.set_standard_waveform(StandardWaveform::Sine),
        ),
        ("setting DC offset", ch.set_dc_offset(0.1)),
        ("setting frequency", ch.set_frequency(2340.0)),
        // the same settings in a single call
        (
            "configuring standard waveform",
            ch.configure_standard_waveform(StandardWaveform::RampUp, 0.4, 0.1, 2340.0, 0.0),
        ),
        ("enabling output", ch.enable_output()),
    ];

    let mut failed = 0;
    for (step, result) in steps {
        if let Err(e) = result {
            warn!("error {}: {}", step, e);
            failed += 1;
        }
    }
    failed
}

/// Queries frequency, amplitude and waveform, logging one line for each.
/// A failed query is logged as a warning and reported with a zero value.
pub fn report<C: StdFuncChannel>(ch: &mut C) -> Readback {
    let frequency = ch
        .frequency()
        .map_err(|e| warn!("error querying frequency: {}", e))
        .ok();
    info!("Frequency = {:.0} Hz", frequency.unwrap_or(0.0));

    let amplitude = ch
        .amplitude()
        .map_err(|e| warn!("error querying amplitude: {}", e))
        .ok();
    info!("Amplitude = {:.3} Vpp", amplitude.unwrap_or(0.0));

    let waveform = ch
        .standard_waveform()
        .map_err(|e| warn!("error querying standard waveform: {}", e))
        .ok();
    match waveform {
        Some(wave) => info!("Standard waveform = {}", wave),
        None => info!("Standard waveform = unknown"),
    }

    Readback {
        frequency,
        amplitude,
        waveform,
    }
}
