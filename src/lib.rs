//! Rust IVI instrument drivers over USB Test and Measurement Class (USBTMC)

/* rivi (c) by Nao Pross <np@0hm.ch>
 *
 *
 * rivi is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

pub mod ivi;
pub mod usbtmc;

pub use ivi::fgen::agilent33220::Agilent33220;
pub use ivi::fgen::{BaseChannel, StdFuncChannel};
pub use ivi::{Inherent, StandardWaveform, Transport};
pub use usbtmc::{Context, Device, VisaResource};
