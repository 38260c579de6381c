/* rivi (c) by Nao Pross <np@0hm.ch>
 *
 *
 * rivi is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! VISA resource strings for USB instruments
//!
//! The accepted grammar is
//! `USB[board]::manufacturer ID::model code[::serial number[::interface]]::INSTR`
//! where numeric fields are either decimal or `0x` prefixed hexadecimal.

use std::fmt;
use std::str::FromStr;

use super::Error;

const RESOURCE_CLASS: &str = "INSTR";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisaResource {
    pub board: u16,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    pub interface: Option<u8>,
}

impl VisaResource {
    pub fn new(vendor_id: u16, product_id: u16, serial: Option<String>) -> VisaResource {
        VisaResource {
            board: 0,
            vendor_id,
            product_id,
            serial,
            interface: None,
        }
    }
}

fn parse_number<T>(field: &str, resource: &str) -> Result<T, Error>
where
    T: TryFrom<u32>,
{
    let invalid = || Error::InvalidResource(resource.to_string());

    let value = match field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16).map_err(|_| invalid())?,
        None => field.parse::<u32>().map_err(|_| invalid())?,
    };

    T::try_from(value).map_err(|_| invalid())
}

impl FromStr for VisaResource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidResource(s.to_string());

        let fields: Vec<&str> = s.trim().split("::").collect();
        if fields.len() < 4 || fields.len() > 6 {
            return Err(invalid());
        }

        let interface_type = fields[0];
        match interface_type.get(..3) {
            Some(prefix) if prefix.eq_ignore_ascii_case("USB") => {}
            _ => return Err(invalid()),
        }
        let board = match &interface_type[3..] {
            "" => 0,
            digits => digits.parse::<u16>().map_err(|_| invalid())?,
        };

        let class = fields[fields.len() - 1];
        if !class.eq_ignore_ascii_case(RESOURCE_CLASS) {
            return Err(invalid());
        }

        let vendor_id = parse_number::<u16>(fields[1], s)?;
        let product_id = parse_number::<u16>(fields[2], s)?;

        let serial = match fields.len() {
            5 | 6 if !fields[3].is_empty() => Some(fields[3].to_string()),
            5 | 6 => return Err(invalid()),
            _ => None,
        };

        let interface = match fields.len() {
            6 => Some(parse_number::<u8>(fields[4], s)?),
            _ => None,
        };

        Ok(VisaResource {
            board,
            vendor_id,
            product_id,
            serial,
            interface,
        })
    }
}

impl fmt::Display for VisaResource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "USB{}::0x{:04X}::0x{:04X}",
            self.board, self.vendor_id, self.product_id
        )?;
        if let Some(serial) = &self.serial {
            write!(f, "::{}", serial)?;
            if let Some(interface) = self.interface {
                write!(f, "::{}", interface)?;
            }
        }
        write!(f, "::{}", RESOURCE_CLASS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_resource() {
        let res: VisaResource = "USB0::2391::1031::MY44035849::INSTR".parse().unwrap();
        assert_eq!(res.board, 0);
        assert_eq!(res.vendor_id, 0x0957);
        assert_eq!(res.product_id, 0x0407);
        assert_eq!(res.serial.as_deref(), Some("MY44035849"));
        assert_eq!(res.interface, None);
    }

    #[test]
    fn parses_hex_resource_with_interface() {
        let res: VisaResource = "usb1::0x1AB1::0x0588::DS1ED141904883::2::instr"
            .parse()
            .unwrap();
        assert_eq!(res.board, 1);
        assert_eq!(res.vendor_id, 0x1ab1);
        assert_eq!(res.product_id, 0x0588);
        assert_eq!(res.serial.as_deref(), Some("DS1ED141904883"));
        assert_eq!(res.interface, Some(2));
    }

    #[test]
    fn serial_is_optional() {
        let res: VisaResource = "USB::0x0957::0x0407::INSTR".parse().unwrap();
        assert_eq!(res.serial, None);
        assert_eq!(res.interface, None);
    }

    #[test]
    fn rejects_malformed_resources() {
        for bad in [
            "",
            "GPIB0::12::INSTR",
            "USB0::2391::INSTR",
            "USB0::2391::1031::MY44035849",
            "USB0::2391::1031::MY44035849::RAW",
            "USB0::70000::1031::INSTR",
            "USB0::0xZZ::1031::INSTR",
            "USB0::2391::1031::::INSTR",
            "USBx::2391::1031::INSTR",
        ] {
            assert!(
                matches!(bad.parse::<VisaResource>(), Err(Error::InvalidResource(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn displays_hex_form() {
        let res: VisaResource = "USB0::2391::1031::MY44035849::INSTR".parse().unwrap();
        assert_eq!(res.to_string(), "USB0::0x0957::0x0407::MY44035849::INSTR");

        let res = VisaResource::new(0x0957, 0x0407, None);
        assert_eq!(res.to_string(), "USB0::0x0957::0x0407::INSTR");
    }
}
