/* rivi (c) by Nao Pross <np@0hm.ch>
 *
 *
 * rivi is licensed under a
 * Creative Commons Attribution-ShareAlike 4.0 International License.
 *
 * You should have received a copy of the license along with this
 * work. If not, see <http://creativecommons.org/licenses/by-sa/4.0/>.
 */

//! Bulk-OUT / Bulk-IN message headers (USBTMC 1.0, section 3.2)

use std::num::Wrapping;

use super::Error;

pub const HEADER_SIZE: usize = 12;

/// USBTMC MsgID values
#[repr(u8)]
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgId {
    DevDepMsgOut = 1,
    RequestDevDepMsgIn = 2,
    VendorSpecificOut = 126,
    RequestVendorSpecificIn = 127,
}

/// Bulk-IN responses to REQUEST_DEV_DEP_MSG_IN reuse its MsgID
const DEV_DEP_MSG_IN: u8 = MsgId::RequestDevDepMsgIn as u8;

/// Transfer tag, never zero
#[derive(Clone, Copy, Debug)]
pub struct BTag(Wrapping<u8>);

impl BTag {
    pub fn new() -> BTag {
        BTag(Wrapping(0))
    }

    /// Advance and return the tag for the next transfer
    pub fn next(&mut self) -> u8 {
        self.0 += Wrapping(1_u8);
        if self.0 .0 == 0 {
            self.0 = Wrapping(1_u8);
        }
        self.0 .0
    }
}

impl Default for BTag {
    fn default() -> Self {
        BTag::new()
    }
}

// USBTMC table 1
fn prefix(msgid: MsgId, btag: u8) -> [u8; 4] {
    [msgid as u8, btag, !btag, 0x00]
}

/// Build a complete DEV_DEP_MSG_OUT packet: header, payload and alignment
/// padding
pub fn encode_dev_dep_msg_out(btag: u8, payload: &[u8], eom: bool) -> Vec<u8> {
    let pad_size = (4 - (payload.len() % 4)) % 4;
    let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len() + pad_size);

    packet.extend_from_slice(&prefix(MsgId::DevDepMsgOut, btag));
    // USBTMC table 3
    packet.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    packet.push(if eom { 0x01 } else { 0x00 });
    packet.extend_from_slice(&[0x00; 3]);

    packet.extend_from_slice(payload);
    packet.resize(packet.len() + pad_size, 0x00);
    packet
}

/// Build a REQUEST_DEV_DEP_MSG_IN header asking for at most `max_size` bytes
pub fn encode_request_dev_dep_msg_in(
    btag: u8,
    max_size: u32,
    term_char: Option<u8>,
) -> [u8; HEADER_SIZE] {
    let mut header = [0_u8; HEADER_SIZE];
    header[..4].copy_from_slice(&prefix(MsgId::RequestDevDepMsgIn, btag));
    // USBTMC table 4
    header[4..8].copy_from_slice(&max_size.to_le_bytes());
    if let Some(tc) = term_char {
        header[8] = 0x02;
        header[9] = tc;
    }
    header
}

/// Decoded header of a DEV_DEP_MSG_IN response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BulkInHeader {
    pub btag: u8,
    pub transfer_size: u32,
    pub end_of_message: bool,
}

impl BulkInHeader {
    pub fn decode(bytes: &[u8], expected_btag: u8) -> Result<BulkInHeader, Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::MalformedHeader("short bulk-in header"));
        }

        if bytes[0] != DEV_DEP_MSG_IN {
            return Err(Error::MalformedHeader("unexpected MsgID"));
        }

        let btag = bytes[1];
        if bytes[2] != !btag {
            return Err(Error::MalformedHeader("bTagInverse does not match bTag"));
        }

        if btag != expected_btag {
            return Err(Error::BTagMismatch {
                expected: expected_btag,
                found: btag,
            });
        }

        let transfer_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

        Ok(BulkInHeader {
            btag,
            transfer_size,
            end_of_message: bytes[8] & 0x01 != 0,
        })
    }
}

/// Split an outgoing message into transfers of at most `max_size` bytes,
/// each paired with its EOM flag
///
/// An empty message still yields a single zero-length EOM transfer.
pub fn split_message(data: &[u8], max_size: usize) -> Vec<(&[u8], bool)> {
    if data.is_empty() {
        return vec![(data, true)];
    }

    let count = (data.len() + max_size - 1) / max_size;
    data.chunks(max_size)
        .enumerate()
        .map(|(i, chunk)| (chunk, i + 1 == count))
        .collect()
}

/// Payload of one DEV_DEP_MSG_IN transfer, which may arrive over several
/// bulk reads
#[derive(Debug)]
pub struct InTransfer {
    header: BulkInHeader,
    payload: Vec<u8>,
}

impl InTransfer {
    /// Starts a transfer from the bytes following the header in the first
    /// bulk read
    pub fn new(header: BulkInHeader, first: &[u8]) -> InTransfer {
        let mut transfer = InTransfer {
            header,
            payload: Vec::with_capacity(header.transfer_size as usize),
        };
        transfer.extend(first);
        transfer
    }

    /// Appends received bytes, alignment padding past TransferSize is dropped
    pub fn extend(&mut self, bytes: &[u8]) {
        let remaining = self.header.transfer_size as usize - self.payload.len();
        self.payload
            .extend_from_slice(&bytes[..bytes.len().min(remaining)]);
    }

    pub fn is_complete(&self) -> bool {
        self.payload.len() >= self.header.transfer_size as usize
    }

    /// Whether the device has nothing more to send for this message
    pub fn ends_message(&self) -> bool {
        self.header.end_of_message || self.header.transfer_size == 0
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn btag_skips_zero_on_wrap() {
        let mut tag = BTag::new();
        assert_eq!(tag.next(), 1);
        for _ in 2..=255 {
            tag.next();
        }
        assert_eq!(tag.next(), 1);
        assert_eq!(tag.next(), 2);
    }

    #[test]
    fn dev_dep_msg_out_is_padded() {
        let packet = encode_dev_dep_msg_out(7, b"*IDN?\n", true);
        assert_eq!(packet.len(), HEADER_SIZE + 8);
        assert_eq!(&packet[..4], &[1, 7, 0xf8, 0]);
        assert_eq!(&packet[4..8], &[6, 0, 0, 0]);
        assert_eq!(packet[8], 0x01);
        assert_eq!(&packet[12..18], b"*IDN?\n");
        assert_eq!(&packet[18..], &[0, 0]);
    }

    #[test]
    fn dev_dep_msg_out_without_eom() {
        let packet = encode_dev_dep_msg_out(1, b"ABCD", false);
        assert_eq!(packet.len(), HEADER_SIZE + 4);
        assert_eq!(packet[8], 0x00);
    }

    #[test]
    fn request_in_sets_term_char() {
        let header = encode_request_dev_dep_msg_in(3, 0x0001_0000, Some(b'\n'));
        assert_eq!(&header[..4], &[2, 3, 0xfc, 0]);
        assert_eq!(&header[4..8], &[0, 0, 1, 0]);
        assert_eq!(header[8], 0x02);
        assert_eq!(header[9], b'\n');

        let header = encode_request_dev_dep_msg_in(3, 64, None);
        assert_eq!(header[8], 0x00);
        assert_eq!(header[9], 0x00);
    }

    #[test]
    fn decode_bulk_in_header() {
        let bytes = [2, 5, 0xfa, 0, 10, 0, 0, 0, 1, 0, 0, 0, b'1'];
        let header = BulkInHeader::decode(&bytes, 5).unwrap();
        assert_eq!(
            header,
            BulkInHeader {
                btag: 5,
                transfer_size: 10,
                end_of_message: true
            }
        );
    }

    #[test]
    fn decode_rejects_bad_headers() {
        assert!(matches!(
            BulkInHeader::decode(&[2, 5, 0xfa], 5),
            Err(Error::MalformedHeader(_))
        ));
        assert!(matches!(
            BulkInHeader::decode(&[1, 5, 0xfa, 0, 0, 0, 0, 0, 0, 0, 0, 0], 5),
            Err(Error::MalformedHeader(_))
        ));
        assert!(matches!(
            BulkInHeader::decode(&[2, 5, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0], 5),
            Err(Error::MalformedHeader(_))
        ));
        assert!(matches!(
            BulkInHeader::decode(&[2, 4, 0xfb, 0, 0, 0, 0, 0, 0, 0, 0, 0], 5),
            Err(Error::BTagMismatch {
                expected: 5,
                found: 4
            })
        ));
    }

    const MIB: usize = 1024 * 1024;

    #[test]
    fn empty_message_is_one_eom_transfer() {
        let parts = split_message(&[], MIB);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].0.is_empty());
        assert!(parts[0].1);

        let packet = encode_dev_dep_msg_out(1, parts[0].0, parts[0].1);
        assert_eq!(packet.len(), HEADER_SIZE);
        assert_eq!(&packet[4..9], &[0, 0, 0, 0, 1]);
    }

    #[test]
    fn exact_chunk_is_single_transfer() {
        let data = vec![0xaa_u8; MIB];
        let parts = split_message(&data, MIB);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].0.len(), MIB);
        assert!(parts[0].1);
    }

    #[test]
    fn only_last_chunk_sets_eom() {
        let data = vec![0x55_u8; MIB + 1];
        let parts = split_message(&data, MIB);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].0.len(), MIB);
        assert!(!parts[0].1);
        assert_eq!(parts[1].0.len(), 1);
        assert!(parts[1].1);

        // every transfer of a message carries a fresh tag
        let mut tag = BTag::new();
        let packets: Vec<Vec<u8>> = parts
            .iter()
            .map(|(chunk, eom)| encode_dev_dep_msg_out(tag.next(), chunk, *eom))
            .collect();
        assert_eq!(packets[0][1], 1);
        assert_eq!(packets[1][1], 2);
        assert_eq!(packets[0][8], 0x00);
        assert_eq!(packets[1][8], 0x01);
        assert_eq!(packets[1].len(), HEADER_SIZE + 4);
    }

    fn in_header(transfer_size: u32, end_of_message: bool) -> BulkInHeader {
        BulkInHeader {
            btag: 1,
            transfer_size,
            end_of_message,
        }
    }

    #[test]
    fn transfer_spanning_several_reads() {
        let mut transfer = InTransfer::new(in_header(10, true), b"+2.34");
        assert!(!transfer.is_complete());

        // the last read carries alignment padding past TransferSize
        transfer.extend(b"0E+03\0\0");
        assert!(transfer.is_complete());
        assert!(transfer.ends_message());
        assert_eq!(transfer.into_payload(), b"+2.340E+03");
    }

    #[test]
    fn transfer_without_eom_continues_message() {
        let transfer = InTransfer::new(in_header(4, false), b"ABCD");
        assert!(transfer.is_complete());
        assert!(!transfer.ends_message());
    }

    #[test]
    fn zero_size_transfer_ends_message() {
        let transfer = InTransfer::new(in_header(0, false), &[0, 0, 0, 0]);
        assert!(transfer.is_complete());
        assert!(transfer.ends_message());
        assert!(transfer.into_payload().is_empty());
    }
}
