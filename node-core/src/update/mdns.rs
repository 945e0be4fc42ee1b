//! Minimal mDNS responder: answers A queries for `<hostname>.local`.

use core::net::Ipv4Addr;

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const ANSWER_TTL_SECS: u32 = 120;

const HEADER_LEN: usize = 12;
const FLAG_RESPONSE: u16 = 0x8000;
const FLAG_AUTHORITATIVE: u16 = 0x0400;
const TYPE_A: u16 = 1;
const TYPE_ANY: u16 = 255;
const CLASS_IN: u16 = 1;
const CLASS_MASK: u16 = 0x7FFF;
const CACHE_FLUSH: u16 = 0x8000;
const MAX_QUESTIONS: u16 = 8;

fn read_u16(packet: &[u8], at: usize) -> Option<u16> {
    let bytes = packet.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Compares the name at `at` with `hostname.local`, returning the offset just
/// past the name. Compressed names never match.
fn match_name(packet: &[u8], mut at: usize, hostname: &str) -> Option<(bool, usize)> {
    let mut expected = [hostname.as_bytes(), b"local".as_slice()].into_iter();
    let mut matched = true;
    loop {
        let len = usize::from(*packet.get(at)?);
        at += 1;
        if len == 0 {
            return Some((matched && expected.next().is_none(), at));
        }
        if len & 0xC0 != 0 {
            // Pointer: skip its second byte and give up on matching.
            return Some((false, at + 1));
        }
        let label = packet.get(at..at + len)?;
        at += len;
        match expected.next() {
            Some(want) if want.eq_ignore_ascii_case(label) => {}
            _ => matched = false,
        }
    }
}

/// Writes the answer to `query` into `out` when it asks for our A record.
/// Returns the response length.
pub fn answer(query: &[u8], hostname: &str, address: Ipv4Addr, out: &mut [u8]) -> Option<usize> {
    let flags = read_u16(query, 2)?;
    if flags & FLAG_RESPONSE != 0 {
        return None;
    }
    let questions = read_u16(query, 4)?.min(MAX_QUESTIONS);

    let mut at = HEADER_LEN;
    let mut wanted = false;
    for _ in 0..questions {
        let (matched, next) = match_name(query, at, hostname)?;
        let qtype = read_u16(query, next)?;
        let qclass = read_u16(query, next + 2)? & CLASS_MASK;
        at = next + 4;
        if matched && (qtype == TYPE_A || qtype == TYPE_ANY) && qclass == CLASS_IN {
            wanted = true;
            break;
        }
    }
    if !wanted {
        return None;
    }
    write_answer(hostname, address, out)
}

fn write_answer(hostname: &str, address: Ipv4Addr, out: &mut [u8]) -> Option<usize> {
    let host_len = u8::try_from(hostname.len()).ok().filter(|len| *len < 64)?;
    let name_len = 1 + usize::from(host_len) + 1 + 5 + 1;
    let total = HEADER_LEN + name_len + 10 + 4;
    let out = out.get_mut(..total)?;

    out[..HEADER_LEN].fill(0);
    out[2..4].copy_from_slice(&(FLAG_RESPONSE | FLAG_AUTHORITATIVE).to_be_bytes());
    out[6..8].copy_from_slice(&1u16.to_be_bytes());

    let mut at = HEADER_LEN;
    for label in [hostname.as_bytes(), b"local".as_slice()] {
        out[at] = u8::try_from(label.len()).ok()?;
        at += 1;
        out[at..at + label.len()].copy_from_slice(label);
        at += label.len();
    }
    out[at] = 0;
    at += 1;

    out[at..at + 2].copy_from_slice(&TYPE_A.to_be_bytes());
    out[at + 2..at + 4].copy_from_slice(&(CACHE_FLUSH | CLASS_IN).to_be_bytes());
    out[at + 4..at + 8].copy_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
    out[at + 8..at + 10].copy_from_slice(&4u16.to_be_bytes());
    out[at + 10..at + 14].copy_from_slice(&address.octets());
    Some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(labels: &[&str], qtype: u16, flags: u16) -> heapless::Vec<u8, 128> {
        let mut packet = heapless::Vec::new();
        packet.extend_from_slice(&[0, 0]).unwrap();
        packet.extend_from_slice(&flags.to_be_bytes()).unwrap();
        packet.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]).unwrap();
        for label in labels {
            packet.push(u8::try_from(label.len()).unwrap()).unwrap();
            packet.extend_from_slice(label.as_bytes()).unwrap();
        }
        packet.push(0).unwrap();
        packet.extend_from_slice(&qtype.to_be_bytes()).unwrap();
        packet.extend_from_slice(&0x8001u16.to_be_bytes()).unwrap();
        packet
    }

    const HOST: &str = "soil-quality-sensor";
    const ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 42);

    #[test]
    fn answers_a_query_for_our_name() {
        let packet = query(&["Soil-Quality-Sensor", "local"], TYPE_A, 0);
        let mut out = [0u8; 128];
        let len = answer(&packet, HOST, ADDR, &mut out).unwrap();
        let response = &out[..len];

        assert_eq!(&response[2..4], &[0x84, 0x00]);
        assert_eq!(&response[6..8], &[0, 1]);
        assert_eq!(usize::from(response[12]), HOST.len());
        assert_eq!(&response[len - 4..], &[192, 168, 1, 42]);
        assert_eq!(&response[len - 10..len - 6], &120u32.to_be_bytes());
    }

    #[test]
    fn ignores_other_names_and_types() {
        let mut out = [0u8; 128];
        let other = query(&["printer", "local"], TYPE_A, 0);
        assert_eq!(answer(&other, HOST, ADDR, &mut out), None);

        let aaaa = query(&[HOST, "local"], 28, 0);
        assert_eq!(answer(&aaaa, HOST, ADDR, &mut out), None);

        let longer = query(&[HOST, "local", "extra"], TYPE_A, 0);
        assert_eq!(answer(&longer, HOST, ADDR, &mut out), None);
    }

    #[test]
    fn ignores_responses_and_truncated_packets() {
        let mut out = [0u8; 128];
        let response = query(&[HOST, "local"], TYPE_A, 0x8400);
        assert_eq!(answer(&response, HOST, ADDR, &mut out), None);

        let packet = query(&[HOST, "local"], TYPE_A, 0);
        assert_eq!(answer(&packet[..20], HOST, ADDR, &mut out), None);
    }

    #[test]
    fn small_output_buffer_yields_nothing() {
        let packet = query(&[HOST, "local"], TYPE_ANY, 0);
        let mut out = [0u8; 16];
        assert_eq!(answer(&packet, HOST, ADDR, &mut out), None);
    }
}
