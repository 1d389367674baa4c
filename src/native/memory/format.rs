//! Rendering of property values, the way `TdhFormatProperty` renders them
use std::convert::TryInto;
use std::net::{Ipv4Addr, Ipv6Addr};

use num_traits::FromPrimitive;
use zerocopy::FromBytes;

use crate::native::etw_types::Guid;
use crate::native::tdh::{
    FormatRequest, TdhNativeError, TdhNativeResult, ERROR_INVALID_PARAMETER,
};
use crate::native::tdh_types::{
    EventMapEntry, EventMapInfoHeader, TdhInType, TdhOutType, EVENTMAP_INFO_FLAG_MANIFEST_BITMAP,
};
use crate::native::time::{FileTime, SystemTime};

/// Formats the value at the start of `request.user_data`. Returns the text and the consumed size
pub(crate) fn format_value(request: &FormatRequest<'_>) -> TdhNativeResult<(String, u16)> {
    let data = request.user_data;
    let in_type: TdhInType = FromPrimitive::from_u16(request.in_type)
        .ok_or(TdhNativeError::Os(ERROR_INVALID_PARAMETER))?;
    let out_type: TdhOutType =
        FromPrimitive::from_u16(request.out_type).unwrap_or(TdhOutType::OutTypeNull);

    let consumed = value_size(in_type, out_type, request.length, request.pointer_size, data)?;
    let bytes = data.get(..consumed).ok_or(TdhNativeError::InvalidEventData)?;

    if let Some(map_info) = request.map_info {
        if let Some(value) = integer(in_type, bytes) {
            let text = apply_map(map_info, value as u32)?;
            return Ok((text, consumed as u16));
        }
    }

    let text = match in_type {
        TdhInType::InTypeUnicodeString
        | TdhInType::InTypeNonNullTerminatedString
        | TdhInType::InTypeUnicodeChar => utf16_string(bytes),
        TdhInType::InTypeAnsiString
        | TdhInType::InTypeNonNullTerminatedAnsiString
        | TdhInType::InTypeAnsiChar => ansi_string(bytes),
        TdhInType::InTypeCountedString
        | TdhInType::InTypeReversedCountedString
        | TdhInType::InTypeManifestCountedString => utf16_string(&bytes[2..]),
        TdhInType::InTypeCountedAnsiString
        | TdhInType::InTypeReversedCountedAnsiString
        | TdhInType::InTypeManifestCountedAnsiString => ansi_string(&bytes[2..]),
        TdhInType::InTypeInt8
        | TdhInType::InTypeInt16
        | TdhInType::InTypeInt32
        | TdhInType::InTypeInt64 => format_signed(out_type, bytes),
        TdhInType::InTypeUInt8
        | TdhInType::InTypeUInt16
        | TdhInType::InTypeUInt32
        | TdhInType::InTypeUInt64 => format_unsigned(out_type, bytes),
        TdhInType::InTypeHexInt32 | TdhInType::InTypeHexInt64 => {
            format!("0x{:X}", read_unsigned(bytes))
        }
        TdhInType::InTypePointer | TdhInType::InTypeSizeT => format!("0x{:X}", read_unsigned(bytes)),
        TdhInType::InTypeFloat => format!("{}", f32::from_le_bytes(array(bytes)?)),
        TdhInType::InTypeDouble => format!("{}", f64::from_le_bytes(array(bytes)?)),
        TdhInType::InTypeBoolean => format_bool(read_unsigned(bytes)),
        TdhInType::InTypeGuid => Guid::read_from(bytes)
            .ok_or(TdhNativeError::InvalidEventData)?
            .to_string(),
        TdhInType::InTypeFileTime => {
            FileTime::from_quad(i64::from_le_bytes(array(bytes)?))
                .to_iso8601()
                .ok_or(TdhNativeError::InvalidEventData)?
        }
        TdhInType::InTypeSystemTime => SystemTime::read_from(bytes)
            .ok_or(TdhNativeError::InvalidEventData)?
            .to_iso8601()
            .ok_or(TdhNativeError::InvalidEventData)?,
        TdhInType::InTypeSid => sid_string(bytes)?,
        TdhInType::InTypeWbemSid => {
            let sid_start = 2 * request.pointer_size as usize;
            sid_string(&bytes[sid_start..])?
        }
        TdhInType::InTypeBinary | TdhInType::InTypeManifestCountedBinary => match out_type {
            TdhOutType::OutTypeIpv6 => {
                let octets: [u8; 16] = array(bytes)?;
                Ipv6Addr::from(octets).to_string()
            }
            _ => hex_string(bytes),
        },
        TdhInType::InTypeHexDump => hex_string(&bytes[4..]),
        TdhInType::InTypeNull | TdhInType::InTypeReserved24 => {
            return Err(TdhNativeError::Os(ERROR_INVALID_PARAMETER))
        }
    };

    Ok((text, consumed as u16))
}

/// Size of the value at the start of `data`, or an error if `data` is too short to hold it
pub(crate) fn value_size(
    in_type: TdhInType,
    out_type: TdhOutType,
    length: u16,
    pointer_size: u32,
    data: &[u8],
) -> TdhNativeResult<usize> {
    let length = length as usize;
    let size = if let Some(size) = in_type.static_size(pointer_size) {
        size as usize
    } else {
        match in_type {
            TdhInType::InTypeUnicodeString => {
                if length > 0 {
                    length * 2
                } else {
                    data.chunks_exact(2)
                        .position(|c| c == [0, 0])
                        .map(|p| p * 2 + 2)
                        .unwrap_or(data.len() & !1)
                }
            }
            TdhInType::InTypeAnsiString => {
                if length > 0 {
                    length
                } else {
                    data.iter()
                        .position(|b| *b == 0)
                        .map(|p| p + 1)
                        .unwrap_or(data.len())
                }
            }
            TdhInType::InTypeNonNullTerminatedString => length * 2,
            TdhInType::InTypeNonNullTerminatedAnsiString => length,
            TdhInType::InTypeBinary | TdhInType::InTypeManifestCountedBinary => {
                if length == 0 && out_type == TdhOutType::OutTypeIpv6 {
                    16
                } else {
                    length
                }
            }
            TdhInType::InTypeCountedString
            | TdhInType::InTypeCountedAnsiString
            | TdhInType::InTypeManifestCountedString
            | TdhInType::InTypeManifestCountedAnsiString => {
                2 + u16::from_le_bytes(array(data)?) as usize
            }
            TdhInType::InTypeReversedCountedString | TdhInType::InTypeReversedCountedAnsiString => {
                2 + u16::from_be_bytes(array(data)?) as usize
            }
            TdhInType::InTypeHexDump => 4 + u32::from_le_bytes(array(data)?) as usize,
            TdhInType::InTypeSid => sid_size(data)?,
            TdhInType::InTypeWbemSid => {
                let sid_start = 2 * pointer_size as usize;
                sid_start + sid_size(data.get(sid_start..).ok_or(TdhNativeError::InvalidEventData)?)?
            }
            _ => return Err(TdhNativeError::Os(ERROR_INVALID_PARAMETER)),
        }
    };

    if size > data.len() {
        return Err(TdhNativeError::InvalidEventData);
    }
    Ok(size)
}

fn sid_size(data: &[u8]) -> TdhNativeResult<usize> {
    let sub_authorities = *data.get(1).ok_or(TdhNativeError::InvalidEventData)? as usize;
    Ok(8 + 4 * sub_authorities)
}

fn sid_string(bytes: &[u8]) -> TdhNativeResult<String> {
    if bytes.len() < 8 {
        return Err(TdhNativeError::InvalidEventData);
    }
    let revision = bytes[0];
    let sub_authorities = bytes[1] as usize;
    let authority = bytes[2..8]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | *b as u64);

    let mut text = format!("S-{}-{}", revision, authority);
    for i in 0..sub_authorities {
        let start = 8 + 4 * i;
        let sub: [u8; 4] = array(bytes.get(start..).ok_or(TdhNativeError::InvalidEventData)?)?;
        text.push_str(&format!("-{}", u32::from_le_bytes(sub)));
    }
    Ok(text)
}

fn array<const N: usize>(bytes: &[u8]) -> TdhNativeResult<[u8; N]> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or(TdhNativeError::InvalidEventData)
}

fn read_unsigned(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .take(8)
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | *b as u64)
}

fn read_signed(bytes: &[u8]) -> i64 {
    let raw = read_unsigned(bytes);
    match bytes.len() {
        1 => raw as u8 as i8 as i64,
        2 => raw as u16 as i16 as i64,
        4 => raw as u32 as i32 as i64,
        _ => raw as i64,
    }
}

fn integer(in_type: TdhInType, bytes: &[u8]) -> Option<u64> {
    match in_type {
        TdhInType::InTypeInt8
        | TdhInType::InTypeUInt8
        | TdhInType::InTypeInt16
        | TdhInType::InTypeUInt16
        | TdhInType::InTypeInt32
        | TdhInType::InTypeUInt32
        | TdhInType::InTypeHexInt32
        | TdhInType::InTypeInt64
        | TdhInType::InTypeUInt64
        | TdhInType::InTypeHexInt64 => Some(read_unsigned(bytes)),
        _ => None,
    }
}

fn format_bool(value: u64) -> String {
    if value == 0 {
        String::from("false")
    } else {
        String::from("true")
    }
}

fn format_signed(out_type: TdhOutType, bytes: &[u8]) -> String {
    match out_type {
        TdhOutType::OutTypeHexInt8
        | TdhOutType::OutTypeHexInt16
        | TdhOutType::OutTypeHexInt32
        | TdhOutType::OutTypeHexInt64 => format!("0x{:X}", read_unsigned(bytes)),
        _ => read_signed(bytes).to_string(),
    }
}

fn format_unsigned(out_type: TdhOutType, bytes: &[u8]) -> String {
    let value = read_unsigned(bytes);
    match out_type {
        TdhOutType::OutTypeHexInt8
        | TdhOutType::OutTypeHexInt16
        | TdhOutType::OutTypeHexInt32
        | TdhOutType::OutTypeHexInt64
        | TdhOutType::OutTypeWin32Error
        | TdhOutType::OutTypeNtStatus
        | TdhOutType::OutTypeHResult => format!("0x{:X}", value),
        TdhOutType::OutTypeBoolean => format_bool(value),
        // Ports are stored in network byte order
        TdhOutType::OutTypePort if bytes.len() == 2 => u16::from_be_bytes([bytes[0], bytes[1]]).to_string(),
        TdhOutType::OutTypeIpv4 if bytes.len() == 4 => {
            Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]).to_string()
        }
        _ => value.to_string(),
    }
}

fn utf16_string(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|u| *u != 0)
        .collect();
    widestring::decode_utf16_lossy(units.iter().copied()).collect()
}

fn ansi_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn hex_string(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(2 + bytes.len() * 2);
    text.push_str("0x");
    for b in bytes {
        text.push_str(&format!("{:02X}", b));
    }
    text
}

/// Looks `value` up in a serialized `EVENT_MAP_INFO`
fn apply_map(map_info: &[u8], value: u32) -> TdhNativeResult<String> {
    let header = EventMapInfoHeader::read_from_prefix(map_info).ok_or(TdhNativeError::InvalidEventData)?;
    let entry_size = std::mem::size_of::<EventMapEntry>();
    let entries_start = std::mem::size_of::<EventMapInfoHeader>();

    let entries = (0..header.entry_count as usize)
        .map(|i| {
            map_info
                .get(entries_start + i * entry_size..)
                .and_then(EventMapEntry::read_from_prefix)
                .ok_or(TdhNativeError::InvalidEventData)
        })
        .collect::<TdhNativeResult<Vec<_>>>()?;

    let output = |entry: &EventMapEntry| -> TdhNativeResult<String> {
        let bytes = map_info
            .get(entry.output_offset as usize..)
            .ok_or(TdhNativeError::InvalidEventData)?;
        Ok(utf16_string(bytes))
    };

    if header.flag & EVENTMAP_INFO_FLAG_MANIFEST_BITMAP != 0 {
        let mut remaining = value;
        let mut names = Vec::new();
        for entry in entries.iter().filter(|e| e.value != 0 && value & e.value == e.value) {
            names.push(output(entry)?);
            remaining &= !entry.value;
        }
        if names.is_empty() || remaining != 0 {
            return Err(TdhNativeError::InvalidEventData);
        }
        Ok(names.join("|"))
    } else {
        let entry = entries
            .iter()
            .find(|e| e.value == value)
            .ok_or(TdhNativeError::InvalidEventData)?;
        output(entry)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::native::memory::ValueMap;

    fn request<'a>(in_type: TdhInType, out_type: TdhOutType, length: u16, data: &'a [u8]) -> FormatRequest<'a> {
        FormatRequest {
            event_info: &[],
            map_info: None,
            pointer_size: 8,
            in_type: in_type as u16,
            out_type: out_type as u16,
            length,
            user_data: data,
        }
    }

    #[test]
    fn test_integers() {
        let data = (-5i32).to_le_bytes();
        let (text, consumed) =
            format_value(&request(TdhInType::InTypeInt32, TdhOutType::OutTypeNull, 4, &data)).unwrap();
        assert_eq!(text, "-5");
        assert_eq!(consumed, 4);

        let data = 0xBEEFu32.to_le_bytes();
        let (text, _) =
            format_value(&request(TdhInType::InTypeUInt32, TdhOutType::OutTypeHexInt32, 4, &data)).unwrap();
        assert_eq!(text, "0xBEEF");

        let data = [0x01, 0xbb];
        let (text, _) =
            format_value(&request(TdhInType::InTypeUInt16, TdhOutType::OutTypePort, 2, &data)).unwrap();
        assert_eq!(text, "443");

        let data = [10, 0, 0, 1];
        let (text, _) =
            format_value(&request(TdhInType::InTypeUInt32, TdhOutType::OutTypeIpv4, 4, &data)).unwrap();
        assert_eq!(text, "10.0.0.1");
    }

    #[test]
    fn test_strings() {
        let mut data: Vec<u8> = "héllo".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        data.extend_from_slice(&[0, 0, 0xff, 0xff]);
        let (text, consumed) =
            format_value(&request(TdhInType::InTypeUnicodeString, TdhOutType::OutTypeNull, 0, &data)).unwrap();
        assert_eq!(text, "héllo");
        assert_eq!(consumed, 12);

        let data = b"abc\0def";
        let (text, consumed) =
            format_value(&request(TdhInType::InTypeAnsiString, TdhOutType::OutTypeNull, 0, data)).unwrap();
        assert_eq!(text, "abc");
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_binary_and_sid() {
        let data = [0xde, 0xad, 0xbe, 0xef];
        let (text, consumed) =
            format_value(&request(TdhInType::InTypeBinary, TdhOutType::OutTypeHexBinary, 4, &data)).unwrap();
        assert_eq!(text, "0xDEADBEEF");
        assert_eq!(consumed, 4);

        let mut ipv6 = [0u8; 16];
        ipv6[15] = 1;
        let (text, consumed) =
            format_value(&request(TdhInType::InTypeBinary, TdhOutType::OutTypeIpv6, 0, &ipv6)).unwrap();
        assert_eq!(text, "::1");
        assert_eq!(consumed, 16);

        // S-1-5-18 (LocalSystem)
        let sid = [1, 1, 0, 0, 0, 0, 0, 5, 18, 0, 0, 0];
        let (text, consumed) =
            format_value(&request(TdhInType::InTypeSid, TdhOutType::OutTypeNull, 0, &sid)).unwrap();
        assert_eq!(text, "S-1-5-18");
        assert_eq!(consumed, 12);
    }

    #[test]
    fn test_times() {
        // 2023-01-01T00:00:00Z
        let data = 133_170_048_000_000_000i64.to_le_bytes();
        let (text, consumed) =
            format_value(&request(TdhInType::InTypeFileTime, TdhOutType::OutTypeNull, 8, &data)).unwrap();
        assert_eq!(text, "2023-01-01T00:00:00.0000000Z");
        assert_eq!(consumed, 8);

        let mut st = SystemTime {
            year: 2023,
            month: 6,
            day: 30,
            hour: 23,
            minute: 59,
            second: 59,
            milliseconds: 999,
            ..Default::default()
        };
        let (text, _) = format_value(&request(
            TdhInType::InTypeSystemTime,
            TdhOutType::OutTypeNull,
            16,
            zerocopy::AsBytes::as_bytes(&st),
        ))
        .unwrap();
        assert_eq!(text, "2023-06-30T23:59:59.999Z");

        st.month = 13;
        assert_eq!(
            format_value(&request(
                TdhInType::InTypeSystemTime,
                TdhOutType::OutTypeNull,
                16,
                zerocopy::AsBytes::as_bytes(&st),
            )),
            Err(TdhNativeError::InvalidEventData)
        );
    }

    #[test]
    fn test_errors() {
        let data = [1, 2];
        assert_eq!(
            format_value(&request(TdhInType::InTypeUInt32, TdhOutType::OutTypeNull, 4, &data)),
            Err(TdhNativeError::InvalidEventData)
        );
        assert_eq!(
            format_value(&request(TdhInType::InTypeNull, TdhOutType::OutTypeNull, 0, &data)),
            Err(TdhNativeError::Os(ERROR_INVALID_PARAMETER))
        );
    }

    #[test]
    fn test_maps() {
        let colors = ValueMap::value_map("Colors").entry(1, "Red").entry(2, "Blue").build();
        let data = 2u32.to_le_bytes();
        let mut req = request(TdhInType::InTypeUInt32, TdhOutType::OutTypeNull, 4, &data);
        req.map_info = Some(&colors);
        assert_eq!(format_value(&req).unwrap().0, "Blue");

        let data = 3u32.to_le_bytes();
        req.user_data = &data;
        assert_eq!(format_value(&req), Err(TdhNativeError::InvalidEventData));

        let flags = ValueMap::bitmap("Flags").entry(1, "Read").entry(4, "Exec").build();
        req.map_info = Some(&flags);
        let data = 5u32.to_le_bytes();
        req.user_data = &data;
        assert_eq!(format_value(&req).unwrap().0, "Read|Exec");
    }
}
