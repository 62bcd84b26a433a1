//! Descriptor serialization
//!
//! Marshals map-info arrays and program-info descriptors across the
//! user/kernel boundary. The wire format is length-delimited
//! little-endian: every block opens with a header tag, every variable
//! field is preceded by a fixed-width count, and strings carry no
//! terminator on the wire. Serialization is two-pass: a call with an
//! undersized buffer fails with `InsufficientBuffer` and reports the
//! required length, so callers size a buffer and retry.

use crate::constants::{MAX_NAME_LENGTH, MAX_PIN_PATH_LENGTH};
use crate::error::{BpfError, BpfResult};

const MAP_INFO_ARRAY_TAG: u32 = 0x4D41_5049;
const PROGRAM_INFO_TAG: u32 = 0x5052_4749;

const HELPER_ARGUMENT_COUNT: usize = 5;

/// Map creation parameters plus the optional pin path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapInfo {
    pub map_type: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub pin_path: Vec<u8>,
}

/// Program-type identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guid(pub [u8; 16]);

/// Layout of a program's context structure.
///
/// Offsets are relative to the context pointer; a negative offset
/// means the field is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextDescriptor {
    pub size: u16,
    pub data: i16,
    pub end: i16,
    pub meta: i16,
}

/// Signature of one helper function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperPrototype {
    pub helper_id: u32,
    pub return_type: u32,
    pub arguments: [u32; HELPER_ARGUMENT_COUNT],
    pub name: String,
}

/// Everything a verifier needs to know about a program type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInfo {
    pub context_descriptor: ContextDescriptor,
    pub program_type: Guid,
    pub name: String,
    pub helper_prototypes: Vec<HelperPrototype>,
}

struct Writer<'a> {
    buffer: &'a mut [u8],
    position: usize,
}

impl<'a> Writer<'a> {
    fn put(&mut self, bytes: &[u8]) {
        self.buffer[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
    }

    fn put_u16(&mut self, value: u16) {
        self.put(&value.to_le_bytes());
    }

    fn put_i16(&mut self, value: i16) {
        self.put(&value.to_le_bytes());
    }

    fn put_u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }
}

struct Reader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, length: usize) -> BpfResult<&'a [u8]> {
        let end = self
            .position
            .checked_add(length)
            .filter(|end| *end <= self.buffer.len())
            .ok_or(BpfError::InvalidArgument)?;
        let bytes = &self.buffer[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    fn take_u16(&mut self) -> BpfResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn take_i16(&mut self) -> BpfResult<i16> {
        let bytes = self.take(2)?;
        Ok(i16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn take_u32(&mut self) -> BpfResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn finished(&self) -> bool {
        self.position == self.buffer.len()
    }
}

fn map_info_array_size(maps: &[MapInfo]) -> BpfResult<usize> {
    let mut size = 4 + 4; // tag + count
    for map in maps {
        if map.pin_path.len() >= MAX_PIN_PATH_LENGTH {
            return Err(BpfError::InvalidArgument);
        }
        size += 4 * 4 + 2 + map.pin_path.len();
    }
    Ok(size)
}

/// Serialize an array of map descriptors.
///
/// On success `serialized_len` is the byte count produced. If the
/// buffer is too small, fails with `InsufficientBuffer` and sets
/// `required_len`; pass an empty buffer to size the output.
pub fn serialize_map_info_array(
    maps: &[MapInfo],
    buffer: &mut [u8],
    serialized_len: &mut usize,
    required_len: &mut usize,
) -> BpfResult {
    *serialized_len = 0;
    let required = map_info_array_size(maps)?;
    *required_len = required;
    if buffer.len() < required {
        return Err(BpfError::InsufficientBuffer);
    }

    let mut writer = Writer { buffer, position: 0 };
    writer.put_u32(MAP_INFO_ARRAY_TAG);
    writer.put_u32(maps.len() as u32);
    for map in maps {
        writer.put_u32(map.map_type);
        writer.put_u32(map.key_size);
        writer.put_u32(map.value_size);
        writer.put_u32(map.max_entries);
        writer.put_u16(map.pin_path.len() as u16);
        writer.put(&map.pin_path);
    }
    *serialized_len = writer.position;
    Ok(())
}

/// Deserialize an array of map descriptors.
///
/// Unknown header tags and truncated or trailing bytes fail with
/// `InvalidArgument`.
pub fn deserialize_map_info_array(buffer: &[u8]) -> BpfResult<Vec<MapInfo>> {
    let mut reader = Reader {
        buffer,
        position: 0,
    };
    if reader.take_u32()? != MAP_INFO_ARRAY_TAG {
        return Err(BpfError::InvalidArgument);
    }

    let count = reader.take_u32()? as usize;
    let mut maps = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let map_type = reader.take_u32()?;
        let key_size = reader.take_u32()?;
        let value_size = reader.take_u32()?;
        let max_entries = reader.take_u32()?;
        let path_length = reader.take_u16()? as usize;
        if path_length >= MAX_PIN_PATH_LENGTH {
            return Err(BpfError::InvalidArgument);
        }
        let pin_path = reader.take(path_length)?.to_vec();
        maps.push(MapInfo {
            map_type,
            key_size,
            value_size,
            max_entries,
            pin_path,
        });
    }
    if !reader.finished() {
        return Err(BpfError::InvalidArgument);
    }
    Ok(maps)
}

fn checked_name(name: &str) -> BpfResult<&[u8]> {
    let bytes = name.as_bytes();
    if bytes.len() > MAX_NAME_LENGTH {
        return Err(BpfError::InvalidArgument);
    }
    Ok(bytes)
}

fn program_info_size(info: &ProgramInfo) -> BpfResult<usize> {
    let mut size = 4; // tag
    size += 2 + 2 + 2 + 2; // context descriptor
    size += 16; // program-type guid
    size += 2 + checked_name(&info.name)?.len();
    size += 4; // helper count
    for helper in &info.helper_prototypes {
        size += 4 + 4 + 4 * HELPER_ARGUMENT_COUNT;
        size += 2 + checked_name(&helper.name)?.len();
    }
    Ok(size)
}

/// Serialize a program-info descriptor. Same two-pass contract as
/// [`serialize_map_info_array`].
pub fn serialize_program_info(
    info: &ProgramInfo,
    buffer: &mut [u8],
    serialized_len: &mut usize,
    required_len: &mut usize,
) -> BpfResult {
    *serialized_len = 0;
    let required = program_info_size(info)?;
    *required_len = required;
    if buffer.len() < required {
        return Err(BpfError::InsufficientBuffer);
    }

    let mut writer = Writer { buffer, position: 0 };
    writer.put_u32(PROGRAM_INFO_TAG);
    writer.put_u16(info.context_descriptor.size);
    writer.put_i16(info.context_descriptor.data);
    writer.put_i16(info.context_descriptor.end);
    writer.put_i16(info.context_descriptor.meta);
    writer.put(&info.program_type.0);
    let name = info.name.as_bytes();
    writer.put_u16(name.len() as u16);
    writer.put(name);
    writer.put_u32(info.helper_prototypes.len() as u32);
    for helper in &info.helper_prototypes {
        writer.put_u32(helper.helper_id);
        writer.put_u32(helper.return_type);
        for argument in helper.arguments {
            writer.put_u32(argument);
        }
        let name = helper.name.as_bytes();
        writer.put_u16(name.len() as u16);
        writer.put(name);
    }
    *serialized_len = writer.position;
    Ok(())
}

/// Deserialize a program-info descriptor.
pub fn deserialize_program_info(buffer: &[u8]) -> BpfResult<ProgramInfo> {
    let mut reader = Reader {
        buffer,
        position: 0,
    };
    if reader.take_u32()? != PROGRAM_INFO_TAG {
        return Err(BpfError::InvalidArgument);
    }

    let context_descriptor = ContextDescriptor {
        size: reader.take_u16()?,
        data: reader.take_i16()?,
        end: reader.take_i16()?,
        meta: reader.take_i16()?,
    };
    let mut guid = [0u8; 16];
    guid.copy_from_slice(reader.take(16)?);

    let name = take_name(&mut reader)?;
    let helper_count = reader.take_u32()? as usize;
    let mut helper_prototypes = Vec::with_capacity(helper_count.min(1024));
    for _ in 0..helper_count {
        let helper_id = reader.take_u32()?;
        let return_type = reader.take_u32()?;
        let mut arguments = [0u32; HELPER_ARGUMENT_COUNT];
        for argument in arguments.iter_mut() {
            *argument = reader.take_u32()?;
        }
        let name = take_name(&mut reader)?;
        helper_prototypes.push(HelperPrototype {
            helper_id,
            return_type,
            arguments,
            name,
        });
    }
    if !reader.finished() {
        return Err(BpfError::InvalidArgument);
    }

    Ok(ProgramInfo {
        context_descriptor,
        program_type: Guid(guid),
        name,
        helper_prototypes,
    })
}

fn take_name(reader: &mut Reader<'_>) -> BpfResult<String> {
    let length = reader.take_u16()? as usize;
    if length > MAX_NAME_LENGTH {
        return Err(BpfError::InvalidArgument);
    }
    let bytes = reader.take(length)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| BpfError::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_maps() -> Vec<MapInfo> {
        vec![
            MapInfo {
                map_type: 1,
                key_size: 4,
                value_size: 8,
                max_entries: 1024,
                pin_path: b"/sys/fs/bpf/first".to_vec(),
            },
            MapInfo {
                map_type: 2,
                key_size: 13,
                value_size: 37,
                max_entries: 64,
                pin_path: Vec::new(),
            },
        ]
    }

    fn sample_program_info() -> ProgramInfo {
        ProgramInfo {
            context_descriptor: ContextDescriptor {
                size: 24,
                data: 0,
                end: 8,
                meta: -1,
            },
            program_type: Guid([0xAB; 16]),
            name: "sample_program".to_string(),
            helper_prototypes: vec![
                HelperPrototype {
                    helper_id: 1,
                    return_type: 0,
                    arguments: [1, 2, 0, 0, 0],
                    name: "map_lookup".to_string(),
                },
                HelperPrototype {
                    helper_id: 2,
                    return_type: 1,
                    arguments: [1, 2, 3, 0, 0],
                    name: "map_update".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_map_info_two_pass() {
        let maps = sample_maps();
        let mut serialized_len = 0;
        let mut required_len = 0;

        let result =
            serialize_map_info_array(&maps, &mut [], &mut serialized_len, &mut required_len);
        assert_eq!(result, Err(BpfError::InsufficientBuffer));
        assert!(required_len > 0);
        assert_eq!(serialized_len, 0);

        let mut buffer = vec![0u8; required_len];
        serialize_map_info_array(&maps, &mut buffer, &mut serialized_len, &mut required_len)
            .unwrap();
        assert_eq!(serialized_len, required_len);

        let decoded = deserialize_map_info_array(&buffer).unwrap();
        assert_eq!(decoded, maps);
    }

    #[test]
    fn test_program_info_round_trip() {
        let info = sample_program_info();
        let mut serialized_len = 0;
        let mut required_len = 0;

        assert_eq!(
            serialize_program_info(&info, &mut [], &mut serialized_len, &mut required_len),
            Err(BpfError::InsufficientBuffer)
        );

        let mut buffer = vec![0u8; required_len];
        serialize_program_info(&info, &mut buffer, &mut serialized_len, &mut required_len)
            .unwrap();

        let decoded = deserialize_program_info(&buffer).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let maps = sample_maps();
        let mut serialized_len = 0;
        let mut required_len = 0;
        serialize_map_info_array(&maps, &mut [], &mut serialized_len, &mut required_len).ok();
        let mut buffer = vec![0u8; required_len];
        serialize_map_info_array(&maps, &mut buffer, &mut serialized_len, &mut required_len)
            .unwrap();

        buffer[0] ^= 0xFF;
        assert_eq!(
            deserialize_map_info_array(&buffer),
            Err(BpfError::InvalidArgument)
        );
        assert_eq!(
            deserialize_program_info(&buffer),
            Err(BpfError::InvalidArgument)
        );
    }

    #[test]
    fn test_truncated_input_rejected() {
        let info = sample_program_info();
        let mut serialized_len = 0;
        let mut required_len = 0;
        serialize_program_info(&info, &mut [], &mut serialized_len, &mut required_len).ok();
        let mut buffer = vec![0u8; required_len];
        serialize_program_info(&info, &mut buffer, &mut serialized_len, &mut required_len)
            .unwrap();

        for cut in [1, 4, 11, buffer.len() - 1] {
            assert_eq!(
                deserialize_program_info(&buffer[..cut]),
                Err(BpfError::InvalidArgument),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let maps = sample_maps();
        let mut serialized_len = 0;
        let mut required_len = 0;
        serialize_map_info_array(&maps, &mut [], &mut serialized_len, &mut required_len).ok();
        let mut buffer = vec![0u8; required_len + 3];
        serialize_map_info_array(&maps, &mut buffer, &mut serialized_len, &mut required_len)
            .unwrap();
        assert_eq!(
            deserialize_map_info_array(&buffer),
            Err(BpfError::InvalidArgument)
        );
    }

    #[test]
    fn test_oversized_pin_path_rejected() {
        let maps = vec![MapInfo {
            map_type: 1,
            key_size: 4,
            value_size: 4,
            max_entries: 1,
            pin_path: vec![b'p'; MAX_PIN_PATH_LENGTH],
        }];
        let mut serialized_len = 0;
        let mut required_len = 0;
        assert_eq!(
            serialize_map_info_array(&maps, &mut [], &mut serialized_len, &mut required_len),
            Err(BpfError::InvalidArgument)
        );
    }

    #[test]
    fn test_empty_map_array() {
        let mut serialized_len = 0;
        let mut required_len = 0;
        serialize_map_info_array(&[], &mut [], &mut serialized_len, &mut required_len).ok();
        let mut buffer = vec![0u8; required_len];
        serialize_map_info_array(&[], &mut buffer, &mut serialized_len, &mut required_len)
            .unwrap();
        assert_eq!(deserialize_map_info_array(&buffer).unwrap(), vec![]);
    }
}
