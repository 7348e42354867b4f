//! Component types and their field codec
//!
//! Each component type writes its fields explicitly. On the wire every field
//! is packed to little-endian bytes and rendered as standard base64; strings
//! are base64 of their UTF-8 bytes. That keeps every field free of the
//! reserved framing bytes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::util::vec3::Vec3;

/// Who may receive a component's state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Visibility {
    /// Every subscriber
    Public,
    /// Only the subscriber that owns the entity
    OwnerOnly,
    /// Never replicated
    ServerOnly,
}

impl Visibility {
    #[inline]
    pub fn allows(&self, owner: bool) -> bool {
        match self {
            Visibility::Public => true,
            Visibility::OwnerOnly => owner,
            Visibility::ServerOnly => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("Field {0} is missing")]
    Missing(usize),
    #[error("Field {0} is not valid base64")]
    Base64(usize),
    #[error("Field {index} has {got} bytes, expected {expected}")]
    Length {
        index: usize,
        expected: usize,
        got: usize,
    },
    #[error("Field {0} is not valid UTF-8")]
    Utf8(usize),
    #[error("Unknown component kind '{0}'")]
    UnknownKind(String),
}

/// Replicated per-entity state
pub trait Component: Clone + Default + Send + Sync + 'static {
    /// Type name used on the wire
    const KIND: &'static str;
    const VISIBILITY: Visibility = Visibility::Public;

    fn encode_fields(&self, out: &mut FieldWriter);

    fn decode_fields(&mut self, input: &mut FieldReader<'_>) -> Result<(), FieldError>;
}

/// Encode a component into its wire fields
pub fn encode_component<T: Component>(value: &T) -> Vec<String> {
    let mut writer = FieldWriter::new();
    value.encode_fields(&mut writer);
    writer.finish()
}

/// Decode into a copy of `current`; `current` is untouched on error
pub fn decode_component<T: Component>(current: &T, fields: &[String]) -> Result<T, FieldError> {
    let mut next = current.clone();
    let mut reader = FieldReader::new(fields);
    next.decode_fields(&mut reader)?;
    Ok(next)
}

#[derive(Debug, Default)]
pub struct FieldWriter {
    fields: Vec<String>,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.fields.push(STANDARD.encode(bytes));
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.push_bytes(&[value as u8])
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.push_bytes(&[value])
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.push_bytes(&value.to_le_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.push_bytes(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.push_bytes(&value.to_le_bytes())
    }

    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.push_bytes(&value.to_le_bytes())
    }

    /// Three f32 packed into one 12-byte field
    pub fn write_vec3(&mut self, value: Vec3) -> &mut Self {
        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&value.x.to_le_bytes());
        bytes[4..8].copy_from_slice(&value.y.to_le_bytes());
        bytes[8..12].copy_from_slice(&value.z.to_le_bytes());
        self.push_bytes(&bytes)
    }

    pub fn write_uuid(&mut self, value: Uuid) -> &mut Self {
        self.push_bytes(value.as_bytes())
    }

    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.push_bytes(value.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn finish(self) -> Vec<String> {
        self.fields
    }
}

pub struct FieldReader<'a, S: AsRef<str> = String> {
    fields: &'a [S],
    position: usize,
}

impl<'a, S: AsRef<str>> FieldReader<'a, S> {
    pub fn new(fields: &'a [S]) -> Self {
        Self { fields, position: 0 }
    }

    fn next_bytes(&mut self) -> Result<(usize, Vec<u8>), FieldError> {
        let index = self.position;
        let field = self.fields.get(index).ok_or(FieldError::Missing(index))?;
        self.position += 1;
        let bytes = STANDARD
            .decode(field.as_ref())
            .map_err(|_| FieldError::Base64(index))?;
        Ok((index, bytes))
    }

    fn next_array<const N: usize>(&mut self) -> Result<[u8; N], FieldError> {
        let (index, bytes) = self.next_bytes()?;
        let got = bytes.len();
        bytes.try_into().map_err(|_| FieldError::Length {
            index,
            expected: N,
            got,
        })
    }

    pub fn read_bool(&mut self) -> Result<bool, FieldError> {
        Ok(self.next_array::<1>()?[0] != 0)
    }

    pub fn read_u8(&mut self) -> Result<u8, FieldError> {
        Ok(self.next_array::<1>()?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, FieldError> {
        Ok(u32::from_le_bytes(self.next_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32, FieldError> {
        Ok(i32::from_le_bytes(self.next_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, FieldError> {
        Ok(u64::from_le_bytes(self.next_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, FieldError> {
        Ok(f32::from_le_bytes(self.next_array()?))
    }

    pub fn read_vec3(&mut self) -> Result<Vec3, FieldError> {
        let b: [u8; 12] = self.next_array()?;
        Ok(Vec3::new(
            f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            f32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            f32::from_le_bytes([b[8], b[9], b[10], b[11]]),
        ))
    }

    pub fn read_uuid(&mut self) -> Result<Uuid, FieldError> {
        Ok(Uuid::from_bytes(self.next_array()?))
    }

    pub fn read_string(&mut self) -> Result<String, FieldError> {
        let (index, bytes) = self.next_bytes()?;
        String::from_utf8(bytes).map_err(|_| FieldError::Utf8(index))
    }

    /// Fields not consumed yet
    pub fn remaining(&self) -> usize {
        self.fields.len().saturating_sub(self.position)
    }
}

/// World placement; the only component the grid reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Vec3,
}

impl Transform {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            rotation: Vec3::ZERO,
        }
    }
}

impl Component for Transform {
    const KIND: &'static str = "Transform";

    fn encode_fields(&self, out: &mut FieldWriter) {
        out.write_vec3(self.position).write_vec3(self.rotation);
    }

    fn decode_fields(&mut self, input: &mut FieldReader<'_>) -> Result<(), FieldError> {
        self.position = input.read_vec3()?;
        self.rotation = input.read_vec3()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Profile {
        name: String,
        level: u32,
        karma: i32,
        premium: bool,
        guild: Uuid,
    }

    impl Component for Profile {
        const KIND: &'static str = "Profile";
        const VISIBILITY: Visibility = Visibility::OwnerOnly;

        fn encode_fields(&self, out: &mut FieldWriter) {
            out.write_str(&self.name)
                .write_u32(self.level)
                .write_i32(self.karma)
                .write_bool(self.premium)
                .write_uuid(self.guild);
        }

        fn decode_fields(&mut self, input: &mut FieldReader<'_>) -> Result<(), FieldError> {
            self.name = input.read_string()?;
            self.level = input.read_u32()?;
            self.karma = input.read_i32()?;
            self.premium = input.read_bool()?;
            self.guild = input.read_uuid()?;
            Ok(())
        }
    }

    #[test]
    fn test_visibility_rules() {
        assert!(Visibility::Public.allows(false));
        assert!(Visibility::OwnerOnly.allows(true));
        assert!(!Visibility::OwnerOnly.allows(false));
        assert!(!Visibility::ServerOnly.allows(true));
    }

    #[test]
    fn test_transform_codec() {
        let t = Transform {
            position: Vec3::new(1.5, -2.0, 0.25),
            rotation: Vec3::new(0.0, 90.0, 0.0),
        };
        let fields = encode_component(&t);
        assert_eq!(fields.len(), 2);
        // 12 bytes -> 16 base64 characters
        assert_eq!(fields[0].len(), 16);
        assert_eq!(decode_component(&Transform::default(), &fields).unwrap(), t);
    }

    #[test]
    fn test_mixed_fields_codec() {
        let p = Profile {
            name: "Zoë \u{1F600}".to_string(),
            level: 42,
            karma: -7,
            premium: true,
            guild: Uuid::new_v4(),
        };
        let fields = encode_component(&p);
        assert!(fields.iter().all(|f| !crate::net::framing::contains_reserved(f)));
        assert_eq!(decode_component(&Profile::default(), &fields).unwrap(), p);
    }

    #[test]
    fn test_decode_error_leaves_value_unchanged() {
        let current = Transform::at(Vec3::new(3.0, 4.0, 0.0));
        let bad = vec!["!!!".to_string(), "AAAA".to_string()];
        assert_eq!(decode_component(&current, &bad), Err(FieldError::Base64(0)));

        let short = vec![STANDARD.encode([0u8; 4])];
        assert!(matches!(
            decode_component(&current, &short),
            Err(FieldError::Length { index: 0, expected: 12, got: 4 })
        ));

        let missing: Vec<String> = vec![encode_component(&current)[0].clone()];
        assert_eq!(decode_component(&current, &missing), Err(FieldError::Missing(1)));
    }

    #[test]
    fn test_reader_over_str_slices() {
        let fields = encode_component(&Transform::at(Vec3::ONE));
        let borrowed: Vec<&str> = fields.iter().map(String::as_str).collect();
        let mut reader = FieldReader::new(&borrowed);
        assert_eq!(reader.read_vec3().unwrap(), Vec3::ONE);
        assert_eq!(reader.remaining(), 1);
    }
}
