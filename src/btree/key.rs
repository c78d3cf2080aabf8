use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};

/// Bytes reserved for a name on disk, including the NUL terminator.
pub const NAME_FIELD_SIZE: usize = 50;
/// Longest name kept; longer names are truncated.
pub const MAX_NAME_LEN: usize = NAME_FIELD_SIZE - 1;

// name(50) + threshold(4) + data_offset(8) + data_size(4) + width(4) + height(4)
pub(crate) const KEY_SIZE: usize = NAME_FIELD_SIZE + 4 + 8 + 4 + 4 + 4;

/// Cut `name` at its first NUL, then to at most `MAX_NAME_LEN` bytes
/// without splitting a character. The on-disk name field is NUL-terminated,
/// so nothing past a NUL survives a round trip.
pub fn truncate_name(name: &str) -> &str {
    let name = name.split('\0').next().unwrap_or_default();
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Index entry for one binarized image.
///
/// Entries are ordered by `name` (bytewise) and then by `threshold`. The
/// remaining fields describe where the compressed pixels live and are
/// carried through the tree untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageKey {
    name: String,
    pub threshold: i32,
    pub data_offset: u64,
    pub data_size: u32,
    pub width: u32,
    pub height: u32,
}

impl ImageKey {
    pub fn new(
        name: &str,
        threshold: i32,
        data_offset: u64,
        data_size: u32,
        width: u32,
        height: u32,
    ) -> Self {
        ImageKey {
            name: truncate_name(name).to_string(),
            threshold,
            data_offset,
            data_size,
            width,
            height,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compare the ordering fields against a lookup target.
    pub fn cmp_target(&self, name: &str, threshold: i32) -> Ordering {
        self.name
            .as_bytes()
            .cmp(name.as_bytes())
            .then(self.threshold.cmp(&threshold))
    }

    pub fn matches(&self, name: &str, threshold: i32) -> bool {
        self.cmp_target(name, threshold) == Ordering::Equal
    }

    /// Ordering used by the tree. Payload fields do not participate.
    pub fn cmp_order(&self, other: &ImageKey) -> Ordering {
        self.cmp_target(&other.name, other.threshold)
    }

    /// Check that every payload field fits its signed on-disk width.
    pub fn check_encodable(&self) -> Result<()> {
        let too_large = |field: &str, value: u64, max: u64| -> Result<()> {
            Err(Error::InvalidArgument(format!(
                "{field} {value} of key {self} exceeds {max}"
            )))
        };
        if self.data_offset > i64::MAX as u64 {
            return too_large("data_offset", self.data_offset, i64::MAX as u64);
        }
        for (field, value) in [
            ("data_size", self.data_size),
            ("width", self.width),
            ("height", self.height),
        ] {
            if value > i32::MAX as u32 {
                return too_large(field, u64::from(value), i32::MAX as u64);
            }
        }
        Ok(())
    }

    pub(crate) fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), KEY_SIZE);
        self.check_encodable()
            .map_err(|e| Error::Serialization(e.to_string()))?;
        buf.fill(0);
        let name = self.name.as_bytes();
        buf[..name.len()].copy_from_slice(name);
        let mut pos = NAME_FIELD_SIZE;
        buf[pos..pos + 4].copy_from_slice(&self.threshold.to_le_bytes());
        pos += 4;
        buf[pos..pos + 8].copy_from_slice(&(self.data_offset as i64).to_le_bytes());
        pos += 8;
        buf[pos..pos + 4].copy_from_slice(&(self.data_size as i32).to_le_bytes());
        pos += 4;
        buf[pos..pos + 4].copy_from_slice(&(self.width as i32).to_le_bytes());
        pos += 4;
        buf[pos..pos + 4].copy_from_slice(&(self.height as i32).to_le_bytes());
        Ok(())
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != KEY_SIZE {
            return Err(Error::Deserialization(format!(
                "Invalid key size {} (expected {KEY_SIZE})",
                buf.len()
            )));
        }

        let name_field = &buf[..NAME_FIELD_SIZE];
        let name_len = name_field
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Deserialization("Key name is not terminated".into()))?;
        let name = std::str::from_utf8(&name_field[..name_len])
            .map_err(|e| Error::Deserialization(format!("Key name is not UTF-8: {e}")))?;

        let mut pos = NAME_FIELD_SIZE;
        let threshold = read_i32(buf, &mut pos);
        let data_offset = read_i64(buf, &mut pos);
        let data_size = read_i32(buf, &mut pos);
        let width = read_i32(buf, &mut pos);
        let height = read_i32(buf, &mut pos);

        if data_offset < 0 || data_size < 0 || width < 0 || height < 0 {
            return Err(Error::Deserialization(format!(
                "Negative payload field in key {name:?}"
            )));
        }

        Ok(ImageKey {
            name: name.to_string(),
            threshold,
            data_offset: data_offset as u64,
            data_size: data_size as u32,
            width: width as u32,
            height: height as u32,
        })
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?},threshold={}", self.name, self.threshold)
    }
}

fn read_i32(buf: &[u8], pos: &mut usize) -> i32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[*pos..*pos + 4]);
    *pos += 4;
    i32::from_le_bytes(bytes)
}

fn read_i64(buf: &[u8], pos: &mut usize) -> i64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[*pos..*pos + 8]);
    *pos += 8;
    i64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, threshold: i32) -> ImageKey {
        ImageKey::new(name, threshold, 0, 0, 1, 1)
    }

    #[test]
    fn orders_by_name_then_threshold() {
        assert_eq!(key("a", 90).cmp_order(&key("b", 10)), Ordering::Less);
        assert_eq!(key("img", 10).cmp_order(&key("img", 50)), Ordering::Less);
        assert_eq!(key("img", -5).cmp_order(&key("img", -20)), Ordering::Greater);
        assert_eq!(key("img", 7).cmp_order(&key("img", 7)), Ordering::Equal);
    }

    #[test]
    fn names_are_case_sensitive() {
        // Uppercase sorts before lowercase bytewise.
        assert_eq!(key("Zebra", 0).cmp_order(&key("apple", 0)), Ordering::Less);
        assert!(!key("img", 1).matches("IMG", 1));
    }

    #[test]
    fn payload_fields_do_not_affect_order() {
        let a = ImageKey::new("x", 3, 100, 20, 4, 5);
        let b = ImageKey::new("x", 3, 900, 7, 8, 9);
        assert_eq!(a.cmp_order(&b), Ordering::Equal);
    }

    #[test]
    fn long_names_are_truncated() {
        let long = "n".repeat(80);
        let k = key(&long, 0);
        assert_eq!(k.name().len(), MAX_NAME_LEN);

        // Multi-byte characters are never split.
        let accented = "é".repeat(30);
        let truncated = truncate_name(&accented);
        assert!(truncated.len() <= MAX_NAME_LEN);
        assert_eq!(truncated.chars().count(), 24);
    }

    #[test]
    fn encode_decode_preserves_fields() {
        let k = ImageKey::new("lena.pgm", 128, 4096, 311, 512, 480);
        let mut buf = [0u8; KEY_SIZE];
        k.encode_into(&mut buf).unwrap();
        assert_eq!(ImageKey::decode(&buf).unwrap(), k);
    }

    #[test]
    fn names_stop_at_nul() {
        assert_eq!(key("a\0z", 1).name(), "a");
        assert_eq!(truncate_name("\0abc"), "");
        assert!(key("a", 1).matches(truncate_name("a\0z"), 1));

        let k = key("a\0z", 1);
        let mut buf = [0u8; KEY_SIZE];
        k.encode_into(&mut buf).unwrap();
        assert_eq!(ImageKey::decode(&buf).unwrap(), k);
    }

    #[test]
    fn oversized_payload_fields_are_rejected() {
        let big = i32::MAX as u32 + 1;
        let cases = [
            ImageKey::new("k", 0, i64::MAX as u64 + 1, 1, 1, 1),
            ImageKey::new("k", 0, 0, big, 1, 1),
            ImageKey::new("k", 0, 0, 1, 3_000_000_000, 1),
            ImageKey::new("k", 0, 0, 1, 1, big),
        ];
        for k in cases {
            assert!(matches!(k.check_encodable(), Err(Error::InvalidArgument(_))));
            let mut buf = [0u8; KEY_SIZE];
            assert!(matches!(
                k.encode_into(&mut buf),
                Err(Error::Serialization(_))
            ));
        }

        let edge = ImageKey::new("k", 0, i64::MAX as u64, i32::MAX as u32, i32::MAX as u32, 0);
        let mut buf = [0u8; KEY_SIZE];
        edge.encode_into(&mut buf).unwrap();
        assert_eq!(ImageKey::decode(&buf).unwrap(), edge);
    }

    #[test]
    fn decode_rejects_unterminated_name() {
        let buf = [b'a'; KEY_SIZE];
        assert!(matches!(
            ImageKey::decode(&buf),
            Err(Error::Deserialization(_))
        ));
    }
}
