use std::iter;

/// Null-terminated UTF-16, the way Windows APIs (and the strings embedded in TDH buffers) want it
pub trait EncodeUtf16 {
    fn into_utf16(self) -> Vec<u16>;
}

impl EncodeUtf16 for &str {
    fn into_utf16(self) -> Vec<u16> {
        self.encode_utf16().chain(iter::once(0)).collect()
    }
}

impl EncodeUtf16 for &String {
    fn into_utf16(self) -> Vec<u16> {
        self.as_str().into_utf16()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_null_terminated() {
        assert_eq!("ab".into_utf16(), vec![0x61, 0x62, 0]);
        assert_eq!((&String::new()).into_utf16(), vec![0]);
    }
}
