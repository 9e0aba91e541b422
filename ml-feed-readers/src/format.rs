//! Sample format detection

/// Format of a stored sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// JPEG format
    Jpeg,
    /// PNG format
    Png,
    /// BMP format
    Bmp,
    /// Binary portable pixmap (P6)
    Ppm,
    /// Binary portable graymap (P5)
    Pgm,
    /// TIFF format
    Tiff,
    /// WebP format
    WebP,
    /// RIFF/WAVE audio
    Wav,
    /// Unknown format
    Unknown,
}

impl SampleFormat {
    /// Detect format from file extension
    pub fn from_extension(extension: &str) -> Self {
        match extension.to_lowercase().as_str() {
            "jpg" | "jpeg" => SampleFormat::Jpeg,
            "png" => SampleFormat::Png,
            "bmp" => SampleFormat::Bmp,
            "ppm" => SampleFormat::Ppm,
            "pgm" => SampleFormat::Pgm,
            "tiff" | "tif" => SampleFormat::Tiff,
            "webp" => SampleFormat::WebP,
            "wav" => SampleFormat::Wav,
            _ => SampleFormat::Unknown,
        }
    }

    /// Detect format from magic bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match bytes {
            // JPEG: FF D8 FF
            [0xFF, 0xD8, 0xFF, ..] => SampleFormat::Jpeg,

            // PNG: 89 50 4E 47 0D 0A 1A 0A
            [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, ..] => SampleFormat::Png,

            // BMP: 42 4D
            [0x42, 0x4D, ..] => SampleFormat::Bmp,

            [b'P', b'6', ..] => SampleFormat::Ppm,
            [b'P', b'5', ..] => SampleFormat::Pgm,

            // TIFF: 49 49 2A 00 or 4D 4D 00 2A
            [0x49, 0x49, 0x2A, 0x00, ..] | [0x4D, 0x4D, 0x00, 0x2A, ..] => SampleFormat::Tiff,

            // RIFF container: WEBP or WAVE
            [0x52, 0x49, 0x46, 0x46, _, _, _, _, 0x57, 0x45, 0x42, 0x50, ..] => SampleFormat::WebP,
            [0x52, 0x49, 0x46, 0x46, _, _, _, _, 0x57, 0x41, 0x56, 0x45, ..] => SampleFormat::Wav,

            _ => SampleFormat::Unknown,
        }
    }

    /// Whether directory readers pick up files of this format
    pub fn is_supported(self) -> bool {
        self != SampleFormat::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("JPG", SampleFormat::Jpeg)]
    #[test_case("tif", SampleFormat::Tiff)]
    #[test_case("wav", SampleFormat::Wav)]
    #[test_case("txt", SampleFormat::Unknown)]
    fn test_from_extension(ext: &str, expected: SampleFormat) {
        assert_eq!(SampleFormat::from_extension(ext), expected);
    }

    #[test]
    fn test_from_bytes() {
        assert_eq!(SampleFormat::from_bytes(&[0xFF, 0xD8, 0xFF, 0xE0]), SampleFormat::Jpeg);
        assert_eq!(SampleFormat::from_bytes(b"P5\n2 2\n255\n"), SampleFormat::Pgm);
        assert_eq!(SampleFormat::from_bytes(b"RIFF\0\0\0\0WAVEfmt "), SampleFormat::Wav);
        assert_eq!(SampleFormat::from_bytes(b"xx"), SampleFormat::Unknown);
    }
}
