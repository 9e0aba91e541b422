//! Decoders that turn raw sample bytes into fixed-size batch slots

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Geometry of one sample slot in the batch buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeTarget {
    /// Maximum width in pixels (or elements for 1-D samples)
    pub width: u32,

    /// Maximum height in pixels; 1 for 1-D samples
    pub height: u32,

    /// Channels per pixel
    pub channels: u32,
}

impl DecodeTarget {
    /// Bytes in one slot
    pub fn sample_size(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}

/// Sizes of a decoded sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecodedInfo {
    /// Width and height as stored
    pub original_size: (u32, u32),

    /// Width and height written into the slot
    pub decoded_size: (u32, u32),
}

/// Decodes one sample into its slot
pub trait Decoder: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Decode `input` into `output`, which is exactly one slot of `target`
    fn decode(
        &mut self,
        sample: &str,
        input: &[u8],
        output: &mut [u8],
        target: &DecodeTarget,
    ) -> Result<DecodedInfo>;
}

impl<D: Decoder + ?Sized> Decoder for Box<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn decode(
        &mut self,
        sample: &str,
        input: &[u8],
        output: &mut [u8],
        target: &DecodeTarget,
    ) -> Result<DecodedInfo> {
        (**self).decode(sample, input, output, target)
    }
}

/// Copies bytes verbatim; the unused tail of the slot is zeroed
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl Decoder for RawDecoder {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn decode(
        &mut self,
        sample: &str,
        input: &[u8],
        output: &mut [u8],
        target: &DecodeTarget,
    ) -> Result<DecodedInfo> {
        if input.len() > output.len() {
            return Err(Error::Decode {
                name: sample.to_string(),
                reason: format!("{} bytes do not fit a {}-byte slot", input.len(), output.len()),
            });
        }
        output[..input.len()].copy_from_slice(input);
        output[input.len()..].fill(0);
        let size = (target.width, target.height);
        Ok(DecodedInfo {
            original_size: size,
            decoded_size: size,
        })
    }
}

/// Decodes binary PGM (P5) and PPM (P6) images with 8-bit samples.
///
/// Images larger than the slot are cropped to its top-left corner; smaller
/// images are written top-left and the rest of the slot is zeroed.
#[derive(Debug, Clone, Copy, Default)]
pub struct PnmDecoder;

struct PnmHeader {
    channels: u32,
    width: u32,
    height: u32,
    data_offset: usize,
}

fn parse_pnm_header(input: &[u8]) -> std::result::Result<PnmHeader, String> {
    let channels = match input.get(..2) {
        Some(b"P5") => 1,
        Some(b"P6") => 3,
        _ => return Err("not a binary PGM/PPM image".into()),
    };

    let mut fields = [0u32; 3];
    let mut pos = 2;
    for field in &mut fields {
        // skip whitespace and comments
        loop {
            match input.get(pos) {
                Some(c) if c.is_ascii_whitespace() => pos += 1,
                Some(b'#') => {
                    while input.get(pos).is_some_and(|&c| c != b'\n') {
                        pos += 1;
                    }
                }
                _ => break,
            }
        }
        let start = pos;
        while input.get(pos).is_some_and(u8::is_ascii_digit) {
            pos += 1;
        }
        *field = std::str::from_utf8(&input[start..pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or("malformed header")?;
    }
    if fields[2] != 255 {
        return Err(format!("unsupported max value {}", fields[2]));
    }

    Ok(PnmHeader {
        channels,
        width: fields[0],
        height: fields[1],
        // exactly one whitespace byte separates the header from the pixels
        data_offset: pos + 1,
    })
}

impl Decoder for PnmDecoder {
    fn name(&self) -> &'static str {
        "pnm"
    }

    fn decode(
        &mut self,
        sample: &str,
        input: &[u8],
        output: &mut [u8],
        target: &DecodeTarget,
    ) -> Result<DecodedInfo> {
        let decode_error = |reason: String| Error::Decode {
            name: sample.to_string(),
            reason,
        };
        let header = parse_pnm_header(input).map_err(decode_error)?;
        if header.channels != target.channels {
            return Err(decode_error(format!(
                "image has {} channels, slot expects {}",
                header.channels, target.channels
            )));
        }

        let src_row = header.width as usize * header.channels as usize;
        let pixels = input
            .get(header.data_offset..header.data_offset + src_row * header.height as usize)
            .ok_or_else(|| decode_error("truncated pixel data".into()))?;

        let width = header.width.min(target.width);
        let height = header.height.min(target.height);
        let dst_row = target.width as usize * target.channels as usize;
        let copy = width as usize * header.channels as usize;

        output.fill(0);
        for y in 0..height as usize {
            output[y * dst_row..y * dst_row + copy]
                .copy_from_slice(&pixels[y * src_row..y * src_row + copy]);
        }

        Ok(DecodedInfo {
            original_size: (header.width, header.height),
            decoded_size: (width, height),
        })
    }
}
