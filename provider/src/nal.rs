//! Splitting of the H.264 elementary stream into NAL units and the minimal
//! SPS parse needed to follow device resolution changes.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::{ProviderError, Result};

pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL type nibble of an SPS unit; its payload byte is `0x67` in a baseline
/// stream.
pub const NAL_TYPE_SPS: u8 = 7;

/// Splits a byte stream on the `00 00 00 01` start code. Every emitted frame
/// begins with the start code; a start code straddling two reads is
/// reassembled. Bytes before the first start code are discarded.
#[derive(Debug, Default)]
pub struct NalCodec {
    synced: bool,
}

fn find_start_code(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < from + START_CODE.len() {
        return None;
    }
    buf[from..]
        .windows(START_CODE.len())
        .position(|w| w == START_CODE)
        .map(|pos| pos + from)
}

impl Decoder for NalCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, io::Error> {
        if !self.synced {
            match find_start_code(src, 0) {
                Some(idx) => {
                    src.advance(idx);
                    self.synced = true;
                }
                None => {
                    // Keep a partial start code at the tail for the next read.
                    let keep = src.len().min(START_CODE.len() - 1);
                    src.advance(src.len() - keep);
                    return Ok(None);
                }
            }
        }

        match find_start_code(src, START_CODE.len()) {
            Some(idx) => Ok(Some(src.split_to(idx).freeze())),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, io::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if self.synced && src.len() >= START_CODE.len() {
            return Ok(Some(src.split_to(src.len()).freeze()));
        }
        src.clear();
        Ok(None)
    }
}

/// Returns the NAL type nibble of a frame beginning with the start code.
pub fn nal_type(frame: &[u8]) -> Option<u8> {
    frame.get(START_CODE.len()).map(|b| b & 0x1f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpsInfo {
    pub width: u32,
    pub height: u32,
}

/// Decodes picture dimensions from an SPS payload (the bytes following the
/// NAL header byte).
pub fn parse_sps(payload: &[u8]) -> Result<SpsInfo> {
    let rbsp = unescape_rbsp(payload);
    let mut r = BitReader::new(&rbsp);

    let profile_idc = r.read_bits(8)?;
    r.read_bits(8)?; // constraint flags + reserved
    r.read_bits(8)?; // level_idc
    r.read_ue()?; // seq_parameter_set_id

    let mut chroma_format_idc = 1;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.read_bit()?; // separate_colour_plane_flag
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_bit()?; // qpprime_y_zero_transform_bypass_flag
        if r.read_bit()? == 1 {
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.read_bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = r.read_ue()?;
    if pic_order_cnt_type == 0 {
        r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if pic_order_cnt_type == 1 {
        r.read_bit()?; // delta_pic_order_always_zero_flag
        r.read_se()?; // offset_for_non_ref_pic
        r.read_se()?; // offset_for_top_to_bottom_field
        let cycle = r.read_ue()?;
        for _ in 0..cycle {
            r.read_se()?;
        }
    }

    r.read_ue()?; // max_num_ref_frames
    r.read_bit()?; // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs_minus_1 = r.read_ue()?;
    let pic_height_in_map_units_minus_1 = r.read_ue()?;
    let frame_mbs_only_flag = r.read_bit()?;

    Ok(SpsInfo {
        width: (pic_width_in_mbs_minus_1 + 1) * 16,
        height: (2 - frame_mbs_only_flag) * (pic_height_in_map_units_minus_1 + 1) * 16,
    })
}

fn skip_scaling_list(r: &mut BitReader, size: u32) -> Result<()> {
    let mut last_scale: i32 = 8;
    let mut next_scale: i32 = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Strips emulation prevention bytes (`00 00 03` becomes `00 00`).
fn unescape_rbsp(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut zeroes = 0usize;
    for &b in data {
        if zeroes >= 2 && b == 3 {
            zeroes = 0;
            continue;
        }
        if b == 0 {
            zeroes += 1;
        } else {
            zeroes = 0;
        }
        out.push(b);
    }
    out
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<u32> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or_else(|| ProviderError::MalformedFrame("sps truncated".into()))?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Ok(u32::from(bit))
    }

    fn read_bits(&mut self, n: u32) -> Result<u32> {
        let mut value = 0;
        for _ in 0..n {
            value = (value << 1) | self.read_bit()?;
        }
        Ok(value)
    }

    /// Unsigned exp-Golomb.
    fn read_ue(&mut self) -> Result<u32> {
        let mut leading_zeroes = 0;
        while self.read_bit()? == 0 {
            leading_zeroes += 1;
            if leading_zeroes > 31 {
                return Err(ProviderError::MalformedFrame("bad exp-golomb code".into()));
            }
        }
        let suffix = self.read_bits(leading_zeroes)?;
        Ok((1 << leading_zeroes) - 1 + suffix)
    }

    /// Signed exp-Golomb.
    fn read_se(&mut self) -> Result<i32> {
        let code = self.read_ue()?;
        let value = code.div_ceil(2) as i32;
        Ok(if code % 2 == 0 { -value } else { value })
    }
}

#[cfg(test)]
mod test {
    use tokio_util::codec::Decoder;

    use super::*;

    #[test]
    fn splits_stream_into_frames() {
        let mut codec = NalCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 1, 0x67, 0xaa, 0xbb]);
        buf.extend_from_slice(&[0, 0, 0, 1, 0x65, 0xcc]);

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..], &[0, 0, 0, 1, 0x67, 0xaa, 0xbb]);

        // The tail frame only completes at EOF.
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let second = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(&second[..], &[0, 0, 0, 1, 0x65, 0xcc]);
        assert_eq!(nal_type(&second), Some(5));
    }

    #[test]
    fn reassembles_straddled_start_code() {
        let mut codec = NalCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0, 0, 1, 0x67, 0xaa, 0, 0]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&[0, 1, 0x65]);
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..], &[0, 0, 0, 1, 0x67, 0xaa]);
    }

    #[test]
    fn resyncs_past_leading_garbage() {
        let mut codec = NalCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xde, 0xad, 0, 0, 0, 1, 0x67, 0, 0, 0, 1]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 1, 0x67]);
    }

    /// Bit-level writer mirroring the reader, used to author SPS payloads.
    #[derive(Default)]
    struct BitWriter {
        bytes: Vec<u8>,
        used: u32,
    }

    impl BitWriter {
        fn put_bit(&mut self, bit: u32) {
            if self.used % 8 == 0 {
                self.bytes.push(0);
            }
            if bit != 0 {
                let idx = (self.used / 8) as usize;
                self.bytes[idx] |= 1 << (7 - self.used % 8);
            }
            self.used += 1;
        }

        fn put_bits(&mut self, value: u32, n: u32) {
            for i in (0..n).rev() {
                self.put_bit((value >> i) & 1);
            }
        }

        fn put_ue(&mut self, value: u32) {
            let code = value + 1;
            let bits = 32 - code.leading_zeros();
            self.put_bits(0, bits - 1);
            self.put_bits(code, bits);
        }
    }

    fn baseline_sps(width_mbs_minus_1: u32, height_units_minus_1: u32, mbs_only: u32) -> Vec<u8> {
        let mut w = BitWriter::default();
        w.put_bits(66, 8); // profile_idc baseline
        w.put_bits(0, 8); // constraint flags
        w.put_bits(31, 8); // level_idc
        w.put_ue(0); // sps id
        w.put_ue(0); // log2_max_frame_num_minus4
        w.put_ue(2); // pic_order_cnt_type (no extra fields)
        w.put_ue(1); // max_num_ref_frames
        w.put_bit(0); // gaps allowed
        w.put_ue(width_mbs_minus_1);
        w.put_ue(height_units_minus_1);
        w.put_bit(mbs_only);
        w.put_bit(1); // trailing content the parser must not require
        w.bytes
    }

    #[test]
    fn decodes_sps_dimensions() {
        // 80x45 macroblocks, frame_mbs_only = 1: 1280x720.
        let sps = baseline_sps(79, 44, 1);
        let info = parse_sps(&sps).unwrap();
        assert_eq!(info, SpsInfo { width: 1280, height: 720 });

        // Interlaced map units double the height term.
        let sps = baseline_sps(44, 39, 0);
        let info = parse_sps(&sps).unwrap();
        assert_eq!(info, SpsInfo { width: 720, height: 1280 });
    }

    #[test]
    fn emulation_prevention_bytes_are_stripped() {
        assert_eq!(unescape_rbsp(&[0, 0, 3, 1]), vec![0, 0, 1]);
        assert_eq!(unescape_rbsp(&[0, 0, 3, 0, 0, 3]), vec![0, 0, 0, 0]);
        assert_eq!(unescape_rbsp(&[1, 0, 3, 2]), vec![1, 0, 3, 2]);
    }

    #[test]
    fn truncated_sps_is_an_error() {
        assert!(parse_sps(&[0x42, 0x00]).is_err());
    }
}
