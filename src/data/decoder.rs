//! Frame payload decoding.
//!
//! A frame carries two channels of 16-bit ADC words, either sample-interleaved
//! (A0 B0 A1 B1 ...) or as two contiguous blocks (A0..An B0..Bn), in the byte order
//! the firmware was built with. Neither property is inferred from the data: both
//! come from configuration and are fixed for the life of a pipeline.

use crate::config::{AdcSettings, ByteOrder, FrameSettings, SampleLayout, BYTES_PER_SAMPLE};
use crate::error::DecodeError;
use bytes::{BufMut, Bytes, BytesMut};

/// One immutable frame payload, without its start marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
}

impl Frame {
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Raw samples of both channels, equal length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBuffer {
    pub(crate) channel_a: Vec<u16>,
    pub(crate) channel_b: Vec<u16>,
}

impl SampleBuffer {
    /// Returns `None` when the channels differ in length.
    pub fn new(channel_a: Vec<u16>, channel_b: Vec<u16>) -> Option<Self> {
        (channel_a.len() == channel_b.len()).then_some(Self {
            channel_a,
            channel_b,
        })
    }

    pub fn channel_a(&self) -> &[u16] {
        &self.channel_a
    }

    pub fn channel_b(&self) -> &[u16] {
        &self.channel_b
    }

    /// Samples per channel.
    pub fn len(&self) -> usize {
        self.channel_a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channel_a.is_empty()
    }
}

/// Linear ADC transfer function: `voltage = raw * v_ref / adc_max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcTransfer {
    pub v_ref: f64,
    pub adc_max: u16,
}

impl AdcTransfer {
    pub fn from_settings(adc: &AdcSettings) -> Self {
        Self {
            v_ref: adc.v_ref,
            adc_max: adc.adc_max,
        }
    }

    pub fn to_voltage(&self, raw: u16) -> f64 {
        f64::from(raw) * self.v_ref / f64::from(self.adc_max)
    }

    /// Converts a channel to volts.
    pub fn convert(&self, raw: &[u16]) -> Vec<f64> {
        raw.iter().map(|&r| self.to_voltage(r)).collect()
    }
}

/// Byte layout shared by the decoder and the synthetic firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub samples_per_channel: usize,
    pub byte_order: ByteOrder,
    pub layout: SampleLayout,
}

impl FrameLayout {
    pub fn from_settings(frame: &FrameSettings) -> Self {
        Self {
            samples_per_channel: frame.samples_per_channel,
            byte_order: frame.byte_order,
            layout: frame.layout,
        }
    }

    /// Payload length in bytes.
    pub fn frame_size(&self) -> usize {
        self.samples_per_channel * 2 * BYTES_PER_SAMPLE
    }

    /// Serializes samples into a frame payload; the inverse of [`SampleDecoder::decode`].
    pub fn encode(&self, samples: &SampleBuffer) -> Result<Frame, DecodeError> {
        if samples.len() != self.samples_per_channel {
            return Err(DecodeError::SizeMismatch {
                expected: self.frame_size(),
                actual: samples.len() * 2 * BYTES_PER_SAMPLE,
            });
        }

        let mut out = BytesMut::with_capacity(self.frame_size());
        let mut put = |word: u16| match self.byte_order {
            ByteOrder::Little => out.put_u16_le(word),
            ByteOrder::Big => out.put_u16(word),
        };
        match self.layout {
            SampleLayout::Interleaved => {
                for (&a, &b) in samples.channel_a().iter().zip(samples.channel_b()) {
                    put(a);
                    put(b);
                }
            }
            SampleLayout::Block => {
                samples.channel_a().iter().for_each(|&a| put(a));
                samples.channel_b().iter().for_each(|&b| put(b));
            }
        }
        Ok(Frame::new(out.freeze()))
    }
}

/// Splits frame payloads into per-channel samples.
#[derive(Debug, Clone)]
pub struct SampleDecoder {
    layout: FrameLayout,
    adc_max: u16,
}

impl SampleDecoder {
    pub fn new(layout: FrameLayout, adc_max: u16) -> Self {
        Self { layout, adc_max }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Decodes one frame. Words above `adc_max` mark the frame as corrupted.
    pub fn decode(&self, frame: &Frame) -> Result<SampleBuffer, DecodeError> {
        let expected = self.layout.frame_size();
        if frame.len() != expected {
            return Err(DecodeError::SizeMismatch {
                expected,
                actual: frame.len(),
            });
        }

        let words: Vec<u16> = frame
            .as_bytes()
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| match self.layout.byte_order {
                ByteOrder::Little => u16::from_le_bytes([pair[0], pair[1]]),
                ByteOrder::Big => u16::from_be_bytes([pair[0], pair[1]]),
            })
            .collect();

        if let Some((index, &value)) = words.iter().enumerate().find(|&(_, &w)| w > self.adc_max)
        {
            return Err(DecodeError::SampleOutOfRange {
                index,
                value,
                adc_max: self.adc_max,
            });
        }

        let n = self.layout.samples_per_channel;
        let (channel_a, channel_b) = match self.layout.layout {
            SampleLayout::Interleaved => words.chunks_exact(2).map(|p| (p[0], p[1])).unzip(),
            SampleLayout::Block => (words[..n].to_vec(), words[n..].to_vec()),
        };

        Ok(SampleBuffer {
            channel_a,
            channel_b,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(n: usize, byte_order: ByteOrder, layout: SampleLayout) -> FrameLayout {
        FrameLayout {
            samples_per_channel: n,
            byte_order,
            layout,
        }
    }

    fn ramp_samples(n: usize) -> SampleBuffer {
        let a = (0..n).map(|i| (i * 7 % 4096) as u16).collect();
        let b = (0..n).map(|i| (4095 - i * 13 % 4096) as u16).collect();
        SampleBuffer::new(a, b).unwrap()
    }

    #[test]
    fn test_round_trip_all_layouts() {
        let samples = ramp_samples(64);
        for order in [ByteOrder::Little, ByteOrder::Big] {
            for arrangement in [SampleLayout::Interleaved, SampleLayout::Block] {
                let frame_layout = layout(64, order, arrangement);
                let frame = frame_layout.encode(&samples).unwrap();
                assert_eq!(frame.len(), 256);
                let decoded = SampleDecoder::new(frame_layout, 4095).decode(&frame).unwrap();
                assert_eq!(decoded, samples, "{:?}/{:?}", order, arrangement);
            }
        }
    }

    #[test]
    fn test_interleaved_little_endian_wire_format() {
        // A0=1, B0=0x0203, A1=0x0FFF, B1=0
        let frame = Frame::new(Bytes::from_static(&[
            0x01, 0x00, 0x03, 0x02, 0xFF, 0x0F, 0x00, 0x00,
        ]));
        let decoder = SampleDecoder::new(
            layout(2, ByteOrder::Little, SampleLayout::Interleaved),
            4095,
        );
        let samples = decoder.decode(&frame).unwrap();
        assert_eq!(samples.channel_a(), &[1, 0x0FFF]);
        assert_eq!(samples.channel_b(), &[0x0203, 0]);
    }

    #[test]
    fn test_block_big_endian_wire_format() {
        let frame = Frame::new(Bytes::from_static(&[
            0x00, 0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04,
        ]));
        let decoder = SampleDecoder::new(layout(2, ByteOrder::Big, SampleLayout::Block), 4095);
        let samples = decoder.decode(&frame).unwrap();
        assert_eq!(samples.channel_a(), &[1, 2]);
        assert_eq!(samples.channel_b(), &[3, 4]);
    }

    #[test]
    fn test_size_mismatch() {
        let decoder = SampleDecoder::new(
            layout(4, ByteOrder::Little, SampleLayout::Interleaved),
            4095,
        );
        let frame = Frame::new(Bytes::from(vec![0u8; 15]));
        assert_eq!(
            decoder.decode(&frame),
            Err(DecodeError::SizeMismatch {
                expected: 16,
                actual: 15
            })
        );
    }

    #[test]
    fn test_out_of_range_sample_rejected() {
        let decoder = SampleDecoder::new(
            layout(1, ByteOrder::Little, SampleLayout::Interleaved),
            4095,
        );
        let frame = Frame::new(Bytes::from_static(&[0x00, 0x00, 0x00, 0x10]));
        assert!(matches!(
            decoder.decode(&frame),
            Err(DecodeError::SampleOutOfRange {
                index: 1,
                value: 0x1000,
                ..
            })
        ));
    }

    #[test]
    fn test_voltage_transfer_endpoints() {
        let transfer = AdcTransfer {
            v_ref: 3.3,
            adc_max: 4095,
        };
        assert_eq!(transfer.to_voltage(0), 0.0);
        assert!((transfer.to_voltage(4095) - 3.3).abs() < 1e-12);
        let series = transfer.convert(&[0, 1000, 2000, 4095]);
        assert!(series.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_mismatched_channels_rejected() {
        assert!(SampleBuffer::new(vec![1, 2], vec![1]).is_none());
    }
}
