//! Hand-written encoding and decoding for the ingestion messages.
//!
//! The output of [`FastMessage::fast_encode_to`] is byte-for-byte identical to what [`prost::Message`] produces for the
//! same value, and [`FastMessage::fast_decode`] accepts anything a generic decoder accepts. Unknown fields are skipped,
//! and nesting is bounded by [`RECURSION_LIMIT`] exactly as in `prost`.
use std::str;

use snafu::OptionExt as _;

use crate::wire::{
    key_len, length_delimited_len, varint_len, InvalidUtf8, ReverseWriter, SliceReader, WireError, WireType,
    RECURSION_LIMIT,
};
use crate::{Exemplar, LabelPair, MetricMetadata, Sample, TimeSeries, WriteRequest};

/// A message with a hand-written fast path.
pub trait FastMessage: Default {
    /// Returns the exact number of bytes [`fast_encode_to`][FastMessage::fast_encode_to] will write.
    fn fast_encoded_len(&self) -> usize;

    /// Encodes this message into the tail of `buf`, returning the number of bytes written.
    ///
    /// When `buf` is exactly [`fast_encoded_len`][FastMessage::fast_encoded_len] bytes long, the whole buffer is
    /// filled.
    ///
    /// # Errors
    ///
    /// If `buf` is too small, an error is returned and the contents of `buf` are unspecified.
    fn fast_encode_to(&self, buf: &mut [u8]) -> Result<usize, WireError>;

    /// Merges the encoded message in `data` into this one.
    ///
    /// Repeated fields are appended to and scalar fields are overwritten, as with [`prost::Message::merge`].
    ///
    /// # Errors
    ///
    /// If `data` is not a valid encoding of this message, an error is returned and this message may be partially
    /// updated.
    fn fast_merge(&mut self, data: &[u8]) -> Result<(), WireError>;

    /// Replaces this message with the one encoded in `data`.
    ///
    /// # Errors
    ///
    /// If `data` is not a valid encoding of this message, an error is returned and this message may be partially
    /// updated.
    fn fast_decode(&mut self, data: &[u8]) -> Result<(), WireError> {
        *self = Self::default();
        self.fast_merge(data)
    }
}

macro_rules! impl_fast_message {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl FastMessage for $ty {
                fn fast_encoded_len(&self) -> usize {
                    self.body_len()
                }

                fn fast_encode_to(&self, buf: &mut [u8]) -> Result<usize, WireError> {
                    let mut writer = ReverseWriter::new(buf);
                    self.write_reverse(&mut writer)?;
                    Ok(writer.written())
                }

                fn fast_merge(&mut self, data: &[u8]) -> Result<(), WireError> {
                    self.merge_reader(SliceReader::new(data), RECURSION_LIMIT)
                }
            }
        )+
    };
}

impl_fast_message!(WriteRequest, TimeSeries, LabelPair, Sample, Exemplar, MetricMetadata);

#[inline]
fn bytes_len(tag: u32, data: &[u8]) -> usize {
    if data.is_empty() {
        0
    } else {
        length_delimited_len(tag, data.len())
    }
}

#[inline]
fn double_len(tag: u32, value: f64) -> usize {
    if value != 0.0 {
        key_len(tag) + 8
    } else {
        0
    }
}

#[inline]
fn int64_len(tag: u32, value: i64) -> usize {
    if value != 0 {
        key_len(tag) + varint_len(value as u64)
    } else {
        0
    }
}

#[inline]
fn enum_len(tag: u32, value: i32) -> usize {
    int64_len(tag, i64::from(value))
}

#[inline]
fn expect_wire_type(message: &'static str, tag: u32, found: WireType, expected: WireType) -> Result<(), WireError> {
    if found == expected {
        Ok(())
    } else {
        Err(WireError::UnexpectedWireType {
            message,
            tag,
            wire_type: found,
        })
    }
}

fn read_string(reader: &mut SliceReader<'_>, field: &'static str) -> Result<String, WireError> {
    let raw = reader.read_length_delimited()?;
    str::from_utf8(raw).ok().map(String::from).context(InvalidUtf8 { field })
}

type MergeFn<'a, T> = fn(&mut T, SliceReader<'a>, u32) -> Result<(), WireError>;

/// Reads an embedded message, charging one level of `budget` for it.
fn read_child<'a, T>(reader: &mut SliceReader<'a>, merge: MergeFn<'a, T>, budget: u32) -> Result<T, WireError>
where
    T: Default,
{
    if budget == 0 {
        return Err(WireError::RecursionLimit);
    }

    let body = reader.read_length_delimited()?;
    let mut child = T::default();
    merge(&mut child, SliceReader::new(body), budget - 1)?;
    Ok(child)
}

impl WriteRequest {
    fn body_len(&self) -> usize {
        let timeseries = self
            .timeseries
            .iter()
            .map(|ts| length_delimited_len(1, ts.body_len()))
            .sum::<usize>();
        let metadata = self
            .metadata
            .iter()
            .map(|md| length_delimited_len(3, md.body_len()))
            .sum::<usize>();
        let skip_validation = if self.skip_label_name_validation {
            key_len(1000) + 1
        } else {
            0
        };

        timeseries + enum_len(2, self.source) + metadata + skip_validation
    }

    fn write_reverse(&self, w: &mut ReverseWriter<'_>) -> Result<(), WireError> {
        if self.skip_label_name_validation {
            w.put_varint_field(1000, 1)?;
        }
        for md in self.metadata.iter().rev() {
            w.put_message_field(3, |w| md.write_reverse(w))?;
        }
        if self.source != 0 {
            w.put_varint_field(2, self.source as u64)?;
        }
        for ts in self.timeseries.iter().rev() {
            w.put_message_field(1, |w| ts.write_reverse(w))?;
        }
        Ok(())
    }

    fn merge_reader(&mut self, mut r: SliceReader<'_>, budget: u32) -> Result<(), WireError> {
        const NAME: &str = "WriteRequest";

        while !r.is_empty() {
            let (tag, wire_type) = r.read_key()?;
            match tag {
                1 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::LengthDelimited)?;
                    self.timeseries.push(read_child(&mut r, TimeSeries::merge_reader, budget)?);
                }
                2 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::Varint)?;
                    self.source = r.read_varint()? as i32;
                }
                3 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::LengthDelimited)?;
                    self.metadata.push(read_child(&mut r, MetricMetadata::merge_reader, budget)?);
                }
                1000 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::Varint)?;
                    self.skip_label_name_validation = r.read_varint()? != 0;
                }
                _ => r.skip_field(tag, wire_type, budget)?,
            }
        }
        Ok(())
    }
}

impl TimeSeries {
    fn body_len(&self) -> usize {
        let labels = self
            .labels
            .iter()
            .map(|l| length_delimited_len(1, l.body_len()))
            .sum::<usize>();
        let samples = self
            .samples
            .iter()
            .map(|s| length_delimited_len(2, s.body_len()))
            .sum::<usize>();
        let exemplars = self
            .exemplars
            .iter()
            .map(|e| length_delimited_len(3, e.body_len()))
            .sum::<usize>();

        labels + samples + exemplars
    }

    fn write_reverse(&self, w: &mut ReverseWriter<'_>) -> Result<(), WireError> {
        for exemplar in self.exemplars.iter().rev() {
            w.put_message_field(3, |w| exemplar.write_reverse(w))?;
        }
        for sample in self.samples.iter().rev() {
            w.put_message_field(2, |w| sample.write_reverse(w))?;
        }
        for label in self.labels.iter().rev() {
            w.put_message_field(1, |w| label.write_reverse(w))?;
        }
        Ok(())
    }

    fn merge_reader(&mut self, mut r: SliceReader<'_>, budget: u32) -> Result<(), WireError> {
        const NAME: &str = "TimeSeries";

        while !r.is_empty() {
            let (tag, wire_type) = r.read_key()?;
            match tag {
                1 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::LengthDelimited)?;
                    self.labels.push(read_child(&mut r, LabelPair::merge_reader, budget)?);
                }
                2 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::LengthDelimited)?;
                    self.samples.push(read_child(&mut r, Sample::merge_reader, budget)?);
                }
                3 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::LengthDelimited)?;
                    self.exemplars.push(read_child(&mut r, Exemplar::merge_reader, budget)?);
                }
                _ => r.skip_field(tag, wire_type, budget)?,
            }
        }
        Ok(())
    }
}

impl LabelPair {
    fn body_len(&self) -> usize {
        bytes_len(1, &self.name) + bytes_len(2, &self.value)
    }

    fn write_reverse(&self, w: &mut ReverseWriter<'_>) -> Result<(), WireError> {
        if !self.value.is_empty() {
            w.put_bytes_field(2, &self.value)?;
        }
        if !self.name.is_empty() {
            w.put_bytes_field(1, &self.name)?;
        }
        Ok(())
    }

    fn merge_reader(&mut self, mut r: SliceReader<'_>, budget: u32) -> Result<(), WireError> {
        const NAME: &str = "LabelPair";

        while !r.is_empty() {
            let (tag, wire_type) = r.read_key()?;
            match tag {
                1 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::LengthDelimited)?;
                    self.name = r.read_length_delimited()?.to_vec();
                }
                2 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::LengthDelimited)?;
                    self.value = r.read_length_delimited()?.to_vec();
                }
                _ => r.skip_field(tag, wire_type, budget)?,
            }
        }
        Ok(())
    }
}

impl Sample {
    fn body_len(&self) -> usize {
        double_len(1, self.value) + int64_len(2, self.timestamp_ms)
    }

    fn write_reverse(&self, w: &mut ReverseWriter<'_>) -> Result<(), WireError> {
        if self.timestamp_ms != 0 {
            w.put_varint_field(2, self.timestamp_ms as u64)?;
        }
        if self.value != 0.0 {
            w.put_double_field(1, self.value)?;
        }
        Ok(())
    }

    fn merge_reader(&mut self, mut r: SliceReader<'_>, budget: u32) -> Result<(), WireError> {
        const NAME: &str = "Sample";

        while !r.is_empty() {
            let (tag, wire_type) = r.read_key()?;
            match tag {
                1 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::SixtyFourBit)?;
                    self.value = r.read_double()?;
                }
                2 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::Varint)?;
                    self.timestamp_ms = r.read_varint()? as i64;
                }
                _ => r.skip_field(tag, wire_type, budget)?,
            }
        }
        Ok(())
    }
}

impl Exemplar {
    fn body_len(&self) -> usize {
        let labels = self
            .labels
            .iter()
            .map(|l| length_delimited_len(1, l.body_len()))
            .sum::<usize>();

        labels + double_len(2, self.value) + int64_len(3, self.timestamp_ms)
    }

    fn write_reverse(&self, w: &mut ReverseWriter<'_>) -> Result<(), WireError> {
        if self.timestamp_ms != 0 {
            w.put_varint_field(3, self.timestamp_ms as u64)?;
        }
        if self.value != 0.0 {
            w.put_double_field(2, self.value)?;
        }
        for label in self.labels.iter().rev() {
            w.put_message_field(1, |w| label.write_reverse(w))?;
        }
        Ok(())
    }

    fn merge_reader(&mut self, mut r: SliceReader<'_>, budget: u32) -> Result<(), WireError> {
        const NAME: &str = "Exemplar";

        while !r.is_empty() {
            let (tag, wire_type) = r.read_key()?;
            match tag {
                1 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::LengthDelimited)?;
                    self.labels.push(read_child(&mut r, LabelPair::merge_reader, budget)?);
                }
                2 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::SixtyFourBit)?;
                    self.value = r.read_double()?;
                }
                3 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::Varint)?;
                    self.timestamp_ms = r.read_varint()? as i64;
                }
                _ => r.skip_field(tag, wire_type, budget)?,
            }
        }
        Ok(())
    }
}

impl MetricMetadata {
    fn body_len(&self) -> usize {
        enum_len(1, self.r#type)
            + bytes_len(2, self.metric_family_name.as_bytes())
            + bytes_len(4, self.help.as_bytes())
            + bytes_len(5, self.unit.as_bytes())
    }

    fn write_reverse(&self, w: &mut ReverseWriter<'_>) -> Result<(), WireError> {
        if !self.unit.is_empty() {
            w.put_bytes_field(5, self.unit.as_bytes())?;
        }
        if !self.help.is_empty() {
            w.put_bytes_field(4, self.help.as_bytes())?;
        }
        if !self.metric_family_name.is_empty() {
            w.put_bytes_field(2, self.metric_family_name.as_bytes())?;
        }
        if self.r#type != 0 {
            w.put_varint_field(1, self.r#type as u64)?;
        }
        Ok(())
    }

    fn merge_reader(&mut self, mut r: SliceReader<'_>, budget: u32) -> Result<(), WireError> {
        const NAME: &str = "MetricMetadata";

        while !r.is_empty() {
            let (tag, wire_type) = r.read_key()?;
            match tag {
                1 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::Varint)?;
                    self.r#type = r.read_varint()? as i32;
                }
                2 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::LengthDelimited)?;
                    self.metric_family_name = read_string(&mut r, "MetricMetadata.metric_family_name")?;
                }
                4 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::LengthDelimited)?;
                    self.help = read_string(&mut r, "MetricMetadata.help")?;
                }
                5 => {
                    expect_wire_type(NAME, tag, wire_type, WireType::LengthDelimited)?;
                    self.unit = read_string(&mut r, "MetricMetadata.unit")?;
                }
                _ => r.skip_field(tag, wire_type, budget)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use prost::Message as _;

    use super::*;
    use crate::{MetricType, SourceEnum};

    fn encode_fast<M: FastMessage>(msg: &M) -> Vec<u8> {
        let mut buf = vec![0u8; msg.fast_encoded_len()];
        let written = msg.fast_encode_to(&mut buf).expect("exactly sized buffer");
        assert_eq!(written, buf.len());
        buf
    }

    fn cpu_request() -> WriteRequest {
        WriteRequest {
            timeseries: vec![TimeSeries {
                labels: vec![LabelPair::new("__name__", "cpu")],
                samples: vec![Sample::new(1.5, 1000)],
                exemplars: vec![],
            }],
            ..Default::default()
        }
    }

    /// The remote-write request as a decoder that predates field 1000 sees it.
    #[derive(Clone, PartialEq, ::prost::Message)]
    struct BaselineWriteRequest {
        #[prost(message, repeated, tag = "1")]
        timeseries: Vec<TimeSeries>,

        #[prost(enumeration = "SourceEnum", tag = "2")]
        source: i32,

        #[prost(message, repeated, tag = "3")]
        metadata: Vec<MetricMetadata>,
    }

    #[test]
    fn cpu_sample_matches_generic_encoding() {
        let request = cpu_request();

        let fast = encode_fast(&request);
        assert_eq!(fast, request.encode_to_vec());

        let mut decoded = WriteRequest::default();
        decoded.fast_decode(&fast).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.sample_count(), 1);
    }

    #[test]
    fn empty_request_encodes_to_nothing() {
        let request = WriteRequest::default();
        assert_eq!(request.fast_encoded_len(), 0);
        assert!(encode_fast(&request).is_empty());
    }

    #[test]
    fn negative_enum_values_match_generic_encoding() {
        let request = WriteRequest {
            source: -3,
            metadata: vec![MetricMetadata {
                r#type: -1,
                ..Default::default()
            }],
            ..Default::default()
        };

        assert_eq!(encode_fast(&request), request.encode_to_vec());
    }

    #[test]
    fn undersized_buffer_is_rejected() {
        let request = cpu_request();
        let mut buf = vec![0u8; request.fast_encoded_len() - 1];
        let err = request.fast_encode_to(&mut buf).unwrap_err();
        assert!(matches!(err, WireError::BufferTooSmall { .. }));
    }

    #[test]
    fn truncated_input_is_rejected() {
        let encoded = cpu_request().encode_to_vec();
        let mut decoded = WriteRequest::default();
        let err = decoded.fast_decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { .. }));
    }

    #[test]
    fn wrong_wire_type_on_known_field_is_rejected() {
        // Field 1 of WriteRequest encoded as a varint.
        let mut decoded = WriteRequest::default();
        let err = decoded.fast_decode(&[0x08, 0x01]).unwrap_err();
        assert_eq!(
            err,
            WireError::UnexpectedWireType {
                message: "WriteRequest",
                tag: 1,
                wire_type: WireType::Varint,
            }
        );
    }

    #[test]
    fn invalid_utf8_in_metadata_is_rejected() {
        // MetricMetadata with metric_family_name = [0xFF], wrapped as WriteRequest field 3.
        let data = [0x1A, 0x03, 0x12, 0x01, 0xFF];
        let mut decoded = WriteRequest::default();
        let err = decoded.fast_decode(&data).unwrap_err();
        assert_eq!(
            err,
            WireError::InvalidUtf8 {
                field: "MetricMetadata.metric_family_name"
            }
        );
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut data = cpu_request().encode_to_vec();
        // Field 7, length-delimited, three bytes.
        data.extend_from_slice(&[0x3A, 0x03, b'a', b'b', b'c']);
        // Field 8, fixed32.
        data.extend_from_slice(&[0x45, 0x00, 0x00, 0x00, 0x00]);

        let mut decoded = WriteRequest::default();
        decoded.fast_decode(&data).unwrap();
        assert_eq!(decoded, cpu_request());
    }

    fn nested_groups(depth: usize) -> Vec<u8> {
        // Field 9 start group `depth` times, then as many end groups.
        let mut data = vec![0x4B; depth];
        data.resize(depth * 2, 0x4C);
        data
    }

    #[test]
    fn nesting_limit_matches_generic_decoder() {
        let within = nested_groups(RECURSION_LIMIT as usize);
        assert!(WriteRequest::decode(within.as_slice()).is_ok());
        WriteRequest::default().fast_decode(&within).unwrap();

        let beyond = nested_groups(RECURSION_LIMIT as usize + 1);
        assert!(WriteRequest::decode(beyond.as_slice()).is_err());
        assert_eq!(
            WriteRequest::default().fast_decode(&beyond).unwrap_err(),
            WireError::RecursionLimit
        );
    }

    #[test]
    fn deeply_nested_groups_are_rejected() {
        // Deep enough to exhaust the stack if nesting were unbounded.
        let data = nested_groups(2_000_000);
        assert_eq!(
            WriteRequest::default().fast_decode(&data).unwrap_err(),
            WireError::RecursionLimit
        );
    }

    #[test]
    fn nested_groups_inside_series_count_toward_limit() {
        // One TimeSeries (one level) whose unknown field 9 nests groups up to the remaining budget.
        let series_body = |depth: usize| {
            let body = nested_groups(depth);
            let mut data = vec![0x0A];
            data.extend(varint_bytes(body.len() as u64));
            data.extend(body);
            data
        };

        let within = series_body(RECURSION_LIMIT as usize - 1);
        assert!(WriteRequest::decode(within.as_slice()).is_ok());
        WriteRequest::default().fast_decode(&within).unwrap();

        let beyond = series_body(RECURSION_LIMIT as usize);
        assert!(WriteRequest::decode(beyond.as_slice()).is_err());
        assert_eq!(
            WriteRequest::default().fast_decode(&beyond).unwrap_err(),
            WireError::RecursionLimit
        );
    }

    fn varint_bytes(mut value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        while value >= 0x80 {
            out.push((value as u8 & 0x7F) | 0x80);
            value >>= 7;
        }
        out.push(value as u8);
        out
    }

    #[test]
    fn decode_replaces_previous_contents() {
        let mut decoded = cpu_request();
        decoded.fast_decode(&cpu_request().encode_to_vec()).unwrap();
        assert_eq!(decoded.timeseries.len(), 1);

        decoded.fast_merge(&cpu_request().encode_to_vec()).unwrap();
        assert_eq!(decoded.timeseries.len(), 2);
    }

    #[test]
    fn baseline_decoder_skips_extension_field() {
        let request = WriteRequest {
            skip_label_name_validation: true,
            source: SourceEnum::Rule as i32,
            ..cpu_request()
        };

        let baseline = BaselineWriteRequest::decode(encode_fast(&request).as_slice()).unwrap();
        assert_eq!(baseline.timeseries, request.timeseries);
        assert_eq!(baseline.source, SourceEnum::Rule as i32);

        let mut roundtrip = WriteRequest::default();
        roundtrip.fast_decode(&baseline.encode_to_vec()).unwrap();
        assert!(!roundtrip.skip_label_name_validation);
        assert_eq!(roundtrip.timeseries, request.timeseries);
    }

    fn arb_label() -> impl Strategy<Value = LabelPair> {
        (
            proptest::collection::vec(any::<u8>(), 0..12),
            proptest::collection::vec(any::<u8>(), 0..24),
        )
            .prop_map(|(name, value)| LabelPair { name, value })
    }

    fn arb_sample() -> impl Strategy<Value = Sample> {
        (-1.0e12f64..1.0e12, any::<i64>()).prop_map(|(value, ts)| Sample::new(value, ts))
    }

    fn arb_exemplar() -> impl Strategy<Value = Exemplar> {
        (proptest::collection::vec(arb_label(), 0..3), -1.0e6f64..1.0e6, any::<i64>()).prop_map(
            |(labels, value, timestamp_ms)| Exemplar {
                labels,
                value,
                timestamp_ms,
            },
        )
    }

    fn arb_series() -> impl Strategy<Value = TimeSeries> {
        (
            proptest::collection::vec(arb_label(), 0..6),
            proptest::collection::vec(arb_sample(), 0..8),
            proptest::collection::vec(arb_exemplar(), 0..2),
        )
            .prop_map(|(labels, samples, exemplars)| TimeSeries {
                labels,
                samples,
                exemplars,
            })
    }

    fn arb_metadata() -> impl Strategy<Value = MetricMetadata> {
        (0i32..=MetricType::StateSet as i32, "[a-z_]{0,16}", "[ -~]{0,32}", "[a-z]{0,8}").prop_map(
            |(r#type, metric_family_name, help, unit)| MetricMetadata {
                r#type,
                metric_family_name,
                help,
                unit,
            },
        )
    }

    fn arb_request() -> impl Strategy<Value = WriteRequest> {
        (
            proptest::collection::vec(arb_series(), 0..4),
            0i32..=1,
            proptest::collection::vec(arb_metadata(), 0..3),
            any::<bool>(),
        )
            .prop_map(|(timeseries, source, metadata, skip_label_name_validation)| WriteRequest {
                timeseries,
                source,
                metadata,
                skip_label_name_validation,
            })
    }

    proptest! {
        #[test]
        fn fast_and_generic_paths_agree(request in arb_request()) {
            let fast = encode_fast(&request);
            prop_assert_eq!(request.fast_encoded_len(), request.encoded_len());
            prop_assert_eq!(&fast, &request.encode_to_vec());

            let mut decoded = WriteRequest::default();
            decoded.fast_decode(&fast).unwrap();
            prop_assert_eq!(decoded, request);
        }
    }
}
