use std::sync::Arc;

use snafu::ResultExt as _;

use super::{Codec, FastDecode, FastEncode, MarshalError, UnmarshalError, WireMessage};
use crate::buf::{is_below_pooling_threshold, BufferPool, BufferSlice, PooledBuffer};

/// A codec that encodes and decodes through message fast paths, using pooled buffers for large messages.
///
/// Messages without a fast path are handed to the fallback codec unchanged, so `PooledCodec` produces exactly the same
/// bytes as its fallback for them. `PooledCodec` reports the fallback's name, which lets it replace the baseline codec
/// in a [`CodecRegistry`][super::CodecRegistry] transparently.
pub struct PooledCodec {
    fallback: Arc<dyn Codec>,
    pool: Arc<dyn BufferPool>,
}

impl PooledCodec {
    /// Wraps `fallback`, taking large buffers from `pool`.
    pub fn wrap(fallback: Arc<dyn Codec>, pool: Arc<dyn BufferPool>) -> Self {
        Self { fallback, pool }
    }
}

impl Codec for PooledCodec {
    fn name(&self) -> &str {
        self.fallback.name()
    }

    fn marshal(&self, message: &dyn WireMessage) -> Result<BufferSlice, MarshalError> {
        let Some(optimized) = message.as_optimized() else {
            return self.fallback.marshal(message);
        };

        let name = message.message_name();
        let size = optimized.encoded_size();

        if is_below_pooling_threshold(size) {
            let mut buf = vec![0; size];
            let written = optimized
                .encode_to_sized_buffer(&mut buf)
                .context(FastEncode { message: name })?;
            check_written(name, size, written)?;
            return Ok(BufferSlice::from(buf));
        }

        let mut buf = PooledBuffer::acquire(&self.pool, size);
        match optimized.encode_to_sized_buffer(&mut buf) {
            Ok(written) => match check_written(name, size, written) {
                Ok(()) => Ok(BufferSlice::from(buf)),
                Err(e) => {
                    buf.free();
                    Err(e)
                }
            },
            Err(source) => {
                buf.free();
                Err(MarshalError::FastEncode { message: name, source })
            }
        }
    }

    fn unmarshal(&self, data: &BufferSlice, message: &mut dyn WireMessage) -> Result<(), UnmarshalError> {
        let name = message.message_name();
        match message.as_optimized_mut() {
            Some(optimized) => {
                // Any pooled copy is released when `materialized` drops, on both the success and error paths.
                let materialized = data.materialize_to_buffer(&self.pool);
                optimized
                    .decode_from_slice(materialized.read_only_data())
                    .context(FastDecode { message: name })
            }
            None => self.fallback.unmarshal(data, message),
        }
    }
}

fn check_written(message: &'static str, expected: usize, actual: usize) -> Result<(), MarshalError> {
    if expected == actual {
        Ok(())
    } else {
        Err(MarshalError::SizeMismatch {
            message,
            expected,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

    use proptest::prelude::*;
    use tessera_protos::{
        Exemplar, LabelPair, MetricMetadata, Sample, TimeSeries, WireError, WriteRequest, WriteResponse,
        RECURSION_LIMIT,
    };

    use super::*;
    use crate::buf::{Buffer, TieredBufferPool, BUFFER_POOLING_THRESHOLD};
    use crate::codec::{OptimizedCodable, ProtobufCodec};

    struct CountingPool {
        inner: TieredBufferPool,
        gets: AtomicUsize,
        puts: AtomicUsize,
    }

    impl CountingPool {
        fn new() -> Self {
            Self {
                inner: TieredBufferPool::new(),
                gets: AtomicUsize::new(0),
                puts: AtomicUsize::new(0),
            }
        }

        fn outstanding(&self) -> usize {
            self.gets.load(Relaxed) - self.puts.load(Relaxed)
        }
    }

    impl BufferPool for CountingPool {
        fn get(&self, size: usize) -> Vec<u8> {
            self.gets.fetch_add(1, Relaxed);
            self.inner.get(size)
        }

        fn put(&self, buf: Vec<u8>) {
            self.puts.fetch_add(1, Relaxed);
            self.inner.put(buf)
        }
    }

    /// A message with no fast path.
    #[derive(Clone, PartialEq, ::prost::Message)]
    struct SeriesQuery {
        #[prost(string, repeated, tag = "1")]
        matchers: Vec<String>,

        #[prost(int64, tag = "2")]
        start_ms: i64,

        #[prost(int64, tag = "3")]
        end_ms: i64,
    }

    impl WireMessage for SeriesQuery {}

    /// A message whose fast path always fails.
    #[derive(Clone, PartialEq, ::prost::Message)]
    struct Unencodable {
        #[prost(bytes = "vec", tag = "1")]
        payload: Vec<u8>,
    }

    impl OptimizedCodable for Unencodable {
        fn encoded_size(&self) -> usize {
            self.payload.len()
        }

        fn encode_to_sized_buffer(&self, _buf: &mut [u8]) -> Result<usize, WireError> {
            Err(WireError::InvalidTag)
        }

        fn decode_from_slice(&mut self, _data: &[u8]) -> Result<(), WireError> {
            Err(WireError::InvalidTag)
        }
    }

    impl WireMessage for Unencodable {
        fn as_optimized(&self) -> Option<&dyn OptimizedCodable> {
            Some(self)
        }

        fn as_optimized_mut(&mut self) -> Option<&mut dyn OptimizedCodable> {
            Some(self)
        }
    }

    fn codec_with_pool() -> (PooledCodec, Arc<CountingPool>) {
        let pool = Arc::new(CountingPool::new());
        let codec = PooledCodec::wrap(Arc::new(ProtobufCodec), pool.clone());
        (codec, pool)
    }

    fn cpu_series(samples: &[(f64, i64)]) -> TimeSeries {
        TimeSeries {
            labels: vec![LabelPair::new("__name__", "cpu")],
            samples: samples.iter().map(|&(v, ts)| Sample::new(v, ts)).collect(),
            exemplars: vec![],
        }
    }

    /// Builds a request whose encoded size is exactly `target` bytes by padding a label value.
    fn request_of_size(target: usize) -> WriteRequest {
        let mut request = WriteRequest {
            timeseries: vec![cpu_series(&[(1.0, 1000)])],
            ..Default::default()
        };
        request.timeseries[0].labels.push(LabelPair::new("pad", ""));

        for padding in 0..target {
            request.timeseries[0].labels[1].value = vec![b'x'; padding];
            if request.encoded_size() == target {
                return request;
            }
        }
        panic!("no padding yields an encoded size of {}", target);
    }

    fn roundtrip(codec: &PooledCodec, request: &WriteRequest) -> (BufferSlice, WriteRequest) {
        let encoded = codec.marshal(request).unwrap();
        let mut decoded = WriteRequest::default();
        codec.unmarshal(&encoded, &mut decoded).unwrap();
        (encoded, decoded)
    }

    #[test]
    fn concrete_cpu_request_roundtrips() {
        let (codec, _pool) = codec_with_pool();
        let request = WriteRequest {
            timeseries: vec![cpu_series(&[(1.0, 1000), (2.0, 2000)])],
            ..Default::default()
        };

        let (encoded, decoded) = roundtrip(&codec, &request);
        assert_eq!(decoded, request);
        assert_eq!(encoded.materialize(), ProtobufCodec.marshal(&request).unwrap().materialize());
    }

    #[test]
    fn pooling_threshold_boundary() {
        let (codec, pool) = codec_with_pool();

        for (size, pooled) in [
            (BUFFER_POOLING_THRESHOLD - 1, false),
            (BUFFER_POOLING_THRESHOLD, true),
            (BUFFER_POOLING_THRESHOLD + 1, true),
        ] {
            let request = request_of_size(size);
            let (encoded, decoded) = roundtrip(&codec, &request);

            assert_eq!(encoded.len(), size);
            assert_eq!(encoded.buffers().len(), 1);
            assert_eq!(encoded.buffers()[0].is_pooled(), pooled, "size {}", size);
            assert_eq!(decoded, request);

            drop(encoded);
            assert_eq!(pool.outstanding(), 0);
        }
    }

    #[test]
    fn fragmented_input_is_materialized_and_released() {
        let (codec, pool) = codec_with_pool();
        let request = request_of_size(4000);
        let bytes = ProtobufCodec.marshal(&request).unwrap().materialize();

        let mut fragmented = BufferSlice::new();
        for chunk in bytes.chunks(1000) {
            fragmented.push(Buffer::from(chunk.to_vec()));
        }

        let mut decoded = WriteRequest::default();
        codec.unmarshal(&fragmented, &mut decoded).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(pool.gets.load(Relaxed), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn generic_messages_match_baseline() {
        let (codec, pool) = codec_with_pool();
        let query = SeriesQuery {
            matchers: vec![r#"{__name__="cpu"}"#.to_string(); 200],
            start_ms: 1000,
            end_ms: 2000,
        };

        let pooled = codec.marshal(&query).unwrap();
        let baseline = ProtobufCodec.marshal(&query).unwrap();
        assert_eq!(pooled.materialize(), baseline.materialize());
        assert_eq!(pool.gets.load(Relaxed), 0);

        let mut decoded = SeriesQuery::default();
        codec.unmarshal(&pooled, &mut decoded).unwrap();
        assert_eq!(decoded, query);

        let mut response = WriteResponse::default();
        assert!(codec.marshal(&response).unwrap().is_empty());
        codec.unmarshal(&BufferSlice::new(), &mut response).unwrap();
    }

    #[test]
    fn unsorted_samples_decode() {
        let (codec, _pool) = codec_with_pool();
        let request = WriteRequest {
            timeseries: vec![cpu_series(&[(3.0, 3000), (1.0, 1000), (2.0, 2000)])],
            ..Default::default()
        };

        let (_, decoded) = roundtrip(&codec, &request);
        assert_eq!(decoded.timeseries[0].samples[0].timestamp_ms, 3000);
        assert_eq!(decoded, request);
    }

    #[test]
    fn failed_encode_releases_pooled_buffer() {
        let (codec, pool) = codec_with_pool();
        let message = Unencodable {
            payload: vec![0; 8192],
        };

        let err = codec.marshal(&message).unwrap_err();
        assert!(matches!(err, MarshalError::FastEncode { .. }));
        assert_eq!(pool.gets.load(Relaxed), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn failed_decode_releases_pooled_buffer() {
        let (codec, pool) = codec_with_pool();
        let mut fragmented = BufferSlice::new();
        fragmented.push(vec![0u8; 2048]);
        fragmented.push(vec![0u8; 2048]);

        let mut message = Unencodable::default();
        let err = codec.unmarshal(&fragmented, &mut message).unwrap_err();
        assert!(matches!(err, UnmarshalError::FastDecode { .. }));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn truncated_request_fails_to_decode() {
        let (codec, _pool) = codec_with_pool();
        let mut bytes = ProtobufCodec.marshal(&request_of_size(2000)).unwrap().materialize();
        bytes.truncate(1500);

        let mut decoded = WriteRequest::default();
        let err = codec.unmarshal(&BufferSlice::from(bytes), &mut decoded).unwrap_err();
        assert!(matches!(err, UnmarshalError::FastDecode { .. }));
    }

    #[test]
    fn deeply_nested_groups_fail_to_decode() {
        let (codec, pool) = codec_with_pool();
        let depth = RECURSION_LIMIT as usize + 1;
        let mut bytes = vec![0x4B; depth];
        bytes.resize(depth * 2, 0x4C);

        let mut decoded = WriteRequest::default();
        let err = codec.unmarshal(&BufferSlice::from(bytes), &mut decoded).unwrap_err();
        assert!(matches!(err, UnmarshalError::FastDecode { .. }));
        assert_eq!(pool.outstanding(), 0);
    }

    fn arb_label() -> impl Strategy<Value = LabelPair> {
        ("[a-z_]{1,12}", proptest::collection::vec(any::<u8>(), 0..24))
            .prop_map(|(name, value)| LabelPair::new(name, value))
    }

    fn arb_series() -> impl Strategy<Value = TimeSeries> {
        (
            proptest::collection::vec(arb_label(), 0..4),
            proptest::collection::vec((-1.0e9f64..1.0e9, any::<i64>()), 0..16),
            proptest::collection::vec((arb_label(), any::<i64>()), 0..2),
        )
            .prop_map(|(labels, samples, exemplars)| TimeSeries {
                labels,
                samples: samples.into_iter().map(|(value, ts)| Sample::new(value, ts)).collect(),
                exemplars: exemplars
                    .into_iter()
                    .map(|(label, timestamp_ms)| Exemplar {
                        labels: vec![label],
                        value: 1.0,
                        timestamp_ms,
                    })
                    .collect(),
            })
    }

    /// Requests whose encoded size lands on either side of the pooling threshold.
    fn arb_request() -> impl Strategy<Value = WriteRequest> {
        (
            proptest::collection::vec(arb_series(), 0..4),
            proptest::collection::vec("[a-z_]{0,16}", 0..2),
            0usize..2 * BUFFER_POOLING_THRESHOLD,
            any::<bool>(),
        )
            .prop_map(|(mut timeseries, families, padding, skip_label_name_validation)| {
                timeseries.push(TimeSeries {
                    labels: vec![LabelPair::new("pad", vec![b'x'; padding])],
                    samples: vec![Sample::new(0.0, 0)],
                    exemplars: vec![],
                });
                WriteRequest {
                    timeseries,
                    source: 0,
                    metadata: families
                        .into_iter()
                        .map(|metric_family_name| MetricMetadata {
                            metric_family_name,
                            ..Default::default()
                        })
                        .collect(),
                    skip_label_name_validation,
                }
            })
    }

    proptest! {
        #[test]
        fn arbitrary_requests_roundtrip(request in arb_request()) {
            let (codec, pool) = codec_with_pool();
            let (encoded, decoded) = roundtrip(&codec, &request);

            prop_assert_eq!(&decoded, &request);
            prop_assert_eq!(encoded.len(), request.encoded_size());
            prop_assert_eq!(encoded.materialize(), ProtobufCodec.marshal(&request).unwrap().materialize());

            let pooled = encoded.buffers().iter().any(|buffer| buffer.is_pooled());
            prop_assert_eq!(pooled, request.encoded_size() >= BUFFER_POOLING_THRESHOLD);

            drop(encoded);
            prop_assert_eq!(pool.outstanding(), 0);
        }
    }
}
