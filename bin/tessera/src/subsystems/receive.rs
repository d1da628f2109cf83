//! Remote-write receiver.
//!
//! Accepts TCP connections carrying length-prefixed frames: a big-endian `u32` byte count followed by an encoded
//! `WriteRequest`. Every request is decoded through the registered `"proto"` codec and acknowledged with a
//! length-prefixed `WriteResponse`. A malformed frame closes its connection without affecting others.

use std::{
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytesize::ByteSize;
use clap::Args;
use snafu::ResultExt as _;
use tessera_config::{ConfigurationLoader, GenericConfiguration};
use tessera_core::runtime::{ActorError, InterruptSignal, ReloadReceiver, Tracer};
use tessera_error::{generic_error, ErrorContext as _, GenericError};
use tessera_io::{
    buf::BufferSlice,
    codec::{Codec, PROTOBUF_CODEC_NAME},
};
use tessera_protos::{WriteRequest, WriteResponse};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
};
use tracing::{debug, debug_span, error, info, warn, Instrument as _};

use crate::subsystem::{Bind, Configuration, SetupError, Subsystem, SubsystemContext};

const DEFAULT_MAX_FRAME_SIZE: ByteSize = ByteSize::mib(16);

/// Largest share of the memory limit a single frame may take, as a divisor.
const FRAME_MEMORY_SHARE: u64 = 4;

/// Runs a minimal remote-write receiver.
#[derive(Args, Debug)]
pub struct ReceiveCommand {
    /// Address to accept remote-write connections on.
    #[arg(long = "listen-address", default_value = "127.0.0.1:19291")]
    pub listen_address: SocketAddr,
}

#[async_trait]
impl Subsystem for ReceiveCommand {
    fn name(&self) -> &'static str {
        "receive"
    }

    async fn setup(self, context: &mut SubsystemContext) -> Result<(), SetupError> {
        let max_frame_size = context
            .configuration()
            .try_get_typed::<ByteSize>("receive.max_frame_size")
            .context(Configuration { subsystem: "receive" })?
            .unwrap_or(DEFAULT_MAX_FRAME_SIZE);
        let max_frame_size = bound_frame_size(max_frame_size, context.memory_limit());

        let codec = context.codec(PROTOBUF_CODEC_NAME)?;
        let receiver = Receiver::bind(self.listen_address, codec, context.tracer().clone(), max_frame_size).await?;
        info!(
            listen_addr = %receiver.local_addr,
            max_frame_size = %max_frame_size,
            memory_limit = ?context.memory_limit().map(|limit| limit.to_string()),
            "Receiver listening."
        );

        let span = context.span().clone();
        context
            .group_mut()
            .add_with_interrupt("receive-server", move |interrupt| {
                run_server(receiver, interrupt).instrument(span)
            });

        if let Some(reload_rx) = context.take_reload_receiver() {
            let config_path = context.config_path().map(Path::to_path_buf);
            let span = context.span().clone();
            context
                .group_mut()
                .add_with_interrupt("receive-reloader", move |interrupt| {
                    run_reloader(reload_rx, config_path, interrupt).instrument(span)
                });
        }

        Ok(())
    }
}

/// Caps `max_frame_size` at a fixed share of the memory limit, if there is one.
fn bound_frame_size(max_frame_size: ByteSize, memory_limit: Option<ByteSize>) -> ByteSize {
    let Some(limit) = memory_limit else {
        return max_frame_size;
    };

    let bound = ByteSize::b(limit.as_u64() / FRAME_MEMORY_SHARE);
    if max_frame_size > bound {
        warn!(
            configured = %max_frame_size,
            memory_limit = %limit,
            max_frame_size = %bound,
            "Maximum frame size exceeds its share of the memory limit. Lowering it."
        );
        bound
    } else {
        max_frame_size
    }
}

struct Receiver {
    listener: TcpListener,
    local_addr: SocketAddr,
    codec: Arc<dyn Codec>,
    tracer: Tracer,
    max_frame_size: usize,
}

impl Receiver {
    async fn bind(
        address: SocketAddr, codec: Arc<dyn Codec>, tracer: Tracer, max_frame_size: ByteSize,
    ) -> Result<Self, SetupError> {
        let listener = TcpListener::bind(address).await.context(Bind { address })?;
        let local_addr = listener.local_addr().context(Bind { address })?;
        Ok(Self {
            listener,
            local_addr,
            codec,
            tracer,
            max_frame_size: usize::try_from(max_frame_size.as_u64()).unwrap_or(usize::MAX),
        })
    }
}

async fn run_server(receiver: Receiver, mut interrupt: InterruptSignal) -> Result<(), ActorError> {
    let Receiver {
        listener,
        local_addr,
        codec,
        tracer,
        max_frame_size,
    } = receiver;
    let mut connections = JoinSet::new();

    loop {
        select! {
            result = listener.accept() => {
                let (stream, peer_addr) = result.error_context("Failed to accept connection.")?;
                let codec = Arc::clone(&codec);
                let tracer = tracer.clone();
                let span = debug_span!("connection", %peer_addr);

                connections.spawn(
                    async move {
                        match handle_connection(stream, codec, tracer, max_frame_size).await {
                            Ok(()) => debug!("Connection closed."),
                            Err(e) => error!(error = %e, "Connection failed."),
                        }
                    }
                    .instrument(span),
                );
            },

            Some(_) = connections.join_next(), if !connections.is_empty() => {},

            _ = interrupt.wait() => {
                debug!(listen_addr = %local_addr, "Received interrupt.");
                break;
            }
        }
    }

    connections.shutdown().await;
    info!(listen_addr = %local_addr, "Receiver stopped.");
    Err(ActorError::Canceled)
}

async fn handle_connection(
    mut stream: TcpStream, codec: Arc<dyn Codec>, tracer: Tracer, max_frame_size: usize,
) -> Result<(), GenericError> {
    loop {
        let frame_len = match stream.read_u32().await {
            Ok(frame_len) => frame_len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e).error_context("Failed to read frame header."),
        };
        if frame_len > max_frame_size {
            return Err(generic_error!(
                "Frame of {} bytes exceeds the maximum of {} bytes.",
                frame_len,
                max_frame_size
            ));
        }

        let mut frame = vec![0; frame_len];
        stream
            .read_exact(&mut frame)
            .await
            .error_context("Failed to read frame.")?;

        let request = tracer
            .start_span("write")
            .in_scope(|| decode_write_request(codec.as_ref(), frame))?;
        debug!(
            series = request.timeseries.len(),
            samples = request.sample_count(),
            exemplars = request.exemplar_count(),
            metadata = request.metadata.len(),
            "Accepted write request."
        );

        let response = codec
            .marshal(&WriteResponse::default())
            .error_context("Failed to encode write response.")?;
        write_frame(&mut stream, &response).await?;
    }
}

fn decode_write_request(codec: &dyn Codec, frame: Vec<u8>) -> Result<WriteRequest, GenericError> {
    let mut request = WriteRequest::default();
    codec
        .unmarshal(&BufferSlice::from(frame), &mut request)
        .error_context("Failed to decode write request.")?;
    Ok(request)
}

async fn write_frame(stream: &mut TcpStream, frame: &BufferSlice) -> Result<(), GenericError> {
    let frame_len = u32::try_from(frame.len()).error_context("Frame too large to send.")?;
    stream.write_u32(frame_len).await.error_context("Failed to write frame header.")?;
    for fragment in frame.fragments() {
        stream.write_all(fragment).await.error_context("Failed to write frame.")?;
    }
    stream.flush().await.error_context("Failed to flush frame.")
}

async fn run_reloader(
    mut reload_rx: ReloadReceiver, config_path: Option<PathBuf>, mut interrupt: InterruptSignal,
) -> Result<(), ActorError> {
    loop {
        select! {
            notified = reload_rx.recv() => {
                if !notified {
                    debug!("Reload queue closed.");
                    interrupt.wait().await;
                    return Err(ActorError::Canceled);
                }

                match reload_configuration(config_path.as_deref()) {
                    Ok(Some(_)) => info!("Reloaded configuration."),
                    Ok(None) => info!("Reload requested, but no configuration file was given. Nothing to reload."),
                    Err(e) => error!(error = %e, "Failed to reload configuration."),
                }
            },
            _ = interrupt.wait() => return Err(ActorError::Canceled),
        }
    }
}

fn reload_configuration(config_path: Option<&Path>) -> Result<Option<GenericConfiguration>, GenericError> {
    let Some(path) = config_path else {
        return Ok(None);
    };

    let configuration = ConfigurationLoader::default()
        .from_yaml(path)
        .with_error_context(|| format!("Failed to read configuration file '{}'.", path.display()))?
        .into_generic();
    Ok(Some(configuration))
}

#[cfg(test)]
mod tests {
    use std::{io::Write as _, time::Duration};

    use tessera_core::runtime::{reload_queue, ActorGroup};
    use tessera_io::codec::CodecRegistry;
    use tessera_protos::{LabelPair, Sample, TimeSeries};
    use tokio::time::timeout;

    use super::*;
    use crate::build_codec_registry;

    fn proto_codec() -> Arc<dyn Codec> {
        let registry: CodecRegistry = build_codec_registry(None).unwrap();
        registry.get(PROTOBUF_CODEC_NAME).unwrap()
    }

    fn cpu_request(samples: usize) -> WriteRequest {
        WriteRequest {
            timeseries: vec![TimeSeries {
                labels: vec![LabelPair::new("__name__", "cpu")],
                samples: (0..samples).map(|i| Sample::new(i as f64, 1000 * i as i64)).collect(),
                exemplars: Vec::new(),
            }],
            ..Default::default()
        }
    }

    async fn bind_local(codec: Arc<dyn Codec>, max_frame_size: ByteSize) -> Receiver {
        let address = "127.0.0.1:0".parse().unwrap();
        Receiver::bind(address, codec, Tracer::noop(), max_frame_size).await.unwrap()
    }

    async fn send_requests(
        address: SocketAddr, codec: Arc<dyn Codec>, requests: Vec<WriteRequest>,
    ) -> Result<(), ActorError> {
        let mut stream = TcpStream::connect(address).await.error_context("Failed to connect.")?;
        for request in requests {
            let frame = codec.marshal(&request).error_context("Failed to encode request.")?;
            write_frame(&mut stream, &frame).await?;

            let response_len = stream.read_u32().await.error_context("Failed to read response.")?;
            if response_len != 0 {
                return Err(generic_error!("Unexpected response of {} bytes.", response_len).into());
            }
        }
        Ok(())
    }

    #[tokio::test]
    async fn acknowledges_small_and_pooled_requests() {
        let codec = proto_codec();
        let receiver = bind_local(Arc::clone(&codec), DEFAULT_MAX_FRAME_SIZE).await;
        let address = receiver.local_addr;

        let mut group = ActorGroup::new();
        group.add_with_interrupt("receive-server", move |interrupt| run_server(receiver, interrupt));
        group.add_actor(
            "client",
            send_requests(address, codec, vec![cpu_request(2), cpu_request(500)]),
            || {},
        );

        timeout(Duration::from_secs(10), group.run()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn oversized_frame_closes_connection() {
        let codec = proto_codec();
        let receiver = bind_local(Arc::clone(&codec), ByteSize::b(64)).await;
        let address = receiver.local_addr;
        let (interrupt, handle) = InterruptSignal::paired();
        let server = tokio::spawn(run_server(receiver, interrupt));

        let result = timeout(Duration::from_secs(10), send_requests(address, codec, vec![cpu_request(100)]))
            .await
            .unwrap();
        assert!(matches!(result, Err(ActorError::Failed { .. })));

        handle.trigger();
        let server_result = timeout(Duration::from_secs(10), server).await.unwrap().unwrap();
        assert!(matches!(server_result, Err(ActorError::Canceled)));
    }

    #[test]
    fn memory_limit_bounds_frame_size() {
        assert_eq!(bound_frame_size(DEFAULT_MAX_FRAME_SIZE, None), DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(
            bound_frame_size(DEFAULT_MAX_FRAME_SIZE, Some(ByteSize::gib(1))),
            DEFAULT_MAX_FRAME_SIZE
        );
        assert_eq!(
            bound_frame_size(DEFAULT_MAX_FRAME_SIZE, Some(ByteSize::mib(16))),
            ByteSize::mib(4)
        );
    }

    #[test]
    fn decode_rejects_truncated_frames() {
        let codec = proto_codec();
        let frame = codec.marshal(&cpu_request(3)).unwrap().materialize();
        let truncated = frame[..frame.len() - 1].to_vec();

        assert_eq!(decode_write_request(codec.as_ref(), frame).unwrap(), cpu_request(3));
        assert!(decode_write_request(codec.as_ref(), truncated).is_err());
    }

    #[test]
    fn reload_reads_configuration_file() {
        assert!(reload_configuration(None).unwrap().is_none());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"receive:\n  max_frame_size: 1MiB\n").unwrap();
        let configuration = reload_configuration(Some(file.path())).unwrap().unwrap();
        assert_eq!(
            configuration.get_typed::<ByteSize>("receive.max_frame_size").unwrap(),
            ByteSize::mib(1)
        );

        let mut invalid = tempfile::NamedTempFile::new().unwrap();
        invalid.write_all(b"receive: [unbalanced\n").unwrap();
        assert!(reload_configuration(Some(invalid.path())).is_err());
    }

    #[tokio::test]
    async fn reloader_handles_notifications_until_interrupted() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let (reload_tx, reload_rx) = reload_queue();
        let (interrupt, handle) = InterruptSignal::paired();
        let reloader = tokio::spawn(run_reloader(reload_rx, Some(file.path().to_path_buf()), interrupt));

        assert!(reload_tx.notify());
        tokio::task::yield_now().await;
        handle.trigger();

        let result = timeout(Duration::from_secs(5), reloader).await.unwrap().unwrap();
        assert!(matches!(result, Err(ActorError::Canceled)));
    }
}
