//! Connection registry.
//!
//! Tracks every live client, owns its settings, starts and stops its
//! streaming worker and answers statistics queries. The registry is an
//! ordinary value created by the host and shared behind an `Arc`.
//!
//! Each worker gets its own `streaming` flag, so clearing it can never
//! be undone by a later restart: at most one worker per connection ever
//! sees `true`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::{CaptureLease, CaptureRequest, SharedCapture};
use crate::codec::{CodecFactory, CodecTable};
use crate::config::StreamingConfig;
use crate::connection::{
    BitrateTarget, ConnectionId, PerformanceStats, StreamCapabilities, StreamSettings,
};
use crate::control::{AggregateStats, ConnectionSummary, ControlMessage, ServerEvent, StatsSnapshot};
use crate::error::StreamError;
use crate::frame::Resolution;
use crate::transport::FrameSink;
use crate::worker::{StreamingWorker, WorkerContext, WorkerExit};

// ── RegistryOptions ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub streaming: StreamingConfig,
    /// Settings a new connection starts with.
    pub defaults: StreamSettings,
    pub prefer_hardware: bool,
    pub max_resolution: Resolution,
    pub max_fps: u32,
    /// How long to wait for a stopped worker before aborting it.
    pub stop_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            streaming: StreamingConfig::default(),
            defaults: StreamSettings::default(),
            prefer_hardware: true,
            max_resolution: Resolution::new(1920, 1080),
            max_fps: 60,
            stop_timeout: Duration::from_secs(2),
        }
    }
}

// ── ConnectionRegistry ───────────────────────────────────────────

struct WorkerSlot {
    handle: JoinHandle<WorkerExit>,
    streaming: Arc<AtomicBool>,
}

struct ConnectionEntry {
    sink: Arc<dyn FrameSink>,
    connected_at: Instant,
    settings_tx: watch::Sender<StreamSettings>,
    stats_rx: Option<watch::Receiver<PerformanceStats>>,
    worker: Option<WorkerSlot>,
}

impl ConnectionEntry {
    fn is_streaming(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| w.streaming.load(Ordering::SeqCst))
    }

    fn stats(&self) -> PerformanceStats {
        self.stats_rx
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot::from_parts(
            self.is_streaming(),
            self.connected_at,
            &self.settings_tx.borrow(),
            &self.stats(),
        )
    }

    /// Clear the worker's flag and hand back its join handle.
    fn take_worker(&mut self) -> Option<JoinHandle<WorkerExit>> {
        self.worker.take().map(|slot| {
            slot.streaming.store(false, Ordering::SeqCst);
            slot.handle
        })
    }
}

pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    next_id: AtomicU64,
    capture: Arc<SharedCapture>,
    table: Arc<CodecTable>,
    factory: Arc<dyn CodecFactory>,
    streaming_config: Arc<StreamingConfig>,
    options: RegistryOptions,
}

impl ConnectionRegistry {
    pub fn new(
        capture: Arc<SharedCapture>,
        table: Arc<CodecTable>,
        factory: Arc<dyn CodecFactory>,
        options: RegistryOptions,
    ) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capture,
            table,
            factory,
            streaming_config: Arc::new(options.streaming.clone()),
            options,
        }
    }

    pub fn codec_table(&self) -> &CodecTable {
        &self.table
    }

    /// What clients are told on connect.
    pub fn capabilities(&self) -> StreamCapabilities {
        StreamCapabilities {
            max_resolution: self.options.max_resolution,
            max_fps: self.options.max_fps,
            chunk_support: true,
            binary_support: true,
            codecs: self
                .table
                .families()
                .iter()
                .map(|f| f.name().to_string())
                .collect(),
            hardware_acceleration: self.table.has_hardware(),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Register a client and greet it with a `connected` event.
    pub async fn connect(&self, sink: Arc<dyn FrameSink>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (settings_tx, _) = watch::channel(self.options.defaults.clone());
        let entry = ConnectionEntry {
            sink: Arc::clone(&sink),
            connected_at: Instant::now(),
            settings_tx,
            stats_rx: None,
            worker: None,
        };
        self.connections.lock().await.insert(id, entry);
        info!(connection = %id, "client connected");

        let greeting = ServerEvent::Connected {
            connection_id: id,
            capabilities: self.capabilities(),
        };
        if let Err(e) = sink.send_event(&greeting).await {
            warn!(connection = %id, "greeting failed: {e}");
        }
        id
    }

    /// Forget a client, stopping its worker.
    pub async fn disconnect(&self, id: ConnectionId) -> Result<(), StreamError> {
        let handle = {
            let mut map = self.connections.lock().await;
            let mut entry = map.remove(&id).ok_or(StreamError::UnknownConnection(id.0))?;
            entry.take_worker()
        };
        if let Some(handle) = handle {
            self.join_worker(id, handle).await;
        }
        info!(connection = %id, "client disconnected");
        Ok(())
    }

    /// Stop every worker and drop every connection.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = {
            let mut map = self.connections.lock().await;
            map.drain()
                .filter_map(|(id, mut entry)| entry.take_worker().map(|h| (id, h)))
                .collect()
        };
        for (id, handle) in handles {
            self.join_worker(id, handle).await;
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    // ── Control ──────────────────────────────────────────────────

    /// Apply one control message. Acknowledgements and failures are
    /// reported to the client as events; the error is also returned.
    pub async fn handle(&self, id: ConnectionId, msg: ControlMessage) -> Result<(), StreamError> {
        let result = self.dispatch(id, msg).await;
        if let Err(err) = &result {
            if !matches!(err, StreamError::UnknownConnection(_)) {
                self.notify(id, &ServerEvent::error(err)).await;
            }
        }
        result
    }

    async fn dispatch(&self, id: ConnectionId, msg: ControlMessage) -> Result<(), StreamError> {
        match msg {
            ControlMessage::StartStream {
                camera_index,
                resolution,
                fps,
                quality,
                chunk_size,
                enable_chunking,
            } => {
                let settings = self
                    .start_stream(id, |s| {
                        if let Some(v) = camera_index {
                            s.camera_index = v;
                        }
                        if let Some(v) = resolution {
                            s.resolution = v;
                        }
                        if let Some(v) = fps {
                            s.target_fps = v;
                        }
                        if let Some(v) = quality {
                            s.quality = v;
                        }
                        if let Some(v) = chunk_size {
                            s.chunking.chunk_size = v;
                        }
                        if let Some(v) = enable_chunking {
                            s.chunking.enabled = v;
                        }
                    })
                    .await?;
                self.notify(
                    id,
                    &ServerEvent::StreamStarted {
                        camera_index: settings.camera_index,
                        resolution: settings.resolution,
                        fps: settings.target_fps,
                        quality: settings.quality,
                        chunking: settings.chunking.enabled,
                        chunk_size: settings.chunking.chunk_size,
                        codec: settings.codec,
                    },
                )
                .await;
            }
            ControlMessage::StopStream => {
                self.stop_stream(id).await?;
                self.notify(id, &ServerEvent::StreamStopped { reason: None }).await;
            }
            ControlMessage::UpdateQuality { quality } => {
                self.update(id, |s| s.quality = quality).await?;
                self.notify(id, &ServerEvent::QualityUpdated { quality }).await;
            }
            ControlMessage::UpdateFps { fps } => {
                self.update(id, |s| s.target_fps = fps).await?;
                self.notify(id, &ServerEvent::FpsUpdated { fps }).await;
            }
            ControlMessage::UpdateResolution { width, height } => {
                let resolution = Resolution::new(width, height);
                self.update(id, |s| s.resolution = resolution).await?;
                self.notify(id, &ServerEvent::ResolutionUpdated { resolution }).await;
            }
            ControlMessage::SetEncodingMethod { method } => {
                self.update(id, |s| s.encoding_method = method).await?;
                self.notify(id, &ServerEvent::EncodingMethodUpdated { method }).await;
            }
            ControlMessage::SetMaxBitrate { max_bitrate_kbps } => {
                let target = BitrateTarget::from_kbps(max_bitrate_kbps);
                self.update(id, |s| s.bitrate = target).await?;
                self.notify(
                    id,
                    &ServerEvent::MaxBitrateUpdated {
                        max_bitrate_kbps,
                        enabled: target.enabled,
                    },
                )
                .await;
            }
            ControlMessage::SetCodec { codec } => {
                self.update(id, |s| {
                    s.codec = codec;
                    s.codec_generation += 1;
                })
                .await?;
                self.notify(id, &ServerEvent::CodecUpdated { codec }).await;
            }
            ControlMessage::GetStats => {
                let snapshot = self.stats(id).await?;
                self.notify(id, &ServerEvent::StreamStats(snapshot)).await;
            }
        }
        Ok(())
    }

    /// Start (or restart) streaming for `id` with settings adjusted by
    /// `configure`. Any existing worker is stopped first.
    pub async fn start_stream<F>(&self, id: ConnectionId, configure: F) -> Result<StreamSettings, StreamError>
    where
        F: FnOnce(&mut StreamSettings),
    {
        let (settings, previous) = {
            let mut map = self.connections.lock().await;
            let entry = map.get_mut(&id).ok_or(StreamError::UnknownConnection(id.0))?;

            let mut settings = entry.settings_tx.borrow().clone();
            configure(&mut settings);
            settings.validate()?;
            (settings, entry.take_worker())
        };

        // Opening a camera can take a while; other connections keep
        // being served meanwhile.
        let request = CaptureRequest {
            camera_index: settings.camera_index,
            resolution: settings.resolution,
            fps: settings.target_fps,
        };
        let capture = Arc::clone(&self.capture);
        let lease = tokio::task::spawn_blocking(move || capture.acquire(&request))
            .await
            .map_err(|e| StreamError::CaptureUnavailable(format!("capture start task failed: {e}")))
            .and_then(|lease| {
                lease.map_err(|e| match e {
                    StreamError::CaptureUnavailable(_) => e,
                    other => StreamError::CaptureUnavailable(other.to_string()),
                })
            });

        let installed = match lease {
            Ok(lease) => self.install_worker(id, &settings, lease).await,
            Err(e) => Err(e),
        };
        if let Some(handle) = previous {
            self.join_worker(id, handle).await;
        }
        if let Some(handle) = installed? {
            self.join_worker(id, handle).await;
        }
        info!(
            connection = %id,
            resolution = %settings.resolution,
            fps = settings.target_fps,
            quality = settings.quality,
            "stream started"
        );
        Ok(settings)
    }

    /// Publish `settings` and spawn the worker for `id`. Returns the
    /// handle of a worker a concurrent start installed in the meantime.
    async fn install_worker(
        &self,
        id: ConnectionId,
        settings: &StreamSettings,
        lease: CaptureLease,
    ) -> Result<Option<JoinHandle<WorkerExit>>, StreamError> {
        let mut map = self.connections.lock().await;
        // Gone while the camera was opening: dropping the lease releases it.
        let entry = map.get_mut(&id).ok_or(StreamError::UnknownConnection(id.0))?;
        let displaced = entry.take_worker();

        entry.settings_tx.send_replace(settings.clone());
        let streaming = Arc::new(AtomicBool::new(true));
        let ctx = WorkerContext {
            connection_id: id,
            connected_at: entry.connected_at,
            table: Arc::clone(&self.table),
            factory: Arc::clone(&self.factory),
            sink: Arc::clone(&entry.sink),
            config: Arc::clone(&self.streaming_config),
            prefer_hardware: self.options.prefer_hardware,
        };
        let (worker, stats_rx) =
            StreamingWorker::new(ctx, lease, entry.settings_tx.subscribe(), Arc::clone(&streaming));
        entry.stats_rx = Some(stats_rx);
        entry.worker = Some(WorkerSlot {
            handle: worker.spawn(),
            streaming,
        });
        Ok(displaced)
    }

    /// Stop streaming for `id`. Returns whether a worker was running.
    pub async fn stop_stream(&self, id: ConnectionId) -> Result<bool, StreamError> {
        let handle = {
            let mut map = self.connections.lock().await;
            let entry = map.get_mut(&id).ok_or(StreamError::UnknownConnection(id.0))?;
            entry.take_worker()
        };
        let was_running = handle.is_some();
        if let Some(handle) = handle {
            self.join_worker(id, handle).await;
            info!(connection = %id, "stream stopped");
        }
        Ok(was_running)
    }

    /// Change settings of a connection, streaming or not.
    pub async fn update<F>(&self, id: ConnectionId, change: F) -> Result<StreamSettings, StreamError>
    where
        F: FnOnce(&mut StreamSettings),
    {
        let map = self.connections.lock().await;
        let entry = map.get(&id).ok_or(StreamError::UnknownConnection(id.0))?;
        let mut settings = entry.settings_tx.borrow().clone();
        change(&mut settings);
        settings.validate()?;
        entry.settings_tx.send_replace(settings.clone());
        debug!(connection = %id, "settings updated");
        Ok(settings)
    }

    // ── Queries ──────────────────────────────────────────────────

    pub async fn settings(&self, id: ConnectionId) -> Result<StreamSettings, StreamError> {
        let map = self.connections.lock().await;
        let entry = map.get(&id).ok_or(StreamError::UnknownConnection(id.0))?;
        Ok(entry.settings_tx.borrow().clone())
    }

    pub async fn is_streaming(&self, id: ConnectionId) -> Result<bool, StreamError> {
        let map = self.connections.lock().await;
        let entry = map.get(&id).ok_or(StreamError::UnknownConnection(id.0))?;
        Ok(entry.is_streaming())
    }

    pub async fn stats(&self, id: ConnectionId) -> Result<StatsSnapshot, StreamError> {
        let map = self.connections.lock().await;
        let entry = map.get(&id).ok_or(StreamError::UnknownConnection(id.0))?;
        Ok(entry.snapshot())
    }

    pub async fn aggregate_stats(&self) -> AggregateStats {
        let map = self.connections.lock().await;
        let mut agg = AggregateStats {
            total_connections: map.len(),
            ..Default::default()
        };
        for (id, entry) in map.iter() {
            let snap = entry.snapshot();
            if snap.streaming {
                agg.active_streams += 1;
            }
            agg.total_bytes_sent += snap.total_bytes_sent;
            agg.total_frames_sent += snap.frame_count;
            agg.connections.push(ConnectionSummary {
                connection_id: *id,
                streaming: snap.streaming,
                frame_count: snap.frame_count,
                current_bitrate_mbps: snap.current_bitrate_mbps,
                connection_age_seconds: snap.connection_age_seconds,
            });
        }
        agg.connections.sort_by_key(|c| c.connection_id);
        agg
    }

    // ── Internal ─────────────────────────────────────────────────

    async fn notify(&self, id: ConnectionId, event: &ServerEvent) {
        let sink = {
            let map = self.connections.lock().await;
            match map.get(&id) {
                Some(entry) => Arc::clone(&entry.sink),
                None => return,
            }
        };
        if let Err(e) = sink.send_event(event).await {
            debug!(connection = %id, "event not delivered: {e}");
        }
    }

    async fn join_worker(&self, id: ConnectionId, handle: JoinHandle<WorkerExit>) {
        let abort = handle.abort_handle();
        match tokio::time::timeout(self.options.stop_timeout, handle).await {
            Ok(Ok(exit)) => debug!(connection = %id, ?exit, "worker joined"),
            Ok(Err(e)) => warn!(connection = %id, "worker task failed: {e}"),
            Err(_) => {
                warn!(connection = %id, "worker did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameSource, SyntheticSource};
    use crate::codec::DefaultCodecFactory;
    use crate::encoder::CodecRequest;
    use crate::frame::RawFrame;
    use crate::transport::{ChannelSink, OutboundMessage};
    use tokio::sync::mpsc;

    struct BrokenCamera;

    impl FrameSource for BrokenCamera {
        fn start(&self, request: &CaptureRequest) -> Result<(), StreamError> {
            Err(StreamError::CaptureUnavailable(format!(
                "camera {} busy",
                request.camera_index
            )))
        }
        fn stop(&self) {}
        fn read_frame(&self) -> Option<RawFrame> {
            None
        }
        fn is_active(&self) -> bool {
            false
        }
    }

    fn registry_with(source: Arc<dyn FrameSource>) -> (ConnectionRegistry, Arc<SharedCapture>) {
        let capture = SharedCapture::new(source);
        let options = RegistryOptions {
            defaults: StreamSettings {
                resolution: Resolution::new(64, 48),
                ..StreamSettings::default()
            },
            prefer_hardware: false,
            ..RegistryOptions::default()
        };
        let registry = ConnectionRegistry::new(
            Arc::clone(&capture),
            Arc::new(CodecTable::fallback_only()),
            Arc::new(DefaultCodecFactory::default()),
            options,
        );
        (registry, capture)
    }

    fn registry() -> (ConnectionRegistry, Arc<SharedCapture>) {
        registry_with(Arc::new(SyntheticSource::new()))
    }

    /// Next text event, skipping binary frames.
    async fn next_event(rx: &mut mpsc::Receiver<OutboundMessage>) -> ServerEvent {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("channel closed");
            if let OutboundMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn connect(reg: &ConnectionRegistry) -> (ConnectionId, mpsc::Receiver<OutboundMessage>) {
        let (sink, mut rx) = ChannelSink::channel(256);
        let id = reg.connect(Arc::new(sink)).await;
        match next_event(&mut rx).await {
            ServerEvent::Connected { connection_id, capabilities } => {
                assert_eq!(connection_id, id);
                assert_eq!(capabilities.codecs, vec!["JPEG".to_string()]);
                assert!(!capabilities.hardware_acceleration);
            }
            other => panic!("expected connected, got {other:?}"),
        }
        (id, rx)
    }

    #[tokio::test]
    async fn connect_assigns_distinct_ids() {
        let (reg, _) = registry();
        let (a, _rx_a) = connect(&reg).await;
        let (b, _rx_b) = connect(&reg).await;
        assert_ne!(a, b);
        assert_eq!(reg.connection_count().await, 2);
        reg.disconnect(a).await.unwrap();
        assert_eq!(reg.connection_count().await, 1);
    }

    #[tokio::test]
    async fn settings_update_without_stream() {
        let (reg, _) = registry();
        let (id, mut rx) = connect(&reg).await;

        reg.handle(id, ControlMessage::UpdateQuality { quality: 40 }).await.unwrap();
        assert_eq!(next_event(&mut rx).await, ServerEvent::QualityUpdated { quality: 40 });
        assert_eq!(reg.settings(id).await.unwrap().quality, 40);

        reg.handle(id, ControlMessage::SetMaxBitrate { max_bitrate_kbps: 2000 })
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            ServerEvent::MaxBitrateUpdated {
                max_bitrate_kbps: 2000,
                enabled: true
            }
        );
        let bitrate = reg.settings(id).await.unwrap().bitrate;
        assert!(bitrate.enabled);
        assert_eq!(bitrate.target_kbps, 2000);
    }

    #[tokio::test]
    async fn invalid_update_is_rejected() {
        let (reg, _) = registry();
        let (id, mut rx) = connect(&reg).await;

        let err = reg
            .handle(id, ControlMessage::UpdateQuality { quality: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::InvalidSettings(_)));
        match next_event(&mut rx).await {
            ServerEvent::StreamError { code, .. } => assert_eq!(code, "INVALID_SETTINGS"),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(reg.settings(id).await.unwrap().quality, 85);
    }

    #[tokio::test]
    async fn set_codec_bumps_generation() {
        let (reg, _) = registry();
        let (id, mut rx) = connect(&reg).await;
        let before = reg.settings(id).await.unwrap().codec_generation;
        let codec: CodecRequest = "vp9".parse().unwrap();
        reg.handle(id, ControlMessage::SetCodec { codec }).await.unwrap();
        assert_eq!(next_event(&mut rx).await, ServerEvent::CodecUpdated { codec });
        assert_eq!(reg.settings(id).await.unwrap().codec_generation, before + 1);
    }

    #[tokio::test]
    async fn start_and_stop_stream() {
        let (reg, capture) = registry();
        let (id, mut rx) = connect(&reg).await;

        reg.handle(id, ControlMessage::start_default()).await.unwrap();
        match next_event(&mut rx).await {
            ServerEvent::StreamStarted { resolution, fps, .. } => {
                assert_eq!(resolution, Resolution::new(64, 48));
                assert_eq!(fps, 30);
            }
            other => panic!("expected stream_started, got {other:?}"),
        }
        assert!(reg.is_streaming(id).await.unwrap());
        assert_eq!(capture.leases(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        reg.handle(id, ControlMessage::StopStream).await.unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            ServerEvent::StreamStopped { reason: None }
        );
        assert!(!reg.is_streaming(id).await.unwrap());
        assert_eq!(capture.leases(), 0);
        assert!(!capture.is_active());

        let stats = reg.stats(id).await.unwrap();
        assert!(!stats.streaming);
        assert!(stats.frame_count > 0);
        assert!(stats.total_bytes_sent > 0);
    }

    #[tokio::test]
    async fn restart_keeps_single_worker() {
        let (reg, capture) = registry();
        let (id, _rx) = connect(&reg).await;

        reg.start_stream(id, |_| {}).await.unwrap();
        reg.start_stream(id, |s| s.target_fps = 10).await.unwrap();
        assert_eq!(capture.leases(), 1);
        assert_eq!(reg.settings(id).await.unwrap().target_fps, 10);

        let agg = reg.aggregate_stats().await;
        assert_eq!(agg.total_connections, 1);
        assert_eq!(agg.active_streams, 1);

        reg.disconnect(id).await.unwrap();
        assert_eq!(capture.leases(), 0);
    }

    #[tokio::test]
    async fn camera_failure_reports_start_error() {
        let (reg, capture) = registry_with(Arc::new(BrokenCamera));
        let (id, mut rx) = connect(&reg).await;

        let err = reg.handle(id, ControlMessage::start_default()).await.unwrap_err();
        assert!(matches!(err, StreamError::CaptureUnavailable(_)));
        match next_event(&mut rx).await {
            ServerEvent::StreamError { code, .. } => assert_eq!(code, "CAMERA_START_FAILED"),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(!reg.is_streaming(id).await.unwrap());
        assert_eq!(capture.leases(), 0);
    }

    /// Synthetic camera whose start blocks for `delay`.
    struct SlowCamera {
        inner: SyntheticSource,
        delay: Duration,
    }

    impl FrameSource for SlowCamera {
        fn start(&self, request: &CaptureRequest) -> Result<(), StreamError> {
            std::thread::sleep(self.delay);
            self.inner.start(request)
        }
        fn stop(&self) {
            self.inner.stop()
        }
        fn read_frame(&self) -> Option<RawFrame> {
            self.inner.read_frame()
        }
        fn is_active(&self) -> bool {
            self.inner.is_active()
        }
    }

    fn slow_registry() -> (Arc<ConnectionRegistry>, Arc<SharedCapture>) {
        let (reg, capture) = registry_with(Arc::new(SlowCamera {
            inner: SyntheticSource::new(),
            delay: Duration::from_millis(500),
        }));
        (Arc::new(reg), capture)
    }

    #[tokio::test]
    async fn slow_camera_start_does_not_block_other_connections() {
        let (reg, _capture) = slow_registry();
        let (a, _rx_a) = connect(&reg).await;
        let (b, _rx_b) = connect(&reg).await;

        let starting = tokio::spawn({
            let reg = Arc::clone(&reg);
            async move { reg.start_stream(a, |_| {}).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let began = Instant::now();
        reg.update(b, |s| s.quality = 33).await.unwrap();
        assert_eq!(reg.settings(b).await.unwrap().quality, 33);
        assert!(!reg.is_streaming(a).await.unwrap());
        assert!(began.elapsed() < Duration::from_millis(250));

        starting.await.unwrap().unwrap();
        assert!(reg.is_streaming(a).await.unwrap());
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn disconnect_while_camera_opens_releases_lease() {
        let (reg, capture) = slow_registry();
        let (a, _rx_a) = connect(&reg).await;

        let starting = tokio::spawn({
            let reg = Arc::clone(&reg);
            async move { reg.start_stream(a, |_| {}).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        reg.disconnect(a).await.unwrap();

        let err = starting.await.unwrap().unwrap_err();
        assert!(matches!(err, StreamError::UnknownConnection(_)));
        assert_eq!(capture.leases(), 0);
        assert!(!capture.is_active());
    }

    #[tokio::test]
    async fn unknown_connection_is_reported() {
        let (reg, _) = registry();
        let err = reg.handle(ConnectionId(99), ControlMessage::GetStats).await.unwrap_err();
        assert!(matches!(err, StreamError::UnknownConnection(99)));
        assert!(reg.stats(ConnectionId(99)).await.is_err());
    }

    #[tokio::test]
    async fn get_stats_event() {
        let (reg, _) = registry();
        let (id, mut rx) = connect(&reg).await;
        reg.handle(id, ControlMessage::GetStats).await.unwrap();
        match next_event(&mut rx).await {
            ServerEvent::StreamStats(snap) => {
                assert!(!snap.streaming);
                assert_eq!(snap.frame_count, 0);
                assert_eq!(snap.quality, 85);
            }
            other => panic!("expected stats, got {other:?}"),
        }
    }
}
