//! Event pipeline: transform -> validate -> deliver
//!
//! Consumes qualifying feed events from a bounded channel and handles each on
//! its own task, so a slow delivery (retries, backoff) never holds up the
//! next event or the feed connection. At most `max_in_flight` events are
//! processed at once; beyond that the channel fills and the feed drops new
//! events. Outcomes are logged and counted; none flow back to the feed.

use crate::domain::calibration::CalibrationTable;
use crate::domain::types::RawEvent;
use crate::infra::metrics::Metrics;
use crate::io::delivery::{DeliveryClient, HttpIngestTransport, IngestTransport};
use crate::services::transform::{coordinate_gap, transform, validate};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Delivered,
    TransformFailed,
    ValidationFailed,
    DeliveryFailed,
}

pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;

fn log_join_error(joined: Result<ProcessOutcome, JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "pipeline_task_failed");
    }
}

pub struct EventPipeline<T = HttpIngestTransport> {
    table: Arc<CalibrationTable>,
    delivery: Arc<DeliveryClient<T>>,
    metrics: Arc<Metrics>,
    max_in_flight: usize,
}

impl<T> Clone for EventPipeline<T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            delivery: self.delivery.clone(),
            metrics: self.metrics.clone(),
            max_in_flight: self.max_in_flight,
        }
    }
}

impl<T: IngestTransport + 'static> EventPipeline<T> {
    pub fn new(
        table: Arc<CalibrationTable>,
        delivery: Arc<DeliveryClient<T>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { table, delivery, metrics, max_in_flight: DEFAULT_MAX_IN_FLIGHT }
    }

    /// Cap concurrent deliveries (minimum 1)
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Handle one event end to end
    pub async fn process(&self, event: &RawEvent) -> ProcessOutcome {
        // transform() logs its own rejection reason
        let Ok(record) = transform(&self.table, event) else {
            self.metrics.record_transform_failed();
            return ProcessOutcome::TransformFailed;
        };

        if !validate(&record) {
            self.metrics.record_validation_failed();
            let reason = coordinate_gap(&self.table, event).map(|gap| gap.as_str()).unwrap_or("invalid_record");
            warn!(device_id = %record.identifier, reason = reason, "pipeline_record_rejected");
            return ProcessOutcome::ValidationFailed;
        }

        let started = Instant::now();
        let result = self.delivery.send(&record).await;
        self.metrics.record_delivery_retries(result.retry_count);

        if result.success {
            self.metrics.record_delivered(started.elapsed().as_millis() as u64);
            debug!(
                device_id = %record.identifier,
                retry_count = result.retry_count,
                "pipeline_event_delivered"
            );
            ProcessOutcome::Delivered
        } else {
            self.metrics.record_delivery_failed();
            error!(
                device_id = %record.identifier,
                status = ?result.status,
                error = %result.error.as_deref().unwrap_or(""),
                retry_count = result.retry_count,
                "pipeline_delivery_failed"
            );
            ProcessOutcome::DeliveryFailed
        }
    }

    /// Consume events until every sender is dropped, then wait for in-flight
    /// deliveries to finish. An event is only taken off the channel once a
    /// delivery slot is free.
    pub async fn run(&self, mut event_rx: mpsc::Receiver<RawEvent>) {
        let slots = Arc::new(Semaphore::new(self.max_in_flight));
        let mut in_flight = JoinSet::new();
        info!(max_in_flight = self.max_in_flight, "pipeline_started");

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_join_error(joined);
            }

            let Ok(permit) = slots.clone().acquire_owned().await else { break };
            let Some(event) = event_rx.recv().await else { break };

            let pipeline = self.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                pipeline.process(&event).await
            });
        }

        let pending = in_flight.len();
        if pending > 0 {
            info!(pending = pending, "pipeline_draining");
        }
        while let Some(joined) = in_flight.join_next().await {
            log_join_error(joined);
        }
        info!("pipeline_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{LocationCoordinate, TransformedRecord};
    use crate::io::delivery::tests::ScriptedTransport;
    use crate::io::delivery::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FLOOR: &str = "USA>Texas>Austin>Building1>Floor2";

    fn event(device: &str, floor: &str) -> RawEvent {
        RawEvent {
            event_type: Some("BLE_DEVICES".to_string()),
            device_id: Some(device.to_string()),
            last_seen: Some("2026-01-05T16:41:30.948Z".to_string()),
            rssi: Some(-60),
            location_hierarchy: Some(floor.to_string()),
            location_coordinate: Some(LocationCoordinate { x: Some(100.0), y: Some(200.0), unit: None }),
        }
    }

    fn pipeline(script: Vec<Result<u16, String>>) -> (EventPipeline<Arc<ScriptedTransport>>, Arc<ScriptedTransport>, Arc<Metrics>) {
        let table = Arc::new(CalibrationTable::new());
        table.add(FLOOR, 30.2672, -97.7431, None).unwrap();
        let transport = Arc::new(ScriptedTransport::new(script));
        let delivery = Arc::new(DeliveryClient::new(
            transport.clone(),
            "http://sink/ingest",
            true,
            RetryPolicy::default(),
        ));
        let metrics = Arc::new(Metrics::new());
        (EventPipeline::new(table, delivery, metrics.clone()), transport, metrics)
    }

    #[tokio::test]
    async fn test_valid_event_delivered_once() {
        let (pipeline, transport, metrics) = pipeline(vec![Ok(200)]);
        let outcome = pipeline.process(&event("dev-1", FLOOR)).await;

        assert_eq!(outcome, ProcessOutcome::Delivered);
        assert_eq!(transport.call_count(), 1);
        assert_eq!(metrics.delivered(), 1);
    }

    #[tokio::test]
    async fn test_unmapped_floor_never_sent() {
        let (pipeline, transport, metrics) = pipeline(vec![Ok(200)]);
        let outcome = pipeline.process(&event("dev-1", "USA>Nowhere>Floor9")).await;

        assert_eq!(outcome, ProcessOutcome::ValidationFailed);
        assert_eq!(transport.call_count(), 0);
        assert_eq!(metrics.validation_failed(), 1);
    }

    #[tokio::test]
    async fn test_invalid_event_never_sent() {
        let (pipeline, transport, metrics) = pipeline(vec![Ok(200)]);
        let mut bad = event("dev-1", FLOOR);
        bad.last_seen = None;

        assert_eq!(pipeline.process(&bad).await, ProcessOutcome::TransformFailed);
        assert_eq!(transport.call_count(), 0);
        assert_eq!(metrics.transform_failed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failure_counted() {
        let (pipeline, transport, metrics) = pipeline(vec![Ok(503)]);
        let outcome = pipeline.process(&event("dev-1", FLOOR)).await;

        assert_eq!(outcome, ProcessOutcome::DeliveryFailed);
        assert_eq!(transport.call_count(), 4);
        assert_eq!(metrics.delivery_failed(), 1);
        assert_eq!(metrics.delivery_retries(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_in_flight_on_close() {
        let (pipeline, transport, metrics) = pipeline(vec![Ok(503), Ok(200)]);
        let (tx, rx) = mpsc::channel(8);

        tx.send(event("dev-1", FLOOR)).await.unwrap();
        tx.send(event("dev-2", FLOOR)).await.unwrap();
        tx.send(event("dev-3", "USA>Nowhere>Floor9")).await.unwrap();
        drop(tx);

        pipeline.run(rx).await;

        // One event hit the 503 and was retried; all valid ones end delivered
        assert_eq!(metrics.delivered(), 2);
        assert_eq!(metrics.validation_failed(), 1);
        assert_eq!(transport.call_count(), 3);
    }

    /// Sink that accepts the request and never answers
    #[derive(Default)]
    struct StalledSink {
        posts: AtomicUsize,
    }

    #[async_trait]
    impl IngestTransport for StalledSink {
        async fn post(&self, _record: &TransformedRecord) -> Result<u16, String> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stalled_sink_bounds_in_flight_and_drops() {
        let table = Arc::new(CalibrationTable::new());
        table.add(FLOOR, 30.2672, -97.7431, None).unwrap();
        let sink = Arc::new(StalledSink::default());
        let delivery = Arc::new(DeliveryClient::new(sink.clone(), "http://sink/ingest", true, RetryPolicy::default()));
        let pipeline = EventPipeline::new(table, delivery, Arc::new(Metrics::new())).with_max_in_flight(4);

        let (tx, rx) = mpsc::channel(2);
        let worker = tokio::spawn(async move { pipeline.run(rx).await });

        let mut dropped = 0;
        for i in 0..200 {
            if tx.try_send(event(&format!("dev-{i}"), FLOOR)).is_err() {
                dropped += 1;
            }
            tokio::task::yield_now().await;
        }

        // 4 delivery slots plus 2 queued; everything else is refused
        assert_eq!(sink.posts.load(Ordering::SeqCst), 4);
        assert_eq!(dropped, 200 - 6);
        worker.abort();
    }
}
