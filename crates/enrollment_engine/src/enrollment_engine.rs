use crate::domain::{
    trigger_channel, DeviceConnector, DeviceExchangeClient, EngineConfig, EnrollmentService,
    IdAllocator, ProcessorTrigger, QueueProcessor, QueueStore, ResultSink, TriggerSource,
};
use enroll_common::storage::KeyValueStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct EnrollmentEngineConfig {
    pub engine: EngineConfig,
    /// Device used when a request names no targets
    pub default_device_id: String,
    pub default_channel_endpoint: String,
}

/// Engine components wired over one key-value store
pub struct EnrollmentEngine {
    service: Arc<EnrollmentService>,
    queue: Arc<QueueStore>,
    sink: Arc<ResultSink>,
    processor: Arc<QueueProcessor>,
    trigger: ProcessorTrigger,
    trigger_receiver: mpsc::Receiver<TriggerSource>,
    config: EngineConfig,
}

impl EnrollmentEngine {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        connector: Arc<dyn DeviceConnector>,
        sink: Arc<ResultSink>,
        config: EnrollmentEngineConfig,
    ) -> Self {
        debug!("initializing enrollment engine module");

        let queue = Arc::new(QueueStore::new(store));
        let allocator = Arc::new(IdAllocator::new(Arc::clone(&queue)));
        let client = Arc::new(DeviceExchangeClient::new(connector, config.engine.clone()));

        let service = Arc::new(EnrollmentService::new(
            allocator,
            Arc::clone(&queue),
            Arc::clone(&client),
            Arc::clone(&sink),
            &config.default_device_id,
            &config.default_channel_endpoint,
        ));
        let processor = Arc::new(QueueProcessor::new(
            Arc::clone(&queue),
            client,
            Arc::clone(&sink),
        ));
        let (trigger, trigger_receiver) = trigger_channel();

        Self {
            service,
            queue,
            sink,
            processor,
            trigger,
            trigger_receiver,
            config: config.engine,
        }
    }

    pub fn service(&self) -> Arc<EnrollmentService> {
        Arc::clone(&self.service)
    }

    pub fn queue(&self) -> Arc<QueueStore> {
        Arc::clone(&self.queue)
    }

    pub fn sink(&self) -> Arc<ResultSink> {
        Arc::clone(&self.sink)
    }

    /// Handle for trigger sources; clone freely
    pub fn trigger(&self) -> ProcessorTrigger {
        self.trigger.clone()
    }

    #[allow(clippy::type_complexity)]
    pub fn into_runner_process(
        self,
    ) -> Box<
        dyn FnOnce(
                CancellationToken,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>,
            > + Send,
    > {
        Box::new({
            let processor = self.processor;
            let receiver = self.trigger_receiver;
            let interval = self.config.queue_retry_interval();
            move |ctx| Box::pin(async move { processor.run(receiver, interval, ctx).await })
        })
    }
}
