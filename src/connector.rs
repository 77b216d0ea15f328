//! コネクタ本体。
//!
//! [ConnectorBuilder]で組み立て、[Connector::start]と[Connector::stop]で起動と停止を行う。
//! 誰がいつ呼び出すかは組み込む側に任せる。
use crate::client::IGroupClient;
use crate::config::ConnectorConfig;
use crate::context::Context;
use crate::coordinator::{
    ClientFactory, Health, SlotStatus, WorkerCoordinator, WorkerId, WorkerTemplate,
};
use crate::error::{ClientError, ConnectorError};
use crate::kafka::RdKafkaGroupClient;
use crate::parser::IParser;
use crate::pipeline::IPipeline;
use crate::poll_loop::StatsSnapshot;
use crate::processor::RecordProcessor;
use log::{error, info};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const RETRY_EMIT_WAIT: Duration = Duration::from_secs(1);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub struct ConnectorBuilder {
    config: ConnectorConfig,
    pipeline: Option<Arc<dyn IPipeline>>,
    parser: Option<Box<dyn IParser>>,
    factory: Option<ClientFactory>,
}

impl ConnectorBuilder {
    pub fn new(config: ConnectorConfig) -> Self {
        Self {
            config,
            pipeline: None,
            parser: None,
            factory: None,
        }
    }

    pub fn pipeline(mut self, pipeline: Arc<dyn IPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// 設定の`parser`の代わりに使うパーサー
    pub fn parser(mut self, parser: Box<dyn IParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// グループクライアントの生成方法を差し替える。既定ではrdkafkaのクライアントを使う。
    pub fn client_factory(mut self, factory: ClientFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<Connector, ConnectorError> {
        self.config.validate()?;
        let pipeline = self.pipeline.ok_or(ConnectorError::MissingPipeline)?;
        let parser = match self.parser {
            Some(parser) => parser,
            None => self.config.build_parser()?,
        };
        let processor = RecordProcessor::new(parser, self.config.mapping.clone(), pipeline)
            .with_retry_emit(self.config.retry_emit_limit, RETRY_EMIT_WAIT);
        let template = WorkerTemplate {
            subscription: self.config.subscription()?,
            processor: Arc::new(processor),
            settings: self.config.loop_settings(),
            restart_backoff: self.config.restart_backoff(),
            max_restarts: self.config.max_worker_restarts,
        };
        let factory = match self.factory {
            Some(factory) => factory,
            None => rdkafka_factory(&self.config),
        };
        Ok(Connector {
            config: self.config,
            template,
            factory,
            coordinator: None,
            stopped: false,
        })
    }
}

fn rdkafka_factory(config: &ConnectorConfig) -> ClientFactory {
    let settings = config.client_settings();
    Arc::new(
        move |worker: WorkerId| -> Result<Box<dyn IGroupClient>, ClientError> {
            Ok(Box::new(RdKafkaGroupClient::new(&settings, worker)?))
        },
    )
}

pub struct Connector {
    config: ConnectorConfig,
    template: WorkerTemplate,
    factory: ClientFactory,
    coordinator: Option<WorkerCoordinator>,
    stopped: bool,
}

impl Connector {
    pub fn builder(config: ConnectorConfig) -> ConnectorBuilder {
        ConnectorBuilder::new(config)
    }

    /// ワーカーを起動する。tokioのランタイム上で一度だけ呼び出せる。
    ///
    /// `context`がキャンセルされると全てのワーカーが停止を始める。
    pub fn start(&mut self, context: Context) -> Result<(), ConnectorError> {
        if self.coordinator.is_some() {
            return Err(ConnectorError::AlreadyStarted);
        }
        info!(
            "Start connector.(topics={}, workers={}, group={})",
            self.template.subscription,
            self.config.workers,
            self.config
                .kafka_configs
                .get("group.id")
                .map(String::as_str)
                .unwrap_or_default()
        );
        self.coordinator = Some(WorkerCoordinator::spawn(
            self.config.workers,
            self.factory.clone(),
            self.template.clone(),
            context,
        ));
        Ok(())
    }

    /// 全てのワーカーを停止し、最後のコミットとクライアントの切断を待つ。
    ///
    /// 2回目以降の呼び出しは何もしない。
    pub async fn stop(&mut self) -> Result<(), ConnectorError> {
        if self.stopped {
            return Ok(());
        }
        let coordinator = self.coordinator.as_mut().ok_or(ConnectorError::NotRunning)?;
        info!("Stop connector.(workers={})", coordinator.workers());
        coordinator.shutdown().await;
        self.stopped = true;
        info!("Connector stopped.(stats={:?})", coordinator.stats());
        Ok(())
    }

    /// `signal`が完了するまで動作し、その後停止する。
    ///
    /// 全てのワーカーが回復不能なエラーで停止した場合は[ConnectorError::WorkersFailed]を返す。
    pub async fn run<F>(&mut self, signal: F) -> Result<(), ConnectorError>
    where
        F: Future,
    {
        self.start(Context::new())?;
        tokio::pin!(signal);
        let mut check = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        let result = loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown signal received.");
                    break Ok(());
                }
                _ = check.tick() => {
                    if self.health() == Health::Failed {
                        error!("All workers failed.(statuses={:?})", self.slot_statuses());
                        break Err(ConnectorError::WorkersFailed);
                    }
                }
            }
        };
        self.stop().await?;
        result
    }

    /// 複数のプロセスで同時に動作させてよいかどうか。設定のみから決まる。
    pub fn multi_workers_ready(&self) -> bool {
        self.config.multi_workers_ready()
    }

    /// 起動前は[Health::Failed]を返す。
    pub fn health(&self) -> Health {
        match &self.coordinator {
            Some(coordinator) => coordinator.health(),
            None => Health::Failed,
        }
    }

    pub fn slot_statuses(&self) -> Vec<SlotStatus> {
        self.coordinator
            .as_ref()
            .map(WorkerCoordinator::statuses)
            .unwrap_or_default()
    }

    pub fn slot_stats(&self) -> Vec<StatsSnapshot> {
        self.coordinator
            .as_ref()
            .map(WorkerCoordinator::slot_stats)
            .unwrap_or_default()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.coordinator
            .as_ref()
            .map(WorkerCoordinator::stats)
            .unwrap_or_default()
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }
}
