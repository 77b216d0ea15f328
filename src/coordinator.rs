//! 複数のワーカーの起動と監視。
//!
//! ワーカーはそれぞれ独立したグループクライアントで同じグループに参加する。
//! パーティションの分配はブローカーに任せ、ローカルでの調停は行わない。
use crate::client::IGroupClient;
use crate::context::Context;
use crate::error::{ClientError, WorkerError};
use crate::poll_loop::{LoopSettings, LoopState, PollLoop, StatsSnapshot, WorkerStats};
use crate::policy::Backoff;
use crate::processor::RecordProcessor;
use crate::topic::{Subscription, TopicResolver};
use log::{error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

pub type WorkerId = usize;

/// ワーカーごとにグループクライアントを生成する。再起動の度に呼ばれる。
pub type ClientFactory =
    Arc<dyn Fn(WorkerId) -> Result<Box<dyn IGroupClient>, ClientError> + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SlotStatus {
    Running { state: LoopState },
    /// 回復可能なエラーで停止し、再起動を待っている
    Restarting { restarts: usize, reason: String },
    /// 再起動しても回復しないエラーで停止した
    Failed { reason: String },
    Stopped,
}

impl SlotStatus {
    fn is_alive(&self) -> bool {
        matches!(self, SlotStatus::Running { .. } | SlotStatus::Restarting { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    /// 一部のワーカーが停止しているか再起動中
    Degraded,
    /// 動作しているワーカーが無い
    Failed,
}

impl Health {
    pub fn of(statuses: &[SlotStatus]) -> Health {
        let failed = statuses
            .iter()
            .filter(|s| matches!(s, SlotStatus::Failed { .. }))
            .count();
        let alive = statuses.iter().filter(|s| s.is_alive()).count();
        let restarting = statuses
            .iter()
            .filter(|s| matches!(s, SlotStatus::Restarting { .. }))
            .count();
        if failed > 0 && alive == 0 {
            Health::Failed
        } else if failed > 0 || restarting > 0 {
            Health::Degraded
        } else {
            Health::Healthy
        }
    }
}

/// ワーカーのセッションを組み立てるための値。
#[derive(Clone)]
pub struct WorkerTemplate {
    pub subscription: Subscription,
    pub processor: Arc<RecordProcessor>,
    pub settings: LoopSettings,
    pub restart_backoff: Backoff,
    /// Noneの場合は無制限に再起動する
    pub max_restarts: Option<usize>,
}

#[derive(Clone)]
struct SlotObservers {
    status: Arc<watch::Sender<SlotStatus>>,
    state: Arc<watch::Sender<LoopState>>,
    stats: Arc<WorkerStats>,
}

impl SlotObservers {
    fn new() -> Self {
        let (status, _) = watch::channel(SlotStatus::Running {
            state: LoopState::Joining,
        });
        let (state, _) = watch::channel(LoopState::Joining);
        Self {
            status: Arc::new(status),
            state: Arc::new(state),
            stats: Arc::new(WorkerStats::new()),
        }
    }

    fn status(&self) -> SlotStatus {
        match &*self.status.borrow() {
            SlotStatus::Running { .. } => SlotStatus::Running {
                state: *self.state.borrow(),
            },
            other => other.clone(),
        }
    }

    fn set(&self, status: SlotStatus) {
        self.status.send_replace(status);
    }
}

struct Slot {
    observers: SlotObservers,
    handle: Option<JoinHandle<()>>,
}

pub struct WorkerCoordinator {
    context: Context,
    slots: Vec<Slot>,
}

impl WorkerCoordinator {
    /// `workers`個のワーカーを起動する。tokioのランタイム上で呼び出すこと。
    pub fn spawn(
        workers: usize,
        factory: ClientFactory,
        template: WorkerTemplate,
        context: Context,
    ) -> Self {
        let slots = (0..workers)
            .map(|id| {
                let observers = SlotObservers::new();
                let handle = tokio::spawn(supervise(
                    id,
                    factory.clone(),
                    template.clone(),
                    context.clone(),
                    observers.clone(),
                ));
                Slot {
                    observers,
                    handle: Some(handle),
                }
            })
            .collect();
        Self { context, slots }
    }

    pub fn workers(&self) -> usize {
        self.slots.len()
    }

    pub fn statuses(&self) -> Vec<SlotStatus> {
        self.slots.iter().map(|slot| slot.observers.status()).collect()
    }

    pub fn health(&self) -> Health {
        Health::of(&self.statuses())
    }

    pub fn slot_stats(&self) -> Vec<StatsSnapshot> {
        self.slots
            .iter()
            .map(|slot| slot.observers.stats.snapshot())
            .collect()
    }

    /// 全ワーカーの合計
    pub fn stats(&self) -> StatsSnapshot {
        self.slot_stats()
            .into_iter()
            .fold(StatsSnapshot::default(), StatsSnapshot::merge)
    }

    /// 全ワーカーに停止を要求し、終了を待つ。
    pub async fn shutdown(&mut self) {
        self.context.cancel();
        for (id, slot) in self.slots.iter_mut().enumerate() {
            if let Some(handle) = slot.handle.take() {
                if let Err(e) = handle.await {
                    error!("Worker task panicked.(worker={}): {}", id, e);
                    slot.observers.set(SlotStatus::Failed {
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

async fn supervise(
    id: WorkerId,
    factory: ClientFactory,
    template: WorkerTemplate,
    context: Context,
    observers: SlotObservers,
) {
    let mut restarts = 0;
    loop {
        let session = Uuid::new_v4();
        info!("Start worker session.(worker={}, session={})", id, session);
        let client = match factory(id) {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to create group client.(worker={}): {}", id, e);
                observers.set(SlotStatus::Failed {
                    reason: e.to_string(),
                });
                return;
            }
        };
        observers.set(SlotStatus::Running {
            state: LoopState::Joining,
        });
        let result = PollLoop::new(
            id,
            client,
            TopicResolver::new(template.subscription.clone()),
            template.processor.clone(),
            template.settings.clone(),
        )
        .with_observers(observers.state.clone(), observers.stats.clone())
        .run(context.clone())
        .await;

        let e = match result {
            Ok(()) => {
                observers.set(SlotStatus::Stopped);
                return;
            }
            Err(_) if context.is_shutdown() => {
                observers.set(SlotStatus::Stopped);
                return;
            }
            Err(e) if e.is_terminal() => {
                error!("Worker failed. Not restarted.(worker={}, session={}): {}", id, session, e);
                observers.set(SlotStatus::Failed {
                    reason: e.to_string(),
                });
                return;
            }
            Err(e) => e,
        };

        if template.max_restarts.map_or(false, |max| restarts >= max) {
            let e = WorkerError::RestartExhausted {
                restarts,
                reason: e.to_string(),
            };
            error!("Worker failed.(worker={}): {}", id, e);
            observers.set(SlotStatus::Failed {
                reason: e.to_string(),
            });
            return;
        }
        restarts += 1;
        observers.stats.restarted();
        let wait = template.restart_backoff.delay(restarts - 1);
        warn!(
            "Restart worker after {:?}.(worker={}, session={}, restarts={}): {}",
            wait, id, session, restarts, e
        );
        observers.set(SlotStatus::Restarting {
            restarts,
            reason: e.to_string(),
        });
        tokio::select! {
            _ = context.done() => {
                observers.set(SlotStatus::Stopped);
                return;
            }
            _ = sleep(wait) => {}
        }
    }
}
