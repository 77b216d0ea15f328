use rand::Rng;
use std::time::{Duration, Instant};

/// 定期的に実行される処理のポリシーの一般的な表現。
pub trait IJobPolicy: Send {
    /// 次に処理を実行するまでのインターバルを提供する。
    fn interval(&self) -> Duration;

    /// ポリシーに違反しているかどうかの判定を行う。
    fn check(&self) -> bool;

    /// 判定に使う状態を初期状態に戻す。
    ///
    /// 使用例として、リトライ回数を判定に使うポリシーにおけるカウントの初期化を行う。
    fn reset(&mut self);

    /// 判定に使う状態を更新する。
    ///
    /// 使用例として、リトライ回数を判定に使うポリシーにおけるリトライ回数のインクリメントを行う。
    fn update(&mut self);
}

/// 指数的に増加し、上限で頭打ちになる待ち時間。
///
/// `jitter`は`0.0..=1.0`の比率で、算出した待ち時間からランダムに差し引く割合の上限を表す。
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            jitter: 0.2,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// `attempt`回目(0始まり)の待ち時間を返す。
    pub fn delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.min(31) as u32;
        let base = self
            .initial
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);
        if self.jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
        base.mul_f64(1.0 - factor)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryLimit {
    Bounded(usize),
    Unbounded,
}

/// 連続した失敗の回数を数え、リトライの上限と次の待ち時間を決めるポリシー。
///
/// [RetryLimit::Bounded]の場合、[IJobPolicy::update]の呼び出し回数がlimit以上になると
/// [IJobPolicy::check]はtrueを返す。[RetryLimit::Unbounded]の場合は常にfalseを返す。
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    backoff: Backoff,
    limit: RetryLimit,
    count: usize,
}

impl RetryPolicy {
    pub fn new(backoff: Backoff, limit: RetryLimit) -> Self {
        Self {
            backoff,
            limit,
            count: 0,
        }
    }

    pub fn attempts(&self) -> usize {
        self.count
    }
}

impl IJobPolicy for RetryPolicy {
    fn interval(&self) -> Duration {
        self.backoff.delay(self.count.saturating_sub(1))
    }

    fn check(&self) -> bool {
        match self.limit {
            RetryLimit::Bounded(limit) => self.count >= limit,
            RetryLimit::Unbounded => false,
        }
    }

    fn reset(&mut self) {
        self.count = 0;
    }

    fn update(&mut self) {
        self.count = self.count.saturating_add(1);
    }
}

/// オフセットをコミットする頻度のポリシー。
///
/// 前回のコミットからintervalが経過したか、確定したレコード数がlimitに達した時点で
/// [IJobPolicy::check]はtrueを返す。
#[derive(Clone, Debug)]
pub struct CommitCadence {
    interval: Duration,
    limit: usize,
    count: usize,
    last: Instant,
}

impl CommitCadence {
    pub fn new(interval: Duration, limit: usize) -> Self {
        Self {
            interval,
            limit: limit.max(1),
            count: 0,
            last: Instant::now(),
        }
    }

    pub fn add(&mut self, records: usize) {
        self.count = self.count.saturating_add(records);
    }
}

impl IJobPolicy for CommitCadence {
    fn interval(&self) -> Duration {
        self.interval
    }

    fn check(&self) -> bool {
        self.count >= self.limit || self.last.elapsed() >= self.interval
    }

    fn reset(&mut self) {
        self.count = 0;
        self.last = Instant::now();
    }

    fn update(&mut self) {
        self.add(1);
    }
}
