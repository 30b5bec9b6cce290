// 进度与速度估算
//
// 每个活跃任务持有一个估算器实例，由协调器在消费进度事件时驱动。
// 纯状态机，不读系统时钟，时间由调用方注入以便测试

/// 两次对外汇报之间的最小间隔（秒）
const REPORT_INTERVAL: f64 = 0.2;

/// 指数滑动平均的平滑系数
const EMA_ALPHA: f64 = 0.25;

/// 一次被采纳的进度采样
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    /// 完成比例（0.0 - 1.0），总大小未知时为 None
    pub progress: Option<f64>,
    /// 平滑后的速度（字节/秒）
    pub speed: f64,
    /// 预计剩余秒数；总大小未知或速度过低时为 None
    pub eta_seconds: Option<f64>,
}

/// 单任务速度估算器
#[derive(Debug, Clone)]
pub struct SpeedEstimator {
    last_time: f64,
    last_bytes: u64,
    /// None 表示尚未产生过速度样本，首个瞬时速度直接作为种子
    ema_speed: Option<f64>,
}

impl SpeedEstimator {
    /// 以传输起点初始化
    pub fn new(now_secs: f64) -> Self {
        Self {
            last_time: now_secs,
            last_bytes: 0,
            ema_speed: None,
        }
    }

    /// 以已知偏移初始化（续传场景：增量从令牌偏移起算）
    pub fn seeded(now_secs: f64, bytes_written: u64) -> Self {
        Self {
            last_time: now_secs,
            last_bytes: bytes_written,
            ema_speed: None,
        }
    }

    /// 喂入一次进度观测
    ///
    /// 距上次采纳不足 0.2 秒的观测被丢弃（返回 None），不更新任何状态
    pub fn update(
        &mut self,
        now_secs: f64,
        bytes_written: u64,
        total_bytes: Option<u64>,
    ) -> Option<ProgressSample> {
        let dt = now_secs - self.last_time;
        if dt < REPORT_INTERVAL {
            return None;
        }

        let delta = bytes_written.saturating_sub(self.last_bytes) as f64;
        // 无新增字节时平滑速度保持不变，不向零衰减
        if delta > 0.0 {
            let instant = delta / dt;
            self.ema_speed = Some(match self.ema_speed {
                Some(prev) => EMA_ALPHA * instant + (1.0 - EMA_ALPHA) * prev,
                None => instant,
            });
        }
        self.last_time = now_secs;
        self.last_bytes = bytes_written;
        let speed = self.ema_speed.unwrap_or(0.0);

        let progress = total_bytes.and_then(|total| {
            if total > 0 {
                Some((bytes_written as f64 / total as f64).min(1.0))
            } else {
                None
            }
        });

        // 速度近零时不给 ETA，避免显示天文数字
        let eta_seconds = match (total_bytes, speed > 1.0) {
            (Some(total), true) => {
                let remaining = total.saturating_sub(bytes_written) as f64;
                Some(remaining / speed)
            }
            _ => None,
        };

        Some(ProgressSample {
            progress,
            speed,
            eta_seconds,
        })
    }

    /// 当前平滑速度（尚无样本时为 0）
    pub fn current_speed(&self) -> f64 {
        self.ema_speed.unwrap_or(0.0)
    }
}
