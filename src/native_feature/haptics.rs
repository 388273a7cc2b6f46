use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, warn};

use crate::config::{HapticsBackend, HapticsConfig};

#[derive(Debug, Error)]
pub enum HapticsError {
    #[error("Failed to drive vibrator at {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Unknown vibration pattern: {0}")]
    UnknownPattern(String),
}

pub type HapticsResult<T> = Result<T, HapticsError>;

/// Vibration capability. `period` zero means one continuous buzz of
/// `duration`; otherwise the motor pulses on for half of every period until
/// `duration` has elapsed.
#[async_trait]
pub trait Vibrator: Send + Sync {
    fn backend(&self) -> HapticsBackend;

    async fn vibrate(&self, period: Duration, duration: Duration) -> HapticsResult<()>;

    async fn vibrate_named(&self, name: &str) -> HapticsResult<()> {
        let (period, duration) =
            named_pattern(name).ok_or_else(|| HapticsError::UnknownPattern(name.to_string()))?;
        self.vibrate(period, duration).await
    }

    /// Stop the current pattern
    async fn cancel(&self) -> HapticsResult<()>;

    /// Stop the current pattern and anything queued behind it
    async fn cancel_all(&self) -> HapticsResult<()>;
}

/// (period, duration) of the built-in patterns
pub fn named_pattern(name: &str) -> Option<(Duration, Duration)> {
    let ms = Duration::from_millis;
    match name {
        "ringtone" => Some((ms(1000), ms(3000))),
        "alert" => Some((Duration::ZERO, ms(500))),
        "notification" => Some((Duration::ZERO, ms(250))),
        "tap" => Some((Duration::ZERO, ms(30))),
        _ => None,
    }
}

/// Linux timed-output vibrator: writing N to the `enable` file buzzes for N
/// milliseconds, writing 0 stops it.
pub struct SysfsVibrator {
    path: PathBuf,
    pulse: Mutex<Option<JoinHandle<()>>>,
}

impl SysfsVibrator {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            pulse: Mutex::new(None),
        }
    }

    async fn write_ms(path: &PathBuf, ms: u128) -> HapticsResult<()> {
        tokio::fs::write(path, ms.to_string())
            .await
            .map_err(|source| HapticsError::Write {
                path: path.clone(),
                source,
            })
    }

    async fn stop_pulse(&self) {
        if let Some(handle) = self.pulse.lock().await.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Vibrator for SysfsVibrator {
    fn backend(&self) -> HapticsBackend {
        HapticsBackend::Sysfs
    }

    async fn vibrate(&self, period: Duration, duration: Duration) -> HapticsResult<()> {
        self.stop_pulse().await;
        if period.is_zero() || period >= duration {
            return Self::write_ms(&self.path, duration.as_millis()).await;
        }

        // 最初のパルスだけは同期的に書いて、書き込みエラーを呼び出し元に返す
        let on = period / 2;
        Self::write_ms(&self.path, on.as_millis()).await?;
        let path = self.path.clone();
        let handle = tokio::spawn(async move {
            let mut elapsed = period;
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            while elapsed < duration {
                interval.tick().await;
                if let Err(e) = Self::write_ms(&path, on.as_millis()).await {
                    warn!("vibration pulse stopped: {}", e);
                    return;
                }
                elapsed += period;
            }
        });
        *self.pulse.lock().await = Some(handle);
        Ok(())
    }

    async fn cancel(&self) -> HapticsResult<()> {
        self.stop_pulse().await;
        Self::write_ms(&self.path, 0).await
    }

    async fn cancel_all(&self) -> HapticsResult<()> {
        self.cancel().await
    }
}

/// Devices without a vibrator
#[derive(Debug, Default)]
pub struct NullVibrator;

#[async_trait]
impl Vibrator for NullVibrator {
    fn backend(&self) -> HapticsBackend {
        HapticsBackend::None
    }

    async fn vibrate(&self, period: Duration, duration: Duration) -> HapticsResult<()> {
        debug!("no vibrator: ignoring {:?}/{:?}", period, duration);
        Ok(())
    }

    async fn cancel(&self) -> HapticsResult<()> {
        Ok(())
    }

    async fn cancel_all(&self) -> HapticsResult<()> {
        Ok(())
    }
}

/// Pick the vibrator once at startup. `Auto` uses sysfs when the control
/// file exists.
pub fn detect(config: &HapticsConfig) -> Arc<dyn Vibrator> {
    let use_sysfs = match config.backend {
        HapticsBackend::Sysfs => true,
        HapticsBackend::None => false,
        HapticsBackend::Auto => config.sysfs_path.exists(),
    };
    if use_sysfs {
        debug!("haptics: sysfs at {}", config.sysfs_path.display());
        Arc::new(SysfsVibrator::new(&config.sysfs_path))
    } else {
        debug!("haptics: none");
        Arc::new(NullVibrator)
    }
}
