use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use anyhow::Result;

/// Fixed-rate ticker driving the demo publisher.
pub struct Scheduler {
    interval: Duration,
}

impl Scheduler {
    pub fn new(interval_ms: u64) -> Result<Self> {
        if interval_ms == 0 {
            return Err(anyhow::anyhow!("scheduler interval must be greater than zero"));
        }
        Ok(Self {
            interval: Duration::from_millis(interval_ms),
        })
    }

    /// Runs `job` once per tick with the tick index, `ticks` times. A job
    /// error stops the schedule.
    pub async fn run<J, F>(&self, ticks: u64, mut job: J) -> Result<()>
    where
        J: FnMut(u64) -> F,
        F: std::future::Future<Output = Result<()>>,
    {
        let mut next = Instant::now();
        for tick in 0..ticks {
            next += self.interval;
            job(tick).await?;
            sleep_until(next).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_rejected() {
        assert!(Scheduler::new(0).is_err());
    }

    #[tokio::test]
    async fn runs_each_tick_in_order() {
        let scheduler = Scheduler::new(1).unwrap();
        let mut seen = Vec::new();
        scheduler
            .run(3, |tick| {
                seen.push(tick);
                async { Ok(()) }
            })
            .await
            .unwrap();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn job_error_stops() {
        let scheduler = Scheduler::new(1).unwrap();
        let err = scheduler
            .run(5, |tick| async move {
                if tick == 1 {
                    anyhow::bail!("tick {} failed", tick);
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("tick 1"));
    }
}
