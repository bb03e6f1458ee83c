use futures_util::future::BoxFuture;
use std::time::Duration;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn chunk_vec<T: Clone>(items: &[T], chunk_size: usize) -> Vec<Vec<T>> {
    if chunk_size == 0 {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut idx = 0;
    while idx < items.len() {
        let end = (idx + chunk_size).min(items.len());
        chunks.push(items[idx..end].to_vec());
        idx = end;
    }
    chunks
}

pub fn interval_secs(secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval
}

/// Exponential reconnect backoff with a hard attempt cap.
///
/// Attempt `n` (1-based) waits `base * factor^(n-1)`. Once `max_attempts`
/// delays have been handed out, `next_delay` returns `None` and the caller
/// must stop reconnecting.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base_ms: u64,
    factor: f64,
    max_attempts: u32,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_ms: u64, factor: f64, max_attempts: u32) -> Self {
        Self {
            base_ms,
            factor: factor.max(1.0),
            max_attempts,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let delay_ms = self.delay_for_attempt(self.attempts + 1);
        self.attempts += 1;
        Some(Duration::from_millis(delay_ms))
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1) as i32;
        (self.base_ms as f64 * self.factor.powi(exp)).round() as u64
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

pub async fn subscribe_in_batches<C, T, E, F>(
    ctx: &mut C,
    items: &[T],
    batch_size: usize,
    delay_ms: u64,
    mut f: F,
) -> Result<(), E>
where
    for<'a> F: FnMut(&'a mut C, &'a [T]) -> BoxFuture<'a, Result<(), E>>,
{
    if batch_size == 0 {
        return Ok(());
    }

    for chunk in items.chunks(batch_size) {
        f(ctx, chunk).await?;
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_vec() {
        let items: Vec<u32> = (0..23).collect();
        let chunks = chunk_vec(&items, 10);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], vec![20, 21, 22]);
        assert!(chunk_vec(&items, 0).is_empty());
    }

    #[test]
    fn test_reconnect_delay_sequence() {
        let mut policy = ReconnectPolicy::new(3000, 1.5, 3);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(3000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(4500)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(6750)));
        assert_eq!(policy.next_delay(), None);
        assert!(policy.is_exhausted());
    }

    #[test]
    fn test_reconnect_reset() {
        let mut policy = ReconnectPolicy::new(3000, 1.5, 5);
        policy.next_delay();
        policy.next_delay();
        assert_eq!(policy.attempts(), 2);

        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(3000)));
    }

    #[tokio::test]
    async fn test_subscribe_in_batches_visits_every_chunk() {
        let items: Vec<u32> = (0..25).collect();
        let mut seen: Vec<usize> = Vec::new();
        let res: Result<(), String> = subscribe_in_batches(&mut seen, &items, 10, 0, |seen, chunk| {
            Box::pin(async move {
                seen.push(chunk.len());
                Ok(())
            })
        })
        .await;
        assert!(res.is_ok());
        assert_eq!(seen, vec![10, 10, 5]);
    }
}
