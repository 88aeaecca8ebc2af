//! Shared queue for calls diverted while the server is overloaded.
//!
//! One cooldown gates the whole queue. When it expires the client replays the
//! queued calls one at a time, `REPLAY_DELAY` apart, in arrival order.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{WsError, WsPresets};

/// Delay between replayed calls, so the replay itself does not re-trigger overload.
pub const REPLAY_DELAY: Duration = Duration::from_millis(200);

/// A call waiting for the cooldown to pass.
pub struct RetryCall {
    pub method: String,
    pub url: String,
    pub form: Vec<(String, String)>,
    pub presets: WsPresets,
    pub reply: oneshot::Sender<Result<Value, WsError>>,
}

/// What the replay task should do next.
pub enum NextRetry {
    Wait(Instant),
    Replay(RetryCall),
    Finished,
}

#[derive(Default)]
struct QueueState {
    calls: VecDeque<RetryCall>,
    cooldown_until: Option<Instant>,
    replaying: bool,
}

#[derive(Default)]
pub struct OverloadQueue {
    state: Mutex<QueueState>,
}

impl OverloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// New calls must join the queue while it holds calls, cools down, or replays.
    pub fn is_active(&self) -> bool {
        self.state
            .lock()
            .map(|s| !s.calls.is_empty() || s.replaying || s.cooldown_until.is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.calls.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start or extend the shared cooldown.
    pub fn arm(&self, retry_after: Duration) {
        if let Ok(mut s) = self.state.lock() {
            let until = Instant::now() + retry_after;
            s.cooldown_until = Some(s.cooldown_until.map_or(until, |current| current.max(until)));
        }
    }

    /// Append a call. Returns true when the caller must start the replay task.
    pub fn push_back(&self, call: RetryCall) -> Result<bool, WsError> {
        let mut s = self.lock()?;
        s.calls.push_back(call);
        Ok(Self::claim_replay(&mut s))
    }

    /// Put a call that hit overload again back at the head and re-arm the cooldown.
    pub fn push_front(&self, call: RetryCall, retry_after: Duration) -> Result<(), WsError> {
        let mut s = self.lock()?;
        s.calls.push_front(call);
        s.cooldown_until = Some(Instant::now() + retry_after);
        Ok(())
    }

    /// Pop the next call once the cooldown has passed.
    pub fn next(&self) -> NextRetry {
        let Ok(mut s) = self.state.lock() else {
            return NextRetry::Finished;
        };

        if let Some(until) = s.cooldown_until {
            if Instant::now() < until {
                return NextRetry::Wait(until);
            }
            s.cooldown_until = None;
        }

        match s.calls.pop_front() {
            Some(call) => NextRetry::Replay(call),
            None => {
                s.replaying = false;
                NextRetry::Finished
            }
        }
    }

    fn claim_replay(s: &mut QueueState) -> bool {
        if s.replaying {
            false
        } else {
            s.replaying = true;
            true
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, WsError> {
        self.state
            .lock()
            .map_err(|_| WsError::Network("Retry queue poisoned".to_string()))
    }
}
