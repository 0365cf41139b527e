use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, Duration, Instant};

use crate::game::{RoomCommand, RoomEvent};
use crate::types::ServerMsg;

/// What the active schedule does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Ticking countdown: TIMER_UPDATE every second, TimerExpired at zero.
    Countdown,
    /// Silent hold: a single Advance command after the delay.
    Hold,
}

/// The one logical countdown a room owns. Arming replaces whatever was
/// scheduled before; stale wake-ups are discarded by the epoch counter.
pub struct RoomTimer {
    epoch: u64,
    deadline: Option<Instant>,
    kind: Option<TimerKind>,
    cancel: Option<watch::Sender<bool>>,
}

impl Default for RoomTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomTimer {
    pub fn new() -> Self {
        Self {
            epoch: 0,
            deadline: None,
            kind: None,
            cancel: None,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether a wake-up carrying `epoch` is still the scheduled one.
    pub fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.kind.is_some()
    }

    pub fn kind(&self) -> Option<TimerKind> {
        self.kind
    }

    /// Whole seconds left on the active schedule, rounded up.
    pub fn remaining(&self) -> Option<u64> {
        let deadline = self.deadline?;
        let now = Instant::now();
        if deadline <= now {
            return Some(0);
        }
        Some((deadline - now).as_secs_f64().ceil() as u64)
    }

    /// Start a ticking countdown of `secs`, replacing any active schedule.
    pub fn arm_countdown(
        &mut self,
        secs: u64,
        event_tx: &broadcast::Sender<RoomEvent>,
        cmd_tx: &mpsc::Sender<RoomCommand>,
    ) {
        self.invalidate();
        self.epoch += 1;
        let epoch = self.epoch;
        self.deadline = Some(Instant::now() + Duration::from_secs(secs));
        self.kind = Some(TimerKind::Countdown);

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        self.cancel = Some(cancel_tx);

        let event_tx = event_tx.clone();
        let cmd_tx = cmd_tx.clone();
        tokio::spawn(async move {
            let _ = event_tx.send(RoomEvent::Broadcast {
                msg: ServerMsg::TimerUpdate { remaining: secs },
            });
            if secs == 0 {
                let _ = cmd_tx.send(RoomCommand::TimerExpired { epoch }).await;
                return;
            }
            let mut remaining = secs;
            loop {
                tokio::select! {
                    _ = sleep(Duration::from_secs(1)) => {
                        remaining -= 1;
                        let _ = event_tx.send(RoomEvent::Broadcast {
                            msg: ServerMsg::TimerUpdate { remaining },
                        });
                        if remaining == 0 {
                            let _ = cmd_tx.send(RoomCommand::TimerExpired { epoch }).await;
                            return;
                        }
                    }
                    _ = cancel_rx.changed() => return,
                }
            }
        });
    }

    /// Schedule a silent Advance after `delay`, replacing any active
    /// schedule. Used for the presentation holds between phases.
    pub fn arm_hold(&mut self, delay: Duration, cmd_tx: &mpsc::Sender<RoomCommand>) {
        self.invalidate();
        self.epoch += 1;
        let epoch = self.epoch;
        self.deadline = Some(Instant::now() + delay);
        self.kind = Some(TimerKind::Hold);

        let cmd_tx = cmd_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = cmd_tx.send(RoomCommand::Advance { epoch }).await;
        });
    }

    /// Stop the active schedule without firing it.
    pub fn cancel(&mut self) {
        self.invalidate();
        self.epoch += 1;
    }

    /// Freeze the active schedule, returning its remaining seconds and kind.
    /// Returns None when nothing was scheduled.
    pub fn pause(&mut self) -> Option<(u64, TimerKind)> {
        let remaining = self.remaining()?;
        let kind = self.kind?;
        self.cancel();
        Some((remaining, kind))
    }

    /// Push the deadline of a running countdown forward by `extra` seconds.
    /// Returns the new remaining time, or None when no countdown is active.
    pub fn extend(
        &mut self,
        extra: u64,
        event_tx: &broadcast::Sender<RoomEvent>,
        cmd_tx: &mpsc::Sender<RoomCommand>,
    ) -> Option<u64> {
        if self.kind != Some(TimerKind::Countdown) {
            return None;
        }
        let remaining = self.remaining()?;
        let new_remaining = remaining + extra;
        self.arm_countdown(new_remaining, event_tx, cmd_tx);
        Some(new_remaining)
    }

    fn invalidate(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(true);
        }
        self.deadline = None;
        self.kind = None;
    }
}
