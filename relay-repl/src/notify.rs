//! State-change notifier (§4.4): lets an external controller gate an
//! action on the applier reaching a particular state within a deadline.
//!
//! Setting the applier's state invokes every registered subscriber. A
//! subscriber wakes its caller if the applier reaches `desired_state`,
//! `Off`, or `Stopped`; reaching any of those three also pauses the
//! applier (blocks its reader on a resume condition) until the caller
//! explicitly calls `resume()`. This is how, e.g., a join-then-subscribe
//! driver waits for `Joined` without racing the reader past it.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{oneshot, Notify};

use crate::applier::ApplierState;
use crate::error::ErrorClass;

/// A snapshot of the applier's last error, cheap to clone so it can be
/// handed to every timed-out or terminally-woken waiter.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LastError {
    pub class: ErrorClass,
    pub message: String,
}

impl From<&crate::error::ReplicationError> for LastError {
    fn from(e: &crate::error::ReplicationError) -> Self {
        LastError {
            class: e.classify(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug)]
pub enum AwaitError {
    Timeout,
    /// The applier reached `Off`/`Stopped` without ever reaching the
    /// desired state; carries its last error, if any was recorded.
    Surfaced(Option<LastError>),
}

enum WakeReason {
    Reached(ApplierState),
    Terminal,
}

struct Subscriber {
    desired: ApplierState,
    wake: oneshot::Sender<WakeReason>,
}

#[derive(Default)]
struct Inner {
    subscribers: Vec<Subscriber>,
    paused: bool,
}

pub struct Notifier {
    inner: Mutex<Inner>,
    resume_notify: Notify,
}

impl Default for Notifier {
    fn default() -> Self {
        Notifier {
            inner: Mutex::new(Inner::default()),
            resume_notify: Notify::new(),
        }
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoked by the applier every time its state changes. Wakes and
    /// removes every subscriber that matches, and pauses the applier if
    /// it woke anyone.
    pub fn on_state_change(&self, new_state: ApplierState) {
        let mut inner = self.inner.lock().unwrap();
        let terminal = matches!(new_state, ApplierState::Off | ApplierState::Stopped);
        let mut woke_any = false;
        let mut i = 0;
        while i < inner.subscribers.len() {
            let matches_desired = inner.subscribers[i].desired == new_state;
            if matches_desired || terminal {
                let sub = inner.subscribers.remove(i);
                let reason = if matches_desired {
                    WakeReason::Reached(new_state)
                } else {
                    WakeReason::Terminal
                };
                let _ = sub.wake.send(reason);
                woke_any = true;
            } else {
                i += 1;
            }
        }
        if woke_any {
            inner.paused = true;
        }
    }

    /// Blocks the caller (meant to be called from the applier's own
    /// reader loop at a yield point) while a subscriber has paused it.
    pub async fn wait_while_paused(&self) {
        loop {
            {
                let inner = self.inner.lock().unwrap();
                if !inner.paused {
                    return;
                }
            }
            self.resume_notify.notified().await;
        }
    }

    pub fn resume(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.paused = false;
        drop(inner);
        self.resume_notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().paused
    }

    /// Register interest in `desired` and await it (or a terminal state)
    /// for up to `deadline`. `last_error` is consulted only on the
    /// terminal path, lazily, since the subscription may never fire.
    pub async fn await_state(
        &self,
        desired: ApplierState,
        deadline: Duration,
        last_error: impl FnOnce() -> Option<LastError>,
    ) -> Result<ApplierState, AwaitError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.subscribers.push(Subscriber { desired, wake: tx });
        }
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(WakeReason::Reached(s))) => Ok(s),
            Ok(Ok(WakeReason::Terminal)) => Err(AwaitError::Surfaced(last_error())),
            Ok(Err(_)) => Err(AwaitError::Surfaced(last_error())),
            Err(_) => Err(AwaitError::Timeout),
        }
    }
}

#[cfg(test)]
use test_log::test;

#[cfg(test)]
#[tokio::test]
async fn wakes_on_desired_state() {
    let notifier = Notifier::new();
    let n2 = &notifier;
    let waiter = async { n2.await_state(ApplierState::Follow, Duration::from_secs(1), || None).await };
    let setter = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        notifier.on_state_change(ApplierState::Sync);
        tokio::time::sleep(Duration::from_millis(10)).await;
        notifier.on_state_change(ApplierState::Follow);
    };
    let (result, _) = tokio::join!(waiter, setter);
    assert!(matches!(result, Ok(ApplierState::Follow)));
    assert!(notifier.is_paused());
    notifier.resume();
    assert!(!notifier.is_paused());
}

#[cfg(test)]
#[tokio::test]
async fn times_out_if_never_reached() {
    let notifier = Notifier::new();
    let result = notifier
        .await_state(ApplierState::Follow, Duration::from_millis(20), || None)
        .await;
    assert!(matches!(result, Err(AwaitError::Timeout)));
}

#[cfg(test)]
#[tokio::test]
async fn surfaces_last_error_on_terminal_state() {
    let notifier = Notifier::new();
    let waiter = notifier.await_state(ApplierState::Follow, Duration::from_secs(1), || {
        Some(LastError {
            class: ErrorClass::Stopped,
            message: "boom".to_string(),
        })
    });
    notifier.on_state_change(ApplierState::Stopped);
    match waiter.await {
        Err(AwaitError::Surfaced(Some(e))) => assert_eq!(e.message, "boom"),
        other => panic!("expected surfaced error, got {other:?}"),
    }
}
