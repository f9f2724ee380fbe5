//! Bounded dispatch of OTP verification emails.
//!
//! Each verification request runs as an isolated execution unit that
//! generates a 6-digit code, makes a single delivery attempt through the
//! [`Mailer`], and reports exactly one terminal result. A dispatcher task
//! owns the bookkeeping: at most `capacity` units run at once, overflow
//! waits in a strict FIFO queue, and a completed unit immediately promotes
//! the queue head into its freed slot. Admission is unbounded; sustained
//! overload grows the wait queue rather than pushing back on callers, so
//! queue depth is exported as a gauge.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::mailer::Mailer;

/// Terminal failure reported for a verification request.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The mail transport rejected the delivery attempt.
    #[error("failed to send OTP email: {0}")]
    Transport(String),
    /// The execution unit went away without reporting a result.
    #[error("verification unit terminated unexpectedly")]
    UnitTerminated,
    /// The dispatcher task is no longer running.
    #[error("OTP dispatcher is not running")]
    Shutdown,
}

/// Successful delivery report carrying the generated code.
#[derive(Debug, Clone)]
pub struct OtpDelivery {
    /// The 6-digit code that was emailed.
    pub code: String,
}

struct DispatchRequest {
    email: String,
    reply: oneshot::Sender<Result<OtpDelivery, DispatchError>>,
}

/// Cheap clonable handle to the dispatcher task.
///
/// The task owns the active set and wait queue exclusively; handles only
/// enqueue requests, so no locking is involved anywhere. Dropping every
/// handle stops the dispatcher once in-flight units finish.
#[derive(Clone)]
pub struct OtpDispatcher {
    submit_tx: mpsc::UnboundedSender<DispatchRequest>,
}

impl OtpDispatcher {
    /// Spawn the dispatcher task with the given unit capacity.
    pub fn start(mailer: Arc<dyn Mailer>, capacity: usize) -> Self {
        // capacity zero would strand every request in the queue
        let capacity = capacity.max(1);
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(mailer, capacity, submit_rx));
        Self { submit_tx }
    }

    /// Submit one verification request. Resolves exactly once: with the
    /// delivered code, or with the unit's failure. A unit that dies without
    /// reporting resolves as [`DispatchError::UnitTerminated`] rather than
    /// hanging the caller.
    pub async fn submit(&self, email: impl Into<String>) -> Result<OtpDelivery, DispatchError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit_tx
            .send(DispatchRequest {
                email: email.into(),
                reply: reply_tx,
            })
            .map_err(|_| DispatchError::Shutdown)?;

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::UnitTerminated),
        }
    }
}

async fn dispatch_loop(
    mailer: Arc<dyn Mailer>,
    capacity: usize,
    mut submit_rx: mpsc::UnboundedReceiver<DispatchRequest>,
) {
    let mut active: FuturesUnordered<JoinHandle<()>> = FuturesUnordered::new();
    let mut waiting: VecDeque<DispatchRequest> = VecDeque::new();

    loop {
        tokio::select! {
            maybe_request = submit_rx.recv() => {
                let Some(request) = maybe_request else { break };
                if active.len() < capacity {
                    active.push(spawn_unit(mailer.clone(), request));
                } else {
                    waiting.push_back(request);
                    metrics::gauge!("api.otp.queue_depth").set(waiting.len() as f64);
                }
            }
            Some(joined) = active.next(), if !active.is_empty() => {
                if let Err(error) = joined {
                    warn!(%error, "verification unit terminated abnormally");
                }
                if let Some(next) = waiting.pop_front() {
                    metrics::gauge!("api.otp.queue_depth").set(waiting.len() as f64);
                    active.push(spawn_unit(mailer.clone(), next));
                }
            }
        }
    }

    // Every handle is gone, so no submitter is left awaiting a reply.
    // In-flight units keep running detached until their send finishes.
    debug!(queued = waiting.len(), "OTP dispatcher stopping");
}

fn spawn_unit(mailer: Arc<dyn Mailer>, request: DispatchRequest) -> JoinHandle<()> {
    metrics::counter!("api.otp.units_started").increment(1);
    tokio::spawn(async move {
        let code = generate_code();
        let result = match mailer.send_otp(&request.email, &code).await {
            Ok(()) => {
                metrics::counter!("api.otp.delivered").increment(1);
                Ok(OtpDelivery { code })
            }
            Err(error) => {
                metrics::counter!("api.otp.failed").increment(1);
                warn!(%error, "OTP delivery failed");
                Err(DispatchError::Transport(format!("{error:#}")))
            }
        };
        // the submitter may have been cancelled; nothing left to do then
        let _ = request.reply.send(result);
    })
}

/// Generate a 6-digit verification code, uniform over 100000..=999999.
pub fn generate_code() -> String {
    rand::thread_rng().gen_range(100_000u32..=999_999).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Holds every send open until the test releases it, reporting
    /// (recipient, release-handle) pairs in unit start order.
    struct ManualMailer {
        started_tx: mpsc::UnboundedSender<(String, oneshot::Sender<anyhow::Result<()>>)>,
    }

    #[async_trait]
    impl Mailer for ManualMailer {
        async fn send_otp(&self, recipient: &str, _code: &str) -> anyhow::Result<()> {
            let (done_tx, done_rx) = oneshot::channel();
            self.started_tx
                .send((recipient.to_string(), done_tx))
                .expect("test receiver alive");
            match done_rx.await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("release handle dropped")),
            }
        }
    }

    #[derive(Default)]
    struct CountingMailer {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Mailer for CountingMailer {
        async fn send_otp(&self, _recipient: &str, _code: &str) -> anyhow::Result<()> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailMailer;

    #[async_trait]
    impl Mailer for FailMailer {
        async fn send_otp(&self, _recipient: &str, _code: &str) -> anyhow::Result<()> {
            Err(anyhow!("SMTP connection refused"))
        }
    }

    /// Panics for recipients starting with "boom", succeeds otherwise.
    struct FlakyMailer;

    #[async_trait]
    impl Mailer for FlakyMailer {
        async fn send_otp(&self, recipient: &str, _code: &str) -> anyhow::Result<()> {
            if recipient.starts_with("boom") {
                panic!("mailer exploded");
            }
            Ok(())
        }
    }

    async fn resolved<T>(fut: impl std::future::Future<Output = T>) -> T {
        timeout(Duration::from_secs(5), fut)
            .await
            .expect("submit should resolve, not hang")
    }

    #[tokio::test]
    async fn test_starts_immediately_below_capacity() {
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let dispatcher = OtpDispatcher::start(Arc::new(ManualMailer { started_tx }), 5);

        let submits = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                join_all([
                    dispatcher.submit("a@example.com"),
                    dispatcher.submit("b@example.com"),
                    dispatcher.submit("c@example.com"),
                ])
                .await
            }
        });

        // all three units start without any completion being signalled
        let mut releases = Vec::new();
        for expected in ["a@example.com", "b@example.com", "c@example.com"] {
            let (email, release) = resolved(started_rx.recv()).await.expect("unit started");
            assert_eq!(email, expected);
            releases.push(release);
        }

        for release in releases {
            release.send(Ok(())).expect("unit awaiting release");
        }
        let results = submits.await.expect("submit task");
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_queued_requests_start_in_fifo_order() {
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let dispatcher = OtpDispatcher::start(Arc::new(ManualMailer { started_tx }), 2);

        let submits = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                join_all([
                    dispatcher.submit("a@example.com"),
                    dispatcher.submit("b@example.com"),
                    dispatcher.submit("c@example.com"),
                    dispatcher.submit("d@example.com"),
                ])
                .await
            }
        });

        let (first, release_first) = resolved(started_rx.recv()).await.expect("unit started");
        let (second, release_second) = resolved(started_rx.recv()).await.expect("unit started");
        assert_eq!(first, "a@example.com");
        assert_eq!(second, "b@example.com");

        // both slots taken: c and d must wait
        assert!(
            timeout(Duration::from_millis(50), started_rx.recv())
                .await
                .is_err(),
            "no unit may start while the active set is full"
        );

        release_first.send(Ok(())).expect("unit awaiting release");
        let (third, release_third) = resolved(started_rx.recv()).await.expect("unit started");
        assert_eq!(third, "c@example.com");

        release_second.send(Ok(())).expect("unit awaiting release");
        let (fourth, release_fourth) = resolved(started_rx.recv()).await.expect("unit started");
        assert_eq!(fourth, "d@example.com");

        release_third.send(Ok(())).expect("unit awaiting release");
        release_fourth.send(Ok(())).expect("unit awaiting release");

        let results = submits.await.expect("submit task");
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_burst_never_exceeds_capacity() {
        let mailer = Arc::new(CountingMailer::default());
        let dispatcher = OtpDispatcher::start(mailer.clone(), 5);

        let results = join_all((0..20).map(|i| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.submit(format!("user{i}@example.com")).await }
        }))
        .await;

        assert_eq!(results.len(), 20);
        for result in &results {
            let delivery = result.as_ref().expect("delivery succeeds");
            let value: u32 = delivery.code.parse().expect("numeric code");
            assert!((100_000..=999_999).contains(&value));
        }
        assert_eq!(mailer.peak.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_transport_failure_rejects_every_submit() {
        let dispatcher = OtpDispatcher::start(Arc::new(FailMailer), 2);

        // sequential resolution proves each failure frees its slot
        for i in 0..8 {
            let err = resolved(dispatcher.submit(format!("user{i}@example.com")))
                .await
                .expect_err("transport failure must reject");
            match err {
                DispatchError::Transport(message) => {
                    assert!(message.contains("SMTP connection refused"))
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_abnormal_unit_exit_resolves_with_failure() {
        let dispatcher = OtpDispatcher::start(Arc::new(FlakyMailer), 1);

        let results = join_all([
            dispatcher.submit("boom@example.com"),
            dispatcher.submit("ok@example.com"),
        ])
        .await;

        // the crashed unit reports a synthesized failure, never a hang
        assert!(matches!(
            &results[0],
            Err(DispatchError::UnitTerminated)
        ));
        // and its slot was reclaimed for the queued request
        assert!(results[1].is_ok());

        let err = resolved(dispatcher.submit("boom2@example.com"))
            .await
            .expect_err("crash must reject");
        assert!(matches!(err, DispatchError::UnitTerminated));
    }

    #[test]
    fn test_codes_are_six_digit_decimal() {
        for _ in 0..1000 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            let value: u32 = code.parse().expect("decimal code");
            assert!((100_000..=999_999).contains(&value));
        }
    }
}
