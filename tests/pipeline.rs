//! Session pipeline integration tests
//!
//! Drives whole requests through a scripted backend. Timing-sensitive tests
//! run on a paused clock so delays are deterministic.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use wyoming_streamer::config::SynthesisConfig;
use wyoming_streamer::synth::{Outcome, RequestError, RetryPolicy, Session, SynthesisEvent, segment};
use wyoming_streamer::BackendError;

mod common;
use common::{ScriptedBackend, Step, collect, describe, summary_of, voice};

fn config() -> SynthesisConfig {
    SynthesisConfig {
        max_concurrency: 3,
        unit_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        },
        ..SynthesisConfig::default()
    }
}

async fn run_text(
    backend: Arc<ScriptedBackend>,
    config: SynthesisConfig,
    fragments: &[&str],
) -> Vec<SynthesisEvent> {
    let (mut tx, rx) = mpsc::unbounded_channel();
    let input = futures::stream::iter(fragments.iter().map(|s| (*s).to_string()));
    Session::new(voice(backend), config).run(input, &mut tx).await;
    drop(tx);
    collect(rx).await
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn test_three_sentences_make_three_units() {
    let units = segment("Hello there. How are you today? I am fine.", 200).expect("segment");
    let indices: Vec<u64> = units.iter().map(|u| u.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(units[1].text, "How are you today?");
}

#[tokio::test(start_paused = true)]
async fn test_out_of_order_completions_are_emitted_in_order() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .script("Alpha", vec![Step::Succeed(ms(300))])
            .script("Beta", vec![Step::Succeed(ms(100))])
            .script("Gamma", vec![Step::Succeed(ms(10))]),
    );

    let events = run_text(backend.clone(), config(), &["Alpha one. Beta two. Gamma three."]).await;

    assert_eq!(
        describe(&events),
        vec!["audio:Alpha one.", "audio:Beta two.", "audio:Gamma three.", "end"]
    );
    assert_eq!(backend.peak(), 3);
    let summary = summary_of(&events);
    assert_eq!((summary.succeeded, summary.failed), (3, 0));
}

#[tokio::test(start_paused = true)]
async fn test_middle_failure_does_not_block_later_units() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .script("first", vec![Step::Succeed(ms(10))])
            .script("second", vec![Step::Fail(ms(200), BackendError::Permanent("bad input".into()))])
            .script("third", vec![Step::Succeed(ms(20))]),
    );

    let events = run_text(
        backend.clone(),
        config(),
        &["The first. The second. The third."],
    )
    .await;

    assert_eq!(
        describe(&events),
        vec!["audio:The first.", "failed:1", "audio:The third.", "end"]
    );
    let summary = summary_of(&events);
    assert_eq!(summary.units, 3);
    assert_eq!((summary.succeeded, summary.failed), (2, 1));
    assert_eq!(summary.outcome, Outcome::Completed);
    assert_eq!(backend.calls_for("second"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failure_at_head_releases_held_units() {
    let backend = Arc::new(
        ScriptedBackend::new()
            .script("one", vec![Step::Fail(ms(500), BackendError::Auth("expired".into()))])
            .script("two", vec![Step::Succeed(ms(1))])
            .script("three", vec![Step::Succeed(ms(2))]),
    );

    let events = run_text(backend, config(), &["Unit one. Unit two. Unit three."]).await;
    assert_eq!(
        describe(&events),
        vec!["failed:0", "audio:Unit two.", "audio:Unit three.", "end"]
    );
}

#[tokio::test]
async fn test_empty_stream_finishes_with_zero_units() {
    let backend = Arc::new(ScriptedBackend::new());
    let events = run_text(backend.clone(), config(), &[]).await;

    assert_eq!(describe(&events), vec!["end"]);
    let summary = summary_of(&events);
    assert_eq!((summary.units, summary.succeeded, summary.failed), (0, 0, 0));
    assert!(summary.is_completed());
    assert_eq!(backend.total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_failures_then_success() {
    let backend = Arc::new(ScriptedBackend::new().script(
        "flaky",
        vec![
            Step::Fail(Duration::ZERO, BackendError::Transient("connection reset".into())),
            Step::Fail(Duration::ZERO, BackendError::RateLimited { retry_after: Some(ms(50)) }),
            Step::Succeed(Duration::ZERO),
        ],
    ));

    let events = run_text(backend.clone(), config(), &["A flaky unit."]).await;

    assert_eq!(describe(&events), vec!["audio:A flaky unit.", "end"]);
    assert_eq!(backend.calls_for("flaky"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_marks_unit_failed() {
    let down = BackendError::Transient("503".into());
    let backend = Arc::new(ScriptedBackend::new().script(
        "down",
        vec![
            Step::Fail(Duration::ZERO, down.clone()),
            Step::Fail(Duration::ZERO, down.clone()),
            Step::Fail(Duration::ZERO, down.clone()),
            Step::Fail(Duration::ZERO, down),
        ],
    ));

    let events = run_text(backend.clone(), config(), &["Service down. Fine after."]).await;

    assert_eq!(describe(&events), vec!["failed:0", "audio:Fine after.", "end"]);
    assert_eq!(backend.calls_for("down"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unit_timeout_counts_as_retryable() {
    let backend = Arc::new(
        ScriptedBackend::new().script("slow", vec![Step::Hang, Step::Succeed(Duration::ZERO)]),
    );
    let cfg = SynthesisConfig {
        unit_timeout: ms(250),
        ..config()
    };

    let events = run_text(backend.clone(), cfg, &["A slow unit."]).await;

    assert_eq!(describe(&events), vec!["audio:A slow unit.", "end"]);
    assert_eq!(backend.calls_for("slow"), 2);
    assert_eq!(backend.active(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_never_exceeds_limit() {
    let text: String = (0..12).map(|i| format!("Sentence number {i}. ")).collect();
    let backend = Arc::new(ScriptedBackend::new().script(
        "Sentence",
        (0..12).map(|i| Step::Succeed(ms(10 + (i * 7) % 30))).collect(),
    ));
    let cfg = SynthesisConfig {
        max_concurrency: 2,
        ..config()
    };

    let events = run_text(backend.clone(), cfg, &[&text]).await;

    assert_eq!(backend.peak(), 2);
    let indices: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            SynthesisEvent::Audio { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(indices, (0..12).collect::<Vec<u64>>());
}

#[tokio::test(start_paused = true)]
async fn test_units_dispatch_before_input_ends() {
    let backend = Arc::new(ScriptedBackend::new());
    let (frag_tx, frag_rx) = mpsc::unbounded_channel::<String>();
    let (mut tx, mut rx) = mpsc::unbounded_channel();

    let session = Session::new(voice(backend.clone()), config());
    let task = tokio::spawn(async move {
        session
            .run(UnboundedReceiverStream::new(frag_rx), &mut tx)
            .await
    });

    frag_tx.send("The first sentence is".into()).expect("send");
    frag_tx.send(" complete. The second".into()).expect("send");

    // Input is still open, yet the first unit is already synthesized
    let first = rx.recv().await.expect("first event");
    assert!(matches!(first, SynthesisEvent::Audio { index: 0, .. }));

    frag_tx.send(" is not, until now.".into()).expect("send");
    drop(frag_tx);

    let summary = task.await.expect("join");
    assert_eq!(summary.units, 2);
    assert_eq!(summary.succeeded, 2);

    let rest = collect(rx).await;
    assert_eq!(describe(&rest), vec!["audio:The second is not, until now.", "end"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_abandons_in_flight_calls() {
    let backend = Arc::new(ScriptedBackend::new().script("hang", vec![Step::Hang; 3]));
    let (mut tx, rx) = mpsc::unbounded_channel();
    let input = futures::stream::iter(vec!["Will hang. Also hang. Still hang.".to_string()]);

    let session = Session::new(voice(backend.clone()), config());
    let cancel = session.cancel_token();
    let task = tokio::spawn(async move { session.run(input, &mut tx).await });

    tokio::time::timeout(Duration::from_secs(1), async {
        while backend.active() < 3 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("three calls in flight");

    cancel.cancel();
    let summary = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("session stops promptly")
        .expect("join");
    assert_eq!(summary.outcome, Outcome::Aborted(RequestError::Cancelled));

    tokio::time::timeout(Duration::from_secs(1), async {
        while backend.active() > 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("in-flight calls dropped");

    let events = collect(rx).await;
    assert_eq!(describe(&events), vec!["end"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_drops_audio_held_behind_gap() {
    let backend = Arc::new(ScriptedBackend::new().script("Stalled", vec![Step::Hang]));
    let (mut tx, rx) = mpsc::unbounded_channel();
    let input =
        futures::stream::iter(vec!["Stalled first. Quick second. Quick third.".to_string()]);

    let session = Session::new(voice(backend.clone()), config());
    let cancel = session.cancel_token();
    let task = tokio::spawn(async move { session.run(input, &mut tx).await });

    // Units 1 and 2 finish while unit 0 still blocks their release
    tokio::time::timeout(Duration::from_secs(1), async {
        while backend.total_calls() < 3 || backend.active() > 1 {
            tokio::task::yield_now().await;
        }
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("later units completed");
    assert_eq!(backend.calls_for("Quick"), 2);

    cancel.cancel();
    let summary = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .expect("session stops promptly")
        .expect("join");
    assert_eq!(summary.outcome, Outcome::Aborted(RequestError::Cancelled));
    assert_eq!(summary.succeeded, 0);

    let events = collect(rx).await;
    assert_eq!(describe(&events), vec!["end"]);
}

#[tokio::test(start_paused = true)]
async fn test_too_many_failures_aborts_request() {
    let rejected = || Step::Fail(Duration::ZERO, BackendError::Permanent("rejected".into()));
    let backend = Arc::new(
        ScriptedBackend::new()
            .script("bad", vec![rejected(), rejected()])
            .script("later", vec![Step::Hang]),
    );
    let cfg = SynthesisConfig {
        max_failed_units: Some(1),
        ..config()
    };

    let events = run_text(backend, cfg, &["One bad. Two bad. Much later."]).await;

    assert!(!events.iter().any(|e| matches!(e, SynthesisEvent::Audio { .. })));
    let summary = summary_of(&events);
    assert_eq!(
        summary.outcome,
        Outcome::Aborted(RequestError::TooManyFailures { failed: 2, limit: 1 })
    );
    assert_eq!(summary.failed, 2);
}
