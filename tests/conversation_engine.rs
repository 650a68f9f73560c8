//! Conversation engine tests
//!
//! Drives scripted conversations through the wait registry and checks
//! suspension, nesting, timeouts and background computations on tokio's
//! paused clock.

use huddle::runtime::script::{Slot, sequence};
use huddle::runtime::{
    Directive, Engine, EngineConfig, EngineError, Input, MemoryOutbox, Message, Reply, Scope,
    ScopeMatcher, Script,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

fn engine() -> (Engine, Arc<MemoryOutbox>) {
    let outbox = Arc::new(MemoryOutbox::new());
    let engine = Engine::new(EngineConfig::default(), outbox.clone()).unwrap();
    (engine, outbox)
}

/// Yields a fixed plan and records every reply it is resumed with.
struct Recorder {
    plan: VecDeque<Directive>,
    replies: Arc<Mutex<Vec<Reply>>>,
}

impl Recorder {
    fn new(plan: impl IntoIterator<Item = Directive>) -> (Self, Arc<Mutex<Vec<Reply>>>) {
        let replies = Arc::new(Mutex::new(Vec::new()));
        let recorder = Self {
            plan: plan.into_iter().collect(),
            replies: replies.clone(),
        };
        (recorder, replies)
    }
}

impl Script for Recorder {
    fn resume(&mut self, input: Input) -> anyhow::Result<Option<Directive>> {
        if let Input::Reply(reply) = input {
            self.replies.lock().push(reply);
        }
        Ok(self.plan.pop_front())
    }
}

#[tokio::test]
async fn two_step_script_suspends_between_messages() {
    let (engine, outbox) = engine();
    let scope = Scope::private(7);

    let handle = engine.start(
        &scope,
        sequence([
            Directive::Receive,
            Directive::emit("A"),
            Directive::Receive,
            Directive::emit("B"),
        ]),
    );
    let wait = handle.wait_id().unwrap();

    assert_eq!(engine.registry().dispatch(&scope, &Message::new("one")), Some(wait));
    assert_eq!(outbox.texts(), vec!["A"]);
    assert!(!handle.is_finished());
    assert!(engine.registry().contains(wait));

    assert_eq!(engine.registry().dispatch(&scope, &Message::new("two")), Some(wait));
    assert_eq!(outbox.texts(), vec!["A", "B"]);
    assert!(handle.is_finished());
    assert!(!engine.registry().contains(wait));
}

#[tokio::test]
async fn events_from_other_scopes_are_ignored() {
    let (engine, outbox) = engine();
    let scope = Scope::in_group(100, 7);
    engine.start(&scope, sequence([Directive::Receive, Directive::emit("mine")]));

    assert_eq!(engine.registry().dispatch(&Scope::private(7), &Message::new("x")), None);
    assert_eq!(engine.registry().dispatch(&Scope::in_group(100, 8), &Message::new("x")), None);
    assert!(outbox.texts().is_empty());

    assert!(engine.registry().dispatch(&scope, &Message::new("x")).is_some());
    assert_eq!(outbox.texts(), vec!["mine"]);
}

#[tokio::test]
async fn finished_sub_script_continues_parent_in_same_dispatch() {
    let (engine, outbox) = engine();
    let scope = Scope::private(1);

    let handle = engine.start(
        &scope,
        sequence([
            Directive::sub(sequence([Directive::Receive])),
            Directive::emit("done"),
        ]),
    );
    assert!(outbox.texts().is_empty());

    assert!(engine.registry().dispatch(&scope, &Message::new("go")).is_some());
    assert_eq!(outbox.texts(), vec!["done"]);
    assert!(handle.is_finished());
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn sub_script_retarget_ends_with_the_sub_script() {
    let (engine, _) = engine();
    let scope = Scope::private(1);
    let (parent, replies) = Recorder::new([
        Directive::sub(sequence([
            Directive::Retarget(ScopeMatcher::user(2)),
            Directive::Receive,
        ])),
        Directive::Receive,
    ]);
    let handle = engine.start(&scope, parent);

    // The child listens to user 2 only.
    assert_eq!(engine.registry().dispatch(&scope, &Message::new("a")), None);
    assert!(engine.registry().dispatch(&Scope::private(2), &Message::new("b")).is_some());

    // Back in the parent, which listens to user 1 again.
    assert_eq!(engine.registry().dispatch(&Scope::private(2), &Message::new("c")), None);
    assert!(engine.registry().dispatch(&scope, &Message::new("d")).is_some());
    assert!(handle.is_finished());
    assert_eq!(replies.lock().len(), 1, "parent only saw its own reply");
}

#[tokio::test]
async fn timeout_resumes_script_with_empty_reply() {
    tokio::time::pause();
    let (engine, outbox) = engine();
    let (script, replies) = Recorder::new([
        Directive::timeout(Duration::from_millis(50)),
        Directive::Receive,
        Directive::emit("after"),
    ]);
    let handle = engine.start(&Scope::private(1), script);

    tokio::time::sleep(Duration::from_millis(70)).await;

    assert_eq!(*replies.lock(), vec![Reply::timed_out()]);
    assert_eq!(outbox.texts(), vec!["after"]);
    assert!(handle.is_finished());
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn reply_just_before_deadline_voids_stale_timer() {
    tokio::time::pause();
    let (engine, outbox) = engine();
    let scope = Scope::private(1);
    let (script, replies) = Recorder::new([
        Directive::timeout(Duration::from_millis(100)),
        Directive::Receive,
        Directive::emit("A"),
        Directive::Receive,
        Directive::emit("B"),
    ]);
    let handle = engine.start(&scope, script);

    tokio::time::sleep(Duration::from_millis(90)).await;
    assert!(engine.registry().dispatch(&scope, &Message::new("hi")).is_some());
    assert_eq!(outbox.texts(), vec!["A"]);

    // The first timer would have fired at 110ms.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(replies.lock().len(), 1);
    assert!(!handle.is_finished());

    // The fresh deadline is 190ms plus grace.
    tokio::time::sleep(Duration::from_millis(55)).await;
    assert_eq!(
        *replies.lock(),
        vec![
            Reply::delivered(scope, Message::new("hi")),
            Reply::timed_out()
        ]
    );
    assert_eq!(outbox.texts(), vec!["A", "B"]);
    assert!(handle.is_finished());
}

#[tokio::test]
async fn script_without_timeout_never_times_out() {
    tokio::time::pause();
    let (engine, _) = engine();
    let (script, replies) = Recorder::new([Directive::Receive]);
    let handle = engine.start(&Scope::private(1), script);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(replies.lock().is_empty());
    assert!(!handle.is_finished());
}

#[tokio::test]
async fn sub_script_shares_parent_timeout() {
    tokio::time::pause();
    let (engine, outbox) = engine();
    let (child, replies) = Recorder::new([Directive::Receive]);
    let handle = engine.start(
        &Scope::private(1),
        sequence([
            Directive::timeout(Duration::from_millis(100)),
            Directive::sub(child),
            Directive::emit("parent resumed"),
        ]),
    );

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(*replies.lock(), vec![Reply::timed_out()]);
    assert_eq!(outbox.texts(), vec!["parent resumed"]);
    assert!(handle.is_finished());
}

/// Computes a value in the background, reports it, then waits for an ack.
struct Calculator {
    slot: Slot<u32>,
    stage: u8,
}

impl Script for Calculator {
    fn resume(&mut self, input: Input) -> anyhow::Result<Option<Directive>> {
        self.stage += 1;
        Ok(match (self.stage, input) {
            (1, Input::Start) => Some(Directive::compute_into(&self.slot, async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                7
            })),
            (2, Input::Resumed) => Some(Directive::emit(format!(
                "value {}",
                self.slot.get().unwrap_or_default()
            ))),
            (3, Input::Continue) => Some(Directive::Receive),
            _ => None,
        })
    }
}

#[tokio::test]
async fn background_computation_suspends_event_delivery() {
    tokio::time::pause();
    let (engine, outbox) = engine();
    let scope = Scope::private(1);
    let handle = engine.start(
        &scope,
        Calculator {
            slot: Slot::new(),
            stage: 0,
        },
    );

    // Still computing: the event is not for this conversation.
    assert_eq!(engine.registry().dispatch(&scope, &Message::new("early")), None);
    assert!(outbox.texts().is_empty());

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(outbox.texts(), vec!["value 7"]);

    assert!(engine.registry().dispatch(&scope, &Message::new("ok")).is_some());
    assert!(handle.is_finished());
}

#[tokio::test]
async fn sleep_directive_resumes_after_delay() {
    tokio::time::pause();
    let (engine, outbox) = engine();
    let handle = engine.start(
        &Scope::private(1),
        sequence([
            Directive::emit("wait for it"),
            Directive::sleep(Duration::from_secs(5)),
            Directive::emit("now"),
        ]),
    );

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(outbox.texts(), vec!["wait for it"]);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(outbox.texts(), vec!["wait for it", "now"]);
    assert!(handle.is_finished());
    assert!(engine.registry().is_empty());
}

#[tokio::test]
async fn start_with_matcher_replies_to_event_scope() {
    let (engine, outbox) = engine();
    engine.start_with(
        ScopeMatcher::group(5),
        sequence([Directive::emit("nobody"), Directive::Receive, Directive::emit("hello")]),
    );

    engine
        .registry()
        .dispatch(&Scope::in_group(5, 3), &Message::new("hey"));

    let sent = outbox.sent();
    assert_eq!(sent.len(), 1, "text before the first event has no peer");
    assert_eq!(sent[0].scope, Scope::in_group(5, 3));
    assert_eq!(sent[0].text, "hello");
}

#[tokio::test]
#[tracing_test::traced_test]
async fn panicking_script_is_contained() {
    let (engine, _) = engine();
    let mut faults = engine.subscribe_faults();
    let scope = Scope::private(1);

    let script = |input: Input| -> anyhow::Result<Option<Directive>> {
        match input {
            Input::Start => Ok(Some(Directive::Receive)),
            _ => panic!("script exploded"),
        }
    };
    let handle = engine.start(&scope, script);
    let wait = handle.wait_id().unwrap();

    assert_eq!(engine.registry().dispatch(&scope, &Message::new("x")), Some(wait));
    assert!(handle.is_finished());
    assert!(engine.registry().is_empty());

    let fault = faults.try_recv().unwrap();
    assert_eq!(fault.conversation, handle.id());
    assert_eq!(fault.wait, Some(wait));
    assert!(matches!(
        &*fault.error,
        EngineError::ScriptPanicked { message, .. } if message == "script exploded"
    ));
    assert!(logs_contain("conversation failed"));
}

#[tokio::test]
async fn script_error_during_timeout_turn_unregisters_wait() {
    tokio::time::pause();
    let (engine, _) = engine();
    let mut faults = engine.subscribe_faults();

    let script = |input: Input| -> anyhow::Result<Option<Directive>> {
        match input {
            Input::Start => Ok(Some(Directive::timeout(Duration::from_millis(10)))),
            Input::Continue => Ok(Some(Directive::Receive)),
            _ => anyhow::bail!("cannot handle {input:?}"),
        }
    };
    let handle = engine.start(&Scope::private(1), script);
    assert_eq!(engine.registry().len(), 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(handle.is_finished());
    assert!(engine.registry().is_empty());
    assert!(matches!(
        &*faults.try_recv().unwrap().error,
        EngineError::Script { .. }
    ));
}

#[tokio::test]
async fn cancelled_conversation_ignores_events() {
    let (engine, outbox) = engine();
    let scope = Scope::private(1);
    let handle = engine.start(&scope, sequence([Directive::Receive, Directive::emit("late")]));

    assert!(handle.cancel());
    assert_eq!(engine.registry().dispatch(&scope, &Message::new("x")), None);
    assert!(outbox.texts().is_empty());
}
