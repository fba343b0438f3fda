//! Bounded process queue and scoped completion, driven with real `sh`
//! subprocesses.

use sigline::proc::limits;
use sigline::proc::{
    AllDoneCallback, BoundedProcessQueue, CommandSink, EachDoneCallback, ProcessCommand,
    ScopedCompletionTracker, Submitted,
};
use std::cell::RefCell;
use std::rc::Rc;

fn tracker(max: usize) -> ScopedCompletionTracker {
    ScopedCompletionTracker::new(BoundedProcessQueue::with_max_concurrent(max))
}

fn recorder() -> (Rc<RefCell<Vec<String>>>, EachDoneCallback) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let inner = seen.clone();
    (
        seen,
        Box::new(move |out| inner.borrow_mut().push(out.stdout.trim().to_string())),
    )
}

fn flag() -> (Rc<RefCell<u32>>, AllDoneCallback) {
    let fired = Rc::new(RefCell::new(0));
    let inner = fired.clone();
    (fired, Box::new(move || *inner.borrow_mut() += 1))
}

#[tokio::test]
async fn overflow_beyond_cap_is_queued() {
    let cap = 3;
    let extra = 4;
    let mut t = tracker(cap);
    let (fired, on_all_done) = flag();
    let (seen, on_each) = recorder();

    let queued = t.with_scope(on_all_done, Some(on_each), |t| {
        (0..cap + extra)
            .map(|n| t.submit_tracked(ProcessCommand::shell(format!("echo {n}")), None))
            .filter(|s| matches!(s, Submitted::Queued(_)))
            .count()
    });
    assert_eq!(queued, extra);
    assert_eq!(t.queue().running(), cap);
    assert_eq!(t.queue().queued(), extra);

    while !t.is_idle() {
        let out = t.next_exit().await.unwrap();
        t.complete(&out);
        assert!(t.queue().running() <= cap);
        let expected = u32::from(t.is_idle());
        assert_eq!(*fired.borrow(), expected);
    }
    assert_eq!(seen.borrow().len(), cap + extra);
    assert_eq!(t.pending_scopes(), 0);
}

#[tokio::test]
async fn each_done_follows_completion_order() {
    let mut t = tracker(2);
    let (fired, on_all_done) = flag();
    let (seen, on_each) = recorder();
    t.with_scope(on_all_done, Some(on_each), |t| {
        t.submit(ProcessCommand::shell("sleep 0.5; echo slow"), None);
        t.submit(ProcessCommand::shell("echo fast"), None);
    });
    t.run_until_idle().await;
    assert_eq!(*seen.borrow(), ["fast", "slow"]);
    assert_eq!(*fired.borrow(), 1);
}

#[tokio::test]
async fn command_callback_runs_before_scope_callbacks() {
    let mut t = tracker(1);
    let log = Rc::new(RefCell::new(Vec::new()));

    let (all_log, each_log, cmd_log) = (log.clone(), log.clone(), log.clone());
    let scope = t.open_scope(
        Box::new(move || all_log.borrow_mut().push("all")),
        Some(Box::new(move |_| each_log.borrow_mut().push("each"))),
    );
    t.submit(
        ProcessCommand::new("true"),
        Some(Box::new(move |_| cmd_log.borrow_mut().push("command"))),
    );
    t.close_scope(scope);
    t.run_until_idle().await;

    assert_eq!(*log.borrow(), ["command", "each", "all"]);
}

#[tokio::test]
async fn scope_opened_from_a_callback_is_tracked() {
    // Mirrors a contacts reload: a command's result decides what to run next
    // in a fresh scope.
    let mut t = tracker(2);
    let (inner_fired, inner_done) = flag();
    let next: Rc<RefCell<Option<String>>> = Rc::default();
    let next_cb = next.clone();
    t.submit(
        ProcessCommand::shell("echo 'a b c'"),
        Some(Box::new(move |out| {
            *next_cb.borrow_mut() = Some(out.stdout.trim().to_string());
        })),
    );
    t.run_until_idle().await;

    let words = next.borrow_mut().take().unwrap();
    let (seen, on_each) = recorder();
    t.with_scope(inner_done, Some(on_each), |t| {
        for word in words.split_whitespace() {
            t.submit(ProcessCommand::new("echo").arg(word), None);
        }
    });
    t.run_until_idle().await;

    let mut seen = seen.borrow().clone();
    seen.sort();
    assert_eq!(seen, ["a", "b", "c"]);
    assert_eq!(*inner_fired.borrow(), 1);
}

#[tokio::test]
async fn missing_program_completes_with_failure() {
    let mut t = tracker(1);
    let result = Rc::new(RefCell::new(None));
    let result_cb = result.clone();
    let (fired, on_all_done) = flag();
    t.with_scope(on_all_done, None, |t| {
        t.submit(
            ProcessCommand::new("/nonexistent/sigline-test-binary"),
            Some(Box::new(move |out| *result_cb.borrow_mut() = Some(out.success()))),
        );
    });
    t.run_until_idle().await;
    assert_eq!(*result.borrow(), Some(false));
    assert_eq!(*fired.borrow(), 1);
}

#[test]
fn computed_cap_is_positive() {
    assert!(limits::max_concurrent_processes() >= 1);
    assert!(BoundedProcessQueue::new().max_concurrent() >= 1);
}
