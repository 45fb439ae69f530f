//! Assertions over run contexts and collected events.

use crate::context::RunContext;
use crate::core::StageName;
use crate::events::CollectingEventSink;

/// Asserts that the recorded stages form a prefix of [`StageName::ORDER`].
pub fn assert_prefix_order(ctx: &RunContext) {
    let completed = ctx.completed_stages();
    assert_eq!(
        completed.as_slice(),
        &StageName::ORDER[..completed.len()],
        "recorded stages are not a prefix of the stage order"
    );
}

/// Asserts that exactly `expected` stages were recorded, in order.
pub fn assert_recorded(ctx: &RunContext, expected: &[StageName]) {
    assert_eq!(ctx.completed_stages(), expected, "unexpected recorded stages");
}

/// Asserts that the events of `event_type` name the stages in `expected` order.
pub fn assert_stage_events(sink: &CollectingEventSink, event_type: &str, expected: &[StageName]) {
    let stages: Vec<String> = sink
        .events()
        .into_iter()
        .filter(|(t, _)| t == event_type)
        .filter_map(|(_, data)| {
            data.and_then(|d| d.get("stage").and_then(|s| s.as_str()).map(str::to_string))
        })
        .collect();
    let expected: Vec<&str> = expected.iter().map(|s| s.as_str()).collect();
    assert_eq!(stages, expected, "unexpected {event_type} stages");
}

/// Asserts that `first` was emitted before `second`.
pub fn assert_emitted_before(sink: &CollectingEventSink, first: &str, second: &str) {
    let types = sink.event_types();
    let a = types.iter().position(|t| t == first);
    let b = types.iter().position(|t| t == second);
    match (a, b) {
        (Some(a), Some(b)) => assert!(a < b, "{first} was emitted after {second}: {types:?}"),
        _ => panic!("expected both {first} and {second} in {types:?}"),
    }
}
