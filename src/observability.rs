use biometrics::{Collector, Counter, Moments};

pub(crate) static CLIENT_REQUESTS: Counter = Counter::new("streamchat.client.requests");
pub(crate) static CLIENT_REQUEST_ERRORS: Counter =
    Counter::new("streamchat.client.request_errors");
pub(crate) static CLIENT_HEALTH_CHECKS: Counter = Counter::new("streamchat.client.health_checks");
pub(crate) static CLIENT_HEALTH_FAILURES: Counter =
    Counter::new("streamchat.client.health_failures");

pub(crate) static STREAM_EVENTS: Counter = Counter::new("streamchat.stream.events");
pub(crate) static STREAM_ERRORS: Counter = Counter::new("streamchat.stream.errors");
pub(crate) static STREAM_MALFORMED_FRAMES: Counter =
    Counter::new("streamchat.stream.malformed_frames");
pub(crate) static STREAM_BYTES: Counter = Counter::new("streamchat.stream.bytes");
pub(crate) static STREAM_CANCELLATIONS: Counter = Counter::new("streamchat.stream.cancellations");
pub(crate) static STREAM_TTFB: Moments = Moments::new("streamchat.stream.ttfb_seconds");
pub(crate) static STREAM_DURATION: Moments = Moments::new("streamchat.stream.duration_seconds");

pub(crate) static SESSION_SENDS: Counter = Counter::new("streamchat.session.sends");
pub(crate) static SESSION_SENDS_REJECTED: Counter =
    Counter::new("streamchat.session.sends_rejected");

/// Register this crate's biometrics with the provided collector.
pub fn register_biometrics(collector: Collector) {
    collector.register_counter(&CLIENT_REQUESTS);
    collector.register_counter(&CLIENT_REQUEST_ERRORS);
    collector.register_counter(&CLIENT_HEALTH_CHECKS);
    collector.register_counter(&CLIENT_HEALTH_FAILURES);

    collector.register_counter(&STREAM_EVENTS);
    collector.register_counter(&STREAM_ERRORS);
    collector.register_counter(&STREAM_MALFORMED_FRAMES);
    collector.register_counter(&STREAM_BYTES);
    collector.register_counter(&STREAM_CANCELLATIONS);
    collector.register_moments(&STREAM_TTFB);
    collector.register_moments(&STREAM_DURATION);

    collector.register_counter(&SESSION_SENDS);
    collector.register_counter(&SESSION_SENDS_REJECTED);
}
