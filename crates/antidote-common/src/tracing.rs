//! Trace context propagation over transport envelopes
//!
//! Injects and extracts W3C Trace Context headers so a lifecycle request
//! keeps its trace across the transport, and the completion message carries
//! it onward.
//!
//! Format: `traceparent: 00-{trace_id}-{span_id}-{trace_flags}`
//!
//! # Example
//!
//! ```ignore
//! use antidote_common::tracing::{extract_context, inject_context};
//!
//! // Publisher: stamp the current span onto the envelope
//! inject_context(&mut envelope);
//!
//! // Subscriber: continue the trace
//! let cx = extract_context(&envelope);
//! span.set_parent(cx);
//! ```

use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::{global, Context};

use crate::transport::Envelope;

/// Header carrying trace ID, span ID and flags
pub const TRACEPARENT: &str = "traceparent";

/// Header carrying vendor-specific trace state
pub const TRACESTATE: &str = "tracestate";

/// Carrier for injecting trace context into an envelope
struct EnvelopeInjector<'a> {
    envelope: &'a mut Envelope,
}

impl Injector for EnvelopeInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let key = key.to_lowercase();
        if key == TRACEPARENT || key == TRACESTATE {
            self.envelope.headers.insert(key, value);
        }
    }
}

/// Carrier for extracting trace context from an envelope
struct EnvelopeExtractor<'a> {
    envelope: &'a Envelope,
}

impl Extractor for EnvelopeExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.envelope
            .headers
            .get(&key.to_lowercase())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn keys(&self) -> Vec<&str> {
        [TRACEPARENT, TRACESTATE]
            .into_iter()
            .filter(|k| self.get(k).is_some())
            .collect()
    }
}

/// Inject the current trace context into an envelope's headers
pub fn inject_context(envelope: &mut Envelope) {
    inject_context_from(&Context::current(), envelope);
}

/// Inject a specific trace context into an envelope's headers
pub fn inject_context_from(cx: &Context, envelope: &mut Envelope) {
    global::get_text_map_propagator(|propagator| {
        let mut injector = EnvelopeInjector { envelope };
        propagator.inject_context(cx, &mut injector);
    });
}

/// Extract the trace context carried by an envelope
///
/// Returns an empty context when the envelope carries none.
pub fn extract_context(envelope: &Envelope) -> Context {
    global::get_text_map_propagator(|propagator| {
        let extractor = EnvelopeExtractor { envelope };
        propagator.extract(&extractor)
    })
}

/// Trace ID carried by an envelope, if any
///
/// traceparent format: `version-traceid-spanid-flags`
pub fn trace_id(envelope: &Envelope) -> Option<String> {
    envelope
        .headers
        .get(TRACEPARENT)
        .and_then(|tp| tp.split('-').nth(1))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    #[test]
    fn extractor_reports_only_present_keys() {
        let mut env = Envelope::default();
        assert!(EnvelopeExtractor { envelope: &env }.keys().is_empty());

        env.headers.insert(TRACEPARENT.to_string(), SAMPLE.to_string());
        assert_eq!(
            EnvelopeExtractor { envelope: &env }.keys(),
            vec![TRACEPARENT]
        );

        env.headers.insert(TRACESTATE.to_string(), String::new());
        assert_eq!(
            EnvelopeExtractor { envelope: &env }.keys(),
            vec![TRACEPARENT]
        );
    }

    #[test]
    fn injector_ignores_unrelated_headers() {
        let mut env = Envelope::default();
        let mut injector = EnvelopeInjector {
            envelope: &mut env,
        };
        injector.set("TraceParent", SAMPLE.to_string());
        injector.set("x-other", "nope".to_string());
        assert_eq!(env.headers.len(), 1);
        assert_eq!(env.headers[TRACEPARENT], SAMPLE);
    }

    #[test]
    fn trace_id_is_second_component() {
        let mut env = Envelope::default();
        assert!(trace_id(&env).is_none());
        env.headers.insert(TRACEPARENT.to_string(), SAMPLE.to_string());
        assert_eq!(
            trace_id(&env).as_deref(),
            Some("0af7651916cd43dd8448eb211c80319c")
        );
    }

    #[test]
    fn inject_then_extract_without_a_propagator_is_harmless() {
        let mut env = Envelope::default();
        inject_context(&mut env);
        let _cx = extract_context(&env);
    }
}
