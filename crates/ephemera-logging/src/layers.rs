//! Custom tracing layers
//!
//! [`OwnerContextLayer`] pins the active owner context onto every new span so
//! that work which later hops to another runtime thread still knows which
//! account it belongs to. [`jsonl_layer`] builds the JSON lines formatter used
//! for both console and file output.

use tracing::{Subscriber, span};
use tracing_subscriber::{
    Layer,
    fmt::MakeWriter,
    layer::Context,
    registry::{LookupSpan, SpanRef},
};

use crate::config::JsonlConfig;
use crate::context::{OwnerContextData, OwnerContextGuard};

/// Layer that attaches owner context to spans
///
/// A span created while an [`OwnerContextGuard`] is active takes that context.
/// A span created without one inherits its parent's.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerContextLayer;

impl OwnerContextLayer {
    /// Create a new owner context layer
    pub fn new() -> Self {
        Self
    }

    /// Owner context recorded on a span, if any
    pub fn owner_of<'a, R>(span: &SpanRef<'a, R>) -> Option<OwnerContextData>
    where
        R: LookupSpan<'a>,
    {
        span.extensions()
            .get::<OwnerContextExtension>()
            .map(|ext| ext.data.clone())
    }
}

/// Extension data stored on spans
#[derive(Debug, Clone)]
pub struct OwnerContextExtension {
    pub data: OwnerContextData,
}

impl<S> Layer<S> for OwnerContextLayer
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
{
    fn on_new_span(&self, _attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let data = OwnerContextGuard::current()
            .or_else(|| span.parent().and_then(|parent| Self::owner_of(&parent)));
        if let Some(data) = data {
            span.extensions_mut().insert(OwnerContextExtension { data });
        }
    }
}

/// JSONL formatting layer writing to `writer`
pub fn jsonl_layer<S, W>(config: &JsonlConfig, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(config.include_current_span)
        .with_span_list(config.include_spans)
        .flatten_event(config.flatten_events)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_thread_ids(config.include_thread_info)
        .with_thread_names(config.include_thread_info)
        .with_writer(writer)
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ephemera_core::OwnerId;
    use tracing::Dispatch;
    use tracing_subscriber::{Registry, layer::Layered, layer::SubscriberExt};

    type TestSubscriber = Layered<OwnerContextLayer, Registry>;

    fn owner_on(dispatch: &Dispatch, span: &tracing::Span) -> Option<OwnerId> {
        let id = span.id()?;
        let subscriber = dispatch.downcast_ref::<TestSubscriber>()?;
        let span = subscriber.span(&id)?;
        OwnerContextLayer::owner_of(&span).map(|data| data.owner_id)
    }

    #[test]
    fn test_span_takes_active_context() {
        let dispatch = Dispatch::new(Registry::default().with(OwnerContextLayer::new()));
        let _default = tracing::dispatcher::set_default(&dispatch);

        let outside = tracing::info_span!("outside");
        let _guard = OwnerContextGuard::new(OwnerId(4));
        let inside = tracing::info_span!("inside");

        assert_eq!(owner_on(&dispatch, &outside), None);
        assert_eq!(owner_on(&dispatch, &inside), Some(OwnerId(4)));
    }

    #[test]
    fn test_child_span_inherits_from_parent() {
        let dispatch = Dispatch::new(Registry::default().with(OwnerContextLayer::new()));
        let _default = tracing::dispatcher::set_default(&dispatch);

        let parent = {
            let _guard = OwnerContextGuard::new(OwnerId(6));
            tracing::info_span!("parent")
        };
        assert!(OwnerContextGuard::current().is_none());
        let child = tracing::info_span!(parent: &parent, "child");

        assert_eq!(owner_on(&dispatch, &child), Some(OwnerId(6)));
    }
}
