//! Helper macros enforcing consistent VTN log fields.
//!
//! These macros keep the `ven` field (and optionally `resource`) present on every log
//! emitted from the report pipeline, poll multiplexer and scheduler so downstream parsing
//! can rely on them.

/// Log an event for a VEN (optionally scoped to one of its resources) plus any extra fields.
#[macro_export]
macro_rules! ven_event {
    ($level:ident, $target:expr, $event:expr, ven = $ven:expr, resource = $resource:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: $target,
            event = $event,
            ven = %$ven,
            resource = %$resource,
            $($field = %$value,)*
        )
    };
    ($level:ident, $target:expr, $event:expr, ven = $ven:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: $target,
            event = $event,
            ven = %$ven,
            $($field = %$value,)*
        )
    };
}
