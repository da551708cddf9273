use super::error::{Error, ResultExt, Severity};
use super::logging;
use crate::broker::transport::TransportError;

#[test]
fn logging_init_accepts_levels() {
    // Should not panic
    logging::init("info");
    logging::init("debug");
    logging::init("warn");
}

#[test]
fn unknown_level_falls_back_to_info() {
    assert_eq!(logging::parse_level("chatty"), tracing::Level::INFO);
    assert_eq!(logging::parse_level(" WARNING "), tracing::Level::WARN);
}

#[test]
fn critical_wraps_with_context() {
    let err = Error::critical(
        "Queue binding error",
        TransportError::ChannelClosed("consume".into()),
    );
    assert!(err.is_critical());
    assert_eq!(err.context(), Some("Queue binding error"));
    assert!(err.to_string().starts_with("Queue binding error:"));
}

#[test]
fn critical_is_not_wrapped_twice() {
    let inner = Error::critical("Channel creation error", TransportError::Unreachable("x".into()));
    let outer = Error::critical("Queue binding error", inner);
    assert_eq!(outer.context(), Some("Channel creation error"));
}

#[test]
fn result_ext_maps_errors() {
    let res: Result<(), TransportError> = Err(TransportError::Unreachable("broker".into()));
    let err = res.critical("Connection creation error").unwrap_err();
    assert_eq!(err.context(), Some("Connection creation error"));
}

#[test]
fn severities() {
    assert_eq!(Error::InvalidArgument("x".into()).severity(), Severity::Minor);
    assert_eq!(
        Error::Configuration("Cannot resolve dependency".into()).severity(),
        Severity::Critical
    );
}
