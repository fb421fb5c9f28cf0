pub mod bus;
pub mod can;
pub mod dispatch;
pub mod timing;
pub mod transport;
pub mod vt;

#[cfg(test)]
#[ctor::ctor]
fn setup_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .with_ansi(true)
        .init();
}
