//! Test harness for `quic-reactor`: a virtual-time reactor, a scripted socket,
//! a recording dispatcher and a tokio-backed host loop.

pub mod harness;
pub mod manual_reactor;
pub mod recording_dispatcher;
pub mod scripted_socket;
pub mod tokio_reactor;

pub mod util {
    use tracing_subscriber::EnvFilter;

    /// Install a test-friendly subscriber honouring `RUST_LOG`. Safe to call
    /// from every test.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}
