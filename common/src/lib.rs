use std::sync::OnceLock;

pub mod eps;
pub mod types;

static RUSTLS_PROVIDER: OnceLock<()> = OnceLock::new();

/// Process-wide initialisation shared by every binary and test harness.
pub fn init() {
    install_rustls_provider();
}

pub fn install_rustls_provider() {
    RUSTLS_PROVIDER.get_or_init(|| {
        rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .expect("install aws-lc-rs provider");
    });
}
