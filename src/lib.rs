pub mod alert;
pub mod events;
pub mod init;
pub mod naming;
pub mod plan;
pub mod store;
pub mod thumbnail;
pub mod watchdog;

static INIT_CRYPTO: std::sync::Once = std::sync::Once::new();
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::aws_lc_rs::default_provider()
            .install_default()
            .expect("unable to initialize crypto provider")
    });
}
